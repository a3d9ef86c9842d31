//! Delete-event pipeline: watch Services, reclaim freed NodePorts.
//!
//! A watcher over the cluster's Services feeds delete events for NodePort
//! Services into a bounded queue; a small worker pool releases the freed
//! ports back into the store. Releases happen only while this replica holds
//! the leader lease; otherwise the item is requeued with exponential
//! per-item backoff. Release is idempotent and commutative, so no ordering
//! is needed between independent events.

use std::sync::Arc;
use std::time::Duration;

use allocator::{Port, Store};
use futures_util::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Service;
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client, ResourceExt};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::inventory::node_ports;

/// Sustained delete storms queue up behind this bound; items are delayed,
/// never dropped.
const QUEUE_CAPACITY: usize = 256;
const WORKERS: usize = 2;

const BACKOFF_BASE: Duration = Duration::from_millis(5);
const BACKOFF_MAX: Duration = Duration::from_secs(1000);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseEvent {
    pub namespace: String,
    pub ports: Vec<Port>,
    pub attempt: u32,
}

/// Per-item retry delay: 5ms, 10ms, 20ms, ... capped at 1000s.
fn backoff_delay(attempt: u32) -> Duration {
    BACKOFF_BASE
        .checked_mul(2u32.saturating_pow(attempt))
        .unwrap_or(BACKOFF_MAX)
        .min(BACKOFF_MAX)
}

/// Start the watcher and the worker pool; the returned set owns both.
pub fn spawn(
    client: Client,
    store: Arc<Store>,
    leader: watch::Receiver<bool>,
    shutdown: watch::Receiver<bool>,
) -> JoinSet<()> {
    let (tx, rx) = mpsc::channel::<ReleaseEvent>(QUEUE_CAPACITY);
    let rx = Arc::new(Mutex::new(rx));

    let mut tasks = JoinSet::new();
    tasks.spawn(watch_deletes(client, tx.clone(), shutdown.clone()));
    for worker in 0..WORKERS {
        tasks.spawn(run_worker(
            worker,
            Arc::clone(&rx),
            tx.clone(),
            Arc::clone(&store),
            leader.clone(),
            shutdown.clone(),
        ));
    }
    tasks
}

async fn watch_deletes(
    client: Client,
    tx: mpsc::Sender<ReleaseEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let services: Api<Service> = Api::all(client);
    let mut stream = watcher(services, watcher::Config::default())
        .default_backoff()
        .boxed();

    info!("watching services for delete events");
    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => break,
            event = stream.try_next() => event,
        };
        match event {
            Ok(Some(watcher::Event::Delete(service))) => {
                let Some(ports) = node_ports(&service) else {
                    continue;
                };
                if ports.is_empty() {
                    continue;
                }
                let event = ReleaseEvent {
                    namespace: service.namespace().unwrap_or_default(),
                    ports,
                    attempt: 0,
                };
                debug!(
                    namespace = %event.namespace,
                    service = %service.name_any(),
                    ports = ?event.ports,
                    "nodeport service deleted, queueing release"
                );
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            // creates and updates flow through the admission path instead
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!("service watch stream ended");
                break;
            }
            Err(e) => warn!(error = %e, "service watch error"),
        }
    }
    info!("service watcher stopped");
}

async fn run_worker(
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<ReleaseEvent>>>,
    tx: mpsc::Sender<ReleaseEvent>,
    store: Arc<Store>,
    leader: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = shutdown.changed() => break,
                event = rx.recv() => event,
            }
        };
        let Some(event) = event else { break };

        if !*leader.borrow() {
            requeue(event, &tx);
            continue;
        }
        match store.release(&event.namespace, &event.ports) {
            Ok(()) => info!(
                worker = id,
                namespace = %event.namespace,
                ports = ?event.ports,
                "released nodeports"
            ),
            Err(e) => warn!(
                worker = id,
                namespace = %event.namespace,
                error = %e,
                "dropping release for unmanaged namespace"
            ),
        }
    }
    debug!(worker = id, "release worker stopped");
}

/// Put an event back on the queue after its backoff delay, off-worker so the
/// pool keeps draining meanwhile.
fn requeue(mut event: ReleaseEvent, tx: &mpsc::Sender<ReleaseEvent>) {
    let delay = backoff_delay(event.attempt);
    event.attempt = event.attempt.saturating_add(1);
    debug!(
        namespace = %event.namespace,
        attempt = event.attempt,
        delay_ms = delay.as_millis() as u64,
        "not leading, requeueing release"
    );
    let tx = tx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = tx.send(event).await;
    });
}
