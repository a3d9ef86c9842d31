//! Startup reconciliation: rebuild the allocated sets from the Services
//! that already exist in the cluster.

use allocator::{Port, Store};
use k8s_openapi::api::core::v1::{Namespace, Service};
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};
use tracing::{info, warn};

use crate::error::ControllerResult;

/// The assigned NodePorts of a Service, or `None` when it is not a NodePort
/// Service. Ports the API server has not assigned yet (unset or zero) are
/// omitted.
pub fn node_ports(service: &Service) -> Option<Vec<Port>> {
    let spec = service.spec.as_ref()?;
    if spec.type_.as_deref() != Some("NodePort") {
        return None;
    }
    let ports = spec.ports.as_ref()?;
    Some(
        ports
            .iter()
            .filter_map(|p| p.node_port)
            .filter(|&p| p > 0)
            .filter_map(|p| Port::try_from(p).ok())
            .collect(),
    )
}

/// Seed the store from every NodePort Service in the cluster.
///
/// Out-of-policy state (a port outside the configured sub-range, a service
/// in an unconfigured namespace, a port assigned twice) is logged and
/// skipped rather than rejected: for pre-existing Services the API server
/// is the source of truth, and the anomaly is surfaced for the operator.
pub async fn reconcile(client: Client, store: &Store) -> ControllerResult<()> {
    let namespaces: Api<Namespace> = Api::all(client.clone());
    let mut seeded = 0usize;
    let mut skipped = 0usize;

    for namespace in namespaces.list(&ListParams::default()).await?.items {
        let name = namespace.name_any();
        let services: Api<Service> = Api::namespaced(client.clone(), &name);
        for service in services.list(&ListParams::default()).await?.items {
            let Some(ports) = node_ports(&service) else {
                continue;
            };
            if store.lookup(&name).is_none() {
                warn!(
                    namespace = %name,
                    service = %service.name_any(),
                    ports = ?ports,
                    "namespace has no configured sub-range, leaving its ports unmanaged"
                );
                skipped += ports.len();
                continue;
            }
            for port in ports {
                match store.seed_ports(&name, &[port]) {
                    Ok(()) => seeded += 1,
                    Err(e) => {
                        warn!(
                            namespace = %name,
                            service = %service.name_any(),
                            port,
                            error = %e,
                            "skipping out-of-policy port"
                        );
                        skipped += 1;
                    }
                }
            }
        }
    }

    info!(seeded, skipped, "rebuilt nodeport inventory from the api server");
    Ok(())
}
