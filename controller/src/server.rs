//! HTTPS webhook endpoint.
//!
//! The API server POSTs AdmissionReview envelopes to `/port-allocator`; the
//! decision itself lives in [`crate::mutate`]. A body that does not decode
//! as a review is answered in-band with an internal-error denial rather
//! than a transport failure, so one bad request never takes the server out.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use allocator::Store;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_server::Handle;
use axum_server::tls_rustls::RustlsConfig;
use k8s_openapi::api::core::v1::Service;
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{ControllerError, ControllerResult};
use crate::mutate::mutate;

/// In-flight requests get this long to drain after a termination signal;
/// it matches the API server's default admission timeout.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct ServerConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub port: u16,
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub leader: watch::Receiver<bool>,
}

/// Serve the webhook until shutdown, then drain gracefully.
pub async fn serve(
    config: ServerConfig,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> ControllerResult<()> {
    let tls = RustlsConfig::from_pem_file(&config.cert, &config.key)
        .await
        .map_err(ControllerError::Tls)?;

    let app = Router::new()
        .route("/port-allocator", post(admit))
        .route("/readyz", get(readyz))
        .with_state(state);

    let handle = Handle::new();
    {
        let handle = handle.clone();
        tokio::spawn(async move {
            let _ = shutdown.changed().await;
            info!("shutting down webhook server");
            handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
        });
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(%addr, "webhook server listening");
    axum_server::bind_rustls(addr, tls)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .map_err(ControllerError::Server)?;

    info!("webhook server stopped");
    Ok(())
}

async fn readyz() -> &'static str {
    "ok"
}

async fn admit(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Json<AdmissionReview<DynamicObject>> {
    let review: AdmissionReview<Service> = match serde_json::from_value(body.clone()) {
        Ok(review) => review,
        Err(e) => {
            warn!(error = %e, "rejecting undecodable admission review");
            return Json(invalid_review(&body, &e.to_string()));
        }
    };
    let request: AdmissionRequest<Service> = match review.try_into() {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "admission review carries no request");
            return Json(invalid_review(&body, &e.to_string()));
        }
    };

    let is_leader = *state.leader.borrow();
    Json(mutate(&state.store, is_leader, &request).into_review())
}

/// Deny with an internal-error status, echoing the request UID when the raw
/// body still lets us recover it.
fn invalid_review(body: &Value, message: &str) -> AdmissionReview<DynamicObject> {
    let mut response = AdmissionResponse::invalid(message);
    if let Some(uid) = body.pointer("/request/uid").and_then(Value::as_str) {
        response.uid = uid.to_string();
    }
    response.into_review()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn invalid_review_echoes_recoverable_uid() {
        let body = json!({"request": {"uid": "abc-123", "object": "not a service"}});
        let review = invalid_review(&body, "decode error");
        let response = review.response.unwrap();
        assert_eq!(response.uid, "abc-123");
        assert!(!response.allowed);
    }

    #[test]
    fn invalid_review_without_uid_still_denies() {
        let review = invalid_review(&json!({}), "decode error");
        let response = review.response.unwrap();
        assert!(response.uid.is_empty());
        assert!(!response.allowed);
    }
}
