//! Own-pod identity, used as the leader-election identity.

use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};

use crate::error::{ControllerError, ControllerResult};

/// The pod this replica runs as, from the downward-API environment.
#[derive(Debug, Clone)]
pub struct PodIdentity {
    pub name: String,
    pub namespace: String,
}

impl PodIdentity {
    /// Read `POD_NAME` / `POD_NAMESPACE`. Both must be present and non-empty.
    pub fn from_env() -> ControllerResult<Self> {
        let name = std::env::var("POD_NAME").unwrap_or_default();
        let namespace = std::env::var("POD_NAMESPACE").unwrap_or_default();
        if name.is_empty() || namespace.is_empty() {
            return Err(ControllerError::Identity(
                "missing POD_NAME or POD_NAMESPACE environment variable".to_string(),
            ));
        }
        Ok(Self { name, namespace })
    }

    /// Confirm the pod named by the environment is readable through the API,
    /// catching RBAC gaps before any traffic is accepted.
    pub async fn confirm(&self, client: Client) -> ControllerResult<()> {
        let pods: Api<Pod> = Api::namespaced(client, &self.namespace);
        pods.get(&self.name).await.map_err(|e| {
            ControllerError::Identity(format!(
                "unable to read own pod {}/{}: {e}",
                self.namespace, self.name
            ))
        })?;
        Ok(())
    }
}
