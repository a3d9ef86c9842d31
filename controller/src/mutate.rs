//! Admission decisions for Service create and update.
//!
//! The decision is a function of the request and the current store state:
//! every port of a NodePort Service is kept when it lies inside the
//! namespace sub-range and is free (or already belongs to this Service),
//! and is otherwise replaced with the lowest free port of the sub-range.
//! All reservations for one request happen inside a single store critical
//! section, so concurrent admissions never observe the same free port.

use allocator::{Port, Store, StoreError};
use k8s_openapi::api::core::v1::Service;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, Operation};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

/// Decide one admission request against the store.
pub fn mutate(store: &Store, is_leader: bool, req: &AdmissionRequest<Service>) -> AdmissionResponse {
    let response = AdmissionResponse::from(req);

    if !matches!(req.operation, Operation::Create | Operation::Update) {
        return response;
    }
    let Some(service) = req.object.as_ref() else {
        return response.deny("admission request carries no object");
    };
    if service.spec.as_ref().and_then(|s| s.type_.as_deref()) != Some("NodePort") {
        debug!(uid = %req.uid, "not a nodeport service, allowing unchanged");
        return response;
    }
    // a dry run must not leave reservations behind
    if req.dry_run {
        debug!(uid = %req.uid, "dry run, allowing unchanged");
        return response;
    }
    if !is_leader {
        debug!(uid = %req.uid, "not leading, deferring to the leader replica");
        return response.deny("this replica is not the current leader; retry to reach the active one");
    }

    let Some(namespace) = req.namespace.as_deref() else {
        return response.deny("admission request carries no namespace");
    };
    if store.lookup(namespace).is_none() {
        info!(namespace, name = %req.name, "denying nodeport service in unconfigured namespace");
        return response.deny(format!(
            "namespace {namespace} has no nodePort range configured; ask the cluster operator to assign one"
        ));
    }

    let ports = service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .cloned()
        .unwrap_or_default();
    if ports.is_empty() {
        return response;
    }

    let requested: Vec<Option<Port>> = ports
        .iter()
        .map(|p| {
            p.node_port
                .and_then(|n| Port::try_from(n).ok())
                .filter(|&n| n != 0)
        })
        .collect();

    let assigned = match store.assign(namespace, &req.uid, &requested) {
        Ok(assigned) => assigned,
        Err(e @ StoreError::Exhausted { .. }) => {
            warn!(namespace, name = %req.name, error = %e, "denying request, sub-range exhausted");
            return response.deny(e.to_string());
        }
        Err(e) => {
            warn!(namespace, name = %req.name, error = %e, "denying request, store rejected the assignment");
            return response.deny(e.to_string());
        }
    };

    let mut ops = Vec::new();
    for (index, (want, got)) in requested.iter().zip(&assigned).enumerate() {
        match want {
            Some(port) if port == got => {}
            // "add" both sets an unset member and overwrites a zero one
            None => ops.push(json!({
                "op": "add",
                "path": format!("/spec/ports/{index}/nodePort"),
                "value": got,
            })),
            Some(_) => ops.push(json!({
                "op": "replace",
                "path": format!("/spec/ports/{index}/nodePort"),
                "value": got,
            })),
        }
    }

    if ops.is_empty() {
        info!(namespace, name = %req.name, ports = ?assigned, "admitted nodeport service unchanged");
        return response;
    }
    info!(namespace, name = %req.name, ports = ?assigned, "admitted nodeport service with rewritten ports");
    with_port_patch(response, ops)
}

fn with_port_patch(response: AdmissionResponse, ops: Vec<Value>) -> AdmissionResponse {
    let uid = response.uid.clone();
    let denied = |e: &dyn std::fmt::Display| {
        warn!(error = %e, "failed to build admission patch");
        let mut response = AdmissionResponse::invalid("internal error building the port patch");
        response.uid = uid.clone();
        response
    };
    match serde_json::from_value::<json_patch::Patch>(Value::Array(ops)) {
        Ok(patch) => match response.with_patch(patch) {
            Ok(response) => response,
            Err(e) => denied(&e),
        },
        Err(e) => denied(&e),
    }
}

#[cfg(test)]
mod tests {
    use allocator::PortRange;
    use kube::core::admission::AdmissionReview;

    use super::*;

    fn request(op: &str, namespace: &str, uid: &str, object: Value) -> AdmissionRequest<Service> {
        let review: AdmissionReview<Service> = serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": uid,
                "kind": {"group": "", "version": "v1", "kind": "Service"},
                "resource": {"group": "", "version": "v1", "resource": "services"},
                "requestKind": {"group": "", "version": "v1", "kind": "Service"},
                "requestResource": {"group": "", "version": "v1", "resource": "services"},
                "name": "web",
                "namespace": namespace,
                "operation": op,
                "userInfo": {"username": "tester"},
                "object": object,
                "oldObject": null,
                "dryRun": false,
                "options": null
            }
        }))
        .unwrap();
        review.try_into().unwrap()
    }

    fn nodeport_service(ports: Value) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": "web"},
            "spec": {"type": "NodePort", "ports": ports}
        })
    }

    fn team_store() -> Store {
        let store = Store::new();
        store
            .register_namespace("team-a", PortRange::new(30000, 30010).unwrap())
            .unwrap();
        store
    }

    fn patch_ops(response: &AdmissionResponse) -> Vec<Value> {
        match &response.patch {
            Some(raw) => serde_json::from_slice::<Vec<Value>>(raw).unwrap(),
            None => Vec::new(),
        }
    }

    #[test]
    fn out_of_range_port_is_rewritten_to_lowest_free() {
        let store = team_store();
        let req = request(
            "CREATE",
            "team-a",
            "uid-1",
            nodeport_service(json!([{"port": 80, "nodePort": 31000}])),
        );
        let response = mutate(&store, true, &req);
        assert!(response.allowed);
        assert_eq!(response.uid, "uid-1");
        let ops = patch_ops(&response);
        assert_eq!(
            ops,
            vec![json!({"op": "replace", "path": "/spec/ports/0/nodePort", "value": 30000})]
        );
        assert_eq!(store.allocated_ports("team-a"), vec![30000]);
    }

    #[test]
    fn in_range_free_port_is_accepted_without_patch() {
        let store = team_store();
        let req = request(
            "CREATE",
            "team-a",
            "uid-1",
            nodeport_service(json!([{"port": 80, "nodePort": 30005}])),
        );
        let response = mutate(&store, true, &req);
        assert!(response.allowed);
        assert!(response.patch.is_none());
        assert_eq!(store.allocated_ports("team-a"), vec![30005]);
    }

    #[test]
    fn unset_port_gets_an_add_op() {
        let store = team_store();
        let req = request(
            "CREATE",
            "team-a",
            "uid-1",
            nodeport_service(json!([{"port": 80}])),
        );
        let response = mutate(&store, true, &req);
        assert!(response.allowed);
        let ops = patch_ops(&response);
        assert_eq!(
            ops,
            vec![json!({"op": "add", "path": "/spec/ports/0/nodePort", "value": 30000})]
        );
    }

    #[test]
    fn mixed_ports_patch_only_changed_indexes() {
        let store = team_store();
        let req = request(
            "CREATE",
            "team-a",
            "uid-1",
            nodeport_service(json!([
                {"port": 80, "nodePort": 30002},
                {"port": 443},
                {"port": 8080, "nodePort": 32000}
            ])),
        );
        let response = mutate(&store, true, &req);
        assert!(response.allowed);
        let ops = patch_ops(&response);
        assert_eq!(
            ops,
            vec![
                json!({"op": "add", "path": "/spec/ports/1/nodePort", "value": 30000}),
                json!({"op": "replace", "path": "/spec/ports/2/nodePort", "value": 30001}),
            ]
        );
        assert_eq!(store.allocated_ports("team-a"), vec![30000, 30001, 30002]);
    }

    #[test]
    fn exhausted_namespace_is_denied() {
        let store = Store::new();
        store
            .register_namespace("solo", PortRange::new(30000, 30000).unwrap())
            .unwrap();
        store.seed_ports("solo", &[30000]).unwrap();
        let req = request(
            "CREATE",
            "solo",
            "uid-1",
            nodeport_service(json!([{"port": 80, "nodePort": 0}])),
        );
        let response = mutate(&store, true, &req);
        assert!(!response.allowed);
        assert!(response.result.message.contains("no free ports"));
    }

    #[test]
    fn unconfigured_namespace_is_denied() {
        let store = team_store();
        let req = request(
            "CREATE",
            "team-z",
            "uid-1",
            nodeport_service(json!([{"port": 80, "nodePort": 30000}])),
        );
        let response = mutate(&store, true, &req);
        assert!(!response.allowed);
        assert!(store.allocated_ports("team-a").is_empty());
    }

    #[test]
    fn cluster_ip_service_is_allowed_unchanged() {
        let store = team_store();
        let req = request(
            "CREATE",
            "team-a",
            "uid-1",
            json!({
                "apiVersion": "v1",
                "kind": "Service",
                "metadata": {"name": "db"},
                "spec": {"type": "ClusterIP", "ports": [{"port": 5432}]}
            }),
        );
        let response = mutate(&store, true, &req);
        assert!(response.allowed);
        assert!(response.patch.is_none());
        assert!(store.allocated_ports("team-a").is_empty());
    }

    #[test]
    fn delete_operation_is_allowed_unchanged() {
        let store = team_store();
        let req = request(
            "DELETE",
            "team-a",
            "uid-1",
            nodeport_service(json!([{"port": 80, "nodePort": 30000}])),
        );
        let response = mutate(&store, true, &req);
        assert!(response.allowed);
        assert!(store.allocated_ports("team-a").is_empty());
    }

    #[test]
    fn non_leader_denies_nodeport_requests() {
        let store = team_store();
        let req = request(
            "CREATE",
            "team-a",
            "uid-1",
            nodeport_service(json!([{"port": 80, "nodePort": 30005}])),
        );
        let response = mutate(&store, false, &req);
        assert!(!response.allowed);
        assert!(store.allocated_ports("team-a").is_empty());
    }

    #[test]
    fn non_leader_still_allows_cluster_ip_services() {
        let store = team_store();
        let req = request(
            "CREATE",
            "team-a",
            "uid-1",
            json!({
                "apiVersion": "v1",
                "kind": "Service",
                "metadata": {"name": "db"},
                "spec": {"type": "ClusterIP", "ports": [{"port": 5432}]}
            }),
        );
        let response = mutate(&store, false, &req);
        assert!(response.allowed);
    }

    #[test]
    fn retried_request_is_admitted_without_patch() {
        let store = team_store();
        let body = nodeport_service(json!([{"port": 80, "nodePort": 30005}]));
        let first = mutate(&store, true, &request("CREATE", "team-a", "uid-1", body.clone()));
        assert!(first.allowed);

        let second = mutate(&store, true, &request("UPDATE", "team-a", "uid-1", body));
        assert!(second.allowed);
        assert!(second.patch.is_none());
        assert_eq!(store.allocated_ports("team-a"), vec![30005]);
    }

    #[test]
    fn port_held_by_another_service_is_moved() {
        let store = team_store();
        let body = nodeport_service(json!([{"port": 80, "nodePort": 30005}]));
        mutate(&store, true, &request("CREATE", "team-a", "uid-1", body.clone()));

        let response = mutate(&store, true, &request("CREATE", "team-a", "uid-2", body));
        assert!(response.allowed);
        let ops = patch_ops(&response);
        assert_eq!(
            ops,
            vec![json!({"op": "replace", "path": "/spec/ports/0/nodePort", "value": 30000})]
        );
    }
}
