//! Service-to-pod resolution
//!
//! Finds a ready pod backing a named service by listing the service's
//! EndpointSlices. Stateless: every call asks the API server, so a rolling
//! restart is picked up on the next attempt.

use std::time::Duration;

use anyhow::{Context as _, Result};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::api::{Api, ListParams};
use kube::Client;

use crate::error::ProxyError;

/// Well-known label tying an EndpointSlice to its service.
pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

/// Default deadline for one resolution round trip.
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolve a service to the name of its first ready pod endpoint.
pub async fn resolve_service_to_pod(
    client: Client,
    namespace: &str,
    service: &str,
) -> Result<String> {
    let api: Api<EndpointSlice> = Api::namespaced(client, namespace);
    let params = ListParams::default().labels(&format!("{SERVICE_NAME_LABEL}={service}"));

    let slices = tokio::time::timeout(RESOLVE_TIMEOUT, api.list(&params))
        .await
        .with_context(|| {
            format!("listing endpoint slices for service {namespace}/{service} timed out")
        })?
        .with_context(|| format!("listing endpoint slices for service {namespace}/{service}"))?;

    first_ready_pod(&slices.items).ok_or_else(|| {
        ProxyError::NoReadyPods {
            namespace: namespace.to_string(),
            service: service.to_string(),
        }
        .into()
    })
}

/// Pick the first acceptable pod endpoint, in API order.
///
/// An endpoint is acceptable when none of its conditions rule it out: per
/// the EndpointSlice API an unset condition is permissive, so only explicit
/// `ready: false`, `serving: false` or `terminating: true` disqualify.
pub(crate) fn first_ready_pod(slices: &[EndpointSlice]) -> Option<String> {
    for slice in slices {
        for endpoint in &slice.endpoints {
            if let Some(conditions) = &endpoint.conditions {
                if conditions.ready == Some(false)
                    || conditions.serving == Some(false)
                    || conditions.terminating == Some(true)
                {
                    continue;
                }
            }

            if let Some(target) = &endpoint.target_ref {
                if target.kind.as_deref() == Some("Pod") {
                    if let Some(name) = &target.name {
                        return Some(name.clone());
                    }
                }
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ObjectReference;
    use k8s_openapi::api::discovery::v1::{Endpoint, EndpointConditions};

    fn pod_ref(name: &str) -> Option<ObjectReference> {
        Some(ObjectReference {
            kind: Some("Pod".to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        })
    }

    fn endpoint(
        name: &str,
        ready: Option<bool>,
        serving: Option<bool>,
        terminating: Option<bool>,
    ) -> Endpoint {
        Endpoint {
            addresses: vec!["10.0.0.1".to_string()],
            conditions: Some(EndpointConditions {
                ready,
                serving,
                terminating,
            }),
            target_ref: pod_ref(name),
            ..Default::default()
        }
    }

    fn slice(endpoints: Vec<Endpoint>) -> EndpointSlice {
        EndpointSlice {
            address_type: "IPv4".to_string(),
            endpoints,
            ..Default::default()
        }
    }

    #[test]
    fn test_first_ready_pod_picks_first_acceptable() {
        let slices = vec![slice(vec![
            endpoint("pod-0", Some(false), None, None),
            endpoint("pod-1", Some(true), Some(true), Some(false)),
            endpoint("pod-2", Some(true), Some(true), Some(false)),
        ])];

        assert_eq!(first_ready_pod(&slices).as_deref(), Some("pod-1"));
    }

    #[test]
    fn test_unset_conditions_are_permissive() {
        let slices = vec![slice(vec![Endpoint {
            addresses: vec!["10.0.0.1".to_string()],
            conditions: None,
            target_ref: pod_ref("pod-0"),
            ..Default::default()
        }])];

        assert_eq!(first_ready_pod(&slices).as_deref(), Some("pod-0"));
    }

    #[test]
    fn test_skips_not_serving_and_terminating() {
        let slices = vec![slice(vec![
            endpoint("stopping", None, Some(false), None),
            endpoint("draining", None, None, Some(true)),
            endpoint("healthy", None, None, None),
        ])];

        assert_eq!(first_ready_pod(&slices).as_deref(), Some("healthy"));
    }

    #[test]
    fn test_skips_non_pod_target_refs() {
        let mut external = endpoint("lb", Some(true), Some(true), Some(false));
        external.target_ref = Some(ObjectReference {
            kind: Some("Node".to_string()),
            name: Some("worker-1".to_string()),
            ..Default::default()
        });

        let slices = vec![slice(vec![
            external,
            endpoint("pod-real", Some(true), Some(true), Some(false)),
        ])];

        assert_eq!(first_ready_pod(&slices).as_deref(), Some("pod-real"));
    }

    #[test]
    fn test_iterates_slices_in_order() {
        let slices = vec![
            slice(vec![endpoint("skipped", Some(false), None, None)]),
            slice(vec![endpoint("from-second-slice", Some(true), None, None)]),
        ];

        assert_eq!(
            first_ready_pod(&slices).as_deref(),
            Some("from-second-slice")
        );
    }

    #[test]
    fn test_no_acceptable_endpoint() {
        let slices = vec![slice(vec![
            endpoint("a", Some(false), None, None),
            endpoint("b", None, Some(false), None),
        ])];

        assert_eq!(first_ready_pod(&slices), None);
        assert_eq!(first_ready_pod(&[]), None);
    }
}
