//! Destination address parsing
//!
//! Turns a proxy destination like `redis.cache.staging:6379` into a typed
//! [`Target`] describing which cluster, namespace, service and optionally
//! pod the connection should reach.

use crate::error::ProxyError;

/// A parsed Kubernetes destination for port-forwarding.
///
/// Produced by [`Target::parse`] and immutable afterwards, except that the
/// router fills in the cluster's default namespace when the address did not
/// name one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Cluster name: the last dot-separated hostname label.
    pub cluster: String,
    /// True when the address names a service whose backing pod must be
    /// resolved; false when the pod is addressed directly.
    pub is_service: bool,
    /// The service name (always present; in pod mode it is the governing
    /// service from the StatefulSet-style address).
    pub service_name: String,
    /// Pod name; empty in service mode.
    pub pod_name: String,
    /// Namespace; empty means "use the cluster's default namespace".
    pub namespace: String,
    /// Destination port, 1..=65535.
    pub port: u16,
}

impl Target {
    /// Parse a destination address into a [`Target`].
    ///
    /// Supported hostname shapes, after stripping a trailing
    /// `.svc.cluster.local` or `.svc`:
    ///
    /// ```text
    /// <svc>.<cluster>:<port>                service in cluster default namespace
    /// <svc>.<ns>.<cluster>:<port>           service in namespace <ns>
    /// <pod>.<svc>.<ns>.<cluster>:<port>     direct pod (StatefulSet pattern)
    /// ```
    ///
    /// The parser does not consult the cluster table; deciding whether the
    /// cluster is actually known happens in the router.
    pub fn parse(addr: &str) -> Result<Target, ProxyError> {
        let (host, port_str) = addr
            .rsplit_once(':')
            .ok_or_else(|| ProxyError::invalid_address(addr, "missing port"))?;

        let port: u16 = port_str
            .parse()
            .map_err(|_| ProxyError::invalid_address(addr, format!("invalid port {port_str:?}")))?;

        if port == 0 {
            return Err(ProxyError::invalid_address(addr, "port 0 out of range 1-65535"));
        }

        let host = strip_dns_suffix(host);
        let labels: Vec<&str> = host.split('.').collect();

        match labels.as_slice() {
            [svc, cluster] => Ok(Target {
                cluster: cluster.to_string(),
                is_service: true,
                service_name: svc.to_string(),
                pod_name: String::new(),
                namespace: String::new(),
                port,
            }),
            [svc, ns, cluster] => Ok(Target {
                cluster: cluster.to_string(),
                is_service: true,
                service_name: svc.to_string(),
                pod_name: String::new(),
                namespace: ns.to_string(),
                port,
            }),
            [pod, svc, ns, cluster] => Ok(Target {
                cluster: cluster.to_string(),
                is_service: false,
                service_name: svc.to_string(),
                pod_name: pod.to_string(),
                namespace: ns.to_string(),
                port,
            }),
            _ => Err(ProxyError::invalid_address(
                addr,
                format!(
                    "unsupported hostname {host:?}: expected 2-4 dot-separated labels"
                ),
            )),
        }
    }
}

/// Strip the common Kubernetes DNS suffixes from a hostname, longest first.
pub fn strip_dns_suffix(host: &str) -> &str {
    let host = host.strip_suffix(".svc.cluster.local").unwrap_or(host);
    host.strip_suffix(".svc").unwrap_or(host)
}
