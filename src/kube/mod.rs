//! Kubernetes routing and dialing
//!
//! Everything between a destination address and a byte stream to the right
//! pod: address parsing, cluster routing, service resolution, port-forward
//! dialing with retries, and the stream-pair connection wrapper.

mod conn;
mod dialer;
mod resolver;
mod router;
mod target;

pub use conn::{format_bytes, AsyncStream, StreamConn};
pub use dialer::{is_retriable_error, PortForwarder};
pub use resolver::{resolve_service_to_pod, SERVICE_NAME_LABEL};
pub use router::{ClusterRouter, Dialer, ProxyStream};
pub use target::Target;

use anyhow::{Context as _, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use std::path::Path;

/// Build an authenticated client for one kubeconfig context.
///
/// The context's cluster, user and TLS settings all come from the file; the
/// API server connection inherits whatever auth the kubeconfig specifies.
pub async fn new_cluster_client(kubeconfig_path: &Path, context: &str) -> Result<Client> {
    let kubeconfig = Kubeconfig::read_from(kubeconfig_path)
        .with_context(|| format!("loading kubeconfig {}", kubeconfig_path.display()))?;

    let options = KubeConfigOptions {
        context: Some(context.to_string()),
        ..Default::default()
    };

    let config = Config::from_custom_kubeconfig(kubeconfig, &options)
        .await
        .with_context(|| format!("resolving kubeconfig context {context:?}"))?;

    Client::try_from(config)
        .with_context(|| format!("building client for context {context:?}"))
}
