//! Pod dialing with retries
//!
//! [`PortForwarder`] is the per-cluster dialing handle: it opens port-forward
//! sessions to pods and sequences resolve→dial with classified retries. For
//! service targets every retry re-resolves the service, so a rolling restart
//! ends up at a freshly ready pod instead of the dead one.

use std::future::Future;
use std::io;
use std::time::Duration;

use anyhow::{anyhow, Context as _, Result};
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument as _};

use crate::error::ProxyError;
use crate::kube::conn::StreamConn;
use crate::kube::resolver::resolve_service_to_pod;
use crate::kube::target::Target;

const DIAL_MAX_ATTEMPTS: u32 = 6;
const DIAL_BASE_BACKOFF: Duration = Duration::from_secs(1);

/// Dials Kubernetes pods in one cluster via API-server port-forwarding.
pub struct PortForwarder {
    client: Client,
    cluster: String,
    default_namespace: String,
    base_backoff: Duration,
}

impl PortForwarder {
    /// Create a forwarder for one cluster.
    pub fn new(
        client: Client,
        cluster: impl Into<String>,
        default_namespace: impl Into<String>,
    ) -> Self {
        PortForwarder {
            client,
            cluster: cluster.into(),
            default_namespace: default_namespace.into(),
            base_backoff: DIAL_BASE_BACKOFF,
        }
    }

    /// The cluster this forwarder serves.
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Namespace used when an address does not name one.
    pub fn default_namespace(&self) -> &str {
        &self.default_namespace
    }

    /// Dial a parsed target with retries; `original_addr` is kept for logs.
    ///
    /// The retry window is roughly 31 s (1s + 2s + 4s + 8s + 16s across six
    /// attempts), which covers most pod restart scenarios.
    pub async fn dial_target(
        &self,
        cancel: &CancellationToken,
        original_addr: &str,
        target: &Target,
    ) -> Result<StreamConn> {
        dial_with_retry(
            cancel,
            original_addr,
            target,
            self.base_backoff,
            |ns: String, svc: String| {
                let client = self.client.clone();
                async move { resolve_service_to_pod(client, &ns, &svc).await }
            },
            |ns: String, pod: String, port: u16| self.dial_pod(ns, pod, port),
        )
        .instrument(info_span!("dial", cluster = %self.cluster))
        .await
    }

    /// Open one port-forward session to a pod and take its stream pair.
    ///
    /// The port-forward protocol brings up the error channel ahead of the
    /// data channel for each requested port; the protocol client enforces
    /// that ordering, we just consume exactly one of each.
    async fn dial_pod(&self, namespace: String, pod: String, port: u16) -> Result<StreamConn> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);

        let mut forwarder = api
            .portforward(&pod, &[port])
            .await
            .with_context(|| format!("port-forward dial to {namespace}/{pod}"))?;

        let data = forwarder
            .take_stream(port)
            .ok_or_else(|| anyhow!("port-forward returned no data stream for port {port}"))?;
        let error = forwarder
            .take_error(port)
            .ok_or_else(|| anyhow!("port-forward returned no error channel for port {port}"))?;

        let target = format!("{namespace}/{pod}:{port}");

        Ok(StreamConn::new(data, error, Some(forwarder), target))
    }
}

impl std::fmt::Debug for PortForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortForwarder")
            .field("cluster", &self.cluster)
            .field("default_namespace", &self.default_namespace)
            .finish_non_exhaustive()
    }
}

/// Resolve-and-dial loop with exponential backoff.
///
/// Parameterized over the resolve and dial operations so the retry policy
/// can be exercised without a cluster.
pub(crate) async fn dial_with_retry<R, RFut, D, DFut>(
    cancel: &CancellationToken,
    original_addr: &str,
    target: &Target,
    base_backoff: Duration,
    mut resolve: R,
    mut dial: D,
) -> Result<StreamConn>
where
    R: FnMut(String, String) -> RFut,
    RFut: Future<Output = Result<String>>,
    D: FnMut(String, String, u16) -> DFut,
    DFut: Future<Output = Result<StreamConn>>,
{
    let mut last_err: Option<anyhow::Error> = None;

    for attempt in 0..DIAL_MAX_ATTEMPTS {
        let pod_name = if target.is_service {
            match resolve(target.namespace.clone(), target.service_name.clone()).await {
                Ok(pod) => {
                    if attempt == 0 {
                        info!(
                            namespace = %target.namespace,
                            service = %target.service_name,
                            pod = %pod,
                            "resolved service to pod"
                        );
                    }
                    pod
                }
                Err(err) => {
                    match wait_backoff(
                        cancel,
                        attempt,
                        base_backoff,
                        &target.namespace,
                        &target.service_name,
                        0,
                        &err,
                    )
                    .await
                    {
                        Backoff::Retry => {
                            last_err = Some(err);
                            continue;
                        }
                        Backoff::Terminal => {
                            last_err = Some(err);
                            break;
                        }
                        Backoff::Cancelled => return Err(cancelled(err)),
                    }
                }
            }
        } else {
            target.pod_name.clone()
        };

        match dial(target.namespace.clone(), pod_name.clone(), target.port).await {
            Ok(conn) => {
                info!(addr = original_addr, target = %conn.target(), "connect");
                return Ok(conn.log_close_as(original_addr));
            }
            Err(err) => {
                match wait_backoff(
                    cancel,
                    attempt,
                    base_backoff,
                    &target.namespace,
                    &pod_name,
                    target.port,
                    &err,
                )
                .await
                {
                    Backoff::Retry => last_err = Some(err),
                    Backoff::Terminal => {
                        last_err = Some(err);
                        break;
                    }
                    Backoff::Cancelled => return Err(cancelled(err)),
                }
            }
        }
    }

    let err = last_err.unwrap_or_else(|| anyhow!("dial to {original_addr} failed"));
    error!(addr = original_addr, error = format!("{err:#}"), "failed to connect");

    Err(err)
}

/// How one failed attempt ends.
enum Backoff {
    /// Transient error; the backoff sleep completed, try again.
    Retry,
    /// Not retriable; stop with this error.
    Terminal,
    /// Cancellation fired during the sleep.
    Cancelled,
}

/// Classify the failure and sleep out the exponential backoff for
/// `attempt`, honoring cancellation. No sleep happens after the final
/// attempt.
#[allow(clippy::too_many_arguments)]
async fn wait_backoff(
    cancel: &CancellationToken,
    attempt: u32,
    base: Duration,
    namespace: &str,
    name: &str,
    port: u16,
    err: &anyhow::Error,
) -> Backoff {
    if !is_retriable_error(err) {
        return Backoff::Terminal;
    }

    // no sleep after the last attempt
    if attempt == DIAL_MAX_ATTEMPTS - 1 {
        return Backoff::Retry;
    }

    let backoff = base * 2u32.pow(attempt);

    warn!(
        namespace,
        target = name,
        port,
        attempt = attempt + 1,
        backoff = ?backoff,
        error = format!("{err:#}"),
        "retrying connection"
    );

    tokio::select! {
        _ = cancel.cancelled() => Backoff::Cancelled,
        _ = tokio::time::sleep(backoff) => Backoff::Retry,
    }
}

/// Wrap the in-flight failure as a cancellation error.
fn cancelled(err: anyhow::Error) -> anyhow::Error {
    anyhow::Error::new(ProxyError::Cancelled { source: err.into() })
}

/// Whether an error is transient and safe to retry.
///
/// Covers broken pipe, connection reset/refused, unexpected EOF and timeouts
/// at any wrapping depth, plus service resolution finding no ready pods.
/// Transport stacks sometimes stringify their causes, so a substring pass
/// over the rendered chain backs up the typed checks.
pub fn is_retriable_error(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            if matches!(
                io_err.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::TimedOut
            ) {
                return true;
            }
        }

        if cause.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
            return true;
        }

        if let Some(ProxyError::NoReadyPods { .. }) = cause.downcast_ref::<ProxyError>() {
            return true;
        }
    }

    let rendered = format!("{err:#}").to_lowercase();

    rendered.contains("no ready pod endpoints")
        || rendered.contains("broken pipe")
        || rendered.contains("connection reset")
        || rendered.contains("connection refused")
        || rendered.contains("unexpected eof")
        || rendered.contains("timed out")
}
