//! Cluster routing
//!
//! [`ClusterRouter`] decides per destination whether to tunnel through a
//! Kubernetes port-forward or to dial plain TCP. The decision looks only at
//! the last hostname label (after DNS-suffix stripping): if it names a known
//! cluster the address must parse as a Kubernetes target, otherwise the
//! connection passes through untouched.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ProxyError;
use crate::kube::conn::StreamConn;
use crate::kube::dialer::PortForwarder;
use crate::kube::target::{strip_dns_suffix, Target};

/// The pluggable dial contract shared by the SOCKS5 and HTTP front ends.
///
/// Front ends only ever see this trait, so tests can substitute a fake
/// dialer and both protocols route identically.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to `addr` (`host:port`), honoring `cancel` for long waits.
    async fn dial(&self, cancel: &CancellationToken, addr: &str) -> Result<ProxyStream>;
}

/// A dialed upstream connection: direct TCP or a port-forwarded pod stream.
#[derive(Debug)]
pub enum ProxyStream {
    /// Plain TCP passthrough.
    Direct(TcpStream),
    /// Kubernetes port-forward.
    Forwarded(StreamConn),
}

impl AsyncRead for ProxyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Direct(s) => Pin::new(s).poll_read(cx, buf),
            ProxyStream::Forwarded(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ProxyStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ProxyStream::Direct(s) => Pin::new(s).poll_write(cx, buf),
            ProxyStream::Forwarded(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Direct(s) => Pin::new(s).poll_flush(cx),
            ProxyStream::Forwarded(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Direct(s) => Pin::new(s).poll_shutdown(cx),
            ProxyStream::Forwarded(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Routes destinations to the right per-cluster forwarder or to direct TCP.
///
/// The table is built once at startup and read-only afterwards.
#[derive(Debug)]
pub struct ClusterRouter {
    forwarders: HashMap<String, PortForwarder>,
}

impl ClusterRouter {
    /// Build a router over per-cluster forwarders keyed by cluster name.
    pub fn new(forwarders: HashMap<String, PortForwarder>) -> Self {
        ClusterRouter { forwarders }
    }

    /// Known cluster names, sorted; used by the PAC generator.
    pub fn cluster_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.forwarders.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl Dialer for ClusterRouter {
    async fn dial(&self, cancel: &CancellationToken, addr: &str) -> Result<ProxyStream> {
        if let Some(cluster) = cluster_suffix(addr, |c| self.forwarders.contains_key(c)) {
            // a Kubernetes-shaped address must parse; no passthrough fallback
            let mut target = Target::parse(addr)?;

            let forwarder = self
                .forwarders
                .get(cluster)
                .ok_or_else(|| ProxyError::UnknownCluster(cluster.to_string()))?;

            if target.namespace.is_empty() {
                target.namespace = forwarder.default_namespace().to_string();
            }

            let conn = forwarder.dial_target(cancel, addr, &target).await?;

            return Ok(ProxyStream::Forwarded(conn));
        }

        debug!(addr, "passthrough dial");

        // an in-flight direct dial is abandoned as soon as the token fires
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(anyhow::Error::new(ProxyError::Cancelled {
                    source: format!("direct dial to {addr}").into(),
                }));
            }
            connected = TcpStream::connect(addr) => {
                connected.with_context(|| format!("direct dial to {addr}"))?
            }
        };

        Ok(ProxyStream::Direct(stream))
    }
}

/// Extract the cluster name from `addr` when its final hostname label (after
/// stripping `.svc` / `.svc.cluster.local`) is a known cluster.
///
/// Returns `None` for anything else: addresses without a port, hostnames
/// with fewer than two labels, or an unknown final label. The check is an
/// exact match, never a guess.
pub(crate) fn cluster_suffix<F>(addr: &str, is_known: F) -> Option<&str>
where
    F: Fn(&str) -> bool,
{
    let (host, _port) = addr.rsplit_once(':')?;
    let host = strip_dns_suffix(host);

    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() < 2 {
        return None;
    }

    let candidate = labels[labels.len() - 1];
    if is_known(candidate) {
        Some(candidate)
    } else {
        None
    }
}
