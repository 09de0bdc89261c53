//! Proxy auto-configuration
//!
//! Serves a generated PAC file that sends `*.{cluster}` hostnames through
//! the proxy and everything else DIRECT. Pure templating over the cluster
//! list; the output never changes after startup.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Response;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Static inputs for PAC generation.
#[derive(Debug, Clone)]
pub struct PacConfig {
    /// Cluster names to match as `*.{name}`.
    pub clusters: Vec<String>,
    /// SOCKS5 proxy address clients should use.
    pub socks_address: String,
    /// HTTP proxy address; `None` when the HTTP front end is disabled.
    pub http_address: Option<String>,
}

impl PacConfig {
    /// Render the PAC file body.
    pub fn generate(&self) -> String {
        if self.clusters.is_empty() {
            return "function FindProxyForURL(url, host) {\n  return \"DIRECT\";\n}\n".to_string();
        }

        let directive = match self.http_address.as_deref() {
            Some(http) if !http.is_empty() => {
                format!("PROXY {http}; SOCKS5 {}; DIRECT", self.socks_address)
            }
            _ => format!("SOCKS5 {}; DIRECT", self.socks_address),
        };

        let mut out = String::from("function FindProxyForURL(url, host) {\n");
        for cluster in &self.clusters {
            out.push_str(&format!(
                "  if (shExpMatch(host, \"*.{cluster}\"))\n    return \"{directive}\";\n"
            ));
        }
        out.push_str("  return \"DIRECT\";\n}\n");

        out
    }
}

/// Accept loop for the PAC listener; every request gets the same file.
pub async fn run_pac(
    listener: TcpListener,
    config: Arc<PacConfig>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("accepting pac connection")?;
                let config = Arc::clone(&config);

                tokio::spawn(async move {
                    let service = service_fn(move |_req| {
                        let body = config.generate();
                        async move {
                            Response::builder()
                                .header("content-type", "application/x-ns-proxy-autoconfig")
                                .header("content-disposition", "inline; filename=\"proxy.pac\"")
                                .body(Full::new(Bytes::from(body)))
                        }
                    });

                    let served = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                    if let Err(err) = served {
                        debug!(peer = %peer, error = %err, "pac connection ended");
                    }
                });
            }
        }
    }
}
