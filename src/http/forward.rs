//! Pooled HTTP forwarding through the router
//!
//! Plain (non-CONNECT) proxy requests are re-issued upstream through a
//! pooled hyper client whose connector dials via the cluster router. A
//! pooled connection whose underlying port-forward died server-side fails
//! its first write with a broken pipe; the client buffers request bodies so
//! it can evict the stale pool and retry exactly once with identical bytes.

use std::error::Error as StdError;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{HeaderMap, Method, Request, Response, Uri};
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::kube::{Dialer, ProxyStream};

/// Headers that apply to a single transport hop and must not be forwarded
/// (RFC 7230 §6.1, plus the de-facto `Proxy-Connection`).
pub const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Strip hop-by-hop headers in place.
pub fn remove_hop_by_hop_headers(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const POOL_MAX_IDLE_PER_HOST: usize = 10;

/// Connector that resolves upstream addresses through the shared [`Dialer`].
#[derive(Clone)]
pub struct RouterConnector {
    dialer: Arc<dyn Dialer>,
    cancel: CancellationToken,
}

impl RouterConnector {
    /// Build a connector over the shared dialer.
    pub fn new(dialer: Arc<dyn Dialer>, cancel: CancellationToken) -> Self {
        RouterConnector { dialer, cancel }
    }
}

impl tower_service::Service<Uri> for RouterConnector {
    type Response = RoutedIo;
    type Error = Box<dyn StdError + Send + Sync>;
    type Future = Pin<Box<dyn Future<Output = Result<RoutedIo, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let dialer = Arc::clone(&self.dialer);
        let cancel = self.cancel.clone();

        Box::pin(async move {
            let host = uri
                .host()
                .ok_or_else(|| io::Error::other(format!("request uri {uri} has no host")))?;
            let port = uri
                .port_u16()
                .unwrap_or_else(|| if uri.scheme_str() == Some("https") { 443 } else { 80 });
            let addr = format!("{host}:{port}");

            let stream = dialer.dial(&cancel, &addr).await?;

            Ok(RoutedIo {
                inner: TokioIo::new(stream),
            })
        })
    }
}

/// A router-dialed connection adapted to hyper's IO traits.
pub struct RoutedIo {
    inner: TokioIo<ProxyStream>,
}

impl hyper::rt::Read for RoutedIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl hyper::rt::Write for RoutedIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl Connection for RoutedIo {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

/// Pooled forwarding client with a single stale-connection retry.
pub struct ForwardClient {
    connector: RouterConnector,
    client: RwLock<Client<RouterConnector, Full<Bytes>>>,
}

impl ForwardClient {
    /// Build the pooled client over the shared dialer.
    pub fn new(dialer: Arc<dyn Dialer>, cancel: CancellationToken) -> Self {
        let connector = RouterConnector::new(dialer, cancel);
        let client = build_pool(connector.clone());

        ForwardClient {
            connector,
            client: RwLock::new(client),
        }
    }

    /// Issue a request whose body has already been buffered.
    ///
    /// On a broken-pipe class failure the entire pool is replaced (dropping
    /// every idle connection) and the request is replayed once with the
    /// identical body.
    pub async fn request(
        &self,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<Response<Incoming>> {
        let first = self
            .attempt(method.clone(), uri.clone(), headers.clone(), body.clone())
            .await;

        let err = match first {
            Ok(resp) => return Ok(resp),
            Err(err) => err,
        };

        if !is_stale_connection_error(&err) {
            return Err(anyhow!(err).context(format!("forwarding {method} {uri}")));
        }

        debug!(uri = %uri, error = %err, "stale upstream connection, retrying once");

        *self.client.write().await = build_pool(self.connector.clone());

        self.attempt(method.clone(), uri.clone(), headers, body)
            .await
            .map_err(|err| anyhow!(err).context(format!("forwarding {method} {uri} (retried)")))
    }

    async fn attempt(
        &self,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<Response<Incoming>, hyper_util::client::legacy::Error> {
        let mut req = Request::builder()
            .method(method)
            .uri(uri)
            .body(Full::new(body))
            .expect("request parts were already validated");
        *req.headers_mut() = headers;

        let client = self.client.read().await.clone();

        client.request(req).await
    }
}

/// Whether a forwarding failure smells like a stale pooled connection.
///
/// Checks for broken-pipe / connection-reset at any source depth, typed or
/// stringified (some transport layers erase the `io::Error` cause).
fn is_stale_connection_error(err: &(dyn StdError + 'static)) -> bool {
    let mut cause: Option<&(dyn StdError + 'static)> = Some(err);

    while let Some(current) = cause {
        if let Some(io_err) = current.downcast_ref::<io::Error>() {
            if matches!(
                io_err.kind(),
                io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
            ) {
                return true;
            }
        }

        let msg = current.to_string().to_lowercase();
        if msg.contains("broken pipe") || msg.contains("connection reset") {
            return true;
        }

        cause = current.source();
    }

    false
}

fn build_pool(connector: RouterConnector) -> Client<RouterConnector, Full<Bytes>> {
    Client::builder(TokioExecutor::new())
        .pool_timer(TokioTimer::new())
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .build(connector)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct WrappedIo {
        inner: io::Error,
    }

    impl std::fmt::Display for WrappedIo {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "request failed")
        }
    }

    impl StdError for WrappedIo {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            Some(&self.inner)
        }
    }

    #[test]
    fn test_stale_detection_typed_at_depth() {
        let err = WrappedIo {
            inner: io::Error::new(io::ErrorKind::BrokenPipe, "pipe"),
        };
        assert!(is_stale_connection_error(&err));

        let err = WrappedIo {
            inner: io::Error::new(io::ErrorKind::ConnectionReset, "reset"),
        };
        assert!(is_stale_connection_error(&err));
    }

    #[test]
    fn test_stale_detection_substring() {
        let err = io::Error::other("upstream said: broken pipe");
        assert!(is_stale_connection_error(&err));

        let err = io::Error::other("connection reset by peer");
        assert!(is_stale_connection_error(&err));
    }

    #[test]
    fn test_non_stale_errors() {
        let err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert!(!is_stale_connection_error(&err));

        let err = io::Error::other("404 not found");
        assert!(!is_stale_connection_error(&err));
    }

    #[test]
    fn test_hop_by_hop_stripping() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", "keep-alive".parse().unwrap());
        headers.insert("proxy-authorization", "Basic secret".parse().unwrap());
        headers.insert("transfer-encoding", "chunked".parse().unwrap());
        headers.insert("x-real-header", "preserved".parse().unwrap());

        remove_hop_by_hop_headers(&mut headers);

        assert!(headers.get("connection").is_none());
        assert!(headers.get("proxy-authorization").is_none());
        assert!(headers.get("transfer-encoding").is_none());
        assert_eq!(headers.get("x-real-header").unwrap(), "preserved");
    }
}
