//! HTTP front end
//!
//! An HTTP/1.1 proxy with two request modes. CONNECT is handled on the raw
//! client stream: dial the router, write `200 Connection Established`
//! verbatim, forward any bytes read past the request head, then relay.
//! Everything else goes to a hyper connection serving absolute-URI
//! forwarding (strip hop-by-hop headers, re-issue through the pooled
//! router-dialing client, stream the response back). Front ends never retry
//! a whole request; the only recovery lives in the forwarding client's
//! stale-connection retry.

mod forward;

pub use forward::{remove_hop_by_hop_headers, ForwardClient, HOP_BY_HOP_HEADERS};

use std::convert::Infallible;
use std::error::Error as StdError;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::{Context as _, Result};
use bytes::Bytes;
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Full};
use hyper::body::Body;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::kube::Dialer;
use crate::relay::relay;

/// Response body type produced by the proxy service.
pub type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

const READ_HEADER_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const MAX_HEADER_BYTES: usize = 64 * 1024;

/// The HTTP proxy: shared router handle plus the pooled forwarding client.
pub struct HttpProxy {
    dialer: Arc<dyn Dialer>,
    forward: ForwardClient,
}

impl HttpProxy {
    /// Build the proxy over the shared dialer.
    pub fn new(dialer: Arc<dyn Dialer>, cancel: CancellationToken) -> Self {
        let forward = ForwardClient::new(Arc::clone(&dialer), cancel);
        HttpProxy { dialer, forward }
    }

    /// Forward one plain proxy request: must be absolute-form, is re-issued
    /// origin-form upstream with hop-by-hop headers stripped in both
    /// directions.
    pub async fn serve<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: StdError + Send + Sync + 'static,
    {
        if req.uri().scheme().is_none() || req.uri().authority().is_none() {
            return error_response(
                StatusCode::BAD_REQUEST,
                "request URI must be absolute".to_string(),
            );
        }

        let (mut parts, body) = req.into_parts();
        remove_hop_by_hop_headers(&mut parts.headers);

        // buffered fully so the stale-connection retry can replay it
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => {
                return error_response(
                    StatusCode::BAD_GATEWAY,
                    format!("reading request body: {err}"),
                );
            }
        };

        match self
            .forward
            .request(parts.method, parts.uri, parts.headers, body)
            .await
        {
            Ok(mut resp) => {
                remove_hop_by_hop_headers(resp.headers_mut());
                resp.map(BodyExt::boxed_unsync)
            }
            Err(err) => {
                warn!(error = format!("{err:#}"), "forward failed");
                error_response(StatusCode::BAD_GATEWAY, format!("forwarding request: {err:#}"))
            }
        }
    }
}

/// Accept loop for the HTTP proxy listener.
///
/// On cancellation the listener stops accepting and in-flight connections
/// get a bounded grace window before the loop returns.
pub async fn run_http_proxy(
    listener: TcpListener,
    proxy: Arc<HttpProxy>,
    cancel: CancellationToken,
) -> Result<()> {
    let tracker = TaskTracker::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("accepting http connection")?;
                let proxy = Arc::clone(&proxy);
                let conn_cancel = cancel.child_token();

                tracker.spawn(async move {
                    handle_connection(stream, peer.to_string(), proxy, conn_cancel).await;
                });
            }
        }
    }

    tracker.close();
    if tokio::time::timeout(SHUTDOWN_GRACE, tracker.wait())
        .await
        .is_err()
    {
        warn!("http proxy shutdown grace period expired with connections in flight");
    }

    Ok(())
}

/// Serve one accepted client connection.
///
/// The request head is read off the raw stream first: CONNECT requests are
/// tunneled without ever entering hyper (the response line is written
/// verbatim), anything else is replayed into a hyper connection for
/// forwarding.
async fn handle_connection<S>(
    mut stream: S,
    peer: String,
    proxy: Arc<HttpProxy>,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut consumed =
        match tokio::time::timeout(READ_HEADER_TIMEOUT, read_request_head(&mut stream)).await {
            Ok(Ok(consumed)) => consumed,
            Ok(Err(err)) => {
                debug!(peer = %peer, error = %err, "reading request head");
                return;
            }
            Err(_) => {
                debug!(peer = %peer, "request head read timed out");
                return;
            }
        };

    match connect_authority(&consumed.head) {
        Some(authority) => {
            let leftover = consumed.bytes.split_off(consumed.head.len());
            handle_connect(stream, &authority, leftover, proxy.as_ref(), &cancel).await;
        }
        None => {
            // hand everything read so far back to hyper; forward dials
            // observe shutdown through the pooled client's own token
            let replay = PrefixedStream::new(Bytes::from(consumed.bytes), stream);
            serve_forward_connection(replay, peer, proxy).await;
        }
    }
}

/// CONNECT: dial upstream, answer with the literal response line, forward
/// bytes the head read already pulled off the socket, then relay until
/// either side closes.
async fn handle_connect<S>(
    mut client: S,
    authority: &str,
    leftover: Vec<u8>,
    proxy: &HttpProxy,
    cancel: &CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut upstream = match proxy.dialer.dial(cancel, authority).await {
        Ok(upstream) => upstream,
        Err(err) => {
            warn!(addr = %authority, error = format!("{err:#}"), "connect dial failed");
            let _ = write_raw_response(
                &mut client,
                "502 Bad Gateway",
                &format!("dial upstream: {err:#}"),
            )
            .await;
            return;
        }
    };

    if let Err(err) = client
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await
    {
        debug!(addr = %authority, error = %err, "writing connect response");
        return;
    }

    if !leftover.is_empty() {
        if let Err(err) = upstream.write_all(&leftover).await {
            debug!(addr = %authority, error = %err, "draining buffered bytes");
            return;
        }
    }

    relay(client, upstream).await;
}

/// Serve a non-CONNECT connection through hyper.
async fn serve_forward_connection<S>(stream: S, peer: String, proxy: Arc<HttpProxy>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let service = service_fn(move |req| {
        let proxy = Arc::clone(&proxy);
        async move { Ok::<_, Infallible>(proxy.serve(req).await) }
    });

    let conn = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(READ_HEADER_TIMEOUT)
        .serve_connection(TokioIo::new(stream), service);

    if let Err(err) = conn.await {
        debug!(peer = %peer, error = %err, "http connection ended");
    }
}

/// Bytes consumed while locating the end of the request head.
struct ConsumedHead {
    /// Everything read off the socket so far.
    bytes: Vec<u8>,
    /// Length of the head, terminating `\r\n\r\n` included.
    head: Vec<u8>,
}

impl ConsumedHead {
    fn split(bytes: Vec<u8>, head_len: usize) -> Self {
        ConsumedHead {
            head: bytes[..head_len].to_vec(),
            bytes,
        }
    }
}

/// Read until the end of the request head (`\r\n\r\n`), bounded in size.
async fn read_request_head<S>(stream: &mut S) -> io::Result<ConsumedHead>
where
    S: AsyncRead + Unpin,
{
    let mut consumed = Vec::with_capacity(1024);
    let mut buf = [0u8; 4096];

    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before request head finished",
            ));
        }

        // re-scan a few trailing bytes in case the terminator spans reads
        let scan_from = consumed.len().saturating_sub(3);
        consumed.extend_from_slice(&buf[..n]);

        if let Some(pos) = consumed[scan_from..].windows(4).position(|w| w == b"\r\n\r\n") {
            let head_len = scan_from + pos + 4;
            return Ok(ConsumedHead::split(consumed, head_len));
        }

        if consumed.len() > MAX_HEADER_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "request head too large",
            ));
        }
    }
}

/// Extract the target of a CONNECT request line, or `None` for any other
/// method.
fn connect_authority(head: &[u8]) -> Option<String> {
    let line_end = head.windows(2).position(|w| w == b"\r\n")?;
    let line = std::str::from_utf8(&head[..line_end]).ok()?;

    let mut parts = line.split_whitespace();
    if parts.next()? != "CONNECT" {
        return None;
    }

    parts.next().map(str::to_string)
}

/// Minimal raw HTTP/1.1 response for the pre-hyper CONNECT path.
async fn write_raw_response<S>(stream: &mut S, status: &str, body: &str) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {status}\r\ncontent-type: text/plain; charset=utf-8\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}

/// Stream that replays already-consumed bytes before reading the socket.
struct PrefixedStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PrefixedStream<S> {
    fn new(prefix: Bytes, inner: S) -> Self {
        PrefixedStream { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix.split_to(n));
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

fn full_body(text: String) -> ProxyBody {
    Full::new(Bytes::from(text))
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn error_response(status: StatusCode, message: String) -> Response<ProxyBody> {
    let mut resp = Response::new(full_body(message));
    *resp.status_mut() = status;
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube::{ProxyStream, StreamConn};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use hyper::Method;
    use std::future;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::net::TcpStream;

    struct TcpDialer;

    #[async_trait]
    impl Dialer for TcpDialer {
        async fn dial(&self, _cancel: &CancellationToken, addr: &str) -> Result<ProxyStream> {
            Ok(ProxyStream::Direct(TcpStream::connect(addr).await?))
        }
    }

    struct FailingDialer;

    #[async_trait]
    impl Dialer for FailingDialer {
        async fn dial(&self, _cancel: &CancellationToken, _addr: &str) -> Result<ProxyStream> {
            Err(anyhow!("no route to cluster"))
        }
    }

    fn proxy_over(dialer: Arc<dyn Dialer>) -> Arc<HttpProxy> {
        Arc::new(HttpProxy::new(dialer, CancellationToken::new()))
    }

    fn get(uri: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    async fn body_string(resp: Response<ProxyBody>) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn spawn_echo_upstream() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    loop {
                        match sock.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if sock.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });

        addr
    }

    /// Minimal HTTP/1.1 backend used by the forward tests.
    async fn spawn_backend() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                tokio::spawn(async move {
                    let service = service_fn(|req: Request<hyper::body::Incoming>| async move {
                        // a proxy must not leak its own hop-by-hop headers
                        assert!(req.headers().get("proxy-authorization").is_none());
                        assert!(req.headers().get("proxy-connection").is_none());

                        let body = req.into_body().collect().await.unwrap().to_bytes();

                        let mut resp = Response::new(Full::new(Bytes::from(format!(
                            "received: {}",
                            String::from_utf8_lossy(&body)
                        ))));
                        resp.headers_mut()
                            .insert("x-custom", "from-backend".parse().unwrap());
                        resp.headers_mut()
                            .insert("keep-alive", "timeout=5".parse().unwrap());
                        Ok::<_, Infallible>(resp)
                    });

                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        addr
    }

    #[tokio::test]
    async fn test_forward_rejects_non_absolute_uri() {
        let proxy = proxy_over(Arc::new(FailingDialer));

        let resp = proxy.serve(get("/relative-path")).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_forward_dial_failure_returns_502() {
        let proxy = proxy_over(Arc::new(FailingDialer));

        let resp = proxy.serve(get("http://unreachable.example.com/test")).await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_forward_roundtrip_strips_hop_by_hop() {
        let backend = spawn_backend().await;
        let proxy = proxy_over(Arc::new(TcpDialer));

        let mut req = Request::builder()
            .method(Method::POST)
            .uri(format!("http://127.0.0.1:{}/submit", backend.port()))
            .body(Full::new(Bytes::from_static(b"request body")))
            .unwrap();
        req.headers_mut()
            .insert("proxy-authorization", "Basic secret".parse().unwrap());
        req.headers_mut()
            .insert("x-forward-me", "yes".parse().unwrap());

        let resp = proxy.serve(req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("x-custom").unwrap(), "from-backend");
        // hop-by-hop response headers are stripped on the way back
        assert!(resp.headers().get("keep-alive").is_none());
        assert_eq!(body_string(resp).await, "received: request body");
    }

    #[tokio::test]
    async fn test_connect_writes_exact_response_line() {
        let upstream = spawn_echo_upstream().await;
        let proxy = proxy_over(Arc::new(TcpDialer));

        let (mut client, server_side) = tokio::io::duplex(4096);
        let session = tokio::spawn(handle_connection(
            server_side,
            "test-peer".to_string(),
            proxy,
            CancellationToken::new(),
        ));

        client
            .write_all(
                format!("CONNECT {upstream} HTTP/1.1\r\nHost: {upstream}\r\n\r\n").as_bytes(),
            )
            .await
            .unwrap();

        let expected = b"HTTP/1.1 200 Connection Established\r\n\r\n";
        let mut reply = [0u8; 39];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, expected);

        client.write_all(b"tunnel me").await.unwrap();
        let mut echoed = [0u8; 9];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"tunnel me");

        drop(client);
        session.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_drains_bytes_past_the_head() {
        let upstream = spawn_echo_upstream().await;
        let proxy = proxy_over(Arc::new(TcpDialer));

        let (mut client, server_side) = tokio::io::duplex(4096);
        let session = tokio::spawn(handle_connection(
            server_side,
            "test-peer".to_string(),
            proxy,
            CancellationToken::new(),
        ));

        // tunnel payload arrives in the same segment as the request head
        client
            .write_all(
                format!("CONNECT {upstream} HTTP/1.1\r\nHost: {upstream}\r\n\r\nearly bytes")
                    .as_bytes(),
            )
            .await
            .unwrap();

        let mut reply = [0u8; 39];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"HTTP/1.1 200 Connection Established\r\n\r\n");

        // the early payload reached the upstream and came back through
        let mut echoed = [0u8; 11];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"early bytes");

        drop(client);
        session.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_dial_failure_returns_502() {
        let proxy = proxy_over(Arc::new(FailingDialer));

        let (mut client, server_side) = tokio::io::duplex(4096);
        let session = tokio::spawn(handle_connection(
            server_side,
            "test-peer".to_string(),
            proxy,
            CancellationToken::new(),
        ));

        client
            .write_all(b"CONNECT target.example.com:443 HTTP/1.1\r\nHost: target.example.com:443\r\n\r\n")
            .await
            .unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        let reply = String::from_utf8_lossy(&reply);
        assert!(reply.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "{reply}");
        assert!(reply.contains("no route to cluster"));

        session.await.unwrap();
    }

    #[test]
    fn test_connect_authority_parsing() {
        assert_eq!(
            connect_authority(b"CONNECT redis.staging:6379 HTTP/1.1\r\nHost: x\r\n\r\n"),
            Some("redis.staging:6379".to_string())
        );
        assert_eq!(
            connect_authority(b"GET http://example.com/ HTTP/1.1\r\n\r\n"),
            None
        );
        assert_eq!(connect_authority(b"CONNECT\r\n\r\n"), None);
        assert_eq!(connect_authority(b"garbage with no line end"), None);
    }

    #[tokio::test]
    async fn test_read_request_head_spanning_reads() {
        let (mut tx, mut rx) = tokio::io::duplex(4096);

        tx.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n").await.unwrap();
        let reader = tokio::spawn(async move { read_request_head(&mut rx).await.unwrap() });
        tx.write_all(b"\r\nbody").await.unwrap();

        let consumed = reader.await.unwrap();
        assert_eq!(consumed.head, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(&consumed.bytes[consumed.head.len()..], b"body");
    }

    #[tokio::test]
    async fn test_prefixed_stream_replays_then_reads() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut stream = PrefixedStream::new(Bytes::from_static(b"replayed "), rx);

        tx.write_all(b"live").await.unwrap();
        drop(tx);

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"replayed live");
    }

    /// Dialer whose first connection is already dead (writes fail with a
    /// broken pipe) and whose second reaches a scripted backend that records
    /// the raw request bytes.
    struct StaleThenGoodDialer {
        attempts: AtomicU32,
        captured: Arc<Mutex<Vec<u8>>>,
    }

    #[async_trait]
    impl Dialer for StaleThenGoodDialer {
        async fn dial(&self, _cancel: &CancellationToken, _addr: &str) -> Result<ProxyStream> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);

            let (local, remote) = tokio::io::duplex(16 * 1024);

            if attempt == 0 {
                // dead pooled-connection stand-in
                drop(remote);
            } else {
                let captured = Arc::clone(&self.captured);
                tokio::spawn(async move {
                    let mut remote = remote;
                    let mut buf = [0u8; 4096];
                    loop {
                        match remote.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                let mut seen = captured.lock().unwrap();
                                seen.extend_from_slice(&buf[..n]);
                                // naive end-of-request detection: body present
                                if seen.windows(4).any(|w| w == b"\r\n\r\n")
                                    && seen.ends_with(b"replayed body")
                                {
                                    break;
                                }
                            }
                        }
                    }
                    let _ = remote
                        .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
                        .await;
                });
            }

            Ok(ProxyStream::Forwarded(StreamConn::new(
                local,
                future::ready(None),
                None,
                "test/pod:80",
            )))
        }
    }

    #[tokio::test]
    async fn test_forward_retries_once_with_identical_body() {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let dialer = Arc::new(StaleThenGoodDialer {
            attempts: AtomicU32::new(0),
            captured: Arc::clone(&captured),
        });

        let proxy = proxy_over(dialer.clone());

        let req = Request::builder()
            .method(Method::POST)
            .uri("http://api.cache.staging/ingest")
            .body(Full::new(Bytes::from_static(b"replayed body")))
            .unwrap();

        let resp = proxy.serve(req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, "ok");

        // one dead connection, one live retry, nothing more
        assert_eq!(dialer.attempts.load(Ordering::SeqCst), 2);

        let seen = captured.lock().unwrap();
        assert!(seen.ends_with(b"replayed body"));
    }
}
