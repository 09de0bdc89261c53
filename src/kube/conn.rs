//! Port-forward stream connection
//!
//! [`StreamConn`] wraps the data stream of a Kubernetes port-forward session
//! as an ordinary [`AsyncRead`] + [`AsyncWrite`] connection. The session's
//! error channel is drained by a background task; a remote diagnostic
//! arriving there is surfaced to the reader at data-stream EOF rather than
//! interleaved with payload bytes.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use kube::api::Portforwarder;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::oneshot;
use tokio::time::{sleep, Instant, Sleep};
use tracing::info;

/// Object-safe combination of the stream traits a proxied connection needs.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Cap on the remote error message retained from the error channel.
const MAX_ERROR_BYTES: usize = 4096;

/// How long a reader at EOF waits for the error monitor to finish.
const ERROR_DRAIN_WAIT: Duration = Duration::from_secs(5);

enum ReadState {
    /// Normal data flow.
    Streaming,
    /// Data stream hit EOF; waiting (bounded) for the error monitor.
    Draining { deadline: Pin<Box<Sleep>> },
    /// EOF (and any remote error) already delivered.
    Finished,
}

/// A live connection to one pod port over a port-forward session.
///
/// Reads and writes go to the session's data stream and update atomic byte
/// counters. Closing is idempotent: the data stream is shut down first, then
/// the whole session (error channel included) is torn down, and the close
/// sequence runs at most once even when `shutdown` races `drop`.
pub struct StreamConn {
    data: Box<dyn AsyncStream>,
    forwarder: Option<Portforwarder>,
    target: String,
    created_at: Instant,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    remote_err: Arc<Mutex<Option<String>>>,
    err_done: Option<oneshot::Receiver<()>>,
    read_state: ReadState,
    closed: bool,
    close_log_addr: Option<String>,
}

impl StreamConn {
    /// Wrap a data stream and an error-channel future as a connection.
    ///
    /// `error` resolves with the remote diagnostic, if any, once the error
    /// channel closes; it is driven by a background task so the message is
    /// available (capped at 4 KiB) by the time a reader observes EOF.
    /// `forwarder` keeps the underlying session alive and is aborted on
    /// close; tests pass `None` and a ready future.
    pub fn new(
        data: impl AsyncStream + 'static,
        error: impl Future<Output = Option<String>> + Send + 'static,
        forwarder: Option<Portforwarder>,
        target: impl Into<String>,
    ) -> Self {
        let remote_err = Arc::new(Mutex::new(None));
        let (done_tx, done_rx) = oneshot::channel();

        let slot = Arc::clone(&remote_err);
        tokio::spawn(async move {
            if let Some(mut msg) = error.await {
                truncate_at_boundary(&mut msg, MAX_ERROR_BYTES);
                if !msg.is_empty() {
                    *slot.lock().expect("remote error lock poisoned") = Some(msg);
                }
            }
            let _ = done_tx.send(());
        });

        StreamConn {
            data: Box::new(data),
            forwarder,
            target: target.into(),
            created_at: Instant::now(),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            remote_err,
            err_done: Some(done_rx),
            read_state: ReadState::Streaming,
            closed: false,
            close_log_addr: None,
        }
    }

    /// Log connection metrics (duration, rx, tx) when the connection closes,
    /// attributed to the original proxy destination `addr`.
    pub fn log_close_as(mut self, addr: impl Into<String>) -> Self {
        self.close_log_addr = Some(addr.into());
        self
    }

    /// Bytes received from the pod so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    /// Bytes sent to the pod so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// The `namespace/pod:port` this connection points at.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Runs the close sequence exactly once.
    fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }

        if let Some(addr) = self.close_log_addr.take() {
            info!(
                addr = %addr,
                target = %self.target,
                duration = ?self.created_at.elapsed(),
                rx = %format_bytes(self.bytes_read()),
                tx = %format_bytes(self.bytes_written()),
                "closed"
            );
        }
    }
}

impl AsyncRead for StreamConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        loop {
            match &mut this.read_state {
                ReadState::Streaming => {
                    let before = buf.filled().len();
                    match Pin::new(&mut this.data).poll_read(cx, buf) {
                        Poll::Ready(Ok(())) => {
                            let n = buf.filled().len() - before;
                            if n > 0 {
                                this.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
                                return Poll::Ready(Ok(()));
                            }
                            // EOF: give the error monitor a bounded window to
                            // publish a remote diagnostic before reporting it.
                            this.read_state = ReadState::Draining {
                                deadline: Box::pin(sleep(ERROR_DRAIN_WAIT)),
                            };
                        }
                        other => return other,
                    }
                }
                ReadState::Draining { deadline } => {
                    match this.err_done.as_mut() {
                        Some(rx) => match Pin::new(rx).poll(cx) {
                            Poll::Ready(_) => {
                                this.err_done = None;
                                this.read_state = ReadState::Finished;
                                let pending = this
                                    .remote_err
                                    .lock()
                                    .expect("remote error lock poisoned")
                                    .take();
                                return match pending {
                                    Some(msg) => Poll::Ready(Err(io::Error::other(format!(
                                        "remote error from {}: {msg}",
                                        this.target
                                    )))),
                                    None => Poll::Ready(Ok(())),
                                };
                            }
                            Poll::Pending => match deadline.as_mut().poll(cx) {
                                Poll::Ready(()) => {
                                    this.read_state = ReadState::Finished;
                                    return Poll::Ready(Ok(()));
                                }
                                Poll::Pending => return Poll::Pending,
                            },
                        },
                        None => {
                            this.read_state = ReadState::Finished;
                        }
                    }
                }
                ReadState::Finished => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl AsyncWrite for StreamConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        match Pin::new(&mut this.data).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.data).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        // data stream first so the remote side observes EOF, then the whole
        // session goes down with it.
        let res = Pin::new(&mut this.data).poll_shutdown(cx);
        if res.is_ready() {
            this.teardown();
        }
        res
    }
}

impl Drop for StreamConn {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for StreamConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConn")
            .field("target", &self.target)
            .field("rx", &self.bytes_read())
            .field("tx", &self.bytes_written())
            .finish_non_exhaustive()
    }
}

fn truncate_at_boundary(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut idx = max;
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    s.truncate(idx);
}

/// Human-readable byte counts for close logs.
pub fn format_bytes(n: u64) -> String {
    const KIB: u64 = 1 << 10;
    const MIB: u64 = 1 << 20;
    const GIB: u64 = 1 << 30;

    match n {
        _ if n >= GIB => format!("{:.1}GB", n as f64 / GIB as f64),
        _ if n >= MIB => format!("{:.1}MB", n as f64 / MIB as f64),
        _ if n >= KIB => format!("{:.1}KB", n as f64 / KIB as f64),
        _ => format!("{n}B"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn no_error() -> future::Ready<Option<String>> {
        future::ready(None)
    }

    #[tokio::test]
    async fn test_read_write_counters() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let mut conn = StreamConn::new(local, no_error(), None, "ns/pod:80");

        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        remote.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        assert_eq!(conn.bytes_written(), 4);
        assert_eq!(conn.bytes_read(), 5);
    }

    #[tokio::test]
    async fn test_clean_eof_without_remote_error() {
        let (local, mut remote) = tokio::io::duplex(64);
        let mut conn = StreamConn::new(local, no_error(), None, "ns/pod:80");

        remote.write_all(b"done").await.unwrap();
        drop(remote);

        let mut out = Vec::new();
        conn.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"done");
    }

    #[tokio::test]
    async fn test_remote_error_surfaced_at_eof() {
        let (local, mut remote) = tokio::io::duplex(64);
        let mut conn = StreamConn::new(
            local,
            future::ready(Some("connection refused by pod".to_string())),
            None,
            "ns/pod:80",
        );

        remote.write_all(b"partial").await.unwrap();
        drop(remote);

        let mut buf = [0u8; 7];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"partial");

        let err = conn.read(&mut buf).await.unwrap_err();
        assert!(err.to_string().contains("connection refused by pod"));
        assert!(err.to_string().contains("ns/pod:80"));

        // error is surfaced once; the stream then reports plain EOF
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eof_wait_is_bounded_when_monitor_hangs() {
        let (local, remote) = tokio::io::duplex(64);
        let mut conn = StreamConn::new(local, future::pending(), None, "ns/pod:80");
        drop(remote);

        // the monitor never finishes; the drain deadline fires instead and
        // the reader gets a plain EOF
        let mut buf = [0u8; 8];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (local, _remote) = tokio::io::duplex(64);
        let mut conn = StreamConn::new(local, no_error(), None, "ns/pod:80");

        conn.shutdown().await.unwrap();
        conn.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_remote_error_is_capped() {
        let (local, remote) = tokio::io::duplex(64);
        let big = "x".repeat(MAX_ERROR_BYTES * 2);
        let mut conn = StreamConn::new(local, future::ready(Some(big)), None, "ns/pod:80");
        drop(remote);

        let mut buf = [0u8; 8];
        let err = conn.read(&mut buf).await.unwrap_err();
        // prefix + cap, never the full doubled payload
        assert!(err.to_string().len() < MAX_ERROR_BYTES + 128);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(2048), "2.0KB");
        assert_eq!(format_bytes(5 << 20), "5.0MB");
        assert_eq!(format_bytes(3 << 30), "3.0GB");
    }
}
