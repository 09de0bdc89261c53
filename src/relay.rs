//! Bidirectional byte relay
//!
//! Shared by the SOCKS5 front end and HTTP CONNECT tunneling. Each direction
//! is copied by its own task; when one direction finishes, the destination's
//! write side is shut down so the peer observes EOF and the reverse
//! direction can drain. Both directions are joined before returning so the
//! endpoints are released deterministically.

use std::io;

use tokio::io::{copy, split, AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// Relay bytes between `client` and `upstream` until both directions close.
///
/// Returns the byte counts copied (client→upstream, upstream→client).
pub async fn relay<A, B>(client: A, upstream: B) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    B: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut client_read, mut client_write) = split(client);
    let (mut upstream_read, mut upstream_write) = split(upstream);

    let forward = tokio::spawn(async move {
        let copied = copy(&mut client_read, &mut upstream_write).await;
        let _ = upstream_write.shutdown().await;
        copied
    });

    let copied_down = copy(&mut upstream_read, &mut client_write).await;
    let _ = client_write.shutdown().await;

    let down = finish_direction("upstream to client", copied_down);

    let up = match forward.await {
        Ok(copied) => finish_direction("client to upstream", copied),
        Err(join_err) => {
            debug!(error = %join_err, "relay task aborted");
            0
        }
    };

    (up, down)
}

/// Log a finished copy direction; success is silent.
fn finish_direction(direction: &str, result: io::Result<u64>) -> u64 {
    match result {
        Ok(n) => n,
        Err(err) => {
            match err.kind() {
                // the remote dropped the connection mid-stream
                io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => {
                    warn!(direction, error = %err, "relay copy error");
                }
                // the other direction closed first; expected teardown noise
                io::ErrorKind::NotConnected | io::ErrorKind::UnexpectedEof => {}
                _ => {
                    debug!(direction, error = %err, "relay copy error");
                }
            }
            0
        }
    }
}
