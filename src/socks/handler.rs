//! SOCKS5 front end
//!
//! Minimal SOCKS5 server: no authentication, CONNECT only. The one property
//! that matters here is that DOMAIN destinations reach the router verbatim —
//! no DNS lookup ever happens on this path, because Kubernetes service names
//! only mean something to the cluster router.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::kube::Dialer;
use crate::relay::relay;
use crate::socks::consts::*;

/// Accept loop for the SOCKS5 listener. Returns when `cancel` fires.
pub async fn run_socks5(
    listener: TcpListener,
    dialer: Arc<dyn Dialer>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("accepting socks5 connection")?;
                let dialer = Arc::clone(&dialer);
                let cancel = cancel.child_token();

                tokio::spawn(async move {
                    if let Err(err) = handle_socks5(stream, dialer.as_ref(), &cancel).await {
                        debug!(peer = %peer, error = format!("{err:#}"), "socks5 session ended");
                    }
                });
            }
        }
    }
}

/// Serve one SOCKS5 session: negotiate, parse CONNECT, dial, relay.
pub async fn handle_socks5<S>(
    mut stream: S,
    dialer: &dyn Dialer,
    cancel: &CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    negotiate_method(&mut stream).await?;

    let addr = match read_connect_request(&mut stream).await {
        Ok(addr) => addr,
        Err(rejection) => {
            send_reply(&mut stream, rejection.reply_code).await?;
            bail!(rejection.reason);
        }
    };

    info!(addr = %addr, "socks5 connect");

    let upstream = match dialer.dial(cancel, &addr).await {
        Ok(upstream) => upstream,
        Err(err) => {
            warn!(addr = %addr, error = format!("{err:#}"), "socks5 dial failed");
            send_reply(&mut stream, dial_error_reply_code(&err)).await?;
            return Err(err.context(format!("dialing {addr}")));
        }
    };

    send_reply(&mut stream, SOCKS5_REPLY_SUCCEEDED).await?;

    relay(stream, upstream).await;

    Ok(())
}

/// Method negotiation: only "no authentication" is offered or accepted.
async fn negotiate_method<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream
        .read_exact(&mut header)
        .await
        .context("reading method negotiation header")?;

    if header[0] != SOCKS5_VERSION {
        bail!("unsupported SOCKS version: {}", header[0]);
    }

    let mut methods = vec![0u8; header[1] as usize];
    stream
        .read_exact(&mut methods)
        .await
        .context("reading authentication methods")?;

    if !methods.contains(&SOCKS5_AUTH_METHOD_NONE) {
        stream
            .write_all(&[SOCKS5_VERSION, SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE])
            .await?;
        bail!("client offered no acceptable authentication method");
    }

    stream
        .write_all(&[SOCKS5_VERSION, SOCKS5_AUTH_METHOD_NONE])
        .await?;

    Ok(())
}

/// A request that must be answered with an error reply before hanging up.
struct Rejection {
    reply_code: u8,
    reason: String,
}

/// Read a CONNECT request and render its destination as `host:port`.
///
/// DOMAIN addresses are returned exactly as the client sent them; whether
/// the name is a Kubernetes service or a public hostname is the router's
/// call, not ours.
async fn read_connect_request<S>(stream: &mut S) -> Result<String, Rejection>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await.map_err(|err| Rejection {
        reply_code: SOCKS5_REPLY_GENERAL_FAILURE,
        reason: format!("reading request header: {err}"),
    })?;

    if header[0] != SOCKS5_VERSION {
        return Err(Rejection {
            reply_code: SOCKS5_REPLY_GENERAL_FAILURE,
            reason: format!("unsupported SOCKS version in request: {}", header[0]),
        });
    }

    if header[1] != SOCKS5_CMD_TCP_CONNECT {
        return Err(Rejection {
            reply_code: SOCKS5_REPLY_COMMAND_NOT_SUPPORTED,
            reason: format!("unsupported command: {}", header[1]),
        });
    }

    match header[3] {
        SOCKS5_ADDR_TYPE_IPV4 => {
            let mut addr = [0u8; 4];
            read_addr_bytes(stream, &mut addr).await?;
            let port = read_port(stream).await?;
            Ok(format!("{}:{port}", Ipv4Addr::from(addr)))
        }
        SOCKS5_ADDR_TYPE_DOMAIN => {
            let mut len = [0u8; 1];
            read_addr_bytes(stream, &mut len).await?;
            let len = len[0] as usize;

            if len == 0 || len > MAX_DOMAIN_LEN {
                return Err(Rejection {
                    reply_code: SOCKS5_REPLY_GENERAL_FAILURE,
                    reason: format!("invalid domain length: {len}"),
                });
            }

            let mut domain = vec![0u8; len];
            read_addr_bytes(stream, &mut domain).await?;
            let domain = String::from_utf8(domain).map_err(|_| Rejection {
                reply_code: SOCKS5_REPLY_GENERAL_FAILURE,
                reason: "domain is not valid UTF-8".to_string(),
            })?;

            let port = read_port(stream).await?;
            Ok(format!("{domain}:{port}"))
        }
        SOCKS5_ADDR_TYPE_IPV6 => {
            let mut addr = [0u8; 16];
            read_addr_bytes(stream, &mut addr).await?;
            let port = read_port(stream).await?;
            Ok(format!("[{}]:{port}", Ipv6Addr::from(addr)))
        }
        other => Err(Rejection {
            reply_code: SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED,
            reason: format!("unsupported address type: {other}"),
        }),
    }
}

async fn read_addr_bytes<S>(stream: &mut S, buf: &mut [u8]) -> Result<(), Rejection>
where
    S: AsyncRead + Unpin,
{
    stream.read_exact(buf).await.map(|_| ()).map_err(|err| Rejection {
        reply_code: SOCKS5_REPLY_GENERAL_FAILURE,
        reason: format!("reading destination address: {err}"),
    })
}

async fn read_port<S>(stream: &mut S) -> Result<u16, Rejection>
where
    S: AsyncRead + Unpin,
{
    let mut port = [0u8; 2];
    read_addr_bytes(stream, &mut port).await?;
    Ok(u16::from_be_bytes(port))
}

/// Send a reply whose bound address is always IPv4 `0.0.0.0:0`.
///
/// Some clients reject replies with ADDRTYPE_NOT_SUPPORTED or exotic bound
/// addresses, so the reply is pinned to the one shape everything accepts.
async fn send_reply<S>(stream: &mut S, reply_code: u8) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let reply = [
        SOCKS5_VERSION,
        reply_code,
        SOCKS5_RESERVED,
        SOCKS5_ADDR_TYPE_IPV4,
        0,
        0,
        0,
        0,
        0,
        0,
    ];
    stream.write_all(&reply).await?;
    stream.flush().await?;

    Ok(())
}

/// Map a dial failure to the closest SOCKS5 reply code.
fn dial_error_reply_code(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            return match io_err.kind() {
                io::ErrorKind::ConnectionRefused => SOCKS5_REPLY_CONNECTION_REFUSED,
                io::ErrorKind::TimedOut | io::ErrorKind::AddrNotAvailable => {
                    SOCKS5_REPLY_HOST_UNREACHABLE
                }
                _ => SOCKS5_REPLY_GENERAL_FAILURE,
            };
        }
    }

    SOCKS5_REPLY_GENERAL_FAILURE
}
