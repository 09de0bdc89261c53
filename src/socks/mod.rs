//! SOCKS5 front end
//!
//! Thin adapter between RFC 1928 framing and the cluster router. CONNECT
//! only, no authentication; every destination goes through the shared
//! [`Dialer`](crate::kube::Dialer) contract.

mod consts;
mod handler;

pub use consts::*;
pub use handler::{handle_socks5, run_socks5};
