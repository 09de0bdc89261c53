//! Error types for podrelay
//!
//! Domain errors that the routing and dialing layers need to classify.
//! Everything else travels as an [`anyhow::Error`] chain wrapped around
//! these or around transport-level `io::Error`s.

use thiserror::Error;

/// Errors produced by the routing and dialing core.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// The destination address could not be parsed into a Kubernetes target.
    #[error("invalid address {addr:?}: {reason}")]
    InvalidAddress {
        /// The original `host:port` string.
        addr: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The address had a Kubernetes shape but named a cluster that is not
    /// in the router table.
    #[error("cluster {0:?} not found in forwarder table")]
    UnknownCluster(String),

    /// Service resolution found no acceptable endpoint. The message is
    /// matched by the retry classifier, so the wording is load-bearing.
    #[error("no ready pod endpoints found for service {namespace}/{service}")]
    NoReadyPods {
        /// Namespace the service was looked up in.
        namespace: String,
        /// The service name.
        service: String,
    },

    /// The operation was cancelled while waiting, e.g. during a retry
    /// backoff sleep.
    #[error("dial retry cancelled")]
    Cancelled {
        /// The failure that was being retried when cancellation hit.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl ProxyError {
    /// Construct an [`ProxyError::InvalidAddress`] from an address and reason.
    pub fn invalid_address(addr: impl Into<String>, reason: impl Into<String>) -> Self {
        ProxyError::InvalidAddress {
            addr: addr.into(),
            reason: reason.into(),
        }
    }
}
