//! # podrelay — Kubernetes pod proxy
//!
//! podrelay is a local dual-protocol proxy (SOCKS5 + HTTP) that routes
//! connections whose destination hostname names a Kubernetes cluster
//! through an API-server port-forward to the right pod, and passes all
//! other traffic through as plain TCP.
//!
//! A client addresses `<service>.<cluster>:<port>` or
//! `<pod>.<service>.<namespace>.<cluster>:<port>` and transparently gets a
//! byte stream to the pod, across any number of clusters discovered from
//! kubeconfig files.
//!
//! ## Architecture
//!
//! ```text
//! client ──► SOCKS5 / HTTP front end ──► ClusterRouter
//!                                            │
//!                             known cluster? ├── no ──► direct TCP
//!                                            └── yes ─► PortForwarder
//!                                                         resolve service → pod
//!                                                         port-forward dial (retries)
//!                                                         StreamConn ◄── relay ──► client
//! ```
//!
//! Both front ends funnel every connection attempt through the same
//! [`Dialer`](kube::Dialer) contract, so routing behaves identically for
//! SOCKS5 and HTTP and tests can swap the router out.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod http;
pub mod kube;
pub mod pac;
pub mod relay;
pub mod socks;

pub use error::ProxyError;
pub use kube::{ClusterRouter, Dialer};

/// Version of the podrelay crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application.
pub const NAME: &str = env!("CARGO_PKG_NAME");
