//! podrelay — local SOCKS5 + HTTP proxy into Kubernetes clusters
//!
//! Startup wiring: configuration, kubeconfig discovery, per-cluster client
//! construction, and the three listeners (SOCKS5, HTTP, PAC). A single
//! cancellation token fans the shutdown signal out to everything.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use podrelay::config;
use podrelay::http::{run_http_proxy, HttpProxy};
use podrelay::kube::{new_cluster_client, ClusterRouter, Dialer, PortForwarder};
use podrelay::pac::{run_pac, PacConfig};
use podrelay::socks::run_socks5;

/// Local SOCKS5 + HTTP proxy that tunnels cluster-suffixed destinations
/// through Kubernetes port-forwards.
#[derive(Parser, Debug)]
#[command(name = "podrelay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("podrelay: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let cfg = config::load_config(&args.config)?;
    config::setup_logging(&cfg.log)?;

    info!(
        version = podrelay::VERSION,
        config = %args.config.display(),
        "starting podrelay"
    );

    let clusters = config::resolve_kubeconfigs(&cfg)?;
    config::validate_clusters(&clusters)?;

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    // a cluster whose client cannot be built is skipped; only an empty
    // table is fatal
    let mut forwarders = HashMap::with_capacity(clusters.len());

    for cluster in &clusters {
        match new_cluster_client(&cluster.kubeconfig, &cluster.context).await {
            Ok(client) => {
                forwarders.insert(
                    cluster.name.clone(),
                    PortForwarder::new(client, cluster.name.clone(), cluster.namespace.clone()),
                );
            }
            Err(err) => {
                warn!(
                    cluster = %cluster.name,
                    error = format!("{err:#}"),
                    "skipping cluster due to client error"
                );
            }
        }
    }

    if forwarders.is_empty() {
        bail!("no usable clusters found");
    }

    let router = Arc::new(ClusterRouter::new(forwarders));
    let mut servers = Vec::new();

    let socks_listener = TcpListener::bind(&cfg.listen_address)
        .await
        .with_context(|| format!("binding socks5 listener on {}", cfg.listen_address))?;

    info!(addr = %cfg.listen_address, "starting socks5 proxy server");
    {
        let dialer: Arc<dyn Dialer> = Arc::clone(&router) as Arc<dyn Dialer>;
        let cancel = cancel.clone();
        servers.push(tokio::spawn(async move {
            if let Err(err) = run_socks5(socks_listener, dialer, cancel.clone()).await {
                error!(error = format!("{err:#}"), "socks5 server failed");
                cancel.cancel();
            }
        }));
    }

    if !cfg.http_listen_address.is_empty() {
        let listener = TcpListener::bind(&cfg.http_listen_address)
            .await
            .with_context(|| format!("binding http listener on {}", cfg.http_listen_address))?;

        info!(addr = %cfg.http_listen_address, "starting http proxy server");

        let dialer: Arc<dyn Dialer> = Arc::clone(&router) as Arc<dyn Dialer>;
        let proxy = Arc::new(HttpProxy::new(dialer, cancel.clone()));
        let cancel = cancel.clone();
        servers.push(tokio::spawn(async move {
            if let Err(err) = run_http_proxy(listener, proxy, cancel.clone()).await {
                error!(error = format!("{err:#}"), "http proxy server failed");
                cancel.cancel();
            }
        }));
    }

    if !cfg.pac_listen_address.is_empty() {
        let listener = TcpListener::bind(&cfg.pac_listen_address)
            .await
            .with_context(|| format!("binding pac listener on {}", cfg.pac_listen_address))?;

        let pac = Arc::new(PacConfig {
            clusters: router.cluster_names(),
            socks_address: cfg.listen_address.clone(),
            http_address: (!cfg.http_listen_address.is_empty())
                .then(|| cfg.http_listen_address.clone()),
        });

        info!(
            addr = %cfg.pac_listen_address,
            clusters = ?pac.clusters,
            "starting proxy auto-configuration server"
        );

        let cancel = cancel.clone();
        servers.push(tokio::spawn(async move {
            if let Err(err) = run_pac(listener, pac, cancel.clone()).await {
                error!(error = format!("{err:#}"), "pac server failed");
                cancel.cancel();
            }
        }));
    }

    cancel.cancelled().await;
    info!("shutting down");

    for server in servers {
        let _ = server.await;
    }

    Ok(())
}

/// Cancel the root token on SIGINT or SIGTERM (Ctrl+C only on non-unix).
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut sigterm =
                signal(SignalKind::terminate()).expect("failed to set up SIGTERM handler");

            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
                _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("received Ctrl+C, shutting down");
        }

        cancel.cancel();
    });
}
