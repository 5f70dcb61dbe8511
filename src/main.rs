//! git-auth-proxy - authenticating reverse proxy for Git hosting providers

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use git_auth_proxy::auth::Authorizer;
use git_auth_proxy::config::Configuration;
use git_auth_proxy::server::{self, ProxyState};
use git_auth_proxy::token_writer::TokenWriter;
use git_auth_proxy::{metrics, Error};

/// Upper bound on the graceful shutdown drain window
const DRAIN_WINDOW: Duration = Duration::from_secs(30);

/// Authenticating reverse proxy for Azure DevOps and GitHub
#[derive(Parser, Debug)]
#[command(name = "git-auth-proxy", version, about, long_about = None)]
struct Cli {
    /// Proxy listener address
    #[arg(long, default_value = "0.0.0.0:8080")]
    addr: SocketAddr,

    /// Metrics listener address
    #[arg(long, default_value = "0.0.0.0:9090")]
    metrics_addr: SocketAddr,

    /// Path to the configuration file
    #[arg(long)]
    config: PathBuf,

    /// Path to a kubeconfig file; uses in-cluster configuration when unset
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    info!(path = %cli.config.display(), "reading configuration file");
    let config = Configuration::load(&cli.config).context("failed loading configuration")?;
    let authorizer = Arc::new(Authorizer::new(&config).context("could not build authorizer")?);

    let client = kube_client(cli.kubeconfig.as_deref())
        .await
        .context("could not create kubernetes client")?;

    let shutdown = CancellationToken::new();
    let mut tasks: JoinSet<Result<(), Error>> = JoinSet::new();

    let state = Arc::new(ProxyState::new(authorizer.clone())?);
    {
        let shutdown = shutdown.clone();
        let addr = cli.addr;
        tasks.spawn(async move {
            server::serve(addr, state, shutdown).await.inspect_err(|e| {
                error!(error = %e, "proxy server failed");
            })
        });
    }
    {
        let shutdown = shutdown.clone();
        let addr = cli.metrics_addr;
        tasks.spawn(async move {
            metrics::serve(addr, shutdown).await.inspect_err(|e| {
                error!(error = %e, "metrics server failed");
            })
        });
    }
    {
        let shutdown = shutdown.clone();
        let writer = TokenWriter::new(client, authorizer);
        tasks.spawn(async move {
            writer.run(shutdown).await.inspect_err(|e| {
                error!(error = %e, "token writer failed");
            })
        });
    }

    let mut failed = false;
    tokio::select! {
        _ = wait_for_signal() => info!("shutdown signal received"),
        // Long-lived tasks only return once cancelled; an early exit,
        // clean or not, takes the whole group down
        res = tasks.join_next() => {
            failed = !matches!(res, Some(Ok(Ok(()))));
            warn!("task exited early, shutting down");
        }
    }

    shutdown.cancel();
    let drain = tokio::time::timeout(DRAIN_WINDOW, async {
        while let Some(res) = tasks.join_next().await {
            if !matches!(res, Ok(Ok(()))) {
                failed = true;
            }
        }
    });
    if drain.await.is_err() {
        warn!("drain window elapsed before all tasks stopped");
        tasks.abort_all();
    }

    if failed {
        anyhow::bail!("shut down after task failure");
    }
    info!("exited gracefully");
    Ok(())
}

/// Build a cluster client, from an explicit kubeconfig when given.
async fn kube_client(kubeconfig: Option<&Path>) -> anyhow::Result<Client> {
    match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)?;
            let config =
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
            Ok(Client::try_from(config)?)
        }
        None => Ok(Client::try_default().await?),
    }
}

/// Wait for SIGINT or SIGTERM.
async fn wait_for_signal() {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(signal) => signal,
        Err(e) => {
            error!(error = %e, "could not install SIGTERM handler");
            std::future::pending::<()>().await;
            unreachable!();
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
