//! vigil — self-imposed network access control for a monitored browsing
//! session.
//!
//! Startup order: logging → privilege probe → config → store → proxy →
//! browser → reconciliation loop. Every exit path clears the owned hosts
//! entries so nothing stays blocked after the process is gone.

use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    process::ExitStatus,
};

use {
    anyhow::{Context, Result},
    clap::Parser,
    tokio::sync::watch,
    tracing::{error, info},
};

use {
    vigil_activity::ActivityStore,
    vigil_daemon::{Daemon, MonitoredBrowser},
    vigil_hosts::HostsTable,
    vigil_policy::PolicyConfig,
    vigil_proxy::ObservingProxy,
};

#[derive(Parser, Debug)]
#[command(version, about = "Block distracting domains for a monitored browsing session")]
struct Args {
    /// Path to the policy config file.
    #[arg(long, env = "VIGIL_CONFIG", default_value = "config.yaml")]
    config: PathBuf,

    /// Do not launch a browser; observe one configured externally to use
    /// the proxy.
    #[arg(long)]
    no_browser: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = PolicyConfig::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;

    // Fail fast on missing privilege instead of failing on every tick.
    HostsTable::new(&config.hosts_path)
        .check_writable()
        .context("hosts table is not writable; re-run with sudo")?;

    let store = ActivityStore::open(&config.activity_db)
        .await
        .context("failed to open activity store")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let proxy_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, config.proxy_port));
    let proxy = ObservingProxy::bind(proxy_addr, store.clone())
        .await
        .with_context(|| format!("failed to bind observing proxy on {proxy_addr}"))?;
    let proxy_task = tokio::spawn({
        let rx = shutdown_rx.clone();
        async move {
            if let Err(e) = proxy.run(rx).await {
                error!(error = %e, "observing proxy failed");
            }
        }
    });

    let mut browser = if args.no_browser {
        None
    } else {
        Some(
            MonitoredBrowser::launch(&config.browser, config.proxy_port)
                .context("failed to launch monitored browser")?,
        )
    };

    let daemon = Daemon::new(config, store);
    let daemon_task = tokio::spawn({
        let daemon = daemon.clone();
        let rx = shutdown_rx.clone();
        async move { daemon.run(rx).await }
    });

    info!("vigil is active; close the browser or press Ctrl-C to stop");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        },
        status = wait_for_browser(&mut browser) => {
            info!(exit = ?status, "monitored browser exited, shutting down");
        },
    }

    // Cleanup runs on every exit path. The loop finishes its in-flight tick
    // before stopping; the final clear is never skipped.
    let _ = shutdown_tx.send(true);
    if let Some(browser) = browser.take() {
        browser.terminate().await;
    }
    let _ = daemon_task.await;
    daemon.shutdown().await;
    let _ = proxy_task.await;

    info!("vigil stopped");
    Ok(())
}

/// Resolves when the monitored browser exits; pends forever without one.
async fn wait_for_browser(browser: &mut Option<MonitoredBrowser>) -> Option<ExitStatus> {
    match browser.as_mut() {
        Some(browser) => browser.wait().await.ok(),
        None => std::future::pending().await,
    }
}
