//! Supervision of the monitored browser process.

use {
    tokio::process::{Child, Command},
    tracing::{debug, info, warn},
};

use vigil_policy::BrowserConfig;

/// The browser whose traffic is being observed.
///
/// Spawned pointed at the observing proxy; its exit is a shutdown trigger
/// for the whole daemon.
pub struct MonitoredBrowser {
    child: Child,
    command: String,
}

impl MonitoredBrowser {
    /// Spawn the configured browser wired to the proxy.
    pub fn launch(config: &BrowserConfig, proxy_port: u16) -> std::io::Result<Self> {
        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .arg(format!("--proxy-server=http://127.0.0.1:{proxy_port}"))
            .arg("--no-first-run")
            .kill_on_drop(true);

        let child = command.spawn()?;
        info!(command = %config.command, proxy_port, "monitored browser launched");
        Ok(Self {
            child,
            command: config.command.clone(),
        })
    }

    /// Resolves when the browser exits.
    pub async fn wait(&mut self) -> std::io::Result<std::process::ExitStatus> {
        self.child.wait().await
    }

    /// Terminate the browser if it is still running.
    pub async fn terminate(mut self) {
        match self.child.kill().await {
            Ok(()) => debug!(command = %self.command, "monitored browser terminated"),
            Err(e) => warn!(command = %self.command, error = %e, "failed to terminate browser"),
        }
    }
}
