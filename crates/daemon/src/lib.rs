//! The reconciliation loop: evaluate policy, diff against the enforced set,
//! rewrite the hosts table when they differ, and clear everything on
//! shutdown.

pub mod browser;

use {
    thiserror::Error,
    time::OffsetDateTime,
    tokio::{sync::watch, time::MissedTickBehavior},
    tracing::{debug, error, info, warn},
};

use {
    vigil_activity::ActivityStore,
    vigil_hosts::{FlushOutcome, HostsTable, flush_resolver_cache},
    vigil_policy::{PolicyConfig, evaluate},
};

pub use browser::MonitoredBrowser;

/// What one reconciliation tick did.
#[derive(Debug)]
pub struct TickResult {
    /// Whether the hosts table was rewritten.
    pub changed: bool,
    /// Domains enforced after the tick.
    pub blocked_count: usize,
    /// A failed or degraded tick carries its condition here; the loop keeps
    /// running either way.
    pub error: Option<TickError>,
}

#[derive(Debug, Error)]
pub enum TickError {
    /// The visit store was unreachable; the tick ran with the static
    /// blocklist only.
    #[error("visit store unavailable: {0}")]
    Store(String),

    #[error(transparent)]
    Hosts(#[from] vigil_hosts::Error),
}

impl TickError {
    #[must_use]
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::Hosts(e) if e.is_permission_denied())
    }
}

/// Drives evaluation and enforcement on a fixed interval.
#[derive(Clone)]
pub struct Daemon {
    config: PolicyConfig,
    store: ActivityStore,
    table: HostsTable,
    flush_cache: bool,
}

impl Daemon {
    pub fn new(config: PolicyConfig, store: ActivityStore) -> Self {
        let table = HostsTable::new(&config.hosts_path);
        Self {
            config,
            store,
            table,
            flush_cache: true,
        }
    }

    /// Disable the resolver-cache flush (tests, or hosts without a cache
    /// daemon worth poking).
    #[must_use]
    pub fn with_cache_flush(mut self, enabled: bool) -> Self {
        self.flush_cache = enabled;
        self
    }

    #[must_use]
    pub fn table(&self) -> &HostsTable {
        &self.table
    }

    /// One reconciliation pass.
    ///
    /// The enforced set is recovered by re-parsing the table rather than
    /// from memory, so external edits and restarts are tolerated. Equal
    /// current and desired sets mean no write and no cache flush.
    pub async fn tick(&self) -> TickResult {
        let current = match self.table.enforced() {
            Ok(current) => current,
            Err(e) => {
                return TickResult {
                    changed: false,
                    blocked_count: 0,
                    error: Some(e.into()),
                };
            },
        };

        let evaluation = evaluate(&self.config, &self.store, OffsetDateTime::now_utc()).await;
        let store_error = evaluation.store_error.map(TickError::Store);
        let desired = evaluation.domains;

        if current == desired {
            return TickResult {
                changed: false,
                blocked_count: current.len(),
                error: store_error,
            };
        }

        info!(
            current = current.len(),
            desired = desired.len(),
            "blocklist changed, updating hosts table"
        );
        match self.table.reconcile(&desired) {
            Ok(blocked_count) => {
                if self.flush_cache {
                    flush_resolver_cache().await;
                }
                TickResult {
                    changed: true,
                    blocked_count,
                    error: store_error,
                }
            },
            Err(e) => TickResult {
                changed: false,
                blocked_count: current.len(),
                error: Some(e.into()),
            },
        }
    }

    /// Tick on the configured interval until `shutdown` flips.
    ///
    /// Ticks are strictly sequential and never overlap; the only
    /// cancellation point is between ticks, so an in-progress reconcile
    /// always completes before shutdown is honored.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.evaluation_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let result = self.tick().await;
                    match &result.error {
                        Some(e) if e.is_permission_denied() => {
                            error!(error = %e, "tick failed; blocks cannot be enforced until re-launched with privilege");
                        },
                        Some(e) => warn!(error = %e, "tick degraded"),
                        None => debug!(
                            changed = result.changed,
                            blocked = result.blocked_count,
                            "tick complete"
                        ),
                    }
                },
                _ = shutdown_changed(&shutdown) => {
                    info!("reconciliation loop stopping");
                    break;
                },
            }
        }
    }

    /// Final cleanup: remove every owned entry so no block outlives the
    /// process. Runs on every shutdown path and is never cancelled.
    pub async fn shutdown(&self) {
        match self.table.clear_all() {
            Ok(()) => {
                info!("all owned hosts entries removed");
                if self.flush_cache && flush_resolver_cache().await == FlushOutcome::Unavailable {
                    debug!("resolver cache not flushed on shutdown");
                }
            },
            Err(e) => error!(error = %e, "failed to clear hosts entries on shutdown"),
        }
    }
}

async fn shutdown_changed(rx: &watch::Receiver<bool>) {
    let mut rx = rx.clone();
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
