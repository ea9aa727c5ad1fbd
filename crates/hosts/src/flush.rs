//! Best-effort invalidation of the local resolver cache.

use std::time::Duration;

use {
    tokio::process::Command,
    tracing::{info, warn},
};

/// Flush tools probed in order, with the invocation each expects;
/// `resolvectl` superseded `systemd-resolve`.
const FLUSH_TOOLS: [(&str, &str); 2] = [
    ("resolvectl", "flush-caches"),
    ("systemd-resolve", "--flush-caches"),
];

/// A hung cache daemon must not stall the reconciliation loop.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a resolver-cache flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The cache daemon acknowledged the flush.
    Flushed,
    /// No tool installed, the tool failed, or it timed out. Recently applied
    /// blocks may not take effect until the cache expires or the browser
    /// restarts.
    Unavailable,
}

/// Flush the resolver cache if a known tool is installed.
///
/// Never an error: absence or failure degrades to [`FlushOutcome::Unavailable`]
/// with a warning.
pub async fn flush_resolver_cache() -> FlushOutcome {
    let Some((tool, arg)) = FLUSH_TOOLS
        .iter()
        .find_map(|(name, arg)| which::which(name).ok().map(|path| (path, *arg)))
    else {
        warn!("no resolver cache flush tool found, new blocks may require a browser restart");
        return FlushOutcome::Unavailable;
    };

    let invocation = Command::new(&tool).arg(arg).output();
    match tokio::time::timeout(FLUSH_TIMEOUT, invocation).await {
        Ok(Ok(output)) if output.status.success() => {
            info!(tool = %tool.display(), "resolver cache flushed");
            FlushOutcome::Flushed
        },
        Ok(Ok(output)) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                tool = %tool.display(),
                error = %stderr.trim(),
                "resolver cache flush failed, blocks may require a browser restart"
            );
            FlushOutcome::Unavailable
        },
        Ok(Err(e)) => {
            warn!(tool = %tool.display(), error = %e, "failed to invoke resolver cache flush");
            FlushOutcome::Unavailable
        },
        Err(_) => {
            warn!(
                tool = %tool.display(),
                timeout_secs = FLUSH_TIMEOUT.as_secs(),
                "resolver cache flush timed out"
            );
            FlushOutcome::Unavailable
        },
    }
}
