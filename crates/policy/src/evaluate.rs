//! The rule evaluator: activity history + policy config in, desired block
//! set out. No side effects and no store mutation; wall-clock `now` is a
//! parameter so results are deterministic given their inputs.

use std::collections::BTreeSet;

use {
    time::OffsetDateTime,
    tracing::{debug, warn},
};

use {crate::config::PolicyConfig, vigil_activity::VisitSource};

/// Outcome of one policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    /// Domains policy says should be blocked right now.
    pub domains: BTreeSet<String>,
    /// Set when the visit store could not be queried and the result degraded
    /// to the static blocklist only.
    pub store_error: Option<String>,
}

impl Evaluation {
    fn of(domains: BTreeSet<String>) -> Self {
        Self {
            domains,
            store_error: None,
        }
    }
}

/// Compute the desired block set as of `now`.
///
/// Seeds with the static blocklist; when the dynamic rule is enabled, adds
/// every domain whose visit count within the trailing window strictly
/// exceeds the configured threshold. A store failure is not fatal: the
/// static seed is returned and the condition carried for the caller to log.
pub async fn evaluate(
    config: &PolicyConfig,
    source: &dyn VisitSource,
    now: OffsetDateTime,
) -> Evaluation {
    let mut domains = config.static_set();

    if !config.dynamic_rule.enabled {
        return Evaluation::of(domains);
    }

    let cutoff = now - config.time_window();
    let counts = match source.count_visits_since(cutoff).await {
        Ok(counts) => counts,
        Err(e) => {
            warn!(error = %e, "visit store unavailable, using static blocklist only");
            return Evaluation {
                domains,
                store_error: Some(e.to_string()),
            };
        },
    };

    let threshold = config.dynamic_rule.visit_count;
    for (domain, count) in counts {
        // Strictly more than the threshold trips the rule; exactly at it
        // does not.
        if count > threshold {
            debug!(domain = %domain, count, threshold, "dynamic rule tripped");
            domains.insert(domain);
        }
    }

    Evaluation::of(domains)
}
