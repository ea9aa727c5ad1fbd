//! Enforcement against the system host-resolution table.
//!
//! Owned entries are tag-scoped lines mapping blocked domains to loopback;
//! everything else in the table is foreign and preserved verbatim. The
//! tagged lines are the sole persisted record of enforcement state.

pub mod error;
pub mod flush;
pub mod table;

pub use {
    error::{Error, Result},
    flush::{FlushOutcome, flush_resolver_cache},
    table::{HostsTable, OWNERSHIP_TAG},
};
