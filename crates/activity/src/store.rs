//! SQLite visit store: the recorder appends, the evaluator counts.

use std::{collections::HashMap, path::Path};

use {
    async_trait::async_trait,
    sqlx::{
        Row,
        sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions},
    },
    time::OffsetDateTime,
    tracing::debug,
};

use crate::error::Result;

/// Read access to the visit history.
///
/// The evaluator depends on this trait rather than on the concrete store so
/// tests can inject fixed counts or a failing backend.
#[async_trait]
pub trait VisitSource: Send + Sync {
    /// Per-domain count of visits recorded strictly after `cutoff`.
    async fn count_visits_since(&self, cutoff: OffsetDateTime) -> Result<HashMap<String, u64>>;
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS visits (
    id INTEGER PRIMARY KEY,
    timestamp INTEGER NOT NULL,
    domain TEXT NOT NULL
)";

/// Append-only visit store. Rows are never updated or deleted here; log
/// rotation is an external concern.
#[derive(Clone)]
pub struct ActivityStore {
    pool: SqlitePool,
}

impl ActivityStore {
    /// Open the store at `path`, creating the database and schema if missing.
    ///
    /// WAL mode lets the recorder append while an evaluation is reading,
    /// without either side taking an exclusive lock.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        sqlx::query(SCHEMA).execute(&pool).await?;
        debug!(path = %path.display(), "activity store ready");
        Ok(Self { pool })
    }

    /// Append one visit record.
    pub async fn record_visit(&self, domain: &str, at: OffsetDateTime) -> Result<()> {
        sqlx::query("INSERT INTO visits (timestamp, domain) VALUES (?1, ?2)")
            .bind(at.unix_timestamp())
            .bind(domain)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl VisitSource for ActivityStore {
    async fn count_visits_since(&self, cutoff: OffsetDateTime) -> Result<HashMap<String, u64>> {
        let rows = sqlx::query(
            "SELECT domain, COUNT(id) AS visits FROM visits WHERE timestamp > ?1 GROUP BY domain",
        )
        .bind(cutoff.unix_timestamp())
        .fetch_all(&self.pool)
        .await?;

        let mut counts = HashMap::with_capacity(rows.len());
        for row in rows {
            let domain: String = row.try_get("domain")?;
            let visits: i64 = row.try_get("visits")?;
            counts.insert(domain, u64::try_from(visits).unwrap_or(0));
        }
        Ok(counts)
    }
}
