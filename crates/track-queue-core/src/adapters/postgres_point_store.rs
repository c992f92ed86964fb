//! # PostgreSQL Point Store
//!
//! Production [`PointStore`] backed by sqlx. Expects parent tables with an
//! `id BIGINT` primary key and target tables shaped as
//!
//! ```sql
//! CREATE TABLE track_points (
//!     owner_id    BIGINT           NOT NULL REFERENCES tracks (id),
//!     latitude    DOUBLE PRECISION NOT NULL,
//!     longitude   DOUBLE PRECISION NOT NULL,
//!     recorded_at TIMESTAMPTZ      NOT NULL,
//!     elevation   DOUBLE PRECISION,
//!     device_tag  TEXT,
//!     UNIQUE (owner_id, latitude, longitude, recorded_at)
//! );
//! ```

use crate::error::PersistenceError;
use crate::persistence::{PointStore, UpsertOutcome};
use crate::{OwnerId, PointRecord, QueueType};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, error};

/// Rows per INSERT statement; keeps bind parameters well under the protocol limit
const INSERT_CHUNK_SIZE: usize = 1000;

/// PostgreSQL point store
///
/// # Examples
///
/// ```no_run
/// use track_queue_core::adapters::PostgresPointStore;
/// use std::time::Duration;
/// # async fn example() -> Result<(), track_queue_core::PersistenceError> {
/// let store = PostgresPointStore::connect(
///     "postgres://localhost/tracks",
///     10,
///     Duration::from_secs(5),
/// )
/// .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PostgresPointStore {
    pool: PgPool,
}

impl std::fmt::Debug for PostgresPointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresPointStore")
            .field("pool", &"<PgPool>")
            .finish()
    }
}

impl PostgresPointStore {
    /// Create a store over an existing connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a connection pool against `database_url`
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, PersistenceError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        Ok(Self::new(pool))
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl PointStore for PostgresPointStore {
    async fn exists_batch(
        &self,
        queue_type: QueueType,
        owners: &[OwnerId],
    ) -> Result<HashSet<OwnerId>, PersistenceError> {
        let Some(table) = queue_type.parent_table() else {
            return Ok(owners.iter().copied().collect());
        };
        if owners.is_empty() {
            return Ok(HashSet::new());
        }

        let ids: Vec<i64> = owners.iter().map(OwnerId::as_i64).collect();
        let sql = format!("SELECT id FROM {} WHERE id = ANY($1)", table);

        let found: Vec<i64> = sqlx::query_scalar(&sql)
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("exists_batch", e))?;

        Ok(found.into_iter().map(OwnerId::new).collect())
    }

    async fn upsert_batch(
        &self,
        queue_type: QueueType,
        points: &[PointRecord],
    ) -> Result<UpsertOutcome, PersistenceError> {
        let table = queue_type.target_table();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        let mut inserted = 0usize;
        for chunk in points.chunks(INSERT_CHUNK_SIZE) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {} (owner_id, latitude, longitude, recorded_at, elevation, device_tag) ",
                table
            ));
            builder.push_values(chunk, |mut row, point| {
                row.push_bind(point.owner.as_i64())
                    .push_bind(point.position.latitude)
                    .push_bind(point.position.longitude)
                    .push_bind(*point.recorded_at.as_datetime())
                    .push_bind(point.elevation)
                    .push_bind(point.device_tag.clone());
            });
            builder.push(" ON CONFLICT (owner_id, latitude, longitude, recorded_at) DO NOTHING");

            let result = builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("upsert_batch", e))?;
            inserted += result.rows_affected() as usize;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;

        let outcome = UpsertOutcome {
            inserted,
            skipped: points.len().saturating_sub(inserted),
        };
        debug!(
            table = table,
            inserted = outcome.inserted,
            skipped = outcome.skipped,
            "Upserted points"
        );
        Ok(outcome)
    }
}

/// Classify a sqlx error
///
/// SQLSTATE class 22 (data exception) and 23 (integrity constraint
/// violation) mean the rows themselves are unacceptable. Everything else is
/// treated as a connectivity problem.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> PersistenceError {
    match err {
        sqlx::Error::Database(db_err) => {
            let message = format!("database error in {}: {}", operation, db_err.message());
            let structural = db_err
                .code()
                .is_some_and(|code| code.starts_with("22") || code.starts_with("23"));

            if structural {
                PersistenceError::Structural { message }
            } else {
                error!(operation = operation, error = %message, "Point store query failed");
                PersistenceError::Unavailable { message }
            }
        }
        sqlx::Error::Encode(e) => PersistenceError::Structural {
            message: format!("failed to encode row in {}: {}", operation, e),
        },
        other => {
            error!(operation = operation, error = %other, "Point store unavailable");
            PersistenceError::Unavailable {
                message: format!("sqlx error in {}: {}", operation, other),
            }
        }
    }
}
