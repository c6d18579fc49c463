use std::time::Duration;

use async_trait::async_trait;
use mgnrega_core::{CanonicalRecord, RecordFilter, StoredRecord};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder, Transaction};
use tracing::info;

use crate::engine::{upsert_batch, BatchTransaction};
use crate::{
    like_pattern, Backend, RecordRow, RecordStore, StorageError, UpsertOutcome,
    DISTINCT_DISTRICTS, SELECT_COLUMNS,
};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations/postgres");

// Row-level locking on the conflicting key makes concurrent batches resolve
// to last-commit-wins under the default READ COMMITTED isolation.
const UPSERT_SQL: &str = r#"
INSERT INTO mgnrega_data (
    fin_year, month, state_code, state_name, district_code, district_name,
    approved_labour_budget, average_wage_rate_per_day_per_person,
    total_households_worked, total_individuals_worked
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
ON CONFLICT (fin_year, month, state_code, district_code) DO UPDATE SET
    approved_labour_budget = EXCLUDED.approved_labour_budget,
    average_wage_rate_per_day_per_person = EXCLUDED.average_wage_rate_per_day_per_person,
    total_households_worked = EXCLUDED.total_households_worked,
    total_individuals_worked = EXCLUDED.total_individuals_worked
"#;

#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(StorageError::Unavailable)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    fn backend(&self) -> Backend {
        Backend::Postgres
    }

    async fn migrate(&self) -> Result<(), StorageError> {
        MIGRATOR.run(&self.pool).await?;
        info!(backend = "postgres", "schema migrations applied");
        Ok(())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(StorageError::Unavailable)?;
        Ok(())
    }

    async fn upsert(&self, records: &[CanonicalRecord]) -> Result<UpsertOutcome, StorageError> {
        upsert_batch(Backend::Postgres, records, move || async move {
            self.pool.begin().await.map(PgBatch)
        })
        .await
    }

    async fn query(&self, filter: &RecordFilter) -> Result<Vec<StoredRecord>, StorageError> {
        let mut builder = QueryBuilder::<Postgres>::new(SELECT_COLUMNS);
        if let Some(state_name) = filter.state_name() {
            builder
                .push(" AND state_name ILIKE ")
                .push_bind(like_pattern(state_name));
        }
        if let Some(fin_year) = filter.fin_year() {
            builder.push(" AND fin_year = ").push_bind(fin_year.to_string());
        }
        if let Some(district_name) = filter.district_name() {
            builder
                .push(" AND district_name ILIKE ")
                .push_bind(like_pattern(district_name));
        }
        builder.push(" ORDER BY id");

        let rows = builder
            .build_query_as::<RecordRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(StorageError::Unavailable)?;
        Ok(rows.into_iter().map(StoredRecord::from).collect())
    }

    async fn distinct_districts(&self) -> Result<Vec<String>, StorageError> {
        sqlx::query_scalar::<_, String>(DISTINCT_DISTRICTS)
            .fetch_all(&self.pool)
            .await
            .map_err(StorageError::Unavailable)
    }
}

struct PgBatch(Transaction<'static, Postgres>);

#[async_trait]
impl BatchTransaction for PgBatch {
    async fn apply(&mut self, record: &CanonicalRecord) -> Result<(), sqlx::Error> {
        sqlx::query(UPSERT_SQL)
            .bind(&record.fin_year)
            .bind(&record.month)
            .bind(&record.state_code)
            .bind(&record.state_name)
            .bind(&record.district_code)
            .bind(&record.district_name)
            .bind(record.approved_labour_budget)
            .bind(record.average_wage_rate_per_day_per_person)
            .bind(record.total_households_worked)
            .bind(record.total_individuals_worked)
            .execute(&mut *self.0)
            .await?;
        Ok(())
    }

    async fn commit(self) -> Result<(), sqlx::Error> {
        self.0.commit().await
    }

    async fn rollback(self) -> Result<(), sqlx::Error> {
        self.0.rollback().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conformance;

    /// Runs the shared adapter checks against a live server when
    /// `MGNREGA_TEST_DATABASE_URL` points at a disposable Postgres database.
    #[tokio::test]
    async fn conformance_against_live_postgres() {
        let Ok(url) = std::env::var("MGNREGA_TEST_DATABASE_URL") else {
            eprintln!("MGNREGA_TEST_DATABASE_URL not set; skipping postgres conformance");
            return;
        };
        let store = PgRecordStore::connect(&url, 2).await.expect("connect");
        store.migrate().await.expect("migrate");
        store.ping().await.expect("ping");

        async fn reset(store: &PgRecordStore) {
            sqlx::query("TRUNCATE mgnrega_data RESTART IDENTITY")
                .execute(store.pool())
                .await
                .expect("truncate");
        }

        reset(&store).await;
        conformance::conflict_updates_measures_only(&store).await;
        reset(&store).await;
        conformance::upsert_is_idempotent(&store).await;
        reset(&store).await;
        conformance::later_in_batch_wins(&store).await;
        reset(&store).await;
        conformance::failed_row_rolls_back_batch(&store).await;
        reset(&store).await;
        conformance::filters_compose(&store).await;
        reset(&store).await;
        conformance::districts_are_sorted_and_distinct(&store).await;
        reset(&store).await;
        conformance::empty_batch_is_a_noop(&store).await;
        reset(&store).await;
    }
}
