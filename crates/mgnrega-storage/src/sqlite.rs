use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use mgnrega_core::{CanonicalRecord, RecordFilter, StoredRecord};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, Transaction};
use tracing::info;

use crate::engine::{upsert_batch, BatchTransaction};
use crate::{
    like_pattern, Backend, RecordRow, RecordStore, StorageError, UpsertOutcome,
    DISTINCT_DISTRICTS, SELECT_COLUMNS,
};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations/sqlite");

const UPSERT_SQL: &str = r#"
INSERT INTO mgnrega_data (
    fin_year, month, state_code, state_name, district_code, district_name,
    approved_labour_budget, average_wage_rate_per_day_per_person,
    total_households_worked, total_individuals_worked
)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT (fin_year, month, state_code, district_code) DO UPDATE SET
    approved_labour_budget = excluded.approved_labour_budget,
    average_wage_rate_per_day_per_person = excluded.average_wage_rate_per_day_per_person,
    total_households_worked = excluded.total_households_worked,
    total_individuals_worked = excluded.total_individuals_worked
"#;

#[derive(Debug, Clone)]
pub struct SqliteRecordStore {
    pool: SqlitePool,
}

impl SqliteRecordStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let in_memory = is_in_memory(database_url);
        let mut options = SqliteConnectOptions::from_str(database_url)
            .map_err(StorageError::Unavailable)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // An in-memory database lives and dies with its connection, so the
        // pool must hold exactly one and never recycle it.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(max_connections.max(1))
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(StorageError::Unavailable)?;
        Ok(Self { pool })
    }

    /// Private in-memory database with the schema applied.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let store = Self::connect("sqlite::memory:", 1).await?;
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn is_in_memory(database_url: &str) -> bool {
    database_url.contains(":memory:") || database_url.contains("mode=memory")
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    fn backend(&self) -> Backend {
        Backend::Sqlite
    }

    async fn migrate(&self) -> Result<(), StorageError> {
        MIGRATOR.run(&self.pool).await?;
        info!(backend = "sqlite", "schema migrations applied");
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
        upsert_batch(Backend::Sqlite, records, move || async move {
            self.pool.begin().await.map(SqliteBatch)
        })
        .await
    }

    async fn query(&self, filter: &RecordFilter) -> Result<Vec<StoredRecord>, StorageError> {
        // SQLite LIKE has no default escape and folds case for ASCII letters
        // only; Postgres ILIKE folds all of Unicode. Names outside ASCII must
        // match case exactly here.
        let mut builder = QueryBuilder::<Sqlite>::new(SELECT_COLUMNS);
        if let Some(state_name) = filter.state_name() {
            builder
                .push(" AND state_name LIKE ")
                .push_bind(like_pattern(state_name))
                .push(" ESCAPE '\\'");
        }
        if let Some(fin_year) = filter.fin_year() {
            builder.push(" AND fin_year = ").push_bind(fin_year.to_string());
        }
        if let Some(district_name) = filter.district_name() {
            builder
                .push(" AND district_name LIKE ")
                .push_bind(like_pattern(district_name))
                .push(" ESCAPE '\\'");
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

struct SqliteBatch(Transaction<'static, Sqlite>);

#[async_trait]
impl BatchTransaction for SqliteBatch {
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
    use crate::conformance::{self, record};
    use tempfile::tempdir;

    async fn store() -> SqliteRecordStore {
        SqliteRecordStore::in_memory().await.expect("in-memory store")
    }

    #[tokio::test]
    async fn conflict_updates_measures_only() {
        conformance::conflict_updates_measures_only(&store().await).await;
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        conformance::upsert_is_idempotent(&store().await).await;
    }

    #[tokio::test]
    async fn name_filters_fold_ascii_case_only() {
        let store = store().await;
        store
            .upsert(&[record("XX", "Émile Nagar", "D1", "Ōkubo", (1, 1.0, 1, 1))])
            .await
            .expect("seed");

        let by_state = |needle: &str| RecordFilter {
            state_name: Some(needle.into()),
            ..Default::default()
        };
        assert_eq!(store.query(&by_state("ÉMILE")).await.expect("query").len(), 1);
        assert!(store.query(&by_state("émile")).await.expect("query").is_empty());
    }

    #[tokio::test]
    async fn later_in_batch_wins() {
        conformance::later_in_batch_wins(&store().await).await;
    }

    #[tokio::test]
    async fn failed_row_rolls_back_batch() {
        conformance::failed_row_rolls_back_batch(&store().await).await;
    }

    #[tokio::test]
    async fn filters_compose() {
        conformance::filters_compose(&store().await).await;
    }

    #[tokio::test]
    async fn districts_are_sorted_and_distinct() {
        conformance::districts_are_sorted_and_distinct(&store().await).await;
    }

    #[tokio::test]
    async fn empty_batch_is_a_noop() {
        conformance::empty_batch_is_a_noop(&store().await).await;
    }

    #[tokio::test]
    async fn concurrent_batches_never_splice_measures() {
        let store = store().await;
        let a = vec![record("MH", "Maharashtra", "D1", "Pune", (1, 1.0, 1, 1))];
        let b = vec![record("MH", "Maharashtra", "D1", "Pune", (2, 2.0, 2, 2))];

        let (ra, rb) = tokio::join!(store.upsert(&a), store.upsert(&b));
        ra.expect("batch a");
        rb.expect("batch b");

        let rows = store.query(&RecordFilter::default()).await.expect("query");
        assert_eq!(rows.len(), 1);
        let r = &rows[0].record;
        let got = (
            r.approved_labour_budget,
            r.average_wage_rate_per_day_per_person,
            r.total_households_worked,
            r.total_individuals_worked,
        );
        assert!(got == (1, 1.0, 1, 1) || got == (2, 2.0, 2, 2), "spliced: {got:?}");
    }

    #[tokio::test]
    async fn file_database_persists_across_reconnect() {
        let dir = tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("mgnrega.db").display());

        let store = SqliteRecordStore::connect(&url, 2).await.expect("connect");
        store.migrate().await.expect("migrate");
        store
            .upsert(&[record("MH", "Maharashtra", "D1", "Pune", (5, 5.0, 5, 5))])
            .await
            .expect("upsert");
        store.pool().close().await;

        let reopened = SqliteRecordStore::connect(&url, 2).await.expect("reconnect");
        reopened.migrate().await.expect("migrations are re-runnable");
        let rows = reopened.query(&RecordFilter::default()).await.expect("query");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].record.approved_labour_budget, 5);
    }

    #[tokio::test]
    async fn connect_via_trait_object_selects_sqlite() {
        let store = crate::connect("sqlite::memory:", 4).await.expect("connect");
        assert_eq!(store.backend(), Backend::Sqlite);
        store.migrate().await.expect("migrate");
        store.ping().await.expect("ping");
    }
}
