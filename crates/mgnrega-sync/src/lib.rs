//! Ingestion pipeline orchestration: fetch, normalize, transactional upsert.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use mgnrega_adapters::{DataGovClient, DataGovConfig, RecordSource};
use mgnrega_core::{normalize, CanonicalRecord};
use mgnrega_storage::{RecordStore, StorageError};
use secrecy::SecretString;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mgnrega-sync";

pub const NO_DATA_MESSAGE: &str = "No data found";

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub api_url: Option<String>,
    pub api_key: Option<SecretString>,
    pub fetch_offset: u32,
    pub fetch_limit: u32,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub port: u16,
}

impl IngestConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key/value lookup; unparsable numbers fall
    /// back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let number = |key: &str| non_empty(key).and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            database_url: non_empty("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://mgnrega.db".to_string()),
            database_max_connections: number("DATABASE_MAX_CONNECTIONS")
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(5),
            api_url: non_empty("MGNREGA_API_URL"),
            api_key: non_empty("MGNREGA_API_KEY").map(SecretString::from),
            fetch_offset: number("MGNREGA_FETCH_OFFSET")
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(0),
            fetch_limit: number("MGNREGA_FETCH_LIMIT")
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(mgnrega_adapters::DEFAULT_FETCH_LIMIT),
            http_timeout_secs: number("MGNREGA_HTTP_TIMEOUT_SECS").unwrap_or(20),
            user_agent: non_empty("MGNREGA_USER_AGENT")
                .unwrap_or_else(|| "mgnrega-ingest/0.1".to_string()),
            port: number("PORT")
                .and_then(|v| u16::try_from(v).ok())
                .unwrap_or(5002),
        }
    }

    pub fn data_gov_config(&self) -> Result<DataGovConfig> {
        let endpoint = self
            .api_url
            .clone()
            .context("MGNREGA_API_URL is not set")?;
        Ok(DataGovConfig {
            api_key: self.api_key.clone(),
            offset: self.fetch_offset,
            limit: self.fetch_limit,
            timeout: Duration::from_secs(self.http_timeout_secs.max(1)),
            user_agent: Some(self.user_agent.clone()),
            ..DataGovConfig::new(endpoint)
        })
    }
}

fn load_dotenv_if_applicable() {
    let allowed = cfg!(debug_assertions)
        || std::env::var("ALLOW_DOTENV")
            .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
            .unwrap_or(false);
    if !allowed {
        return;
    }
    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("ingestion aborted, no rows applied: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub run_id: Uuid,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched: usize,
    pub written: usize,
}

impl IngestSummary {
    pub fn message(&self) -> String {
        if self.fetched == 0 {
            NO_DATA_MESSAGE.to_string()
        } else {
            format!("{} rows inserted/updated.", self.written)
        }
    }
}

/// Fetch -> normalize -> upsert, with injected source and store handles.
#[derive(Clone)]
pub struct IngestPipeline {
    source: Arc<dyn RecordSource>,
    store: Arc<dyn RecordStore>,
}

impl IngestPipeline {
    pub fn new(source: Arc<dyn RecordSource>, store: Arc<dyn RecordStore>) -> Self {
        Self { source, store }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Runs one cycle and returns once the whole batch has committed. An
    /// unreachable upstream is not an error; a storage failure is, and leaves
    /// nothing applied.
    pub async fn run_once(&self) -> Result<IngestSummary, IngestError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let source_id = self.source.source_id().to_string();
        let span = info_span!("ingest_run", %run_id, source_id = %source_id);

        async move {
            let raw = self.source.fetch_raw().await;
            let records: Vec<CanonicalRecord> = raw.iter().map(normalize).collect();

            let written = if records.is_empty() {
                info!("no records to ingest");
                0
            } else {
                match self.store.upsert(&records).await {
                    Ok(outcome) => outcome.written,
                    Err(err) => {
                        error!(error = %err, batch = records.len(), "ingestion batch failed");
                        return Err(IngestError::Storage(err));
                    }
                }
            };

            let summary = IngestSummary {
                run_id,
                source_id,
                started_at,
                finished_at: Utc::now(),
                fetched: records.len(),
                written,
            };
            info!(fetched = summary.fetched, written = summary.written, "ingestion complete");
            Ok(summary)
        }
        .instrument(span)
        .await
    }
}

/// Connects the configured store and applies pending migrations.
pub async fn connect_store(config: &IngestConfig) -> Result<Arc<dyn RecordStore>> {
    let store = mgnrega_storage::connect(&config.database_url, config.database_max_connections)
        .await
        .context("connecting record store")?;
    store.migrate().await.context("applying schema migrations")?;
    Ok(store)
}

pub fn live_source(config: &IngestConfig) -> Result<Arc<dyn RecordSource>> {
    let client = DataGovClient::new(config.data_gov_config()?)?;
    Ok(Arc::new(client))
}

pub async fn run_ingest_once_from_env() -> Result<IngestSummary> {
    let config = IngestConfig::from_env();
    let source = live_source(&config)?;
    run_ingest_once(&config, source).await
}

pub async fn run_ingest_once(
    config: &IngestConfig,
    source: Arc<dyn RecordSource>,
) -> Result<IngestSummary> {
    let store = connect_store(config).await?;
    let pipeline = IngestPipeline::new(source, store);
    Ok(pipeline.run_once().await?)
}
