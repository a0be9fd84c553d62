//! Persistence collaborator contracts, checkpoint store, and HTTP fetch
//! utilities for the CVE history importer.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use cvehist_core::{Checkpoint, HistoryRecord};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Mutex;

mod postgres;

pub use postgres::PgHistoryStore;

pub const CRATE_NAME: &str = "cvehist-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("duplicate change id: {0}")]
    DuplicateKey(String),
    #[error("checkpoint {name} cannot move backwards from {current} to {requested}")]
    CheckpointRegression {
        name: String,
        current: u64,
        requested: u64,
    },
    #[error("stored value out of range: {0}")]
    OutOfRange(String),
    #[error("{0}")]
    Backend(String),
}

/// Storage the ingestion core writes into.
///
/// A single writer per checkpoint name is assumed; nothing here locks the
/// checkpoint row against a second concurrent run.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Open a unit of work. Dropping it without `commit` discards every
    /// write made through it.
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError>;

    async fn load_checkpoint(&self, name: &str) -> Result<Option<Checkpoint>, StoreError>;

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError>;
}

/// Scoped transaction over the history table.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Subset of `candidates` already present, including rows inserted
    /// earlier in this unit of work.
    async fn find_existing_ids(
        &mut self,
        candidates: &HashSet<String>,
    ) -> Result<HashSet<String>, StoreError>;

    /// Insert all records or none of them.
    async fn bulk_insert(&mut self, records: &[HistoryRecord]) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Named progress markers layered over a [`HistoryStore`].
pub struct CheckpointStore<'a> {
    store: &'a dyn HistoryStore,
}

impl<'a> CheckpointStore<'a> {
    pub fn new(store: &'a dyn HistoryStore) -> Self {
        Self { store }
    }

    /// Existing checkpoint for `name`, or a new one persisted at offset 0.
    pub async fn load(&self, name: &str) -> Result<Checkpoint, StoreError> {
        if let Some(checkpoint) = self.store.load_checkpoint(name).await? {
            return Ok(checkpoint);
        }
        let checkpoint = Checkpoint::fresh(name);
        self.store.save_checkpoint(&checkpoint).await?;
        Ok(checkpoint)
    }

    pub async fn reset(&self, checkpoint: &mut Checkpoint) -> Result<(), StoreError> {
        let mut next = checkpoint.clone();
        next.next_index = 0;
        next.total = None;
        self.persist(checkpoint, next).await
    }

    /// Move the cursor forward. `total` is only recorded while still unknown.
    pub async fn advance(
        &self,
        checkpoint: &mut Checkpoint,
        next_index: u64,
        total: Option<u64>,
    ) -> Result<(), StoreError> {
        if next_index < checkpoint.next_index {
            return Err(StoreError::CheckpointRegression {
                name: checkpoint.name.clone(),
                current: checkpoint.next_index,
                requested: next_index,
            });
        }
        let mut next = checkpoint.clone();
        next.next_index = next_index;
        if next.total.is_none() {
            next.total = total;
        }
        self.persist(checkpoint, next).await
    }

    async fn persist(&self, checkpoint: &mut Checkpoint, mut next: Checkpoint) -> Result<(), StoreError> {
        next.updated_at = Utc::now();
        self.store.save_checkpoint(&next).await?;
        *checkpoint = next;
        Ok(())
    }
}

/// In-process store; backs `--dry-run` imports and the test suites.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    records: Vec<HistoryRecord>,
    ids: HashSet<String>,
    checkpoints: Vec<Checkpoint>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<HistoryRecord> {
        self.state.lock().await.records.clone()
    }

    pub async fn change_ids(&self) -> HashSet<String> {
        self.state.lock().await.ids.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl HistoryStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        Ok(Box::new(MemoryUnitOfWork {
            state: Arc::clone(&self.state),
            staged: Vec::new(),
            staged_ids: HashSet::new(),
        }))
    }

    async fn load_checkpoint(&self, name: &str) -> Result<Option<Checkpoint>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.checkpoints.iter().find(|c| c.name == name).cloned())
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        match state.checkpoints.iter_mut().find(|c| c.name == checkpoint.name) {
            Some(existing) => *existing = checkpoint.clone(),
            None => state.checkpoints.push(checkpoint.clone()),
        }
        Ok(())
    }
}

struct MemoryUnitOfWork {
    state: Arc<Mutex<MemoryState>>,
    staged: Vec<HistoryRecord>,
    staged_ids: HashSet<String>,
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn find_existing_ids(
        &mut self,
        candidates: &HashSet<String>,
    ) -> Result<HashSet<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(candidates
            .iter()
            .filter(|id| state.ids.contains(*id) || self.staged_ids.contains(*id))
            .cloned()
            .collect())
    }

    async fn bulk_insert(&mut self, records: &[HistoryRecord]) -> Result<(), StoreError> {
        let state = self.state.lock().await;
        let mut batch_ids = HashSet::with_capacity(records.len());
        for record in records {
            let id = &record.change_id;
            if state.ids.contains(id) || self.staged_ids.contains(id) || !batch_ids.insert(id.clone()) {
                return Err(StoreError::DuplicateKey(id.clone()));
            }
        }
        drop(state);
        self.staged_ids.extend(batch_ids);
        self.staged.extend_from_slice(records);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        let mut state = this.state.lock().await;
        if let Some(id) = this.staged_ids.iter().find(|id| state.ids.contains(*id)) {
            return Err(StoreError::DuplicateKey(id.clone()));
        }
        state.ids.extend(this.staged_ids);
        state.records.extend(this.staged);
        Ok(())
    }
}

/// Linear backoff between attempts at the same request.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts per request, the first one included.
    pub max_attempts: u32,
    /// Waiting after failed attempt `k` (0-based) is `step * (k + 1)` units.
    pub step: u32,
    pub delay_unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            step: 5,
            delay_unit: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let units = self.step.saturating_mul(attempt_index.saturating_add(1));
        self.delay_unit.saturating_mul(units)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Sent as the NVD `apiKey` header when present (header names are case-insensitive).
    pub api_key: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            api_key: None,
        }
    }
}

/// Single-attempt HTTP GET client; retrying is the caller's concern.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        if let Some(api_key) = &config.api_key {
            let mut headers = HeaderMap::new();
            let mut value = HeaderValue::from_str(api_key).context("api key is not a valid header value")?;
            value.set_sensitive(true);
            headers.insert(HeaderName::from_static("apikey"), value);
            builder = builder.default_headers(headers);
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn get(&self, url: &str, query: &[(&str, String)]) -> Result<FetchedResponse, FetchError> {
        let resp = self.client.get(url).query(query).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}
