//! Transactional, deduplicating page writes.

use std::collections::HashSet;

use cvehist_core::HistoryRecord;
use cvehist_storage::{HistoryStore, StoreError};
use thiserror::Error;
use tracing::debug;

/// The page's unit of work was rolled back; nothing from it is visible.
#[derive(Debug, Error)]
#[error("page write rolled back: {0}")]
pub struct WriteFailure(#[from] pub StoreError);

#[derive(Debug, Clone, Copy)]
pub struct DedupBatchWriter {
    chunk_size: usize,
}

impl DedupBatchWriter {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Insert every record whose `change_id` is not stored yet and return
    /// how many were inserted. All chunks share one unit of work, so the
    /// page lands completely or not at all.
    pub async fn write_page(
        &self,
        store: &dyn HistoryStore,
        records: &[HistoryRecord],
    ) -> Result<usize, WriteFailure> {
        let mut uow = store.begin().await?;
        let mut seen: HashSet<&str> = HashSet::with_capacity(records.len());
        let mut inserted = 0usize;

        for (chunk_no, chunk) in records.chunks(self.chunk_size).enumerate() {
            let candidates: HashSet<String> = chunk.iter().map(|r| r.change_id.clone()).collect();
            let existing = uow.find_existing_ids(&candidates).await?;

            // A change id repeated inside the page counts as a duplicate too.
            let fresh: Vec<HistoryRecord> = chunk
                .iter()
                .filter(|r| !existing.contains(&r.change_id) && seen.insert(r.change_id.as_str()))
                .cloned()
                .collect();

            debug!(
                chunk_no,
                candidates = chunk.len(),
                existing = existing.len(),
                fresh = fresh.len(),
                "writing chunk"
            );

            if !fresh.is_empty() {
                uow.bulk_insert(&fresh).await?;
                inserted += fresh.len();
            }
        }

        uow.commit().await?;
        Ok(inserted)
    }
}
