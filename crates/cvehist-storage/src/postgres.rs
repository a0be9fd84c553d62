//! PostgreSQL backend for [`HistoryStore`].

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cvehist_core::{Checkpoint, HistoryRecord};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::debug;

use crate::{HistoryStore, StoreError, UnitOfWork};

#[derive(Debug, Clone)]
pub struct PgHistoryStore {
    pool: PgPool,
}

impl PgHistoryStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn record_count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cve_history")
            .fetch_one(&self.pool)
            .await?;
        to_u64("cve_history count", count)
    }
}

fn to_u64(what: &str, value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::OutOfRange(format!("{what}={value}")))
}

fn to_i64(what: &str, value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::OutOfRange(format!("{what}={value}")))
}

#[async_trait]
impl HistoryStore for PgHistoryStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgUnitOfWork { tx }))
    }

    async fn load_checkpoint(&self, name: &str) -> Result<Option<Checkpoint>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT name, next_index, total, updated_at
              FROM import_checkpoints
             WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let next_index: i64 = row.try_get("next_index")?;
        let total: Option<i64> = row.try_get("total")?;
        let updated_at: DateTime<Utc> = row.try_get("updated_at")?;
        Ok(Some(Checkpoint {
            name: row.try_get("name")?,
            next_index: to_u64("next_index", next_index)?,
            total: total.map(|t| to_u64("total", t)).transpose()?,
            updated_at,
        }))
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let total = checkpoint
            .total
            .map(|t| to_i64("total", t))
            .transpose()?;
        sqlx::query(
            r#"
            INSERT INTO import_checkpoints (name, next_index, total, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (name)
            DO UPDATE SET next_index = EXCLUDED.next_index,
                          total = EXCLUDED.total,
                          updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&checkpoint.name)
        .bind(to_i64("next_index", checkpoint.next_index)?)
        .bind(total)
        .bind(checkpoint.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Wraps one database transaction; sqlx rolls it back on drop.
struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn find_existing_ids(
        &mut self,
        candidates: &HashSet<String>,
    ) -> Result<HashSet<String>, StoreError> {
        if candidates.is_empty() {
            return Ok(HashSet::new());
        }
        let ids: Vec<String> = candidates.iter().cloned().collect();
        let existing: Vec<String> = sqlx::query_scalar(
            "SELECT cve_change_id FROM cve_history WHERE cve_change_id = ANY($1)",
        )
        .bind(&ids)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(existing.into_iter().collect())
    }

    async fn bulk_insert(&mut self, records: &[HistoryRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(
            r#"
            INSERT INTO cve_history (
                cve_id, event_name, cve_change_id, source_identifier, created, details
            )
            "#,
        );
        query_builder.push_values(records.iter(), |mut b, record| {
            b.push_bind(&record.cve_id)
                .push_bind(&record.event_name)
                .push_bind(&record.change_id)
                .push_bind(&record.source_identifier)
                .push_bind(record.created_at)
                .push_bind(&record.details);
        });

        match query_builder.build().execute(&mut *self.tx).await {
            Ok(result) => {
                debug!(rows = result.rows_affected(), "inserted cve_history rows");
                Ok(())
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::DuplicateKey(db.message().to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CheckpointStore;
    use chrono::TimeZone;
    use serde_json::json;

    fn record(change_id: &str) -> HistoryRecord {
        HistoryRecord {
            cve_id: "CVE-2021-44228".into(),
            event_name: Some("CVE Modified".into()),
            change_id: change_id.into(),
            source_identifier: Some("security@apache.org".into()),
            created_at: Some(Utc.with_ymd_and_hms(2021, 12, 10, 10, 15, 9).unwrap()),
            details: Some(json!([{"action": "Added", "type": "Reference"}])),
        }
    }

    fn ids(values: &[&str]) -> HashSet<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn dropped_transaction_leaves_no_rows(pool: PgPool) {
        let store = PgHistoryStore::from_pool(pool);
        {
            let mut uow = store.begin().await.expect("begin");
            uow.bulk_insert(&[record("a"), record("b")]).await.expect("insert");
        }
        assert_eq!(store.record_count().await.expect("count"), 0);

        let mut uow = store.begin().await.expect("begin");
        uow.bulk_insert(&[record("a")]).await.expect("insert");
        uow.commit().await.expect("commit");
        assert_eq!(store.record_count().await.expect("count"), 1);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn existing_ids_include_rows_from_the_open_transaction(pool: PgPool) {
        let store = PgHistoryStore::from_pool(pool);
        let mut committed = store.begin().await.expect("begin");
        committed.bulk_insert(&[record("stored")]).await.expect("insert");
        committed.commit().await.expect("commit");

        let mut uow = store.begin().await.expect("begin");
        uow.bulk_insert(&[record("staged")]).await.expect("insert");

        let existing = uow
            .find_existing_ids(&ids(&["stored", "staged", "new"]))
            .await
            .expect("query");
        assert_eq!(existing, ids(&["stored", "staged"]));
        assert!(uow.find_existing_ids(&HashSet::new()).await.expect("query").is_empty());

        // Staged rows stay invisible to other connections until commit.
        assert_eq!(store.record_count().await.expect("count"), 1);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn unique_violation_maps_to_duplicate_key(pool: PgPool) {
        let store = PgHistoryStore::from_pool(pool);
        let mut uow = store.begin().await.expect("begin");
        uow.bulk_insert(&[record("a")]).await.expect("insert");
        uow.commit().await.expect("commit");

        let mut uow = store.begin().await.expect("begin");
        let err = uow.bulk_insert(&[record("b"), record("a")]).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey(_)), "{err:?}");
        drop(uow);

        let mut uow = store.begin().await.expect("begin");
        let err = uow.bulk_insert(&[record("c"), record("c")]).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey(_)), "{err:?}");
        drop(uow);

        assert_eq!(store.record_count().await.expect("count"), 1);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn checkpoint_upsert_round_trips_large_offsets(pool: PgPool) {
        let store = PgHistoryStore::from_pool(pool.clone());
        assert!(store.load_checkpoint("cve_history").await.expect("load").is_none());

        let mut checkpoint = Checkpoint {
            name: "cve_history".into(),
            next_index: 5_000_000_000,
            total: Some(u64::from(u32::MAX) + 7),
            updated_at: Utc.with_ymd_and_hms(2026, 10, 19, 8, 30, 0).unwrap(),
        };
        store.save_checkpoint(&checkpoint).await.expect("insert");
        assert_eq!(
            store.load_checkpoint("cve_history").await.expect("load"),
            Some(checkpoint.clone())
        );

        checkpoint.next_index += 5000;
        checkpoint.total = None;
        checkpoint.updated_at = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap();
        store.save_checkpoint(&checkpoint).await.expect("update");
        assert_eq!(
            store.load_checkpoint("cve_history").await.expect("load"),
            Some(checkpoint.clone())
        );

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM import_checkpoints")
            .fetch_one(&pool)
            .await
            .expect("count");
        assert_eq!(rows, 1);

        let overflow = Checkpoint {
            next_index: u64::MAX,
            ..checkpoint.clone()
        };
        let err = store.save_checkpoint(&overflow).await.unwrap_err();
        assert!(matches!(err, StoreError::OutOfRange(_)), "{err:?}");
        assert_eq!(
            store.load_checkpoint("cve_history").await.expect("load"),
            Some(checkpoint)
        );
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn checkpoint_store_creates_and_advances_rows(pool: PgPool) {
        let store = PgHistoryStore::from_pool(pool);
        let checkpoints = CheckpointStore::new(&store);

        let mut cp = checkpoints.load("nightly").await.expect("load");
        assert_eq!((cp.next_index, cp.total), (0, None));
        checkpoints.advance(&mut cp, 2000, Some(2500)).await.expect("advance");

        let stored = store.load_checkpoint("nightly").await.expect("load").expect("exists");
        assert_eq!((stored.next_index, stored.total), (2000, Some(2500)));
    }
}
