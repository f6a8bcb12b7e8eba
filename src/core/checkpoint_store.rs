//! Durable per-stage checkpoints keyed by `(project_id, stage)`.
//!
//! The store is a dumb durable map: it never reasons about pipeline order.
//! Keeping checkpoints gap-free is the orchestrator's job.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::db::{column_error, format_timestamp, parse_timestamp, Database, StoreError};
use crate::domain::{StageCheckpoint, StageName};

/// Result of a checkpoint write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// A new or changed payload was stored
    Written,

    /// The identical payload was already stored; nothing changed
    Unchanged,
}

/// Persistence of completed stage outputs
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Store a stage's payload, replacing any different earlier payload
    async fn put(
        &self,
        project_id: &str,
        stage: StageName,
        payload: &Value,
        attempts: u32,
    ) -> Result<PutOutcome, StoreError>;

    async fn get(
        &self,
        project_id: &str,
        stage: StageName,
    ) -> Result<Option<StageCheckpoint>, StoreError>;

    /// Remove one checkpoint; returns whether it existed
    async fn remove(&self, project_id: &str, stage: StageName) -> Result<bool, StoreError>;

    /// Remove every checkpoint of a project; returns how many were removed
    async fn clear(&self, project_id: &str) -> Result<usize, StoreError>;

    /// All checkpoints of a project in pipeline order
    async fn list(&self, project_id: &str) -> Result<Vec<StageCheckpoint>, StoreError>;
}

/// SHA-256 of a payload's canonical serialization
///
/// `serde_json` objects keep their keys sorted, so equal values always hash
/// the same.
pub fn payload_digest(payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Checkpoint store backed by the `stage_checkpoints` table
#[derive(Clone)]
pub struct SqliteCheckpointStore {
    db: Database,
}

impl SqliteCheckpointStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

fn read_checkpoint(row: &rusqlite::Row<'_>) -> rusqlite::Result<StageCheckpoint> {
    let stage_raw: String = row.get(1)?;
    let stage = stage_raw
        .parse::<StageName>()
        .map_err(|e| column_error(1, e))?;
    let payload_raw: String = row.get(2)?;
    let payload = serde_json::from_str(&payload_raw).map_err(|e| column_error(2, e.to_string()))?;
    let completed_raw: String = row.get(5)?;

    Ok(StageCheckpoint {
        project_id: row.get(0)?,
        stage,
        payload,
        payload_digest: row.get(3)?,
        attempts: row.get(4)?,
        completed_at: parse_timestamp(5, &completed_raw)?,
    })
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn put(
        &self,
        project_id: &str,
        stage: StageName,
        payload: &Value,
        attempts: u32,
    ) -> Result<PutOutcome, StoreError> {
        let project_id = project_id.to_string();
        let serialized = serde_json::to_string(payload)?;
        let digest = payload_digest(payload);

        self.db
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let existing: Option<String> = tx
                    .query_row(
                        "SELECT payload_digest FROM stage_checkpoints
                         WHERE project_id = ?1 AND stage_name = ?2",
                        params![project_id, stage.as_str()],
                        |row| row.get(0),
                    )
                    .optional()?;

                if existing.as_deref() == Some(digest.as_str()) {
                    return Ok(PutOutcome::Unchanged);
                }

                tx.execute(
                    "INSERT INTO stage_checkpoints
                        (project_id, stage_name, payload, payload_digest, attempts, completed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(project_id, stage_name) DO UPDATE SET
                        payload = excluded.payload,
                        payload_digest = excluded.payload_digest,
                        attempts = excluded.attempts,
                        completed_at = excluded.completed_at",
                    params![
                        project_id,
                        stage.as_str(),
                        serialized,
                        digest,
                        attempts,
                        format_timestamp(&Utc::now()),
                    ],
                )?;
                tx.commit()?;
                Ok(PutOutcome::Written)
            })
            .await
    }

    async fn get(
        &self,
        project_id: &str,
        stage: StageName,
    ) -> Result<Option<StageCheckpoint>, StoreError> {
        let project_id = project_id.to_string();
        self.db
            .call(move |conn| {
                let checkpoint = conn
                    .query_row(
                        "SELECT project_id, stage_name, payload, payload_digest, attempts, completed_at
                         FROM stage_checkpoints
                         WHERE project_id = ?1 AND stage_name = ?2",
                        params![project_id, stage.as_str()],
                        read_checkpoint,
                    )
                    .optional()?;
                Ok(checkpoint)
            })
            .await
    }

    async fn remove(&self, project_id: &str, stage: StageName) -> Result<bool, StoreError> {
        let project_id = project_id.to_string();
        self.db
            .call(move |conn| {
                let removed = conn.execute(
                    "DELETE FROM stage_checkpoints WHERE project_id = ?1 AND stage_name = ?2",
                    params![project_id, stage.as_str()],
                )?;
                Ok(removed > 0)
            })
            .await
    }

    async fn clear(&self, project_id: &str) -> Result<usize, StoreError> {
        let project_id = project_id.to_string();
        self.db
            .call(move |conn| {
                let removed = conn.execute(
                    "DELETE FROM stage_checkpoints WHERE project_id = ?1",
                    params![project_id],
                )?;
                Ok(removed)
            })
            .await
    }

    async fn list(&self, project_id: &str) -> Result<Vec<StageCheckpoint>, StoreError> {
        let project_id = project_id.to_string();
        let mut checkpoints = self
            .db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT project_id, stage_name, payload, payload_digest, attempts, completed_at
                     FROM stage_checkpoints
                     WHERE project_id = ?1",
                )?;
                let rows = stmt
                    .query_map(params![project_id], read_checkpoint)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        checkpoints.sort_by_key(|c| c.stage);
        Ok(checkpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn create_test_store() -> SqliteCheckpointStore {
        SqliteCheckpointStore::new(Database::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let store = create_test_store();
        let payload = json!({"files": ["a.py", "b.py"]});

        let outcome = store
            .put("svc-go", StageName::Traverse, &payload, 1)
            .await
            .unwrap();
        assert_eq!(outcome, PutOutcome::Written);

        let checkpoint = store.get("svc-go", StageName::Traverse).await.unwrap().unwrap();
        assert_eq!(checkpoint.payload, payload);
        assert_eq!(checkpoint.attempts, 1);
        assert_eq!(checkpoint.payload_digest, payload_digest(&payload));

        assert!(store.get("svc-go", StageName::Document).await.unwrap().is_none());
        assert!(store.get("svc-rust", StageName::Traverse).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_identical_put_is_noop() {
        let store = create_test_store();
        let payload = json!({"ok": true});

        store.put("svc-go", StageName::Traverse, &payload, 1).await.unwrap();
        let first = store.get("svc-go", StageName::Traverse).await.unwrap().unwrap();

        let outcome = store.put("svc-go", StageName::Traverse, &payload, 4).await.unwrap();
        assert_eq!(outcome, PutOutcome::Unchanged);

        let second = store.get("svc-go", StageName::Traverse).await.unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_changed_payload_overwrites() {
        let store = create_test_store();
        store
            .put("svc-go", StageName::Traverse, &json!({"v": 1}), 1)
            .await
            .unwrap();
        let outcome = store
            .put("svc-go", StageName::Traverse, &json!({"v": 2}), 2)
            .await
            .unwrap();
        assert_eq!(outcome, PutOutcome::Written);

        let checkpoint = store.get("svc-go", StageName::Traverse).await.unwrap().unwrap();
        assert_eq!(checkpoint.payload, json!({"v": 2}));
        assert_eq!(checkpoint.attempts, 2);
    }

    #[tokio::test]
    async fn test_list_is_in_pipeline_order() {
        let store = create_test_store();
        for stage in [StageName::Document, StageName::AnalyzeProject, StageName::Traverse] {
            store.put("svc-go", stage, &json!({}), 1).await.unwrap();
        }

        let stages: Vec<_> = store
            .list("svc-go")
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.stage)
            .collect();
        assert_eq!(
            stages,
            vec![StageName::AnalyzeProject, StageName::Traverse, StageName::Document]
        );
    }

    #[tokio::test]
    async fn test_clear_and_remove() {
        let store = create_test_store();
        store.put("svc-go", StageName::AnalyzeProject, &json!({}), 1).await.unwrap();
        store.put("svc-go", StageName::Traverse, &json!({}), 1).await.unwrap();
        store.put("other-go", StageName::Traverse, &json!({}), 1).await.unwrap();

        assert!(store.remove("svc-go", StageName::Traverse).await.unwrap());
        assert!(!store.remove("svc-go", StageName::Traverse).await.unwrap());

        assert_eq!(store.clear("svc-go").await.unwrap(), 1);
        assert!(store.list("svc-go").await.unwrap().is_empty());
        assert_eq!(store.list("other-go").await.unwrap().len(), 1);
    }

    #[test]
    fn test_digest_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": 2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a": 2, "b": 1}"#).unwrap();
        assert_eq!(payload_digest(&a), payload_digest(&b));
        assert_eq!(payload_digest(&a).len(), 64);
    }
}
