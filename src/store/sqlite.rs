//! SQLite shared store
//!
//! A database file reachable by every management node. The leadership
//! claim runs inside an IMMEDIATE transaction so the epoch check and the
//! write are atomic across processes. Every statement runs on the blocking
//! pool, so a lock held by another node never stalls the runtime.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use super::{
    check_claim_args, check_fence, ClaimOutcome, EntitySnapshot, HeartbeatRecord,
    LeadershipRecord, SharedStore,
};
use crate::error::{Error, Result};
use crate::ha::{Epoch, NodeState};

/// How long a connection waits on a lock held by another node
const BUSY_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared store backed by SQLite
pub struct SqliteStore {
    /// Database connection
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Create or open the shared store database
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        // Initialize schema
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS heartbeats (
                node_id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                timestamp_ms INTEGER NOT NULL,
                epoch INTEGER,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS leadership (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                master_id TEXT NOT NULL,
                epoch INTEGER NOT NULL,
                claimed_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS snapshots (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL,
                epoch INTEGER,
                body TEXT NOT NULL,
                checksum INTEGER NOT NULL,
                written_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `work` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            work(&mut conn)
        })
        .await
        .map_err(|e| Error::StoreUnavailable(format!("store task failed: {}", e)))?
    }
}

fn read_leadership_row(conn: &Connection) -> Result<Option<LeadershipRecord>> {
    let row = conn
        .query_row(
            "SELECT master_id, epoch, claimed_at FROM leadership WHERE id = 1",
            [],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )
        .optional()?;

    match row {
        Some((master_id, epoch, claimed_at)) => {
            let claimed_at = chrono::DateTime::parse_from_rfc3339(&claimed_at)
                .map_err(|e| Error::StoreUnavailable(format!("bad claimed_at: {}", e)))?
                .with_timezone(&chrono::Utc);
            Ok(Some(LeadershipRecord {
                master_id,
                epoch: Epoch(epoch as u64),
                claimed_at,
            }))
        }
        None => Ok(None),
    }
}

#[async_trait]
impl SharedStore for SqliteStore {
    async fn write_heartbeat(&self, record: &HeartbeatRecord) -> Result<()> {
        let record = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO heartbeats (node_id, state, timestamp_ms, epoch) VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(node_id) DO UPDATE SET
                    state = ?2, timestamp_ms = ?3, epoch = ?4, updated_at = CURRENT_TIMESTAMP
                "#,
                params![
                    record.node_id,
                    record.state.to_string(),
                    record.timestamp_ms as i64,
                    record.epoch.map(|e| e.0 as i64),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_heartbeats(&self) -> Result<Vec<HeartbeatRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT node_id, state, timestamp_ms, epoch FROM heartbeats ORDER BY node_id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                ))
            })?;

            let mut records = Vec::new();
            for result in rows {
                let (node_id, state, timestamp_ms, epoch) = result?;
                let Some(state) = NodeState::from_wire(&state) else {
                    tracing::warn!("Ignoring heartbeat of {} with unknown state {}", node_id, state);
                    continue;
                };
                records.push(HeartbeatRecord {
                    node_id,
                    state,
                    timestamp_ms: timestamp_ms as u64,
                    epoch: epoch.map(|e| Epoch(e as u64)),
                });
            }

            Ok(records)
        })
        .await
    }

    async fn read_leadership(&self) -> Result<Option<LeadershipRecord>> {
        self.with_conn(|conn| read_leadership_row(conn)).await
    }

    async fn claim_leadership(
        &self,
        node_id: &str,
        expected: Option<Epoch>,
        new_epoch: Epoch,
    ) -> Result<ClaimOutcome> {
        check_claim_args(expected, new_epoch)?;

        let node_id = node_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let current = read_leadership_row(&tx)?;
            if current.as_ref().map(|l| l.epoch) != expected {
                return Ok(ClaimOutcome::Conflict { current });
            }

            let record = LeadershipRecord {
                master_id: node_id,
                epoch: new_epoch,
                claimed_at: chrono::Utc::now(),
            };
            tx.execute(
                r#"
                INSERT INTO leadership (id, master_id, epoch, claimed_at) VALUES (1, ?1, ?2, ?3)
                ON CONFLICT(id) DO UPDATE SET master_id = ?1, epoch = ?2, claimed_at = ?3
                "#,
                params![record.master_id, record.epoch.0 as i64, record.claimed_at.to_rfc3339()],
            )?;
            tx.commit()?;

            Ok(ClaimOutcome::Won(record))
        })
        .await
    }

    async fn read_latest_snapshot(&self) -> Result<Option<EntitySnapshot>> {
        let row = self
            .with_conn(|conn| {
                let row = conn
                    .query_row(
                        "SELECT body, checksum FROM snapshots WHERE id = 1",
                        [],
                        |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;

        let Some((body, checksum)) = row else {
            return Ok(None);
        };

        if crc32fast::hash(body.as_bytes()) as i64 != checksum {
            return Err(Error::SnapshotCorrupted("checksum mismatch".into()));
        }

        let snapshot = serde_json::from_str(&body)
            .map_err(|e| Error::SnapshotCorrupted(e.to_string()))?;
        Ok(Some(snapshot))
    }

    async fn write_snapshot(&self, snapshot: &EntitySnapshot) -> Result<()> {
        let body = serde_json::to_string(snapshot)?;
        let checksum = crc32fast::hash(body.as_bytes()) as i64;
        let version = snapshot.version as i64;
        let epoch = snapshot.epoch;

        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let leadership = read_leadership_row(&tx)?;
            check_fence(epoch, leadership.as_ref())?;

            tx.execute(
                r#"
                INSERT INTO snapshots (id, version, epoch, body, checksum) VALUES (1, ?1, ?2, ?3, ?4)
                ON CONFLICT(id) DO UPDATE SET
                    version = ?1, epoch = ?2, body = ?3, checksum = ?4, written_at = CURRENT_TIMESTAMP
                "#,
                params![version, epoch.map(|e| e.0 as i64), body, checksum],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::StoreUnavailable(format!("SQLite error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_heartbeat_roundtrip() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("store.db")).unwrap();

        store
            .write_heartbeat(&HeartbeatRecord {
                node_id: "mgmt-1".to_string(),
                state: NodeState::Master,
                timestamp_ms: 1_000,
                epoch: Some(Epoch(3)),
            })
            .await
            .unwrap();
        store
            .write_heartbeat(&HeartbeatRecord {
                node_id: "mgmt-1".to_string(),
                state: NodeState::Master,
                timestamp_ms: 2_000,
                epoch: Some(Epoch(3)),
            })
            .await
            .unwrap();

        let records = store.list_heartbeats().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].timestamp_ms, 2_000);
        assert_eq!(records[0].epoch, Some(Epoch(3)));
        assert_eq!(records[0].state, NodeState::Master);
    }

    #[tokio::test]
    async fn test_claim_is_conditional() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("store.db")).unwrap();

        assert!(store.read_leadership().await.unwrap().is_none());
        assert!(store.claim_leadership("mgmt-1", None, Epoch(1)).await.unwrap().is_won());
        assert!(!store.claim_leadership("mgmt-2", None, Epoch(1)).await.unwrap().is_won());
        assert!(store
            .claim_leadership("mgmt-2", Some(Epoch(1)), Epoch(2))
            .await
            .unwrap()
            .is_won());

        let leadership = store.read_leadership().await.unwrap().unwrap();
        assert_eq!(leadership.master_id, "mgmt-2");
        assert_eq!(leadership.epoch, Epoch(2));
    }

    #[tokio::test]
    async fn test_two_handles_share_one_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        let a = SqliteStore::open(&path).unwrap();
        let b = SqliteStore::open(&path).unwrap();

        assert!(a.claim_leadership("mgmt-1", None, Epoch(1)).await.unwrap().is_won());
        match b.claim_leadership("mgmt-2", None, Epoch(1)).await.unwrap() {
            ClaimOutcome::Conflict { current } => {
                assert_eq!(current.unwrap().master_id, "mgmt-1")
            }
            ClaimOutcome::Won(_) => panic!("claim over a stale epoch must lose"),
        }
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip_and_fence() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("store.db")).unwrap();
        store.claim_leadership("mgmt-1", None, Epoch(1)).await.unwrap();

        let mut entities = BTreeMap::new();
        let app = Entity::new("application", "web", serde_json::json!({"replicas": 2}));
        entities.insert(app.id.clone(), app);

        let snapshot = EntitySnapshot {
            version: 4,
            written_by: "mgmt-1".to_string(),
            epoch: Some(Epoch(1)),
            written_at: chrono::Utc::now(),
            entities,
        };
        store.write_snapshot(&snapshot).await.unwrap();
        assert_eq!(store.read_latest_snapshot().await.unwrap(), Some(snapshot.clone()));

        store.claim_leadership("mgmt-2", Some(Epoch(1)), Epoch(2)).await.unwrap();
        assert!(store.write_snapshot(&snapshot).await.unwrap_err().is_fenced());
    }

    #[tokio::test]
    async fn test_locked_database_does_not_stall_runtime() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        let store = Arc::new(SqliteStore::open(&path).unwrap());

        // Another node holds the write lock
        let other = Connection::open(&path).unwrap();
        other.execute_batch("BEGIN IMMEDIATE").unwrap();

        let claim = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.claim_leadership("mgmt-1", None, Epoch(1)).await })
        };

        let started = std::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(!claim.is_finished());

        other.execute_batch("COMMIT").unwrap();
        assert!(claim.await.unwrap().unwrap().is_won());
    }

    #[tokio::test]
    async fn test_corrupted_snapshot_detected() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("store.db")).unwrap();
        store
            .write_snapshot(&EntitySnapshot {
                version: 1,
                written_by: "solo".to_string(),
                epoch: None,
                written_at: chrono::Utc::now(),
                entities: BTreeMap::new(),
            })
            .await
            .unwrap();

        {
            let conn = store.conn.lock().unwrap();
            conn.execute("UPDATE snapshots SET checksum = checksum + 1", []).unwrap();
        }

        assert!(matches!(
            store.read_latest_snapshot().await,
            Err(Error::SnapshotCorrupted(_))
        ));
    }
}
