// packages/engine/src/recording/storage.rs
//! SQLite record sink
//!
//! Alerts are keyed by alert id (`INSERT OR IGNORE`, so a replayed append is
//! harmless); status changes are an append-only log. Each append runs in one
//! transaction.

use super::sink::{Record, RecordSink};
use crate::model::{AgentId, Alert};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Stored agent status transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRow {
    pub agent_id: String,
    pub previous: String,
    pub state: String,
    pub error: Option<String>,
    pub timestamp: String,
}

/// Row counts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub alerts: u64,
    pub status_changes: u64,
}

/// SQLite-backed sink
pub struct SqliteSink {
    path: PathBuf,
    db: Mutex<Connection>,
}

impl SqliteSink {
    /// Open (or create) the database at `path`
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|e| {
                EngineError::StorageFailed(format!("Failed to create directory {:?}: {}", parent, e))
            })?;
        }

        let conn = Connection::open(&path)
            .map_err(|e| EngineError::StorageFailed(format!("Failed to open database: {}", e)))?;
        let sink = Self {
            path,
            db: Mutex::new(conn),
        };
        sink.init_schema().await?;

        info!("Record storage initialized at {:?}", sink.path);
        Ok(sink)
    }

    async fn init_schema(&self) -> Result<()> {
        let db = self.db.lock().await;
        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS alerts (
                id TEXT PRIMARY KEY,
                batch_id TEXT NOT NULL,
                severity TEXT NOT NULL,
                degraded INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                body TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_alerts_batch ON alerts(batch_id);

            CREATE TABLE IF NOT EXISTS agent_status (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                previous TEXT NOT NULL,
                state TEXT NOT NULL,
                error TEXT,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_status_agent ON agent_status(agent_id);
            "#,
        )
        .map_err(|e| EngineError::StorageFailed(format!("Schema creation failed: {}", e)))?;
        Ok(())
    }

    /// Most recent alerts, newest first
    pub async fn recent_alerts(&self, limit: usize) -> Result<Vec<Alert>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare("SELECT body FROM alerts ORDER BY rowid DESC LIMIT ?")?;
        let bodies = stmt
            .query_map(params![limit as i64], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        bodies
            .iter()
            .map(|body| serde_json::from_str(body).map_err(EngineError::from))
            .collect()
    }

    /// Status transitions of one agent, oldest first
    pub async fn status_history(&self, agent: &AgentId) -> Result<Vec<StatusRow>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT agent_id, previous, state, error, timestamp FROM agent_status WHERE agent_id = ? ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![agent.as_str()], |row| {
                Ok(StatusRow {
                    agent_id: row.get(0)?,
                    previous: row.get(1)?,
                    state: row.get(2)?,
                    error: row.get(3)?,
                    timestamp: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub async fn stats(&self) -> Result<StorageStats> {
        let db = self.db.lock().await;
        let alerts: i64 = db.query_row("SELECT COUNT(*) FROM alerts", [], |row| row.get(0))?;
        let status_changes: i64 =
            db.query_row("SELECT COUNT(*) FROM agent_status", [], |row| row.get(0))?;
        Ok(StorageStats {
            alerts: alerts as u64,
            status_changes: status_changes as u64,
        })
    }
}

#[async_trait]
impl RecordSink for SqliteSink {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn append(&self, records: &[Record]) -> Result<()> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;

        for record in records {
            match record {
                Record::Alert(alert) => {
                    let body = serde_json::to_string(alert.as_ref())?;
                    tx.execute(
                        "INSERT OR IGNORE INTO alerts (id, batch_id, severity, degraded, created_at, body)
                         VALUES (?, ?, ?, ?, ?, ?)",
                        params![
                            alert.id,
                            alert.batch_id,
                            alert.severity.as_str(),
                            alert.degraded,
                            alert.created_at.to_rfc3339(),
                            body,
                        ],
                    )?;
                }
                Record::AgentStatus(change) => {
                    tx.execute(
                        "INSERT INTO agent_status (agent_id, kind, previous, state, error, timestamp)
                         VALUES (?, ?, ?, ?, ?, ?)",
                        params![
                            change.agent_id.as_str(),
                            change.kind.as_str(),
                            change.previous.as_str(),
                            change.state.as_str(),
                            change.error,
                            change.timestamp.to_rfc3339(),
                        ],
                    )?;
                }
            }
        }

        tx.commit()?;
        debug!("Appended {} records", records.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AgentKind, AgentState, AgentStatusChange, Severity};
    use chrono::Utc;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn alert(id: &str) -> Arc<Alert> {
        Arc::new(Alert {
            id: id.to_string(),
            batch_id: format!("batch-{}", id),
            severity: Severity::High,
            summary: "port scan".to_string(),
            classification: "port_scan".to_string(),
            recommendation: "Block source".to_string(),
            risk_score: 0.8,
            event_ids: vec![],
            created_at: Utc::now(),
            degraded: false,
        })
    }

    fn change(previous: AgentState, state: AgentState) -> Record {
        Record::AgentStatus(AgentStatusChange {
            agent_id: AgentId::new("net-1"),
            kind: AgentKind::NetworkMonitor,
            previous,
            state,
            error: None,
            timestamp: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_creates_parent_directories() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/data/smas.db");
        let sink = SqliteSink::open(&path).await.unwrap();
        assert!(path.exists());
        assert_eq!(sink.stats().await.unwrap(), StorageStats::default());
    }

    #[tokio::test]
    async fn test_append_alerts_and_status() {
        let dir = tempdir().unwrap();
        let sink = SqliteSink::open(dir.path().join("smas.db")).await.unwrap();

        sink.append(&[
            change(AgentState::Stopped, AgentState::Starting),
            change(AgentState::Starting, AgentState::Running),
            Record::Alert(alert("a-1")),
            Record::Alert(alert("a-2")),
        ])
        .await
        .unwrap();

        let alerts = sink.recent_alerts(10).await.unwrap();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].id, "a-2");
        assert_eq!(alerts[1].severity, Severity::High);

        let history = sink.status_history(&AgentId::new("net-1")).await.unwrap();
        let states: Vec<_> = history.iter().map(|row| row.state.as_str()).collect();
        assert_eq!(states, vec!["starting", "running"]);
    }

    #[tokio::test]
    async fn test_duplicate_alert_ignored() {
        let dir = tempdir().unwrap();
        let sink = SqliteSink::open(dir.path().join("smas.db")).await.unwrap();

        let a = alert("a-1");
        sink.append(&[Record::Alert(Arc::clone(&a))]).await.unwrap();
        sink.append(&[Record::Alert(a)]).await.unwrap();
        assert_eq!(sink.stats().await.unwrap().alerts, 1);
    }

    #[tokio::test]
    async fn test_reopen_keeps_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("smas.db");
        {
            let sink = SqliteSink::open(&path).await.unwrap();
            sink.append(&[Record::Alert(alert("a-1"))]).await.unwrap();
        }
        let sink = SqliteSink::open(&path).await.unwrap();
        assert_eq!(sink.stats().await.unwrap().alerts, 1);
    }
}
