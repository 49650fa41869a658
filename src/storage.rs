use anyhow::Result;
use rusqlite::{params, Connection};

use crate::events::ClusterReport;
use crate::reputation::{ReputationBackend, ReputationMatrix};

/// Reputation weights and cluster outcome history in SQLite.
pub struct SqliteReputationBackend {
    conn: Connection,
    path: String,
}

impl SqliteReputationBackend {
    pub fn new(path: &str) -> Result<Self> {
        let mut backend = Self { conn: Connection::open(path)?, path: path.to_string() };
        backend.init()?;
        Ok(backend)
    }

    pub fn in_memory() -> Result<Self> {
        let mut backend = Self { conn: Connection::open_in_memory()?, path: ":memory:".to_string() };
        backend.init()?;
        Ok(backend)
    }

    pub fn init(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS reputation (
                regime TEXT NOT NULL,
                expert_id TEXT NOT NULL,
                weight REAL NOT NULL,
                PRIMARY KEY (regime, expert_id)
            );
            CREATE TABLE IF NOT EXISTS cluster_outcomes (
                ts INTEGER NOT NULL,
                cluster_id INTEGER NOT NULL,
                regime TEXT NOT NULL,
                win INTEGER NOT NULL,
                final_pnl REAL NOT NULL,
                experts TEXT NOT NULL
            );
            COMMIT;",
        )?;
        Ok(())
    }

    /// Outcome history, oldest first.
    pub fn outcomes(&self) -> Result<Vec<ClusterReport>> {
        let mut stmt = self.conn.prepare(
            "SELECT ts, cluster_id, regime, win, final_pnl, experts
             FROM cluster_outcomes ORDER BY rowid",
        )?;
        let rows = stmt.query_map([], |row| {
            let experts: String = row.get(5)?;
            Ok(ClusterReport {
                timestamp: row.get::<_, i64>(0)? as u64,
                cluster_id: row.get::<_, i64>(1)? as u64,
                regime: row.get(2)?,
                win: row.get::<_, i64>(3)? != 0,
                final_pnl: row.get(4)?,
                experts: serde_json::from_str(&experts).unwrap_or_default(),
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

impl ReputationBackend for SqliteReputationBackend {
    fn load(&self) -> Result<ReputationMatrix> {
        let mut stmt = self
            .conn
            .prepare("SELECT regime, expert_id, weight FROM reputation")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, f64>(2)?))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(ReputationMatrix::from_entries(entries))
    }

    fn save(&mut self, matrix: &ReputationMatrix) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM reputation", [])?;
        for (regime, expert, weight) in matrix.entries() {
            tx.execute(
                "INSERT INTO reputation (regime, expert_id, weight) VALUES (?1, ?2, ?3)",
                params![regime, expert, weight],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn record_outcome(&mut self, report: &ClusterReport) -> Result<()> {
        self.conn.execute(
            "INSERT INTO cluster_outcomes (ts, cluster_id, regime, win, final_pnl, experts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                report.timestamp as i64,
                report.cluster_id as i64,
                report.regime,
                report.win as i64,
                report.final_pnl,
                serde_json::to_string(&report.experts)?,
            ],
        )?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("sqlite:{}", self.path)
    }
}
