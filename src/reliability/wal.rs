use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use crate::state::{market_date, Side};

/// Append-only risk journal, one JSON object per line.
#[derive(Debug)]
pub struct Wal {
    file: File,
    path: String,
}

/// WAL entry types for recovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation")]
pub enum WalEntry {
    #[serde(rename = "executed")]
    Executed {
        ts: u64,
        side: Side,
        price: f64,
        volume: f64,
        #[serde(default)]
        ticket: Option<u64>,
    },
    #[serde(rename = "closed")]
    Closed {
        ts: u64,
        cluster_id: u64,
        final_pnl: f64,
    },
    #[serde(rename = "rollover")]
    Rollover {
        ts: u64,
        /// Realized PnL of the day that just ended.
        closed_day_pnl: f64,
    },
}

/// What the risk supervisor restores on startup.
///
/// The day is the market date of the newest journaled event, never the
/// wall clock: a feed on broker time or a replay must see its own day.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryState {
    /// Market date of the newest entry; `None` for an empty journal.
    pub market_day: Option<NaiveDate>,
    /// Event time of the newest entry.
    pub last_event_ts: Option<u64>,
    /// Realized PnL of closures on `market_day`.
    pub daily_realized_pnl: f64,
    /// Highest cluster id ever closed. Seeds gateway numbering, not idempotency.
    pub last_closed_cluster: Option<u64>,
    /// Fills journaled after the last closure; informational, the gateway
    /// remains the source of truth for open positions.
    pub fills_since_close: usize,
    pub skipped_lines: usize,
}

impl Wal {
    pub fn open(path: &str) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file, path: path.to_string() })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn append_entry(&mut self, entry: &WalEntry) -> std::io::Result<()> {
        let line = serde_json::to_string(entry).map_err(std::io::Error::other)?;
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.file.flush()?;
        self.file.sync_data()
    }

    /// Read all lines from WAL file
    pub fn replay(path: &str) -> std::io::Result<Vec<String>> {
        if !Path::new(path).exists() {
            return Ok(vec![]);
        }
        let file = OpenOptions::new().read(true).open(path)?;
        let reader = BufReader::new(file);
        Ok(reader.lines().map_while(Result::ok).collect())
    }

    /// Rebuild the realized PnL of the journal's last market day and the
    /// highest closed cluster id.
    pub fn recover(path: &str) -> std::io::Result<RecoveryState> {
        let mut state = RecoveryState::default();
        let mut closes: Vec<(u64, f64)> = Vec::new();
        for line in Self::replay(path)? {
            if line.trim().is_empty() {
                continue;
            }
            let Ok(entry) = serde_json::from_str::<WalEntry>(&line) else {
                state.skipped_lines += 1;
                continue;
            };
            state.last_event_ts = Some(state.last_event_ts.map_or(entry.ts(), |t| t.max(entry.ts())));
            match entry {
                WalEntry::Executed { .. } => state.fills_since_close += 1,
                WalEntry::Closed { ts, cluster_id, final_pnl } => {
                    closes.push((ts, final_pnl));
                    state.last_closed_cluster =
                        Some(state.last_closed_cluster.map_or(cluster_id, |c| c.max(cluster_id)));
                    state.fills_since_close = 0;
                }
                WalEntry::Rollover { .. } => {}
            }
        }
        state.market_day = state.last_event_ts.map(market_date);
        if let Some(day) = state.market_day {
            state.daily_realized_pnl = closes
                .iter()
                .filter(|(ts, _)| market_date(*ts) == day)
                .map(|(_, pnl)| pnl)
                .sum();
        }
        Ok(state)
    }
}

impl WalEntry {
    pub fn ts(&self) -> u64 {
        match self {
            WalEntry::Executed { ts, .. } | WalEntry::Closed { ts, .. } | WalEntry::Rollover { ts, .. } => *ts,
        }
    }
}
