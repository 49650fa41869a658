use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReputationBackendKind {
    Json,
    Sqlite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayKind {
    None,
    Paper,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub entry_threshold: f64,
    pub burst_threshold: f64,
    pub doubt_threshold: f64,
    pub max_cluster: usize,
    /// Milliseconds between burst requests
    pub burst_interval_ms: u64,
    pub burst_enabled: bool,
    pub tp_target: f64,
    pub trail_trigger: f64,
    pub trail_ratio: f64,
    pub daily_loss_limit: f64,
    /// Milliseconds a closure keeps new entries locked out
    pub refractory_ttl_ms: u64,
    pub guardian_id: String,
    pub bullish_regimes: Vec<String>,
    pub bearish_regimes: Vec<String>,
    pub lateral_regimes: Vec<String>,
    pub reputation_backend: ReputationBackendKind,
    pub reputation_path: String,
    pub sqlite_path: String,
    pub wal_path: String,
    pub close_fail_escalate: u32,
    pub bus_capacity: usize,
    /// Milliseconds to let the bus drain after stdin closes
    pub drain_ms: u64,
    pub gateway: GatewayKind,
    pub paper_volume: f64,
    pub paper_slip: f64,
    pub paper_close_fail_rate: f64,
    pub paper_dup_close_rate: f64,
}

fn env_list(key: &str, default: &str) -> Vec<String> {
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            entry_threshold: 0.75,
            burst_threshold: 0.50,
            doubt_threshold: 0.2837,
            max_cluster: 10,
            burst_interval_ms: 20_000,
            burst_enabled: true,
            tp_target: 236.11,
            trail_trigger: 100.0,
            trail_ratio: 0.7979,
            daily_loss_limit: -10_000.0,
            refractory_ttl_ms: 15_000,
            guardian_id: "guardian_vestibular_v1".to_string(),
            bullish_regimes: vec!["5".to_string()],
            bearish_regimes: vec!["6".to_string()],
            lateral_regimes: vec!["0".to_string()],
            reputation_backend: ReputationBackendKind::Json,
            reputation_path: "./reputation.json".to_string(),
            sqlite_path: "./consensus.sqlite".to_string(),
            wal_path: "./risk.wal".to_string(),
            close_fail_escalate: 3,
            bus_capacity: 1024,
            drain_ms: 500,
            gateway: GatewayKind::None,
            paper_volume: 0.01,
            paper_slip: 0.0,
            paper_close_fail_rate: 0.0,
            paper_dup_close_rate: 0.0,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            entry_threshold: std::env::var("ENTRY_THRESHOLD").ok().and_then(|v| v.parse().ok()).unwrap_or(d.entry_threshold),
            burst_threshold: std::env::var("BURST_THRESHOLD").ok().and_then(|v| v.parse().ok()).unwrap_or(d.burst_threshold),
            doubt_threshold: std::env::var("DOUBT_THRESHOLD").ok().and_then(|v| v.parse().ok()).unwrap_or(d.doubt_threshold),
            max_cluster: std::env::var("MAX_CLUSTER").ok().and_then(|v| v.parse().ok()).unwrap_or(d.max_cluster),
            burst_interval_ms: std::env::var("BURST_INTERVAL").ok().and_then(|v| v.parse::<u64>().ok()).map(|s| s * 1000).unwrap_or(d.burst_interval_ms),
            burst_enabled: std::env::var("BURST_ENABLED").map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes")).unwrap_or(d.burst_enabled),
            tp_target: std::env::var("TP_TARGET").ok().and_then(|v| v.parse().ok()).unwrap_or(d.tp_target),
            trail_trigger: std::env::var("TRAIL_TRIGGER").ok().and_then(|v| v.parse().ok()).unwrap_or(d.trail_trigger),
            trail_ratio: std::env::var("TRAIL_RATIO").ok().and_then(|v| v.parse().ok()).unwrap_or(d.trail_ratio),
            daily_loss_limit: std::env::var("DAILY_LOSS_LIMIT").ok().and_then(|v| v.parse().ok()).unwrap_or(d.daily_loss_limit),
            refractory_ttl_ms: std::env::var("REFRACTORY_TTL").ok().and_then(|v| v.parse::<u64>().ok()).map(|s| s * 1000).unwrap_or(d.refractory_ttl_ms),
            guardian_id: std::env::var("GUARDIAN_ID").unwrap_or(d.guardian_id),
            bullish_regimes: env_list("BULLISH_REGIMES", "5"),
            bearish_regimes: env_list("BEARISH_REGIMES", "6"),
            lateral_regimes: env_list("LATERAL_REGIMES", "0"),
            reputation_backend: match std::env::var("REPUTATION_BACKEND").as_deref() {
                Ok("sqlite") => ReputationBackendKind::Sqlite,
                _ => ReputationBackendKind::Json,
            },
            reputation_path: std::env::var("REPUTATION_PATH").unwrap_or(d.reputation_path),
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or(d.sqlite_path),
            wal_path: std::env::var("WAL_PATH").unwrap_or(d.wal_path),
            close_fail_escalate: std::env::var("CLOSE_FAIL_ESCALATE").ok().and_then(|v| v.parse().ok()).unwrap_or(d.close_fail_escalate),
            bus_capacity: std::env::var("BUS_CAPACITY").ok().and_then(|v| v.parse().ok()).filter(|c: &usize| *c > 0).unwrap_or(d.bus_capacity),
            drain_ms: std::env::var("DRAIN_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.drain_ms),
            gateway: match std::env::var("GATEWAY").as_deref() {
                Ok("paper") => GatewayKind::Paper,
                _ => GatewayKind::None,
            },
            paper_volume: std::env::var("PAPER_VOLUME").ok().and_then(|v| v.parse().ok()).unwrap_or(d.paper_volume),
            paper_slip: std::env::var("PAPER_SLIP").ok().and_then(|v| v.parse().ok()).unwrap_or(d.paper_slip),
            paper_close_fail_rate: std::env::var("PAPER_CLOSE_FAIL_RATE").ok().and_then(|v| v.parse().ok()).unwrap_or(d.paper_close_fail_rate),
            paper_dup_close_rate: std::env::var("PAPER_DUP_CLOSE_RATE").ok().and_then(|v| v.parse().ok()).unwrap_or(d.paper_dup_close_rate),
        }
    }
}

/// Wall clock in epoch milliseconds.
pub fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Market (UTC) date of an event timestamp.
pub fn market_date(ts_ms: u64) -> NaiveDate {
    DateTime::from_timestamp_millis(ts_ms as i64)
        .map(|dt| dt.date_naive())
        .unwrap_or_default()
}

/// First millisecond of the market day after `ts_ms`.
pub fn end_of_market_day(ts_ms: u64) -> u64 {
    let next = market_date(ts_ms) + ChronoDuration::days(1);
    next.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp_millis().max(0) as u64)
        .unwrap_or(ts_ms)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "BUY", alias = "buy", alias = "Buy")]
    Buy,
    #[serde(rename = "SELL", alias = "sell", alias = "Sell")]
    Sell,
}

impl Side {
    pub fn sign(self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }

    /// Side a score points to; zero points nowhere.
    pub fn from_score(score: f64) -> Option<Side> {
        if score > 0.0 {
            Some(Side::Buy)
        } else if score < 0.0 {
            Some(Side::Sell)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub side: Side,
    pub entry_price: f64,
    pub volume: f64,
    #[serde(default)]
    pub ticket: Option<u64>,
}

impl Order {
    pub fn floating_pnl(&self, price: f64) -> f64 {
        self.side.sign() * (price - self.entry_price) * self.volume
    }
}

/// Orders of one open position group. All share one side.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cluster {
    pub orders: Vec<Order>,
    pub cluster_id: Option<u64>,
}

impl Cluster {
    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn side(&self) -> Option<Side> {
        self.orders.first().map(|o| o.side)
    }

    pub fn push(&mut self, order: Order) -> Result<(), CoreError> {
        if let Some(side) = self.side() {
            if side != order.side {
                return Err(CoreError::stale(format!(
                    "{} fill into open {} cluster",
                    order.side.as_str(),
                    side.as_str()
                )));
            }
        }
        self.orders.push(order);
        Ok(())
    }

    pub fn floating_pnl(&self, price: f64) -> f64 {
        self.orders.iter().map(|o| o.floating_pnl(price)).sum()
    }

    pub fn clear(&mut self) {
        self.orders.clear();
        self.cluster_id = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(side: Side, entry: f64) -> Order {
        Order { side, entry_price: entry, volume: 1.0, ticket: None }
    }

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.entry_threshold, 0.75);
        assert_eq!(cfg.doubt_threshold, 0.2837);
        assert_eq!(cfg.burst_interval_ms, 20_000);
        assert_eq!(cfg.refractory_ttl_ms, 15_000);
        assert_eq!(cfg.bullish_regimes, vec!["5".to_string()]);
        assert_eq!(cfg.drain_ms, 500);
    }

    #[test]
    fn test_drain_from_env() {
        std::env::set_var("DRAIN_MS", "1250");
        assert_eq!(Config::from_env().drain_ms, 1250);
        std::env::set_var("DRAIN_MS", "soon");
        assert_eq!(Config::from_env().drain_ms, 500);
        std::env::remove_var("DRAIN_MS");
    }

    #[test]
    fn test_cluster_rejects_mixed_sides() {
        let mut c = Cluster::default();
        c.push(order(Side::Buy, 100.0)).unwrap();
        c.push(order(Side::Buy, 101.0)).unwrap();
        assert!(c.push(order(Side::Sell, 102.0)).is_err());
        assert_eq!(c.len(), 2);
        assert_eq!(c.side(), Some(Side::Buy));
    }

    #[test]
    fn test_floating_pnl_signs() {
        let mut buy = Cluster::default();
        buy.push(order(Side::Buy, 100.0)).unwrap();
        assert_eq!(buy.floating_pnl(110.0), 10.0);
        let mut sell = Cluster::default();
        sell.push(order(Side::Sell, 100.0)).unwrap();
        assert_eq!(sell.floating_pnl(110.0), -10.0);
    }

    #[test]
    fn test_end_of_market_day() {
        // 2024-03-10T15:30:00Z
        let ts = 1_710_084_600_000;
        let eod = end_of_market_day(ts);
        // 2024-03-11T00:00:00Z
        assert_eq!(eod, 1_710_115_200_000);
        assert_ne!(market_date(ts), market_date(eod));
        assert_eq!(market_date(eod - 1), market_date(ts));
    }

    #[test]
    fn test_side_from_score() {
        assert_eq!(Side::from_score(0.8), Some(Side::Buy));
        assert_eq!(Side::from_score(-0.8), Some(Side::Sell));
        assert_eq!(Side::from_score(0.0), None);
    }
}
