//! Structured logging for the decision organism.
//!
//! Design goals:
//! 1. Multi-level granularity (TRACE → FATAL)
//! 2. Domain-specific categories for filtering
//! 3. One JSON object per line, greppable by `component` and `event`
//! 4. Causal ids (`cluster_id`, `expert_id`, `regime`) promoted to the top level

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

// =============================================================================
// Log Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl Level {
    /// `LOG_LEVEL`, defaulting to info when unset or unknown.
    pub fn from_env() -> Self {
        std::env::var("LOG_LEVEL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(Level::Info)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

impl std::str::FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let level = match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Level::Trace,
            "debug" => Level::Debug,
            "info" => Level::Info,
            "warn" | "warning" => Level::Warn,
            "error" => Level::Error,
            "fatal" => Level::Fatal,
            other => return Err(format!("unknown log level {:?}", other)),
        };
        Ok(level)
    }
}

// =============================================================================
// Log Domains (categories for filtering)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Consensus,  // Vote cache, scoring, entry/burst/doubt
    Risk,       // Floating PnL, triggers, daily breaker
    Reputation, // Weight updates, persistence
    Bus,        // Ingress, decode failures, lag
    Exec,       // Execution results, gateway
    System,     // Startup, shutdown, recovery
    Profile,    // Performance profiling
    Audit,      // WAL / reconciliation trail
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Consensus => "consensus",
            Domain::Risk => "risk",
            Domain::Reputation => "reputation",
            Domain::Bus => "bus",
            Domain::Exec => "exec",
            Domain::System => "system",
            Domain::Profile => "profile",
            Domain::Audit => "audit",
        }
    }

    pub fn is_enabled(&self) -> bool {
        // LOG_DOMAINS: comma-separated list or "all"
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

// =============================================================================
// Run context
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static PROFILE_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug)]
struct RunContext {
    run_id: String,
    events: Option<Mutex<BufWriter<File>>>,
    trace: Option<Mutex<BufWriter<File>>>,
}

fn open_sink(path: PathBuf) -> Option<Mutex<BufWriter<File>>> {
    match File::create(&path) {
        Ok(f) => Some(Mutex::new(BufWriter::new(f))),
        Err(err) => {
            eprintln!("[log] failed to create {}: {}", path.display(), err);
            None
        }
    }
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), process::id()));
        let base = std::env::var("LOG_DIR").unwrap_or_else(|_| "out/runs".to_string());
        // "-" keeps everything on stdout
        if base == "-" {
            return RunContext { run_id, events: None, trace: None };
        }
        let mut run_dir = PathBuf::from(base);
        run_dir.push(&run_id);
        if let Err(err) = create_dir_all(&run_dir) {
            eprintln!("[log] failed to create run dir: {}", err);
            return RunContext { run_id, events: None, trace: None };
        }

        let _ = std::fs::write(
            run_dir.join("manifest.json"),
            json!({
                "run_id": run_id,
                "ts": ts_now(),
                "pid": process::id(),
                "log_dir": run_dir.to_string_lossy(),
            })
            .to_string(),
        );

        RunContext {
            events: open_sink(run_dir.join("events.jsonl")),
            trace: open_sink(run_dir.join("trace.jsonl")),
            run_id,
        }
    })
}

fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut top = Map::new();
    for key in ["cluster_id", "expert_id", "regime", "origin", "msg"] {
        if let Some(value) = fields.remove(key) {
            top.insert(key.to_string(), value);
        }
    }
    (top, fields)
}

fn write_line(writer: &Option<Mutex<BufWriter<File>>>, line: &str) {
    if let Some(writer) = writer {
        if let Ok(mut w) = writer.lock() {
            let _ = writeln!(w, "{}", line);
            let _ = w.flush();
        }
    }
}

// =============================================================================
// Core logging functions
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Epoch milliseconds
pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    let min_level = Level::from_env();
    if level < min_level || !domain.is_enabled() {
        return;
    }

    emit_record(level, domain.as_str(), event, fields);
}

fn emit_record(level: Level, component: &str, event: &str, fields: Map<String, Value>) {
    let ctx = ensure_run_context();
    let (mut top, data) = split_fields(fields);

    let msg = top.remove("msg").unwrap_or(Value::String(String::new()));
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(ctx.run_id.clone()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(component));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    for (k, v) in top {
        entry.insert(k, v);
    }
    entry.insert("data".to_string(), Value::Object(data));

    let line = Value::Object(entry).to_string();
    match level {
        Level::Trace | Level::Debug => write_line(&ctx.trace, &line),
        _ => write_line(&ctx.events, &line),
    }
    println!("{}", line);
}

// =============================================================================
// Domain helpers
// =============================================================================

/// Log an outbound decision with the context that produced it
pub fn log_decision(origin: &str, action: &str, reason: &str, score: Option<f64>, regime: Option<&str>) {
    log(
        Level::Info,
        if origin == "risk" { Domain::Risk } else { Domain::Consensus },
        "decision",
        obj(&[
            ("origin", v_str(origin)),
            ("action", v_str(action)),
            ("reason", v_str(reason)),
            ("score", score.map(v_num).unwrap_or(Value::Null)),
            ("regime", regime.map(v_str).unwrap_or(Value::Null)),
        ]),
    );
}

/// Log a risk trigger evaluation that fired
pub fn log_risk_trigger(trigger: &str, floating_pnl: f64, daily_realized_pnl: f64, high_water_mark: f64) {
    log(
        Level::Warn,
        Domain::Risk,
        "trigger",
        obj(&[
            ("trigger", v_str(trigger)),
            ("floating_pnl", v_num(floating_pnl)),
            ("daily_realized_pnl", v_num(daily_realized_pnl)),
            ("high_water_mark", v_num(high_water_mark)),
        ]),
    );
}

pub fn log_cluster_closed(component: Domain, cluster_id: u64, final_pnl: f64, orders: usize) {
    log(
        Level::Info,
        component,
        "cluster_closed",
        obj(&[
            ("cluster_id", json!(cluster_id)),
            ("final_pnl", v_num(final_pnl)),
            ("orders", json!(orders)),
        ]),
    );
}

pub fn log_reputation_update(regime: &str, expert_id: &str, before: f64, after: f64) {
    log(
        Level::Info,
        Domain::Reputation,
        "weight_update",
        obj(&[
            ("regime", v_str(regime)),
            ("expert_id", v_str(expert_id)),
            ("before", v_num(before)),
            ("after", v_num(after)),
        ]),
    );
}

/// Log a message that could not be applied; the receive loop keeps going
pub fn log_message_error(level: Level, class: &str, detail: &str) {
    log(
        level,
        Domain::Bus,
        "message_error",
        obj(&[("class", v_str(class)), ("detail", v_str(detail))]),
    );
}

// =============================================================================
// Utility Functions
// =============================================================================

/// Short stable digest for config and parameter sets (first 16 hex chars of SHA-256).
pub fn params_hash(input: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[..8])
}

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}

// =============================================================================
// Timing
// =============================================================================

static PROFILE_RATE: OnceLock<f64> = OnceLock::new();

/// Fraction of scopes that report, from `PROFILE_SAMPLE` (default 1.0).
fn profile_rate() -> f64 {
    *PROFILE_RATE.get_or_init(|| {
        std::env::var("PROFILE_SAMPLE")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .map(|p| p.clamp(0.0, 1.0))
            .unwrap_or(1.0)
    })
}

/// Deterministic sampling: every scope takes a slot in a 10k-wide ring.
fn sampled(rate: f64) -> bool {
    if rate >= 1.0 {
        return true;
    }
    if rate <= 0.0 {
        return false;
    }
    let slot = PROFILE_SEQ.fetch_add(1, Ordering::Relaxed) % 10_000;
    (slot as f64) < rate * 10_000.0
}

/// Logs the wall time of a scope at trace level when dropped.
pub struct ProfileScope {
    label: &'static str,
    fields: Map<String, Value>,
    started: Option<Instant>,
}

impl ProfileScope {
    pub fn new(label: &'static str) -> Self {
        Self::with_context(label, &[])
    }

    pub fn with_context(label: &'static str, fields: &[(&str, Value)]) -> Self {
        if !sampled(profile_rate()) {
            return Self { label, fields: Map::new(), started: None };
        }
        Self { label, fields: obj(fields), started: Some(Instant::now()) }
    }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        let Some(started) = self.started else {
            return;
        };
        let mut fields = std::mem::take(&mut self.fields);
        fields.insert("label".to_string(), v_str(self.label));
        fields.insert("elapsed_us".to_string(), json!(started.elapsed().as_micros() as u64));
        log(Level::Trace, Domain::Profile, "profile", fields);
    }
}

// =============================================================================
// Periodic counters
// =============================================================================

/// Message counts since the last `aggregated_stats` record.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AggregateCounts {
    pub votes: u64,
    pub pulses: u64,
    pub decisions: u64,
    pub closes: u64,
    pub dropped: u64,
}

impl AggregateCounts {
    fn bump(&mut self, event: &str) {
        let slot = match event {
            "vote" => &mut self.votes,
            "pulse" => &mut self.pulses,
            "decision" => &mut self.decisions,
            "close" => &mut self.closes,
            "dropped" => &mut self.dropped,
            _ => return,
        };
        *slot += 1;
    }

    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

struct Aggregator {
    counts: AggregateCounts,
    window_start: Instant,
    window_secs: u64,
}

impl Aggregator {
    fn from_env() -> Self {
        Self {
            counts: AggregateCounts::default(),
            window_start: Instant::now(),
            window_secs: std::env::var("LOG_FLUSH_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
        }
    }

    /// Hand out the counts once the window has elapsed and start a new one.
    fn take_if_due(&mut self) -> Option<AggregateCounts> {
        if self.window_start.elapsed().as_secs() < self.window_secs {
            return None;
        }
        self.window_start = Instant::now();
        Some(std::mem::take(&mut self.counts))
    }
}

static AGGREGATOR: OnceLock<Mutex<Aggregator>> = OnceLock::new();

fn aggregator() -> &'static Mutex<Aggregator> {
    AGGREGATOR.get_or_init(|| Mutex::new(Aggregator::from_env()))
}

pub fn agg_increment(event: &str) {
    if let Ok(mut agg) = aggregator().lock() {
        agg.counts.bump(event);
    }
}

/// Emit `aggregated_stats` when the window is due. Quiet windows are skipped.
pub fn tick_aggregator() {
    let due = aggregator().lock().ok().and_then(|mut agg| agg.take_if_due());
    let Some(c) = due.filter(|c| !c.is_empty()) else {
        return;
    };
    log(
        Level::Info,
        Domain::System,
        "aggregated_stats",
        obj(&[
            ("votes", json!(c.votes)),
            ("pulses", json!(c.pulses)),
            ("decisions", json!(c.decisions)),
            ("closes", json!(c.closes)),
            ("dropped", json!(c.dropped)),
        ]),
    );
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
        assert!(Level::Error < Level::Fatal);
    }

    #[test]
    fn test_params_hash_deterministic() {
        assert_eq!(params_hash("cluster-7"), params_hash("cluster-7"));
        assert_ne!(params_hash("cluster-7"), params_hash("cluster-8"));
    }

    #[test]
    fn test_split_fields_promotes_ids() {
        let fields = obj(&[
            ("cluster_id", json!(3)),
            ("expert_id", v_str("momentum_v1")),
            ("weight", v_num(1.1)),
        ]);
        let (top, data) = split_fields(fields);
        assert_eq!(top.get("cluster_id").unwrap(), 3);
        assert_eq!(top.get("expert_id").unwrap(), "momentum_v1");
        assert!(data.contains_key("weight"));
        assert!(!data.contains_key("cluster_id"));
    }

    #[test]
    fn test_aggregator_window() {
        let mut agg = Aggregator::from_env();
        for event in ["vote", "vote", "close", "unknown"] {
            agg.counts.bump(event);
        }
        assert_eq!(agg.counts.votes, 2);
        assert_eq!(agg.counts.closes, 1);

        agg.window_secs = 3_600;
        assert!(agg.take_if_due().is_none());
        agg.window_secs = 0;
        let taken = agg.take_if_due().unwrap();
        assert_eq!(taken.votes, 2);
        assert!(agg.counts.is_empty());
    }

    #[test]
    fn test_sampling_bounds() {
        assert!(sampled(1.0));
        assert!(!sampled(0.0));
    }

    #[test]
    fn test_level_parse() {
        assert_eq!("warn".parse::<Level>(), Ok(Level::Warn));
        assert_eq!("FATAL".parse::<Level>(), Ok(Level::Fatal));
        assert!("loud".parse::<Level>().is_err());
    }

    #[test]
    fn test_seq_increments() {
        let s1 = next_seq();
        let s2 = next_seq();
        assert!(s2 > s1);
    }
}
