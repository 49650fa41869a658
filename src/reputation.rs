//! Per-regime expert weights and their persistence.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::events::ClusterReport;
use crate::logging::{self, obj, v_str, Domain, Level};

pub const MIN_WEIGHT: f64 = 0.1;
pub const MAX_WEIGHT: f64 = 5.0;
pub const DEFAULT_WEIGHT: f64 = 1.0;
pub const WIN_DELTA: f64 = 0.10;
pub const LOSS_DELTA: f64 = -0.25;

/// `regime -> expert -> weight`. Unseen pairs weigh `DEFAULT_WEIGHT`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReputationMatrix {
    weights: BTreeMap<String, BTreeMap<String, f64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeightChange {
    pub regime: String,
    pub expert_id: String,
    pub before: f64,
    pub after: f64,
}

impl ReputationMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn weight(&self, regime: &str, expert_id: &str) -> f64 {
        self.weights
            .get(regime)
            .and_then(|m| m.get(expert_id))
            .copied()
            .unwrap_or(DEFAULT_WEIGHT)
    }

    /// Set a weight, clamped into bounds. Non-finite values are ignored.
    pub fn set(&mut self, regime: &str, expert_id: &str, weight: f64) {
        if !weight.is_finite() {
            return;
        }
        self.weights
            .entry(regime.to_string())
            .or_default()
            .insert(expert_id.to_string(), weight.clamp(MIN_WEIGHT, MAX_WEIGHT));
    }

    pub fn len(&self) -> usize {
        self.weights.values().map(|m| m.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str, f64)> {
        self.weights
            .iter()
            .flat_map(|(r, m)| m.iter().map(move |(e, w)| (r.as_str(), e.as_str(), *w)))
    }

    /// Build from persisted rows without validation; follow with `sanitize`.
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, String, f64)>,
    {
        let mut weights: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
        for (regime, expert, w) in entries {
            weights.entry(regime).or_default().insert(expert, w);
        }
        Self { weights }
    }

    /// Drop non-finite weights and clamp the rest. Returns how many were touched.
    pub fn sanitize(&mut self) -> usize {
        let mut touched = 0;
        for experts in self.weights.values_mut() {
            experts.retain(|_, w| {
                if w.is_finite() {
                    true
                } else {
                    touched += 1;
                    false
                }
            });
            for w in experts.values_mut() {
                let clamped = w.clamp(MIN_WEIGHT, MAX_WEIGHT);
                if clamped != *w {
                    *w = clamped;
                    touched += 1;
                }
            }
        }
        self.weights.retain(|_, m| !m.is_empty());
        touched
    }

    /// Reward or penalize every participant of a resolved cluster in its regime.
    pub fn apply_outcome(&mut self, report: &ClusterReport) -> Vec<WeightChange> {
        let delta = if report.win { WIN_DELTA } else { LOSS_DELTA };
        let experts: BTreeSet<&String> = report.experts.iter().collect();
        let mut changes = Vec::with_capacity(experts.len());
        for expert in experts {
            let before = self.weight(&report.regime, expert);
            let after = (before + delta).clamp(MIN_WEIGHT, MAX_WEIGHT);
            self.set(&report.regime, expert, after);
            changes.push(WeightChange {
                regime: report.regime.clone(),
                expert_id: expert.clone(),
                before,
                after,
            });
        }
        changes
    }

    /// SHA-256 over the canonical entry list, weights rounded to 1e-9.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for (regime, expert, w) in self.entries() {
            hasher.update(format!("{}\t{}\t{:.9}\n", regime, expert, w).as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

// =============================================================================
// Backends
// =============================================================================

pub trait ReputationBackend: Send {
    fn load(&self) -> Result<ReputationMatrix>;
    fn save(&mut self, matrix: &ReputationMatrix) -> Result<()>;
    /// Keep a resolved cluster in the outcome history, where supported.
    fn record_outcome(&mut self, _report: &ClusterReport) -> Result<()> {
        Ok(())
    }
    fn describe(&self) -> String;
}

/// Nested JSON document `{regime: {expert: weight}}`, replaced atomically.
#[derive(Debug, Clone)]
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "reputation.json".to_string());
        self.path
            .with_file_name(format!(".{}.tmp.{}", name, std::process::id()))
    }
}

fn parse_document(text: &str) -> Result<ReputationMatrix> {
    if text.trim().is_empty() {
        return Ok(ReputationMatrix::new());
    }
    let doc: Value = serde_json::from_str(text).context("reputation document is not JSON")?;
    let regimes = doc
        .as_object()
        .context("reputation document must be an object")?;
    let mut entries = Vec::new();
    for (regime, experts) in regimes {
        let Some(experts) = experts.as_object() else {
            continue;
        };
        for (expert, w) in experts {
            // Non-numeric weights are dropped like non-finite ones.
            let w = w.as_f64().unwrap_or(f64::NAN);
            entries.push((regime.clone(), expert.clone(), w));
        }
    }
    Ok(ReputationMatrix::from_entries(entries))
}

fn sync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent() {
        let dir = if parent.as_os_str().is_empty() { Path::new(".") } else { parent };
        if let Ok(d) = File::open(dir) {
            let _ = d.sync_all();
        }
    }
}

impl ReputationBackend for JsonFileBackend {
    fn load(&self) -> Result<ReputationMatrix> {
        if !self.path.exists() {
            return Ok(ReputationMatrix::new());
        }
        let text = fs::read_to_string(&self.path)
            .with_context(|| format!("read {}", self.path.display()))?;
        parse_document(&text).with_context(|| format!("parse {}", self.path.display()))
    }

    fn save(&mut self, matrix: &ReputationMatrix) -> Result<()> {
        let tmp = self.temp_path();
        let body = serde_json::to_string_pretty(matrix)?;
        {
            let mut f = File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
            f.write_all(body.as_bytes())?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("rename {} -> {}", tmp.display(), self.path.display()))?;
        sync_parent_dir(&self.path);
        Ok(())
    }

    fn describe(&self) -> String {
        format!("json:{}", self.path.display())
    }
}

// =============================================================================
// Store
// =============================================================================

/// Owns the backend and the last matrix this process loaded or wrote.
///
/// Single writer is asserted, not assumed: before each update the persisted
/// matrix is re-read and compared by fingerprint.
pub struct ReputationStore {
    backend: Box<dyn ReputationBackend>,
    matrix: ReputationMatrix,
    fingerprint: String,
}

impl ReputationStore {
    pub fn open(backend: Box<dyn ReputationBackend>) -> Result<Self> {
        let mut store = Self {
            backend,
            matrix: ReputationMatrix::new(),
            fingerprint: String::new(),
        };
        store.reload()?;
        logging::log(
            Level::Info,
            Domain::Reputation,
            "store_opened",
            obj(&[
                ("backend", v_str(&store.backend.describe())),
                ("entries", json!(store.matrix.len())),
                ("fingerprint", v_str(&store.fingerprint)),
            ]),
        );
        Ok(store)
    }

    pub fn matrix(&self) -> &ReputationMatrix {
        &self.matrix
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    fn load_sanitized(&self) -> Result<ReputationMatrix> {
        let mut matrix = self.backend.load()?;
        let touched = matrix.sanitize();
        if touched > 0 {
            logging::log(
                Level::Warn,
                Domain::Reputation,
                "weights_sanitized",
                obj(&[("touched", json!(touched))]),
            );
        }
        Ok(matrix)
    }

    /// Re-read the persisted matrix.
    pub fn reload(&mut self) -> Result<&ReputationMatrix> {
        self.matrix = self.load_sanitized()?;
        self.fingerprint = self.matrix.fingerprint();
        Ok(&self.matrix)
    }

    /// Apply a resolved cluster and persist before returning.
    pub fn apply_outcome(&mut self, report: &ClusterReport) -> Result<Vec<WeightChange>> {
        let persisted = self.load_sanitized()?;
        let persisted_fp = persisted.fingerprint();
        if persisted_fp != self.fingerprint {
            logging::log(
                Level::Warn,
                Domain::Reputation,
                "concurrent_writer",
                obj(&[
                    ("backend", v_str(&self.backend.describe())),
                    ("expected", v_str(&self.fingerprint)),
                    ("found", v_str(&persisted_fp)),
                ]),
            );
            self.matrix = persisted;
        }

        let changes = self.matrix.apply_outcome(report);
        self.backend.record_outcome(report)?;
        self.backend.save(&self.matrix)?;
        self.fingerprint = self.matrix.fingerprint();

        for c in &changes {
            logging::log_reputation_update(&c.regime, &c.expert_id, c.before, c.after);
        }
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn report(win: bool, experts: &[&str]) -> ClusterReport {
        ClusterReport {
            cluster_id: 1,
            win,
            regime: "5".into(),
            final_pnl: if win { 10.0 } else { -10.0 },
            experts: experts.iter().map(|e| e.to_string()).collect(),
            timestamp: 1_710_084_600_000,
        }
    }

    #[test]
    fn test_default_weight() {
        let m = ReputationMatrix::new();
        assert_eq!(m.weight("5", "anyone"), 1.0);
    }

    #[test]
    fn test_win_and_loss_deltas() {
        let mut m = ReputationMatrix::new();
        m.apply_outcome(&report(true, &["a"]));
        assert!((m.weight("5", "a") - 1.1).abs() < 1e-12);
        m.apply_outcome(&report(false, &["a"]));
        assert!((m.weight("5", "a") - 0.85).abs() < 1e-12);
        assert_eq!(m.weight("6", "a"), 1.0);
    }

    #[test]
    fn test_weights_stay_in_bounds() {
        let mut m = ReputationMatrix::new();
        for _ in 0..100 {
            m.apply_outcome(&report(true, &["up"]));
            m.apply_outcome(&report(false, &["down"]));
        }
        assert_eq!(m.weight("5", "up"), MAX_WEIGHT);
        assert_eq!(m.weight("5", "down"), MIN_WEIGHT);
    }

    #[test]
    fn test_duplicate_participants_counted_once() {
        let mut m = ReputationMatrix::new();
        let changes = m.apply_outcome(&report(true, &["a", "a"]));
        assert_eq!(changes.len(), 1);
        assert!((m.weight("5", "a") - 1.1).abs() < 1e-12);
    }

    #[test]
    fn test_sanitize() {
        let mut m = ReputationMatrix::from_entries(vec![
            ("5".to_string(), "a".to_string(), 9.0),
            ("5".to_string(), "b".to_string(), f64::NAN),
            ("5".to_string(), "c".to_string(), 0.0),
            ("5".to_string(), "d".to_string(), 2.0),
        ]);
        assert_eq!(m.sanitize(), 3);
        assert_eq!(m.weight("5", "a"), MAX_WEIGHT);
        assert_eq!(m.weight("5", "b"), DEFAULT_WEIGHT);
        assert_eq!(m.weight("5", "c"), MIN_WEIGHT);
        assert_eq!(m.weight("5", "d"), 2.0);
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let mut a = ReputationMatrix::new();
        let b = ReputationMatrix::new();
        assert_eq!(a.fingerprint(), b.fingerprint());
        a.set("5", "x", 1.2);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_json_backend_roundtrip_and_nested_format() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reputation.json");
        let mut backend = JsonFileBackend::new(&path);
        assert!(backend.load().unwrap().is_empty());

        let mut m = ReputationMatrix::new();
        m.set("5", "momentum_v1", 1.3);
        backend.save(&m).unwrap();

        let doc: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["5"]["momentum_v1"], 1.3);
        assert_eq!(backend.load().unwrap(), m);
        // no temp file left behind
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_json_backend_rejects_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reputation.json");
        fs::write(&path, "{not json").unwrap();
        assert!(JsonFileBackend::new(&path).load().is_err());
    }

    #[test]
    fn test_store_detects_concurrent_writer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reputation.json");
        let mut store = ReputationStore::open(Box::new(JsonFileBackend::new(&path))).unwrap();

        // Another process writes behind our back.
        let mut peer = JsonFileBackend::new(&path);
        let mut theirs = ReputationMatrix::new();
        theirs.set("5", "b", 3.0);
        peer.save(&theirs).unwrap();

        store.apply_outcome(&report(true, &["a"])).unwrap();
        let reloaded = store.reload().unwrap();
        // Peer state absorbed, our update applied on top.
        assert_eq!(reloaded.weight("5", "b"), 3.0);
        assert!((reloaded.weight("5", "a") - 1.1).abs() < 1e-12);
    }
}
