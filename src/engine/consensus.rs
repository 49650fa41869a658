//! Consensus engine: vote cache -> weighted score -> entry/burst/doubt.
//!
//! The engine never changes cluster state on its own decisions. A `Decision`
//! is a request; the cluster only moves on the matching `ExecutionResult`.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::json;

use crate::error::CoreError;
use crate::events::{
    Action, Alert, ClusterReport, Decision, DecisionReason, ExecStatus, ExecutionResult, Origin,
    PositionReport, Pulse, Severity, StateSnapshot, Vestibular, Vote,
};
use crate::logging::{self, obj, v_num, v_str, Domain, Level};
use crate::regime::RegimeMap;
use crate::reliability::refractory::RefractoryLock;
use crate::reputation::ReputationMatrix;
use crate::state::{Config, Side};

/// Latest opinion of one expert. Overwritten on every vote.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CachedVote {
    pub direction: i8,
    pub confidence: f64,
}

/// `multiplier * sum(direction * weight[regime][expert] * confidence)` over
/// every cached expert except the guardian.
///
/// Pure: the same cache, matrix, regime and multiplier always give the same
/// score. The cache is ordered so the float sum is too.
pub fn consensus_score(
    votes: &BTreeMap<String, CachedVote>,
    reputation: &ReputationMatrix,
    regime: &str,
    multiplier: f64,
    guardian_id: &str,
) -> f64 {
    let sum: f64 = votes
        .iter()
        .filter(|(expert, _)| expert.as_str() != guardian_id)
        .map(|(expert, v)| f64::from(v.direction) * reputation.weight(regime, expert) * v.confidence)
        .sum();
    multiplier * sum
}

/// Result of one evaluation cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct PulseOutcome {
    pub snapshot: StateSnapshot,
    pub decision: Option<Decision>,
}

/// What an execution result did to the cluster.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecEffect {
    Filled { order_count: usize },
    Closed(ClusterReport),
    CloseFailed(Alert),
}

pub struct ConsensusEngine {
    cfg: Config,
    regimes: RegimeMap,
    refractory: RefractoryLock,
    reputation: ReputationMatrix,
    votes: BTreeMap<String, CachedVote>,
    vestibular_multiplier: f64,
    cluster_side: Option<Side>,
    order_count: usize,
    cluster_id: Option<u64>,
    last_closed_cluster: Option<u64>,
    last_burst_ms: Option<u64>,
    /// Event time of an entry request not yet answered by a fill.
    entry_in_flight_ms: Option<u64>,
    /// CONVICTION_LOSS sent for the open cluster.
    closing: bool,
    participants: BTreeSet<String>,
    entry_regime: Option<String>,
    last_regime: Option<String>,
    last_score: f64,
    reconciled: bool,
}

impl ConsensusEngine {
    pub fn new(cfg: Config, refractory: RefractoryLock, reputation: ReputationMatrix) -> Self {
        Self {
            regimes: RegimeMap::from_config(&cfg),
            cfg,
            refractory,
            reputation,
            votes: BTreeMap::new(),
            vestibular_multiplier: 1.0,
            cluster_side: None,
            order_count: 0,
            cluster_id: None,
            last_closed_cluster: None,
            last_burst_ms: None,
            entry_in_flight_ms: None,
            closing: false,
            participants: BTreeSet::new(),
            entry_regime: None,
            last_regime: None,
            last_score: 0.0,
            reconciled: false,
        }
    }

    pub fn cluster_side(&self) -> Option<Side> {
        self.cluster_side
    }

    pub fn order_count(&self) -> usize {
        self.order_count
    }

    pub fn vestibular_multiplier(&self) -> f64 {
        self.vestibular_multiplier
    }

    pub fn votes(&self) -> &BTreeMap<String, CachedVote> {
        &self.votes
    }

    pub fn last_score(&self) -> f64 {
        self.last_score
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    pub fn participants(&self) -> &BTreeSet<String> {
        &self.participants
    }

    pub fn reputation(&self) -> &ReputationMatrix {
        &self.reputation
    }

    pub fn last_closed_cluster(&self) -> Option<u64> {
        self.last_closed_cluster
    }

    pub fn set_reputation(&mut self, reputation: ReputationMatrix) {
        self.reputation = reputation;
    }

    // -------------------------------------------------------------------------
    // Inputs
    // -------------------------------------------------------------------------

    pub fn on_vote(&mut self, vote: &Vote) {
        if vote.expert_id == self.cfg.guardian_id {
            // The guardian speaks through the vestibular multiplier only.
            logging::log(
                Level::Debug,
                Domain::Consensus,
                "guardian_vote_ignored",
                obj(&[("expert_id", v_str(&vote.expert_id))]),
            );
            return;
        }
        self.votes.insert(
            vote.expert_id.clone(),
            CachedVote { direction: vote.direction, confidence: vote.confidence },
        );
        logging::agg_increment("vote");
    }

    pub fn on_vestibular(&mut self, msg: &Vestibular) -> Result<(), CoreError> {
        if !msg.action_potential.is_finite() {
            return Err(CoreError::transient("non-finite action_potential"));
        }
        self.vestibular_multiplier = msg.action_potential;
        Ok(())
    }

    /// A liquidation requested elsewhere holds the cluster closed: no bursts
    /// and no second CLOSE_ALL until `closed` arrives.
    pub fn on_decision(&mut self, decision: &Decision) {
        if decision.origin == Origin::Consensus
            || decision.action != Action::CloseAll
            || self.cluster_side.is_none()
            || self.closing
        {
            return;
        }
        self.closing = true;
        logging::log(
            Level::Info,
            Domain::Consensus,
            "external_close_pending",
            obj(&[
                ("origin", v_str(decision.origin.as_str())),
                ("reason", v_str(decision.reason.map(|r| r.as_str()).unwrap_or(""))),
                ("orders", json!(self.order_count)),
            ]),
        );
    }

    /// One evaluation cycle. Emits at most one decision.
    pub fn on_pulse(&mut self, pulse: &Pulse) -> PulseOutcome {
        let _scope = logging::ProfileScope::new("consensus_pulse");
        logging::agg_increment("pulse");

        let now = pulse.timestamp;
        let regime = pulse.regime_primary.as_str();
        let score = consensus_score(
            &self.votes,
            &self.reputation,
            regime,
            self.vestibular_multiplier,
            &self.cfg.guardian_id,
        );
        self.last_score = score;
        self.last_regime = Some(pulse.regime_primary.clone());
        let confluence = self
            .regimes
            .confluence(regime, pulse.regime_secondary.as_deref());

        let decision = match self.cluster_side {
            None => self.evaluate_entry(score, confluence, pulse),
            Some(side) => self.evaluate_open(side, score, confluence, pulse),
        };

        if let Some(d) = &decision {
            logging::log_decision(
                d.origin.as_str(),
                d.action.as_str(),
                d.reason.map(|r| r.as_str()).unwrap_or(""),
                d.consensus_score,
                d.regime.as_deref(),
            );
            logging::agg_increment("decision");
        }

        PulseOutcome {
            snapshot: StateSnapshot {
                score,
                regime: Some(pulse.regime_primary.clone()),
                cluster_side: self.cluster_side,
                order_count: self.order_count,
                vestibular_multiplier: self.vestibular_multiplier,
                timestamp: now,
            },
            decision,
        }
    }

    fn decision(&self, action: Action, reason: DecisionReason, score: f64, pulse: &Pulse) -> Decision {
        Decision {
            action,
            consensus_score: Some(score),
            regime: Some(pulse.regime_primary.clone()),
            reason: Some(reason),
            origin: Origin::Consensus,
            timestamp: pulse.timestamp,
        }
    }

    fn active_voters(&self) -> impl Iterator<Item = &String> {
        self.votes
            .iter()
            .filter(|(expert, v)| v.direction != 0 && expert.as_str() != self.cfg.guardian_id)
            .map(|(expert, _)| expert)
    }

    fn evaluate_entry(&mut self, score: f64, confluence: bool, pulse: &Pulse) -> Option<Decision> {
        let now = pulse.timestamp;
        if score.abs() < self.cfg.entry_threshold || !confluence {
            return None;
        }
        let side = Side::from_score(score)?;
        if self.refractory.is_active(now) {
            logging::log(
                Level::Debug,
                Domain::Consensus,
                "entry_refractory",
                obj(&[("score", v_num(score)), ("until", json!(self.refractory.expiry()))]),
            );
            return None;
        }
        if let Some(sent) = self.entry_in_flight_ms {
            if now < sent.saturating_add(self.cfg.burst_interval_ms) {
                return None;
            }
        }

        self.entry_in_flight_ms = Some(now);
        self.last_burst_ms = Some(now);
        self.participants = self.active_voters().cloned().collect();
        self.entry_regime = Some(pulse.regime_primary.clone());
        Some(self.decision(Action::from_side(side), DecisionReason::Entry, score, pulse))
    }

    fn evaluate_open(&mut self, side: Side, score: f64, confluence: bool, pulse: &Pulse) -> Option<Decision> {
        if self.closing {
            return None;
        }

        let doubt = self.cfg.doubt_threshold;
        let collapsed = match side {
            Side::Buy => score <= doubt,
            Side::Sell => score >= -doubt,
        };
        if collapsed {
            self.closing = true;
            return Some(self.decision(Action::CloseAll, DecisionReason::ConvictionLoss, score, pulse));
        }

        let now = pulse.timestamp;
        let elapsed_ok = self
            .last_burst_ms
            .map_or(true, |last| now.saturating_sub(last) >= self.cfg.burst_interval_ms);
        if self.cfg.burst_enabled
            && Side::from_score(score) == Some(side)
            && self.order_count < self.cfg.max_cluster
            && elapsed_ok
            && confluence
            && score.abs() >= self.cfg.burst_threshold
        {
            self.last_burst_ms = Some(now);
            let voters: Vec<String> = self.active_voters().cloned().collect();
            self.participants.extend(voters);
            return Some(self.decision(Action::from_side(side), DecisionReason::Burst, score, pulse));
        }
        None
    }

    fn next_cluster_id(&self) -> u64 {
        self.last_closed_cluster.map_or(1, |c| c + 1)
    }

    // -------------------------------------------------------------------------
    // Execution feedback
    // -------------------------------------------------------------------------

    pub fn on_execution_result(&mut self, result: &ExecutionResult) -> Result<ExecEffect, CoreError> {
        match result.status {
            ExecStatus::Executed => self.on_executed(result),
            ExecStatus::Closed => self.on_closed(result),
            ExecStatus::ErrorCierre => {
                let reason = result.reason.as_deref().unwrap_or("unknown");
                logging::log(
                    Level::Error,
                    Domain::Exec,
                    "close_failed",
                    obj(&[("origin", v_str("consensus")), ("reason", v_str(reason))]),
                );
                Ok(ExecEffect::CloseFailed(Alert {
                    severity: Severity::Error,
                    component: "consensus".to_string(),
                    message: format!("close failed ({}); cluster retained", reason),
                    timestamp: result.timestamp,
                }))
            }
        }
    }

    fn on_executed(&mut self, result: &ExecutionResult) -> Result<ExecEffect, CoreError> {
        let order = result.order()?;
        match self.cluster_side {
            Some(side) if side != order.side => {
                return Err(CoreError::stale(format!(
                    "{} fill into open {} cluster",
                    order.side.as_str(),
                    side.as_str()
                )));
            }
            Some(_) => {}
            None => {
                self.cluster_side = Some(order.side);
                self.cluster_id = Some(result.cluster_id.unwrap_or_else(|| self.next_cluster_id()));
                self.entry_in_flight_ms = None;
                if self.entry_regime.is_none() {
                    self.entry_regime = self.last_regime.clone();
                }
            }
        }
        self.order_count += 1;
        Ok(ExecEffect::Filled { order_count: self.order_count })
    }

    fn on_closed(&mut self, result: &ExecutionResult) -> Result<ExecEffect, CoreError> {
        if self.cluster_side.is_none() {
            return Err(CoreError::stale("closed while no cluster is open"));
        }
        if let (Some(id), Some(last)) = (result.cluster_id, self.last_closed_cluster) {
            if id <= last {
                return Err(CoreError::stale(format!("duplicate close for cluster {}", id)));
            }
        }

        let final_pnl = result.final_pnl.unwrap_or_else(|| {
            logging::log_message_error(Level::Warn, "stale_state", "closed without final_pnl, using 0");
            0.0
        });
        let cluster_id = result
            .cluster_id
            .or(self.cluster_id)
            .unwrap_or_else(|| self.next_cluster_id());
        let report = ClusterReport {
            cluster_id,
            win: final_pnl > 0.0,
            regime: self
                .entry_regime
                .take()
                .or_else(|| self.last_regime.clone())
                .unwrap_or_default(),
            final_pnl,
            experts: std::mem::take(&mut self.participants).into_iter().collect(),
            timestamp: result.timestamp,
        };

        let orders = self.order_count;
        self.cluster_side = None;
        self.order_count = 0;
        self.cluster_id = None;
        self.closing = false;
        self.entry_in_flight_ms = None;
        self.last_closed_cluster = Some(cluster_id);
        self.refractory.arm(result.timestamp, self.cfg.refractory_ttl_ms);

        logging::log_cluster_closed(Domain::Consensus, cluster_id, final_pnl, orders);
        Ok(ExecEffect::Closed(report))
    }

    /// Adopt the gateway's positions once, and only while nothing is open.
    pub fn on_position_report(&mut self, report: &PositionReport) -> Result<bool, CoreError> {
        if self.reconciled {
            return Err(CoreError::stale("position report after reconciliation"));
        }
        self.reconciled = true;
        if self.cluster_side.is_some() || report.orders.is_empty() {
            return Ok(false);
        }
        let side = report.orders[0].side;
        if report.orders.iter().any(|o| o.side != side) {
            return Err(CoreError::stale("position report mixes sides"));
        }
        self.cluster_side = Some(side);
        self.order_count = report.orders.len();
        self.cluster_id = Some(report.cluster_id.unwrap_or_else(|| self.next_cluster_id()));
        // Orphan cluster: nobody voted for it, so nobody is rewarded for it.
        self.participants.clear();
        self.entry_regime = None;
        logging::log(
            Level::Info,
            Domain::Audit,
            "cluster_adopted",
            obj(&[
                ("origin", v_str("consensus")),
                ("side", v_str(side.as_str())),
                ("orders", json!(self.order_count)),
                ("cluster_id", json!(self.cluster_id)),
            ]),
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Order;

    const T0: u64 = 1_710_084_600_000;

    fn engine() -> ConsensusEngine {
        ConsensusEngine::new(Config::default(), RefractoryLock::new(), ReputationMatrix::new())
    }

    fn vote(expert: &str, direction: i8, confidence: f64) -> Vote {
        Vote { expert_id: expert.into(), direction, confidence, timestamp: T0 }
    }

    fn pulse(ts: u64) -> Pulse {
        Pulse { regime_primary: "5".into(), regime_secondary: None, price: 100.0, timestamp: ts }
    }

    fn executed(side: Side, ts: u64, cluster_id: Option<u64>) -> ExecutionResult {
        ExecutionResult {
            status: ExecStatus::Executed,
            ticket: None,
            side: Some(side),
            price: Some(100.0),
            volume: Some(1.0),
            final_pnl: None,
            cluster_id,
            reason: None,
            timestamp: ts,
        }
    }

    fn closed(pnl: f64, ts: u64, cluster_id: Option<u64>) -> ExecutionResult {
        ExecutionResult {
            status: ExecStatus::Closed,
            ticket: None,
            side: None,
            price: None,
            volume: None,
            final_pnl: Some(pnl),
            cluster_id,
            reason: None,
            timestamp: ts,
        }
    }

    #[test]
    fn test_score_excludes_guardian_and_applies_multiplier() {
        let mut votes = BTreeMap::new();
        votes.insert("a".to_string(), CachedVote { direction: 1, confidence: 0.5 });
        votes.insert("b".to_string(), CachedVote { direction: -1, confidence: 1.0 });
        votes.insert("g".to_string(), CachedVote { direction: 1, confidence: 1.0 });
        let mut rep = ReputationMatrix::new();
        rep.set("5", "b", 0.5);
        let s = consensus_score(&votes, &rep, "5", 2.0, "g");
        // 2.0 * (0.5 - 0.5)
        assert_eq!(s, 0.0);
        let s = consensus_score(&votes, &rep, "6", 2.0, "g");
        // 2.0 * (0.5 - 1.0)
        assert_eq!(s, -1.0);
    }

    #[test]
    fn test_last_write_wins() {
        let mut e = engine();
        e.on_vote(&vote("a", 1, 1.0));
        e.on_vote(&vote("a", -1, 0.3));
        assert_eq!(e.votes().len(), 1);
        assert_eq!(e.votes()["a"], CachedVote { direction: -1, confidence: 0.3 });
    }

    #[test]
    fn test_guardian_vote_not_cached() {
        let mut e = engine();
        e.on_vote(&vote("guardian_vestibular_v1", 1, 1.0));
        assert!(e.votes().is_empty());
    }

    #[test]
    fn test_entry_threshold_inclusive() {
        let mut e = engine();
        e.on_vote(&vote("a", 1, 0.75));
        let out = e.on_pulse(&pulse(T0));
        let d = out.decision.unwrap();
        assert_eq!(d.action, Action::Buy);
        assert_eq!(d.reason, Some(DecisionReason::Entry));
        assert_eq!(out.snapshot.score, 0.75);
        // no local transition
        assert_eq!(e.cluster_side(), None);
    }

    #[test]
    fn test_below_entry_threshold_no_decision() {
        let mut e = engine();
        e.on_vote(&vote("a", -1, 0.74));
        assert!(e.on_pulse(&pulse(T0)).decision.is_none());
    }

    #[test]
    fn test_entry_needs_confluence() {
        let mut e = engine();
        e.on_vote(&vote("a", 1, 1.0));
        let mut p = pulse(T0);
        p.regime_secondary = Some("6".into());
        assert!(e.on_pulse(&p).decision.is_none());
        p.regime_secondary = Some("5".into());
        assert!(e.on_pulse(&p).decision.is_some());
    }

    #[test]
    fn test_entry_in_flight_not_repeated() {
        let mut e = engine();
        e.on_vote(&vote("a", 1, 1.0));
        assert!(e.on_pulse(&pulse(T0)).decision.is_some());
        assert!(e.on_pulse(&pulse(T0 + 1_000)).decision.is_none());
        assert!(e.on_pulse(&pulse(T0 + 20_000)).decision.is_some());
    }

    #[test]
    fn test_vestibular_multiplier_scales_score() {
        let mut e = engine();
        e.on_vote(&vote("a", 1, 1.0));
        e.on_vestibular(&Vestibular { action_potential: 0.1, is_stable: false, noise_level: None, timestamp: T0 })
            .unwrap();
        let out = e.on_pulse(&pulse(T0));
        assert!((out.snapshot.score - 0.1).abs() < 1e-12);
        assert!(out.decision.is_none());
    }

    #[test]
    fn test_first_fill_sets_side_and_count() {
        let mut e = engine();
        e.on_execution_result(&executed(Side::Sell, T0, Some(9))).unwrap();
        assert_eq!(e.cluster_side(), Some(Side::Sell));
        assert_eq!(e.order_count(), 1);
        assert!(e.on_execution_result(&executed(Side::Buy, T0, Some(9))).is_err());
        assert_eq!(e.order_count(), 1);
    }

    #[test]
    fn test_doubt_threshold_inclusive_for_sell() {
        let mut e = engine();
        e.on_execution_result(&executed(Side::Sell, T0, None)).unwrap();
        let mut rep = ReputationMatrix::new();
        rep.set("5", "a", 0.2837);
        e.set_reputation(rep);
        e.on_vote(&vote("a", -1, 1.0));
        // score = -0.2837 >= -DOUBT
        let d = e.on_pulse(&pulse(T0 + 1)).decision.unwrap();
        assert_eq!(d.action, Action::CloseAll);
        assert_eq!(d.reason, Some(DecisionReason::ConvictionLoss));
    }

    #[test]
    fn test_burst_interval_and_cap() {
        let mut cfg = Config::default();
        cfg.max_cluster = 2;
        let mut e = ConsensusEngine::new(cfg, RefractoryLock::new(), ReputationMatrix::new());
        e.on_vote(&vote("a", 1, 1.0));
        assert!(e.on_pulse(&pulse(T0)).decision.is_some());
        e.on_execution_result(&executed(Side::Buy, T0 + 10, None)).unwrap();
        // inside the interval
        assert!(e.on_pulse(&pulse(T0 + 19_999)).decision.is_none());
        let d = e.on_pulse(&pulse(T0 + 20_000)).decision.unwrap();
        assert_eq!(d.reason, Some(DecisionReason::Burst));
        e.on_execution_result(&executed(Side::Buy, T0 + 20_010, None)).unwrap();
        // cluster full
        assert!(e.on_pulse(&pulse(T0 + 60_000)).decision.is_none());
    }

    #[test]
    fn test_risk_close_all_holds_bursts() {
        let mut e = engine();
        e.on_vote(&vote("a", 1, 1.0));
        e.on_pulse(&pulse(T0));
        e.on_execution_result(&executed(Side::Buy, T0 + 10, Some(1))).unwrap();
        e.on_decision(&Decision {
            action: Action::CloseAll,
            consensus_score: None,
            regime: None,
            reason: Some(DecisionReason::Tp),
            origin: Origin::Risk,
            timestamp: T0 + 15_000,
        });
        assert!(e.is_closing());
        // the interval has passed and the score still clears the burst bar
        assert!(e.on_pulse(&pulse(T0 + 20_000)).decision.is_none());
        e.on_execution_result(&closed(300.0, T0 + 21_000, Some(1))).unwrap();
        assert!(!e.is_closing());
    }

    #[test]
    fn test_own_and_idle_decisions_do_not_close() {
        let mut e = engine();
        let risk_close = Decision {
            action: Action::CloseAll,
            consensus_score: None,
            regime: None,
            reason: Some(DecisionReason::Tp),
            origin: Origin::Risk,
            timestamp: T0,
        };
        // nothing open yet
        e.on_decision(&risk_close);
        assert!(!e.is_closing());

        e.on_vote(&vote("a", 1, 1.0));
        e.on_pulse(&pulse(T0));
        e.on_execution_result(&executed(Side::Buy, T0 + 10, None)).unwrap();
        e.on_decision(&Decision { action: Action::Buy, origin: Origin::Consensus, ..risk_close.clone() });
        assert!(!e.is_closing());
        assert!(e.on_pulse(&pulse(T0 + 20_000)).decision.is_some());
    }

    #[test]
    fn test_burst_disabled() {
        let mut cfg = Config::default();
        cfg.burst_enabled = false;
        let mut e = ConsensusEngine::new(cfg, RefractoryLock::new(), ReputationMatrix::new());
        e.on_vote(&vote("a", 1, 1.0));
        e.on_execution_result(&executed(Side::Buy, T0, None)).unwrap();
        assert!(e.on_pulse(&pulse(T0 + 60_000)).decision.is_none());
    }

    #[test]
    fn test_participants_accumulate_across_bursts() {
        let mut e = engine();
        e.on_vote(&vote("a", 1, 1.0));
        e.on_vote(&vote("z", 0, 1.0));
        e.on_pulse(&pulse(T0));
        e.on_execution_result(&executed(Side::Buy, T0, None)).unwrap();
        e.on_vote(&vote("b", 1, 1.0));
        e.on_pulse(&pulse(T0 + 20_000));
        let names: Vec<&str> = e.participants().iter().map(|s| s.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_closed_produces_report_and_arms_lock() {
        let lock = RefractoryLock::new();
        let mut e = ConsensusEngine::new(Config::default(), lock.clone(), ReputationMatrix::new());
        e.on_vote(&vote("a", 1, 1.0));
        e.on_pulse(&pulse(T0));
        e.on_execution_result(&executed(Side::Buy, T0, Some(3))).unwrap();
        let effect = e.on_execution_result(&closed(12.0, T0 + 5_000, Some(3))).unwrap();
        let ExecEffect::Closed(report) = effect else { panic!("expected close") };
        assert_eq!(report.cluster_id, 3);
        assert!(report.win);
        assert_eq!(report.regime, "5");
        assert_eq!(report.experts, vec!["a".to_string()]);
        assert_eq!(e.cluster_side(), None);
        assert_eq!(e.order_count(), 0);
        assert!(lock.is_active(T0 + 5_000 + 14_999));
        assert!(!lock.is_active(T0 + 5_000 + 15_000));
    }

    #[test]
    fn test_zero_pnl_is_not_a_win() {
        let mut e = engine();
        e.on_execution_result(&executed(Side::Buy, T0, None)).unwrap();
        let ExecEffect::Closed(report) = e.on_execution_result(&closed(0.0, T0, None)).unwrap() else {
            panic!("expected close")
        };
        assert!(!report.win);
    }

    #[test]
    fn test_close_failure_keeps_state() {
        let mut e = engine();
        e.on_execution_result(&executed(Side::Buy, T0, None)).unwrap();
        let mut r = closed(0.0, T0, None);
        r.status = ExecStatus::ErrorCierre;
        r.reason = Some("FALLO_MT5".into());
        let ExecEffect::CloseFailed(alert) = e.on_execution_result(&r).unwrap() else {
            panic!("expected alert")
        };
        assert_eq!(alert.severity, Severity::Error);
        assert_eq!(e.cluster_side(), Some(Side::Buy));
        assert_eq!(e.order_count(), 1);
    }

    #[test]
    fn test_reconcile_adopts_once_when_empty() {
        let mut e = engine();
        let report = PositionReport {
            orders: vec![
                Order { side: Side::Sell, entry_price: 10.0, volume: 1.0, ticket: Some(1) },
                Order { side: Side::Sell, entry_price: 11.0, volume: 1.0, ticket: Some(2) },
            ],
            cluster_id: Some(12),
            timestamp: T0,
        };
        assert!(e.on_position_report(&report).unwrap());
        assert_eq!(e.cluster_side(), Some(Side::Sell));
        assert_eq!(e.order_count(), 2);
        assert!(e.on_position_report(&report).is_err());
        assert_eq!(e.order_count(), 2);

        let ExecEffect::Closed(r) = e.on_execution_result(&closed(-5.0, T0, None)).unwrap() else {
            panic!("expected close")
        };
        assert_eq!(r.cluster_id, 12);
        assert!(r.experts.is_empty());
    }
}
