//! Risk supervisor: mirrors the open cluster, marks it to market on every
//! tick and forces liquidation on take-profit, trailing stop or the daily
//! loss breaker.

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::json;

use crate::error::CoreError;
use crate::events::{
    Action, Alert, Decision, DecisionReason, ExecStatus, ExecutionResult, Origin, PositionReport,
    Pulse, RiskStatus, Severity, Tick,
};
use crate::logging::{self, obj, v_num, v_str, Domain, Level};
use crate::reliability::circuit::CircuitBreaker;
use crate::reliability::refractory::RefractoryLock;
use crate::reliability::wal::{RecoveryState, Wal, WalEntry};
use crate::state::{end_of_market_day, market_date, Cluster, Config, Order};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RiskState {
    pub floating_pnl: f64,
    pub daily_realized_pnl: f64,
    pub high_water_mark: f64,
    pub refractory_until: Option<u64>,
}

pub struct RiskSupervisor {
    cfg: Config,
    refractory: RefractoryLock,
    cluster: Cluster,
    floating_pnl: f64,
    daily_realized_pnl: f64,
    high_water_mark: f64,
    /// CLOSE_ALL sent, waiting for `closed`.
    closing: bool,
    current_day: Option<NaiveDate>,
    last_regime: Option<String>,
    last_closed_cluster: Option<u64>,
    close_breaker: CircuitBreaker,
    wal: Option<Wal>,
    reconciled: bool,
}

impl RiskSupervisor {
    pub fn new(cfg: Config, refractory: RefractoryLock) -> Self {
        Self {
            close_breaker: CircuitBreaker::new(cfg.close_fail_escalate),
            cfg,
            refractory,
            cluster: Cluster::default(),
            floating_pnl: 0.0,
            daily_realized_pnl: 0.0,
            high_water_mark: 0.0,
            closing: false,
            current_day: None,
            last_regime: None,
            last_closed_cluster: None,
            wal: None,
            reconciled: false,
        }
    }

    pub fn with_wal(mut self, wal: Wal) -> Self {
        self.wal = Some(wal);
        self
    }

    /// Restore the realized PnL of the journal's last market day.
    ///
    /// The day stays unset for an empty journal and is then taken from the
    /// first market timestamp. Closed cluster ids are not restored: a gateway
    /// may number clusters per session, so the duplicate-close watermark only
    /// spans this process.
    pub fn recover(&mut self, state: &RecoveryState) {
        self.current_day = state.market_day;
        self.daily_realized_pnl = state.daily_realized_pnl;
        if let Some(last_ts) = state.last_event_ts {
            if self.daily_realized_pnl <= self.cfg.daily_loss_limit {
                self.refractory.arm_until(end_of_market_day(last_ts));
            }
        }
        logging::log(
            Level::Info,
            Domain::Audit,
            "risk_recovered",
            obj(&[
                ("market_day", json!(state.market_day.map(|d| d.to_string()))),
                ("daily_realized_pnl", v_num(self.daily_realized_pnl)),
                ("journal_last_cluster", json!(state.last_closed_cluster)),
                ("fills_since_close", json!(state.fills_since_close)),
                ("skipped_lines", json!(state.skipped_lines)),
            ]),
        );
    }

    pub fn state(&self) -> RiskState {
        RiskState {
            floating_pnl: self.floating_pnl,
            daily_realized_pnl: self.daily_realized_pnl,
            high_water_mark: self.high_water_mark,
            refractory_until: self.refractory.expiry(),
        }
    }

    /// Exposure view for the bus.
    pub fn status(&self, timestamp: u64) -> RiskStatus {
        RiskStatus {
            open_orders: self.cluster.len(),
            floating_pnl: (self.floating_pnl * 100.0).round() / 100.0,
            daily_pnl: (self.daily_realized_pnl * 100.0).round() / 100.0,
            high_water_mark: self.high_water_mark,
            closing: self.closing,
            timestamp,
        }
    }

    pub fn orders(&self) -> &[Order] {
        &self.cluster.orders
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    pub fn last_closed_cluster(&self) -> Option<u64> {
        self.last_closed_cluster
    }

    fn journal(&mut self, entry: WalEntry) {
        if let Some(wal) = self.wal.as_mut() {
            if let Err(err) = wal.append_entry(&entry) {
                logging::log(
                    Level::Error,
                    Domain::Audit,
                    "wal_write_failed",
                    obj(&[("path", v_str(wal.path())), ("error", v_str(&err.to_string()))]),
                );
            }
        }
    }

    /// Zero the realized PnL when the market date moves forward.
    fn roll_day(&mut self, ts: u64) {
        let day = market_date(ts);
        match self.current_day {
            None => self.current_day = Some(day),
            Some(cur) if day > cur => {
                let closed_day_pnl = self.daily_realized_pnl;
                self.daily_realized_pnl = 0.0;
                self.current_day = Some(day);
                self.journal(WalEntry::Rollover { ts, closed_day_pnl });
                logging::log(
                    Level::Info,
                    Domain::Risk,
                    "daily_rollover",
                    obj(&[
                        ("day", v_str(&day.to_string())),
                        ("closed_day_pnl", v_num(closed_day_pnl)),
                        ("open_orders", json!(self.cluster.len())),
                    ]),
                );
            }
            Some(_) => {}
        }
    }

    pub fn on_pulse(&mut self, pulse: &Pulse) {
        self.last_regime = Some(pulse.regime_primary.clone());
    }

    /// Mark to market; returns a forced CLOSE_ALL when a trigger fires.
    pub fn on_tick(&mut self, tick: &Tick) -> Option<Decision> {
        self.roll_day(tick.timestamp);
        if self.cluster.is_empty() {
            self.floating_pnl = 0.0;
            return None;
        }
        let _scope = logging::ProfileScope::with_context("risk_tick", &[("orders", json!(self.cluster.len()))]);

        self.floating_pnl = self.cluster.floating_pnl(tick.price);
        self.high_water_mark = self.high_water_mark.max(self.floating_pnl);
        if self.closing {
            return None;
        }

        let reason = self.evaluate_triggers()?;
        self.closing = true;
        logging::log_risk_trigger(
            reason.as_str(),
            self.floating_pnl,
            self.daily_realized_pnl,
            self.high_water_mark,
        );
        let decision = Decision {
            action: Action::CloseAll,
            consensus_score: None,
            regime: self.last_regime.clone(),
            reason: Some(reason),
            origin: Origin::Risk,
            timestamp: tick.timestamp,
        };
        logging::log_decision(
            Origin::Risk.as_str(),
            Action::CloseAll.as_str(),
            reason.as_str(),
            None,
            decision.regime.as_deref(),
        );
        Some(decision)
    }

    /// Priority: daily breaker, then take-profit, then trailing stop.
    fn evaluate_triggers(&self) -> Option<DecisionReason> {
        let floating = self.floating_pnl;
        if self.daily_realized_pnl + floating <= self.cfg.daily_loss_limit {
            Some(DecisionReason::DailyLoss)
        } else if floating >= self.cfg.tp_target {
            Some(DecisionReason::Tp)
        } else if self.high_water_mark > self.cfg.trail_trigger
            && floating < self.high_water_mark * self.cfg.trail_ratio
        {
            Some(DecisionReason::Trail)
        } else {
            None
        }
    }

    pub fn on_execution_result(&mut self, result: &ExecutionResult) -> Result<Option<Alert>, CoreError> {
        self.roll_day(result.timestamp);
        match result.status {
            ExecStatus::Executed => {
                let order = result.order()?;
                if self.cluster.is_empty() {
                    self.cluster.cluster_id =
                        Some(result.cluster_id.unwrap_or_else(|| self.last_closed_cluster.map_or(1, |c| c + 1)));
                }
                self.cluster.push(order.clone())?;
                self.journal(WalEntry::Executed {
                    ts: result.timestamp,
                    side: order.side,
                    price: order.entry_price,
                    volume: order.volume,
                    ticket: order.ticket,
                });
                Ok(None)
            }
            ExecStatus::Closed => self.on_closed(result),
            ExecStatus::ErrorCierre => {
                let escalated = self.close_breaker.record_failure();
                let severity = if escalated { Severity::Fatal } else { Severity::Error };
                let reason = result.reason.as_deref().unwrap_or("unknown");
                logging::log(
                    if escalated { Level::Fatal } else { Level::Error },
                    Domain::Risk,
                    "close_failed",
                    obj(&[
                        ("reason", v_str(reason)),
                        ("consecutive", json!(self.close_breaker.failures)),
                        ("open_orders", json!(self.cluster.len())),
                    ]),
                );
                Ok(Some(Alert {
                    severity,
                    component: "risk".to_string(),
                    message: format!(
                        "close failed {} time(s) in a row ({}); {} order(s) still open",
                        self.close_breaker.failures,
                        reason,
                        self.cluster.len()
                    ),
                    timestamp: result.timestamp,
                }))
            }
        }
    }

    fn on_closed(&mut self, result: &ExecutionResult) -> Result<Option<Alert>, CoreError> {
        if self.cluster.is_empty() {
            return Err(CoreError::stale("closed while no cluster is open"));
        }
        if let (Some(id), Some(last)) = (result.cluster_id, self.last_closed_cluster) {
            if id <= last {
                return Err(CoreError::stale(format!("duplicate close for cluster {}", id)));
            }
        }

        let final_pnl = result.final_pnl.unwrap_or(0.0);
        let cluster_id = result
            .cluster_id
            .or(self.cluster.cluster_id)
            .unwrap_or_else(|| self.last_closed_cluster.map_or(1, |c| c + 1));
        let orders = self.cluster.len();

        self.daily_realized_pnl += final_pnl;
        self.cluster.clear();
        self.floating_pnl = 0.0;
        self.high_water_mark = 0.0;
        self.closing = false;
        self.close_breaker.record_success();
        self.last_closed_cluster = Some(cluster_id);
        self.journal(WalEntry::Closed { ts: result.timestamp, cluster_id, final_pnl });
        self.refractory.arm(result.timestamp, self.cfg.refractory_ttl_ms);
        logging::log_cluster_closed(Domain::Risk, cluster_id, final_pnl, orders);
        logging::agg_increment("close");

        if self.daily_realized_pnl <= self.cfg.daily_loss_limit {
            let until = self.refractory.arm_until(end_of_market_day(result.timestamp));
            logging::log(
                Level::Warn,
                Domain::Risk,
                "day_halted",
                obj(&[
                    ("daily_realized_pnl", v_num(self.daily_realized_pnl)),
                    ("until", json!(until)),
                ]),
            );
            return Ok(Some(Alert {
                severity: Severity::Warn,
                component: "risk".to_string(),
                message: format!(
                    "daily loss limit reached ({:.2}); entries halted until {}",
                    self.daily_realized_pnl, until
                ),
                timestamp: result.timestamp,
            }));
        }
        Ok(None)
    }

    /// Adopt the gateway's positions once, and only while nothing is open.
    pub fn on_position_report(&mut self, report: &PositionReport) -> Result<bool, CoreError> {
        if self.reconciled {
            return Err(CoreError::stale("position report after reconciliation"));
        }
        self.reconciled = true;
        if !self.cluster.is_empty() || report.orders.is_empty() {
            return Ok(false);
        }
        let mut adopted = Cluster::default();
        for order in &report.orders {
            adopted.push(order.clone())?;
        }
        adopted.cluster_id = Some(
            report
                .cluster_id
                .unwrap_or_else(|| self.last_closed_cluster.map_or(1, |c| c + 1)),
        );
        self.cluster = adopted;
        logging::log(
            Level::Info,
            Domain::Audit,
            "cluster_adopted",
            obj(&[
                ("origin", v_str("risk")),
                ("orders", json!(self.cluster.len())),
                ("cluster_id", json!(self.cluster.cluster_id)),
            ]),
        );
        Ok(true)
    }
}
