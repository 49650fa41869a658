//! Receive loops. Each component owns its state and reacts to one message at
//! a time; a bad message is logged and skipped, never fatal to the loop.

use serde_json::json;

use crate::bus::{Bus, Subscription};
use crate::engine::consensus::{ConsensusEngine, ExecEffect};
use crate::engine::risk::RiskSupervisor;
use crate::error::CoreError;
use crate::events::{ClusterReport, ExecStatus, Message, ReconcileRequest, Topic};
use crate::gateway::ExecutionGateway;
use crate::logging::{self, obj, v_str, Domain, Level};
use crate::reputation::ReputationStore;
use crate::state::now_ms;

pub const CONSENSUS_TOPICS: &[Topic] = &[
    Topic::Vote,
    Topic::Vestibular,
    Topic::Pulse,
    Topic::ExecutionResult,
    Topic::PositionReport,
    Topic::Decision,
];

pub const RISK_TOPICS: &[Topic] = &[
    Topic::Tick,
    Topic::Pulse,
    Topic::ExecutionResult,
    Topic::PositionReport,
];

pub const GATEWAY_TOPICS: &[Topic] = &[Topic::Tick, Topic::Decision, Topic::ReconcileRequest];

fn report_error(component: &str, err: &CoreError) {
    logging::log(
        err.log_level(),
        Domain::Bus,
        "message_error",
        obj(&[
            ("origin", v_str(component)),
            ("class", v_str(err.class())),
            ("detail", v_str(err.detail())),
        ]),
    );
}

fn request_reconcile(bus: &Bus, requester: &str) {
    bus.publish(Message::ReconcileRequest(ReconcileRequest {
        requester: requester.to_string(),
        timestamp: now_ms(),
    }));
}

/// Consensus engine plus the reputation store it feeds on closure.
pub struct ConsensusTask {
    pub engine: ConsensusEngine,
    pub store: ReputationStore,
}

impl ConsensusTask {
    pub fn new(engine: ConsensusEngine, store: ReputationStore) -> Self {
        Self { engine, store }
    }

    /// Apply one message; returns what should be published.
    pub fn handle(&mut self, msg: &Message) -> Vec<Message> {
        match msg {
            Message::Vote(v) => {
                self.engine.on_vote(v);
                vec![]
            }
            Message::Vestibular(m) => {
                if let Err(err) = self.engine.on_vestibular(m) {
                    report_error("consensus", &err);
                }
                vec![]
            }
            Message::Pulse(p) => {
                let out = self.engine.on_pulse(p);
                let mut msgs = vec![Message::StateSnapshot(out.snapshot)];
                if let Some(d) = out.decision {
                    msgs.push(Message::Decision(d));
                }
                msgs
            }
            Message::ExecutionResult(r) => match self.engine.on_execution_result(r) {
                Ok(ExecEffect::Filled { .. }) => vec![],
                Ok(ExecEffect::Closed(report)) => {
                    self.learn(&report);
                    vec![Message::ClusterReport(report)]
                }
                Ok(ExecEffect::CloseFailed(alert)) => vec![Message::Alert(alert)],
                Err(err) => {
                    report_error("consensus", &err);
                    vec![]
                }
            },
            Message::PositionReport(rep) => {
                if let Err(err) = self.engine.on_position_report(rep) {
                    report_error("consensus", &err);
                }
                vec![]
            }
            Message::Decision(d) => {
                self.engine.on_decision(d);
                vec![]
            }
            _ => vec![],
        }
    }

    /// Persist the outcome, then score with what is on disk.
    fn learn(&mut self, report: &ClusterReport) {
        if let Err(err) = self.store.apply_outcome(report) {
            logging::log(
                Level::Error,
                Domain::Reputation,
                "apply_outcome_failed",
                obj(&[("cluster_id", json!(report.cluster_id)), ("error", v_str(&format!("{:#}", err)))]),
            );
        }
        match self.store.reload() {
            Ok(matrix) => self.engine.set_reputation(matrix.clone()),
            Err(err) => logging::log(
                Level::Error,
                Domain::Reputation,
                "reload_failed",
                obj(&[("error", v_str(&format!("{:#}", err)))]),
            ),
        }
    }
}

/// Drive the consensus engine. Subscribe with `CONSENSUS_TOPICS` before any
/// task that may publish is spawned.
pub async fn run_consensus(mut task: ConsensusTask, bus: Bus, mut sub: Subscription) {
    request_reconcile(&bus, "consensus");
    logging::log(Level::Info, Domain::System, "consensus_started", obj(&[]));
    while let Some(msg) = sub.recv().await {
        for out in task.handle(&msg) {
            bus.publish(out);
        }
    }
    logging::log(Level::Info, Domain::System, "consensus_stopped", obj(&[]));
}

/// Apply one message to the risk supervisor; returns what should be published.
///
/// Every tick and every accepted closure is followed by a `RiskStatus`.
pub fn handle_risk(sup: &mut RiskSupervisor, msg: &Message) -> Vec<Message> {
    match msg {
        Message::Tick(t) => {
            let mut out: Vec<Message> = sup.on_tick(t).map(Message::Decision).into_iter().collect();
            out.push(Message::RiskStatus(sup.status(t.timestamp)));
            out
        }
        Message::Pulse(p) => {
            sup.on_pulse(p);
            vec![]
        }
        Message::ExecutionResult(r) => match sup.on_execution_result(r) {
            Ok(alert) => {
                let mut out: Vec<Message> = alert.map(Message::Alert).into_iter().collect();
                if r.status == ExecStatus::Closed {
                    out.push(Message::RiskStatus(sup.status(r.timestamp)));
                }
                out
            }
            Err(err) => {
                report_error("risk", &err);
                vec![]
            }
        },
        Message::PositionReport(rep) => {
            if let Err(err) = sup.on_position_report(rep) {
                report_error("risk", &err);
            }
            vec![]
        }
        _ => vec![],
    }
}

pub async fn run_risk(mut sup: RiskSupervisor, bus: Bus, mut sub: Subscription) {
    request_reconcile(&bus, "risk");
    logging::log(Level::Info, Domain::System, "risk_started", obj(&[]));
    while let Some(msg) = sub.recv().await {
        for out in handle_risk(&mut sup, &msg) {
            bus.publish(out);
        }
    }
    logging::log(Level::Info, Domain::System, "risk_stopped", obj(&[]));
}

pub async fn run_gateway<G: ExecutionGateway + 'static>(mut gateway: G, bus: Bus, mut sub: Subscription) {
    logging::log(
        Level::Info,
        Domain::System,
        "gateway_started",
        obj(&[("gateway", v_str(gateway.name()))]),
    );
    while let Some(msg) = sub.recv().await {
        for out in gateway.handle(&msg) {
            bus.publish(out);
        }
    }
}
