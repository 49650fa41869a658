use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::events::{Action, Decision, ExecStatus, ExecutionResult, Message, PositionReport, Tick};
use crate::logging::{self, obj, v_num, v_str, Domain, Level};
use crate::state::{Config, Order};

/// Anything that turns decisions into execution results.
pub trait ExecutionGateway: Send {
    /// React to one bus message; returned messages are published in order.
    fn handle(&mut self, msg: &Message) -> Vec<Message>;
    fn name(&self) -> &str;
}

#[derive(Debug, Clone)]
pub struct FaultProfile {
    pub close_fail_rate: f64,
    pub dup_close_rate: f64,
}

impl FaultProfile {
    pub fn disabled() -> Self {
        Self { close_fail_rate: 0.0, dup_close_rate: 0.0 }
    }
}

/// In-process fills at the last tick price.
pub struct PaperGateway {
    volume: f64,
    slip_rate: f64,
    faults: FaultProfile,
    rng: StdRng,
    last_price: Option<f64>,
    positions: Vec<Order>,
    cluster_id: Option<u64>,
    clusters_opened: u64,
    next_ticket: u64,
}

impl PaperGateway {
    pub fn new(volume: f64, slip_rate: f64, faults: FaultProfile) -> Self {
        Self::with_rng(volume, slip_rate, faults, StdRng::from_entropy())
    }

    pub fn seeded(volume: f64, slip_rate: f64, faults: FaultProfile, seed: u64) -> Self {
        Self::with_rng(volume, slip_rate, faults, StdRng::seed_from_u64(seed))
    }

    fn with_rng(volume: f64, slip_rate: f64, faults: FaultProfile, rng: StdRng) -> Self {
        Self {
            volume,
            slip_rate,
            faults,
            rng,
            last_price: None,
            positions: Vec::new(),
            cluster_id: None,
            clusters_opened: 0,
            next_ticket: 1,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(
            cfg.paper_volume,
            cfg.paper_slip,
            FaultProfile {
                close_fail_rate: cfg.paper_close_fail_rate,
                dup_close_rate: cfg.paper_dup_close_rate,
            },
        )
    }

    /// Continue cluster numbering after `last`, the highest id a previous
    /// session closed.
    pub fn resume_after(mut self, last: Option<u64>) -> Self {
        self.clusters_opened = last.unwrap_or(0);
        self
    }

    pub fn positions(&self) -> &[Order] {
        &self.positions
    }

    fn should_fault(&mut self, rate: f64) -> bool {
        rate > 0.0 && self.rng.gen::<f64>() < rate
    }

    fn result(&self, status: ExecStatus, ts: u64) -> ExecutionResult {
        ExecutionResult {
            status,
            ticket: None,
            side: None,
            price: None,
            volume: None,
            final_pnl: None,
            cluster_id: None,
            reason: None,
            timestamp: ts,
        }
    }

    fn open(&mut self, decision: &Decision) -> Vec<Message> {
        let Some(side) = decision.action.side() else {
            return vec![];
        };
        let Some(price) = self.last_price else {
            logging::log(
                Level::Warn,
                Domain::Exec,
                "open_rejected",
                obj(&[("reason", v_str("no price yet")), ("action", v_str(side.as_str()))]),
            );
            return vec![];
        };
        if let Some(open) = self.positions.first() {
            if open.side != side {
                logging::log(
                    Level::Warn,
                    Domain::Exec,
                    "open_rejected",
                    obj(&[
                        ("reason", v_str("opposite side open")),
                        ("action", v_str(side.as_str())),
                    ]),
                );
                return vec![];
            }
        }
        if self.positions.is_empty() {
            self.clusters_opened += 1;
            self.cluster_id = Some(self.clusters_opened);
        }

        let fill_price = price * (1.0 + side.sign() * self.slip_rate);
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        let order = Order { side, entry_price: fill_price, volume: self.volume, ticket: Some(ticket) };
        self.positions.push(order);

        let mut r = self.result(ExecStatus::Executed, decision.timestamp);
        r.ticket = Some(ticket);
        r.side = Some(side);
        r.price = Some(fill_price);
        r.volume = Some(self.volume);
        r.cluster_id = self.cluster_id;
        logging::log(
            Level::Info,
            Domain::Exec,
            "paper_fill",
            obj(&[
                ("action", v_str(side.as_str())),
                ("price", v_num(fill_price)),
                ("ticket", serde_json::json!(ticket)),
            ]),
        );
        vec![Message::ExecutionResult(r)]
    }

    fn close_all(&mut self, decision: &Decision) -> Vec<Message> {
        let ts = decision.timestamp;
        if self.positions.is_empty() {
            let mut r = self.result(ExecStatus::Closed, ts);
            r.final_pnl = Some(0.0);
            r.reason = Some("NO_POSITIONS".to_string());
            return vec![Message::ExecutionResult(r)];
        }
        if self.should_fault(self.faults.close_fail_rate) {
            let mut r = self.result(ExecStatus::ErrorCierre, ts);
            r.reason = Some("PAPER_FAULT".to_string());
            return vec![Message::ExecutionResult(r)];
        }

        let price = self.last_price.unwrap_or(0.0);
        let pnl: f64 = self
            .positions
            .iter()
            .map(|o| {
                let exit = price * (1.0 - o.side.sign() * self.slip_rate);
                o.floating_pnl(exit)
            })
            .sum();
        let mut r = self.result(ExecStatus::Closed, ts);
        r.final_pnl = Some((pnl * 100.0).round() / 100.0);
        r.cluster_id = self.cluster_id;
        r.reason = decision.reason.map(|reason| reason.as_str().to_string());
        self.positions.clear();
        self.cluster_id = None;

        let mut out = vec![Message::ExecutionResult(r.clone())];
        if self.should_fault(self.faults.dup_close_rate) {
            out.push(Message::ExecutionResult(r));
        }
        out
    }
}

impl ExecutionGateway for PaperGateway {
    fn handle(&mut self, msg: &Message) -> Vec<Message> {
        match msg {
            Message::Tick(Tick { price, .. }) => {
                self.last_price = Some(*price);
                vec![]
            }
            Message::Decision(d) => match d.action {
                Action::Buy | Action::Sell => self.open(d),
                Action::CloseAll => self.close_all(d),
            },
            Message::ReconcileRequest(req) => vec![Message::PositionReport(PositionReport {
                orders: self.positions.clone(),
                cluster_id: self.cluster_id,
                timestamp: req.timestamp,
            })],
            _ => vec![],
        }
    }

    fn name(&self) -> &str {
        "paper"
    }
}
