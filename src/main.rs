use anyhow::{Context, Result};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::time::{sleep, Duration};

use consensusfx::bus::{Bus, Subscription};
use consensusfx::engine::consensus::ConsensusEngine;
use consensusfx::engine::risk::RiskSupervisor;
use consensusfx::engine::runner::{
    run_consensus, run_gateway, run_risk, ConsensusTask, CONSENSUS_TOPICS, GATEWAY_TOPICS, RISK_TOPICS,
};
use consensusfx::events::{decode_envelope, encode_envelope, Message, Topic};
use consensusfx::gateway::PaperGateway;
use consensusfx::logging::{self, obj, params_hash, v_num, v_str, Domain, Level};
use consensusfx::reliability::refractory::RefractoryLock;
use consensusfx::reliability::wal::Wal;
use consensusfx::reputation::{JsonFileBackend, ReputationBackend, ReputationStore};
use consensusfx::state::{Config, GatewayKind, ReputationBackendKind};
use consensusfx::storage::SqliteReputationBackend;

/// Topics written to stdout for whoever sits downstream.
const EGRESS_TOPICS: &[Topic] = &[
    Topic::Decision,
    Topic::StateSnapshot,
    Topic::RiskStatus,
    Topic::ClusterReport,
    Topic::Alert,
    Topic::ReconcileRequest,
];

fn open_backend(cfg: &Config) -> Result<Box<dyn ReputationBackend>> {
    let backend: Box<dyn ReputationBackend> = match cfg.reputation_backend {
        ReputationBackendKind::Json => Box::new(JsonFileBackend::new(&cfg.reputation_path)),
        ReputationBackendKind::Sqlite => Box::new(
            SqliteReputationBackend::new(&cfg.sqlite_path)
                .with_context(|| format!("open {}", cfg.sqlite_path))?,
        ),
    };
    Ok(backend)
}

async fn run_egress(mut sub: Subscription) {
    let mut stdout = tokio::io::stdout();
    while let Some(msg) = sub.recv().await {
        match &msg {
            Message::Alert(a) => logging::log(
                Level::Warn,
                Domain::System,
                "alert",
                obj(&[
                    ("severity", json!(a.severity)),
                    ("origin", v_str(&a.component)),
                    ("msg", v_str(&a.message)),
                ]),
            ),
            Message::ClusterReport(r) => logging::log(
                Level::Info,
                Domain::Reputation,
                "cluster_report",
                obj(&[
                    ("cluster_id", json!(r.cluster_id)),
                    ("regime", v_str(&r.regime)),
                    ("win", json!(r.win)),
                    ("final_pnl", v_num(r.final_pnl)),
                ]),
            ),
            _ => {}
        }
        let mut line = encode_envelope(&msg);
        line.push('\n');
        if stdout.write_all(line.as_bytes()).await.is_err() {
            break;
        }
        let _ = stdout.flush().await;
    }
}

async fn run_aggregator() {
    loop {
        sleep(Duration::from_secs(5)).await;
        logging::tick_aggregator();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    logging::log(
        Level::Info,
        Domain::System,
        "startup",
        obj(&[
            ("config_hash", v_str(&params_hash(&format!("{:?}", cfg)))),
            ("entry_threshold", v_num(cfg.entry_threshold)),
            ("burst_threshold", v_num(cfg.burst_threshold)),
            ("doubt_threshold", v_num(cfg.doubt_threshold)),
            ("max_cluster", json!(cfg.max_cluster)),
            ("gateway", v_str(if cfg.gateway == GatewayKind::Paper { "paper" } else { "none" })),
        ]),
    );

    let store = ReputationStore::open(open_backend(&cfg)?)?;
    let refractory = RefractoryLock::new();

    let recovery = Wal::recover(&cfg.wal_path)
        .with_context(|| format!("replay {}", cfg.wal_path))?;
    let wal = Wal::open(&cfg.wal_path).with_context(|| format!("open {}", cfg.wal_path))?;
    let mut risk = RiskSupervisor::new(cfg.clone(), refractory.clone()).with_wal(wal);
    risk.recover(&recovery);

    let engine = ConsensusEngine::new(cfg.clone(), refractory.clone(), store.matrix().clone());
    let task = ConsensusTask::new(engine, store);

    // Every subscription exists before anything publishes.
    let bus = Bus::new(cfg.bus_capacity);
    let egress_sub = bus.subscribe("egress", EGRESS_TOPICS);
    let gateway_sub = (cfg.gateway == GatewayKind::Paper).then(|| bus.subscribe("paper", GATEWAY_TOPICS));
    let consensus_sub = bus.subscribe("consensus", CONSENSUS_TOPICS);
    let risk_sub = bus.subscribe("risk", RISK_TOPICS);

    tokio::spawn(run_egress(egress_sub));
    tokio::spawn(run_aggregator());
    if let Some(sub) = gateway_sub {
        tokio::spawn(run_gateway(
            PaperGateway::from_config(&cfg).resume_after(recovery.last_closed_cluster),
            bus.clone(),
            sub,
        ));
    }
    tokio::spawn(run_consensus(task, bus.clone(), consensus_sub));
    tokio::spawn(run_risk(risk, bus.clone(), risk_sub));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ingested: u64 = 0;
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match decode_envelope(&line) {
            Ok(msg) => {
                bus.publish(msg);
                ingested += 1;
            }
            Err(err) => {
                logging::agg_increment("dropped");
                logging::log_message_error(err.log_level().max(Level::Info), err.class(), err.detail());
            }
        }
    }

    sleep(Duration::from_millis(cfg.drain_ms)).await;
    logging::log(
        Level::Info,
        Domain::System,
        "shutdown",
        obj(&[("ingested", json!(ingested))]),
    );
    Ok(())
}
