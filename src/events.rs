//! Messages exchanged on the bus.
//!
//! On the wire every message is one JSON line `{"topic": ..., "payload": {...}}`.
//! Payload decoding is lenient where a documented default exists and strict
//! where a wrong value would change a decision (vote direction, exec status).

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::CoreError;
use crate::state::{now_ms, Order, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Vote,
    Vestibular,
    Pulse,
    Tick,
    Decision,
    ExecutionResult,
    ClusterReport,
    StateSnapshot,
    RiskStatus,
    Alert,
    ReconcileRequest,
    PositionReport,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Vote => "vote",
            Topic::Vestibular => "vestibular",
            Topic::Pulse => "pulse",
            Topic::Tick => "tick",
            Topic::Decision => "decision",
            Topic::ExecutionResult => "execution_result",
            Topic::ClusterReport => "cluster_report",
            Topic::StateSnapshot => "state_snapshot",
            Topic::RiskStatus => "risk_status",
            Topic::Alert => "alert",
            Topic::ReconcileRequest => "reconcile_request",
            Topic::PositionReport => "position_report",
        }
    }
}

// =============================================================================
// Payloads
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    #[serde(alias = "experto_id")]
    pub expert_id: String,
    #[serde(alias = "voto", deserialize_with = "de_direction")]
    pub direction: i8,
    #[serde(alias = "confianza", default = "one", deserialize_with = "de_confidence")]
    pub confidence: f64,
    #[serde(alias = "Timestamp", default = "now_ms", deserialize_with = "de_timestamp")]
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vestibular {
    #[serde(default = "one")]
    pub action_potential: f64,
    #[serde(default = "yes")]
    pub is_stable: bool,
    #[serde(default)]
    pub noise_level: Option<f64>,
    #[serde(alias = "Timestamp", default = "now_ms", deserialize_with = "de_timestamp")]
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pulse {
    #[serde(alias = "regime_id", alias = "regime", deserialize_with = "de_regime")]
    pub regime_primary: String,
    #[serde(alias = "regime_htf", default, deserialize_with = "de_opt_regime")]
    pub regime_secondary: Option<String>,
    #[serde(alias = "Close_Price", default)]
    pub price: f64,
    #[serde(alias = "Timestamp", default = "now_ms", deserialize_with = "de_timestamp")]
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    #[serde(alias = "Close_Price")]
    pub price: f64,
    #[serde(alias = "Timestamp", default = "now_ms", deserialize_with = "de_timestamp")]
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
    #[serde(rename = "CLOSE_ALL")]
    CloseAll,
}

impl Action {
    pub fn from_side(side: Side) -> Self {
        match side {
            Side::Buy => Action::Buy,
            Side::Sell => Action::Sell,
        }
    }

    pub fn side(&self) -> Option<Side> {
        match self {
            Action::Buy => Some(Side::Buy),
            Action::Sell => Some(Side::Sell),
            Action::CloseAll => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Buy => "BUY",
            Action::Sell => "SELL",
            Action::CloseAll => "CLOSE_ALL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionReason {
    Entry,
    Burst,
    ConvictionLoss,
    Tp,
    Trail,
    DailyLoss,
}

impl DecisionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionReason::Entry => "ENTRY",
            DecisionReason::Burst => "BURST",
            DecisionReason::ConvictionLoss => "CONVICTION_LOSS",
            DecisionReason::Tp => "TP",
            DecisionReason::Trail => "TRAIL",
            DecisionReason::DailyLoss => "DAILY_LOSS",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Consensus,
    Risk,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Consensus => "consensus",
            Origin::Risk => "risk",
        }
    }
}

/// A request to the gateway. Local state only changes on the matching
/// `ExecutionResult`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: Action,
    #[serde(default)]
    pub consensus_score: Option<f64>,
    #[serde(default)]
    pub regime: Option<String>,
    #[serde(default)]
    pub reason: Option<DecisionReason>,
    pub origin: Origin,
    #[serde(alias = "Timestamp", default = "now_ms", deserialize_with = "de_timestamp")]
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    Executed,
    Closed,
    #[serde(alias = "close_error")]
    ErrorCierre,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecStatus,
    #[serde(default)]
    pub ticket: Option<u64>,
    #[serde(alias = "action", default)]
    pub side: Option<Side>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub volume: Option<f64>,
    #[serde(default)]
    pub final_pnl: Option<f64>,
    #[serde(default)]
    pub cluster_id: Option<u64>,
    #[serde(alias = "razon", default)]
    pub reason: Option<String>,
    #[serde(alias = "Timestamp", default = "now_ms", deserialize_with = "de_timestamp")]
    pub timestamp: u64,
}

impl ExecutionResult {
    /// The order an `executed` result describes.
    pub fn order(&self) -> Result<Order, CoreError> {
        let side = self
            .side
            .ok_or_else(|| CoreError::transient("executed result without side"))?;
        let entry_price = self
            .price
            .ok_or_else(|| CoreError::transient("executed result without price"))?;
        Ok(Order {
            side,
            entry_price,
            volume: self.volume.unwrap_or(1.0),
            ticket: self.ticket,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterReport {
    pub cluster_id: u64,
    pub win: bool,
    pub regime: String,
    pub final_pnl: f64,
    #[serde(default)]
    pub experts: Vec<String>,
    #[serde(default = "now_ms", deserialize_with = "de_timestamp")]
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub score: f64,
    #[serde(default)]
    pub regime: Option<String>,
    #[serde(default)]
    pub cluster_side: Option<Side>,
    pub order_count: usize,
    pub vestibular_multiplier: f64,
    #[serde(default = "now_ms", deserialize_with = "de_timestamp")]
    pub timestamp: u64,
}

/// Risk supervisor exposure, published on every tick and after each closure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskStatus {
    #[serde(default)]
    pub open_orders: usize,
    #[serde(default)]
    pub floating_pnl: f64,
    #[serde(alias = "daily_realized_pnl", default)]
    pub daily_pnl: f64,
    #[serde(default)]
    pub high_water_mark: f64,
    #[serde(default)]
    pub closing: bool,
    #[serde(alias = "Timestamp", default = "now_ms", deserialize_with = "de_timestamp")]
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warn,
    Error,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub severity: Severity,
    pub component: String,
    pub message: String,
    #[serde(default = "now_ms", deserialize_with = "de_timestamp")]
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileRequest {
    pub requester: String,
    #[serde(default = "now_ms", deserialize_with = "de_timestamp")]
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionReport {
    #[serde(default)]
    pub orders: Vec<Order>,
    #[serde(default)]
    pub cluster_id: Option<u64>,
    #[serde(default = "now_ms", deserialize_with = "de_timestamp")]
    pub timestamp: u64,
}

// =============================================================================
// Envelope
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", content = "payload", rename_all = "snake_case")]
pub enum Message {
    #[serde(alias = "expert_votes_stream")]
    Vote(Vote),
    #[serde(alias = "vestibular_perception")]
    Vestibular(Vestibular),
    #[serde(alias = "brain_state")]
    Pulse(Pulse),
    #[serde(alias = "market_data_stream")]
    Tick(Tick),
    #[serde(alias = "brain_decision")]
    Decision(Decision),
    #[serde(alias = "reporte_operativa")]
    ExecutionResult(ExecutionResult),
    ClusterReport(ClusterReport),
    StateSnapshot(StateSnapshot),
    #[serde(alias = "homeostasis_status")]
    RiskStatus(RiskStatus),
    Alert(Alert),
    ReconcileRequest(ReconcileRequest),
    PositionReport(PositionReport),
}

impl Message {
    pub fn topic(&self) -> Topic {
        match self {
            Message::Vote(_) => Topic::Vote,
            Message::Vestibular(_) => Topic::Vestibular,
            Message::Pulse(_) => Topic::Pulse,
            Message::Tick(_) => Topic::Tick,
            Message::Decision(_) => Topic::Decision,
            Message::ExecutionResult(_) => Topic::ExecutionResult,
            Message::ClusterReport(_) => Topic::ClusterReport,
            Message::StateSnapshot(_) => Topic::StateSnapshot,
            Message::RiskStatus(_) => Topic::RiskStatus,
            Message::Alert(_) => Topic::Alert,
            Message::ReconcileRequest(_) => Topic::ReconcileRequest,
            Message::PositionReport(_) => Topic::PositionReport,
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            Message::Vote(m) => m.timestamp,
            Message::Vestibular(m) => m.timestamp,
            Message::Pulse(m) => m.timestamp,
            Message::Tick(m) => m.timestamp,
            Message::Decision(m) => m.timestamp,
            Message::ExecutionResult(m) => m.timestamp,
            Message::ClusterReport(m) => m.timestamp,
            Message::StateSnapshot(m) => m.timestamp,
            Message::RiskStatus(m) => m.timestamp,
            Message::Alert(m) => m.timestamp,
            Message::ReconcileRequest(m) => m.timestamp,
            Message::PositionReport(m) => m.timestamp,
        }
    }
}

/// Decode one wire line. Anything undecodable is a transient error.
pub fn decode_envelope(line: &str) -> Result<Message, CoreError> {
    serde_json::from_str::<Message>(line.trim()).map_err(|e| CoreError::transient(e.to_string()))
}

pub fn encode_envelope(msg: &Message) -> String {
    serde_json::to_string(msg).unwrap_or_else(|_| "{}".to_string())
}

// =============================================================================
// Field decoders
// =============================================================================

fn one() -> f64 {
    1.0
}

fn yes() -> bool {
    true
}

fn de_direction<'de, D: Deserializer<'de>>(d: D) -> Result<i8, D::Error> {
    let v = Value::deserialize(d)?;
    let n = v
        .as_f64()
        .ok_or_else(|| serde::de::Error::custom(format!("direction must be numeric, got {}", v)))?;
    match n {
        x if x == 1.0 => Ok(1),
        x if x == 0.0 => Ok(0),
        x if x == -1.0 => Ok(-1),
        _ => Err(serde::de::Error::custom(format!("direction {} outside {{-1,0,1}}", n))),
    }
}

fn de_confidence<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    let v = Value::deserialize(d)?;
    match v {
        Value::Null => Ok(1.0),
        Value::Number(n) => Ok(n.as_f64().unwrap_or(1.0).clamp(0.0, 1.0)),
        other => Err(serde::de::Error::custom(format!("confidence must be numeric, got {}", other))),
    }
}

fn regime_from_value(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i.to_string())
            } else {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0)
                    .map(|f| format!("{}", f as i64))
                    .or_else(|| Some(n.to_string()))
            }
        }
        _ => None,
    }
}

fn de_regime<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    let v = Value::deserialize(d)?;
    regime_from_value(&v).ok_or_else(|| serde::de::Error::custom(format!("invalid regime {}", v)))
}

fn de_opt_regime<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    let v = Value::deserialize(d)?;
    if v.is_null() {
        return Ok(None);
    }
    regime_from_value(&v)
        .map(Some)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid regime {}", v)))
}

/// Epoch values below this are seconds, not milliseconds.
const SECONDS_CUTOFF: f64 = 1e11;

fn epoch_number_to_ms(n: f64) -> Option<u64> {
    if !n.is_finite() || n < 0.0 {
        return None;
    }
    if n < SECONDS_CUTOFF {
        Some((n * 1000.0).round() as u64)
    } else {
        Some(n.round() as u64)
    }
}

/// Parse a wire timestamp into epoch milliseconds.
pub fn parse_timestamp(v: &Value) -> Option<u64> {
    match v {
        Value::Null => Some(now_ms()),
        Value::Number(n) => n.as_f64().and_then(epoch_number_to_ms),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(n) = s.parse::<f64>() {
                return epoch_number_to_ms(n);
            }
            if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
                return u64::try_from(dt.timestamp_millis()).ok();
            }
            for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
                if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, fmt) {
                    return u64::try_from(dt.and_utc().timestamp_millis()).ok();
                }
            }
            None
        }
        _ => None,
    }
}

fn de_timestamp<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    let v = Value::deserialize(d)?;
    parse_timestamp(&v).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp {}", v)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_vote_with_original_field_names() {
        let line = r#"{"topic":"expert_votes_stream","payload":{"experto_id":"momentum_v1","voto":-1,"confianza":0.8,"Timestamp":"2024-03-10 15:30:00"}}"#;
        match decode_envelope(line).unwrap() {
            Message::Vote(v) => {
                assert_eq!(v.expert_id, "momentum_v1");
                assert_eq!(v.direction, -1);
                assert_eq!(v.confidence, 0.8);
                assert_eq!(v.timestamp, 1_710_084_600_000);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_vote_defaults_and_clamping() {
        let line = r#"{"topic":"vote","payload":{"expert_id":"a","direction":1}}"#;
        let Message::Vote(v) = decode_envelope(line).unwrap() else { panic!("not a vote") };
        assert_eq!(v.confidence, 1.0);
        assert!(v.timestamp > 0);

        let line = r#"{"topic":"vote","payload":{"expert_id":"a","direction":1,"confidence":1.7}}"#;
        let Message::Vote(v) = decode_envelope(line).unwrap() else { panic!("not a vote") };
        assert_eq!(v.confidence, 1.0);
    }

    #[test]
    fn test_vote_direction_out_of_range_is_transient() {
        let line = r#"{"topic":"vote","payload":{"expert_id":"a","direction":2}}"#;
        let err = decode_envelope(line).unwrap_err();
        assert_eq!(err.class(), "transient_message");
    }

    #[test]
    fn test_pulse_integer_regimes() {
        let line = r#"{"topic":"brain_state","payload":{"regime_id":5,"regime_secondary":5,"Close_Price":100.5,"Timestamp":1710084600}}"#;
        let Message::Pulse(p) = decode_envelope(line).unwrap() else { panic!("not a pulse") };
        assert_eq!(p.regime_primary, "5");
        assert_eq!(p.regime_secondary.as_deref(), Some("5"));
        assert_eq!(p.price, 100.5);
        assert_eq!(p.timestamp, 1_710_084_600_000);
    }

    #[test]
    fn test_pulse_missing_secondary() {
        let line = r#"{"topic":"pulse","payload":{"regime_primary":"6","price":1.0}}"#;
        let Message::Pulse(p) = decode_envelope(line).unwrap() else { panic!("not a pulse") };
        assert!(p.regime_secondary.is_none());
    }

    #[test]
    fn test_execution_result_original_shape() {
        let line = r#"{"topic":"reporte_operativa","payload":{"ticket":77,"action":"BUY","price":101.2,"volume":0.01,"status":"executed","timestamp":1710084600.25}}"#;
        let Message::ExecutionResult(r) = decode_envelope(line).unwrap() else { panic!("not a result") };
        assert_eq!(r.status, ExecStatus::Executed);
        assert_eq!(r.timestamp, 1_710_084_600_250);
        let order = r.order().unwrap();
        assert_eq!(order.side, Side::Buy);
        assert_eq!(order.ticket, Some(77));

        let line = r#"{"topic":"execution_result","payload":{"status":"error_cierre","razon":"FALLO_MT5"}}"#;
        let Message::ExecutionResult(r) = decode_envelope(line).unwrap() else { panic!("not a result") };
        assert_eq!(r.status, ExecStatus::ErrorCierre);
        assert_eq!(r.reason.as_deref(), Some("FALLO_MT5"));
    }

    #[test]
    fn test_executed_without_side_is_transient() {
        let r = ExecutionResult {
            status: ExecStatus::Executed,
            ticket: None,
            side: None,
            price: Some(1.0),
            volume: None,
            final_pnl: None,
            cluster_id: None,
            reason: None,
            timestamp: 0,
        };
        assert!(matches!(r.order(), Err(CoreError::TransientMessage(_))));
    }

    #[test]
    fn test_unknown_topic_rejected() {
        assert!(decode_envelope(r#"{"topic":"visual_perception","payload":{}}"#).is_err());
        assert!(decode_envelope("not json").is_err());
    }

    #[test]
    fn test_decision_wire_shape() {
        let msg = Message::Decision(Decision {
            action: Action::CloseAll,
            consensus_score: None,
            regime: Some("5".into()),
            reason: Some(DecisionReason::ConvictionLoss),
            origin: Origin::Consensus,
            timestamp: 1_710_084_600_000,
        });
        let v: Value = serde_json::from_str(&encode_envelope(&msg)).unwrap();
        assert_eq!(v["topic"], "decision");
        assert_eq!(v["payload"]["action"], "CLOSE_ALL");
        assert_eq!(v["payload"]["reason"], "CONVICTION_LOSS");
        assert_eq!(v["payload"]["origin"], "consensus");
        assert_eq!(decode_envelope(&encode_envelope(&msg)).unwrap(), msg);
    }

    #[test]
    fn test_homeostasis_status_decodes_as_risk_status() {
        let line = r#"{"topic":"homeostasis_status","payload":{"open_orders":2,"floating_pnl":-12.5,"daily_pnl":40.0}}"#;
        let Message::RiskStatus(st) = decode_envelope(line).unwrap() else { panic!("not a risk status") };
        assert_eq!(st.open_orders, 2);
        assert_eq!(st.floating_pnl, -12.5);
        assert_eq!(st.daily_pnl, 40.0);
        assert!(!st.closing);
    }

    #[test]
    fn test_timestamp_formats() {
        assert_eq!(parse_timestamp(&Value::from(1_710_084_600_000u64)), Some(1_710_084_600_000));
        assert_eq!(parse_timestamp(&Value::from(1_710_084_600u64)), Some(1_710_084_600_000));
        assert_eq!(
            parse_timestamp(&Value::from("2024-03-10T15:30:00Z")),
            Some(1_710_084_600_000)
        );
        assert_eq!(parse_timestamp(&Value::from("yesterday")), None);
        assert_eq!(parse_timestamp(&Value::from(-5)), None);
    }
}
