use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use crate::events::{Message, Topic};
use crate::logging::{self, obj, v_str, Domain, Level};

/// In-process publish/subscribe over a broadcast channel.
///
/// Best effort: publishing with nobody listening drops the message, and a
/// subscriber that falls more than `capacity` messages behind loses the
/// oldest ones. Order per publisher is preserved.
#[derive(Clone, Debug)]
pub struct Bus {
    tx: broadcast::Sender<Message>,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Returns how many subscribers received the message.
    pub fn publish(&self, msg: Message) -> usize {
        match self.tx.send(msg) {
            Ok(n) => n,
            Err(broadcast::error::SendError(msg)) => {
                logging::log(
                    Level::Trace,
                    Domain::Bus,
                    "no_subscribers",
                    obj(&[("topic", v_str(msg.topic().as_str()))]),
                );
                0
            }
        }
    }

    pub fn subscribe(&self, name: &str, topics: &[Topic]) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            topics: topics.to_vec(),
            name: name.to_string(),
        }
    }
}

pub struct Subscription {
    rx: broadcast::Receiver<Message>,
    topics: Vec<Topic>,
    name: String,
}

impl Subscription {
    fn wants(&self, msg: &Message) -> bool {
        self.topics.is_empty() || self.topics.contains(&msg.topic())
    }

    fn report_lag(&self, skipped: u64) {
        logging::log(
            Level::Warn,
            Domain::Bus,
            "subscriber_lagged",
            obj(&[
                ("subscriber", v_str(&self.name)),
                ("skipped", serde_json::json!(skipped)),
            ]),
        );
        logging::agg_increment("dropped");
    }

    /// Next message on a subscribed topic. `None` once every publisher is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            match self.rx.recv().await {
                Ok(msg) if self.wants(&msg) => return Some(msg),
                Ok(_) => continue,
                Err(RecvError::Lagged(n)) => self.report_lag(n),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant; `None` when nothing relevant is queued.
    pub fn try_recv(&mut self) -> Option<Message> {
        loop {
            match self.rx.try_recv() {
                Ok(msg) if self.wants(&msg) => return Some(msg),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(n)) => self.report_lag(n),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }
}
