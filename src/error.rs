use std::fmt;

use crate::logging::Level;

/// Failure classes the receive loops distinguish.
///
/// None of them stop a loop: transient and stale errors are logged and the
/// message is skipped, fatal execution errors are surfaced as an `Alert`.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreError {
    /// Undecodable or out-of-contract message. Ignored.
    TransientMessage(String),
    /// Message contradicts local state (duplicate close, fill while empty...).
    StaleState(String),
    /// Reported by the gateway; not retried locally.
    FatalExecution(String),
}

impl CoreError {
    pub fn transient(msg: impl Into<String>) -> Self {
        CoreError::TransientMessage(msg.into())
    }

    pub fn stale(msg: impl Into<String>) -> Self {
        CoreError::StaleState(msg.into())
    }

    pub fn class(&self) -> &'static str {
        match self {
            CoreError::TransientMessage(_) => "transient_message",
            CoreError::StaleState(_) => "stale_state",
            CoreError::FatalExecution(_) => "fatal_execution",
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            CoreError::TransientMessage(m) | CoreError::StaleState(m) | CoreError::FatalExecution(m) => m,
        }
    }

    pub fn log_level(&self) -> Level {
        match self {
            CoreError::TransientMessage(_) => Level::Debug,
            CoreError::StaleState(_) => Level::Warn,
            CoreError::FatalExecution(_) => Level::Error,
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class(), self.detail())
    }
}

impl std::error::Error for CoreError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_class() {
        let err = CoreError::stale("closed while empty");
        assert_eq!(err.to_string(), "stale_state: closed while empty");
    }

    #[test]
    fn test_levels() {
        assert_eq!(CoreError::transient("x").log_level(), Level::Debug);
        assert_eq!(CoreError::stale("x").log_level(), Level::Warn);
        assert_eq!(CoreError::FatalExecution("x".into()).log_level(), Level::Error);
    }
}
