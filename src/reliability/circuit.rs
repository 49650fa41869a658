#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
}

/// Counts consecutive failures of one operation; opens at `threshold`.
///
/// Used for close escalation: the gateway owns retries, this only decides
/// how loudly a repeated failure is reported.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    pub state: CircuitState,
    pub failures: u32,
    pub threshold: u32,
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self { state: CircuitState::Closed, failures: 0, threshold: threshold.max(1) }
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.state = CircuitState::Closed;
    }

    /// Returns true when this failure opened (or kept open) the circuit.
    pub fn record_failure(&mut self) -> bool {
        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.threshold {
            self.state = CircuitState::Open;
        }
        self.is_open()
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, CircuitState::Open)
    }
}
