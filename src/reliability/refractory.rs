use std::sync::{Arc, Mutex};

/// Post-closure lockout on new entries, shared by every component that may
/// arm or read it.
///
/// Arming is idempotent and never shortens an active lock: concurrent setters
/// end up with the latest expiry any of them asked for. All times are event
/// times in epoch milliseconds.
#[derive(Debug, Clone, Default)]
pub struct RefractoryLock {
    until: Arc<Mutex<Option<u64>>>,
}

impl RefractoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock until `now_ms + ttl_ms`.
    pub fn arm(&self, now_ms: u64, ttl_ms: u64) -> u64 {
        self.arm_until(now_ms.saturating_add(ttl_ms))
    }

    /// Lock until an absolute expiry. Returns the effective expiry.
    pub fn arm_until(&self, expiry_ms: u64) -> u64 {
        match self.until.lock() {
            Ok(mut until) => {
                let next = until.map_or(expiry_ms, |cur| cur.max(expiry_ms));
                *until = Some(next);
                next
            }
            // A poisoned lock still holds a valid expiry.
            Err(poisoned) => {
                let mut until = poisoned.into_inner();
                let next = until.map_or(expiry_ms, |cur| cur.max(expiry_ms));
                *until = Some(next);
                next
            }
        }
    }

    pub fn is_active(&self, now_ms: u64) -> bool {
        self.expiry().is_some_and(|until| now_ms < until)
    }

    pub fn expiry(&self) -> Option<u64> {
        match self.until.lock() {
            Ok(until) => *until,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inactive_until_armed() {
        let lock = RefractoryLock::new();
        assert!(!lock.is_active(0));
        assert_eq!(lock.expiry(), None);
    }

    #[test]
    fn test_ttl_window() {
        let lock = RefractoryLock::new();
        lock.arm(1_000, 15_000);
        assert!(lock.is_active(1_000));
        assert!(lock.is_active(15_999));
        assert!(!lock.is_active(16_000));
    }

    #[test]
    fn test_arming_never_shortens() {
        let lock = RefractoryLock::new();
        lock.arm_until(100_000);
        assert_eq!(lock.arm(1_000, 15_000), 100_000);
        assert_eq!(lock.arm(90_000, 15_000), 105_000);
    }

    #[test]
    fn test_shared_between_clones_and_threads() {
        let lock = RefractoryLock::new();
        let handles: Vec<_> = (0..8u64)
            .map(|i| {
                let l = lock.clone();
                std::thread::spawn(move || {
                    l.arm(i * 1_000, 15_000);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(lock.expiry(), Some(7_000 + 15_000));
    }
}
