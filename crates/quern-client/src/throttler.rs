//! Bandwidth accounting interface
//!
//! Throttling policy lives outside this core; the replica set only
//! reports how many bytes each received data block carried.

use std::sync::atomic::{AtomicU64, Ordering};

/// Accounting hook called for every received data block.
pub trait Throttler: Send + Sync {
    fn account(&self, bytes: u64);
}

/// A throttler that only counts. Useful for tests and metrics wiring.
#[derive(Debug, Default)]
pub struct CountingThrottler {
    total: AtomicU64,
}

impl CountingThrottler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

impl Throttler for CountingThrottler {
    fn account(&self, bytes: u64) {
        self.total.fetch_add(bytes, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counting_throttler() {
        let throttler = CountingThrottler::new();
        throttler.account(100);
        throttler.account(24);
        assert_eq!(throttler.total_bytes(), 124);
    }
}
