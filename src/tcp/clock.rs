use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

/// Slow timer ticks per second.
pub const PR_SLOWHZ: u32 = 2;

/// Interval of the slow timer in milliseconds.
pub const SLOW_TICK_MS: u64 = 500;

/// Interval of the fast (delayed ACK) timer in milliseconds.
pub const FAST_TICK_MS: u64 = 200;

/// The shared logical TCP clock.
///
/// The clock counts slow ticks. It is advanced exactly once per slow timer
/// pass by whoever drives the timers and is read by every connection for
/// timestamps and PAWS aging.
#[derive(Debug, Clone, Default)]
pub struct TcpClock {
    now: Arc<AtomicU32>,
}

impl TcpClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn now(&self) -> u32 {
        self.now.load(Ordering::Relaxed)
    }

    pub fn tick(&self) {
        self.now.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set(&self, now: u32) {
        self.now.store(now, Ordering::Relaxed);
    }
}
