//! Clock driven by tokio's timer.

use cobrief_core::{Clock, SystemClock};
use tokio::time::Instant;

/// Wall-clock milliseconds captured once, advanced by tokio's monotonic
/// timer. Under `tokio::time::pause` it moves only with `advance`, which
/// keeps heartbeats and freshness checks on the same timeline.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    origin: Instant,
    origin_millis: u64,
}

impl TokioClock {
    pub fn new() -> Self {
        Self::starting_at(SystemClock.now_millis())
    }

    pub fn starting_at(origin_millis: u64) -> Self {
        Self {
            origin: Instant::now(),
            origin_millis,
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now_millis(&self) -> u64 {
        self.origin_millis + self.origin.elapsed().as_millis() as u64
    }
}
