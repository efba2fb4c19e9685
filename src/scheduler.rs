//! Tick sources that drive the capture pipeline.

use std::thread;
use std::time::{Duration, Instant};

use crate::task::CancelToken;

/// A periodic "next frame" signal.
pub trait TickSource {
    /// Wait for the next tick. Returns `false` once the source has ended.
    fn next_tick(&mut self) -> bool;
}

/// Wall-clock ticks at a fixed rate, standing in for the display refresh.
#[derive(Debug)]
pub struct FrameClock {
    interval: Duration,
    last: Option<Instant>,
    stop: CancelToken,
}

impl FrameClock {
    pub fn new(tick_hz: u32, stop: CancelToken) -> Self {
        let hz = tick_hz.max(1);
        Self {
            interval: Duration::from_secs_f64(1.0 / f64::from(hz)),
            last: None,
            stop,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl TickSource for FrameClock {
    fn next_tick(&mut self) -> bool {
        if self.stop.is_cancelled() {
            return false;
        }
        if let Some(last) = self.last {
            let due = last + self.interval;
            let now = Instant::now();
            if due > now {
                thread::sleep(due - now);
            }
        }
        self.last = Some(Instant::now());
        !self.stop.is_cancelled()
    }
}

/// A fixed number of immediate ticks.
#[derive(Debug, Clone, Copy)]
pub struct ManualTicks(pub usize);

impl TickSource for ManualTicks {
    fn next_tick(&mut self) -> bool {
        if self.0 == 0 {
            return false;
        }
        self.0 -= 1;
        true
    }
}
