use std::time::{Duration, Instant};

use log::debug;

/// Wall-clock timer that logs laps at debug level.
pub struct Timer {
    last: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            last: Instant::now(),
        }
    }

    // Logs the time since the previous lap and starts a new one.
    pub fn log<T: std::fmt::Display>(&mut self, msg: T) -> Duration {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last);
        self.last = now;
        debug!("{msg}: {:.3}s", elapsed.as_secs_f64());
        elapsed
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
