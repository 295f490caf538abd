use std::time::{Duration, Instant};

/// Measures elapsed time from the start of one request.
///
/// Every frame of a response is stamped with `elapsed_secs()` of the same
/// stopwatch, so latencies can be reconstructed from the stream alone.
#[derive(Clone, Copy, Debug)]
pub struct Stopwatch {
    started: Instant,
}

impl Stopwatch {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Elapsed seconds, rounded to whole milliseconds.
    pub fn elapsed_secs(&self) -> f64 {
        round_millis(self.started.elapsed().as_secs_f64())
    }
}

impl Default for Stopwatch {
    fn default() -> Self {
        Self::start()
    }
}

/// Round a duration in seconds to millisecond precision.
pub fn round_millis(secs: f64) -> f64 {
    (secs * 1000.0).round() / 1000.0
}
