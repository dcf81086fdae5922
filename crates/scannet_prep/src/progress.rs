use std::time::{Duration, Instant};

/// Rate-limited progress trigger for long sequential passes.
#[derive(Debug)]
pub struct Tick {
    start: Instant,
    last: Instant,
    every: usize,
}

impl Tick {
    /// Trigger at most once per `every` items.
    #[inline]
    pub fn new(every: usize) -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last: now,
            every: every.max(1),
        }
    }

    /// `count` is a multiple of `every` and 200 ms passed since the last report.
    #[inline]
    pub fn should(&mut self, count: usize) -> bool {
        const MIN_INTERVAL: Duration = Duration::from_millis(200);
        count % self.every == 0 && self.last.elapsed() >= MIN_INTERVAL
    }

    #[inline]
    pub fn bump(&mut self) {
        self.last = Instant::now();
    }

    /// Items per second since creation.
    #[inline]
    pub fn rate(&self, count: usize) -> f64 {
        let elapsed = self.start.elapsed().as_secs_f64().max(1e-9);
        count as f64 / elapsed
    }
}
