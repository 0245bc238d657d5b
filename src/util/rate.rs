//! Windowed transfer-rate estimation.

use std::time::Instant;

/// Rolling average of bytes/second over a fixed sample window.
///
/// Shared by the HTTP transfer path and the torrent swarm for the
/// `rate` and `upRate` fields published to clients.
#[derive(Debug)]
pub struct SpeedCalculator {
    window_size: usize,
    measurements: Vec<(u64, Instant)>,
    total_bytes: u64,
}

impl SpeedCalculator {
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size,
            measurements: Vec::with_capacity(window_size),
            total_bytes: 0,
        }
    }

    pub fn add_bytes(&mut self, bytes: u64) {
        let now = Instant::now();
        self.total_bytes += bytes;

        if self.measurements.len() >= self.window_size {
            self.measurements.remove(0);
        }
        self.measurements.push((bytes, now));
    }

    /// Current rate in bytes/second, 0 until enough samples exist.
    pub fn speed(&self) -> u64 {
        if self.measurements.len() < 2 {
            return 0;
        }

        let first = &self.measurements[0];
        let last = &self.measurements[self.measurements.len() - 1];

        let elapsed = last.1.duration_since(first.1).as_secs_f64();
        if elapsed <= 0.0 {
            return 0;
        }

        let bytes: u64 = self.measurements.iter().map(|(b, _)| *b).sum();
        (bytes as f64 / elapsed) as u64
    }

    pub fn total(&self) -> u64 {
        self.total_bytes
    }

    pub fn reset(&mut self) {
        self.measurements.clear();
        self.total_bytes = 0;
    }
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new(20)
    }
}
