//! Progress reporting

use std::sync::Mutex;

/// Sink for fractional progress of a running stage
pub trait Ticker: Send + Sync {
    /// Advance progress by `fraction` of one unit of work
    fn advance(&self, fraction: f64);
}

/// Ticker that discards progress
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTicker;

impl Ticker for NoopTicker {
    fn advance(&self, _fraction: f64) {}
}

/// Ticker that accumulates progress, for tests and summaries
#[derive(Debug, Default)]
pub struct RecordingTicker {
    total: Mutex<f64>,
}

impl RecordingTicker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self) -> f64 {
        self.total.lock().map(|total| *total).unwrap_or_default()
    }
}

impl Ticker for RecordingTicker {
    fn advance(&self, fraction: f64) {
        if let Ok(mut total) = self.total.lock() {
            *total += fraction;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_ticker_accumulates() {
        let ticker = RecordingTicker::new();
        for _ in 0..6 {
            ticker.advance(1.0 / 6.0);
        }
        assert!((ticker.total() - 1.0).abs() < 1e-9);
    }
}
