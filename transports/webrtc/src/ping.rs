//! Round-trip time tracking for a single joiner

use std::collections::VecDeque;

use tokio::time::Instant;

/// Number of samples kept in the rolling window
pub const PING_WINDOW: usize = 5;

/// Rolling round-trip estimator
///
/// Sits idle until [`PingTracker::record_ping`] stores an in-flight token;
/// the matching [`PingTracker::pong`] turns the elapsed time into a sample.
/// A ping that never gets its pong is simply replaced by the next one.
#[derive(Debug, Default)]
pub struct PingTracker {
    samples: VecDeque<u64>,
    in_flight: Option<(u64, Instant)>,
}

impl PingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember that `token` was just sent
    pub fn record_ping(&mut self, token: u64) {
        self.in_flight = Some((token, Instant::now()));
    }

    /// Token of the ping currently awaiting its pong
    pub fn awaiting(&self) -> Option<u64> {
        self.in_flight.map(|(token, _)| token)
    }

    /// Close the round trip for `token`, returning the measured milliseconds
    ///
    /// Returns `None` for stale or unknown tokens; the tracker is unchanged.
    pub fn pong(&mut self, token: u64) -> Option<u64> {
        match self.in_flight {
            Some((expected, sent_at)) if expected == token => {
                self.in_flight = None;
                let elapsed = sent_at.elapsed().as_millis() as u64;
                self.observe(elapsed);
                Some(elapsed)
            }
            _ => None,
        }
    }

    /// Add a sample, evicting the oldest beyond the window, and return the new average
    pub fn observe(&mut self, sample_ms: u64) -> Option<u64> {
        self.samples.push_back(sample_ms);
        while self.samples.len() > PING_WINDOW {
            self.samples.pop_front();
        }
        self.average()
    }

    /// Rounded mean of the retained samples
    pub fn average(&self) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: u64 = self.samples.iter().sum();
        Some((sum as f64 / self.samples.len() as f64).round() as u64)
    }

    /// Retained samples, oldest first
    pub fn samples(&self) -> impl Iterator<Item = u64> + '_ {
        self.samples.iter().copied()
    }

    /// Forget everything, e.g. after a reconnect
    pub fn reset(&mut self) {
        self.samples.clear();
        self.in_flight = None;
    }
}
