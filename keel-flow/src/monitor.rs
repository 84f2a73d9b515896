//! Windowed throughput measurement per peer.
//!
//! The dispatcher reports every batch it puts on the wire; the monitor
//! keeps a sliding window of those reports and derives a bytes-per-second
//! rate for each peer. The rates are pulled periodically to retune the
//! per-peer token buckets.

use std::collections::{HashMap, VecDeque};

use crate::PeerKey;

/// Default measurement window: 10 seconds.
const WINDOW_US_DEFAULT: u64 = 10_000_000;

/// One reported send.
#[derive(Debug, Clone, Copy)]
struct Sample {
    at_us: u64,
    bytes: u64,
}

/// Sliding-window throughput monitor keyed by peer.
#[derive(Debug)]
pub struct FlowMonitor {
    window_us: u64,
    samples: HashMap<PeerKey, VecDeque<Sample>>,
}

impl Default for FlowMonitor {
    fn default() -> Self {
        Self::new(WINDOW_US_DEFAULT)
    }
}

impl FlowMonitor {
    /// Creates a monitor with the given window length in microseconds.
    ///
    /// # Panics
    /// Panics if the window is zero.
    #[must_use]
    pub fn new(window_us: u64) -> Self {
        assert!(window_us > 0, "window must be non-zero");
        Self {
            window_us,
            samples: HashMap::new(),
        }
    }

    /// Registers a peer so that `rates` reports it even before traffic.
    pub fn register(&mut self, peer: PeerKey) {
        self.samples.entry(peer).or_default();
    }

    /// Records that `bytes` were sent to `peer` at `now_us`.
    pub fn report(&mut self, peer: PeerKey, bytes: u64, now_us: u64) {
        let window = self.samples.entry(peer).or_default();
        window.push_back(Sample { at_us: now_us, bytes });
        Self::evict(window, self.window_us, now_us);
    }

    /// Returns the measured rate for `peer` in bytes per second, or `None`
    /// if the window holds no samples.
    #[must_use]
    pub fn rate(&mut self, peer: PeerKey, now_us: u64) -> Option<u64> {
        let window = self.samples.get_mut(&peer)?;
        Self::evict(window, self.window_us, now_us);
        if window.is_empty() {
            return None;
        }

        let total: u64 = window.iter().map(|s| s.bytes).sum();
        // Average over the full window, not just the sampled span; a burst
        // followed by silence should read as a low rate.
        Some(
            u64::try_from(u128::from(total) * 1_000_000 / u128::from(self.window_us))
                .unwrap_or(u64::MAX),
        )
    }

    /// Returns the measured rate for every registered peer.
    #[must_use]
    pub fn rates(&mut self, now_us: u64) -> HashMap<PeerKey, Option<u64>> {
        let peers: Vec<PeerKey> = self.samples.keys().copied().collect();
        peers
            .into_iter()
            .map(|peer| {
                let rate = self.rate(peer, now_us);
                (peer, rate)
            })
            .collect()
    }

    fn evict(window: &mut VecDeque<Sample>, window_us: u64, now_us: u64) {
        let cutoff = now_us.saturating_sub(window_us);
        while window.front().is_some_and(|s| s.at_us < cutoff) {
            window.pop_front();
        }
    }
}
