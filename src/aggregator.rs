//! Per-anchor sliding-window distance aggregation.
//!
//! Each anchor owns a time-bounded window of samples behind its own mutex:
//! one reader task writes it and the positioning loop reads it. Retention and
//! staleness are separate thresholds. Retention bounds which samples feed the
//! mean, staleness decides whether the newest sample is recent enough to
//! report at the instant of the query.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use crate::config::PositioningConfig;
use crate::error::Result;
use crate::types::{AnchorId, Sample};

/// Time-ordered (by arrival) distance samples for one anchor
#[derive(Debug, Default)]
pub struct AnchorWindow {
    samples: VecDeque<Sample>,
    latest_timestamp: Option<f64>,
}

impl AnchorWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append at the tail. Out-of-order samples are kept where they land.
    pub fn push(&mut self, sample: Sample) {
        self.latest_timestamp = Some(match self.latest_timestamp {
            Some(latest) => latest.max(sample.timestamp),
            None => sample.timestamp,
        });
        self.samples.push_back(sample);
    }

    /// Drop samples from the front while they are older than `cutoff`.
    /// Only the front is inspected; a young sample shields older ones behind it.
    pub fn evict_before(&mut self, cutoff: f64) {
        while let Some(front) = self.samples.front() {
            if front.timestamp < cutoff {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let total: f64 = self.samples.iter().map(|s| s.distance).sum();
        Some(total / self.samples.len() as f64)
    }

    /// Freshest timestamp ever recorded, kept even after its sample is evicted.
    pub fn latest_timestamp(&self) -> Option<f64> {
        self.latest_timestamp
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Outcome of asking for an anchor's current distance estimate
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AnchorAverage {
    /// Mean of the in-window samples
    Fresh { mean: f64, count: usize },
    /// Nothing recorded, or everything has aged out of the window
    NoData,
    /// The newest sample is older than the staleness timeout
    Stale { age_secs: f64 },
}

impl AnchorAverage {
    pub fn fresh_mean(&self) -> Option<f64> {
        match self {
            AnchorAverage::Fresh { mean, .. } => Some(*mean),
            _ => None,
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, AnchorAverage::Fresh { .. })
    }
}

/// Owns one window per anchor and answers windowed-average queries
#[derive(Debug)]
pub struct DistanceAggregator {
    averaging_window: f64,
    staleness_timeout: f64,
    windows: [Mutex<AnchorWindow>; 2],
}

impl DistanceAggregator {
    pub fn new(config: &PositioningConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            averaging_window: config.averaging_window_secs,
            staleness_timeout: config.staleness_timeout_secs,
            windows: [Mutex::new(AnchorWindow::new()), Mutex::new(AnchorWindow::new())],
        })
    }

    fn window(&self, anchor: AnchorId) -> MutexGuard<'_, AnchorWindow> {
        let slot = match anchor {
            AnchorId::One => &self.windows[0],
            AnchorId::Two => &self.windows[1],
        };
        // A window is plain data; a panic elsewhere cannot leave it half-updated.
        slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a sample and evict relative to the freshest timestamp for that
    /// anchor. Returns `false` (and records nothing) for non-finite input.
    pub fn record(&self, anchor: AnchorId, timestamp: f64, distance: f64) -> bool {
        if !distance.is_finite() || !timestamp.is_finite() {
            log::debug!("rejecting non-finite sample for {}: t={} d={}", anchor, timestamp, distance);
            return false;
        }

        let mut window = self.window(anchor);
        window.push(Sample::new(anchor, timestamp, distance));
        if let Some(latest) = window.latest_timestamp() {
            window.evict_before(latest - self.averaging_window);
        }
        true
    }

    /// Windowed mean at instant `now`, or why there is none.
    pub fn average(&self, anchor: AnchorId, now: f64) -> AnchorAverage {
        let mut window = self.window(anchor);

        let latest = match window.latest_timestamp() {
            Some(latest) => latest,
            None => return AnchorAverage::NoData,
        };

        let age = now - latest;
        if age > self.staleness_timeout {
            return AnchorAverage::Stale { age_secs: age };
        }

        window.evict_before(now - self.averaging_window);
        match window.mean() {
            Some(mean) => AnchorAverage::Fresh {
                mean,
                count: window.len(),
            },
            None => AnchorAverage::NoData,
        }
    }

    /// Window size after the most recent eviction.
    pub fn sample_count(&self, anchor: AnchorId) -> usize {
        self.window(anchor).len()
    }
}
