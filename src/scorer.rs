//! Group synchronization scoring
//!
//! The score is a deliberately simple linear metric over the spread of the
//! current readings, not a statistical correlation. Downstream visuals are
//! calibrated against this exact formula (e.g. a trigger above 70%).

use crate::types::ScoreSummary;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Spread in bpm considered completely unsynchronized
pub const MAX_POSSIBLE_RANGE: f64 = 50.0;

/// Fewer active readings than this yield a score of zero
pub const MIN_ACTIVE_READINGS: usize = 2;

/// Score at which the visuals treat the group as synchronized
pub const SYNC_VISUAL_THRESHOLD: f64 = 70.0;

/// Default number of retained samples (one per second over 3 minutes)
pub const DEFAULT_SCORE_WINDOW: usize = 180;

/// Scorer for a snapshot of current readings
pub struct SyncScorer;

impl SyncScorer {
    /// Score the readings in `[0, 100]`.
    ///
    /// Zero readings are silent sensors and do not take part. Below two
    /// active readings the score is zero.
    pub fn score(readings: &[u16]) -> f64 {
        let mut active = readings.iter().copied().filter(|&bpm| bpm > 0);

        let Some(first) = active.next() else {
            return 0.0;
        };
        let (min, max, count) = active.fold((first, first, 1usize), |(min, max, n), bpm| {
            (min.min(bpm), max.max(bpm), n + 1)
        });

        if count < MIN_ACTIVE_READINGS {
            return 0.0;
        }

        let range = f64::from(max - min);
        let raw = 100.0 * (1.0 - range / MAX_POSSIBLE_RANGE);
        raw.clamp(0.0, 100.0)
    }

    /// Whether a score crosses the visual synchronization threshold
    pub fn is_synchronized(score: f64) -> bool {
        score >= SYNC_VISUAL_THRESHOLD
    }
}

/// Rolling record of scores observed during play
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreTracker {
    /// Retained scores, oldest first
    samples: VecDeque<f64>,
    /// Maximum window size
    window_size: usize,
}

impl Default for ScoreTracker {
    fn default() -> Self {
        Self::new(DEFAULT_SCORE_WINDOW)
    }
}

impl ScoreTracker {
    /// Create a tracker retaining at most `window_size` samples
    pub fn new(window_size: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            samples: VecDeque::with_capacity(window_size),
            window_size,
        }
    }

    /// Record a score, evicting the oldest sample when the window is full
    pub fn record(&mut self, score: f64) {
        self.samples.push_back(score);
        while self.samples.len() > self.window_size {
            self.samples.pop_front();
        }
    }

    /// Forget every sample
    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Summarize the retained samples
    pub fn summary(&self) -> ScoreSummary {
        if self.samples.is_empty() {
            return ScoreSummary::default();
        }

        let count = self.samples.len() as f64;
        let mean = self.samples.iter().sum::<f64>() / count;
        let peak = self.samples.iter().copied().fold(f64::MIN, f64::max);
        let synchronized = self
            .samples
            .iter()
            .filter(|&&score| SyncScorer::is_synchronized(score))
            .count() as f64;

        ScoreSummary {
            latest: self.samples.back().copied(),
            mean: Some(mean),
            peak: Some(peak),
            synchronized_fraction: Some(synchronized / count),
            samples: self.samples.len() as u32,
        }
    }
}
