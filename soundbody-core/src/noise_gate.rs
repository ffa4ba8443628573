//! # Noise Gate Module
//!
//! Decides each tick whether the input is "active" using a two-state machine
//! with hysteresis and attack/hold/release timers, and tracks the ambient noise
//! floor from the quiet ticks in between.
//!
//! ## Features
//! - Time-based level smoothing (independent of tick rate)
//! - Separate open and close thresholds (close is always below open)
//! - Attack before opening, hold after opening, release before closing
//! - Fixed-capacity ring buffer of quiet levels feeding a median noise floor

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::calibration::CalibrationStats;
use crate::config::GateConfig;

/// Capacity of the noise-floor ring buffer.
pub const NOISE_FLOOR_CAPACITY: usize = 100;
/// Samples needed before the noise-floor median is trusted.
pub const NOISE_FLOOR_MIN_SAMPLES: usize = 10;
/// Lower bound on the open/close threshold gap.
const MIN_HYSTERESIS_DB: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateState {
    Open,
    Closed,
}

/// Result of feeding one level through the gate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GateOutput {
    pub state: GateState,
    /// Input level when open, pushed well below the close threshold when closed.
    pub level_db: f64,
    pub smoothed_level_db: f64,
}

impl GateOutput {
    pub fn is_open(&self) -> bool {
        self.state == GateState::Open
    }
}

/// Fixed-size ring of quiet levels with a blended median estimate.
#[derive(Debug, Clone)]
pub struct NoiseFloorTracker {
    samples: [f64; NOISE_FLOOR_CAPACITY],
    cursor: usize,
    len: usize,
    estimate: Option<f64>,
    blend: f64,
}

impl NoiseFloorTracker {
    pub fn new(blend: f64) -> Self {
        Self {
            samples: [0.0; NOISE_FLOOR_CAPACITY],
            cursor: 0,
            len: 0,
            estimate: None,
            blend: blend.clamp(0.0, 1.0),
        }
    }

    /// Records a quiet level and updates the estimate once enough are stored.
    pub fn push(&mut self, level_db: f64) {
        if !level_db.is_finite() {
            return;
        }
        self.samples[self.cursor] = level_db;
        self.cursor = (self.cursor + 1) % NOISE_FLOOR_CAPACITY;
        self.len = (self.len + 1).min(NOISE_FLOOR_CAPACITY);

        if self.len >= NOISE_FLOOR_MIN_SAMPLES {
            let median = self.median();
            self.estimate = Some(match self.estimate {
                Some(current) => current + (median - current) * self.blend,
                None => median,
            });
        }
    }

    fn median(&self) -> f64 {
        let mut sorted = self.samples[..self.len].to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn estimate(&self) -> Option<f64> {
        self.estimate
    }

    pub fn clear(&mut self) {
        self.cursor = 0;
        self.len = 0;
        self.estimate = None;
    }
}

/// Hysteresis gate over a smoothed dB level.
pub struct NoiseGate {
    config: GateConfig,
    open_threshold_db: f64,
    hysteresis_db: f64,
    attack: f64,
    hold: f64,
    release: f64,

    state: GateState,
    /// Gate clock in seconds, advanced by each `process` call.
    now: f64,
    smoothed_level: Option<f64>,
    opened_at: f64,
    last_closed_at: Option<f64>,
    above_since: Option<f64>,
    below_since: Option<f64>,
    noise_floor: NoiseFloorTracker,
}

impl NoiseGate {
    pub fn new(config: GateConfig) -> Self {
        let mut gate = Self {
            open_threshold_db: 0.0,
            hysteresis_db: 0.0,
            attack: 0.0,
            hold: 0.0,
            release: 0.0,
            state: GateState::Closed,
            now: 0.0,
            smoothed_level: None,
            opened_at: 0.0,
            last_closed_at: None,
            above_since: None,
            below_since: None,
            noise_floor: NoiseFloorTracker::new(config.noise_floor_blend),
            config,
        };
        gate.set_threshold(gate.config.open_threshold_db);
        gate.set_hysteresis(gate.config.hysteresis_db);
        gate.set_timing(gate.config.attack_ms, gate.config.hold_ms, gate.config.release_ms);
        debug!(
            "NoiseGate created: open={:.1} dB, close={:.1} dB",
            gate.open_threshold_db,
            gate.close_threshold_db()
        );
        gate
    }

    pub fn open_threshold_db(&self) -> f64 {
        self.open_threshold_db
    }

    pub fn close_threshold_db(&self) -> f64 {
        self.open_threshold_db - self.hysteresis_db
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == GateState::Open
    }

    pub fn noise_floor_estimate(&self) -> Option<f64> {
        self.noise_floor.estimate()
    }

    /// Sets the open threshold, clamped to the configured safe range.
    pub fn set_threshold(&mut self, threshold_db: f64) {
        let threshold = if threshold_db.is_finite() {
            threshold_db
        } else {
            self.config.open_threshold_db
        };
        self.open_threshold_db = threshold.clamp(self.config.safe_min_db, self.config.safe_max_db);
    }

    pub fn set_hysteresis(&mut self, hysteresis_db: f64) {
        self.hysteresis_db = if hysteresis_db.is_finite() {
            hysteresis_db.max(MIN_HYSTERESIS_DB)
        } else {
            MIN_HYSTERESIS_DB
        };
    }

    /// Updates attack, hold and release times (milliseconds).
    pub fn set_timing(&mut self, attack_ms: f64, hold_ms: f64, release_ms: f64) {
        let seconds = |ms: f64| if ms.is_finite() { ms.max(0.0) / 1000.0 } else { 0.0 };
        self.attack = seconds(attack_ms);
        self.hold = seconds(hold_ms);
        self.release = seconds(release_ms);
    }

    /// Gate threshold recommended by an ambient calibration run.
    ///
    /// `median + max(2σ, 5 dB)`, clamped to the safe range.
    pub fn threshold_from_stats(stats: &CalibrationStats, config: &GateConfig) -> f64 {
        let threshold = stats.median + (2.0 * stats.std_dev).max(5.0);
        threshold.clamp(config.safe_min_db, config.safe_max_db)
    }

    /// Adopts the threshold derived from `stats` and returns it.
    pub fn apply_calibration(&mut self, stats: &CalibrationStats) -> f64 {
        let threshold = Self::threshold_from_stats(stats, &self.config);
        self.set_threshold(threshold);
        debug!("NoiseGate threshold calibrated to {:.1} dB", self.open_threshold_db);
        self.open_threshold_db
    }

    /// Feeds one tick's level through the gate.
    ///
    /// # Arguments
    /// * `level_db` - Input level in dBFS; non-finite input counts as silence
    /// * `dt` - Seconds elapsed since the previous call
    pub fn process(&mut self, level_db: f64, dt: f64) -> GateOutput {
        let level = if level_db.is_finite() { level_db } else { -120.0 };
        let dt = if dt.is_finite() { dt.max(0.0) } else { 0.0 };
        self.now += dt;

        let smoothed = self.smooth(level, dt);
        let close_threshold = self.close_threshold_db();

        if level < self.open_threshold_db - self.config.noise_margin_db {
            self.noise_floor.push(level);
        }

        match self.state {
            GateState::Closed => {
                if smoothed > self.open_threshold_db {
                    let above_since = *self.above_since.get_or_insert(self.now);
                    let attack_elapsed = self.now - above_since >= self.attack;
                    let rested = self
                        .last_closed_at
                        .is_none_or(|closed| self.now - closed >= self.attack);
                    if attack_elapsed && rested {
                        self.state = GateState::Open;
                        self.opened_at = self.now;
                        self.below_since = None;
                        debug!("Gate opened at {:.3}s (level {:.1} dB)", self.now, smoothed);
                    }
                } else {
                    self.above_since = None;
                }
            }
            GateState::Open => {
                if smoothed < close_threshold {
                    let below_since = *self.below_since.get_or_insert(self.now);
                    let released = self.now - below_since >= self.release;
                    let held = self.now - self.opened_at >= self.hold;
                    if released && held {
                        self.state = GateState::Closed;
                        self.last_closed_at = Some(self.now);
                        self.above_since = None;
                        debug!("Gate closed at {:.3}s (level {:.1} dB)", self.now, smoothed);
                    }
                } else {
                    self.below_since = None;
                }
            }
        }

        let level_db = match self.state {
            GateState::Open => level,
            GateState::Closed => level.min(close_threshold - self.config.closed_attenuation_db),
        };
        GateOutput {
            state: self.state,
            level_db,
            smoothed_level_db: smoothed,
        }
    }

    fn smooth(&mut self, level: f64, dt: f64) -> f64 {
        let tau = self.config.level_smoothing_ms / 1000.0;
        let smoothed = match self.smoothed_level {
            None => level,
            Some(previous) if tau > 0.0 => previous + (level - previous) * (1.0 - (-dt / tau).exp()),
            Some(_) => level,
        };
        self.smoothed_level = Some(smoothed);
        smoothed
    }

    /// Closes the gate and forgets timers and the noise floor. Thresholds stay.
    pub fn reset(&mut self) {
        self.state = GateState::Closed;
        self.now = 0.0;
        self.smoothed_level = None;
        self.opened_at = 0.0;
        self.last_closed_at = None;
        self.above_since = None;
        self.below_since = None;
        self.noise_floor.clear();
        debug!("NoiseGate reset");
    }
}
