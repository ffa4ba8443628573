//! # Calibration Module
//!
//! Samples the ambient level for a fixed window and turns the collected levels
//! into a recommended noise floor, gain and gate threshold.
//!
//! A run is driven by the session's ticks and resolves its [`CalibrationTicket`]
//! exactly once, whatever ends it: the window closing, a timeout, an explicit
//! cancel, a newer run, a session reset, or the run simply being dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{CalibrationConfig, GateConfig, RuntimeParams};
use crate::noise_gate::NoiseGate;

/// Summary statistics of the collected ambient levels (dBFS).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationStats {
    pub median: f64,
    pub mean: f64,
    /// Population standard deviation.
    pub std_dev: f64,
    pub p25: f64,
    pub p75: f64,
    pub sample_count: usize,
}

/// Linear-interpolated percentile of an ascending slice, `p` in `[0, 1]`.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let position = p.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
}

impl CalibrationStats {
    /// Computes statistics over the finite values in `samples`.
    ///
    /// Returns `None` when no finite sample remains.
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        let mut sorted: Vec<f64> = samples.iter().copied().filter(|s| s.is_finite()).collect();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_by(|a, b| a.total_cmp(b));

        let n = sorted.len() as f64;
        let mean = sorted.iter().sum::<f64>() / n;
        let variance = sorted.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;

        Some(Self {
            median: percentile(&sorted, 0.5),
            mean,
            std_dev: variance.sqrt(),
            p25: percentile(&sorted, 0.25),
            p75: percentile(&sorted, 0.75),
            sample_count: sorted.len(),
        })
    }

    pub fn iqr(&self) -> f64 {
        self.p75 - self.p25
    }
}

/// `max(median + 2σ, median + 1.5·IQR, median + 5 dB)`, clamped to the
/// configured noise-floor range.
pub fn recommend_noise_floor(stats: &CalibrationStats, config: &CalibrationConfig) -> f64 {
    let floor = (stats.median + 2.0 * stats.std_dev)
        .max(stats.median + 1.5 * stats.iqr())
        .max(stats.median + 5.0);
    floor.clamp(config.noise_floor_min_db, config.noise_floor_max_db)
}

/// Scales `current_gain` against the loudest observed level.
///
/// Very quiet rooms get a boost, loud ones a cut. The result stays in the
/// runtime gain range.
pub fn recommend_gain(current_gain: f64, peak_db: f64) -> f64 {
    let factor = if peak_db > -20.0 {
        0.5
    } else if peak_db > -30.0 {
        0.7
    } else if peak_db < -70.0 {
        2.0
    } else if peak_db < -60.0 {
        1.5
    } else {
        1.0
    };
    RuntimeParams::clamp_gain(current_gain * factor)
}

/// Everything a successful run recommends.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub stats: CalibrationStats,
    /// Loudest level observed during the window.
    pub peak_db: f64,
    pub noise_floor_db: f64,
    pub gain: f64,
    pub gate_threshold_db: f64,
}

/// How a run ended. Sent exactly once per run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum CalibrationOutcome {
    Complete(CalibrationReport),
    /// The window closed with too few samples to trust.
    InsufficientSamples { collected: usize },
    Cancelled,
    /// The first observation after the window arrived past the hard deadline
    /// and the run was still short of samples.
    TimedOut,
}

/// Observable calibration status.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum CalibrationState {
    Idle,
    Sampling { progress: f64 },
    Complete,
    Failed,
    Cancelled,
    TimedOut,
}

impl From<&CalibrationOutcome> for CalibrationState {
    fn from(outcome: &CalibrationOutcome) -> Self {
        match outcome {
            CalibrationOutcome::Complete(_) => Self::Complete,
            CalibrationOutcome::InsufficientSamples { .. } => Self::Failed,
            CalibrationOutcome::Cancelled => Self::Cancelled,
            CalibrationOutcome::TimedOut => Self::TimedOut,
        }
    }
}

/// Shared cancel flag between a ticket and its run.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Caller-side handle of a calibration run.
///
/// The outcome arrives over a one-shot channel; once read it is cached, so
/// repeated queries keep returning it.
pub struct CalibrationTicket {
    receiver: Receiver<CalibrationOutcome>,
    token: CancellationToken,
    outcome: Option<CalibrationOutcome>,
}

impl CalibrationTicket {
    /// Requests cancellation. The run notices on its next observation.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns the outcome if the run has resolved, without blocking.
    pub fn try_outcome(&mut self) -> Option<CalibrationOutcome> {
        if self.outcome.is_none() {
            match self.receiver.try_recv() {
                Ok(outcome) => self.outcome = Some(outcome),
                Err(TryRecvError::Disconnected) => self.outcome = Some(CalibrationOutcome::Cancelled),
                Err(TryRecvError::Empty) => {}
            }
        }
        self.outcome
    }

    /// Waits at most `timeout` for the outcome.
    ///
    /// Only useful when the session is ticked from another thread.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<CalibrationOutcome> {
        if self.outcome.is_none() {
            match self.receiver.recv_timeout(timeout) {
                Ok(outcome) => self.outcome = Some(outcome),
                Err(RecvTimeoutError::Disconnected) => self.outcome = Some(CalibrationOutcome::Cancelled),
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
        self.outcome
    }

    pub fn is_resolved(&mut self) -> bool {
        self.try_outcome().is_some()
    }
}

/// Run-side state: collects levels and sends the single outcome.
pub struct CalibrationRun {
    config: CalibrationConfig,
    gate: GateConfig,
    sender: Option<Sender<CalibrationOutcome>>,
    token: CancellationToken,
    samples: Vec<f64>,
    started_at: f64,
    duration: f64,
    current_gain: f64,
}

impl CalibrationRun {
    /// Starts a run at session time `now` (seconds).
    ///
    /// `duration` defaults to the configured window when `None`.
    pub fn start(
        config: &CalibrationConfig,
        gate: &GateConfig,
        duration: Option<Duration>,
        now: f64,
        current_gain: f64,
    ) -> (Self, CalibrationTicket) {
        let (sender, receiver) = bounded(1);
        let token = CancellationToken::new();
        let duration = duration
            .map(|d| d.as_secs_f64())
            .unwrap_or(config.default_duration_ms / 1000.0)
            .max(0.0);
        info!("Calibration started: window {:.2}s", duration);

        let run = Self {
            config: config.clone(),
            gate: gate.clone(),
            sender: Some(sender),
            token: token.clone(),
            samples: Vec::new(),
            started_at: now,
            duration,
            current_gain,
        };
        let ticket = CalibrationTicket {
            receiver,
            token,
            outcome: None,
        };
        (run, ticket)
    }

    pub fn is_resolved(&self) -> bool {
        self.sender.is_none()
    }

    /// Fraction of the window elapsed at `now`, in `[0, 1]`.
    pub fn progress(&self, now: f64) -> f64 {
        if self.duration <= 0.0 {
            1.0
        } else {
            ((now - self.started_at) / self.duration).clamp(0.0, 1.0)
        }
    }

    /// Records one tick's level at session time `now`. A tick without audio
    /// passes `None`; it still advances the window and the deadline.
    ///
    /// Returns the outcome on the tick the run resolves, `None` while sampling
    /// or once already resolved.
    pub fn observe(&mut self, level_db: Option<f64>, now: f64) -> Option<CalibrationOutcome> {
        if self.is_resolved() {
            return None;
        }
        if self.token.is_cancelled() {
            return Some(self.resolve(CalibrationOutcome::Cancelled));
        }
        if let Some(level) = level_db.filter(|level| level.is_finite()) {
            self.samples.push(level);
        }

        let window_end = self.started_at + self.duration;
        if now < window_end {
            return None;
        }

        let deadline = window_end + self.config.timeout_grace_ms.max(0.0) / 1000.0;
        let collected = self.samples.len();
        let outcome = if collected >= self.config.min_samples.max(1) {
            match self.report() {
                Some(report) => CalibrationOutcome::Complete(report),
                None => CalibrationOutcome::InsufficientSamples { collected },
            }
        } else if now >= deadline {
            CalibrationOutcome::TimedOut
        } else {
            CalibrationOutcome::InsufficientSamples { collected }
        };
        Some(self.resolve(outcome))
    }

    fn report(&self) -> Option<CalibrationReport> {
        let stats = CalibrationStats::from_samples(&self.samples)?;
        let peak_db = self.samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Some(CalibrationReport {
            stats,
            peak_db,
            noise_floor_db: recommend_noise_floor(&stats, &self.config),
            gain: recommend_gain(self.current_gain, peak_db),
            gate_threshold_db: NoiseGate::threshold_from_stats(&stats, &self.gate),
        })
    }

    /// Resolves the run as cancelled. Does nothing if already resolved.
    pub fn cancel(&mut self) -> Option<CalibrationOutcome> {
        (!self.is_resolved()).then(|| self.resolve(CalibrationOutcome::Cancelled))
    }

    fn resolve(&mut self, outcome: CalibrationOutcome) -> CalibrationOutcome {
        if let Some(sender) = self.sender.take() {
            match &outcome {
                CalibrationOutcome::Complete(report) => info!(
                    "Calibration complete: {} samples, median {:.1} dB, gate {:.1} dB",
                    report.stats.sample_count, report.stats.median, report.gate_threshold_db
                ),
                CalibrationOutcome::InsufficientSamples { collected } => {
                    warn!("Calibration failed: only {} samples collected", collected)
                }
                other => info!("Calibration ended: {:?}", other),
            }
            // The ticket may already be gone; nobody is waiting then
            if sender.try_send(outcome).is_err() {
                debug!("Calibration outcome had no receiver");
            }
        }
        outcome
    }
}

impl Drop for CalibrationRun {
    fn drop(&mut self) {
        if !self.is_resolved() {
            self.resolve(CalibrationOutcome::Cancelled);
        }
    }
}
