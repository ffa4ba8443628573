//! # Session Module
//!
//! Owns one instance of every pipeline stage and runs them in order, once per
//! tick. Also hosts the calibration run and applies runtime parameter changes.
//!
//! A session has a single owner and no interior locking: call `tick` from one
//! place, at whatever rate the consumer renders.

use std::time::Duration;

use tracing::{debug, info, trace};

use crate::calibration::{CalibrationOutcome, CalibrationRun, CalibrationState, CalibrationTicket};
use crate::config::{RuntimeParams, SessionConfig};
use crate::noise_gate::NoiseGate;
use crate::pitch::FundamentalEstimator;
use crate::spectrum::{self, SpectralSnapshot};
use crate::tuning;
use crate::zones::{RegionMapper, ZONES};
use crate::{DominantZone, TickOutput, ZoneLevel};

/// Ticks between periodic trace lines.
const TRACE_INTERVAL: u64 = 60;

pub struct Session {
    config: SessionConfig,
    params: RuntimeParams,
    estimator: FundamentalEstimator,
    gate: NoiseGate,
    mapper: RegionMapper,
    calibration: Option<CalibrationRun>,
    calibration_state: CalibrationState,
    /// Session clock in seconds, the sum of every tick's `dt`.
    now: f64,
    ticks: u64,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        let mut session = Self {
            params: config.params.clamped(),
            estimator: FundamentalEstimator::new(config.estimator.clone()),
            gate: NoiseGate::new(config.gate.clone()),
            mapper: RegionMapper::new(config.zones.clone()),
            calibration: None,
            calibration_state: CalibrationState::Idle,
            now: 0.0,
            ticks: 0,
            config,
        };
        session.apply_params();
        debug!("Session created");
        session
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The parameters in effect, already clamped.
    pub fn params(&self) -> &RuntimeParams {
        &self.params
    }

    /// Applies new runtime parameters. Out-of-range values are clamped; the
    /// values actually used are returned.
    pub fn set_params(&mut self, params: RuntimeParams) -> RuntimeParams {
        self.params = params.clamped();
        self.apply_params();
        debug!("Runtime parameters updated: {:?}", self.params);
        self.params.clone()
    }

    fn apply_params(&mut self) {
        let p = &self.params;
        self.gate
            .set_timing(p.gate_attack_ms, p.gate_hold_ms, p.gate_release_ms);
        self.gate.set_hysteresis(p.hysteresis_db);
        self.mapper.set_envelope(p.zone_attack_ms, p.zone_decay_ms);
        self.mapper.set_switching(p.switch_margin, p.switch_hold_ms);
    }

    pub fn gate_threshold_db(&self) -> f64 {
        self.gate.open_threshold_db()
    }

    /// Ambient level learned from quiet ticks, in dBFS.
    pub fn noise_floor_estimate(&self) -> Option<f64> {
        self.gate.noise_floor_estimate()
    }

    /// Session clock: total time ticked since creation or the last reset.
    pub fn elapsed(&self) -> Duration {
        Duration::from_secs_f64(self.now)
    }

    /// Runs one tick.
    ///
    /// # Arguments
    /// * `snapshot` - This tick's spectrum, `None` when no audio arrived
    /// * `dt` - Time since the previous tick
    pub fn tick(&mut self, snapshot: Option<&SpectralSnapshot>, dt: Duration) -> TickOutput {
        let dt = dt.as_secs_f64();
        self.now += dt;
        self.ticks += 1;

        let gain = self.params.gain;
        let (peaks, rms) = match snapshot {
            Some(snapshot) => (
                spectrum::extract_peaks(
                    snapshot,
                    &self.config.front_end,
                    self.params.noise_floor_db,
                    20.0 * gain.log10(),
                ),
                spectrum::rms(&snapshot.waveform) * gain,
            ),
            None => (Vec::new(), 0.0),
        };
        let level_db = spectrum::level_db(rms);

        let reading = self.estimator.update(&peaks, snapshot, rms);
        let gate = self.gate.process(level_db, dt);
        self.observe_calibration(snapshot.map(|_| level_db));
        self.mapper.update(&peaks, gate.is_open(), dt);

        if self.ticks % TRACE_INTERVAL == 0 {
            trace!(
                "tick {}: level {:.1} dB, gate {:?}, f0 {:.1} Hz ({:.2}), {} peaks",
                self.ticks,
                level_db,
                gate.state,
                reading.frequency,
                reading.confidence,
                peaks.len()
            );
        }

        let zone_intensities = ZONES
            .iter()
            .zip(self.mapper.intensities())
            .map(|(zone, intensity)| ZoneLevel {
                name: zone.name.to_string(),
                intensity,
            })
            .collect();
        let dominant = self.mapper.dominant().map(|(index, intensity)| DominantZone {
            name: ZONES[index].name.to_string(),
            intensity,
        });

        TickOutput {
            zone_intensities,
            dominant,
            fundamental_hz: reading.frequency,
            confidence: reading.confidence,
            onset: reading.onset,
            note: tuning::read_note(reading.frequency),
            harmonics: reading.harmonics,
            gate_open: gate.is_open(),
            level_db,
            noise_floor_db: self.gate.noise_floor_estimate(),
            peaks,
            calibration: self.calibration_state,
        }
    }

    fn observe_calibration(&mut self, level_db: Option<f64>) {
        let Some(run) = self.calibration.as_mut() else {
            return;
        };
        match run.observe(level_db, self.now) {
            None => {
                self.calibration_state = CalibrationState::Sampling {
                    progress: run.progress(self.now),
                };
            }
            Some(outcome) => {
                if let CalibrationOutcome::Complete(report) = &outcome {
                    self.gate.set_threshold(report.gate_threshold_db);
                }
                self.calibration_state = CalibrationState::from(&outcome);
                self.calibration = None;
            }
        }
    }

    /// Starts sampling the ambient level.
    ///
    /// Any run still in progress resolves as cancelled first. `None` uses the
    /// configured window.
    pub fn start_calibration(&mut self, duration: Option<Duration>) -> CalibrationTicket {
        if let Some(mut previous) = self.calibration.take() {
            previous.cancel();
        }
        let (run, ticket) = CalibrationRun::start(
            &self.config.calibration,
            &self.config.gate,
            duration,
            self.now,
            self.params.gain,
        );
        self.calibration = Some(run);
        self.calibration_state = CalibrationState::Sampling { progress: 0.0 };
        ticket
    }

    /// Cancels the current run, if any.
    pub fn cancel_calibration(&mut self) {
        if let Some(mut run) = self.calibration.take() {
            run.cancel();
            self.calibration_state = CalibrationState::Cancelled;
        }
    }

    pub fn calibration_state(&self) -> CalibrationState {
        self.calibration_state
    }

    /// Clears every stage's state and cancels any calibration in progress.
    ///
    /// Parameters and the gate threshold are settings, not state, and survive.
    pub fn reset(&mut self) {
        if let Some(mut run) = self.calibration.take() {
            run.cancel();
        }
        self.calibration_state = CalibrationState::Idle;
        self.estimator.reset();
        self.gate.reset();
        self.mapper.reset();
        self.now = 0.0;
        self.ticks = 0;
        info!("Session reset");
    }
}
