//! # Configuration Module
//!
//! Immutable configuration for every stage of the analysis pipeline, plus the
//! small set of parameters a user may tune while a session is running.
//!
//! Each component receives its own config struct at construction time. Nothing
//! here is global: a `Session` owns a `SessionConfig` and hands the pieces out.

use serde::{Deserialize, Serialize};

/// Configuration of the spectrum analyser that turns raw audio into snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyserConfig {
    /// Sample rate of the incoming audio in Hz.
    pub sample_rate: u32,
    /// FFT size (power of two). Bin spacing is `sample_rate / fft_size`.
    pub fft_size: usize,
    /// Per-bin time smoothing between snapshots (0.0 = none, <1.0).
    pub smoothing: f32,
    /// Lower edge of the reported dB range.
    pub min_db: f32,
    /// Upper edge of the reported dB range. Peak amplitudes saturate here.
    pub max_db: f32,
}

impl Default for AnalyserConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            fft_size: 8192,
            smoothing: 0.8,
            min_db: -100.0,
            max_db: -30.0,
        }
    }
}

/// Peak picking band and cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrontEndConfig {
    pub min_frequency: f64,
    pub max_frequency: f64,
    /// Maximum number of peaks kept per tick, strongest first.
    pub max_peaks: usize,
}

impl Default for FrontEndConfig {
    fn default() -> Self {
        Self {
            min_frequency: 30.0,
            max_frequency: 2000.0,
            max_peaks: 24,
        }
    }
}

/// Tuning constants of the fundamental estimator.
///
/// The cross-method constants (`agreement_tolerance`, `corroboration_boost`,
/// `octave_confidence_factor`) were tuned by ear against singing bowls, voice
/// and monochord recordings. Change them only with new recordings to check
/// against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimatorConfig {
    pub min_frequency: f64,
    pub max_frequency: f64,
    /// Number of downsampled copies multiplied by the harmonic product spectrum.
    pub hps_harmonics: usize,
    /// How many of the strongest peaks seed harmonic-scoring candidates.
    pub candidate_peaks: usize,
    /// Relative tolerance for a peak to count as harmonic `k` of a candidate.
    pub harmonic_tolerance: f64,
    /// Highest harmonic number considered while scoring.
    pub max_harmonic: u32,
    /// Preference for lower candidates while scoring (0.0 = none).
    pub low_frequency_bias: f64,
    /// Autocorrelation only runs when the lowest peak is below this frequency.
    pub autocorr_trigger_hz: f64,
    /// Upper frequency searched by autocorrelation.
    pub autocorr_max_frequency: f64,
    /// Number of most recent waveform samples correlated.
    pub autocorr_window: usize,
    /// Minimum normalised correlation for an autocorrelation estimate.
    pub autocorr_min_correlation: f64,
    /// RMS rise (current / previous) treated as a new note.
    pub onset_ratio: f64,
    /// Estimates at or below this confidence are discarded before combining.
    pub min_candidate_confidence: f64,
    /// Two estimates agree when their ratio is this close to an integer.
    pub agreement_tolerance: f64,
    /// Confidence multiplier applied when two methods agree.
    pub corroboration_boost: f64,
    /// Ratio tolerance for rejecting harmonic jumps of the tracked pitch.
    pub octave_tolerance: f64,
    /// A harmonic jump is accepted only above this multiple of tracked confidence.
    pub octave_confidence_factor: f64,
    /// Per-tick confidence decay while no estimate is accepted.
    pub confidence_decay: f64,
    /// Below this tracked confidence the fundamental is dropped.
    pub min_tracked_confidence: f64,
    /// Relative tolerance when marking harmonics present in the profile.
    pub profile_tolerance: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            min_frequency: 30.0,
            max_frequency: 2000.0,
            hps_harmonics: 5,
            candidate_peaks: 6,
            harmonic_tolerance: 0.03,
            max_harmonic: 12,
            low_frequency_bias: 0.1,
            autocorr_trigger_hz: 200.0,
            autocorr_max_frequency: 500.0,
            autocorr_window: 4096,
            autocorr_min_correlation: 0.3,
            onset_ratio: 3.0,
            min_candidate_confidence: 0.1,
            agreement_tolerance: 0.08,
            corroboration_boost: 1.2,
            octave_tolerance: 0.05,
            octave_confidence_factor: 1.5,
            confidence_decay: 0.9,
            min_tracked_confidence: 0.1,
            profile_tolerance: 0.04,
        }
    }
}

/// Noise gate thresholds, timers and noise-floor tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    /// Level (dBFS) the smoothed input must exceed to open the gate.
    pub open_threshold_db: f64,
    /// The gate closes below `open_threshold_db - hysteresis_db`.
    pub hysteresis_db: f64,
    pub attack_ms: f64,
    pub hold_ms: f64,
    pub release_ms: f64,
    /// Time constant of the input level smoother.
    pub level_smoothing_ms: f64,
    /// How far below the close threshold the output is held while closed.
    pub closed_attenuation_db: f64,
    /// Safe range for thresholds derived from calibration.
    pub safe_min_db: f64,
    pub safe_max_db: f64,
    /// Samples quieter than `threshold - noise_margin_db` feed the noise floor.
    pub noise_margin_db: f64,
    /// Blend rate of the ring-buffer median into the noise-floor estimate.
    pub noise_floor_blend: f64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            open_threshold_db: -50.0,
            hysteresis_db: 6.0,
            attack_ms: 30.0,
            hold_ms: 200.0,
            release_ms: 150.0,
            level_smoothing_ms: 20.0,
            closed_attenuation_db: 40.0,
            safe_min_db: -80.0,
            safe_max_db: -20.0,
            noise_margin_db: 10.0,
            noise_floor_blend: 0.05,
        }
    }
}

/// Zone envelopes and dominant-zone hysteresis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneMapConfig {
    /// Rising time constant of a zone's intensity.
    pub attack_ms: f64,
    /// Falling time constant of a zone's intensity.
    pub decay_ms: f64,
    pub min_opacity: f64,
    pub max_opacity: f64,
    /// Fraction of a zone's width near each edge where peaks are shared.
    pub blend_fraction: f64,
    /// Maximum intensity reduction at a zone edge.
    pub edge_falloff: f64,
    /// Minimum peak amplitude that bleeds into harmonic zones.
    pub bleed_min_amplitude: f64,
    /// Bleed contributions at or below this value are dropped.
    pub bleed_min_contribution: f64,
    /// A zone must exceed this intensity to become dominant.
    pub dominant_threshold: f64,
    /// Relative margin a challenger needs over the dominant zone.
    pub switch_margin: f64,
    /// Minimum time between dominant-zone switches.
    pub switch_hold_ms: f64,
}

impl Default for ZoneMapConfig {
    fn default() -> Self {
        Self {
            attack_ms: 60.0,
            decay_ms: 300.0,
            min_opacity: 0.0,
            max_opacity: 1.0,
            blend_fraction: 0.18,
            edge_falloff: 0.3,
            bleed_min_amplitude: 0.3,
            bleed_min_contribution: 0.1,
            dominant_threshold: 0.15,
            switch_margin: 0.18,
            switch_hold_ms: 450.0,
        }
    }
}

/// Ambient-level calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Sampling window used when the caller does not pass one.
    pub default_duration_ms: f64,
    /// Extra time past the window after which a starved run times out.
    pub timeout_grace_ms: f64,
    /// Fewer samples than this is reported as a failed run.
    pub min_samples: usize,
    /// Clamp range of the recommended noise floor.
    pub noise_floor_min_db: f64,
    pub noise_floor_max_db: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            default_duration_ms: 2500.0,
            timeout_grace_ms: 1000.0,
            min_samples: 10,
            noise_floor_min_db: -90.0,
            noise_floor_max_db: -20.0,
        }
    }
}

/// Everything a `Session` needs at construction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub analyser: AnalyserConfig,
    pub front_end: FrontEndConfig,
    pub estimator: EstimatorConfig,
    pub gate: GateConfig,
    pub zones: ZoneMapConfig,
    pub calibration: CalibrationConfig,
    pub params: RuntimeParams,
}

/// Parameters that may change while a session runs.
///
/// Values are always range-clamped before use, see [`RuntimeParams::clamped`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeParams {
    /// Linear input gain applied to level and spectrum.
    pub gain: f64,
    /// Spectral magnitude (dB) a bin must exceed to be a peak.
    pub noise_floor_db: f64,
    pub gate_attack_ms: f64,
    pub gate_hold_ms: f64,
    pub gate_release_ms: f64,
    pub hysteresis_db: f64,
    pub zone_attack_ms: f64,
    pub zone_decay_ms: f64,
    pub switch_margin: f64,
    pub switch_hold_ms: f64,
}

pub const GAIN_RANGE: (f64, f64) = (0.1, 10.0);
pub const NOISE_FLOOR_RANGE: (f64, f64) = (-100.0, -30.0);
pub const GATE_ATTACK_RANGE: (f64, f64) = (0.0, 500.0);
pub const GATE_HOLD_RANGE: (f64, f64) = (0.0, 2000.0);
pub const GATE_RELEASE_RANGE: (f64, f64) = (0.0, 3000.0);
pub const HYSTERESIS_RANGE: (f64, f64) = (1.0, 20.0);
pub const ZONE_ATTACK_RANGE: (f64, f64) = (10.0, 2000.0);
pub const ZONE_DECAY_RANGE: (f64, f64) = (10.0, 5000.0);
pub const SWITCH_MARGIN_RANGE: (f64, f64) = (0.0, 1.0);
pub const SWITCH_HOLD_RANGE: (f64, f64) = (0.0, 5000.0);

impl Default for RuntimeParams {
    fn default() -> Self {
        let gate = GateConfig::default();
        let zones = ZoneMapConfig::default();
        Self {
            gain: 1.0,
            noise_floor_db: -70.0,
            gate_attack_ms: gate.attack_ms,
            gate_hold_ms: gate.hold_ms,
            gate_release_ms: gate.release_ms,
            hysteresis_db: gate.hysteresis_db,
            zone_attack_ms: zones.attack_ms,
            zone_decay_ms: zones.decay_ms,
            switch_margin: zones.switch_margin,
            switch_hold_ms: zones.switch_hold_ms,
        }
    }
}

/// Clamps `value` into `range`, mapping NaN to the lower bound.
fn clamp_to(value: f64, range: (f64, f64)) -> f64 {
    if value.is_nan() {
        range.0
    } else {
        value.clamp(range.0, range.1)
    }
}

impl RuntimeParams {
    /// Returns a copy with every field forced into its allowed range.
    pub fn clamped(&self) -> Self {
        Self {
            gain: clamp_to(self.gain, GAIN_RANGE),
            noise_floor_db: clamp_to(self.noise_floor_db, NOISE_FLOOR_RANGE),
            gate_attack_ms: clamp_to(self.gate_attack_ms, GATE_ATTACK_RANGE),
            gate_hold_ms: clamp_to(self.gate_hold_ms, GATE_HOLD_RANGE),
            gate_release_ms: clamp_to(self.gate_release_ms, GATE_RELEASE_RANGE),
            hysteresis_db: clamp_to(self.hysteresis_db, HYSTERESIS_RANGE),
            zone_attack_ms: clamp_to(self.zone_attack_ms, ZONE_ATTACK_RANGE),
            zone_decay_ms: clamp_to(self.zone_decay_ms, ZONE_DECAY_RANGE),
            switch_margin: clamp_to(self.switch_margin, SWITCH_MARGIN_RANGE),
            switch_hold_ms: clamp_to(self.switch_hold_ms, SWITCH_HOLD_RANGE),
        }
    }

    /// Clamps a gain suggestion (e.g. from calibration) into the gain range.
    pub fn clamp_gain(gain: f64) -> f64 {
        clamp_to(gain, GAIN_RANGE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_within_ranges() {
        let params = RuntimeParams::default();
        assert_eq!(params.clamped(), params);
    }

    #[test]
    fn test_clamped_limits_every_field() {
        let wild = RuntimeParams {
            gain: 100.0,
            noise_floor_db: -500.0,
            gate_attack_ms: -3.0,
            gate_hold_ms: 1e9,
            gate_release_ms: f64::NAN,
            hysteresis_db: 0.0,
            zone_attack_ms: 1.0,
            zone_decay_ms: 1e6,
            switch_margin: 3.0,
            switch_hold_ms: -1.0,
        };
        let clamped = wild.clamped();
        assert_eq!(clamped.gain, GAIN_RANGE.1);
        assert_eq!(clamped.noise_floor_db, NOISE_FLOOR_RANGE.0);
        assert_eq!(clamped.gate_attack_ms, 0.0);
        assert_eq!(clamped.gate_hold_ms, GATE_HOLD_RANGE.1);
        assert_eq!(clamped.gate_release_ms, GATE_RELEASE_RANGE.0);
        assert_eq!(clamped.hysteresis_db, HYSTERESIS_RANGE.0);
        assert_eq!(clamped.zone_attack_ms, ZONE_ATTACK_RANGE.0);
        assert_eq!(clamped.zone_decay_ms, ZONE_DECAY_RANGE.1);
        assert_eq!(clamped.switch_margin, 1.0);
        assert_eq!(clamped.switch_hold_ms, 0.0);
    }

    #[test]
    fn test_session_config_roundtrips_through_json() {
        let config = SessionConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: SessionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
