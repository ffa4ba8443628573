//! # Pitch Detection Module
//!
//! Tracks the fundamental frequency of harmonically rich tones (singing bowls,
//! voice, monochord) from the per-tick peak list and waveform.
//!
//! ## Features
//! - Harmonic product spectrum over a peak-derived pseudo-spectrum
//! - Harmonic-peak scoring of sub-multiple candidates
//! - Normalised autocorrelation for low, bass-heavy material
//! - Cross-method agreement, onset snapping and anti-octave-jump tracking
//! - Twelve-entry harmonic presence profile of the tracked fundamental

use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::config::EstimatorConfig;
use crate::spectrum::{parabolic_offset, Peak, SpectralSnapshot};

/// Number of entries in the harmonic profile.
pub const PROFILE_HARMONICS: usize = 12;

/// RMS below this is treated as silence when looking for onsets.
const SILENCE_RMS: f64 = 1e-6;
/// RMS that counts as an onset when the previous tick was silent.
const ONSET_FROM_SILENCE_RMS: f64 = 1e-3;

/// A single frequency estimate with its confidence in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PitchEstimate {
    pub frequency: f64,
    pub confidence: f64,
}

/// Presence of one harmonic of the tracked fundamental in the current peaks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HarmonicProfileEntry {
    pub harmonic_number: u32,
    pub frequency: f64,
    pub present: bool,
    pub amplitude: f64,
}

/// What the estimator reports after each tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundamentalReading {
    /// Tracked fundamental in Hz, 0.0 when nothing is tracked.
    pub frequency: f64,
    pub confidence: f64,
    /// True when this tick's energy rise reset the tracker.
    pub onset: bool,
    pub harmonics: Vec<HarmonicProfileEntry>,
}

/// Harmonic product spectrum over a pseudo-spectrum built from `peaks`.
///
/// Each peak writes its amplitude into the nearest bin of a zero-filled array;
/// downsampled copies for harmonics `2..=hps_harmonics` are multiplied in, and
/// the arg-max above `min_frequency` is the candidate.
///
/// # Returns
/// * `None` when the product is zero everywhere (e.g. a lone sine)
pub fn harmonic_product_spectrum(
    peaks: &[Peak],
    bin_count: usize,
    bin_size: f64,
    config: &EstimatorConfig,
) -> Option<PitchEstimate> {
    if peaks.is_empty() || bin_count == 0 || !(bin_size > 0.0) {
        return None;
    }

    let mut spectrum = vec![0.0f64; bin_count];
    for peak in peaks {
        let bin = (peak.frequency / bin_size).round();
        if bin >= 0.0 && (bin as usize) < bin_count {
            let slot = &mut spectrum[bin as usize];
            *slot = slot.max(peak.amplitude);
        }
    }

    let harmonics = config.hps_harmonics.max(1);
    let len = bin_count / harmonics;
    let mut product = spectrum[..len].to_vec();
    for h in 2..=harmonics {
        for (i, value) in product.iter_mut().enumerate() {
            *value *= spectrum[i * h];
        }
    }

    let min_bin = (config.min_frequency / bin_size).ceil() as usize;
    let max_bin = ((config.max_frequency / bin_size).floor() as usize)
        .saturating_add(1)
        .min(len);
    if min_bin >= max_bin {
        return None;
    }

    let search = &product[min_bin..max_bin];
    let (offset, &peak_value) = search
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))?;
    if !(peak_value > 0.0) {
        return None;
    }

    let mean = search.iter().sum::<f64>() / search.len() as f64;
    let confidence = if mean > 0.0 {
        ((peak_value / mean - 1.0) / 5.0).clamp(0.0, 1.0)
    } else {
        0.0
    };

    Some(PitchEstimate {
        frequency: (min_bin + offset) as f64 * bin_size,
        confidence,
    })
}

/// Scores sub-multiples of the strongest peaks as fundamental candidates.
///
/// For a candidate `f0`, each peak near harmonic `k` adds `amplitude / sqrt(k)`.
/// Candidates explaining two or more peaks get a bonus per harmonic found, and
/// lower candidates get a mild bias.
pub fn score_harmonic_candidates(peaks: &[Peak], config: &EstimatorConfig) -> Option<PitchEstimate> {
    if peaks.is_empty() {
        return None;
    }

    let candidates = peaks
        .iter()
        .take(config.candidate_peaks)
        .flat_map(|peak| (1..=4).map(move |divisor| peak.frequency / divisor as f64))
        .filter(|f0| *f0 >= config.min_frequency && *f0 <= config.max_frequency);

    let mut best: Option<(f64, f64)> = None;
    for f0 in candidates {
        let mut score = 0.0;
        let mut found = 0u32;
        for peak in peaks {
            let ratio = peak.frequency / f0;
            let k = ratio.round();
            if k < 1.0 || k > config.max_harmonic as f64 {
                continue;
            }
            if (ratio - k).abs() / k < config.harmonic_tolerance {
                score += peak.amplitude / k.sqrt();
                found += 1;
            }
        }
        if found >= 2 {
            score *= 1.0 + 0.1 * found as f64;
        }
        score *= 1.0 + config.low_frequency_bias * (1.0 - (f0 / config.max_frequency).min(1.0));

        if best.is_none_or(|(_, best_score)| score > best_score) {
            best = Some((f0, score));
        }
    }

    let (frequency, score) = best?;
    if !(score > 0.0) {
        return None;
    }
    Some(PitchEstimate {
        frequency,
        confidence: (score / (peaks.len() as f64 * 0.5)).min(1.0),
    })
}

/// Normalised autocorrelation pitch estimate.
///
/// Correlates the last `autocorr_window` samples against themselves through an
/// FFT, normalises every lag by the energy of the overlapping segments and picks
/// the strongest lag in the configured range. Sub-multiples of that lag win when
/// they correlate almost as well, which keeps it from locking an octave low.
pub fn autocorrelation_pitch(
    waveform: &[f32],
    sample_rate: f64,
    config: &EstimatorConfig,
    planner: &mut FftPlanner<f64>,
) -> Option<PitchEstimate> {
    let start = waveform.len().saturating_sub(config.autocorr_window);
    let signal: Vec<f64> = waveform[start..]
        .iter()
        .map(|&s| if s.is_finite() { s as f64 } else { 0.0 })
        .collect();
    let n = signal.len();
    if n < 8 || !(sample_rate > 0.0) {
        return None;
    }

    let top_frequency = config.max_frequency.min(config.autocorr_max_frequency);
    let min_lag = ((sample_rate / top_frequency).floor() as usize).max(2);
    let max_lag = ((sample_rate / config.min_frequency).ceil() as usize).min(n / 2);
    if max_lag <= min_lag {
        return None;
    }

    let raw = raw_autocorrelation(&signal, planner);
    let mut energy = Vec::with_capacity(n + 1);
    let mut running = 0.0;
    energy.push(running);
    for s in &signal {
        running += s * s;
        energy.push(running);
    }
    let correlation = |lag: usize| {
        let head = energy[n - lag];
        let tail = energy[n] - energy[lag];
        let denominator = (head * tail).sqrt();
        if denominator > 1e-12 {
            raw[lag] / denominator
        } else {
            0.0
        }
    };

    let arg_max = |from: usize, to: usize| {
        (from..=to)
            .map(|lag| (lag, correlation(lag)))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
    };

    let (mut best_lag, best_value) = arg_max(min_lag, max_lag)?;
    if best_value < config.autocorr_min_correlation {
        return None;
    }

    for divisor in [4usize, 3, 2] {
        let centre = (best_lag as f64 / divisor as f64).round() as usize;
        if centre < min_lag + 1 {
            continue;
        }
        if let Some((lag, value)) = arg_max(centre - 1, centre + 1) {
            if value >= 0.9 * best_value {
                best_lag = lag;
                break;
            }
        }
    }

    let peak_value = correlation(best_lag);
    let offset = parabolic_offset(
        correlation(best_lag - 1),
        peak_value,
        correlation(best_lag + 1),
    );
    let frequency = sample_rate / (best_lag as f64 + offset);
    if !frequency.is_finite() || frequency < config.min_frequency || frequency > config.max_frequency {
        return None;
    }

    Some(PitchEstimate {
        frequency,
        confidence: peak_value.clamp(0.0, 1.0),
    })
}

/// Linear autocorrelation of `signal` for every lag, via zero-padded FFT.
fn raw_autocorrelation(signal: &[f64], planner: &mut FftPlanner<f64>) -> Vec<f64> {
    let size = (signal.len() * 2).next_power_of_two();
    let forward: Arc<dyn Fft<f64>> = planner.plan_fft_forward(size);
    let inverse: Arc<dyn Fft<f64>> = planner.plan_fft_inverse(size);

    let mut buffer: Vec<Complex<f64>> = signal
        .iter()
        .map(|&s| Complex::new(s, 0.0))
        .chain(std::iter::repeat(Complex::new(0.0, 0.0)))
        .take(size)
        .collect();
    forward.process(&mut buffer);
    for bin in buffer.iter_mut() {
        *bin = Complex::new(bin.norm_sqr(), 0.0);
    }
    inverse.process(&mut buffer);

    let scale = 1.0 / size as f64;
    buffer.iter().take(signal.len()).map(|c| c.re * scale).collect()
}

/// Merges the per-method estimates into one.
///
/// When the two most confident estimates are (near) integer multiples of each
/// other, the lower one wins with a corroboration boost.
pub fn combine_estimates(mut estimates: Vec<PitchEstimate>, config: &EstimatorConfig) -> Option<PitchEstimate> {
    estimates.retain(|e| {
        e.frequency.is_finite() && e.frequency > 0.0 && e.confidence > config.min_candidate_confidence
    });
    estimates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let top = *estimates.first()?;
    if let Some(second) = estimates.get(1) {
        let (low, high) = if top.frequency <= second.frequency {
            (top.frequency, second.frequency)
        } else {
            (second.frequency, top.frequency)
        };
        if near_integer_ratio(high / low, config.agreement_tolerance).is_some() {
            return Some(PitchEstimate {
                frequency: low,
                confidence: (top.confidence * config.corroboration_boost).min(1.0),
            });
        }
    }
    Some(top)
}

/// The integer `k >= 1` that `ratio` is within `tolerance` (relative) of.
fn near_integer_ratio(ratio: f64, tolerance: f64) -> Option<u32> {
    if !ratio.is_finite() {
        return None;
    }
    let k = ratio.round();
    if k >= 1.0 && (ratio - k).abs() / k < tolerance {
        Some(k as u32)
    } else {
        None
    }
}

/// Marks which of the first twelve harmonics of `fundamental` have a peak.
pub fn harmonic_profile(fundamental: f64, peaks: &[Peak], tolerance: f64) -> Vec<HarmonicProfileEntry> {
    (1..=PROFILE_HARMONICS as u32)
        .map(|harmonic_number| {
            if !(fundamental > 0.0) {
                return HarmonicProfileEntry {
                    harmonic_number,
                    frequency: 0.0,
                    present: false,
                    amplitude: 0.0,
                };
            }
            let frequency = fundamental * harmonic_number as f64;
            let amplitude = peaks
                .iter()
                .filter(|p| (p.frequency - frequency).abs() / frequency < tolerance)
                .map(|p| p.amplitude)
                .fold(None, |acc: Option<f64>, a| Some(acc.map_or(a, |m| m.max(a))));
            HarmonicProfileEntry {
                harmonic_number,
                frequency,
                present: amplitude.is_some(),
                amplitude: amplitude.unwrap_or(0.0),
            }
        })
        .collect()
}

/// Stateful fundamental tracker combining all three methods.
pub struct FundamentalEstimator {
    config: EstimatorConfig,
    planner: FftPlanner<f64>,
    tracked_frequency: f64,
    confidence: f64,
    previous_rms: f64,
}

impl FundamentalEstimator {
    pub fn new(config: EstimatorConfig) -> Self {
        debug!(
            "FundamentalEstimator created: range={}..{} Hz",
            config.min_frequency, config.max_frequency
        );
        Self {
            config,
            planner: FftPlanner::new(),
            tracked_frequency: 0.0,
            confidence: 0.0,
            previous_rms: 0.0,
        }
    }

    pub fn tracked_frequency(&self) -> f64 {
        self.tracked_frequency
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    /// Runs every estimator on this tick's peaks and folds the result into the track.
    ///
    /// # Arguments
    /// * `peaks` - This tick's peaks, strongest first
    /// * `snapshot` - The snapshot the peaks came from, `None` when no audio arrived
    /// * `rms` - RMS of the snapshot's waveform, used for onset detection
    pub fn update(&mut self, peaks: &[Peak], snapshot: Option<&SpectralSnapshot>, rms: f64) -> FundamentalReading {
        let onset = self.detect_onset(rms);
        if onset {
            trace!("Onset detected (rms={:.5}), tracker reset", rms);
            self.tracked_frequency = 0.0;
            self.confidence = 0.0;
        }

        let estimate = snapshot.and_then(|snapshot| self.estimate(peaks, snapshot));
        match estimate {
            Some(estimate) if !self.is_harmonic_jump(&estimate) => self.accept(estimate),
            _ => self.decay(),
        }

        FundamentalReading {
            frequency: self.tracked_frequency,
            confidence: self.confidence,
            onset,
            harmonics: harmonic_profile(self.tracked_frequency, peaks, self.config.profile_tolerance),
        }
    }

    /// One combined estimate for this tick, if any method is confident enough.
    fn estimate(&mut self, peaks: &[Peak], snapshot: &SpectralSnapshot) -> Option<PitchEstimate> {
        if peaks.is_empty() {
            return None;
        }

        let bin_size = snapshot.bin_size();
        let mut estimates = Vec::with_capacity(3);
        estimates.extend(harmonic_product_spectrum(
            peaks,
            snapshot.magnitudes_db.len(),
            bin_size,
            &self.config,
        ));
        estimates.extend(score_harmonic_candidates(peaks, &self.config));

        let lowest = peaks
            .iter()
            .map(|p| p.frequency)
            .fold(f64::INFINITY, f64::min);
        if lowest < self.config.autocorr_trigger_hz {
            estimates.extend(autocorrelation_pitch(
                &snapshot.waveform,
                snapshot.sample_rate,
                &self.config,
                &mut self.planner,
            ));
        }

        trace!("Pitch candidates: {:?}", estimates);
        combine_estimates(estimates, &self.config)
    }

    fn detect_onset(&mut self, rms: f64) -> bool {
        let rms = if rms.is_finite() { rms.max(0.0) } else { 0.0 };
        let onset = if self.previous_rms > SILENCE_RMS {
            rms / self.previous_rms > self.config.onset_ratio
        } else {
            rms > ONSET_FROM_SILENCE_RMS
        };
        self.previous_rms = rms;
        onset
    }

    /// An estimate sitting on a harmonic of the track needs clearly more confidence.
    fn is_harmonic_jump(&self, estimate: &PitchEstimate) -> bool {
        if self.tracked_frequency <= 0.0 {
            return false;
        }
        let ratio = estimate.frequency / self.tracked_frequency;
        match near_integer_ratio(ratio, self.config.octave_tolerance) {
            Some(k) if k >= 2 => {
                let rejected = estimate.confidence
                    < self.config.octave_confidence_factor * self.confidence;
                if rejected {
                    trace!(
                        "Rejected harmonic jump {:.1} Hz -> {:.1} Hz",
                        self.tracked_frequency,
                        estimate.frequency
                    );
                }
                rejected
            }
            _ => false,
        }
    }

    fn accept(&mut self, estimate: PitchEstimate) {
        if self.tracked_frequency <= 0.0 {
            self.tracked_frequency = estimate.frequency;
            self.confidence = estimate.confidence;
            return;
        }
        let alpha = 0.3 + 0.4 * estimate.confidence;
        self.tracked_frequency = self.tracked_frequency * (1.0 - alpha) + estimate.frequency * alpha;
        self.confidence = 0.7 * self.confidence + 0.3 * estimate.confidence;
    }

    fn decay(&mut self) {
        self.confidence *= self.config.confidence_decay;
        if self.confidence < self.config.min_tracked_confidence {
            self.tracked_frequency = 0.0;
            self.confidence = 0.0;
        }
    }

    /// Clears the track; the next estimate snaps in directly.
    pub fn reset(&mut self) {
        self.tracked_frequency = 0.0;
        self.confidence = 0.0;
        self.previous_rms = 0.0;
        debug!("FundamentalEstimator reset");
    }
}
