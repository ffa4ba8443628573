//! # Spectral Front End
//!
//! Extracts sorted, sub-bin accurate peaks and an RMS activity level from a
//! per-tick spectral snapshot. Every function here is total: silence, NaN bins
//! and empty buffers simply produce no peaks and zero RMS.

use serde::{Deserialize, Serialize};

use crate::config::FrontEndConfig;

/// One tick's worth of analyser output.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectralSnapshot {
    /// Log magnitude (dB) per frequency bin, `fft_size / 2` entries.
    pub magnitudes_db: Vec<f32>,
    /// The raw time-domain samples the magnitudes were computed from.
    pub waveform: Vec<f32>,
    pub sample_rate: f64,
    pub fft_size: usize,
    /// dB floor/ceiling of the analyser that produced the snapshot.
    pub min_db: f64,
    pub max_db: f64,
}

impl SpectralSnapshot {
    /// Width of one frequency bin in Hz.
    pub fn bin_size(&self) -> f64 {
        if self.fft_size == 0 {
            0.0
        } else {
            self.sample_rate / self.fft_size as f64
        }
    }
}

/// A local maximum of the spectrum.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Peak {
    /// Interpolated frequency in Hz.
    pub frequency: f64,
    /// Magnitude renormalised from `[noise_floor, max_db]` to `[0, 1]`.
    pub amplitude: f64,
    /// Magnitude in dB as read from the snapshot (after gain).
    pub raw_level: f64,
    pub bin_index: usize,
}

/// Sub-bin offset of a parabola through three neighbouring magnitudes.
///
/// Returns 0.0 for flat or degenerate neighbourhoods.
pub fn parabolic_offset(alpha: f64, beta: f64, gamma: f64) -> f64 {
    let denominator = alpha - 2.0 * beta + gamma;
    if !denominator.is_finite() || denominator.abs() < 1e-12 {
        return 0.0;
    }
    let offset = 0.5 * (alpha - gamma) / denominator;
    if offset.is_finite() && offset.abs() <= 1.0 {
        offset
    } else {
        0.0
    }
}

/// Finds spectral peaks inside the configured band.
///
/// A bin is a peak when it exceeds `noise_floor_db` and both of its two left and
/// two right neighbours. `gain_db` is added to every bin before testing.
/// The result is sorted strongest first and capped at `config.max_peaks`.
pub fn extract_peaks(
    snapshot: &SpectralSnapshot,
    config: &FrontEndConfig,
    noise_floor_db: f64,
    gain_db: f64,
) -> Vec<Peak> {
    let bins = &snapshot.magnitudes_db;
    let bin_size = snapshot.bin_size();
    if bins.len() < 5 || bin_size <= 0.0 || !bin_size.is_finite() {
        return Vec::new();
    }

    let level = |i: usize| bins[i] as f64 + gain_db;
    let first = ((config.min_frequency / bin_size).floor().max(0.0) as usize).max(2);
    let last = ((config.max_frequency / bin_size).ceil().max(0.0) as usize).min(bins.len() - 3);
    let span = snapshot.max_db - noise_floor_db;

    let mut peaks = Vec::new();
    for i in first..=last {
        let magnitude = level(i);
        // NaN compares false everywhere, so a NaN bin can never qualify
        if !(magnitude > noise_floor_db) {
            continue;
        }
        let is_peak = magnitude > level(i - 1)
            && magnitude > level(i - 2)
            && magnitude > level(i + 1)
            && magnitude > level(i + 2);
        if !is_peak {
            continue;
        }

        let offset = parabolic_offset(level(i - 1), magnitude, level(i + 1));
        let amplitude = if span > 0.0 {
            ((magnitude - noise_floor_db) / span).clamp(0.0, 1.0)
        } else {
            1.0
        };

        peaks.push(Peak {
            frequency: (i as f64 + offset) * bin_size,
            amplitude,
            raw_level: magnitude,
            bin_index: i,
        });
    }

    peaks.sort_by(|a, b| {
        b.amplitude
            .partial_cmp(&a.amplitude)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    peaks.truncate(config.max_peaks);
    peaks
}

/// Root-mean-square of a waveform, ignoring non-finite samples.
pub fn rms(waveform: &[f32]) -> f64 {
    if waveform.is_empty() {
        return 0.0;
    }
    let sum: f64 = waveform
        .iter()
        .map(|&s| if s.is_finite() { s as f64 * s as f64 } else { 0.0 })
        .sum();
    (sum / waveform.len() as f64).sqrt()
}

/// Converts an RMS value to dBFS, floored so silence stays finite.
pub fn level_db(rms: f64) -> f64 {
    const FLOOR_DB: f64 = -120.0;
    if rms > 0.0 && rms.is_finite() {
        (20.0 * rms.log10()).max(FLOOR_DB)
    } else {
        FLOOR_DB
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn snapshot_from(magnitudes_db: Vec<f32>) -> SpectralSnapshot {
        SpectralSnapshot {
            magnitudes_db,
            waveform: Vec::new(),
            sample_rate: 1000.0,
            fft_size: 200,
            min_db: -100.0,
            max_db: -30.0,
        }
    }

    fn band() -> FrontEndConfig {
        FrontEndConfig {
            min_frequency: 0.0,
            max_frequency: 500.0,
            max_peaks: 24,
        }
    }

    #[test]
    fn test_single_peak_is_interpolated() {
        // bin size is 5 Hz; a symmetric peak at bin 20 lands exactly on 100 Hz
        let mut bins = vec![-100.0f32; 100];
        bins[19] = -50.0;
        bins[20] = -40.0;
        bins[21] = -50.0;
        let peaks = extract_peaks(&snapshot_from(bins), &band(), -70.0, 0.0);
        assert_eq!(peaks.len(), 1);
        assert!((peaks[0].frequency - 100.0).abs() < 1e-9);
        assert_eq!(peaks[0].bin_index, 20);
        assert!((peaks[0].amplitude - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_asymmetric_peak_shifts_toward_louder_side() {
        let mut bins = vec![-100.0f32; 100];
        bins[19] = -50.0;
        bins[20] = -40.0;
        bins[21] = -45.0;
        let peaks = extract_peaks(&snapshot_from(bins), &band(), -70.0, 0.0);
        assert_eq!(peaks.len(), 1);
        assert!(peaks[0].frequency > 100.0 && peaks[0].frequency < 102.5);
    }

    #[test]
    fn test_peaks_below_noise_floor_are_ignored() {
        let mut bins = vec![-100.0f32; 100];
        bins[20] = -75.0;
        assert!(extract_peaks(&snapshot_from(bins), &band(), -70.0, 0.0).is_empty());
    }

    #[test]
    fn test_gain_lifts_quiet_peak_over_floor() {
        let mut bins = vec![-100.0f32; 100];
        bins[20] = -75.0;
        let peaks = extract_peaks(&snapshot_from(bins), &band(), -70.0, 10.0);
        assert_eq!(peaks.len(), 1);
        assert!((peaks[0].raw_level + 65.0).abs() < 1e-9);
    }

    #[test]
    fn test_flat_plateau_is_not_a_peak() {
        let mut bins = vec![-100.0f32; 100];
        bins[20] = -40.0;
        bins[21] = -40.0;
        assert!(extract_peaks(&snapshot_from(bins), &band(), -70.0, 0.0).is_empty());
    }

    #[test]
    fn test_parabolic_offset_degenerate() {
        assert_eq!(parabolic_offset(1.0, 1.0, 1.0), 0.0);
        assert_eq!(parabolic_offset(f64::NEG_INFINITY, -40.0, -50.0), 0.0);
    }

    #[test]
    fn test_rms_of_sine() {
        let samples: Vec<f32> = (0..1000).map(|i| (i as f32 * 0.1).sin() * 0.5).collect();
        let value = rms(&samples);
        assert!(value > 0.3 && value < 0.4, "RMS was {}", value);
        assert_eq!(rms(&[]), 0.0);
    }

    #[test]
    fn test_level_db_floor() {
        assert_eq!(level_db(0.0), -120.0);
        assert!((level_db(1.0)).abs() < 1e-12);
        assert!((level_db(0.1) + 20.0).abs() < 1e-9);
    }

    proptest! {
        #[test]
        fn prop_peaks_sorted_and_capped(bins in proptest::collection::vec(-120.0f32..0.0, 0..300)) {
            let config = FrontEndConfig { min_frequency: 0.0, max_frequency: 2000.0, max_peaks: 8 };
            let peaks = extract_peaks(&snapshot_from(bins), &config, -70.0, 0.0);
            prop_assert!(peaks.len() <= 8);
            for pair in peaks.windows(2) {
                prop_assert!(pair[0].amplitude >= pair[1].amplitude);
            }
            for peak in &peaks {
                prop_assert!((0.0..=1.0).contains(&peak.amplitude));
                prop_assert!(peak.frequency.is_finite());
            }
        }
    }
}
