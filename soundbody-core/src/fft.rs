//! # Spectrum Analyser Module
//!
//! Turns a stream of raw samples into the per-tick spectral snapshot consumed by
//! the rest of the pipeline: one dB magnitude per bin plus the matching waveform.
//!
//! ## Features
//! - Rolling input window of `fft_size` samples
//! - DC offset removal and Hann windowing before the transform
//! - Per-bin exponential time smoothing between snapshots
//! - dB conversion with the configured floor/ceiling recorded in the snapshot

use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use tracing::debug;

use crate::config::AnalyserConfig;
use crate::spectrum::SpectralSnapshot;

/// Removes the DC offset from a signal by making its average value zero.
///
/// A constant offset would otherwise pile energy into the lowest bins, right
/// where the lowest zone lives.
fn remove_dc_offset(signal: &mut [f32]) {
    let len = signal.len();
    if len == 0 {
        return;
    }
    let avg = signal.iter().sum::<f32>() / len as f32;
    if avg.abs() > 1e-6 {
        for sample in signal.iter_mut() {
            *sample -= avg;
        }
    }
}

/// Hann window coefficients for a frame of `n` samples.
fn hann_window(n: usize) -> Vec<f32> {
    if n < 2 {
        return vec![1.0; n];
    }
    let n_minus_1 = (n - 1) as f32;
    (0..n)
        .map(|i| 0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / n_minus_1).cos()))
        .collect()
}

/// Streaming spectrum analyser.
///
/// Samples are pushed as they arrive; `snapshot()` transforms the most recent
/// `fft_size` samples. Calling `snapshot()` once per tick gives the smoothing
/// its intended per-tick meaning.
pub struct SpectrumAnalyser {
    config: AnalyserConfig,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    /// Ring buffer of the last `fft_size` samples.
    input: Vec<f32>,
    write_pos: usize,
    fft_buffer: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    smoothed: Vec<f32>,
}

impl SpectrumAnalyser {
    pub fn new(config: AnalyserConfig) -> Self {
        let fft_size = config.fft_size.max(2);
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(fft_size);
        let scratch_len = fft.get_inplace_scratch_len();

        debug!(
            "SpectrumAnalyser created: sample_rate={}, fft_size={}, smoothing={}",
            config.sample_rate, fft_size, config.smoothing
        );

        Self {
            window: hann_window(fft_size),
            input: vec![0.0; fft_size],
            write_pos: 0,
            fft_buffer: vec![Complex::new(0.0, 0.0); fft_size],
            scratch: vec![Complex::new(0.0, 0.0); scratch_len],
            smoothed: vec![0.0; fft_size / 2],
            config: AnalyserConfig { fft_size, ..config },
            fft,
        }
    }

    pub fn config(&self) -> &AnalyserConfig {
        &self.config
    }

    /// Appends samples to the rolling window. Non-finite samples become silence.
    pub fn push_samples(&mut self, samples: &[f32]) {
        let len = self.input.len();
        for &sample in samples {
            self.input[self.write_pos] = if sample.is_finite() { sample } else { 0.0 };
            self.write_pos = (self.write_pos + 1) % len;
        }
    }

    /// The rolling window in chronological order.
    fn ordered_window(&self) -> Vec<f32> {
        let len = self.input.len();
        (0..len)
            .map(|i| self.input[(self.write_pos + i) % len])
            .collect()
    }

    /// Transforms the current window into a smoothed dB snapshot.
    pub fn snapshot(&mut self) -> SpectralSnapshot {
        let waveform = self.ordered_window();
        let fft_size = waveform.len();

        let mut processed = waveform.clone();
        remove_dc_offset(&mut processed);
        for ((slot, sample), coeff) in self
            .fft_buffer
            .iter_mut()
            .zip(processed.iter())
            .zip(self.window.iter())
        {
            *slot = Complex::new(sample * coeff, 0.0);
        }

        self.fft
            .process_with_scratch(&mut self.fft_buffer, &mut self.scratch);

        let smoothing = self.config.smoothing.clamp(0.0, 0.999);
        let norm = 1.0 / fft_size as f32;
        let magnitudes_db = self
            .smoothed
            .iter_mut()
            .zip(self.fft_buffer.iter())
            .map(|(smoothed, bin)| {
                let magnitude = bin.norm() * norm;
                *smoothed = smoothing * *smoothed + (1.0 - smoothing) * magnitude;
                if *smoothed > 0.0 {
                    20.0 * smoothed.log10()
                } else {
                    f32::NEG_INFINITY
                }
            })
            .collect();

        SpectralSnapshot {
            magnitudes_db,
            waveform,
            sample_rate: self.config.sample_rate as f64,
            fft_size,
            min_db: self.config.min_db as f64,
            max_db: self.config.max_db as f64,
        }
    }

    /// Forgets all buffered audio and smoothing history.
    pub fn reset(&mut self) {
        self.input.fill(0.0);
        self.write_pos = 0;
        self.smoothed.fill(0.0);
        debug!("SpectrumAnalyser reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, sample_rate: f32, len: usize, amplitude: f32) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate).sin() * amplitude)
            .collect()
    }

    #[test]
    fn test_remove_dc_offset() {
        let mut signal = vec![1.5, 2.5, 1.5, 2.5];
        remove_dc_offset(&mut signal);
        let avg: f32 = signal.iter().sum::<f32>() / signal.len() as f32;
        assert!(avg.abs() < 1e-6);
    }

    #[test]
    fn test_hann_window_edges() {
        let window = hann_window(8);
        assert!(window[0].abs() < 1e-6);
        assert!(window[7].abs() < 1e-6);
        assert!(window.iter().all(|w| (0.0..=1.0).contains(w)));
    }

    #[test]
    fn test_snapshot_peaks_at_tone_bin() {
        let config = AnalyserConfig {
            fft_size: 4096,
            smoothing: 0.0,
            ..Default::default()
        };
        let mut analyser = SpectrumAnalyser::new(config);
        analyser.push_samples(&sine(440.0, 44100.0, 4096, 0.5));
        let snapshot = analyser.snapshot();

        assert_eq!(snapshot.magnitudes_db.len(), 2048);
        let (peak_bin, _) = snapshot
            .magnitudes_db
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap();
        let bin_size = 44100.0 / 4096.0;
        assert!((peak_bin as f64 * bin_size - 440.0).abs() < bin_size * 1.5);
    }

    #[test]
    fn test_silence_and_bad_input_stay_finite_or_neg_inf() {
        let mut analyser = SpectrumAnalyser::new(AnalyserConfig {
            fft_size: 1024,
            ..Default::default()
        });
        analyser.push_samples(&[f32::NAN, f32::INFINITY, 0.0]);
        let snapshot = analyser.snapshot();
        assert!(snapshot.waveform.iter().all(|s| *s == 0.0));
        assert!(snapshot
            .magnitudes_db
            .iter()
            .all(|db| db.is_finite() || *db == f32::NEG_INFINITY));
    }

    #[test]
    fn test_reset_clears_history() {
        let mut analyser = SpectrumAnalyser::new(AnalyserConfig {
            fft_size: 1024,
            ..Default::default()
        });
        analyser.push_samples(&sine(200.0, 44100.0, 1024, 0.5));
        let _ = analyser.snapshot();
        analyser.reset();
        let snapshot = analyser.snapshot();
        assert!(snapshot.waveform.iter().all(|s| *s == 0.0));
        assert!(snapshot.magnitudes_db.iter().all(|db| *db == f32::NEG_INFINITY));
    }
}
