// soundbody-core/src/lib.rs

//! The core analysis pipeline of the sound-body visualiser.
//! This crate turns audio into two per-tick answers: which pitch is
//! sounding (with what confidence), and which of seven fixed frequency
//! zones is dominant and how intensely. It is completely headless and
//! contains no rendering code.
//!
//! One tick runs the stages in a fixed order:
//! snapshot → peaks + RMS → fundamental → noise gate → zone mapping.
//! [`Session`] owns every stage; [`SpectrumAnalyser`] produces the
//! snapshots from raw samples.

#[cfg(feature = "capture")]
pub mod audio;
pub mod calibration;
pub mod config;
pub mod error;
pub mod fft;
pub mod noise_gate;
pub mod pitch;
pub mod session;
pub mod spectrum;
pub mod tuning;
pub mod zones;

use serde::{Deserialize, Serialize};

pub use calibration::{CalibrationOutcome, CalibrationReport, CalibrationState, CalibrationTicket};
pub use config::{RuntimeParams, SessionConfig};
pub use error::{CaptureError, CaptureEvent, DeviceErrorKind, SourceStatus};
pub use fft::SpectrumAnalyser;
pub use pitch::HarmonicProfileEntry;
pub use session::Session;
pub use spectrum::{Peak, SpectralSnapshot};
pub use tuning::NoteReading;

/// Intensity of one zone in a tick's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneLevel {
    pub name: String,
    pub intensity: f64,
}

/// The zone currently judged dominant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DominantZone {
    pub name: String,
    pub intensity: f64,
}

/// Everything one tick produces for the rendering side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickOutput {
    /// Per-zone intensity (0..1), ordered low to high.
    pub zone_intensities: Vec<ZoneLevel>,
    pub dominant: Option<DominantZone>,
    /// Tracked fundamental in Hz, 0.0 when nothing is tracked.
    pub fundamental_hz: f64,
    pub confidence: f64,
    /// A new note started this tick.
    pub onset: bool,
    pub note: Option<NoteReading>,
    /// Presence of the first twelve harmonics of the fundamental.
    pub harmonics: Vec<HarmonicProfileEntry>,
    pub gate_open: bool,
    /// Input level in dBFS after gain, before gating.
    pub level_db: f64,
    /// Adaptive estimate of the ambient level, once enough quiet ticks were seen.
    pub noise_floor_db: Option<f64>,
    /// This tick's peaks, strongest first.
    pub peaks: Vec<Peak>,
    pub calibration: CalibrationState,
}

impl TickOutput {
    /// Intensity of the zone called `name`, if it exists.
    pub fn intensity(&self, name: &str) -> Option<f64> {
        self.zone_intensities
            .iter()
            .find(|zone| zone.name == name)
            .map(|zone| zone.intensity)
    }
}
