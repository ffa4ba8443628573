//! Audio source events, status and acquisition errors.
//!
//! The per-tick pipeline never fails; only getting audio in can.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure to set up an audio source.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no input device available")]
    NoInputDevice,
    #[error("no suitable f32 input format found")]
    UnsupportedFormat,
    #[error("audio device error: {0}")]
    Device(String),
    #[error("audio stream error: {0}")]
    Stream(String),
}

/// Why a running source stopped delivering audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceErrorKind {
    PermissionDenied,
    Unavailable,
    Disconnected,
    Other,
}

impl DeviceErrorKind {
    /// Best-effort classification of a backend error message.
    pub fn classify(message: &str) -> Self {
        let message = message.to_ascii_lowercase();
        if message.contains("permission") || message.contains("denied") {
            Self::PermissionDenied
        } else if message.contains("disconnect") || message.contains("no longer available") {
            Self::Disconnected
        } else if message.contains("unavailable") || message.contains("not available") {
            Self::Unavailable
        } else {
            Self::Other
        }
    }
}

/// State of the audio source as reported to the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "kind", rename_all = "snake_case")]
pub enum SourceStatus {
    Ready,
    DeviceError(DeviceErrorKind),
    StreamEnded,
}

/// Something an audio source has to say.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    /// One hop of mono samples.
    Frame(Vec<f32>),
    Status(SourceStatus),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(CaptureError::NoInputDevice.to_string(), "no input device available");
        assert_eq!(
            CaptureError::Stream("buffer overrun".into()).to_string(),
            "audio stream error: buffer overrun"
        );
    }

    #[test]
    fn test_classify_device_errors() {
        assert_eq!(
            DeviceErrorKind::classify("Permission denied by the system"),
            DeviceErrorKind::PermissionDenied
        );
        assert_eq!(
            DeviceErrorKind::classify("The requested device is no longer available."),
            DeviceErrorKind::Disconnected
        );
        assert_eq!(DeviceErrorKind::classify("device unavailable"), DeviceErrorKind::Unavailable);
        assert_eq!(DeviceErrorKind::classify("ALSA xrun"), DeviceErrorKind::Other);
    }

    #[test]
    fn test_status_serialises_tagged() {
        let json = serde_json::to_string(&SourceStatus::DeviceError(DeviceErrorKind::Disconnected)).unwrap();
        assert_eq!(json, r#"{"status":"device_error","kind":"Disconnected"}"#);
        let json = serde_json::to_string(&SourceStatus::StreamEnded).unwrap();
        assert_eq!(json, r#"{"status":"stream_ended"}"#);
    }
}
