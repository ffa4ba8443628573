//! # Audio Capture Module
//!
//! Live input through CPAL (Cross-Platform Audio Library). Captured samples are
//! cut into fixed-size hops and sent to the consumer over a channel, together
//! with status changes of the stream.
//!
//! ## Features
//! - Default input device selection
//! - Prefers mono f32, downmixes multi-channel f32 input otherwise
//! - Sample rate closest to the requested one
//! - Stream errors reported as [`SourceStatus`] events, never retried here

use cpal::SupportedStreamConfigRange;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::Sender;
use tracing::{info, warn};

use crate::error::{CaptureError, CaptureEvent, DeviceErrorKind, SourceStatus};

/// A running input stream. Capture stops when this is dropped.
pub struct CaptureStream {
    _stream: cpal::Stream,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Starts capturing from the default input device.
///
/// # Arguments
/// * `sender` - Receives `hop` sized mono frames and status events
/// * `target_rate` - Preferred sample rate in Hz
/// * `hop` - Samples per emitted frame
///
/// Frames are dropped, not queued, when the consumer falls behind.
pub fn start_audio_capture(
    sender: Sender<CaptureEvent>,
    target_rate: u32,
    hop: usize,
) -> Result<CaptureStream, CaptureError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(CaptureError::NoInputDevice)?;

    let name = device
        .name()
        .map_err(|e| CaptureError::Device(e.to_string()))?;
    info!("Using audio input device: {}", name);

    let configs = device
        .supported_input_configs()
        .map_err(|e| CaptureError::Device(e.to_string()))?
        .collect::<Vec<_>>();
    let (supported, sample_rate) =
        find_supported_config(configs, target_rate).ok_or(CaptureError::UnsupportedFormat)?;

    let config = supported.with_sample_rate(cpal::SampleRate(sample_rate));
    let channels = config.channels();
    let config: cpal::StreamConfig = config.into();
    info!("Selected {} Hz, {} channel(s)", sample_rate, channels);

    let hop = hop.max(1);
    let status_sender = sender.clone();
    let ready_sender = sender.clone();
    let err_fn = move |err: cpal::StreamError| report_stream_error(&status_sender, err);

    // Accumulates mono samples between callbacks
    let mut audio_buffer: Vec<f32> = Vec::with_capacity(hop * 2);

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if channels <= 1 {
                    audio_buffer.extend_from_slice(data);
                } else {
                    audio_buffer.extend(
                        data.chunks(channels as usize)
                            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32),
                    );
                }

                while audio_buffer.len() >= hop {
                    let frame: Vec<f32> = audio_buffer.drain(..hop).collect();
                    let _ = sender.try_send(CaptureEvent::Frame(frame));
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| CaptureError::Stream(e.to_string()))?;

    stream
        .play()
        .map_err(|e| CaptureError::Stream(e.to_string()))?;
    let _ = ready_sender.try_send(CaptureEvent::Status(SourceStatus::Ready));

    Ok(CaptureStream {
        _stream: stream,
        sample_rate,
        channels,
    })
}

/// Forwards a stream error to the consumer.
///
/// Unlike frames this waits for room in the channel: a full queue must not
/// swallow the status that tells the consumer to stop.
fn report_stream_error(sender: &Sender<CaptureEvent>, err: cpal::StreamError) {
    let message = err.to_string();
    warn!("An error occurred on the audio stream: {}", message);
    let kind = match err {
        cpal::StreamError::DeviceNotAvailable => DeviceErrorKind::Disconnected,
        _ => DeviceErrorKind::classify(&message),
    };
    let _ = sender.send(CaptureEvent::Status(SourceStatus::DeviceError(kind)));
}

/// Picks the best f32 input configuration and the rate to open it at.
///
/// Mono beats multi-channel; then the closest reachable rate wins. The rate is
/// clamped into the chosen range.
fn find_supported_config(
    configs: Vec<SupportedStreamConfigRange>,
    target_rate: u32,
) -> Option<(SupportedStreamConfigRange, u32)> {
    configs
        .into_iter()
        .filter(|c| c.sample_format() == cpal::SampleFormat::F32 && c.channels() >= 1)
        .map(|c| {
            let rate = target_rate.clamp(c.min_sample_rate().0, c.max_sample_rate().0);
            (c, rate)
        })
        .min_by_key(|(c, rate)| (c.channels() != 1, rate.abs_diff(target_rate)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpal::{SampleFormat, SampleRate, SupportedBufferSize};

    fn range(channels: u16, min: u32, max: u32, format: SampleFormat) -> SupportedStreamConfigRange {
        SupportedStreamConfigRange::new(
            channels,
            SampleRate(min),
            SampleRate(max),
            SupportedBufferSize::Unknown,
            format,
        )
    }

    #[test]
    fn test_prefers_mono_f32() {
        let configs = vec![
            range(2, 44100, 44100, SampleFormat::F32),
            range(1, 8000, 48000, SampleFormat::F32),
            range(1, 44100, 44100, SampleFormat::I16),
        ];
        let (config, rate) = find_supported_config(configs, 44100).unwrap();
        assert_eq!(config.channels(), 1);
        assert_eq!(config.sample_format(), SampleFormat::F32);
        assert_eq!(rate, 44100);
    }

    #[test]
    fn test_rate_is_clamped_into_range() {
        let configs = vec![range(1, 48000, 96000, SampleFormat::F32)];
        let (_, rate) = find_supported_config(configs, 44100).unwrap();
        assert_eq!(rate, 48000);
    }

    #[test]
    fn test_stream_error_waits_for_full_channel() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        tx.send(CaptureEvent::Frame(vec![0.0; 4])).unwrap();

        let reporter = std::thread::spawn(move || {
            report_stream_error(&tx, cpal::StreamError::DeviceNotAvailable);
        });

        assert_eq!(rx.recv().unwrap(), CaptureEvent::Frame(vec![0.0; 4]));
        assert_eq!(
            rx.recv().unwrap(),
            CaptureEvent::Status(SourceStatus::DeviceError(DeviceErrorKind::Disconnected))
        );
        reporter.join().unwrap();
    }

    #[test]
    fn test_no_f32_config() {
        let configs = vec![range(1, 44100, 44100, SampleFormat::I16)];
        assert!(find_supported_config(configs, 44100).is_none());
    }
}
