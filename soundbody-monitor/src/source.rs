//! Raw PCM input: little-endian `f32` mono samples from any reader.

use std::io::{ErrorKind, Read};
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;
use soundbody_core::{CaptureEvent, DeviceErrorKind, SourceStatus};
use tracing::{debug, warn};

/// Reads `hop` samples at a time from `reader` until it ends.
///
/// Every full hop becomes a [`CaptureEvent::Frame`]; a trailing partial hop is
/// zero-padded. The last event is always a status: `StreamEnded`, or a device
/// error if reading failed.
pub fn read_pcm<R: Read>(mut reader: R, hop: usize, sender: &Sender<CaptureEvent>) {
    let hop = hop.max(1);
    let mut bytes = vec![0u8; hop * 4];

    let status = loop {
        let filled = match fill(&mut reader, &mut bytes) {
            Ok(filled) => filled,
            Err(e) => {
                warn!("Reading PCM input failed: {}", e);
                break SourceStatus::DeviceError(DeviceErrorKind::Other);
            }
        };
        if filled == 0 {
            break SourceStatus::StreamEnded;
        }

        let mut frame: Vec<f32> = bytes[..filled - filled % 4]
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        let partial = frame.len() < hop;
        frame.resize(hop, 0.0);

        if sender.send(CaptureEvent::Frame(frame)).is_err() {
            debug!("PCM consumer went away");
            return;
        }
        if partial {
            break SourceStatus::StreamEnded;
        }
    };

    let _ = sender.send(CaptureEvent::Status(status));
}

/// Fills `buffer` as far as the reader allows; returns the bytes read.
fn fill<R: Read>(reader: &mut R, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Starts a thread reading PCM from stdin.
pub fn spawn_stdin_reader(hop: usize, sender: Sender<CaptureEvent>) -> JoinHandle<()> {
    thread::spawn(move || {
        let stdin = std::io::stdin();
        read_pcm(stdin.lock(), hop, &sender);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn pcm(samples: &[f32]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn test_reads_hops_and_pads_tail() {
        let (tx, rx) = crossbeam_channel::unbounded();
        read_pcm(Cursor::new(pcm(&[0.1, 0.2, 0.3, 0.4, 0.5])), 2, &tx);

        let events: Vec<CaptureEvent> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![
                CaptureEvent::Frame(vec![0.1, 0.2]),
                CaptureEvent::Frame(vec![0.3, 0.4]),
                CaptureEvent::Frame(vec![0.5, 0.0]),
                CaptureEvent::Status(SourceStatus::StreamEnded),
            ]
        );
    }

    #[test]
    fn test_empty_input_just_ends() {
        let (tx, rx) = crossbeam_channel::unbounded();
        read_pcm(Cursor::new(Vec::new()), 4, &tx);
        let events: Vec<CaptureEvent> = rx.try_iter().collect();
        assert_eq!(events, vec![CaptureEvent::Status(SourceStatus::StreamEnded)]);
    }

    #[test]
    fn test_stray_bytes_are_ignored() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut bytes = pcm(&[1.0]);
        bytes.push(0xff);
        read_pcm(Cursor::new(bytes), 2, &tx);
        let first = rx.try_recv().unwrap();
        assert_eq!(first, CaptureEvent::Frame(vec![1.0, 0.0]));
    }
}
