//! # Sound Body Monitor
//!
//! Headless front end for `soundbody-core`: feeds audio into a session at a
//! fixed tick rate and prints one JSON line per tick on stdout.
//!
//! ## Architecture
//! - **Input Thread**: stdin PCM reader (or the CPAL callback with `mic`)
//! - **Communication**: Crossbeam channel of capture events
//! - **Main Loop**: one analyser snapshot and one session tick per hop
//!
//! Logs go to stderr so stdout stays machine-readable.

mod source;

use std::fs;
use std::io::{self, BufWriter, ErrorKind, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use crossbeam_channel::{RecvTimeoutError, bounded};
use soundbody_core::{
    CalibrationOutcome, CalibrationTicket, CaptureEvent, Session, SessionConfig, SourceStatus,
    SpectrumAnalyser,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "soundbody-monitor", about = "Per-tick pitch and zone read-out as JSON lines")]
struct Cli {
    /// Sample rate of the input in Hz
    #[arg(long, default_value_t = 44100)]
    sample_rate: u32,

    /// Analysis ticks per second
    #[arg(long, default_value_t = 60)]
    tick_rate: u32,

    /// JSON file with a full session configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Sample the ambient level for this many milliseconds at start-up
    #[arg(long)]
    calibrate_ms: Option<u64>,

    /// Print only every Nth tick
    #[arg(long, default_value_t = 1)]
    every: u64,

    /// Capture from the default input device instead of stdin
    #[arg(long)]
    mic: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    if cli.tick_rate == 0 {
        bail!("--tick-rate must be at least 1");
    }

    let mut config = match &cli.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str::<SessionConfig>(&text)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => SessionConfig::default(),
    };

    let hop = (cli.sample_rate / cli.tick_rate).max(1) as usize;
    let (sender, receiver) = bounded::<CaptureEvent>(64);

    // The capture stream has to outlive the loop when reading the microphone
    let (_capture, sample_rate) = open_source(&cli, hop, sender)?;
    config.analyser.sample_rate = sample_rate;
    let hop_duration = Duration::from_secs_f64(hop as f64 / sample_rate as f64);
    info!(
        "Running at {} Hz, {} samples per tick, fft size {}",
        sample_rate, hop, config.analyser.fft_size
    );

    let mut analyser = SpectrumAnalyser::new(config.analyser.clone());
    let mut session = Session::new(config);
    let mut ticket = cli
        .calibrate_ms
        .map(|ms| session.start_calibration(Some(Duration::from_millis(ms))));

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let every = cli.every.max(1);
    let mut ticks: u64 = 0;

    // A stalled source still ticks, with no snapshot, so the output decays
    let stall_timeout = hop_duration * 4;

    loop {
        let output = match receiver.recv_timeout(stall_timeout) {
            Ok(CaptureEvent::Frame(frame)) => {
                analyser.push_samples(&frame);
                let snapshot = analyser.snapshot();
                session.tick(Some(&snapshot), hop_duration)
            }
            Ok(CaptureEvent::Status(SourceStatus::Ready)) => continue,
            Ok(CaptureEvent::Status(status)) => {
                match status {
                    SourceStatus::StreamEnded => info!("Input ended"),
                    other => warn!("Input stopped: {:?}", other),
                }
                break;
            }
            Err(RecvTimeoutError::Timeout) => {
                debug!("No audio for {:?}", stall_timeout);
                session.tick(None, stall_timeout)
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };

        if let Some(pending) = ticket.as_mut() {
            if report_calibration(pending) {
                ticket = None;
            }
        }

        ticks += 1;
        if ticks % every != 0 {
            continue;
        }
        serde_json::to_writer(&mut out, &output).context("encoding tick output")?;
        if let Err(e) = writeln!(out).and_then(|_| out.flush()) {
            if e.kind() == ErrorKind::BrokenPipe {
                debug!("stdout closed");
                break;
            }
            return Err(e).context("writing tick output");
        }
    }

    info!("Processed {} ticks ({:.1?} of audio)", ticks, session.elapsed());
    Ok(())
}

/// Logs a resolved calibration. Returns `true` once the ticket has resolved.
fn report_calibration(ticket: &mut CalibrationTicket) -> bool {
    match ticket.try_outcome() {
        None => false,
        Some(CalibrationOutcome::Complete(report)) => {
            info!(
                "Calibration: noise floor {:.1} dB, gate {:.1} dB, suggested gain {:.2}",
                report.noise_floor_db, report.gate_threshold_db, report.gain
            );
            true
        }
        Some(other) => {
            warn!("Calibration did not complete: {:?}", other);
            true
        }
    }
}

/// Keeps whatever must stay alive for the source to keep producing.
enum SourceGuard {
    /// The reader thread is detached; it ends with stdin.
    Stdin,
    #[cfg(feature = "mic")]
    Mic(#[allow(dead_code)] soundbody_core::audio::CaptureStream),
}

fn open_source(
    cli: &Cli,
    hop: usize,
    sender: crossbeam_channel::Sender<CaptureEvent>,
) -> Result<(SourceGuard, u32)> {
    if cli.mic {
        return open_mic(cli, hop, sender);
    }
    info!("Reading f32 little-endian PCM from stdin");
    source::spawn_stdin_reader(hop, sender);
    Ok((SourceGuard::Stdin, cli.sample_rate))
}

#[cfg(feature = "mic")]
fn open_mic(
    cli: &Cli,
    hop: usize,
    sender: crossbeam_channel::Sender<CaptureEvent>,
) -> Result<(SourceGuard, u32)> {
    let stream = soundbody_core::audio::start_audio_capture(sender, cli.sample_rate, hop)
        .context("starting microphone capture")?;
    let sample_rate = stream.sample_rate;
    Ok((SourceGuard::Mic(stream), sample_rate))
}

#[cfg(not(feature = "mic"))]
fn open_mic(
    _cli: &Cli,
    _hop: usize,
    _sender: crossbeam_channel::Sender<CaptureEvent>,
) -> Result<(SourceGuard, u32)> {
    bail!("built without microphone support; rebuild with `--features mic`")
}
