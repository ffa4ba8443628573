//! # Note Read-out Module
//!
//! Names the equal-tempered note nearest to a tracked fundamental and reports
//! how far off it is in cents, so a listener can tell what is sounding.
//!
//! ## Features
//! - Twelve-tone equal temperament with A4 = 440 Hz
//! - Note table from C0 to B8, computed once
//! - Cent deviation (positive = sharp, negative = flat)

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// A single note with its name and frequency.
#[derive(Debug, Clone)]
pub struct Note {
    /// Note name (e.g., "A4", "C#3")
    pub name: String,
    /// Frequency in Hz
    pub frequency: f64,
}

/// Nearest note and the deviation from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteReading {
    pub name: String,
    /// Equal-tempered frequency of the named note.
    pub target_frequency: f64,
    pub cents: f64,
}

const A4_FREQUENCY: f64 = 440.0;
const LOWEST_OCTAVE: i32 = 0;
const HIGHEST_OCTAVE: i32 = 8;

/// Statically computed notes C0..=B8, ascending.
///
/// C0 sits 57 semitones below A4; each entry is `440 * 2^(n/12)`.
static NOTES: Lazy<Vec<Note>> = Lazy::new(|| {
    const NOTE_NAMES: [&str; 12] = [
        "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
    ];
    let octaves = (HIGHEST_OCTAVE - LOWEST_OCTAVE + 1) as usize;
    let mut notes = Vec::with_capacity(octaves * 12);

    for octave in LOWEST_OCTAVE..=HIGHEST_OCTAVE {
        for (index, name) in NOTE_NAMES.iter().enumerate() {
            let semitones_from_a4 = (octave - 4) * 12 + index as i32 - 9;
            notes.push(Note {
                name: format!("{}{}", name, octave),
                frequency: A4_FREQUENCY * 2.0_f64.powf(semitones_from_a4 as f64 / 12.0),
            });
        }
    }
    notes
});

/// Every note of the table, lowest first.
pub fn notes() -> &'static [Note] {
    &NOTES
}

/// Finds the closest note to a given frequency.
///
/// Returns `None` for non-positive or non-finite input.
pub fn find_nearest_note(freq: f64) -> Option<&'static Note> {
    if !(freq > 0.0 && freq.is_finite()) {
        return None;
    }
    NOTES.iter().min_by(|a, b| {
        let diff_a = calculate_cents_deviation(freq, a.frequency).abs();
        let diff_b = calculate_cents_deviation(freq, b.frequency).abs();
        diff_a.total_cmp(&diff_b)
    })
}

/// Calculates the deviation from a target frequency in cents.
///
/// 100 cents = 1 semitone, 1200 cents = 1 octave.
pub fn calculate_cents_deviation(freq: f64, target_freq: f64) -> f64 {
    1200.0 * (freq / target_freq).log2()
}

/// Note read-out for a tracked fundamental, `None` when nothing is tracked.
pub fn read_note(freq: f64) -> Option<NoteReading> {
    find_nearest_note(freq).map(|note| NoteReading {
        name: note.name.clone(),
        target_frequency: note.frequency,
        cents: calculate_cents_deviation(freq, note.frequency),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_bounds() {
        let table = notes();
        assert_eq!(table.len(), 108);
        assert_eq!(table[0].name, "C0");
        assert!((table[0].frequency - 16.3516).abs() < 1e-3);
        assert_eq!(table[table.len() - 1].name, "B8");
        assert!(table.windows(2).all(|w| w[0].frequency < w[1].frequency));
    }

    #[test]
    fn test_a4_is_exact() {
        let reading = read_note(440.0).unwrap();
        assert_eq!(reading.name, "A4");
        assert!(reading.cents.abs() < 1e-9);
    }

    #[test]
    fn test_cents_sign() {
        let sharp = read_note(445.0).unwrap();
        assert_eq!(sharp.name, "A4");
        assert!(sharp.cents > 19.0 && sharp.cents < 20.0);

        let flat = read_note(65.0).unwrap();
        assert_eq!(flat.name, "C2");
        assert!(flat.cents < 0.0);
    }

    #[test]
    fn test_no_reading_without_fundamental() {
        assert!(read_note(0.0).is_none());
        assert!(read_note(-3.0).is_none());
        assert!(read_note(f64::NAN).is_none());
    }

    #[test]
    fn test_calculate_cents_deviation() {
        assert!((calculate_cents_deviation(880.0, 440.0) - 1200.0).abs() < 1e-9);
        assert!((calculate_cents_deviation(220.0, 440.0) + 1200.0).abs() < 1e-9);
    }
}
