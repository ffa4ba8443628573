//! # Zone Mapping Module
//!
//! Routes spectral peaks into seven fixed, ordered frequency zones and keeps a
//! smoothed intensity per zone, plus a hysteretic "dominant zone".
//!
//! ## Features
//! - Static zone table partitioning [30, 2000) Hz
//! - Edge falloff toward zone boundaries
//! - Smoothstep blending of peaks close to a neighbouring zone
//! - Harmonic bleed of strong peaks into the zones of their (sub)harmonics
//! - Time-based attack/decay envelopes, independent of tick rate
//! - Dominant-zone selection with a hold time and a switching margin

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ZoneMapConfig;
use crate::spectrum::Peak;

/// A fixed frequency band, `[min_hz, max_hz)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Zone {
    pub name: &'static str,
    pub min_hz: f64,
    pub max_hz: f64,
}

impl Zone {
    pub fn center_hz(&self) -> f64 {
        (self.min_hz + self.max_hz) / 2.0
    }

    pub fn width(&self) -> f64 {
        self.max_hz - self.min_hz
    }

    pub fn contains(&self, frequency: f64) -> bool {
        frequency >= self.min_hz && frequency < self.max_hz
    }
}

pub const ZONE_COUNT: usize = 7;

/// The zones, ordered low to high. Each zone starts where the previous ends.
pub const ZONES: [Zone; ZONE_COUNT] = [
    Zone { name: "root", min_hz: 30.0, max_hz: 90.0 },
    Zone { name: "sacral", min_hz: 90.0, max_hz: 160.0 },
    Zone { name: "solar_plexus", min_hz: 160.0, max_hz: 260.0 },
    Zone { name: "heart", min_hz: 260.0, max_hz: 400.0 },
    Zone { name: "throat", min_hz: 400.0, max_hz: 650.0 },
    Zone { name: "third_eye", min_hz: 650.0, max_hz: 1100.0 },
    Zone { name: "crown", min_hz: 1100.0, max_hz: 2000.0 },
];

/// Frequency ratios whose zones receive harmonic bleed from a strong peak.
const BLEED_RATIOS: [f64; 6] = [0.5, 2.0, 3.0, 4.0, 5.0, 6.0];
/// Bleed strength numerator: a peak contributes `amplitude * BLEED_SCALE / ratio`.
const BLEED_SCALE: f64 = 0.3;

/// Index of the zone containing `frequency`, if any.
pub fn zone_index(frequency: f64) -> Option<usize> {
    ZONES.iter().position(|zone| zone.contains(frequency))
}

fn smoothstep(x: f64) -> f64 {
    let x = x.clamp(0.0, 1.0);
    x * x * (3.0 - 2.0 * x)
}

/// How a single frequency's contribution is split between zones.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlendWeights {
    pub primary: usize,
    pub primary_weight: f64,
    pub neighbour: Option<(usize, f64)>,
}

impl BlendWeights {
    pub fn total(&self) -> f64 {
        self.primary_weight + self.neighbour.map_or(0.0, |(_, weight)| weight)
    }
}

/// Splits `frequency` between its zone and the nearer neighbouring zone.
///
/// Inside `blend_fraction * width` of an edge that has a neighbour, the
/// neighbour receives `t = 0.5 * smoothstep(1 - d / band)`, which is exactly
/// one half on the boundary itself.
pub fn blend_weights(frequency: f64, blend_fraction: f64) -> Option<BlendWeights> {
    let primary = zone_index(frequency)?;
    let zone = &ZONES[primary];
    let band = blend_fraction.max(0.0) * zone.width();
    let to_lower = frequency - zone.min_hz;
    let to_upper = zone.max_hz - frequency;

    let neighbour = if band > 0.0 && to_lower < band && primary > 0 {
        Some((primary - 1, 0.5 * smoothstep(1.0 - to_lower / band)))
    } else if band > 0.0 && to_upper < band && primary + 1 < ZONE_COUNT {
        Some((primary + 1, 0.5 * smoothstep(1.0 - to_upper / band)))
    } else {
        None
    };

    Some(BlendWeights {
        primary,
        primary_weight: 1.0 - neighbour.map_or(0.0, |(_, t)| t),
        neighbour,
    })
}

/// `1 - falloff * (distance from centre / half width)`.
pub fn edge_falloff(zone: &Zone, frequency: f64, falloff: f64) -> f64 {
    let half_width = zone.width() / 2.0;
    if half_width <= 0.0 {
        return 1.0;
    }
    1.0 - falloff * ((frequency - zone.center_hz()).abs() / half_width).min(1.0)
}

/// Smoothed state of one zone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ZoneIntensity {
    pub current: f64,
    pub target: f64,
}

/// Hysteretic choice of the strongest zone.
#[derive(Debug, Clone)]
pub struct DominantZoneTracker {
    threshold: f64,
    margin: f64,
    hold: f64,
    dominant: Option<usize>,
    last_switch: Option<f64>,
}

impl DominantZoneTracker {
    /// `hold_ms` is the minimum time between switches.
    pub fn new(threshold: f64, margin: f64, hold_ms: f64) -> Self {
        let mut tracker = Self {
            threshold,
            margin: 0.0,
            hold: 0.0,
            dominant: None,
            last_switch: None,
        };
        tracker.set_switching(margin, hold_ms);
        tracker
    }

    pub fn set_switching(&mut self, margin: f64, hold_ms: f64) {
        self.margin = if margin.is_finite() { margin.max(0.0) } else { 0.0 };
        self.hold = if hold_ms.is_finite() { hold_ms.max(0.0) / 1000.0 } else { 0.0 };
    }

    pub fn dominant(&self) -> Option<usize> {
        self.dominant
    }

    /// Re-evaluates the dominant zone given current intensities at time `now` (s).
    pub fn update(&mut self, intensities: &[f64; ZONE_COUNT], now: f64) -> Option<usize> {
        let mut best = 0;
        for (i, &value) in intensities.iter().enumerate() {
            if value > intensities[best] {
                best = i;
            }
        }
        let candidate = (intensities[best] >= self.threshold).then_some(best);

        match (self.dominant, candidate) {
            (current, next) if current == next => {}
            (None, Some(next)) => self.switch_to(Some(next), now),
            (Some(current), None) => {
                if intensities[current] < self.threshold {
                    self.switch_to(None, now);
                }
            }
            (Some(current), Some(next)) => {
                let held = self.last_switch.is_none_or(|at| now - at >= self.hold);
                let incumbent = intensities[current];
                if held && intensities[next] >= incumbent * (1.0 + self.margin) {
                    self.switch_to(Some(next), now);
                }
            }
            (None, None) => {}
        }
        self.dominant
    }

    fn switch_to(&mut self, zone: Option<usize>, now: f64) {
        debug!(
            "Dominant zone {} -> {} at {:.3}s",
            self.dominant.map_or("none", |i| ZONES[i].name),
            zone.map_or("none", |i| ZONES[i].name),
            now
        );
        self.dominant = zone;
        if zone.is_some() {
            self.last_switch = Some(now);
        }
    }

    pub fn reset(&mut self) {
        self.dominant = None;
        self.last_switch = None;
    }
}

/// Converts peaks into per-zone intensities.
pub struct RegionMapper {
    config: ZoneMapConfig,
    zones: [ZoneIntensity; ZONE_COUNT],
    tracker: DominantZoneTracker,
    attack: f64,
    decay: f64,
    /// Mapper clock in seconds, advanced by each `update` call.
    now: f64,
}

impl RegionMapper {
    pub fn new(config: ZoneMapConfig) -> Self {
        let tracker = DominantZoneTracker::new(
            config.dominant_threshold,
            config.switch_margin,
            config.switch_hold_ms,
        );
        let mut mapper = Self {
            zones: [ZoneIntensity {
                current: config.min_opacity,
                target: 0.0,
            }; ZONE_COUNT],
            tracker,
            attack: 0.0,
            decay: 0.0,
            now: 0.0,
            config,
        };
        mapper.set_envelope(mapper.config.attack_ms, mapper.config.decay_ms);
        debug!(
            "RegionMapper created: attack={}ms, decay={}ms",
            mapper.config.attack_ms, mapper.config.decay_ms
        );
        mapper
    }

    /// Updates the rising and falling time constants (milliseconds).
    pub fn set_envelope(&mut self, attack_ms: f64, decay_ms: f64) {
        let seconds = |ms: f64| if ms.is_finite() { ms.max(0.0) / 1000.0 } else { 0.0 };
        self.attack = seconds(attack_ms);
        self.decay = seconds(decay_ms);
    }

    pub fn set_switching(&mut self, margin: f64, hold_ms: f64) {
        self.tracker.set_switching(margin, hold_ms);
    }

    /// Target intensities for one tick's peaks, before any smoothing.
    pub fn targets(&self, peaks: &[Peak]) -> [f64; ZONE_COUNT] {
        let mut targets = [0.0f64; ZONE_COUNT];
        for peak in peaks {
            if !peak.frequency.is_finite() || !peak.amplitude.is_finite() {
                continue;
            }

            if let Some(weights) = blend_weights(peak.frequency, self.config.blend_fraction) {
                let zone = &ZONES[weights.primary];
                let value = peak.amplitude * edge_falloff(zone, peak.frequency, self.config.edge_falloff);
                let primary = &mut targets[weights.primary];
                *primary = primary.max(value * weights.primary_weight);
                if let Some((neighbour, weight)) = weights.neighbour {
                    targets[neighbour] = targets[neighbour].max(value * weight);
                }
            }

            if peak.amplitude > self.config.bleed_min_amplitude {
                for ratio in BLEED_RATIOS {
                    let Some(index) = zone_index(peak.frequency * ratio) else {
                        continue;
                    };
                    let contribution = peak.amplitude * (BLEED_SCALE / ratio);
                    if contribution > self.config.bleed_min_contribution {
                        targets[index] = targets[index].max(contribution);
                    }
                }
            }
        }
        targets
    }

    /// Advances every zone envelope by `dt` seconds and re-evaluates the
    /// dominant zone. A closed gate drives every target to zero.
    pub fn update(&mut self, peaks: &[Peak], gate_open: bool, dt: f64) -> Option<usize> {
        let dt = if dt.is_finite() { dt.max(0.0) } else { 0.0 };
        self.now += dt;

        let targets = if gate_open {
            self.targets(peaks)
        } else {
            [0.0; ZONE_COUNT]
        };

        let (min, max) = (self.config.min_opacity, self.config.max_opacity);
        for (zone, target) in self.zones.iter_mut().zip(targets) {
            zone.target = target;
            let tau = if target > zone.current { self.attack } else { self.decay };
            let alpha = if tau > 0.0 { 1.0 - (-dt / tau).exp() } else { 1.0 };
            zone.current = (zone.current + (target - zone.current) * alpha).clamp(min, max);
        }

        let intensities = self.intensities();
        self.tracker.update(&intensities, self.now)
    }

    pub fn intensities(&self) -> [f64; ZONE_COUNT] {
        self.zones.map(|zone| zone.current)
    }

    /// Dominant zone index and its current intensity.
    pub fn dominant(&self) -> Option<(usize, f64)> {
        self.tracker
            .dominant()
            .map(|index| (index, self.zones[index].current))
    }

    pub fn reset(&mut self) {
        let floor = self.config.min_opacity;
        self.zones = [ZoneIntensity {
            current: floor,
            target: 0.0,
        }; ZONE_COUNT];
        self.tracker.reset();
        self.now = 0.0;
        debug!("RegionMapper reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const TICK: f64 = 1.0 / 60.0;

    fn peak(frequency: f64, amplitude: f64) -> Peak {
        Peak {
            frequency,
            amplitude,
            raw_level: -40.0,
            bin_index: 0,
        }
    }

    fn run(mapper: &mut RegionMapper, peaks: &[Peak], gate_open: bool, ticks: usize) -> Option<usize> {
        let mut dominant = None;
        for _ in 0..ticks {
            dominant = mapper.update(peaks, gate_open, TICK);
        }
        dominant
    }

    #[test]
    fn test_zone_table_is_contiguous() {
        assert_eq!(ZONES[0].min_hz, 30.0);
        assert_eq!(ZONES[ZONE_COUNT - 1].max_hz, 2000.0);
        for pair in ZONES.windows(2) {
            assert_eq!(pair[0].max_hz, pair[1].min_hz);
        }
    }

    #[test]
    fn test_zone_index_edges() {
        assert_eq!(zone_index(29.99), None);
        assert_eq!(zone_index(30.0), Some(0));
        assert_eq!(zone_index(90.0), Some(1));
        assert_eq!(zone_index(1999.9), Some(6));
        assert_eq!(zone_index(2000.0), None);
        assert_eq!(zone_index(f64::NAN), None);
    }

    #[test]
    fn test_boundary_weights_split_evenly() {
        let weights = blend_weights(90.0, 0.18).unwrap();
        assert_eq!(weights.primary, 1);
        let (neighbour, t) = weights.neighbour.unwrap();
        assert_eq!(neighbour, 0);
        assert!((t - 0.5).abs() < 1e-12);
        assert!((weights.total() - 1.0).abs() < 1e-6);

        // Just below the boundary the split is nearly identical, mirrored
        let below = blend_weights(89.9999, 0.18).unwrap();
        assert_eq!(below.primary, 0);
        assert_eq!(below.neighbour.unwrap().0, 1);
        assert!((below.primary_weight - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_outer_edges_do_not_blend() {
        let low = blend_weights(30.0, 0.18).unwrap();
        assert!(low.neighbour.is_none());
        let high = blend_weights(1999.0, 0.18).unwrap();
        assert!(high.neighbour.is_none());
    }

    #[test]
    fn test_edge_falloff() {
        let throat = &ZONES[4];
        assert_eq!(edge_falloff(throat, throat.center_hz(), 0.3), 1.0);
        assert!((edge_falloff(throat, 400.0, 0.3) - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_tone_lights_its_zone_and_bleeds() {
        let mapper = RegionMapper::new(ZoneMapConfig::default());
        let targets = mapper.targets(&[peak(500.0, 0.8)]);
        // 500 Hz: throat, 25 Hz from centre, outside both blend bands
        assert!((targets[4] - 0.8 * 0.94).abs() < 1e-9);
        // 250 Hz (x0.5) bleeds into solar plexus, 1000 Hz (x2) into third eye
        assert!((targets[2] - 0.48).abs() < 1e-9);
        assert!((targets[5] - 0.12).abs() < 1e-9);
        // x3 = 1500 Hz would contribute 0.08, below the bleed cut-off
        assert_eq!(targets[6], 0.0);
    }

    #[test]
    fn test_weak_peak_does_not_bleed() {
        let mapper = RegionMapper::new(ZoneMapConfig::default());
        let targets = mapper.targets(&[peak(500.0, 0.25)]);
        assert_eq!(targets.iter().filter(|t| **t > 0.0).count(), 1);
    }

    #[test]
    fn test_envelope_converges_and_decays() {
        let mut mapper = RegionMapper::new(ZoneMapConfig::default());
        let dominant = run(&mut mapper, &[peak(500.0, 0.8)], true, 60);
        assert_eq!(dominant, Some(4));
        assert!((mapper.intensities()[4] - 0.752).abs() < 1e-3);

        let dominant = run(&mut mapper, &[peak(500.0, 0.8)], false, 60);
        assert!(mapper.intensities()[4] < 0.05);
        assert_eq!(dominant, None);
    }

    #[test]
    fn test_envelope_is_tick_rate_independent() {
        let peaks = [peak(300.0, 0.6)];
        let mut fast = RegionMapper::new(ZoneMapConfig::default());
        let mut slow = RegionMapper::new(ZoneMapConfig::default());
        for _ in 0..12 {
            fast.update(&peaks, true, 1.0 / 120.0);
        }
        for _ in 0..3 {
            slow.update(&peaks, true, 1.0 / 30.0);
        }
        let (a, b) = (fast.intensities(), slow.intensities());
        for i in 0..ZONE_COUNT {
            assert!((a[i] - b[i]).abs() < 1e-9, "zone {}: {} vs {}", i, a[i], b[i]);
        }
    }

    #[test]
    fn test_intensity_respects_opacity_range() {
        let config = ZoneMapConfig {
            min_opacity: 0.1,
            max_opacity: 0.5,
            ..Default::default()
        };
        let mut mapper = RegionMapper::new(config);
        run(&mut mapper, &[peak(500.0, 1.0)], true, 120);
        assert!(mapper.intensities().iter().all(|v| (0.1..=0.5).contains(v)));
    }

    #[test]
    fn test_dominant_holds_against_small_margin() {
        let mut tracker = DominantZoneTracker::new(0.15, 0.18, 450.0);
        let mut levels = [0.0; ZONE_COUNT];
        levels[0] = 0.5;
        assert_eq!(tracker.update(&levels, 0.0), Some(0));

        // sacral is 10% louder within the hold window
        levels[1] = 0.55;
        assert_eq!(tracker.update(&levels, 0.2), Some(0));
        // still short of the margin after the hold window
        assert_eq!(tracker.update(&levels, 0.6), Some(0));
        // clear of the margin and the hold
        levels[1] = 0.6;
        assert_eq!(tracker.update(&levels, 0.7), Some(1));
    }

    #[test]
    fn test_dominant_waits_for_hold_even_with_margin() {
        let mut tracker = DominantZoneTracker::new(0.15, 0.18, 450.0);
        let mut levels = [0.0; ZONE_COUNT];
        levels[3] = 0.4;
        tracker.update(&levels, 1.0);
        levels[4] = 0.9;
        assert_eq!(tracker.update(&levels, 1.3), Some(3));
        assert_eq!(tracker.update(&levels, 1.5), Some(4));
    }

    #[test]
    fn test_dominant_dropped_when_everything_is_quiet() {
        let mut tracker = DominantZoneTracker::new(0.15, 0.18, 450.0);
        let mut levels = [0.0; ZONE_COUNT];
        levels[2] = 0.3;
        tracker.update(&levels, 0.0);
        levels[2] = 0.1;
        assert_eq!(tracker.update(&levels, 0.1), None);
    }

    #[test]
    fn test_reset_clears_intensities() {
        let mut mapper = RegionMapper::new(ZoneMapConfig::default());
        run(&mut mapper, &[peak(120.0, 0.9)], true, 30);
        mapper.reset();
        assert!(mapper.intensities().iter().all(|v| *v == 0.0));
        assert!(mapper.dominant().is_none());
    }

    proptest! {
        #[test]
        fn prop_zones_partition_band(frequency in 30.0f64..2000.0) {
            let matches = ZONES.iter().filter(|zone| zone.contains(frequency)).count();
            prop_assert_eq!(matches, 1);
        }

        #[test]
        fn prop_blend_weights_sum_to_one(frequency in 30.0f64..2000.0, fraction in 0.0f64..0.5) {
            let weights = blend_weights(frequency, fraction).unwrap();
            prop_assert!((weights.total() - 1.0).abs() < 1e-6);
            prop_assert!(weights.primary_weight >= 0.5 - 1e-12);
        }

        #[test]
        fn prop_targets_stay_in_unit_range(
            peaks in proptest::collection::vec((0.0f64..4000.0, 0.0f64..1.0), 0..24)
        ) {
            let mapper = RegionMapper::new(ZoneMapConfig::default());
            let peaks: Vec<Peak> = peaks.into_iter().map(|(f, a)| peak(f, a)).collect();
            for target in mapper.targets(&peaks) {
                prop_assert!((0.0..=1.0).contains(&target));
            }
        }
    }
}
