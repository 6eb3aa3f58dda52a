//! Settle delays after image-shift and stage changes, and the rolling "next action
//! allowed" timeout shared by every caller that moves something.

use std::fmt;
use std::time::{Duration, Instant};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::transforms::Transforms;

/// Converts shift magnitudes into settle delays.
///
/// Image-shift delays come from a calibrated table of `(distance_um, delay_s)` points,
/// interpolated piecewise-linearly from the origin and extrapolated along the last
/// segment. Small pixel sizes add `per_doubling` seconds for every halving below
/// `pixel_threshold_um`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelayModel {
    /// Calibrated `(specimen distance in microns, delay in seconds)` points.
    pub table: Vec<(f64, f64)>,
    /// Seconds added per halving of the pixel size below the threshold.
    pub per_doubling: f64,
    /// Pixel size in microns below which the per-doubling term applies.
    pub pixel_threshold_um: f64,
    /// Global multiplier.
    pub scale: f64,
    /// Extra multiplier on STEM cameras.
    pub stem_scale: f64,
    /// Delay in seconds used when the shift cannot be converted to microns.
    pub flat_delay: f64,
    /// Base settle time after a stage move, seconds.
    pub stage_delay: f64,
    /// Additional stage settle time per micron moved, seconds.
    pub stage_per_um: f64,
}

impl Default for DelayModel {
    fn default() -> Self {
        Self {
            table: vec![(0.5, 0.3), (2., 0.5), (5., 1.), (10., 1.5), (20., 2.5)],
            per_doubling: 0.2,
            pixel_threshold_um: 0.001,
            scale: 1.,
            stem_scale: 1.,
            flat_delay: 1.,
            stage_delay: 1.,
            stage_per_um: 0.,
        }
    }
}

impl DelayModel {
    /// Replace the calibrated table. Points are sorted by distance and delays made
    /// non-decreasing.
    pub fn with_table(mut self, mut table: Vec<(f64, f64)>) -> Self {
        table.retain(|(d, t)| d.is_finite() && t.is_finite() && *d > 0.);
        table.sort_by(|a, b| a.0.total_cmp(&b.0));
        let mut floor = 0f64;
        for point in table.iter_mut() {
            floor = floor.max(point.1);
            point.1 = floor;
        }
        self.table = table;
        self
    }

    /// Set the small-pixel correction.
    pub fn with_per_doubling(mut self, seconds: f64, pixel_threshold_um: f64) -> Self {
        self.per_doubling = seconds.max(0.);
        self.pixel_threshold_um = pixel_threshold_um;
        self
    }

    /// Set the global and STEM multipliers.
    pub fn with_scales(mut self, scale: f64, stem_scale: f64) -> Self {
        self.scale = scale.max(0.);
        self.stem_scale = stem_scale.max(0.);
        self
    }

    /// Set the delay used without a calibration.
    pub fn with_flat_delay(mut self, seconds: f64) -> Self {
        self.flat_delay = seconds.max(0.);
        self
    }

    /// Set the stage settle model.
    pub fn with_stage_delay(mut self, base: f64, per_um: f64) -> Self {
        self.stage_delay = base.max(0.);
        self.stage_per_um = per_um.max(0.);
        self
    }

    /// Table delay in seconds for a specimen distance, before corrections.
    pub fn interpolate(&self, distance_um: f64) -> f64 {
        let distance = distance_um.abs();
        let mut prev = (0., 0.);
        for &(d, t) in &self.table {
            if distance <= d {
                let frac = if d > prev.0 { (distance - prev.0) / (d - prev.0) } else { 1. };
                return prev.1 + frac * (t - prev.1);
            }
            prev = (d, t);
        }
        // past the table: continue the last segment, never downwards
        let before = match self.table.len() {
            0 => return 0.,
            1 => (0., 0.),
            n => self.table[n - 2],
        };
        let slope = if prev.0 > before.0 {
            ((prev.1 - before.1) / (prev.0 - before.0)).max(0.)
        } else {
            0.
        };
        prev.1 + slope * (distance - prev.0)
    }

    /// Settle delay after changing image shift by `is_delta` at (mag, camera).
    ///
    /// Non-decreasing in the size of the shift for a fixed mag and camera.
    pub fn delay_for(
        &self,
        transforms: &Transforms<'_>,
        is_delta: (f64, f64),
        mag: usize,
        camera: usize,
    ) -> Duration {
        let setup = transforms.setup();
        let Some(distance) = transforms.is_distance_um(mag, camera, is_delta) else {
            return seconds(self.flat_delay * self.scale);
        };
        let mut delay = self.interpolate(distance);
        if let Some(px) = transforms.pixel_size(mag, camera) {
            if px < self.pixel_threshold_um {
                delay += self.per_doubling * (self.pixel_threshold_um / px).log2();
            }
        }
        let stem = setup.cameras.get(camera).is_some_and(|c| c.stem);
        let mode = if stem { self.stem_scale } else { 1. };
        seconds(delay * self.scale * mode * setup.kind.settle_scale())
    }

    /// Settle delay after a stage move of `distance_um`.
    pub fn stage_delay_for(&self, distance_um: f64) -> Duration {
        seconds(self.stage_delay + self.stage_per_um * distance_um.abs())
    }
}

fn seconds(s: f64) -> Duration {
    if s.is_finite() && s > 0. {
        Duration::from_secs_f64(s)
    } else {
        Duration::ZERO
    }
}

/// What set a timeout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeoutCause {
    /// Image-shift change.
    ImageShift,
    /// Stage move.
    Stage,
    /// Tilt change.
    Tilt,
    /// Lens normalization.
    Normalization,
}

impl TimeoutCause {
    const ALL: [TimeoutCause; 4] = [
        TimeoutCause::ImageShift,
        TimeoutCause::Stage,
        TimeoutCause::Tilt,
        TimeoutCause::Normalization,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for TimeoutCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TimeoutCause::ImageShift => "image shift",
            TimeoutCause::Stage => "stage",
            TimeoutCause::Tilt => "tilt",
            TimeoutCause::Normalization => "normalization",
        })
    }
}

/// The binding timeout across all causes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GeneralTimeout {
    /// Earliest time the next action is allowed.
    pub until: Instant,
    /// Cause of the latest timeout.
    pub cause: TimeoutCause,
    /// Whether that cause was an image-shift change.
    pub is_image_shift: bool,
}

/// Rolling per-cause timeouts. Each only ever moves later until [`Self::clear`].
#[derive(Clone, Debug, Default)]
pub struct TimeoutTracker {
    latest: [Option<Instant>; 4],
}

impl TimeoutTracker {
    /// No outstanding timeouts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Require waiting until `until` because of `cause`. An earlier time than the
    /// outstanding one for the same cause is ignored and logged.
    pub fn set(&mut self, cause: TimeoutCause, until: Instant) {
        let slot = &mut self.latest[cause.index()];
        match *slot {
            Some(current) if until < current => {
                warn!(
                    "Ignoring {cause} timeout {:?} earlier than the outstanding one.",
                    current - until
                );
            }
            _ => *slot = Some(until),
        }
    }

    /// Require waiting `delay` from `now` because of `cause`.
    pub fn set_after(&mut self, cause: TimeoutCause, now: Instant, delay: Duration) {
        self.set(cause, now + delay);
    }

    /// Image-shift shorthand for [`Self::set_after`].
    pub fn set_image_shift_timeout(&mut self, now: Instant, delay: Duration) {
        self.set_after(TimeoutCause::ImageShift, now, delay);
    }

    /// Outstanding timeout for one cause.
    pub fn latest(&self, cause: TimeoutCause) -> Option<Instant> {
        self.latest[cause.index()]
    }

    /// Latest timeout across all causes. On a tie a non-image-shift cause wins, so
    /// callers applying a shorter image-shift safety factor only do so when image
    /// shift alone is binding.
    pub fn general_timeout(&self) -> Option<GeneralTimeout> {
        TimeoutCause::ALL
            .iter()
            .filter_map(|&cause| self.latest(cause).map(|until| (until, cause)))
            .max_by_key(|&(until, _)| until)
            .map(|(until, cause)| GeneralTimeout {
                until,
                cause,
                is_image_shift: cause == TimeoutCause::ImageShift,
            })
    }

    /// Time left until the general timeout, zero if it has passed.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.general_timeout()
            .map_or(Duration::ZERO, |t| t.until.saturating_duration_since(now))
    }

    /// Drop every outstanding timeout.
    pub fn clear(&mut self) {
        self.latest = [None; 4];
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::propagate::{specimen_to_camera, DerivedTable};
    use crate::scope::{CameraInfo, HitachiScope, MagEntry, ScopeKind, ScopeSetup};
    use crate::store::CalibrationStore;
    use crate::transforms::Optics;

    fn setup(kind: Arc<dyn ScopeKind>) -> (ScopeSetup, CalibrationStore) {
        let setup = ScopeSetup::new(
            kind,
            vec![MagEntry::new(5000., 0.), MagEntry::new(100000., 0.)],
            vec![
                CameraInfo::new("CCD", 5., (2048, 2048)),
                CameraInfo::new("HAADF", 5., (1024, 1024)).with_stem(true),
            ],
        );
        let mut store = CalibrationStore::for_setup(&setup);
        for cam in 0..2 {
            store.set_pixel_size(0, cam, 0.002).unwrap();
            store.set_pixel_size(1, cam, 0.0002).unwrap();
            for (mag, px) in [(0, 0.002), (1, 0.0002)] {
                // one IS unit is one micron on the specimen
                store
                    .add_image_shift_cal(mag, cam, specimen_to_camera(px, 0., false))
                    .unwrap();
            }
        }
        (setup, store)
    }

    #[test]
    fn table_interpolation() {
        let model = DelayModel::default().with_table(vec![(10., 2.), (2., 1.), (5., 0.5)]);
        // sorted and made non-decreasing
        assert_eq!(model.table, vec![(2., 1.), (5., 1.), (10., 2.)]);
        assert_abs_diff_eq!(model.interpolate(1.), 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(model.interpolate(7.5), 1.5, epsilon = 1e-12);
        assert_abs_diff_eq!(model.interpolate(20.), 4., epsilon = 1e-12);
        assert_eq!(DelayModel::default().with_table(Vec::new()).interpolate(3.), 0.);
    }

    #[test]
    fn delay_is_monotonic_in_distance() {
        let (setup, mut store) = setup(Arc::new(crate::scope::FeiScope));
        let derived = DerivedTable::propagate(&setup, &mut store);
        let t = Transforms::new(&setup, &store, &derived, Optics::default());
        let model = DelayModel::default();
        let mut last = Duration::ZERO;
        for i in 0..60 {
            let d = model.delay_for(&t, (0.5 * i as f64, 0.), 0, 0);
            assert!(d >= last);
            last = d;
        }
        assert_abs_diff_eq!(model.delay_for(&t, (5., 0.), 0, 0).as_secs_f64(), 1., epsilon = 1e-9);
    }

    #[test]
    fn small_pixels_and_modes_lengthen_delay() {
        let (setup, mut store) = setup(Arc::new(HitachiScope));
        let derived = DerivedTable::propagate(&setup, &mut store);
        let t = Transforms::new(&setup, &store, &derived, Optics::default());
        let model = DelayModel::default().with_scales(1., 2.);

        // 2 nm pixels: table only, times the vendor settle scale
        let low = model.delay_for(&t, (5., 0.), 0, 0).as_secs_f64();
        assert_abs_diff_eq!(low, 1.5, epsilon = 1e-9);
        // 0.2 nm pixels add log2(5) doublings
        let high = model.delay_for(&t, (5., 0.), 1, 0).as_secs_f64();
        assert_abs_diff_eq!(high, 1.5 * (1. + 0.2 * 5f64.log2()), epsilon = 1e-9);
        let stem = model.delay_for(&t, (5., 0.), 0, 1).as_secs_f64();
        assert_abs_diff_eq!(stem, 3., epsilon = 1e-9);
    }

    #[test]
    fn flat_delay_without_calibration() {
        let setup = ScopeSetup::new(
            Arc::new(crate::scope::FeiScope),
            vec![MagEntry::new(5000., 0.)],
            vec![CameraInfo::new("CCD", 5., (2048, 2048))],
        );
        let mut store = CalibrationStore::for_setup(&setup);
        let derived = DerivedTable::propagate(&setup, &mut store);
        let t = Transforms::new(&setup, &store, &derived, Optics::default());
        let model = DelayModel::default().with_flat_delay(2.5);
        assert_eq!(model.delay_for(&t, (1., 1.), 0, 0), Duration::from_secs_f64(2.5));
        assert!(t.is_to_specimen(0, 0).is_null());
    }

    #[test]
    fn stage_delay() {
        let model = DelayModel::default().with_stage_delay(0.5, 0.01);
        assert_eq!(model.stage_delay_for(-100.), Duration::from_secs_f64(1.5));
    }

    #[test]
    fn timeouts_only_move_later() {
        let now = Instant::now();
        let mut tracker = TimeoutTracker::new();
        assert!(tracker.general_timeout().is_none());
        assert_eq!(tracker.remaining(now), Duration::ZERO);

        tracker.set_image_shift_timeout(now, Duration::from_secs(2));
        tracker.set_after(TimeoutCause::Stage, now, Duration::from_secs(1));
        let general = tracker.general_timeout().unwrap();
        assert_eq!(general.cause, TimeoutCause::ImageShift);
        assert!(general.is_image_shift);

        tracker.set_image_shift_timeout(now, Duration::from_secs(1));
        assert_eq!(tracker.latest(TimeoutCause::ImageShift), Some(now + Duration::from_secs(2)));

        tracker.set_after(TimeoutCause::Tilt, now, Duration::from_secs(3));
        let general = tracker.general_timeout().unwrap();
        assert_eq!(general.cause, TimeoutCause::Tilt);
        assert!(!general.is_image_shift);
        assert_eq!(tracker.remaining(now), Duration::from_secs(3));

        // a tie goes to the non-image-shift cause
        tracker.set_after(TimeoutCause::ImageShift, now, Duration::from_secs(3));
        assert!(!tracker.general_timeout().unwrap().is_image_shift);

        tracker.clear();
        assert!(tracker.general_timeout().is_none());
    }
}
