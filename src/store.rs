//! Calibration tables: per-(mag, camera) entries, beam-shift calibrations and
//! high-focus corrections.
//!
//! The store only holds values. Filling the gaps between measured entries is the job
//! of [`crate::propagate`], which writes its derived pixel sizes and rotations back
//! here with a non-zero derivation level.

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::matrix::ScaleMat;
use crate::scope::ScopeSetup;

/// Rotations at or above this value mean "unknown".
pub const UNKNOWN_ROTATION: f64 = 900.;

/// Calibration values for one (mag, camera) pair.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MagCalEntry {
    /// Measured image-shift to camera-pixel matrix, null if none.
    pub is_matrix: ScaleMat,
    /// Measured stage-to-camera matrix at zero tilt, null if none.
    pub stage_matrix: ScaleMat,
    /// Microns per unbinned pixel, 0 if unknown.
    pub pixel_size: f64,
    /// Image rotation in degrees, `>= UNKNOWN_ROTATION` if unknown.
    pub rotation: f64,
    /// Measured rotation change from the previous mag index, `>= UNKNOWN_ROTATION` if unknown.
    pub delta_rotation: f64,
    /// Propagation hops behind `pixel_size`; 0 means measured.
    pub pixel_level: u32,
    /// Propagation hops behind `rotation`; 0 means measured.
    pub rotation_level: u32,
}

impl Default for MagCalEntry {
    fn default() -> Self {
        Self {
            is_matrix: ScaleMat::null(),
            stage_matrix: ScaleMat::null(),
            pixel_size: 0.,
            rotation: UNKNOWN_ROTATION,
            delta_rotation: UNKNOWN_ROTATION,
            pixel_level: 0,
            rotation_level: 0,
        }
    }
}

impl MagCalEntry {
    /// Whether a directly measured pixel size is present.
    pub fn has_measured_pixel(&self) -> bool {
        self.pixel_size > 0. && self.pixel_level == 0
    }

    /// Whether a directly measured rotation is present.
    pub fn has_measured_rotation(&self) -> bool {
        self.rotation < UNKNOWN_ROTATION && self.rotation_level == 0
    }

    /// Whether a measured rotation step to the previous mag is present.
    pub fn has_delta_rotation(&self) -> bool {
        self.delta_rotation < UNKNOWN_ROTATION
    }
}

/// Probe-forming mode of the illumination system.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ProbeMode {
    /// Microprobe (parallel illumination).
    #[default]
    Microprobe,
    /// Nanoprobe (convergent illumination).
    Nanoprobe,
}

/// Which mags a beam-shift calibration applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BeamShiftMagKey {
    /// Measured at one mag index.
    Mag(usize),
    /// Applies to every low-mag index.
    LowMagRange,
    /// Applies to every non-LM index.
    RegularRange,
}

/// Image-shift to beam-shift calibration.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BeamShiftCal {
    /// Mag or range the matrix was measured for.
    pub key: BeamShiftMagKey,
    /// Alpha setting, `None` if the scope has no alpha.
    pub alpha: Option<i32>,
    /// Probe mode of the measurement.
    pub probe: ProbeMode,
    /// Whether the beam position was retained during the measurement.
    pub retain: bool,
    /// Image-shift to beam-shift matrix.
    pub matrix: ScaleMat,
}

/// Magnification and rotation change at a given defocus.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct HighFocusCal {
    /// Spot size.
    pub spot: u32,
    /// Probe mode.
    pub probe: ProbeMode,
    /// Illumination intensity setting.
    pub intensity: f64,
    /// Defocus in microns.
    pub defocus: f64,
    /// Scale relative to standard focus.
    pub scale: f64,
    /// Rotation relative to standard focus, degrees.
    pub rotation: f64,
    /// Mag index for image-shift calibrations, `None` for the specimen-scale variant.
    pub mag: Option<usize>,
}

const INTENSITY_TOLERANCE: f64 = 0.02;
const FOCUS_MATCH: f64 = 0.1;
const STANDARD_FOCUS: f64 = 1.;
const MAX_EXTRAPOLATION: f64 = 1.5;

/// All calibration tables of a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationStore {
    num_mags: usize,
    num_cameras: usize,
    /// Row-major by mag index, then camera.
    entries: Vec<MagCalEntry>,
    beam_shift: Vec<BeamShiftCal>,
    high_focus: Vec<HighFocusCal>,
}

impl CalibrationStore {
    /// All-unknown tables sized for `num_mags` by `num_cameras`.
    pub fn new(num_mags: usize, num_cameras: usize) -> Self {
        Self {
            num_mags,
            num_cameras,
            entries: vec![MagCalEntry::default(); num_mags * num_cameras],
            beam_shift: Vec::new(),
            high_focus: Vec::new(),
        }
    }

    /// Empty tables sized for a setup.
    pub fn for_setup(setup: &ScopeSetup) -> Self {
        Self::new(setup.num_mags(), setup.num_cameras())
    }

    /// Number of mag indices.
    pub fn num_mags(&self) -> usize {
        self.num_mags
    }

    /// Number of cameras.
    pub fn num_cameras(&self) -> usize {
        self.num_cameras
    }

    fn index(&self, mag: usize, camera: usize) -> Result<usize> {
        if mag >= self.num_mags {
            return Err(crate::Error::InvalidMag(mag));
        }
        if camera >= self.num_cameras {
            return Err(crate::Error::InvalidCamera(camera));
        }
        Ok(mag * self.num_cameras + camera)
    }

    /// Entry for a (mag, camera) pair.
    pub fn entry(&self, mag: usize, camera: usize) -> Result<&MagCalEntry> {
        let i = self.index(mag, camera)?;
        Ok(&self.entries[i])
    }

    pub(crate) fn entry_mut(&mut self, mag: usize, camera: usize) -> Result<&mut MagCalEntry> {
        let i = self.index(mag, camera)?;
        Ok(&mut self.entries[i])
    }

    /// Record a measured image-shift to camera matrix.
    pub fn add_image_shift_cal(
        &mut self,
        mag: usize,
        camera: usize,
        matrix: ScaleMat,
    ) -> Result<()> {
        self.entry_mut(mag, camera)?.is_matrix = matrix;
        Ok(())
    }

    /// Record a measured stage-to-camera matrix (zero tilt).
    pub fn add_stage_cal(&mut self, mag: usize, camera: usize, matrix: ScaleMat) -> Result<()> {
        self.entry_mut(mag, camera)?.stage_matrix = matrix;
        Ok(())
    }

    /// Record a measured pixel size in microns.
    pub fn set_pixel_size(&mut self, mag: usize, camera: usize, pixel_um: f64) -> Result<()> {
        let entry = self.entry_mut(mag, camera)?;
        entry.pixel_size = pixel_um;
        entry.pixel_level = 0;
        Ok(())
    }

    /// Record a measured absolute rotation in degrees.
    pub fn set_rotation(&mut self, mag: usize, camera: usize, degrees: f64) -> Result<()> {
        let entry = self.entry_mut(mag, camera)?;
        entry.rotation = degrees;
        entry.rotation_level = 0;
        Ok(())
    }

    /// Record a measured rotation change from mag `mag - 1` to `mag`.
    pub fn set_delta_rotation(&mut self, mag: usize, camera: usize, degrees: f64) -> Result<()> {
        self.entry_mut(mag, camera)?.delta_rotation = degrees;
        Ok(())
    }

    /// Reset an entry to unknown.
    pub fn invalidate(&mut self, mag: usize, camera: usize) -> Result<()> {
        *self.entry_mut(mag, camera)? = MagCalEntry::default();
        Ok(())
    }

    /// Forget all derived pixel sizes and rotations, keeping measured ones.
    pub fn clear_derived(&mut self) {
        for entry in &mut self.entries {
            if entry.pixel_level > 0 {
                entry.pixel_size = 0.;
                entry.pixel_level = 0;
            }
            if entry.rotation_level > 0 {
                entry.rotation = UNKNOWN_ROTATION;
                entry.rotation_level = 0;
            }
        }
    }

    /// Add a beam-shift calibration, replacing one with the same key, alpha, probe and
    /// retain flag.
    pub fn add_beam_shift_cal(&mut self, cal: BeamShiftCal) {
        let same = |c: &&mut BeamShiftCal| {
            (c.key, c.alpha, c.probe, c.retain) == (cal.key, cal.alpha, cal.probe, cal.retain)
        };
        match self.beam_shift.iter_mut().find(same) {
            Some(existing) => *existing = cal,
            None => self.beam_shift.push(cal),
        }
    }

    /// All beam-shift calibrations.
    pub fn beam_shift_cals(&self) -> &[BeamShiftCal] {
        &self.beam_shift
    }

    /// Pick the beam-shift calibration for a mag and illumination state.
    ///
    /// Probe mode must match and alpha must match when both sides specify one. A
    /// matching retain flag is preferred. Among those, an exact mag wins, then the
    /// nearest mag reachable without crossing an image-shift boundary, then a
    /// range-wide entry.
    pub fn beam_shift_cal(
        &self,
        setup: &ScopeSetup,
        mag: usize,
        alpha: Option<i32>,
        probe: ProbeMode,
        retain: bool,
    ) -> Option<&BeamShiftCal> {
        let low_mag = setup.is_low_mag(mag);
        let usable = self.beam_shift.iter().filter(|c| {
            c.probe == probe
                && match (c.alpha, alpha) {
                    (Some(a), Some(b)) => a == b,
                    _ => true,
                }
                && !c.matrix.is_null()
        });

        usable
            .filter_map(|c| {
                let rank = match c.key {
                    BeamShiftMagKey::Mag(m) if m == mag => 0,
                    BeamShiftMagKey::Mag(m) if !setup.crosses_is_boundary(m, mag) => {
                        1 + m.abs_diff(mag)
                    }
                    BeamShiftMagKey::Mag(_) => return None,
                    BeamShiftMagKey::LowMagRange if low_mag => usize::MAX - 1,
                    BeamShiftMagKey::RegularRange if !low_mag => usize::MAX - 1,
                    _ => return None,
                };
                Some((c.retain != retain, rank, c))
            })
            .min_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)))
            .map(|(_, _, c)| c)
    }

    /// Add a high-focus calibration, replacing one at the same spot, probe,
    /// intensity, defocus and mag.
    pub fn add_high_focus_cal(&mut self, cal: HighFocusCal) {
        match self.high_focus.iter_mut().find(|c| {
            c.spot == cal.spot
                && c.probe == cal.probe
                && c.mag == cal.mag
                && intensity_matches(c.intensity, cal.intensity)
                && (c.defocus - cal.defocus).abs() < FOCUS_MATCH
        }) {
            Some(existing) => *existing = cal,
            None => self.high_focus.push(cal),
        }
    }

    /// All high-focus calibrations.
    pub fn high_focus_cals(&self) -> &[HighFocusCal] {
        &self.high_focus
    }

    /// Scale and rotation (degrees) of the image at `defocus` relative to standard
    /// focus. `mag` selects the image-shift variant.
    ///
    /// Returns `(1, 0)` near standard focus or when nothing applies.
    pub fn high_focus_adjustment(
        &self,
        spot: u32,
        probe: ProbeMode,
        intensity: f64,
        defocus: f64,
        mag: Option<usize>,
    ) -> (f64, f64) {
        if defocus.abs() < STANDARD_FOCUS {
            return (1., 0.);
        }
        let candidates = self
            .high_focus
            .iter()
            .filter(|c| c.spot == spot && c.probe == probe && c.mag == mag)
            .collect_vec();

        let Some(nearest) = candidates
            .iter()
            .filter(|c| intensity_matches(c.intensity, intensity))
            .min_by(|a, b| {
                (a.intensity - intensity)
                    .abs()
                    .total_cmp(&(b.intensity - intensity).abs())
            })
            .map(|c| c.intensity)
        else {
            return (1., 0.);
        };

        // Standard focus is an implicit anchor of the curve.
        let mut points = candidates
            .into_iter()
            .filter(|c| intensity_matches(c.intensity, nearest))
            .map(|c| (c.defocus, c.scale, c.rotation))
            .collect_vec();
        if !points.iter().any(|p| p.0.abs() < FOCUS_MATCH) {
            points.push((0., 1., 0.));
        }
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        // one point per focus so no segment is degenerate
        points.dedup_by(|later, kept| (later.0 - kept.0).abs() < FOCUS_MATCH);
        if points.len() < 2 {
            return (1., 0.);
        }

        let first = points[0].0;
        let last = points[points.len() - 1].0;
        let span = (last - first).max(FOCUS_MATCH);
        let focus = defocus.clamp(
            first - (MAX_EXTRAPOLATION - 1.) * span,
            last + (MAX_EXTRAPOLATION - 1.) * span,
        );
        let seg = points
            .iter()
            .tuple_windows()
            .position(|(_, b)| focus <= b.0)
            .unwrap_or(points.len() - 2);
        let (lo, hi) = (points[seg], points[seg + 1]);
        let frac = (focus - lo.0) / (hi.0 - lo.0);
        (
            lo.1 + frac * (hi.1 - lo.1),
            lo.2 + frac * (hi.2 - lo.2),
        )
    }
}

fn intensity_matches(a: f64, b: f64) -> bool {
    let scale = a.abs().max(b.abs());
    scale == 0. || (a - b).abs() <= INTENSITY_TOLERANCE * scale
}
