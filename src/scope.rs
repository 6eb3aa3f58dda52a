//! Static description of the microscope: magnification table, cameras, image-shift
//! boundaries and the vendor-specific geometry behind [`ScopeKind`].

use std::fmt::Debug;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::matrix::ScaleMat;

/// Vendor-specific geometry that the transform and timing code consults instead of
/// branching on a scope type.
pub trait ScopeKind: Debug + Send + Sync {
    /// Short vendor family name, used in log messages.
    fn name(&self) -> &'static str;

    /// Factor by which stage Y motion is foreshortened in the image at `tilt_deg`.
    fn tilt_factor(&self, tilt_deg: f64) -> f64 {
        tilt_deg.to_radians().cos()
    }

    /// Rotation in degrees taking stage axes onto specimen axes.
    fn stage_to_specimen_rotation(&self) -> f64 {
        0.
    }

    /// Whether stage Y runs opposite to specimen Y.
    fn stage_y_inverted(&self) -> bool {
        false
    }

    /// Whether image-shift Y runs opposite to specimen Y in the nominal calibration.
    fn image_shift_y_inverted(&self) -> bool {
        false
    }

    /// Multiplier on image-shift settle delays.
    fn settle_scale(&self) -> f64 {
        1.
    }

    /// Nominal stage-to-specimen map at zero tilt.
    fn stage_to_specimen(&self) -> ScaleMat {
        let rot = ScaleMat::rotation(self.stage_to_specimen_rotation());
        if self.stage_y_inverted() {
            rot.multiply(&ScaleMat::flip_y())
        } else {
            rot
        }
    }
}

/// FEI/Thermo style column: stage axes coincide with specimen axes.
#[derive(Clone, Copy, Debug, Default)]
pub struct FeiScope;

impl ScopeKind for FeiScope {
    fn name(&self) -> &'static str {
        "FEI"
    }
}

/// JEOL style column: stage Y is reversed relative to the specimen frame.
#[derive(Clone, Copy, Debug, Default)]
pub struct JeolScope;

impl ScopeKind for JeolScope {
    fn name(&self) -> &'static str {
        "JEOL"
    }

    fn stage_y_inverted(&self) -> bool {
        true
    }
}

/// Hitachi style column: stage frame rotated a quarter turn, image-shift Y reversed,
/// slower deflector settling.
#[derive(Clone, Copy, Debug, Default)]
pub struct HitachiScope;

impl ScopeKind for HitachiScope {
    fn name(&self) -> &'static str {
        "Hitachi"
    }

    fn stage_to_specimen_rotation(&self) -> f64 {
        90.
    }

    fn image_shift_y_inverted(&self) -> bool {
        true
    }

    fn settle_scale(&self) -> f64 {
        1.5
    }
}

/// One row of the magnification table.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MagEntry {
    /// Nominal magnification reported by the scope.
    pub mag: f64,
    /// Nominal image rotation in degrees.
    pub nominal_rotation: f64,
    /// Whether this mag belongs to the low-mag (LM) range.
    pub low_mag: bool,
}

impl MagEntry {
    /// Create a regular (non-LM) entry.
    pub fn new(mag: f64, nominal_rotation: f64) -> Self {
        Self {
            mag,
            nominal_rotation,
            low_mag: false,
        }
    }

    /// Create a low-mag entry.
    pub fn low_mag(mag: f64, nominal_rotation: f64) -> Self {
        Self {
            mag,
            nominal_rotation,
            low_mag: true,
        }
    }
}

/// Static camera properties.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraInfo {
    /// Display name.
    pub name: String,
    /// Physical pixel size in microns.
    pub pixel_um: f64,
    /// Extra magnification between the scope's nominal mag and this camera.
    pub mag_factor: f64,
    /// Nominal rotation of this camera relative to the mag table, in degrees.
    pub rotation_offset: f64,
    /// Whether image Y runs opposite to specimen Y on this camera.
    pub y_inverted: bool,
    /// Whether the camera sits behind an energy filter.
    pub energy_filter: bool,
    /// Whether this is a scanning (STEM) detector.
    pub stem: bool,
    /// Unbinned frame size `(width, height)`.
    pub size: (usize, usize),
    /// Inclusive mag-index range this camera is usable in, if limited.
    pub mag_range: Option<(usize, usize)>,
}

impl CameraInfo {
    /// Camera with unit mag factor and no limits.
    pub fn new(name: impl Into<String>, pixel_um: f64, size: (usize, usize)) -> Self {
        Self {
            name: name.into(),
            pixel_um,
            mag_factor: 1.,
            rotation_offset: 0.,
            y_inverted: false,
            energy_filter: false,
            stem: false,
            size,
            mag_range: None,
        }
    }

    /// Set the extra magnification factor.
    pub fn with_mag_factor(mut self, factor: f64) -> Self {
        self.mag_factor = factor;
        self
    }

    /// Set the rotation offset in degrees.
    pub fn with_rotation_offset(mut self, degrees: f64) -> Self {
        self.rotation_offset = degrees;
        self
    }

    /// Mark Y as inverted.
    pub fn with_y_inverted(mut self, inverted: bool) -> Self {
        self.y_inverted = inverted;
        self
    }

    /// Mark the camera as energy-filtered.
    pub fn with_energy_filter(mut self, filtered: bool) -> Self {
        self.energy_filter = filtered;
        self
    }

    /// Mark the camera as a STEM detector.
    pub fn with_stem(mut self, stem: bool) -> Self {
        self.stem = stem;
        self
    }

    /// Limit the usable mag-index range.
    pub fn with_mag_range(mut self, first: usize, last: usize) -> Self {
        self.mag_range = Some((first, last));
        self
    }
}

/// Everything about the instrument that does not change during a session.
#[derive(Clone, Debug)]
pub struct ScopeSetup {
    /// Vendor geometry.
    pub kind: Arc<dyn ScopeKind>,
    /// Magnification table, indexed by mag index.
    pub mags: Vec<MagEntry>,
    /// Cameras, indexed by camera number.
    pub cameras: Vec<CameraInfo>,
    /// Mag indices `b` such that image-shift calibrations do not transfer between
    /// `b - 1` and `b`.
    pub is_boundaries: Vec<usize>,
    /// Nominal specimen microns per image-shift unit in the LM range.
    pub nominal_is_um_lm: f64,
    /// Same as `nominal_is_um_lm` for the regular range.
    pub nominal_is_um: f64,
}

impl ScopeSetup {
    /// Create a setup without boundaries or nominal image-shift scales.
    pub fn new(kind: Arc<dyn ScopeKind>, mags: Vec<MagEntry>, cameras: Vec<CameraInfo>) -> Self {
        Self {
            kind,
            mags,
            cameras,
            is_boundaries: Vec::new(),
            nominal_is_um_lm: 0.,
            nominal_is_um: 0.,
        }
    }

    /// Register an image-shift boundary below mag index `mag`.
    pub fn with_is_boundary(mut self, mag: usize) -> Self {
        if !self.is_boundaries.contains(&mag) {
            self.is_boundaries.push(mag);
            self.is_boundaries.sort_unstable();
        }
        self
    }

    /// Set the nominal image-shift scales used when nothing is calibrated.
    pub fn with_nominal_image_shift(mut self, low_mag_um: f64, regular_um: f64) -> Self {
        self.nominal_is_um_lm = low_mag_um;
        self.nominal_is_um = regular_um;
        self
    }

    /// Number of mag-table entries.
    pub fn num_mags(&self) -> usize {
        self.mags.len()
    }

    /// Number of cameras.
    pub fn num_cameras(&self) -> usize {
        self.cameras.len()
    }

    /// Validate a (mag, camera) pair.
    pub fn check(&self, mag: usize, camera: usize) -> Result<()> {
        if mag >= self.mags.len() {
            return Err(Error::InvalidMag(mag));
        }
        if camera >= self.cameras.len() {
            return Err(Error::InvalidCamera(camera));
        }
        Ok(())
    }

    /// Whether `mag` is a low-mag index.
    pub fn is_low_mag(&self, mag: usize) -> bool {
        self.mags.get(mag).is_some_and(|m| m.low_mag)
    }

    /// Whether two mags are in the same LM/M range.
    pub fn same_range(&self, a: usize, b: usize) -> bool {
        self.is_low_mag(a) == self.is_low_mag(b)
    }

    /// Whether an image-shift boundary (or the LM/M split) lies between two mags.
    pub fn crosses_is_boundary(&self, a: usize, b: usize) -> bool {
        if !self.same_range(a, b) {
            return true;
        }
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        self.is_boundaries.iter().any(|&bd| bd > lo && bd <= hi)
    }

    /// Whether `camera` can be used at `mag`.
    pub fn camera_usable(&self, camera: usize, mag: usize) -> bool {
        match self.cameras.get(camera).and_then(|c| c.mag_range) {
            Some((first, last)) => mag >= first && mag <= last,
            None => camera < self.cameras.len(),
        }
    }

    /// Whether two cameras may exchange calibrations: both or neither energy-filtered.
    pub fn cameras_compatible(&self, a: usize, b: usize) -> bool {
        match (self.cameras.get(a), self.cameras.get(b)) {
            (Some(ca), Some(cb)) => ca.energy_filter == cb.energy_filter && ca.stem == cb.stem,
            _ => false,
        }
    }

    /// Effective nominal magnification at the camera.
    pub fn camera_mag(&self, mag: usize, camera: usize) -> f64 {
        self.mags[mag].mag * self.cameras[camera].mag_factor
    }

    /// Pixel size in microns implied by the nominal magnification.
    pub fn nominal_pixel_size(&self, mag: usize, camera: usize) -> f64 {
        let cam_mag = self.camera_mag(mag, camera);
        if cam_mag <= 0. {
            return 0.;
        }
        self.cameras[camera].pixel_um / cam_mag
    }

    /// Image rotation in degrees implied by the mag table and camera offset.
    pub fn nominal_rotation(&self, mag: usize, camera: usize) -> f64 {
        self.mags[mag].nominal_rotation + self.cameras[camera].rotation_offset
    }

    /// Nominal specimen microns per image-shift unit at `mag`, or 0 if unknown.
    pub fn nominal_is_um(&self, mag: usize) -> f64 {
        if self.is_low_mag(mag) {
            self.nominal_is_um_lm
        } else {
            self.nominal_is_um
        }
    }
}
