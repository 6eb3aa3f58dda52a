//! Conversions between camera, specimen, image-shift, stage and display coordinates.
//!
//! A [`Transforms`] borrows the session's tables and derives every map from the
//! propagated values, so it never fails: anything that cannot be resolved comes back
//! as a null [`ScaleMat`]. Camera-side maps take a binning and work in binned pixels.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::matrix::ScaleMat;
use crate::propagate::{specimen_to_camera, CalKind, DerivedTable};
use crate::scope::ScopeSetup;
use crate::store::{CalibrationStore, ProbeMode};

/// Illumination state that some calibrations depend on.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Optics {
    /// Spot size.
    pub spot: u32,
    /// Probe mode.
    pub probe: ProbeMode,
    /// Illumination intensity setting.
    pub intensity: f64,
    /// Objective defocus in microns.
    pub defocus: f64,
    /// Alpha setting, if the scope has one.
    pub alpha: Option<i32>,
    /// Whether the beam position is retained across image-shift changes.
    pub retain_beam: bool,
}

impl Default for Optics {
    fn default() -> Self {
        Self {
            spot: 1,
            probe: ProbeMode::Microprobe,
            intensity: 0.,
            defocus: 0.,
            alpha: None,
            retain_beam: false,
        }
    }
}

/// Read-only coordinate conversions for the current calibration state.
#[derive(Clone, Copy, Debug)]
pub struct Transforms<'a> {
    setup: &'a ScopeSetup,
    store: &'a CalibrationStore,
    derived: &'a DerivedTable,
    optics: Optics,
}

fn binned(mat: ScaleMat, binning: usize) -> ScaleMat {
    if binning <= 1 {
        mat
    } else {
        ScaleMat::scale(1. / binning as f64).multiply(&mat)
    }
}

impl<'a> Transforms<'a> {
    /// Build a view over the session tables.
    pub fn new(
        setup: &'a ScopeSetup,
        store: &'a CalibrationStore,
        derived: &'a DerivedTable,
        optics: Optics,
    ) -> Self {
        Self {
            setup,
            store,
            derived,
            optics,
        }
    }

    /// The same view at a different illumination state.
    pub fn with_optics(mut self, optics: Optics) -> Self {
        self.optics = optics;
        self
    }

    /// Illumination state in use.
    pub fn optics(&self) -> &Optics {
        &self.optics
    }

    /// Instrument description behind this view.
    pub fn setup(&self) -> &'a ScopeSetup {
        self.setup
    }

    /// Resolved pixel size in microns, `None` if nothing could be derived.
    pub fn pixel_size(&self, mag: usize, camera: usize) -> Option<f64> {
        self.derived
            .pixel_size(mag, camera)
            .map(|r| r.value)
            .filter(|&px| px > 0.)
    }

    /// Scale-rotation for the current defocus, `None` at standard focus.
    fn high_focus(&self, mag: Option<usize>) -> Option<ScaleMat> {
        let o = &self.optics;
        let (scale, rot) =
            self.store
                .high_focus_adjustment(o.spot, o.probe, o.intensity, o.defocus, mag);
        if scale == 1. && rot == 0. {
            return None;
        }
        Some(ScaleMat::scale_rotate(scale, rot))
    }

    fn focus_adjusted(&self, mat: ScaleMat, mag: Option<usize>) -> ScaleMat {
        match self.high_focus(mag) {
            Some(adjust) => adjust.multiply(&mat),
            None => mat,
        }
    }

    /// Specimen microns to camera pixels.
    pub fn specimen_to_camera(&self, mag: usize, camera: usize, binning: usize) -> ScaleMat {
        if self.setup.check(mag, camera).is_err() {
            return ScaleMat::null();
        }
        let (Some(px), Some(rot)) = (
            self.derived.pixel_size(mag, camera),
            self.derived.rotation(mag, camera),
        ) else {
            return ScaleMat::null();
        };
        let mat = specimen_to_camera(px.value, rot.value, self.setup.cameras[camera].y_inverted);
        binned(self.focus_adjusted(mat, None), binning)
    }

    /// Camera pixels to specimen microns.
    pub fn camera_to_specimen(&self, mag: usize, camera: usize, binning: usize) -> ScaleMat {
        self.specimen_to_camera(mag, camera, binning).invert(false)
    }

    /// Image-shift units to camera pixels.
    pub fn is_to_camera(&self, mag: usize, camera: usize, binning: usize) -> ScaleMat {
        let Some(r) = self.derived.image_shift_matrix(mag, camera) else {
            return ScaleMat::null();
        };
        let adjusted = match self.high_focus(Some(mag)) {
            Some(adjust) => adjust.multiply(&r.value),
            None => self.focus_adjusted(r.value, None),
        };
        binned(adjusted, binning)
    }

    /// Camera pixels to image-shift units.
    pub fn camera_to_is(&self, mag: usize, camera: usize, binning: usize) -> ScaleMat {
        self.is_to_camera(mag, camera, binning).invert(false)
    }

    /// Image-shift units to specimen microns.
    pub fn is_to_specimen(&self, mag: usize, camera: usize) -> ScaleMat {
        self.camera_to_specimen(mag, camera, 1)
            .multiply(&self.is_to_camera(mag, camera, 1))
    }

    /// Specimen microns to image-shift units.
    pub fn specimen_to_is(&self, mag: usize, camera: usize) -> ScaleMat {
        self.is_to_specimen(mag, camera).invert(false)
    }

    /// Stage microns to camera pixels at a tilt angle in degrees.
    ///
    /// Tilt foreshortens stage Y by [`crate::scope::ScopeKind::tilt_factor`].
    pub fn stage_to_camera(
        &self,
        mag: usize,
        camera: usize,
        binning: usize,
        tilt: f64,
    ) -> ScaleMat {
        let Some(r) = self.derived.stage_matrix(mag, camera) else {
            return ScaleMat::null();
        };
        let foreshorten = ScaleMat::new(1., 0., 0., self.setup.kind.tilt_factor(tilt));
        let mat = r.value.multiply(&foreshorten);
        binned(self.focus_adjusted(mat, None), binning)
    }

    /// Camera pixels to stage microns at a tilt angle in degrees.
    pub fn camera_to_stage(
        &self,
        mag: usize,
        camera: usize,
        binning: usize,
        tilt: f64,
    ) -> ScaleMat {
        self.stage_to_camera(mag, camera, binning, tilt).invert(false)
    }

    /// Image-shift units to stage microns: the stage move that reproduces a shift.
    pub fn is_to_stage(&self, mag: usize, camera: usize, tilt: f64) -> ScaleMat {
        self.camera_to_stage(mag, camera, 1, tilt)
            .multiply(&self.is_to_camera(mag, camera, 1))
    }

    /// Image-shift units to beam-shift units for the current illumination.
    pub fn is_to_beam_shift(&self, mag: usize) -> ScaleMat {
        let o = &self.optics;
        self.store
            .beam_shift_cal(self.setup, mag, o.alpha, o.probe, o.retain_beam)
            .map_or(ScaleMat::null(), |c| c.matrix)
    }

    /// Beam-shift units to image-shift units.
    pub fn beam_shift_to_is(&self, mag: usize) -> ScaleMat {
        self.is_to_beam_shift(mag).invert(false)
    }

    /// Camera pixels to display pixels. The display shows the frame binned by
    /// `display_binning` relative to the acquired binning, with Y flipped on cameras
    /// whose Y runs opposite to the specimen.
    pub fn camera_to_display(&self, camera: usize, display_binning: f64) -> ScaleMat {
        let Some(cam) = self.setup.cameras.get(camera) else {
            return ScaleMat::null();
        };
        if display_binning <= 0. {
            return ScaleMat::null();
        }
        let scale = ScaleMat::scale(1. / display_binning);
        if cam.y_inverted {
            ScaleMat::flip_y().multiply(&scale)
        } else {
            scale
        }
    }

    /// Display pixels to camera pixels.
    pub fn display_to_camera(&self, camera: usize, display_binning: f64) -> ScaleMat {
        self.camera_to_display(camera, display_binning).invert(false)
    }

    /// Display pixels to image-shift units, for interactive dragging.
    pub fn display_to_is(
        &self,
        mag: usize,
        camera: usize,
        binning: usize,
        display_binning: f64,
    ) -> ScaleMat {
        self.camera_to_is(mag, camera, binning)
            .multiply(&self.display_to_camera(camera, display_binning))
    }

    /// Specimen-plane length in microns of an image-shift vector, or `None` without a
    /// usable calibration.
    pub fn is_distance_um(&self, mag: usize, camera: usize, is_delta: (f64, f64)) -> Option<f64> {
        let mat = self.is_to_specimen(mag, camera);
        if mat.is_null() {
            return None;
        }
        let (x, y) = mat.apply(is_delta.0, is_delta.1);
        Some(x.hypot(y))
    }

    /// Like [`Self::camera_to_is`], but a missing calibration is an error.
    pub fn require_camera_to_is(
        &self,
        mag: usize,
        camera: usize,
        binning: usize,
    ) -> Result<ScaleMat> {
        self.setup.check(mag, camera)?;
        non_null(self.camera_to_is(mag, camera, binning), CalKind::ImageShift, mag, camera)
    }

    /// Like [`Self::camera_to_stage`], but a missing calibration is an error.
    pub fn require_camera_to_stage(
        &self,
        mag: usize,
        camera: usize,
        binning: usize,
        tilt: f64,
    ) -> Result<ScaleMat> {
        self.setup.check(mag, camera)?;
        non_null(
            self.camera_to_stage(mag, camera, binning, tilt),
            CalKind::Stage,
            mag,
            camera,
        )
    }
}

fn non_null(mat: ScaleMat, kind: CalKind, mag: usize, camera: usize) -> Result<ScaleMat> {
    if mat.is_null() {
        Err(Error::MissingCalibration { kind, mag, camera })
    } else {
        Ok(mat)
    }
}
