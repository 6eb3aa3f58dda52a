//! The long-lived session object that owns the calibration tables, the propagated
//! values derived from them, and the shift, timing and alignment machinery.

use std::time::{Duration, Instant};

use log::info;

use crate::autoalign::{align, AlignImage, AlignOptions, AlignResult, ApplyMode};
use crate::coordinator::{
    Coordinator, MoveEvent, MoveToken, ScopeDriver, ShiftOutcome, ShiftPolicy, ShiftRequest,
};
use crate::error::Result;
use crate::matrix::ScaleMat;
use crate::propagate::{CalKind, CalValue, DerivedTable};
use crate::scope::ScopeSetup;
use crate::store::{BeamShiftCal, CalibrationStore, HighFocusCal};
use crate::timing::{DelayModel, GeneralTimeout, TimeoutCause, TimeoutTracker};
use crate::transforms::{Optics, Transforms};
use crate::Pixel;

/// Owner of all session state.
///
/// Every calibration mutation goes through here so that the propagated table is
/// recomputed before the next lookup.
#[derive(Debug)]
pub struct ScopeContext {
    setup: ScopeSetup,
    store: CalibrationStore,
    derived: DerivedTable,
    optics: Optics,
    delays: DelayModel,
    timeouts: TimeoutTracker,
    coordinator: Coordinator,
    nominal_reported: bool,
}

impl ScopeContext {
    /// Start a session from a setup and its loaded calibrations.
    ///
    /// The store is resized to the setup if the persisted tables disagree with it.
    pub fn new(setup: ScopeSetup, store: CalibrationStore) -> Self {
        let mut store = if store.num_mags() == setup.num_mags()
            && store.num_cameras() == setup.num_cameras()
        {
            store
        } else {
            info!(
                "Calibration tables are {}x{}, setup is {}x{}; starting from empty tables.",
                store.num_mags(),
                store.num_cameras(),
                setup.num_mags(),
                setup.num_cameras()
            );
            CalibrationStore::for_setup(&setup)
        };
        let derived = DerivedTable::propagate(&setup, &mut store);
        Self {
            setup,
            store,
            derived,
            optics: Optics::default(),
            delays: DelayModel::default(),
            timeouts: TimeoutTracker::new(),
            coordinator: Coordinator::new(ShiftPolicy::default()),
            nominal_reported: false,
        }
    }

    /// Use a calibrated delay model.
    pub fn with_delay_model(mut self, delays: DelayModel) -> Self {
        self.delays = delays;
        self
    }

    /// Use a shift policy.
    pub fn with_policy(mut self, policy: ShiftPolicy) -> Self {
        self.coordinator.set_policy(policy);
        self
    }

    /// Start with an illumination state.
    pub fn with_optics(mut self, optics: Optics) -> Self {
        self.optics = optics;
        self
    }

    /// Instrument description.
    pub fn setup(&self) -> &ScopeSetup {
        &self.setup
    }

    /// Calibration tables, for saving.
    pub fn store(&self) -> &CalibrationStore {
        &self.store
    }

    /// Propagated values.
    pub fn derived(&self) -> &DerivedTable {
        &self.derived
    }

    /// Delay model in use.
    pub fn delay_model(&self) -> &DelayModel {
        &self.delays
    }

    /// Stage/image-shift coordinator.
    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Mutable access to the coordinator, e.g. to invalidate backlash after tilting.
    pub fn coordinator_mut(&mut self) -> &mut Coordinator {
        &mut self.coordinator
    }

    /// Change the illumination state.
    pub fn set_optics(&mut self, optics: Optics) {
        self.optics = optics;
    }

    /// Coordinate conversions for the current state.
    pub fn transforms(&self) -> Transforms<'_> {
        Transforms::new(&self.setup, &self.store, &self.derived, self.optics)
    }

    /// Best available value of a calibration and its derivation level.
    pub fn resolve(&self, kind: CalKind, mag: usize, camera: usize) -> (CalValue, u32) {
        self.derived.resolve(kind, mag, camera)
    }

    /// Recompute every derived value from the measured ones.
    pub fn repropagate(&mut self) {
        self.derived = DerivedTable::propagate(&self.setup, &mut self.store);
    }

    fn mutate<F>(&mut self, change: F) -> Result<()>
    where
        F: FnOnce(&mut CalibrationStore) -> Result<()>,
    {
        change(&mut self.store)?;
        self.repropagate();
        Ok(())
    }

    /// Record a measured image-shift-to-camera matrix.
    pub fn add_image_shift_cal(
        &mut self,
        mag: usize,
        camera: usize,
        matrix: ScaleMat,
    ) -> Result<()> {
        self.setup.check(mag, camera)?;
        self.mutate(|store| store.add_image_shift_cal(mag, camera, matrix))
    }

    /// Record a measured stage-to-camera matrix.
    pub fn add_stage_cal(&mut self, mag: usize, camera: usize, matrix: ScaleMat) -> Result<()> {
        self.setup.check(mag, camera)?;
        self.mutate(|store| store.add_stage_cal(mag, camera, matrix))
    }

    /// Record a measured pixel size in microns.
    pub fn set_pixel_size(&mut self, mag: usize, camera: usize, pixel_um: f64) -> Result<()> {
        self.setup.check(mag, camera)?;
        self.mutate(|store| store.set_pixel_size(mag, camera, pixel_um))
    }

    /// Record a measured image rotation in degrees.
    pub fn set_rotation(&mut self, mag: usize, camera: usize, degrees: f64) -> Result<()> {
        self.setup.check(mag, camera)?;
        self.mutate(|store| store.set_rotation(mag, camera, degrees))
    }

    /// Forget the measurements at one (mag, camera).
    pub fn invalidate(&mut self, mag: usize, camera: usize) -> Result<()> {
        self.setup.check(mag, camera)?;
        self.mutate(|store| store.invalidate(mag, camera))
    }

    /// Record an image-shift-to-beam-shift calibration.
    pub fn add_beam_shift_cal(&mut self, cal: BeamShiftCal) {
        self.store.add_beam_shift_cal(cal);
    }

    /// Record a high-focus magnification/rotation point.
    pub fn add_high_focus_cal(&mut self, cal: HighFocusCal) {
        self.store.add_high_focus_cal(cal);
    }

    /// Register `a` against the reference `c` without touching the scope.
    pub fn align<P: Pixel, Q: Pixel>(
        &self,
        a: &AlignImage<'_, P>,
        c: &AlignImage<'_, Q>,
        options: &AlignOptions,
    ) -> Result<AlignResult> {
        align(a, c, options)
    }

    /// Register `a` against `c` and cancel the offset as `options.apply` says.
    ///
    /// The images are taken at `mag` on `camera`. Returns the alignment and, unless
    /// the options are output-only, what the coordinator did.
    #[allow(clippy::too_many_arguments)]
    pub fn autoalign<P: Pixel, Q: Pixel>(
        &mut self,
        a: &AlignImage<'_, P>,
        c: &AlignImage<'_, Q>,
        options: &AlignOptions,
        mag: usize,
        camera: usize,
        driver: &mut dyn ScopeDriver,
        now: Instant,
    ) -> Result<(AlignResult, Option<ShiftOutcome>)> {
        let result = align(a, c, options)?;
        let request = ShiftRequest::new((-result.shift.0, -result.shift.1), mag, camera, c.binning);
        let request = match options.apply {
            ApplyMode::None => return Ok((result, None)),
            ApplyMode::ImageShift => request,
            ApplyMode::Stage => request.with_force_stage(true),
        };
        let outcome = self.apply_shift(&request, driver, now)?;
        Ok((result, Some(outcome)))
    }

    /// Move the image with image shift or the stage.
    pub fn apply_shift(
        &mut self,
        request: &ShiftRequest,
        driver: &mut dyn ScopeDriver,
        now: Instant,
    ) -> Result<ShiftOutcome> {
        let transforms = Transforms::new(&self.setup, &self.store, &self.derived, self.optics);
        self.coordinator
            .apply_shift(request, &transforms, &self.delays, &mut self.timeouts, driver, now)
    }

    /// Advance outstanding moves; call from the idle loop.
    pub fn poll(&mut self, now: Instant, driver: &dyn ScopeDriver) -> Vec<MoveEvent> {
        self.coordinator
            .poll(now, driver, &self.delays, &mut self.timeouts)
    }

    /// Run `callback` once when the stage move `token` has settled.
    pub fn on_complete<F>(&mut self, token: MoveToken, callback: F) -> bool
    where
        F: FnOnce(MoveToken) + Send + 'static,
    {
        self.coordinator.on_complete(token, callback)
    }

    /// Settle delay for an image-shift change at (mag, camera).
    pub fn delay_for(&self, is_delta: (f64, f64), mag: usize, camera: usize) -> Duration {
        self.delays.delay_for(&self.transforms(), is_delta, mag, camera)
    }

    /// Require a wait after a change the coordinator did not make, e.g. a tilt.
    pub fn set_timeout(&mut self, cause: TimeoutCause, now: Instant, delay: Duration) {
        self.timeouts.set_after(cause, now, delay);
    }

    /// Latest outstanding timeout across all causes.
    pub fn general_timeout(&self) -> Option<GeneralTimeout> {
        self.timeouts.general_timeout()
    }

    /// Rolling timeouts.
    pub fn timeouts(&self) -> &TimeoutTracker {
        &self.timeouts
    }

    /// Report, once per session, which calibrations came only from the nominal
    /// table. Returns the summary the first time it is non-empty.
    pub fn finish_session(&mut self) -> Option<String> {
        if self.nominal_reported {
            return None;
        }
        let summary = self.derived.nominal_summary()?;
        self.derived.warn_nominal();
        self.nominal_reported = true;
        Some(summary)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use approx::assert_abs_diff_eq;
    use ndarray::Array2;
    use simplelog::{Config, LevelFilter, TestLogger};

    use super::*;
    use crate::coordinator::StageMoveRequest;
    use crate::propagate::specimen_to_camera;
    use crate::scope::{CameraInfo, JeolScope, MagEntry};

    #[derive(Default)]
    struct Scope {
        image_shift: (f64, f64),
        stage: (f64, f64, f64),
    }

    impl ScopeDriver for Scope {
        fn image_shift(&self) -> (f64, f64) {
            self.image_shift
        }

        fn set_image_shift(&mut self, shift: (f64, f64)) -> Result<()> {
            self.image_shift = shift;
            Ok(())
        }

        fn stage_position(&self) -> (f64, f64, f64) {
            self.stage
        }

        fn stage_busy(&self) -> bool {
            false
        }

        fn start_stage_move(&mut self, request: &StageMoveRequest) -> Result<()> {
            self.stage = request.target;
            Ok(())
        }

        fn tilt(&self) -> f64 {
            0.
        }
    }

    fn context() -> ScopeContext {
        let setup = ScopeSetup::new(
            Arc::new(JeolScope),
            vec![
                MagEntry::new(10000., 0.),
                MagEntry::new(20000., 0.),
                MagEntry::new(40000., 0.),
            ],
            vec![CameraInfo::new("CCD", 10., (512, 512))],
        );
        let store = CalibrationStore::for_setup(&setup);
        ScopeContext::new(setup, store)
    }

    fn blob_image(shift: (f64, f64)) -> Array2<f64> {
        let centres = [
            (60., 80.),
            (150., 40.),
            (200., 190.),
            (90., 170.),
            (30., 30.),
            (170., 120.),
        ];
        Array2::from_shape_fn((256, 256), |(y, x)| {
            centres
                .iter()
                .map(|&(cx, cy)| {
                    let d2 = (x as f64 - cx - shift.0).powi(2) + (y as f64 - cy - shift.1).powi(2);
                    (-d2 / 32.).exp()
                })
                .sum()
        })
    }

    #[test]
    fn calibrations_repropagate() {
        let mut ctx = context();
        let (value, level) = ctx.resolve(CalKind::PixelSize, 1, 0);
        assert_eq!(value, CalValue::Scalar(10. / 20000.));
        assert_eq!(level, crate::propagate::NOMINAL_LEVEL);

        ctx.set_pixel_size(0, 0, 0.0012).unwrap();
        let (value, level) = ctx.resolve(CalKind::PixelSize, 1, 0);
        let CalValue::Scalar(px) = value else {
            panic!("expected a scalar");
        };
        assert_abs_diff_eq!(px, 0.0006, epsilon = 1e-12);
        assert!(level > 0 && level < crate::propagate::NOMINAL_LEVEL);
        assert!(ctx.set_pixel_size(7, 0, 0.001).is_err());
    }

    #[test]
    fn nominal_summary_reported_once() {
        let _ = TestLogger::init(LevelFilter::Debug, Config::default());
        let mut ctx = context();
        let summary = ctx.finish_session().unwrap();
        assert!(summary.contains("pixel size"));
        assert!(ctx.finish_session().is_none());
    }

    #[test]
    fn autoalign_cancels_offset_with_image_shift() {
        let mut ctx = context();
        let cal = specimen_to_camera(0.001, 0., false);
        ctx.add_image_shift_cal(1, 0, cal).unwrap();
        let mut scope = Scope::default();
        let now = Instant::now();

        let reference = blob_image((0., 0.));
        let moved = blob_image((8., -4.));
        let options = AlignOptions::default().with_min_overlap(500);
        let (result, outcome) = ctx
            .autoalign(
                &AlignImage::new(moved.view(), 1),
                &AlignImage::new(reference.view(), 1),
                &options,
                1,
                0,
                &mut scope,
                now,
            )
            .unwrap();
        assert_abs_diff_eq!(result.shift.0, 8., epsilon = 0.3);
        assert_abs_diff_eq!(result.shift.1, -4., epsilon = 0.3);
        let Some(ShiftOutcome::Applied { is_delta, .. }) = outcome else {
            panic!("expected an image shift, got {outcome:?}");
        };
        // 1000 pixels per image-shift unit
        assert_abs_diff_eq!(is_delta.0, -0.008, epsilon = 3e-4);
        assert_abs_diff_eq!(is_delta.1, 0.004, epsilon = 3e-4);
        assert_eq!(scope.image_shift, is_delta);
        assert!(ctx.general_timeout().unwrap().is_image_shift);

        let (_, outcome) = ctx
            .autoalign(
                &AlignImage::new(moved.view(), 1),
                &AlignImage::new(reference.view(), 1),
                &options.clone().output_only(),
                1,
                0,
                &mut scope,
                now,
            )
            .unwrap();
        assert!(outcome.is_none());
    }

    #[test]
    fn timeouts_and_delays() {
        let mut ctx = context().with_delay_model(DelayModel::default().with_flat_delay(0.7));
        let now = Instant::now();
        // no image-shift calibration anywhere: flat delay
        assert_eq!(ctx.delay_for((1., 0.), 0, 0), Duration::from_secs_f64(0.7));
        ctx.set_timeout(TimeoutCause::Normalization, now, Duration::from_secs(4));
        let general = ctx.general_timeout().unwrap();
        assert_eq!(general.cause, TimeoutCause::Normalization);
        assert_eq!(ctx.timeouts().remaining(now), Duration::from_secs(4));
        assert!(ctx.poll(now, &Scope::default()).is_empty());
    }
}
