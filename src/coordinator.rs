//! Decides whether a requested image displacement is made with image shift or with
//! the stage, and tracks the resulting move until it has settled.
//!
//! Nothing here blocks on hardware. A stage move is started through the
//! [`ScopeDriver`] and then advanced by [`Coordinator::poll`] from the caller's idle
//! loop; when it has stopped and settled, the one-shot callback registered with
//! [`Coordinator::on_complete`] runs and [`MoveEvent::Completed`] is reported.
//! Starting another move first supersedes the outstanding one.

use std::fmt;
use std::time::{Duration, Instant};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::propagate::CalKind;
use crate::timing::{DelayModel, TimeoutCause, TimeoutTracker};
use crate::transforms::Transforms;

/// Hardware collaborator that carries out moves.
pub trait ScopeDriver {
    /// Current image shift in scope units.
    fn image_shift(&self) -> (f64, f64);
    /// Set the image shift.
    fn set_image_shift(&mut self, shift: (f64, f64)) -> Result<()>;
    /// Current stage position `(x, y, z)` in microns.
    fn stage_position(&self) -> (f64, f64, f64);
    /// Whether the stage is still moving.
    fn stage_busy(&self) -> bool;
    /// Start a stage move and return without waiting for it.
    fn start_stage_move(&mut self, request: &StageMoveRequest) -> Result<()>;
    /// Current tilt angle in degrees.
    fn tilt(&self) -> f64;
}

/// When shifts go to the stage and how stage moves are made.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShiftPolicy {
    /// Use the stage when the shift exceeds this fraction of the field; 0 disables.
    pub stage_field_fraction: f64,
    /// Use the stage when the shift exceeds this many specimen microns; 0 disables.
    pub stage_distance_um: f64,
    /// Whether montage overviews are repositioned with the stage.
    pub montage_overview_stage: bool,
    /// Largest image-shift radius on the specimen in the M range, microns; 0 disables.
    pub is_limit_um: f64,
    /// Same as `is_limit_um` for the LM range.
    pub is_limit_um_lm: f64,
    /// Backlash overshoot in microns; 0 disables backlash compensation.
    pub backlash_um: f64,
    /// Relaxation move after backlash, microns.
    pub relax_um: f64,
    /// How far the stage may drift from the last compensated position and keep its
    /// backlash state, microns.
    pub backlash_tolerance_um: f64,
    /// Zero the image shift during stage moves, adding the equivalent stage offset.
    pub zero_image_shift: bool,
}

impl Default for ShiftPolicy {
    fn default() -> Self {
        Self {
            stage_field_fraction: 0.5,
            stage_distance_um: 0.,
            montage_overview_stage: true,
            is_limit_um: 15.,
            is_limit_um_lm: 0.,
            backlash_um: 0.,
            relax_um: 0.,
            backlash_tolerance_um: 0.1,
            zero_image_shift: true,
        }
    }
}

impl ShiftPolicy {
    /// Set the stage thresholds.
    pub fn with_stage_thresholds(mut self, field_fraction: f64, distance_um: f64) -> Self {
        self.stage_field_fraction = field_fraction.max(0.);
        self.stage_distance_um = distance_um.max(0.);
        self
    }

    /// Set the image-shift radius limits for the M and LM ranges.
    pub fn with_is_limits(mut self, regular_um: f64, low_mag_um: f64) -> Self {
        self.is_limit_um = regular_um.max(0.);
        self.is_limit_um_lm = low_mag_um.max(0.);
        self
    }

    /// Enable backlash compensation with an optional relaxation move.
    pub fn with_backlash(mut self, backlash_um: f64, relax_um: f64) -> Self {
        self.backlash_um = backlash_um.abs();
        self.relax_um = relax_um.abs();
        self
    }

    /// Set whether stage moves zero the image shift.
    pub fn with_zero_image_shift(mut self, zero: bool) -> Self {
        self.zero_image_shift = zero;
        self
    }
}

/// A requested displacement of the image.
#[derive(Clone, Copy, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct ShiftRequest {
    /// Displacement in binned camera pixels.
    pub shift: (f64, f64),
    /// Mag index.
    pub mag: usize,
    /// Camera index.
    pub camera: usize,
    /// Binning the shift is expressed in.
    pub binning: usize,
    /// Always use the stage.
    pub force_stage: bool,
    /// A mouse drag is in progress; thresholds are not applied until it ends.
    pub dragging: bool,
    /// The image is a montage overview.
    pub montage_overview: bool,
    /// A small follow-up correction that may be skipped without a calibration.
    pub incremental: bool,
}

impl ShiftRequest {
    /// Request a displacement of `shift` binned pixels on a camera.
    pub fn new(shift: (f64, f64), mag: usize, camera: usize, binning: usize) -> Self {
        Self {
            shift,
            mag,
            camera,
            binning: binning.max(1),
            ..Self::default()
        }
    }

    /// Force a stage move.
    pub fn with_force_stage(mut self, force: bool) -> Self {
        self.force_stage = force;
        self
    }

    /// Mark a drag in progress.
    pub fn with_dragging(mut self, dragging: bool) -> Self {
        self.dragging = dragging;
        self
    }

    /// Mark a montage overview.
    pub fn with_montage_overview(mut self, overview: bool) -> Self {
        self.montage_overview = overview;
        self
    }

    /// Mark as incremental.
    pub fn with_incremental(mut self, incremental: bool) -> Self {
        self.incremental = incremental;
        self
    }
}

/// Stage axes a move drives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageAxes {
    /// X axis.
    pub x: bool,
    /// Y axis.
    pub y: bool,
    /// Z axis.
    pub z: bool,
}

impl StageAxes {
    /// X and Y only.
    pub const XY: StageAxes = StageAxes {
        x: true,
        y: true,
        z: false,
    };
}

/// A stage move as handed to the driver.
///
/// The stage goes to `target + backlash`, then to `target`, then to
/// `target + relax` and back to `target` when `relax` is non-zero.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageMoveRequest {
    /// Final position `(x, y, z)` in microns.
    pub target: (f64, f64, f64),
    /// Overshoot before the final approach, per axis.
    pub backlash: (f64, f64),
    /// Relaxation offset after arriving, per axis.
    pub relax: (f64, f64),
    /// Axes that move.
    pub axes: StageAxes,
}

/// Identifies one stage move.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MoveToken(u64);

impl fmt::Display for MoveToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "move #{}", self.0)
    }
}

/// What [`Coordinator::poll`] reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MoveEvent {
    /// The move stopped and settled; its callback has run.
    Completed(MoveToken),
    /// A newer move replaced this one; its callback was dropped.
    Superseded(MoveToken),
}

/// Result of [`Coordinator::apply_shift`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ShiftOutcome {
    /// The image shift was changed by `is_delta`.
    Applied {
        /// Image-shift change in scope units.
        is_delta: (f64, f64),
        /// Settle delay that was scheduled.
        settle: Duration,
    },
    /// A stage move was started.
    StageMove {
        /// Handle for completion tracking.
        token: MoveToken,
        /// What the driver was asked to do.
        request: StageMoveRequest,
    },
    /// An incremental shift was dropped for lack of a calibration.
    Skipped,
}

/// Where the coordinator is in handling a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ShiftState {
    /// Nothing outstanding.
    #[default]
    Idle,
    /// A request is being decided.
    ShiftRequested,
    /// Image shift was changed.
    ImageShiftApplied,
    /// The stage is moving.
    StageMoveStarted,
    /// Waiting for the optics or the stage to settle.
    Settling,
}

/// Direction the stage last approached from on each axis.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct BacklashState {
    /// Whether the state still describes the stage.
    pub valid: bool,
    /// Final approach direction per axis, `-1`, `0` or `1`.
    pub direction: (i8, i8),
    /// Position the last compensated move ended at.
    pub position: (f64, f64),
}

type Completion = Box<dyn FnOnce(MoveToken) + Send>;

struct PendingMove {
    token: MoveToken,
    distance_um: f64,
    settle_until: Option<Instant>,
    callback: Option<Completion>,
}

/// Stage/image-shift decision and move tracking.
#[derive(Default)]
pub struct Coordinator {
    policy: ShiftPolicy,
    state: ShiftState,
    backlash: BacklashState,
    pending: Option<PendingMove>,
    is_settle_until: Option<Instant>,
    events: Vec<MoveEvent>,
    next_token: u64,
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("policy", &self.policy)
            .field("state", &self.state)
            .field("backlash", &self.backlash)
            .field("pending", &self.pending.as_ref().map(|p| p.token))
            .finish()
    }
}

fn sign(v: f64) -> i8 {
    if v > 0. {
        1
    } else if v < 0. {
        -1
    } else {
        0
    }
}

impl Coordinator {
    /// Coordinator with the given policy and no backlash history.
    pub fn new(policy: ShiftPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    /// Policy in use.
    pub fn policy(&self) -> &ShiftPolicy {
        &self.policy
    }

    /// Replace the policy.
    pub fn set_policy(&mut self, policy: ShiftPolicy) {
        self.policy = policy;
    }

    /// Current state.
    pub fn state(&self) -> ShiftState {
        self.state
    }

    /// Backlash bookkeeping.
    pub fn backlash_state(&self) -> BacklashState {
        self.backlash
    }

    /// Forget the backlash direction, e.g. after tilting or a manual move.
    pub fn invalidate_backlash(&mut self) {
        self.backlash.valid = false;
    }

    /// Outstanding stage move, if any.
    pub fn pending_move(&self) -> Option<MoveToken> {
        self.pending.as_ref().map(|p| p.token)
    }

    /// Register a one-shot callback for when `token` completes. Returns `false` if the
    /// move is no longer outstanding.
    pub fn on_complete<F>(&mut self, token: MoveToken, callback: F) -> bool
    where
        F: FnOnce(MoveToken) + Send + 'static,
    {
        match &mut self.pending {
            Some(p) if p.token == token => {
                p.callback = Some(Box::new(callback));
                true
            }
            _ => false,
        }
    }

    fn wants_stage(&self, request: &ShiftRequest, transforms: &Transforms<'_>) -> bool {
        let policy = &self.policy;
        if request.force_stage || (request.montage_overview && policy.montage_overview_stage) {
            return true;
        }
        if request.dragging {
            return false;
        }
        let (dx, dy) = request.shift;
        if policy.stage_field_fraction > 0. {
            if let Some(cam) = transforms.setup().cameras.get(request.camera) {
                let bin = request.binning.max(1) as f64;
                let (w, h) = (cam.size.0 as f64 / bin, cam.size.1 as f64 / bin);
                let fraction = (dx.abs() / w).max(dy.abs() / h);
                if w > 0. && h > 0. && fraction > policy.stage_field_fraction {
                    return true;
                }
            }
        }
        if policy.stage_distance_um > 0. {
            let spec = transforms.camera_to_specimen(request.mag, request.camera, request.binning);
            if !spec.is_null() {
                let (x, y) = spec.apply(dx, dy);
                if x.hypot(y) > policy.stage_distance_um {
                    return true;
                }
            }
        }
        false
    }

    /// Carry out a requested displacement with image shift or the stage.
    ///
    /// Image-shift branch fails with [`Error::MissingCalibration`] (unless the request
    /// is incremental, which yields [`ShiftOutcome::Skipped`]) or
    /// [`Error::ShiftOutOfRange`]; the stage branch fails with [`Error::StageBusy`] or
    /// [`Error::MissingCalibration`]. On failure the state is left as it was.
    pub fn apply_shift(
        &mut self,
        request: &ShiftRequest,
        transforms: &Transforms<'_>,
        delays: &DelayModel,
        timeouts: &mut TimeoutTracker,
        driver: &mut dyn ScopeDriver,
        now: Instant,
    ) -> Result<ShiftOutcome> {
        transforms.setup().check(request.mag, request.camera)?;
        let previous = self.state;
        self.state = ShiftState::ShiftRequested;
        let result = if self.wants_stage(request, transforms) {
            self.stage_branch(request, transforms, driver)
        } else {
            self.image_shift_branch(request, transforms, delays, timeouts, driver, now)
        };
        if matches!(result, Err(_) | Ok(ShiftOutcome::Skipped)) {
            self.state = previous;
        }
        result
    }

    fn image_shift_branch(
        &mut self,
        request: &ShiftRequest,
        transforms: &Transforms<'_>,
        delays: &DelayModel,
        timeouts: &mut TimeoutTracker,
        driver: &mut dyn ScopeDriver,
        now: Instant,
    ) -> Result<ShiftOutcome> {
        let (mag, camera) = (request.mag, request.camera);
        let to_is = transforms.camera_to_is(mag, camera, request.binning);
        if to_is.is_null() {
            if request.incremental {
                debug!("Skipping incremental shift at mag {mag}: no image-shift calibration.");
                return Ok(ShiftOutcome::Skipped);
            }
            return Err(Error::MissingCalibration {
                kind: CalKind::ImageShift,
                mag,
                camera,
            });
        }
        let is_delta = to_is.apply(request.shift.0, request.shift.1);
        let current = driver.image_shift();
        let target = (current.0 + is_delta.0, current.1 + is_delta.1);

        let limit_um = if transforms.setup().is_low_mag(mag) {
            self.policy.is_limit_um_lm
        } else {
            self.policy.is_limit_um
        };
        if limit_um > 0. {
            if let Some(requested_um) = transforms.is_distance_um(mag, camera, target) {
                if requested_um > limit_um {
                    return Err(Error::ShiftOutOfRange {
                        requested_um,
                        limit_um,
                    });
                }
            }
        }

        driver.set_image_shift(target)?;
        self.state = ShiftState::ImageShiftApplied;
        let settle = delays.delay_for(transforms, is_delta, mag, camera);
        timeouts.set_image_shift_timeout(now, settle);
        self.is_settle_until = Some(now + settle);
        self.state = ShiftState::Settling;
        Ok(ShiftOutcome::Applied { is_delta, settle })
    }

    /// Backlash and relaxation offsets for moving one axis by `delta`, and the
    /// approach direction afterwards.
    fn axis_backlash(&self, axis: usize, delta: f64, at_last_position: bool) -> (f64, f64, i8) {
        let amount = self.policy.backlash_um;
        let s = sign(delta);
        let last = if axis == 0 {
            self.backlash.direction.0
        } else {
            self.backlash.direction.1
        };
        if amount <= 0. || s == 0 {
            return (0., 0., last);
        }
        if self.backlash.valid && at_last_position && last == s {
            return (0., 0., last);
        }
        let offset = f64::from(s) * amount;
        let relax = f64::from(s) * self.policy.relax_um;
        (offset, relax, -s)
    }

    fn stage_branch(
        &mut self,
        request: &ShiftRequest,
        transforms: &Transforms<'_>,
        driver: &mut dyn ScopeDriver,
    ) -> Result<ShiftOutcome> {
        if driver.stage_busy() {
            return Err(Error::StageBusy);
        }
        let (mag, camera) = (request.mag, request.camera);
        let tilt = driver.tilt();
        let to_stage = transforms.require_camera_to_stage(mag, camera, request.binning, tilt)?;
        let (mut dx, mut dy) = to_stage.apply(request.shift.0, request.shift.1);

        let current_is = driver.image_shift();
        let mut zeroed = false;
        if self.policy.zero_image_shift && (current_is.0 != 0. || current_is.1 != 0.) {
            let is_to_stage = transforms.is_to_stage(mag, camera, tilt);
            if !is_to_stage.is_null() {
                let (sx, sy) = is_to_stage.apply(current_is.0, current_is.1);
                dx += sx;
                dy += sy;
                driver.set_image_shift((0., 0.))?;
                zeroed = true;
            }
        }

        let (x, y, z) = driver.stage_position();
        let target = (x + dx, y + dy, z);
        let tol = self.policy.backlash_tolerance_um;
        let at_last = (x - self.backlash.position.0).abs() <= tol
            && (y - self.backlash.position.1).abs() <= tol;
        let (bx, rx, dir_x) = self.axis_backlash(0, dx, at_last);
        let (by, ry, dir_y) = self.axis_backlash(1, dy, at_last);
        let move_request = StageMoveRequest {
            target,
            backlash: (bx, by),
            relax: (rx, ry),
            axes: StageAxes::XY,
        };
        if let Err(err) = driver.start_stage_move(&move_request) {
            // the image shift was folded into a move that never started
            if zeroed {
                driver.set_image_shift(current_is)?;
            }
            return Err(err);
        }

        self.backlash = if self.policy.backlash_um > 0. {
            BacklashState {
                valid: true,
                direction: (dir_x, dir_y),
                position: (target.0, target.1),
            }
        } else {
            BacklashState::default()
        };

        if let Some(old) = self.pending.take() {
            info!("Stage {} superseded before completing.", old.token);
            self.events.push(MoveEvent::Superseded(old.token));
        }
        self.next_token += 1;
        let token = MoveToken(self.next_token);
        self.pending = Some(PendingMove {
            token,
            distance_um: dx.hypot(dy),
            settle_until: None,
            callback: None,
        });
        self.state = ShiftState::StageMoveStarted;
        debug!(
            "Started stage {token} by ({dx:.3}, {dy:.3}) um, backlash ({bx:.2}, {by:.2})."
        );
        Ok(ShiftOutcome::StageMove {
            token,
            request: move_request,
        })
    }

    /// Advance outstanding moves. Call from the idle loop.
    pub fn poll(
        &mut self,
        now: Instant,
        driver: &dyn ScopeDriver,
        delays: &DelayModel,
        timeouts: &mut TimeoutTracker,
    ) -> Vec<MoveEvent> {
        let mut events = std::mem::take(&mut self.events);

        if let Some(pending) = &mut self.pending {
            if pending.settle_until.is_none() && !driver.stage_busy() {
                let settle = delays.stage_delay_for(pending.distance_um);
                timeouts.set_after(TimeoutCause::Stage, now, settle);
                pending.settle_until = Some(now + settle);
                self.state = ShiftState::Settling;
            }
            if pending.settle_until.is_some_and(|until| now >= until) {
                if let Some(done) = self.pending.take() {
                    if let Some(callback) = done.callback {
                        callback(done.token);
                    }
                    events.push(MoveEvent::Completed(done.token));
                }
            }
        }

        if self.is_settle_until.is_some_and(|until| now >= until) {
            self.is_settle_until = None;
        }
        if self.pending.is_none() && self.is_settle_until.is_none() {
            self.state = ShiftState::Idle;
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::propagate::{specimen_to_camera, DerivedTable};
    use crate::scope::{CameraInfo, FeiScope, MagEntry, ScopeSetup};
    use crate::store::CalibrationStore;
    use crate::transforms::Optics;

    #[derive(Default)]
    struct MockScope {
        image_shift: (f64, f64),
        stage: (f64, f64, f64),
        busy: bool,
        refuse_moves: bool,
        moves: Vec<StageMoveRequest>,
    }

    impl ScopeDriver for MockScope {
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
            self.busy
        }

        fn start_stage_move(&mut self, request: &StageMoveRequest) -> Result<()> {
            if self.refuse_moves {
                return Err(Error::StageBusy);
            }
            self.moves.push(*request);
            self.stage = request.target;
            self.busy = true;
            Ok(())
        }

        fn tilt(&self) -> f64 {
            0.
        }
    }

    /// 10 nm pixels on a 1024 camera; one image-shift unit is one micron.
    fn fixture(calibrated: bool) -> (ScopeSetup, CalibrationStore) {
        let setup = ScopeSetup::new(
            Arc::new(FeiScope),
            vec![MagEntry::new(20000., 0.)],
            vec![CameraInfo::new("CCD", 10., (1024, 1024))],
        );
        let mut store = CalibrationStore::for_setup(&setup);
        if calibrated {
            let cal = specimen_to_camera(0.01, 0., false);
            store.add_image_shift_cal(0, 0, cal).unwrap();
            store.add_stage_cal(0, 0, cal).unwrap();
        }
        (setup, store)
    }

    #[test]
    fn small_shift_uses_image_shift() {
        let (setup, mut store) = fixture(true);
        let derived = DerivedTable::propagate(&setup, &mut store);
        let t = Transforms::new(&setup, &store, &derived, Optics::default());
        let delays = DelayModel::default();
        let mut timeouts = TimeoutTracker::new();
        let mut scope = MockScope::default();
        let mut coord = Coordinator::new(ShiftPolicy::default());
        let now = Instant::now();

        let request = ShiftRequest::new((100., -50.), 0, 0, 1);
        let outcome = coord
            .apply_shift(&request, &t, &delays, &mut timeouts, &mut scope, now)
            .unwrap();
        let ShiftOutcome::Applied { is_delta, settle } = outcome else {
            panic!("expected image shift, got {outcome:?}");
        };
        assert_abs_diff_eq!(is_delta.0, 1., epsilon = 1e-9);
        assert_abs_diff_eq!(is_delta.1, -0.5, epsilon = 1e-9);
        assert_eq!(scope.image_shift, is_delta);
        assert!(scope.moves.is_empty());
        assert_eq!(coord.state(), ShiftState::Settling);
        assert!(timeouts.general_timeout().unwrap().is_image_shift);

        assert!(coord.poll(now + settle, &scope, &delays, &mut timeouts).is_empty());
        assert_eq!(coord.state(), ShiftState::Idle);
    }

    #[test]
    fn thresholds_choose_stage() {
        let (setup, mut store) = fixture(true);
        let derived = DerivedTable::propagate(&setup, &mut store);
        let t = Transforms::new(&setup, &store, &derived, Optics::default());
        let delays = DelayModel::default();
        let mut timeouts = TimeoutTracker::new();
        let now = Instant::now();

        // 600 of 1024 pixels is past half the field
        let big = ShiftRequest::new((600., 0.), 0, 0, 1);
        let mut scope = MockScope::default();
        let mut coord = Coordinator::new(ShiftPolicy::default().with_is_limits(0., 0.));
        let outcome = coord
            .apply_shift(&big, &t, &delays, &mut timeouts, &mut scope, now)
            .unwrap();
        assert!(matches!(outcome, ShiftOutcome::StageMove { .. }));

        // not while dragging
        let mut scope = MockScope::default();
        let drag = big.with_dragging(true);
        let outcome = coord
            .apply_shift(&drag, &t, &delays, &mut timeouts, &mut scope, now)
            .unwrap();
        assert!(matches!(outcome, ShiftOutcome::Applied { .. }));

        // absolute distance: 2 um > 1.5 um
        let policy = ShiftPolicy::default().with_stage_thresholds(0., 1.5);
        let mut coord = Coordinator::new(policy);
        let mut scope = MockScope::default();
        let request = ShiftRequest::new((200., 0.), 0, 0, 1);
        let outcome = coord
            .apply_shift(&request, &t, &delays, &mut timeouts, &mut scope, now)
            .unwrap();
        assert!(matches!(outcome, ShiftOutcome::StageMove { .. }));

        let mut scope = MockScope::default();
        let overview = ShiftRequest::new((1., 0.), 0, 0, 1).with_montage_overview(true);
        let outcome = coord
            .apply_shift(&overview, &t, &delays, &mut timeouts, &mut scope, now)
            .unwrap();
        assert!(matches!(outcome, ShiftOutcome::StageMove { .. }));
    }

    #[test]
    fn missing_calibration_and_range() {
        let (setup, mut store) = fixture(false);
        let derived = DerivedTable::propagate(&setup, &mut store);
        let t = Transforms::new(&setup, &store, &derived, Optics::default());
        let delays = DelayModel::default();
        let mut timeouts = TimeoutTracker::new();
        let mut scope = MockScope::default();
        let mut coord = Coordinator::new(ShiftPolicy::default());
        let now = Instant::now();

        let request = ShiftRequest::new((10., 0.), 0, 0, 1);
        let err = coord
            .apply_shift(&request, &t, &delays, &mut timeouts, &mut scope, now)
            .unwrap_err();
        assert!(matches!(err, Error::MissingCalibration { kind: CalKind::ImageShift, .. }));
        assert_eq!(coord.state(), ShiftState::Idle);
        let incremental = request.with_incremental(true);
        let outcome = coord
            .apply_shift(&incremental, &t, &delays, &mut timeouts, &mut scope, now)
            .unwrap();
        assert_eq!(outcome, ShiftOutcome::Skipped);
        // the stage still has its nominal calibration
        let forced = request.with_force_stage(true);
        let outcome = coord
            .apply_shift(&forced, &t, &delays, &mut timeouts, &mut scope, now)
            .unwrap();
        assert!(matches!(outcome, ShiftOutcome::StageMove { .. }));

        let (setup, mut store) = fixture(true);
        let derived = DerivedTable::propagate(&setup, &mut store);
        let t = Transforms::new(&setup, &store, &derived, Optics::default());
        let mut scope = MockScope {
            image_shift: (14., 0.),
            ..MockScope::default()
        };
        let request = ShiftRequest::new((200., 0.), 0, 0, 1);
        let err = coord
            .apply_shift(&request, &t, &delays, &mut timeouts, &mut scope, now)
            .unwrap_err();
        assert!(matches!(err, Error::ShiftOutOfRange { .. }));
        assert_eq!(scope.image_shift, (14., 0.));
    }

    #[test]
    fn refused_stage_move_keeps_image_shift() {
        let (setup, mut store) = fixture(true);
        let derived = DerivedTable::propagate(&setup, &mut store);
        let t = Transforms::new(&setup, &store, &derived, Optics::default());
        let delays = DelayModel::default();
        let mut timeouts = TimeoutTracker::new();
        let mut scope = MockScope {
            image_shift: (0.5, 0.2),
            refuse_moves: true,
            ..MockScope::default()
        };
        let mut coord = Coordinator::new(ShiftPolicy::default().with_backlash(2., 0.));
        let now = Instant::now();

        let request = ShiftRequest::new((100., 0.), 0, 0, 1).with_force_stage(true);
        let err = coord
            .apply_shift(&request, &t, &delays, &mut timeouts, &mut scope, now)
            .unwrap_err();
        assert_eq!(err, Error::StageBusy);
        assert_eq!(scope.image_shift, (0.5, 0.2));
        assert!(scope.moves.is_empty());
        assert_eq!(coord.state(), ShiftState::Idle);
        assert_eq!(coord.pending_move(), None);
        assert!(timeouts.general_timeout().is_none());

        // the backlash history was not touched either
        scope.refuse_moves = false;
        let ShiftOutcome::StageMove { request: sent, .. } = coord
            .apply_shift(&request, &t, &delays, &mut timeouts, &mut scope, now)
            .unwrap()
        else {
            panic!("expected stage move");
        };
        assert_eq!(sent.backlash.0, 2.);
        assert_eq!(scope.image_shift, (0., 0.));
    }

    #[test]
    fn backlash_follows_direction() {
        let (setup, mut store) = fixture(true);
        let derived = DerivedTable::propagate(&setup, &mut store);
        let t = Transforms::new(&setup, &store, &derived, Optics::default());
        let delays = DelayModel::default();
        let mut timeouts = TimeoutTracker::new();
        let now = Instant::now();
        let policy = ShiftPolicy::default().with_backlash(2., 0.5);

        let stage_move = |coord: &mut Coordinator,
                          scope: &mut MockScope,
                          shift: (f64, f64),
                          timeouts: &mut TimeoutTracker| {
            scope.busy = false;
            let request = ShiftRequest::new(shift, 0, 0, 1).with_force_stage(true);
            match coord.apply_shift(&request, &t, &delays, timeouts, scope, now).unwrap() {
                ShiftOutcome::StageMove { request, .. } => request,
                other => panic!("expected stage move, got {other:?}"),
            }
        };

        // approaching from opposite sides with no history
        let mut up = Coordinator::new(policy.clone());
        let mut scope = MockScope::default();
        let plus = stage_move(&mut up, &mut scope, (300., 0.), &mut timeouts);
        let mut down = Coordinator::new(policy.clone());
        let mut scope2 = MockScope::default();
        let minus = stage_move(&mut down, &mut scope2, (-300., 0.), &mut timeouts);
        assert_eq!(plus.backlash.0, 2.);
        assert_eq!(minus.backlash.0, -2.);
        assert_eq!(plus.relax.0, 0.5);
        assert_eq!(plus.backlash.1, 0.);
        assert_abs_diff_eq!(plus.target.0, 3., epsilon = 1e-9);

        // continuing along the last approach direction needs no overshoot
        let follow = stage_move(&mut up, &mut scope, (-100., 0.), &mut timeouts);
        assert_eq!(follow.backlash.0, 0.);
        // reversing does
        let reverse = stage_move(&mut up, &mut scope, (100., 0.), &mut timeouts);
        assert_eq!(reverse.backlash.0, 2.);

        // invalid state always compensates
        up.invalidate_backlash();
        let after = stage_move(&mut up, &mut scope, (-100., 0.), &mut timeouts);
        assert_eq!(after.backlash.0, -2.);
        // a stage moved behind our back is invalid too
        scope.stage.0 += 5.;
        let moved = stage_move(&mut up, &mut scope, (100., 0.), &mut timeouts);
        assert_eq!(moved.backlash.0, 2.);
    }

    #[test]
    fn stage_move_completes_and_supersedes() {
        let (setup, mut store) = fixture(true);
        let derived = DerivedTable::propagate(&setup, &mut store);
        let t = Transforms::new(&setup, &store, &derived, Optics::default());
        let delays = DelayModel::default().with_stage_delay(1., 0.);
        let mut timeouts = TimeoutTracker::new();
        let mut scope = MockScope {
            image_shift: (0.5, 0.),
            ..MockScope::default()
        };
        let mut coord = Coordinator::new(ShiftPolicy::default());
        let now = Instant::now();
        let fired = Arc::new(AtomicUsize::new(0));

        let request = ShiftRequest::new((100., 0.), 0, 0, 1).with_force_stage(true);
        let ShiftOutcome::StageMove { token: first, request: sent } = coord
            .apply_shift(&request, &t, &delays, &mut timeouts, &mut scope, now)
            .unwrap()
        else {
            panic!("expected stage move");
        };
        // 1 um requested plus 0.5 um of zeroed image shift
        assert_abs_diff_eq!(sent.target.0, 1.5, epsilon = 1e-9);
        assert_eq!(scope.image_shift, (0., 0.));
        let counter = fired.clone();
        assert!(coord.on_complete(first, move |_| {
            counter.fetch_add(100, Ordering::SeqCst);
        }));

        // busy stage is rejected outright
        let err = coord
            .apply_shift(&request, &t, &delays, &mut timeouts, &mut scope, now)
            .unwrap_err();
        assert_eq!(err, Error::StageBusy);

        scope.busy = false;
        let ShiftOutcome::StageMove { token: second, .. } = coord
            .apply_shift(&request, &t, &delays, &mut timeouts, &mut scope, now)
            .unwrap()
        else {
            panic!("expected stage move");
        };
        assert!(!coord.on_complete(first, |_| {}));
        let counter = fired.clone();
        coord.on_complete(second, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(coord.state(), ShiftState::StageMoveStarted);

        let events = coord.poll(now, &scope, &delays, &mut timeouts);
        assert_eq!(events, vec![MoveEvent::Superseded(first)]);
        assert_eq!(coord.state(), ShiftState::StageMoveStarted);

        scope.busy = false;
        assert!(coord.poll(now, &scope, &delays, &mut timeouts).is_empty());
        assert_eq!(coord.state(), ShiftState::Settling);
        assert_eq!(timeouts.general_timeout().unwrap().cause, TimeoutCause::Stage);

        let events = coord.poll(now + Duration::from_secs(1), &scope, &delays, &mut timeouts);
        assert_eq!(events, vec![MoveEvent::Completed(second)]);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(coord.state(), ShiftState::Idle);
        assert_eq!(coord.pending_move(), None);
    }
}
