#![warn(missing_docs)]

//! Coordinate transforms, calibration propagation, image autoalignment and settle
//! timing for electron microscope automation. \
//! Nothing in here talks to hardware or parses files. The scope is reached through the
//! [`ScopeDriver`] trait and calibration tables come in and go out as serde-enabled
//! structs.
//!
//! ## Interface
//! The central struct of this library is [`ScopeContext`]. It owns the instrument
//! description ([`ScopeSetup`]), the measured calibrations ([`CalibrationStore`]) and
//! the values propagated from them ([`DerivedTable`]), and routes alignment results
//! and shift requests through the stage/image-shift [`Coordinator`] and the
//! [`DelayModel`]. Parameters are set via `with_*()` functions.
//!
//! Example:
//! ```rust,ignore
//! let mut ctx = ScopeContext::new(setup, store)
//!     .with_policy(ShiftPolicy::default().with_backlash(2., 0.5))
//!     .with_delay_model(DelayModel::default().with_flat_delay(1.5));
//! let options = AlignOptions::default();
//! let (result, outcome) =
//!     ctx.autoalign(&image, &reference, &options, mag, camera, &mut scope, Instant::now())?;
//! ```
//!
//! ## Coordinate systems
//! - Camera: binned pixels of one camera, `(x, y)`. Arrays are indexed `[y, x]`.
//! - Specimen: microns in the sample plane. Every other system is related to the
//!   camera through it.
//! - Image shift: scope deflector units.
//! - Stage: microns of stage travel, foreshortened in Y by tilt.
//! - Display: camera pixels scaled by a display binning, Y flipped on inverted cameras.
//!
//! [`ScaleMat`] maps between any two of these. A null matrix means the map is not
//! known; [`Transforms`] returns one instead of failing.
//!
//! ## Calibration propagation
//! Each (mag, camera) lacking a measurement takes its pixel size, rotation, image-shift
//! and stage matrix from the least-derived source: the same camera at other mags, other
//! compatible cameras at the same mag, any camera at a nearby mag, then the nominal mag
//! table. Image-shift matrices never cross registered image-shift boundaries, and no
//! calibration crosses the LM/M split. See [`propagate`].
//!
//! ## Parameters
//! Alignment ([`AlignOptions`]):
//! - `target_size`: Longest side the images are binned down to before correlating.
//! - `max_peaks`: Number of correlation peaks scored by their correlation coefficient.
//! - `sigma1`, `radius2`, `sigma2`: Band-pass filter in cycles per working pixel.
//! - `min_overlap_pixels`, `min_ccc`: Floors below which a peak is not accepted.
//!
//! With the `parallel` feature (on by default), FFT row passes and peak scoring use rayon.

pub mod autoalign;
pub mod context;
pub mod coordinator;
pub(crate) mod correlation;
pub mod error;
pub mod matrix;
pub(crate) mod ndarray_utils;
pub mod propagate;
pub mod scope;
pub mod store;
pub mod timing;
pub mod transforms;

pub use autoalign::{
    align, AlignImage, AlignOptions, AlignResult, AlignmentPeak, ApplyMode, ConicalTilt, PadMode,
    Trim,
};
pub use context::ScopeContext;
pub use coordinator::{
    BacklashState, Coordinator, MoveEvent, MoveToken, ScopeDriver, ShiftOutcome, ShiftPolicy,
    ShiftRequest, ShiftState, StageAxes, StageMoveRequest,
};
pub use error::{Error, Result};
pub use matrix::{Decomposition, ScaleMat};
pub use propagate::{CalKind, CalValue, DerivedTable, Resolved, Tier};
pub use scope::{CameraInfo, FeiScope, HitachiScope, JeolScope, MagEntry, ScopeKind, ScopeSetup};
pub use store::{
    BeamShiftCal, BeamShiftMagKey, CalibrationStore, HighFocusCal, MagCalEntry, ProbeMode,
};
pub use timing::{DelayModel, GeneralTimeout, TimeoutCause, TimeoutTracker};
pub use transforms::{Optics, Transforms};

/// A pixel type the alignment code can read.
///
/// This trait is automatically implemented for all types implementing the supertraits.
/// Particularly, this includes the integer types cameras deliver and `f32`/`f64`.
pub trait Pixel: Copy + Send + Sync + num_traits::ToPrimitive {}

impl<P> Pixel for P where P: Copy + Send + Sync + num_traits::ToPrimitive {}
