//! Error type shared by the whole crate.

use crate::propagate::CalKind;

/// Errors returned by transform, alignment and shift operations.
///
/// Missing or singular calibrations surface as [`Error::MissingCalibration`];
/// alignment failures that are optical rather than configurational surface as
/// [`Error::NoValidPeak`].
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// No usable calibration of the given kind.
    #[error("no {kind} calibration available for mag index {mag} on camera {camera}")]
    MissingCalibration {
        /// Which calibration was needed.
        kind: CalKind,
        /// Mag index of the request.
        mag: usize,
        /// Camera index of the request.
        camera: usize,
    },
    /// The resulting image shift would leave the allowed specimen-plane radius.
    #[error("image shift of {requested_um:.2} um exceeds the allowed {limit_um:.2} um")]
    ShiftOutOfRange {
        /// Specimen-plane distance that was requested.
        requested_um: f64,
        /// Allowed radius at this mag.
        limit_um: f64,
    },
    /// Autoalignment found no correlation peak passing the overlap and strength floors.
    #[error("no valid correlation peak (best ccc {best_ccc:.3} over {overlap_pixels} pixels)")]
    NoValidPeak {
        /// Best unweighted coefficient seen among rejected candidates.
        best_ccc: f64,
        /// Overlap of that candidate in working pixels.
        overlap_pixels: usize,
    },
    /// The stage reported busy when a move was requested.
    #[error("stage is busy")]
    StageBusy,
    /// Mag index outside the magnification table.
    #[error("mag index {0} is not in the magnification table")]
    InvalidMag(usize),
    /// Camera index outside the camera list.
    #[error("camera index {0} is not configured")]
    InvalidCamera(usize),
    /// An image is too small to correlate.
    #[error("image of {width}x{height} is too small to align")]
    ImageTooSmall {
        /// Width in pixels.
        width: usize,
        /// Height in pixels.
        height: usize,
    },
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
