//! 2x2 linear maps between coordinate systems.
//!
//! A [`ScaleMat`] never carries a translation. Translations travel alongside it in
//! pixel or micron units. A matrix whose first coefficient is exactly zero is "null"
//! and stands for "no calibration available".

use std::ops::Mul;

use nalgebra::{Matrix2, Rotation2, Vector2};
use serde::{Deserialize, Serialize};

/// Linear map between two coordinate systems, stored row-major as
/// `[[xpx, xpy], [ypx, ypy]]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScaleMat {
    /// Underlying matrix.
    pub m: Matrix2<f64>,
}

/// Result of [`ScaleMat::decompose`].
///
/// A matrix is rebuilt as
/// `magnification · R(rotation) · R(axis) · diag(stretch, 1/stretch) · R(-axis)`,
/// with an extra `diag(1, -1)` on the right when `mirrored` is set.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Decomposition {
    /// Rotation in degrees, in `(-180, 180]`.
    pub rotation: f64,
    /// Isotropic scale factor.
    pub magnification: f64,
    /// Stretch factor along `stretch_axis`, always `>= 1`.
    pub stretch: f64,
    /// Angle of the stretch axis in degrees.
    pub stretch_axis: f64,
    /// Whether the map reverses handedness.
    pub mirrored: bool,
}

impl Default for ScaleMat {
    fn default() -> Self {
        Self::null()
    }
}

impl ScaleMat {
    /// Create a matrix from its four row-major coefficients.
    pub fn new(xpx: f64, xpy: f64, ypx: f64, ypy: f64) -> Self {
        Self {
            m: Matrix2::new(xpx, xpy, ypx, ypy),
        }
    }

    /// The "no calibration" matrix.
    pub fn null() -> Self {
        Self {
            m: Matrix2::zeros(),
        }
    }

    /// Identity map.
    pub fn identity() -> Self {
        Self {
            m: Matrix2::identity(),
        }
    }

    /// Uniform scaling.
    pub fn scale(factor: f64) -> Self {
        Self::new(factor, 0., 0., factor)
    }

    /// Counterclockwise rotation by `degrees`.
    pub fn rotation(degrees: f64) -> Self {
        Self {
            m: *Rotation2::new(degrees.to_radians()).matrix(),
        }
    }

    /// Rotation followed by uniform scaling.
    pub fn scale_rotate(scale: f64, degrees: f64) -> Self {
        Self {
            m: Self::rotation(degrees).m * scale,
        }
    }

    /// Area-preserving stretch by `stretch` along an axis at `axis_degrees`,
    /// compressing by the same factor perpendicular to it.
    pub fn stretch(stretch: f64, axis_degrees: f64) -> Self {
        let rot = Self::rotation(axis_degrees).m;
        let root = stretch.sqrt();
        let diag = Matrix2::new(root, 0., 0., 1. / root);
        Self {
            m: rot * diag * rot.transpose(),
        }
    }

    /// Matrix negating Y.
    pub fn flip_y() -> Self {
        Self::new(1., 0., 0., -1.)
    }

    /// Whether this matrix means "no calibration".
    pub fn is_null(&self) -> bool {
        self.m[(0, 0)] == 0.
    }

    /// Determinant.
    pub fn determinant(&self) -> f64 {
        self.m.determinant()
    }

    /// Composition `self · other`: `other` is applied first, then `self`.
    ///
    /// The product of anything with a null matrix is null.
    pub fn multiply(&self, other: &ScaleMat) -> ScaleMat {
        if self.is_null() || other.is_null() {
            return Self::null();
        }
        Self {
            m: self.m * other.m,
        }
    }

    /// Inverse map, or a null matrix when `self` is null or singular.
    ///
    /// With `y_axis_inverted`, the coordinates being mapped back arrive with their Y
    /// negated (a left/right-handed pair), so the result is `self⁻¹ · diag(1, -1)`.
    pub fn invert(&self, y_axis_inverted: bool) -> ScaleMat {
        if self.is_null() {
            return Self::null();
        }
        let det = self.determinant();
        if !det.is_finite() || det.abs() <= 1e-14 * self.m.norm_squared() {
            return Self::null();
        }
        match self.m.try_inverse() {
            Some(inv) if y_axis_inverted => Self {
                m: inv * Self::flip_y().m,
            },
            Some(inv) => Self { m: inv },
            None => Self::null(),
        }
    }

    /// Map the vector `(x, y)`.
    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        let v = self.m * Vector2::new(x, y);
        (v.x, v.y)
    }

    /// Map a nalgebra vector.
    pub fn apply_vec(&self, v: &Vector2<f64>) -> Vector2<f64> {
        self.m * v
    }

    /// Split the matrix into rotation, magnification, stretch and stretch axis.
    ///
    /// Returns `None` for null or singular matrices.
    pub fn decompose(&self) -> Option<Decomposition> {
        let det = self.determinant();
        if self.is_null() || det == 0. || !det.is_finite() {
            return None;
        }
        let mirrored = det < 0.;
        let m = if mirrored {
            self.m * Self::flip_y().m
        } else {
            self.m
        };
        let (a, b, c, d) = (m[(0, 0)], m[(0, 1)], m[(1, 0)], m[(1, 1)]);

        // Rotation of the polar factor.
        let sum = a + d;
        let diff = c - b;
        let norm = (sum * sum + diff * diff).sqrt();
        if norm == 0. {
            return None;
        }
        let cos = (sum / norm).clamp(-1., 1.);
        let mut theta = cos.acos();
        if diff < 0. {
            theta = -theta;
        }

        // Symmetric remainder P = R(-theta) · M.
        let p = Rotation2::new(-theta).matrix() * m;
        let magnification = det.abs().sqrt();
        let sp = p[(0, 0)] / magnification;
        let sq = 0.5 * (p[(0, 1)] + p[(1, 0)]) / magnification;
        let sr = p[(1, 1)] / magnification;

        // Eigenvalues of a unit-determinant symmetric matrix solve x^2 - 2tx + 1 = 0.
        let half_trace = 0.5 * (sp + sr);
        let root = (half_trace * half_trace - 1.).max(0.).sqrt();
        let eigen = half_trace + root;
        let axis = if root < 1e-12 {
            0.
        } else {
            0.5 * (2. * sq).atan2(sp - sr)
        };

        let mut rotation = theta.to_degrees();
        if rotation <= -180. {
            rotation += 360.;
        }
        Some(Decomposition {
            rotation,
            magnification,
            stretch: eigen * eigen,
            stretch_axis: axis.to_degrees(),
            mirrored,
        })
    }

    /// Rebuild a matrix from a [`Decomposition`].
    pub fn compose(parts: &Decomposition) -> ScaleMat {
        let base = Self::scale_rotate(parts.magnification, parts.rotation)
            .multiply(&Self::stretch(parts.stretch, parts.stretch_axis));
        if parts.mirrored {
            base.multiply(&Self::flip_y())
        } else {
            base
        }
    }
}

impl Mul for ScaleMat {
    type Output = ScaleMat;

    fn mul(self, rhs: ScaleMat) -> Self::Output {
        self.multiply(&rhs)
    }
}

impl From<Matrix2<f64>> for ScaleMat {
    fn from(m: Matrix2<f64>) -> Self {
        Self { m }
    }
}

impl From<ScaleMat> for Matrix2<f64> {
    fn from(value: ScaleMat) -> Self {
        value.m
    }
}
