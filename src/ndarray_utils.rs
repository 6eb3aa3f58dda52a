//! Array helpers shared by the correlation and alignment code: pixel conversion,
//! box binning, resampling through a [`ScaleMat`], and region statistics.
//!
//! Arrays are indexed `[y, x]`; every public coordinate in this crate is `(x, y)`.

use ndarray::{s, Array2, ArrayView2, Zip};

use crate::matrix::ScaleMat;
use crate::Pixel;

/// Copy any pixel type into a float plane. Values that do not convert become 0.
pub(crate) fn to_f64<P: Pixel>(view: ArrayView2<'_, P>) -> Array2<f64> {
    view.mapv(|p| p.to_f64().filter(|v| v.is_finite()).unwrap_or(0.))
}

/// Average `factor` x `factor` blocks, dropping incomplete blocks at the edges.
pub(crate) fn bin(arr: ArrayView2<'_, f64>, factor: usize) -> Array2<f64> {
    if factor <= 1 {
        return arr.to_owned();
    }
    let (ny, nx) = arr.dim();
    let (by, bx) = (ny / factor, nx / factor);
    let norm = (factor * factor) as f64;
    Array2::from_shape_fn((by, bx), |(y, x)| {
        arr.slice(s![y * factor..(y + 1) * factor, x * factor..(x + 1) * factor])
            .sum()
            / norm
    })
}

/// Mean and standard deviation, `(0, 0)` for an empty view.
pub(crate) fn mean_sd(arr: ArrayView2<'_, f64>) -> (f64, f64) {
    let n = arr.len();
    if n == 0 {
        return (0., 0.);
    }
    let mean = arr.sum() / n as f64;
    let var = arr.fold(0., |acc, v| acc + (v - mean) * (v - mean)) / n as f64;
    (mean, var.sqrt())
}

/// Bilinear sample at `(x, y)`, `None` outside the array.
pub(crate) fn bilinear(arr: ArrayView2<'_, f64>, x: f64, y: f64) -> Option<f64> {
    let (ny, nx) = arr.dim();
    if nx == 0 || ny == 0 || !(x >= 0. && y >= 0.) {
        return None;
    }
    let (xmax, ymax) = ((nx - 1) as f64, (ny - 1) as f64);
    if x > xmax || y > ymax {
        return None;
    }
    let (x0, y0) = (x.floor() as usize, y.floor() as usize);
    let (x1, y1) = ((x0 + 1).min(nx - 1), (y0 + 1).min(ny - 1));
    let (fx, fy) = (x - x0 as f64, y - y0 as f64);
    let top = arr[[y0, x0]] * (1. - fx) + arr[[y0, x1]] * fx;
    let bottom = arr[[y1, x0]] * (1. - fx) + arr[[y1, x1]] * fx;
    Some(top * (1. - fy) + bottom * fy)
}

/// Resample `arr` so that a feature at offset `p` from the input centre lands at
/// `forward · p` from the output centre. Uncovered pixels get the input mean.
///
/// Returns `None` if `forward` cannot be inverted.
pub(crate) fn warp(
    arr: ArrayView2<'_, f64>,
    forward: &ScaleMat,
    shape: (usize, usize),
) -> Option<Array2<f64>> {
    let inverse = forward.invert(false);
    if inverse.is_null() {
        return None;
    }
    let (mean, _) = mean_sd(arr);
    let (ny, nx) = arr.dim();
    let (cx_in, cy_in) = ((nx as f64 - 1.) / 2., (ny as f64 - 1.) / 2.);
    let (cx_out, cy_out) = ((shape.1 as f64 - 1.) / 2., (shape.0 as f64 - 1.) / 2.);
    Some(Array2::from_shape_fn(shape, |(y, x)| {
        let (dx, dy) = inverse.apply(x as f64 - cx_out, y as f64 - cy_out);
        bilinear(arr, cx_in + dx, cy_in + dy).unwrap_or(mean)
    }))
}

/// Rescale by a non-integer factor `< 1` (or box-bin when `1 / factor` is whole).
pub(crate) fn reduce(arr: ArrayView2<'_, f64>, factor: f64) -> Array2<f64> {
    let inv = 1. / factor;
    if (inv - inv.round()).abs() < 1e-9 {
        return bin(arr, inv.round() as usize);
    }
    let (ny, nx) = arr.dim();
    let shape = (
        ((ny as f64) * factor).floor() as usize,
        ((nx as f64) * factor).floor() as usize,
    );
    warp(arr, &ScaleMat::scale(factor), shape).unwrap_or_else(|| Array2::zeros(shape))
}

/// Pearson correlation over two equally shaped views, and the number of pixels.
pub(crate) fn pearson(a: ArrayView2<'_, f64>, b: ArrayView2<'_, f64>) -> (f64, usize) {
    let n = a.len();
    if n < 2 || a.dim() != b.dim() {
        return (0., 0);
    }
    let (ma, _) = mean_sd(a);
    let (mb, _) = mean_sd(b);
    let (mut sab, mut saa, mut sbb) = (0., 0., 0.);
    Zip::from(&a).and(&b).for_each(|&va, &vb| {
        let (da, db) = (va - ma, vb - mb);
        sab += da * db;
        saa += da * da;
        sbb += db * db;
    });
    if saa <= 0. || sbb <= 0. {
        return (0., n);
    }
    (sab / (saa * sbb).sqrt(), n)
}

/// Inclusive-exclusive pixel rectangle `[x0, x1) x [y0, y1)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Rect {
    pub x0: usize,
    pub y0: usize,
    pub x1: usize,
    pub y1: usize,
}

impl Rect {
    pub fn full(shape: (usize, usize)) -> Self {
        Self {
            x0: 0,
            y0: 0,
            x1: shape.1,
            y1: shape.0,
        }
    }

    pub fn width(&self) -> usize {
        self.x1.saturating_sub(self.x0)
    }

    pub fn height(&self) -> usize {
        self.y1.saturating_sub(self.y0)
    }

    pub fn area(&self) -> usize {
        self.width() * self.height()
    }

    pub fn intersect(&self, other: &Rect) -> Rect {
        Rect {
            x0: self.x0.max(other.x0),
            y0: self.y0.max(other.y0),
            x1: self.x1.min(other.x1).max(self.x0.max(other.x0)),
            y1: self.y1.min(other.y1).max(self.y0.max(other.y0)),
        }
    }

    pub fn view<'a>(&self, arr: &'a Array2<f64>) -> ArrayView2<'a, f64> {
        arr.slice(s![self.y0..self.y1, self.x0..self.x1])
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    use super::*;

    #[test]
    fn box_binning() {
        let arr = array![[1., 3., 5., 7., 9.], [1., 3., 5., 7., 9.], [0., 0., 0., 0., 0.]];
        assert_eq!(bin(arr.view(), 2), array![[2., 6.]]);
        assert_eq!(bin(arr.view(), 1), arr);
    }

    #[test]
    fn integer_pixels_convert() {
        let arr = array![[1u16, 2], [65535, 0]];
        assert_eq!(to_f64(arr.view()), array![[1., 2.], [65535., 0.]]);
        let arr = array![[f32::NAN, 2.5]];
        assert_eq!(to_f64(arr.view()), array![[0., 2.5]]);
    }

    #[test]
    fn warp_moves_features() {
        let mut arr = Array2::<f64>::zeros((21, 21));
        arr[[10, 14]] = 1.;
        // a quarter turn takes the offset (4, 0) from the centre to (0, 4)
        let out = warp(arr.view(), &ScaleMat::rotation(90.), (21, 21)).unwrap();
        assert_abs_diff_eq!(out[[14, 10]], 1., epsilon = 1e-9);
        assert!(warp(arr.view(), &ScaleMat::null(), (21, 21)).is_none());
    }

    #[test]
    fn pearson_of_affine_copy() {
        let a = array![[1., 2., 3.], [4., 5., 7.]];
        let b = a.mapv(|v| 3. * v - 1.);
        let (r, n) = pearson(a.view(), b.view());
        assert_abs_diff_eq!(r, 1., epsilon = 1e-12);
        assert_eq!(n, 6);
        let flat = Array2::<f64>::ones((2, 3));
        assert_eq!(pearson(a.view(), flat.view()), (0., 6));
    }

    #[test]
    fn rect_intersection() {
        let a = Rect { x0: 0, y0: 0, x1: 10, y1: 10 };
        let b = Rect { x0: 5, y0: 8, x1: 20, y1: 20 };
        let c = a.intersect(&b);
        assert_eq!((c.width(), c.height()), (5, 2));
        let d = Rect { x0: 12, y0: 0, x1: 20, y1: 5 };
        assert_eq!(a.intersect(&d).area(), 0);
    }
}
