//! FFT cross-correlation: padding, tapering, band-pass filtering, peak search and
//! periodic-lattice handling.
//!
//! The correlation of a reference `r` with an image `i` is
//! `IFFT(conj(FFT(r)) · FFT(i))`, so a peak at `s` means `i(x) ≈ r(x - s)`.

use std::sync::Arc;

use itertools::Itertools;
use kiddo::float::{distance::SquaredEuclidean, kdtree::KdTree};
use ndarray::{Array2, ArrayView2, Axis, Zip};
use rustfft::num_complex::Complex64;
use rustfft::{Fft, FftPlanner};

#[cfg(feature = "parallel")]
use ndarray::parallel::prelude::*;

use crate::ndarray_utils::mean_sd;

/// Smallest size `>= n` whose only prime factors are 2, 3 and 5, and which is even.
pub(crate) fn nice_fft_size(n: usize) -> usize {
    let mut size = n.max(2);
    loop {
        if size % 2 == 0 {
            let mut rest = size;
            for p in [2, 3, 5] {
                while rest % p == 0 {
                    rest /= p;
                }
            }
            if rest == 1 {
                return size;
            }
        }
        size += 1;
    }
}

/// Planned forward and inverse transforms for one buffer shape `(ny, nx)`.
pub(crate) struct Fft2 {
    shape: (usize, usize),
    rows_fwd: Arc<dyn Fft<f64>>,
    cols_fwd: Arc<dyn Fft<f64>>,
    rows_inv: Arc<dyn Fft<f64>>,
    cols_inv: Arc<dyn Fft<f64>>,
}

fn process_rows(data: &mut Array2<Complex64>, fft: &Arc<dyn Fft<f64>>) {
    #[cfg(feature = "parallel")]
    data.axis_iter_mut(Axis(0))
        .into_par_iter()
        .for_each(|mut row| {
            if let Some(slice) = row.as_slice_mut() {
                fft.process(slice);
            }
        });
    #[cfg(not(feature = "parallel"))]
    for mut row in data.axis_iter_mut(Axis(0)) {
        if let Some(slice) = row.as_slice_mut() {
            fft.process(slice);
        }
    }
}

impl Fft2 {
    pub fn new(shape: (usize, usize)) -> Self {
        let mut planner = FftPlanner::new();
        Self {
            shape,
            rows_fwd: planner.plan_fft_forward(shape.1),
            cols_fwd: planner.plan_fft_forward(shape.0),
            rows_inv: planner.plan_fft_inverse(shape.1),
            cols_inv: planner.plan_fft_inverse(shape.0),
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    fn transform(
        &self,
        mut data: Array2<Complex64>,
        rows: &Arc<dyn Fft<f64>>,
        cols: &Arc<dyn Fft<f64>>,
    ) -> Array2<Complex64> {
        process_rows(&mut data, rows);
        let mut transposed = data.t().as_standard_layout().into_owned();
        process_rows(&mut transposed, cols);
        transposed.t().as_standard_layout().into_owned()
    }

    /// Forward transform of a real plane of the planned shape.
    pub fn forward(&self, real: &Array2<f64>) -> Array2<Complex64> {
        let data = real.mapv(|v| Complex64::new(v, 0.));
        self.transform(data, &self.rows_fwd, &self.cols_fwd)
    }

    /// Inverse transform, normalized, keeping the real part.
    pub fn inverse_real(&self, spectrum: Array2<Complex64>) -> Array2<f64> {
        let norm = (self.shape.0 * self.shape.1) as f64;
        self.transform(spectrum, &self.rows_inv, &self.cols_inv)
            .mapv(|c| c.re / norm)
    }
}

/// Subtract the mean, taper the outer `taper` fraction of each edge to zero with a
/// cosine ramp, and place the result at the origin of a zeroed `shape` buffer.
pub(crate) fn taper_pad(
    region: ArrayView2<'_, f64>,
    shape: (usize, usize),
    taper: f64,
) -> Array2<f64> {
    let (ny, nx) = region.dim();
    let (mean, _) = mean_sd(region);
    let ramp = |i: usize, n: usize| -> f64 {
        let width = (taper * n as f64).round().max(0.);
        if width < 1. {
            return 1.;
        }
        let edge = (i.min(n - 1 - i)) as f64;
        if edge >= width {
            1.
        } else {
            0.5 - 0.5 * (std::f64::consts::PI * (edge + 0.5) / width).cos()
        }
    };
    let wx = (0..nx).map(|x| ramp(x, nx)).collect_vec();
    let wy = (0..ny).map(|y| ramp(y, ny)).collect_vec();
    let mut out = Array2::zeros(shape);
    for ((y, x), v) in region.indexed_iter() {
        if y < shape.0 && x < shape.1 {
            out[[y, x]] = (v - mean) * wx[x] * wy[y];
        }
    }
    out
}

/// Band-pass applied to the cross-power spectrum: a Gaussian high-pass with width
/// `sigma1` and a Gaussian roll-off of width `sigma2` beyond `radius2`. Frequencies
/// are in cycles per pixel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct BandPass {
    pub sigma1: f64,
    pub radius2: f64,
    pub sigma2: f64,
}

impl BandPass {
    /// Same filter with every frequency multiplied by `factor`.
    pub fn scaled(self, factor: f64) -> Self {
        Self {
            sigma1: self.sigma1 * factor,
            radius2: self.radius2 * factor,
            sigma2: self.sigma2 * factor,
        }
    }

    pub fn gain(&self, freq: f64) -> f64 {
        let high = if self.sigma1 > 0. {
            1. - (-freq * freq / (2. * self.sigma1 * self.sigma1)).exp()
        } else {
            1.
        };
        let low = if self.radius2 > 0. && self.sigma2 > 0. && freq > self.radius2 {
            let d = freq - self.radius2;
            (-d * d / (2. * self.sigma2 * self.sigma2)).exp()
        } else {
            1.
        };
        high * low
    }

    fn apply(&self, spectrum: &mut Array2<Complex64>) {
        let (ny, nx) = spectrum.dim();
        let freq = |k: usize, n: usize| -> f64 {
            let k = if k > n / 2 { k as f64 - n as f64 } else { k as f64 };
            k / n as f64
        };
        let fx = (0..nx).map(|k| freq(k, nx)).collect_vec();
        let fy = (0..ny).map(|k| freq(k, ny)).collect_vec();
        Zip::indexed(spectrum).for_each(|(y, x), c| {
            *c *= self.gain(fx[x].hypot(fy[y]));
        });
    }
}

/// Correlation surface of two padded planes of the planned shape.
pub(crate) fn correlate(
    fft: &Fft2,
    reference: &Array2<f64>,
    image: &Array2<f64>,
    filter: Option<&BandPass>,
) -> Array2<f64> {
    let r = fft.forward(reference);
    let i = fft.forward(image);
    let mut cross = Zip::from(&r).and(&i).map_collect(|a, b| a.conj() * b);
    if let Some(filter) = filter {
        filter.apply(&mut cross);
    }
    fft.inverse_real(cross)
}

/// A correlation maximum as a signed shift in buffer pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Peak {
    pub x: f64,
    pub y: f64,
    pub strength: f64,
}

fn signed(i: usize, n: usize) -> f64 {
    if i > n / 2 {
        i as f64 - n as f64
    } else {
        i as f64
    }
}

fn parabolic(left: f64, centre: f64, right: f64) -> f64 {
    let denom = left - 2. * centre + right;
    if denom >= 0. {
        return 0.;
    }
    (0.5 * (left - right) / denom).clamp(-0.5, 0.5)
}

/// Up to `max_peaks` local maxima at least `min_fraction` of the strongest one,
/// strongest first, refined to sub-pixel precision. Maxima closer than 2 px to a
/// stronger one are dropped.
pub(crate) fn find_peaks(corr: &Array2<f64>, max_peaks: usize, min_fraction: f64) -> Vec<Peak> {
    let (ny, nx) = corr.dim();
    if nx < 3 || ny < 3 {
        return Vec::new();
    }
    let at = |y: isize, x: isize| -> f64 {
        corr[[y.rem_euclid(ny as isize) as usize, x.rem_euclid(nx as isize) as usize]]
    };
    let maxima = corr
        .indexed_iter()
        .filter(|&((y, x), &v)| {
            let (y, x) = (y as isize, x as isize);
            (-1..=1)
                .cartesian_product(-1..=1)
                .filter(|&(dy, dx)| (dy, dx) != (0, 0))
                .all(|(dy, dx)| v >= at(y + dy, x + dx))
        })
        .map(|((y, x), &v)| (y, x, v))
        .sorted_by(|a, b| b.2.total_cmp(&a.2))
        .collect_vec();

    let Some(&(_, _, top)) = maxima.first() else {
        return Vec::new();
    };
    if top <= 0. {
        return Vec::new();
    }

    let mut peaks: Vec<Peak> = Vec::new();
    for (y, x, v) in maxima {
        if v < min_fraction * top || peaks.len() >= max_peaks {
            break;
        }
        let (sx, sy) = (signed(x, nx), signed(y, ny));
        let close = peaks.iter().any(|p| {
            let dx = (p.x - sx).abs() % nx as f64;
            let dy = (p.y - sy).abs() % ny as f64;
            dx.min(nx as f64 - dx).hypot(dy.min(ny as f64 - dy)) < 2.
        });
        if close {
            continue;
        }
        let (yi, xi) = (y as isize, x as isize);
        let ox = parabolic(at(yi, xi - 1), v, at(yi, xi + 1));
        let oy = parabolic(at(yi - 1, xi), v, at(yi + 1, xi));
        peaks.push(Peak {
            x: sx + ox,
            y: sy + oy,
            strength: v,
        });
    }
    peaks
}

/// The four toroidal readings of a wrapped shift in an `nx` x `ny` buffer.
pub(crate) fn wrap_alternatives(x: f64, y: f64, nx: usize, ny: usize) -> [(f64, f64); 4] {
    let other = |v: f64, n: usize| if v >= 0. { v - n as f64 } else { v + n as f64 };
    let (ax, ay) = (other(x, nx), other(y, ny));
    [(x, y), (ax, y), (x, ay), (ax, ay)]
}

/// Lattice vectors of a periodic specimen, found in an autocorrelation surface.
///
/// A candidate vector is a strong non-central autocorrelation peak that repeats:
/// either twice the vector or its sum with another candidate must also be a peak.
/// Returns at most two non-collinear vectors, shortest first.
pub(crate) fn lattice_vectors(autocorr: &Array2<f64>, min_fraction: f64) -> Vec<(f64, f64)> {
    const CENTRE_RADIUS: f64 = 3.;
    const MATCH_RADIUS: f64 = 1.5;
    let (ny, nx) = autocorr.dim();
    let peaks = find_peaks(autocorr, 100, min_fraction)
        .into_iter()
        .filter(|p| p.x.hypot(p.y) > CENTRE_RADIUS)
        .collect_vec();
    if peaks.is_empty() {
        return Vec::new();
    }
    let tree: KdTree<f64, usize, 2, 32, u32> = peaks
        .iter()
        .enumerate()
        .map(|(i, p)| ([p.x, p.y], i))
        .collect();
    let has_peak = |x: f64, y: f64| {
        !tree
            .within_unsorted::<SquaredEuclidean>(&[x, y], MATCH_RADIUS * MATCH_RADIUS)
            .is_empty()
    };
    let in_buffer = |x: f64, y: f64| x.abs() < nx as f64 / 2. - 1. && y.abs() < ny as f64 / 2. - 1.;

    let repeating = peaks
        .iter()
        .filter(|p| {
            let (dx, dy) = (2. * p.x, 2. * p.y);
            let doubled = in_buffer(dx, dy) && has_peak(dx, dy);
            let summed = peaks.iter().any(|q| {
                let (sx, sy) = (p.x + q.x, p.y + q.y);
                (q.x - p.x).hypot(q.y - p.y) > MATCH_RADIUS
                    && sx.hypot(sy) > CENTRE_RADIUS
                    && in_buffer(sx, sy)
                    && has_peak(sx, sy)
            });
            doubled || summed
        })
        .sorted_by(|a, b| a.x.hypot(a.y).total_cmp(&b.x.hypot(b.y)))
        .collect_vec();

    let Some(first) = repeating.first() else {
        return Vec::new();
    };
    let v1 = (first.x, first.y);
    let len1 = v1.0.hypot(v1.1);
    let second = repeating.iter().find(|p| {
        let cross = (v1.0 * p.y - v1.1 * p.x).abs();
        cross > 0.3 * len1 * p.x.hypot(p.y)
    });
    match second {
        Some(p) => vec![v1, (p.x, p.y)],
        None => vec![v1],
    }
}

/// Replace each correlation value by its excess over the strongest of its lattice
/// neighbours at `s ± v`, so that only the true alignment stands out among the
/// repeats of a periodic specimen.
pub(crate) fn suppress_lattice(corr: &Array2<f64>, vectors: &[(f64, f64)]) -> Array2<f64> {
    if vectors.is_empty() {
        return corr.clone();
    }
    let (ny, nx) = corr.dim();
    let offsets = vectors
        .iter()
        .flat_map(|&(vx, vy)| {
            let (ix, iy) = (vx.round() as isize, vy.round() as isize);
            [(ix, iy), (-ix, -iy)]
        })
        .collect_vec();
    Array2::from_shape_fn((ny, nx), |(y, x)| {
        let neighbour = offsets
            .iter()
            .map(|&(ox, oy)| {
                let yy = (y as isize + oy).rem_euclid(ny as isize) as usize;
                let xx = (x as isize + ox).rem_euclid(nx as isize) as usize;
                corr[[yy, xx]]
            })
            .fold(f64::NEG_INFINITY, f64::max);
        corr[[y, x]] - neighbour
    })
}
