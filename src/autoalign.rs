//! Translational image registration by FFT cross-correlation.
//!
//! [`align`] finds the offset of an image `A` relative to a reference `C`: a feature
//! at `p` in `C` sits at `p + shift` in `A`, with `shift` expressed in `C`'s native
//! (acquired) pixels. Both images are first brought to a common working binning near
//! [`AlignOptions::target_size`], optionally rotated, scaled and stretched, trimmed of
//! dark borders, tapered, padded and correlated with a band-pass filter. Up to
//! [`AlignOptions::max_peaks`] correlation peaks are then scored by the correlation
//! coefficient of the overlapping pixels at each of their four wrap-around readings.

use itertools::Itertools;
use log::debug;
use ndarray::{s, Array2, ArrayView2};
use serde::{Deserialize, Serialize};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::correlation::{
    correlate, find_peaks, lattice_vectors, nice_fft_size, suppress_lattice, taper_pad,
    wrap_alternatives, BandPass, Fft2, Peak,
};
use crate::error::{Error, Result};
use crate::matrix::ScaleMat;
use crate::ndarray_utils::{bin, mean_sd, pearson, reduce, to_f64, warp, Rect};
use crate::Pixel;

const MIN_WORKING_SIZE: usize = 16;
const SIZE_SLACK: f64 = 1.25;
const DARK_SDS: f64 = 2.5;
const MAX_DARK_FRACTION: f64 = 0.02;
const MIN_RING_SD: f64 = 0.1;
const LATTICE_FRACTION: f64 = 0.2;

/// An image to align together with the binning it was acquired at.
#[derive(Clone, Copy, Debug)]
pub struct AlignImage<'a, P: Pixel> {
    /// Pixel data indexed `[y, x]`.
    pub data: ArrayView2<'a, P>,
    /// Camera binning of `data`.
    pub binning: usize,
}

impl<'a, P: Pixel> AlignImage<'a, P> {
    /// Wrap a view acquired at `binning`.
    pub fn new(data: ArrayView2<'a, P>, binning: usize) -> Self {
        Self {
            data,
            binning: binning.max(1),
        }
    }
}

/// How large the zero-padded correlation buffers are.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PadMode {
    /// Just large enough for the bigger region; shifts wrap around.
    #[default]
    Small,
    /// One and a half times the bigger region.
    Large,
    /// The sum of both regions; no shift is ambiguous.
    Full,
    /// Reference is a small template searched for in the image. The band-pass is
    /// moved to lower frequencies.
    Template,
}

/// Which part of each image takes part in the correlation.
#[derive(Clone, Copy, Debug, PartialEq, Default, Serialize, Deserialize)]
pub enum Trim {
    /// Whole frame.
    #[default]
    None,
    /// Drop this fraction of the width and height at every edge.
    Fraction(f64),
    /// Detect dark borders (e.g. a round beam or grid bars) and trim them.
    Auto,
}

/// Geometry of a conical-tilt pair: `A` taken at `tilt_a`, `C` at `tilt_c`, both in
/// degrees, about an axis at `axis_deg` in the image.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConicalTilt {
    /// Tilt of image `A`.
    pub tilt_a: f64,
    /// Tilt of image `C`.
    pub tilt_c: f64,
    /// Direction of the tilt axis.
    pub axis_deg: f64,
}

impl ConicalTilt {
    /// Stretch of `A` perpendicular to the axis by `cos(tilt_c) / cos(tilt_a)`.
    pub fn matrix(&self) -> ScaleMat {
        let cos_a = self.tilt_a.to_radians().cos();
        if cos_a.abs() < 1e-6 {
            return ScaleMat::identity();
        }
        let k = self.tilt_c.to_radians().cos() / cos_a;
        let axis = ScaleMat::rotation(self.axis_deg);
        axis.multiply(&ScaleMat::new(1., 0., 0., k))
            .multiply(&ScaleMat::rotation(-self.axis_deg))
    }
}

/// What a caller of the session-level autoalign does with the result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ApplyMode {
    /// Only report the shift.
    None,
    /// Cancel the shift with image shift.
    #[default]
    ImageShift,
    /// Cancel the shift with a stage move.
    Stage,
}

/// Alignment parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignOptions {
    /// Longest working dimension to aim for, in pixels.
    pub target_size: usize,
    /// Number of correlation peaks to score.
    pub max_peaks: usize,
    /// Weakest peak considered, as a fraction of the strongest.
    pub peak_fraction: f64,
    /// Fraction of each edge tapered before padding.
    pub taper: f64,
    /// High-pass width, cycles per working pixel.
    pub sigma1: f64,
    /// Low-pass cutoff radius, cycles per working pixel.
    pub radius2: f64,
    /// Low-pass roll-off width, cycles per working pixel.
    pub sigma2: f64,
    /// Buffer padding.
    pub pad: PadMode,
    /// Region selection.
    pub trim: Trim,
    /// Expected shift in `C`'s native pixels; the correlation is centred on it.
    pub expected_shift: Option<(f64, f64)>,
    /// Width of a Gaussian prior around the expected shift (or zero), native pixels.
    pub shift_sigma: Option<f64>,
    /// Scale applied to `A` before correlating.
    pub scale: f64,
    /// Rotation in degrees applied to `A` before correlating.
    pub rotation: f64,
    /// Conical-tilt stretch applied to `A` before correlating.
    pub conical: Option<ConicalTilt>,
    /// Suppress the repeats of a periodic specimen.
    pub erase_periodic: bool,
    /// Drop a peak at exactly zero shift when another valid one exists.
    pub reject_zero_peak: bool,
    /// Smallest overlap of a valid peak, in working pixels.
    pub min_overlap_pixels: usize,
    /// Smallest correlation coefficient of a valid peak.
    pub min_ccc: f64,
    /// What the session does with the result.
    pub apply: ApplyMode,
}

impl Default for AlignOptions {
    fn default() -> Self {
        Self {
            target_size: 512,
            max_peaks: 10,
            peak_fraction: 0.1,
            taper: 0.1,
            sigma1: 0.03,
            radius2: 0.25,
            sigma2: 0.05,
            pad: PadMode::Small,
            trim: Trim::None,
            expected_shift: None,
            shift_sigma: None,
            scale: 1.,
            rotation: 0.,
            conical: None,
            erase_periodic: false,
            reject_zero_peak: false,
            min_overlap_pixels: 1500,
            min_ccc: 0.1,
            apply: ApplyMode::ImageShift,
        }
    }
}

impl AlignOptions {
    /// Set the working size target.
    pub fn with_target_size(mut self, size: usize) -> Self {
        self.target_size = size.max(MIN_WORKING_SIZE);
        self
    }

    /// Set how many peaks are scored.
    pub fn with_max_peaks(mut self, peaks: usize) -> Self {
        self.max_peaks = peaks.max(1);
        self
    }

    /// Set the edge taper fraction.
    pub fn with_taper(mut self, taper: f64) -> Self {
        self.taper = taper.clamp(0., 0.5);
        self
    }

    /// Set the band-pass filter. A zero `sigma1` disables the high-pass, a zero
    /// `radius2` the low-pass.
    pub fn with_band_pass(mut self, sigma1: f64, radius2: f64, sigma2: f64) -> Self {
        self.sigma1 = sigma1;
        self.radius2 = radius2;
        self.sigma2 = sigma2;
        self
    }

    /// Set the padding mode.
    pub fn with_pad(mut self, pad: PadMode) -> Self {
        self.pad = pad;
        self
    }

    /// Set the region selection.
    pub fn with_trim(mut self, trim: Trim) -> Self {
        self.trim = trim;
        self
    }

    /// Centre the search on an expected shift in `C`'s native pixels.
    pub fn with_expected_shift(mut self, x: f64, y: f64) -> Self {
        self.expected_shift = Some((x, y));
        self
    }

    /// Weight peaks by a Gaussian of this width around the expected shift.
    pub fn with_shift_sigma(mut self, sigma: f64) -> Self {
        self.shift_sigma = (sigma > 0.).then_some(sigma);
        self
    }

    /// Scale and rotate `A` before correlating.
    pub fn with_scale_rotation(mut self, scale: f64, rotation: f64) -> Self {
        self.scale = scale;
        self.rotation = rotation;
        self
    }

    /// Correct a conical-tilt pair.
    pub fn with_conical_tilt(mut self, conical: ConicalTilt) -> Self {
        self.conical = Some(conical);
        self
    }

    /// Suppress periodic-specimen repeats.
    pub fn with_erase_periodic(mut self, erase: bool) -> Self {
        self.erase_periodic = erase;
        self
    }

    /// Reject a spurious zero-shift peak.
    pub fn with_reject_zero_peak(mut self, reject: bool) -> Self {
        self.reject_zero_peak = reject;
        self
    }

    /// Set the overlap floor in working pixels.
    pub fn with_min_overlap(mut self, pixels: usize) -> Self {
        self.min_overlap_pixels = pixels;
        self
    }

    /// Set the correlation-coefficient floor.
    pub fn with_min_ccc(mut self, ccc: f64) -> Self {
        self.min_ccc = ccc;
        self
    }

    /// Set what the session does with the result.
    pub fn with_apply(mut self, apply: ApplyMode) -> Self {
        self.apply = apply;
        self
    }

    /// Report the shift without applying it.
    pub fn output_only(self) -> Self {
        self.with_apply(ApplyMode::None)
    }

    /// Combined map applied to `A` before correlating, `None` when it is the identity.
    pub fn pre_transform(&self) -> Option<ScaleMat> {
        let mut m = ScaleMat::scale_rotate(self.scale, self.rotation);
        if let Some(conical) = &self.conical {
            m = m.multiply(&conical.matrix());
        }
        let identity = ScaleMat::identity();
        if (m.m - identity.m).abs().max() < 1e-9 {
            None
        } else {
            Some(m)
        }
    }

    fn band_pass(&self) -> BandPass {
        let filter = BandPass {
            sigma1: self.sigma1,
            radius2: self.radius2,
            sigma2: self.sigma2,
        };
        match (self.pad, self.erase_periodic) {
            (PadMode::Template, _) => filter.scaled(0.5),
            (_, true) => filter.scaled(2.),
            _ => filter,
        }
    }
}

/// One scored correlation peak.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlignmentPeak {
    /// Shift in `C`'s native pixels.
    pub shift: (f64, f64),
    /// Height of the correlation peak.
    pub strength: f64,
    /// Which wrap-around reading won: bit 0 for X, bit 1 for Y.
    pub wrap: usize,
    /// Correlation coefficient of the overlapping pixels.
    pub ccc: f64,
    /// `ccc` weighted by overlap and the optional shift prior.
    pub weighted_ccc: f64,
    /// Overlap as a fraction of the smaller region.
    pub overlap_fraction: f64,
    /// Overlap in working pixels.
    pub overlap_pixels: usize,
}

/// Outcome of [`align`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlignResult {
    /// Shift of `A` relative to `C`, in `C`'s native pixels.
    pub shift: (f64, f64),
    /// Correlation coefficient at the winning shift.
    pub ccc: f64,
    /// Weighted coefficient used for ranking.
    pub weighted_ccc: f64,
    /// Overlap as a fraction of the smaller region.
    pub overlap_fraction: f64,
    /// Overlap in working pixels.
    pub overlap_pixels: usize,
    /// Height of the winning correlation peak.
    pub peak_strength: f64,
    /// Common binning the images were correlated at, in camera pixels.
    pub working_binning: usize,
    /// Winning wrap-around reading.
    pub wrap: usize,
    /// Every scored peak reading, best weighted coefficient first.
    pub candidates: Vec<AlignmentPeak>,
}

fn gcd(a: usize, b: usize) -> usize {
    if b == 0 { a } else { gcd(b, a % b) }
}

/// Common working binning for two images of the given unbinned extents.
///
/// The smallest multiple of both binnings that brings the longest extent under
/// `target · 1.25`. If that lands below half the target, a multiple of the coarser
/// binning is used instead and the finer image is resampled.
pub(crate) fn working_binning(
    longest_unbinned: usize,
    bin_a: usize,
    bin_c: usize,
    target: usize,
) -> usize {
    let (bin_a, bin_c) = (bin_a.max(1), bin_c.max(1));
    let target = target.max(MIN_WORKING_SIZE);
    let limit = target as f64 * SIZE_SLACK;
    let steps = |base: usize| {
        ((longest_unbinned as f64 / (base as f64 * limit)).ceil() as usize).max(1) * base
    };
    let common = bin_a / gcd(bin_a, bin_c) * bin_c;
    let binning = steps(common);
    if bin_a != bin_c && (longest_unbinned as f64 / binning as f64) < target as f64 / 2. {
        steps(bin_a.max(bin_c))
    } else {
        binning
    }
}

/// Largest centred rectangle of an `out` shaped plane whose pixels all map back
/// inside a `src` shaped plane under the inverse of `forward`.
pub(crate) fn footprint(forward: &ScaleMat, src: (usize, usize), out: (usize, usize)) -> Rect {
    let inverse = forward.invert(false);
    if inverse.is_null() {
        return Rect::full(out);
    }
    let (hx, hy) = (src.1 as f64 / 2. - 1., src.0 as f64 / 2. - 1.);
    let inside = |w: f64, h: f64| {
        [(w, h), (w, -h), (-w, h), (-w, -h)].iter().all(|&(x, y)| {
            let (u, v) = inverse.apply(x, y);
            u.abs() <= hx && v.abs() <= hy
        })
    };
    let (ox, oy) = ((out.1 as f64 - 1.) / 2., (out.0 as f64 - 1.) / 2.);
    const STEPS: usize = 64;
    let mut best = (0., 0., 0.);
    for i in 1..=STEPS {
        let h = oy * i as f64 / STEPS as f64;
        if !inside(0., h) {
            break;
        }
        let (mut lo, mut hi) = (0., ox);
        for _ in 0..30 {
            let mid = 0.5 * (lo + hi);
            if inside(mid, h) {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        if lo * h > best.2 {
            best = (lo, h, lo * h);
        }
    }
    let (w, h, _) = best;
    Rect {
        x0: (ox - w).ceil().max(0.) as usize,
        y0: (oy - h).ceil().max(0.) as usize,
        x1: ((ox + w).floor() as usize + 1).min(out.1),
        y1: ((oy + h).floor() as usize + 1).min(out.0),
    }
}

/// Usable rectangle after trimming dark borders.
///
/// Rings are judged against the central half of the frame: a ring passes when at
/// most 2% of it is darker than the centre mean minus 2.5 standard deviations and
/// its own spread is at least a tenth of the centre's. The frame is first trimmed
/// evenly until the outer ring passes, then each side is given back as far as its
/// strips keep passing.
pub(crate) fn auto_trim(arr: &Array2<f64>) -> Rect {
    let (ny, nx) = arr.dim();
    let full = Rect::full((ny, nx));
    if nx < 8 || ny < 8 {
        return full;
    }
    let (mean, sd) = mean_sd(arr.slice(s![ny / 4..3 * ny / 4, nx / 4..3 * nx / 4]));
    if sd <= 0. {
        return full;
    }
    let threshold = mean - DARK_SDS * sd;
    let passes = |view: ArrayView2<'_, f64>| {
        if view.is_empty() {
            return false;
        }
        let dark = view.iter().filter(|&&v| v < threshold).count();
        let (_, ring_sd) = mean_sd(view);
        (dark as f64) <= MAX_DARK_FRACTION * view.len() as f64 && ring_sd >= MIN_RING_SD * sd
    };
    let (sx, sy) = ((nx / 50).max(1), (ny / 50).max(1));
    let max_steps = 12usize.min(nx / (4 * sx)).min(ny / (4 * sy));

    // [left, top, right, bottom] in steps
    let strip = |side: usize, j: usize, t: [usize; 4]| {
        let (x0, y0, x1, y1) = (t[0] * sx, t[1] * sy, nx - t[2] * sx, ny - t[3] * sy);
        match side {
            0 => arr.slice(s![y0..y1, j * sx..(j + 1) * sx]),
            1 => arr.slice(s![j * sy..(j + 1) * sy, x0..x1]),
            2 => arr.slice(s![y0..y1, nx - (j + 1) * sx..nx - j * sx]),
            _ => arr.slice(s![ny - (j + 1) * sy..ny - j * sy, x0..x1]),
        }
    };

    let Some(k) = (0..=max_steps).find(|&k| (0..4).all(|side| passes(strip(side, k, [k; 4]))))
    else {
        return full;
    };
    let mut trims = [k; 4];
    for side in 0..4 {
        while trims[side] > 0 && passes(strip(side, trims[side] - 1, trims)) {
            trims[side] -= 1;
        }
    }
    Rect {
        x0: trims[0] * sx,
        y0: trims[1] * sy,
        x1: nx - trims[2] * sx,
        y1: ny - trims[3] * sy,
    }
}

fn trim_rect(arr: &Array2<f64>, trim: Trim) -> Rect {
    let (ny, nx) = arr.dim();
    match trim {
        Trim::None => Rect::full((ny, nx)),
        Trim::Fraction(f) => {
            let f = f.clamp(0., 0.4);
            let (tx, ty) = ((f * nx as f64) as usize, (f * ny as f64) as usize);
            Rect {
                x0: tx,
                y0: ty,
                x1: nx - tx,
                y1: ny - ty,
            }
        }
        Trim::Auto => auto_trim(arr),
    }
}

/// Overlapping parts of `a` and `c` when `a(x) ≈ c(x - (ix, iy))`.
fn overlap<'a>(
    a: ArrayView2<'a, f64>,
    c: ArrayView2<'a, f64>,
    ix: isize,
    iy: isize,
) -> Option<(ArrayView2<'a, f64>, ArrayView2<'a, f64>)> {
    let (ha, wa) = (a.nrows() as isize, a.ncols() as isize);
    let (hc, wc) = (c.nrows() as isize, c.ncols() as isize);
    let (x0, x1) = (ix.max(0), wa.min(wc + ix));
    let (y0, y1) = (iy.max(0), ha.min(hc + iy));
    if x1 - x0 < 2 || y1 - y0 < 2 {
        return None;
    }
    Some((
        a.slice_move(s![y0..y1, x0..x1]),
        c.slice_move(s![y0 - iy..y1 - iy, x0 - ix..x1 - ix]),
    ))
}

/// A peak reading in working pixels of the correlation frame.
#[derive(Clone, Copy, Debug)]
struct Scored {
    work: (f64, f64),
    strength: f64,
    wrap: usize,
    ccc: f64,
    weighted: f64,
    fraction: f64,
    pixels: usize,
}

fn drop_zero_peak(valid: Vec<Scored>) -> Vec<Scored> {
    let is_zero = |s: &Scored| s.work.0.round() == 0. && s.work.1.round() == 0.;
    if valid.iter().any(|s| !is_zero(s)) {
        valid.into_iter().filter(|s| !is_zero(s)).collect()
    } else {
        valid
    }
}

/// Align `a` to the reference `c`.
///
/// Fails with [`Error::ImageTooSmall`] if either image is under 16 working pixels
/// on a side and with [`Error::NoValidPeak`] if no peak reaches the overlap and
/// coefficient floors.
pub fn align<P: Pixel, Q: Pixel>(
    a: &AlignImage<'_, P>,
    c: &AlignImage<'_, Q>,
    options: &AlignOptions,
) -> Result<AlignResult> {
    let (bin_a, bin_c) = (a.binning.max(1), c.binning.max(1));
    let longest = (a.data.nrows().max(a.data.ncols()) * bin_a)
        .max(c.data.nrows().max(c.data.ncols()) * bin_c);
    let binning = working_binning(longest, bin_a, bin_c, options.target_size);

    let mut a_work = reduce(to_f64(a.data).view(), bin_a as f64 / binning as f64);
    let mut c_work = reduce(to_f64(c.data).view(), bin_c as f64 / binning as f64);
    for arr in [&a_work, &c_work] {
        let (h, w) = arr.dim();
        if h < MIN_WORKING_SIZE || w < MIN_WORKING_SIZE {
            return Err(Error::ImageTooSmall {
                width: w,
                height: h,
            });
        }
    }

    let mut rect_a = trim_rect(&a_work, options.trim);
    let mut rect_c = trim_rect(&c_work, options.trim);

    // Enlarge rather than shrink: stretch A by M, or C by M⁻¹ and map the result back.
    let mut back_to_c: Option<ScaleMat> = None;
    if let Some(m) = options.pre_transform() {
        if m.determinant().abs() >= 1. {
            if let Some(out) = warp(a_work.view(), &m, a_work.dim()) {
                rect_a = rect_a.intersect(&footprint(&m, a_work.dim(), a_work.dim()));
                a_work = out;
            }
        } else {
            let inv = m.invert(false);
            if let Some(out) = warp(c_work.view(), &inv, c_work.dim()) {
                rect_c = rect_c.intersect(&footprint(&inv, c_work.dim(), c_work.dim()));
                c_work = out;
                back_to_c = Some(m);
            }
        }
    }
    let to_work = |x: f64, y: f64| {
        let k = bin_c as f64 / binning as f64;
        match &back_to_c {
            Some(m) => m.invert(false).apply(x * k, y * k),
            None => (x * k, y * k),
        }
    };
    let expected = options.expected_shift.map(|(x, y)| to_work(x, y));
    let sigma = options
        .shift_sigma
        .map(|s| s * bin_c as f64 / binning as f64);

    // Centre both regions on the expected overlap.
    if let Some((ex, ey)) = expected {
        let (rx, ry) = (ex.round() as isize, ey.round() as isize);
        let shifted = |v: usize, d: isize| (v as isize + d).max(0) as usize;
        let moved_c = Rect {
            x0: shifted(rect_c.x0, rx),
            y0: shifted(rect_c.y0, ry),
            x1: shifted(rect_c.x1, rx),
            y1: shifted(rect_c.y1, ry),
        };
        let common = rect_a.intersect(&moved_c);
        if common.width() >= MIN_WORKING_SIZE && common.height() >= MIN_WORKING_SIZE {
            rect_a = common;
            rect_c = Rect {
                x0: shifted(common.x0, -rx),
                y0: shifted(common.y0, -ry),
                x1: shifted(common.x1, -rx),
                y1: shifted(common.y1, -ry),
            };
        }
    }

    let a_crop = rect_a.view(&a_work);
    let c_crop = rect_c.view(&c_work);
    if a_crop.nrows() < MIN_WORKING_SIZE || a_crop.ncols() < MIN_WORKING_SIZE {
        return Err(Error::ImageTooSmall {
            width: a_crop.ncols(),
            height: a_crop.nrows(),
        });
    }
    if c_crop.nrows() < MIN_WORKING_SIZE || c_crop.ncols() < MIN_WORKING_SIZE {
        return Err(Error::ImageTooSmall {
            width: c_crop.ncols(),
            height: c_crop.nrows(),
        });
    }
    let base = (
        rect_a.x0 as f64 - rect_c.x0 as f64,
        rect_a.y0 as f64 - rect_c.y0 as f64,
    );

    let (h, w) = (
        a_crop.nrows().max(c_crop.nrows()),
        a_crop.ncols().max(c_crop.ncols()),
    );
    let shape = match options.pad {
        PadMode::Small | PadMode::Template => (nice_fft_size(h), nice_fft_size(w)),
        PadMode::Large => (nice_fft_size(h * 3 / 2), nice_fft_size(w * 3 / 2)),
        PadMode::Full => (
            nice_fft_size(a_crop.nrows() + c_crop.nrows()),
            nice_fft_size(a_crop.ncols() + c_crop.ncols()),
        ),
    };
    let filter = options.band_pass();

    let lattice = if options.erase_periodic {
        periodic_lattice(c_crop, &filter, options.taper)
    } else {
        Vec::new()
    };

    let fft = Fft2::new(shape);
    let c_pad = taper_pad(c_crop, fft.shape(), options.taper);
    let a_pad = taper_pad(a_crop, fft.shape(), options.taper);
    let mut corr = correlate(&fft, &c_pad, &a_pad, Some(&filter));
    if !lattice.is_empty() {
        corr = suppress_lattice(&corr, &lattice);
    }
    let peaks = find_peaks(&corr, options.max_peaks, options.peak_fraction);
    debug!(
        "Aligning at binning {binning}: regions {:?} and {:?}, buffer {:?}, \
         {} peaks, {} lattice vectors.",
        a_crop.dim(),
        c_crop.dim(),
        shape,
        peaks.len(),
        lattice.len()
    );

    let min_area = (a_crop.len().min(c_crop.len())).max(1) as f64;
    let score = |peak: &Peak| -> Vec<Scored> {
        wrap_alternatives(peak.x, peak.y, shape.1, shape.0)
            .into_iter()
            .enumerate()
            .filter_map(|(wrap, (x, y))| {
                let (ix, iy) = (x.round() as isize, y.round() as isize);
                let (va, vc) = overlap(a_crop, c_crop, ix, iy)?;
                let (ccc, pixels) = pearson(va, vc);
                let fraction = pixels as f64 / min_area;
                let work = (x + base.0, y + base.1);
                let prior = match sigma {
                    Some(sigma) => {
                        let (ex, ey) = expected.unwrap_or((0., 0.));
                        let d2 = (work.0 - ex).powi(2) + (work.1 - ey).powi(2);
                        (-d2 / (2. * sigma * sigma)).exp()
                    }
                    None => 1.,
                };
                Some(Scored {
                    work,
                    strength: peak.strength,
                    wrap,
                    ccc,
                    weighted: ccc * fraction.powf(1. / 6.) * prior,
                    fraction,
                    pixels,
                })
            })
            .collect()
    };

    #[cfg(feature = "parallel")]
    let mut scored: Vec<Scored> = peaks.par_iter().flat_map_iter(score).collect();
    #[cfg(not(feature = "parallel"))]
    let mut scored: Vec<Scored> = peaks.iter().flat_map(score).collect();
    scored.sort_by(|p, q| q.weighted.total_cmp(&p.weighted));

    let to_native = |work: (f64, f64)| {
        let (x, y) = match &back_to_c {
            Some(m) => m.apply(work.0, work.1),
            None => work,
        };
        let k = binning as f64 / bin_c as f64;
        (x * k, y * k)
    };
    let as_peak = |s: &Scored| AlignmentPeak {
        shift: to_native(s.work),
        strength: s.strength,
        wrap: s.wrap,
        ccc: s.ccc,
        weighted_ccc: s.weighted,
        overlap_fraction: s.fraction,
        overlap_pixels: s.pixels,
    };
    let candidates = scored.iter().map(as_peak).collect_vec();

    let mut valid = scored
        .iter()
        .filter(|s| s.pixels >= options.min_overlap_pixels && s.ccc >= options.min_ccc)
        .copied()
        .collect_vec();
    if options.reject_zero_peak {
        valid = drop_zero_peak(valid);
    }
    let Some(best) = valid
        .into_iter()
        .max_by(|p, q| p.weighted.total_cmp(&q.weighted))
    else {
        let (best_ccc, overlap_pixels) = scored
            .iter()
            .max_by(|p, q| p.ccc.total_cmp(&q.ccc))
            .map_or((0., 0), |s| (s.ccc, s.pixels));
        debug!("No valid peak: best ccc {best_ccc:.3} over {overlap_pixels} pixels.");
        return Err(Error::NoValidPeak {
            best_ccc,
            overlap_pixels,
        });
    };

    let winner = as_peak(&best);
    debug!(
        "Best peak at {:?} (wrap {}), ccc {:.3}, overlap {:.2}.",
        winner.shift, winner.wrap, winner.ccc, winner.overlap_fraction
    );
    Ok(AlignResult {
        shift: winner.shift,
        ccc: winner.ccc,
        weighted_ccc: winner.weighted_ccc,
        overlap_fraction: winner.overlap_fraction,
        overlap_pixels: winner.overlap_pixels,
        peak_strength: winner.strength,
        working_binning: binning,
        wrap: winner.wrap,
        candidates,
    })
}

/// Lattice vectors of the reference, from an autocorrelation at twice the working
/// binning, scaled back to working pixels.
fn periodic_lattice(region: ArrayView2<'_, f64>, filter: &BandPass, taper: f64) -> Vec<(f64, f64)> {
    let coarse = bin(region, 2);
    let (h, w) = coarse.dim();
    if h < MIN_WORKING_SIZE || w < MIN_WORKING_SIZE {
        return Vec::new();
    }
    let fft = Fft2::new((nice_fft_size(h), nice_fft_size(w)));
    let padded = taper_pad(coarse.view(), fft.shape(), taper);
    let auto = correlate(&fft, &padded, &padded, Some(&filter.scaled(2.)));
    lattice_vectors(&auto, LATTICE_FRACTION)
        .into_iter()
        .map(|(x, y)| (2. * x, 2. * y))
        .collect()
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use itertools::iproduct;
    use ndarray_rand::rand::{rngs::StdRng as NoiseRng, SeedableRng as _};
    use ndarray_rand::rand_distr::{Normal, Uniform};
    use ndarray_rand::RandomExt;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    /// (x, y, sigma, amplitude)
    fn blobs(seed: u64, count: usize, extent: f64) -> Vec<(f64, f64, f64, f64)> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..count)
            .map(|_| {
                (
                    rng.random_range(-30.0..extent + 30.),
                    rng.random_range(-30.0..extent + 30.),
                    rng.random_range(2.5..6.),
                    rng.random_range(0.5..1.5),
                )
            })
            .collect()
    }

    /// Render blobs moved by `shift`, then mapped by `map` about the frame centre.
    fn render(
        blobs: &[(f64, f64, f64, f64)],
        shape: (usize, usize),
        map: ScaleMat,
        shift: (f64, f64),
    ) -> Array2<f64> {
        let (cx, cy) = ((shape.1 as f64 - 1.) / 2., (shape.0 as f64 - 1.) / 2.);
        let placed = blobs
            .iter()
            .map(|&(x, y, sigma, amp)| {
                let (dx, dy) = map.apply(x - cx, y - cy);
                (cx + dx + shift.0, cy + dy + shift.1, sigma, amp)
            })
            .collect_vec();
        Array2::from_shape_fn(shape, |(y, x)| {
            placed
                .iter()
                .map(|&(bx, by, sigma, amp)| {
                    let d2 = (x as f64 - bx).powi(2) + (y as f64 - by).powi(2);
                    amp * (-d2 / (2. * sigma * sigma)).exp()
                })
                .sum()
        })
    }

    fn noise(shape: (usize, usize), seed: u64) -> Array2<f64> {
        let mut rng = NoiseRng::seed_from_u64(seed);
        Array2::random_using(shape, Normal::new(0., 0.05).unwrap(), &mut rng)
    }

    #[test]
    fn recovers_subpixel_shift() {
        let shape = (256, 256);
        let field = blobs(7, 90, 256.);
        let c = render(&field, shape, ScaleMat::identity(), (0., 0.)) + noise(shape, 1);
        let a = render(&field, shape, ScaleMat::identity(), (12.3, -5.7)) + noise(shape, 2);

        let result = align(
            &AlignImage::new(a.view(), 1),
            &AlignImage::new(c.view(), 1),
            &AlignOptions::default(),
        )
        .unwrap();
        assert_abs_diff_eq!(result.shift.0, 12.3, epsilon = 0.5);
        assert_abs_diff_eq!(result.shift.1, -5.7, epsilon = 0.5);
        assert!(result.overlap_fraction > 0.8);
        assert!(result.ccc > 0.5);
        assert_eq!(result.working_binning, 1);
        assert!(!result.candidates.is_empty());
    }

    #[test]
    fn unrelated_noise_has_no_valid_peak() {
        let shape = (192, 192);
        let mut rng = NoiseRng::seed_from_u64(11);
        let a = Array2::random_using(shape, Uniform::new(0., 1.), &mut rng);
        let c = Array2::random_using(shape, Uniform::new(0., 1.), &mut rng);
        let err = align(
            &AlignImage::new(a.view(), 1),
            &AlignImage::new(c.view(), 1),
            &AlignOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::NoValidPeak { .. }), "{err:?}");
    }

    #[test]
    fn unequal_binning_is_compensated() {
        let field = blobs(3, 90, 256.);
        let c = render(&field, (256, 256), ScaleMat::identity(), (0., 0.)) * 1000.;
        let c16 = c.mapv(|v| v.round() as u16);
        let a_full = render(&field, (256, 256), ScaleMat::identity(), (12., -6.));
        let a = bin(a_full.view(), 2);

        let result = align(
            &AlignImage::new(a.view(), 2),
            &AlignImage::new(c16.view(), 1),
            &AlignOptions::default(),
        )
        .unwrap();
        assert_eq!(result.working_binning, 2);
        assert_abs_diff_eq!(result.shift.0, 12., epsilon = 1.);
        assert_abs_diff_eq!(result.shift.1, -6., epsilon = 1.);
    }

    #[test]
    fn expected_shift_recentres_window() {
        let shape = (256, 256);
        let field = blobs(5, 90, 256.);
        let c = render(&field, shape, ScaleMat::identity(), (0., 0.));
        let a = render(&field, shape, ScaleMat::identity(), (70.4, 52.2));
        let options = AlignOptions::default()
            .with_expected_shift(68., 50.)
            .with_shift_sigma(20.);
        let result = align(
            &AlignImage::new(a.view(), 1),
            &AlignImage::new(c.view(), 1),
            &options,
        )
        .unwrap();
        assert_abs_diff_eq!(result.shift.0, 70.4, epsilon = 0.5);
        assert_abs_diff_eq!(result.shift.1, 52.2, epsilon = 0.5);
    }

    #[test]
    fn pre_rotation_is_undone() {
        let shape = (256, 256);
        let field = blobs(9, 90, 256.);
        let c = render(&field, shape, ScaleMat::identity(), (0., 0.));
        let shift = (6., 4.);
        let a = render(&field, shape, ScaleMat::rotation(10.), shift);
        let options = AlignOptions::default().with_scale_rotation(1., -10.);
        let result = align(
            &AlignImage::new(a.view(), 1),
            &AlignImage::new(c.view(), 1),
            &options,
        )
        .unwrap();
        let (ex, ey) = ScaleMat::rotation(-10.).apply(shift.0, shift.1);
        assert_abs_diff_eq!(result.shift.0, ex, epsilon = 0.6);
        assert_abs_diff_eq!(result.shift.1, ey, epsilon = 0.6);
    }

    #[test]
    fn larger_padding_recovers_shift() {
        let shape = (256, 256);
        let field = blobs(7, 90, 256.);
        let c = render(&field, shape, ScaleMat::identity(), (0., 0.)) + noise(shape, 1);
        let a = render(&field, shape, ScaleMat::identity(), (12.3, -5.7)) + noise(shape, 2);

        for pad in [PadMode::Large, PadMode::Full] {
            let result = align(
                &AlignImage::new(a.view(), 1),
                &AlignImage::new(c.view(), 1),
                &AlignOptions::default().with_pad(pad),
            )
            .unwrap();
            assert_abs_diff_eq!(result.shift.0, 12.3, epsilon = 0.5);
            assert_abs_diff_eq!(result.shift.1, -5.7, epsilon = 0.5);
            assert!(result.overlap_fraction > 0.8, "{pad:?}");
        }
    }

    #[test]
    fn template_is_found_in_image() {
        let shape = (256, 256);
        let field = blobs(13, 90, 256.);
        let full = render(&field, shape, ScaleMat::identity(), (0., 0.));
        let a = &full + &noise(shape, 4);
        // C(u) = A(u + (60, 100)), so A is C moved by (60, 100)
        let template = full.slice(s![100..196, 60..156]).to_owned();

        let result = align(
            &AlignImage::new(a.view(), 1),
            &AlignImage::new(template.view(), 1),
            &AlignOptions::default().with_pad(PadMode::Template),
        )
        .unwrap();
        assert_abs_diff_eq!(result.shift.0, 60., epsilon = 0.5);
        assert_abs_diff_eq!(result.shift.1, 100., epsilon = 0.5);
        assert_eq!(result.overlap_pixels, 96 * 96);
    }

    #[test]
    fn auto_trim_ignores_shared_dark_border() {
        let shape = (256, 256);
        let field = blobs(17, 90, 256.);
        let frame = |shift: (f64, f64), seed: u64| {
            let mut arr = render(&field, shape, ScaleMat::identity(), shift) + noise(shape, seed);
            arr += 1.;
            for ((y, x), v) in arr.indexed_iter_mut() {
                if x < 20 || y < 20 || x >= 236 || y >= 236 {
                    *v = 0.;
                }
            }
            arr
        };
        let c = frame((0., 0.), 1);
        let a = frame((12.3, -5.7), 2);

        let result = align(
            &AlignImage::new(a.view(), 1),
            &AlignImage::new(c.view(), 1),
            &AlignOptions::default().with_trim(Trim::Auto),
        )
        .unwrap();
        assert_abs_diff_eq!(result.shift.0, 12.3, epsilon = 0.5);
        assert_abs_diff_eq!(result.shift.1, -5.7, epsilon = 0.5);
        assert!(result.overlap_pixels <= 216 * 216);
    }

    #[test]
    fn conical_tilt_is_undone() {
        let shape = (256, 256);
        let field = blobs(19, 90, 256.);
        let tilt = ConicalTilt {
            tilt_a: 30.,
            tilt_c: 0.,
            axis_deg: 90.,
        };
        let stretch = tilt.matrix();
        let shift = (8., 3.);
        let c = render(&field, shape, ScaleMat::identity(), (0., 0.));
        // A is foreshortened across the axis
        let a = render(&field, shape, stretch.invert(false), shift);

        let result = align(
            &AlignImage::new(a.view(), 1),
            &AlignImage::new(c.view(), 1),
            &AlignOptions::default().with_conical_tilt(tilt),
        )
        .unwrap();
        let (ex, ey) = stretch.apply(shift.0, shift.1);
        assert_abs_diff_eq!(ex, 8. / 30f64.to_radians().cos(), epsilon = 1e-9);
        assert_abs_diff_eq!(result.shift.0, ex, epsilon = 0.6);
        assert_abs_diff_eq!(result.shift.1, ey, epsilon = 0.6);
    }

    #[test]
    fn periodic_specimen_keeps_true_shift() {
        let shape = (256, 256);
        let lattice = iproduct!(-1..12, -1..12)
            .map(|(i, j)| (i as f64 * 24. + 5., j as f64 * 24. + 5., 2., 1.))
            .collect_vec();
        let mut specimen = blobs(23, 40, 256.);
        specimen.extend(lattice);
        let shift = (10.4, -7.3);
        let c = render(&specimen, shape, ScaleMat::identity(), (0., 0.)) + noise(shape, 5);
        let a = render(&specimen, shape, ScaleMat::identity(), shift) + noise(shape, 6);

        let options = AlignOptions::default().with_erase_periodic(true);
        let result = align(
            &AlignImage::new(a.view(), 1),
            &AlignImage::new(c.view(), 1),
            &options,
        )
        .unwrap();
        assert_abs_diff_eq!(result.shift.0, shift.0, epsilon = 0.5);
        assert_abs_diff_eq!(result.shift.1, shift.1, epsilon = 0.5);
    }

    #[test]
    fn zero_peak_dropped_only_with_alternatives() {
        let scored = |x: f64, weighted: f64| Scored {
            work: (x, 0.2),
            strength: 1.,
            wrap: 0,
            ccc: weighted,
            weighted,
            fraction: 1.,
            pixels: 4000,
        };
        let kept = drop_zero_peak(vec![scored(0.3, 0.9), scored(14., 0.5)]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].work.0, 14.);
        let kept = drop_zero_peak(vec![scored(0.1, 0.9)]);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn binning_choice() {
        assert_eq!(working_binning(4096, 1, 1, 512), 7);
        assert_eq!(working_binning(512, 1, 1, 512), 1);
        assert_eq!(working_binning(4096, 2, 4, 512), 8);
        // lcm of 3 and 4 would leave 2048 / 12 < 256 pixels
        assert_eq!(working_binning(2048, 3, 4, 512), 4);
        assert_eq!(working_binning(8192, 3, 4, 512), 24);
        // a zero target from a hand-written options file means the smallest one
        assert_eq!(working_binning(4096, 1, 1, 0), 205);
        assert_eq!(working_binning(4096, 0, 1, 16), 205);
    }

    #[test]
    fn zero_target_from_serde_is_clamped() {
        let options: AlignOptions = serde_json::from_str(r#"{"target_size": 0}"#).unwrap();
        assert_eq!(options.target_size, 0);
        let shape = (256, 256);
        let field = blobs(7, 90, 256.);
        let c = render(&field, shape, ScaleMat::identity(), (0., 0.));
        let a = render(&field, shape, ScaleMat::identity(), (40., 20.));
        match align(&AlignImage::new(a.view(), 1), &AlignImage::new(c.view(), 1), &options) {
            Ok(result) => assert_eq!(result.working_binning, 13),
            Err(err) => assert!(
                matches!(err, Error::ImageTooSmall { .. } | Error::NoValidPeak { .. }),
                "{err:?}"
            ),
        }
    }

    #[test]
    fn rotated_footprint_fits() {
        let rect = footprint(&ScaleMat::rotation(30.), (200, 200), (200, 200));
        assert!(rect.width() > 100 && rect.height() > 100);
        assert!(rect.width() < 200 && rect.height() < 200);
        let full = footprint(&ScaleMat::identity(), (200, 200), (200, 200));
        assert!(full.width() >= 196 && full.height() >= 196);
    }

    #[test]
    fn auto_trim_finds_dark_border() {
        let mut rng = NoiseRng::seed_from_u64(5);
        let mut arr = Array2::random_using((200, 200), Uniform::new(0.8, 1.2), &mut rng);
        arr.slice_mut(s![.., 0..10]).fill(0.);
        arr.slice_mut(s![0..10, ..]).fill(0.);
        let rect = auto_trim(&arr);
        assert!(rect.x0 >= 10 && rect.x0 <= 16, "{rect:?}");
        assert!(rect.y0 >= 10 && rect.y0 <= 16, "{rect:?}");
        assert_eq!((rect.x1, rect.y1), (200, 200));

        let clean = Array2::random_using((200, 200), Uniform::new(0.8, 1.2), &mut rng);
        assert_eq!(auto_trim(&clean), Rect::full((200, 200)));
    }

    #[test]
    fn options_defaults_and_serde() {
        let options = AlignOptions::default()
            .with_pad(PadMode::Full)
            .with_conical_tilt(ConicalTilt {
                tilt_a: 50.,
                tilt_c: 0.,
                axis_deg: 90.,
            })
            .output_only();
        assert_eq!(options.min_overlap_pixels, 1500);
        assert_eq!(options.apply, ApplyMode::None);
        let json = serde_json::to_string(&options).unwrap();
        let back: AlignOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back, options);
        let partial: AlignOptions = serde_json::from_str(r#"{"max_peaks": 4}"#).unwrap();
        assert_eq!(partial.max_peaks, 4);
        assert_eq!(partial.target_size, 512);
        assert!(AlignOptions::default().pre_transform().is_none());

        // axis along Y: X is stretched by cos(0) / cos(50)
        let m = options.pre_transform().unwrap();
        let (x, y) = m.apply(1., 1.);
        assert_abs_diff_eq!(x, 1. / 50f64.to_radians().cos(), epsilon = 1e-9);
        assert_abs_diff_eq!(y, 1., epsilon = 1e-9);
    }
}
