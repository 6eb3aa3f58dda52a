//! Filling calibration gaps from neighbouring measurements.
//!
//! Every kind of calibration is resolved by the same ladder of tiers, tried in order
//! until one yields a value:
//!
//! 1. a direct measurement at the requested (mag, camera);
//! 2. the same camera at other mags the value can transfer to;
//! 3. other compatible cameras at the same mag;
//! 4. any camera at any transferable mag;
//! 5. the nominal magnification table.
//!
//! Within a tier the candidate with the lowest derivation level wins, then the one
//! nearest in mag index. Rotation reverses that order: a nearby measurement reached
//! through a nominal rotation step beats a distant one reached through measured steps.
//!
//! Matrices are carried between mags and cameras through the specimen plane:
//! `A_target = S_target · S_source⁻¹ · A_source`, with `S` the specimen-to-camera map
//! built from the resolved pixel size and rotation.

use std::fmt;

use itertools::{iproduct, Itertools};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::matrix::ScaleMat;
use crate::scope::ScopeSetup;
use crate::store::CalibrationStore;

/// Derivation level given to values taken from the nominal mag table.
pub const NOMINAL_LEVEL: u32 = 9;

/// The four calibration kinds that can be resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CalKind {
    /// Microns per unbinned camera pixel.
    PixelSize,
    /// Absolute image rotation in degrees.
    Rotation,
    /// Image-shift to camera matrix.
    ImageShift,
    /// Stage to camera matrix.
    Stage,
}

impl fmt::Display for CalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CalKind::PixelSize => "pixel size",
            CalKind::Rotation => "rotation",
            CalKind::ImageShift => "image shift",
            CalKind::Stage => "stage",
        };
        f.write_str(name)
    }
}

/// Which rung of the ladder produced a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
    /// Directly measured.
    Direct,
    /// Same camera, nearby mag.
    SameCamera,
    /// Same mag, other compatible camera.
    OtherCamera,
    /// Any camera, nearest transferable mag.
    Widened,
    /// Nominal mag table.
    Nominal,
}

/// A resolved calibration value and how it was obtained.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Resolved<T> {
    /// The value.
    pub value: T,
    /// Propagation hops; 0 for measured values, [`NOMINAL_LEVEL`] for table values.
    pub level: u32,
    /// Tier that produced the value.
    pub tier: Tier,
    /// (mag, camera) of the measurement it came from, `None` for nominal values.
    pub source: Option<(usize, usize)>,
}

/// Scalar or matrix result of [`DerivedTable::resolve`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum CalValue {
    /// Pixel size or rotation.
    Scalar(f64),
    /// Image-shift or stage matrix.
    Matrix(ScaleMat),
}

impl CalValue {
    /// Whether the value is "not available": zero scalar or null matrix.
    pub fn is_missing(&self) -> bool {
        match self {
            CalValue::Scalar(v) => *v == 0. || *v >= crate::store::UNKNOWN_ROTATION,
            CalValue::Matrix(m) => m.is_null(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum TieBreak {
    LevelFirst,
    DistanceFirst,
}

#[derive(Clone, Copy, Debug)]
struct Candidate<T> {
    value: T,
    level: u32,
    distance: usize,
    source: (usize, usize),
}

/// Read-only view used by the tier functions.
struct Search<'a> {
    setup: &'a ScopeSetup,
    store: &'a CalibrationStore,
    pixel: &'a [Option<Resolved<f64>>],
    rotation: &'a [Option<Resolved<f64>>],
}

type TierFn<T> = fn(&Search<'_>, usize, usize) -> Vec<Candidate<T>>;

impl Search<'_> {
    fn idx(&self, mag: usize, camera: usize) -> usize {
        mag * self.setup.num_cameras() + camera
    }

    fn measured_pixel(&self, mag: usize, camera: usize) -> Option<f64> {
        self.store
            .entry(mag, camera)
            .ok()
            .filter(|e| e.has_measured_pixel())
            .map(|e| e.pixel_size)
    }

    fn measured_rotation(&self, mag: usize, camera: usize) -> Option<f64> {
        self.store
            .entry(mag, camera)
            .ok()
            .filter(|e| e.has_measured_rotation())
            .map(|e| e.rotation)
    }

    fn measured_matrix(&self, kind: CalKind, mag: usize, camera: usize) -> Option<ScaleMat> {
        let entry = self.store.entry(mag, camera).ok()?;
        let mat = match kind {
            CalKind::ImageShift => entry.is_matrix,
            CalKind::Stage => entry.stage_matrix,
            _ => return None,
        };
        (!mat.is_null()).then_some(mat)
    }

    /// Specimen-to-camera map from the already resolved pixel size and rotation.
    fn specimen_to_camera(&self, mag: usize, camera: usize) -> Option<ScaleMat> {
        let i = self.idx(mag, camera);
        let pixel = self.pixel.get(i).copied().flatten()?.value;
        let rotation = self.rotation.get(i).copied().flatten()?.value;
        Some(specimen_to_camera(
            pixel,
            rotation,
            self.setup.cameras[camera].y_inverted,
        ))
    }

    /// Carry a matrix measured at `(src_mag, src_cam)` to `(mag, camera)`.
    fn carry(
        &self,
        mat: ScaleMat,
        src_mag: usize,
        src_cam: usize,
        mag: usize,
        camera: usize,
    ) -> Option<ScaleMat> {
        let target = self.specimen_to_camera(mag, camera)?;
        let source = self.specimen_to_camera(src_mag, src_cam)?.invert(false);
        let out = target.multiply(&source).multiply(&mat);
        (!out.is_null()).then_some(out)
    }

    /// Rotation change from `from` to `to`, preferring measured steps. Returns the
    /// change and the number of nominal steps used.
    fn rotation_path(&self, camera: usize, from: usize, to: usize) -> (f64, u32) {
        let (lo, hi) = if from <= to { (from, to) } else { (to, from) };
        let mut sum = 0.;
        let mut nominal = 0;
        for k in lo + 1..=hi {
            let measured = std::iter::once(camera)
                .chain(0..self.setup.num_cameras())
                .filter_map(|c| self.store.entry(k, c).ok())
                .find(|e| e.has_delta_rotation())
                .map(|e| e.delta_rotation);
            match measured {
                Some(delta) => sum += delta,
                None => {
                    sum += self.setup.mags[k].nominal_rotation
                        - self.setup.mags[k - 1].nominal_rotation;
                    nominal += 1;
                }
            }
        }
        if to < from {
            sum = -sum;
        }
        (sum, nominal)
    }

    /// Source (mag, camera) pairs for a tier, honouring camera ranges and the
    /// transfer predicate.
    fn sources(
        &self,
        tier: Tier,
        mag: usize,
        camera: usize,
        transfers: fn(&ScopeSetup, usize, usize) -> bool,
    ) -> Vec<(usize, usize)> {
        let setup = self.setup;
        iproduct!(0..setup.num_mags(), 0..setup.num_cameras())
            .filter(|&(m, c)| match tier {
                Tier::SameCamera => c == camera && m != mag,
                Tier::OtherCamera => m == mag && c != camera && setup.cameras_compatible(c, camera),
                Tier::Widened => c != camera,
                Tier::Direct | Tier::Nominal => false,
            })
            .filter(|&(m, c)| setup.camera_usable(c, m) && transfers(setup, m, mag))
            .collect_vec()
    }
}

/// Specimen-to-camera map for a pixel size (microns) and rotation (degrees).
pub fn specimen_to_camera(pixel_um: f64, rotation: f64, y_inverted: bool) -> ScaleMat {
    if pixel_um <= 0. {
        return ScaleMat::null();
    }
    let base = ScaleMat::scale_rotate(1. / pixel_um, rotation);
    if y_inverted {
        ScaleMat::flip_y().multiply(&base)
    } else {
        base
    }
}

fn same_range(setup: &ScopeSetup, from: usize, to: usize) -> bool {
    setup.same_range(from, to)
}

fn no_is_boundary(setup: &ScopeSetup, from: usize, to: usize) -> bool {
    !setup.crosses_is_boundary(from, to)
}

fn tier_level(tier: Tier) -> u32 {
    match tier {
        Tier::Direct => 0,
        Tier::SameCamera | Tier::OtherCamera => 1,
        Tier::Widened => 2,
        Tier::Nominal => NOMINAL_LEVEL,
    }
}

fn normalize_degrees(mut deg: f64) -> f64 {
    while deg > 180. {
        deg -= 360.;
    }
    while deg <= -180. {
        deg += 360.;
    }
    deg
}

fn pixel_candidates(
    search: &Search<'_>,
    tier: Tier,
    mag: usize,
    camera: usize,
) -> Vec<Candidate<f64>> {
    let setup = search.setup;
    let target_nominal = setup.nominal_pixel_size(mag, camera);
    search
        .sources(tier, mag, camera, same_range)
        .into_iter()
        .filter_map(|(m, c)| {
            let measured = search.measured_pixel(m, c)?;
            let source_nominal = setup.nominal_pixel_size(m, c);
            if source_nominal <= 0. {
                return None;
            }
            Some(Candidate {
                value: measured * target_nominal / source_nominal,
                level: tier_level(tier),
                distance: m.abs_diff(mag),
                source: (m, c),
            })
        })
        .collect()
}

fn pixel_direct(search: &Search<'_>, mag: usize, camera: usize) -> Vec<Candidate<f64>> {
    search
        .measured_pixel(mag, camera)
        .map(|value| Candidate {
            value,
            level: 0,
            distance: 0,
            source: (mag, camera),
        })
        .into_iter()
        .collect()
}

fn pixel_same_camera(search: &Search<'_>, mag: usize, camera: usize) -> Vec<Candidate<f64>> {
    pixel_candidates(search, Tier::SameCamera, mag, camera)
}

fn pixel_other_camera(search: &Search<'_>, mag: usize, camera: usize) -> Vec<Candidate<f64>> {
    pixel_candidates(search, Tier::OtherCamera, mag, camera)
}

fn pixel_widened(search: &Search<'_>, mag: usize, camera: usize) -> Vec<Candidate<f64>> {
    pixel_candidates(search, Tier::Widened, mag, camera)
}

fn pixel_nominal(search: &Search<'_>, mag: usize, camera: usize) -> Vec<Candidate<f64>> {
    let value = search.setup.nominal_pixel_size(mag, camera);
    nominal_candidate(value > 0., value, mag, camera)
}

fn rotation_candidates(
    search: &Search<'_>,
    tier: Tier,
    mag: usize,
    camera: usize,
) -> Vec<Candidate<f64>> {
    let setup = search.setup;
    search
        .sources(tier, mag, camera, same_range)
        .into_iter()
        .filter_map(|(m, c)| {
            let measured = search.measured_rotation(m, c)?;
            let (path, nominal_steps) = search.rotation_path(camera, m, mag);
            let offset = setup.cameras[camera].rotation_offset - setup.cameras[c].rotation_offset;
            Some(Candidate {
                value: normalize_degrees(measured + path + offset),
                level: (tier_level(tier) + nominal_steps).min(NOMINAL_LEVEL - 1),
                distance: m.abs_diff(mag),
                source: (m, c),
            })
        })
        .collect()
}

fn rotation_direct(search: &Search<'_>, mag: usize, camera: usize) -> Vec<Candidate<f64>> {
    search
        .measured_rotation(mag, camera)
        .map(|value| Candidate {
            value,
            level: 0,
            distance: 0,
            source: (mag, camera),
        })
        .into_iter()
        .collect()
}

fn rotation_same_camera(search: &Search<'_>, mag: usize, camera: usize) -> Vec<Candidate<f64>> {
    rotation_candidates(search, Tier::SameCamera, mag, camera)
}

fn rotation_other_camera(search: &Search<'_>, mag: usize, camera: usize) -> Vec<Candidate<f64>> {
    rotation_candidates(search, Tier::OtherCamera, mag, camera)
}

fn rotation_widened(search: &Search<'_>, mag: usize, camera: usize) -> Vec<Candidate<f64>> {
    rotation_candidates(search, Tier::Widened, mag, camera)
}

fn rotation_nominal(search: &Search<'_>, mag: usize, camera: usize) -> Vec<Candidate<f64>> {
    let value = normalize_degrees(search.setup.nominal_rotation(mag, camera));
    nominal_candidate(true, value, mag, camera)
}

fn nominal_candidate<T>(ok: bool, value: T, mag: usize, camera: usize) -> Vec<Candidate<T>> {
    if !ok {
        return Vec::new();
    }
    vec![Candidate {
        value,
        level: NOMINAL_LEVEL,
        distance: 0,
        source: (mag, camera),
    }]
}

fn matrix_candidates(
    search: &Search<'_>,
    kind: CalKind,
    tier: Tier,
    mag: usize,
    camera: usize,
) -> Vec<Candidate<ScaleMat>> {
    let transfers: fn(&ScopeSetup, usize, usize) -> bool = match kind {
        CalKind::ImageShift => no_is_boundary,
        _ => same_range,
    };
    if tier == Tier::Direct {
        return search
            .measured_matrix(kind, mag, camera)
            .map(|value| Candidate {
                value,
                level: 0,
                distance: 0,
                source: (mag, camera),
            })
            .into_iter()
            .collect();
    }
    search
        .sources(tier, mag, camera, transfers)
        .into_iter()
        .filter_map(|(m, c)| {
            let measured = search.measured_matrix(kind, m, c)?;
            let value = search.carry(measured, m, c, mag, camera)?;
            Some(Candidate {
                value,
                level: tier_level(tier),
                distance: m.abs_diff(mag),
                source: (m, c),
            })
        })
        .collect()
}

fn is_direct(search: &Search<'_>, mag: usize, camera: usize) -> Vec<Candidate<ScaleMat>> {
    matrix_candidates(search, CalKind::ImageShift, Tier::Direct, mag, camera)
}

fn is_same_camera(search: &Search<'_>, mag: usize, camera: usize) -> Vec<Candidate<ScaleMat>> {
    matrix_candidates(search, CalKind::ImageShift, Tier::SameCamera, mag, camera)
}

fn is_other_camera(search: &Search<'_>, mag: usize, camera: usize) -> Vec<Candidate<ScaleMat>> {
    matrix_candidates(search, CalKind::ImageShift, Tier::OtherCamera, mag, camera)
}

fn is_widened(search: &Search<'_>, mag: usize, camera: usize) -> Vec<Candidate<ScaleMat>> {
    matrix_candidates(search, CalKind::ImageShift, Tier::Widened, mag, camera)
}

fn is_nominal(search: &Search<'_>, mag: usize, camera: usize) -> Vec<Candidate<ScaleMat>> {
    let um_per_unit = search.setup.nominal_is_um(mag);
    let Some(spec_to_cam) = search.specimen_to_camera(mag, camera) else {
        return Vec::new();
    };
    let mut is_to_spec = ScaleMat::scale(um_per_unit);
    if search.setup.kind.image_shift_y_inverted() {
        is_to_spec = is_to_spec.multiply(&ScaleMat::flip_y());
    }
    let value = spec_to_cam.multiply(&is_to_spec);
    nominal_candidate(um_per_unit > 0. && !value.is_null(), value, mag, camera)
}

fn stage_direct(search: &Search<'_>, mag: usize, camera: usize) -> Vec<Candidate<ScaleMat>> {
    matrix_candidates(search, CalKind::Stage, Tier::Direct, mag, camera)
}

fn stage_same_camera(search: &Search<'_>, mag: usize, camera: usize) -> Vec<Candidate<ScaleMat>> {
    matrix_candidates(search, CalKind::Stage, Tier::SameCamera, mag, camera)
}

fn stage_other_camera(search: &Search<'_>, mag: usize, camera: usize) -> Vec<Candidate<ScaleMat>> {
    matrix_candidates(search, CalKind::Stage, Tier::OtherCamera, mag, camera)
}

fn stage_widened(search: &Search<'_>, mag: usize, camera: usize) -> Vec<Candidate<ScaleMat>> {
    matrix_candidates(search, CalKind::Stage, Tier::Widened, mag, camera)
}

fn stage_nominal(search: &Search<'_>, mag: usize, camera: usize) -> Vec<Candidate<ScaleMat>> {
    let Some(spec_to_cam) = search.specimen_to_camera(mag, camera) else {
        return Vec::new();
    };
    let value = spec_to_cam.multiply(&search.setup.kind.stage_to_specimen());
    nominal_candidate(!value.is_null(), value, mag, camera)
}

const PIXEL_LADDER: [(Tier, TierFn<f64>); 5] = [
    (Tier::Direct, pixel_direct),
    (Tier::SameCamera, pixel_same_camera),
    (Tier::OtherCamera, pixel_other_camera),
    (Tier::Widened, pixel_widened),
    (Tier::Nominal, pixel_nominal),
];

const ROTATION_LADDER: [(Tier, TierFn<f64>); 5] = [
    (Tier::Direct, rotation_direct),
    (Tier::SameCamera, rotation_same_camera),
    (Tier::OtherCamera, rotation_other_camera),
    (Tier::Widened, rotation_widened),
    (Tier::Nominal, rotation_nominal),
];

const IS_LADDER: [(Tier, TierFn<ScaleMat>); 5] = [
    (Tier::Direct, is_direct),
    (Tier::SameCamera, is_same_camera),
    (Tier::OtherCamera, is_other_camera),
    (Tier::Widened, is_widened),
    (Tier::Nominal, is_nominal),
];

const STAGE_LADDER: [(Tier, TierFn<ScaleMat>); 5] = [
    (Tier::Direct, stage_direct),
    (Tier::SameCamera, stage_same_camera),
    (Tier::OtherCamera, stage_other_camera),
    (Tier::Widened, stage_widened),
    (Tier::Nominal, stage_nominal),
];

fn climb<T: Copy>(
    ladder: &[(Tier, TierFn<T>)],
    order: TieBreak,
    search: &Search<'_>,
    mag: usize,
    camera: usize,
) -> Option<Resolved<T>> {
    ladder.iter().find_map(|(tier, rung)| {
        rung(search, mag, camera)
            .into_iter()
            .min_by_key(|c| match order {
                TieBreak::LevelFirst => (c.level as usize, c.distance, c.source),
                TieBreak::DistanceFirst => (c.distance, c.level as usize, c.source),
            })
            .map(|c| Resolved {
                value: c.value,
                level: c.level,
                tier: *tier,
                source: (*tier != Tier::Nominal).then_some(c.source),
            })
    })
}

/// Every calibration kind resolved for every (mag, camera) pair.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DerivedTable {
    num_cameras: usize,
    pixel: Vec<Option<Resolved<f64>>>,
    rotation: Vec<Option<Resolved<f64>>>,
    image_shift: Vec<Option<Resolved<ScaleMat>>>,
    stage: Vec<Option<Resolved<ScaleMat>>>,
    nominal: Vec<(CalKind, usize, usize)>,
}

impl DerivedTable {
    /// Resolve everything from the measured values in `store`.
    ///
    /// Previously derived pixel sizes and rotations are discarded first and the new
    /// ones written back with their derivation levels, so running this twice on the
    /// same measurements gives identical results.
    pub fn propagate(setup: &ScopeSetup, store: &mut CalibrationStore) -> Self {
        store.clear_derived();
        let pairs = iproduct!(0..setup.num_mags(), 0..setup.num_cameras()).collect_vec();

        let (pixel, rotation) = {
            let empty: &[Option<Resolved<f64>>] = &[];
            let search = Search {
                setup,
                store,
                pixel: empty,
                rotation: empty,
            };
            let pixel = pairs
                .iter()
                .map(|&(m, c)| climb(&PIXEL_LADDER, TieBreak::LevelFirst, &search, m, c))
                .collect_vec();
            let rotation = pairs
                .iter()
                .map(|&(m, c)| climb(&ROTATION_LADDER, TieBreak::DistanceFirst, &search, m, c))
                .collect_vec();
            (pixel, rotation)
        };

        let (image_shift, stage) = {
            let search = Search {
                setup,
                store,
                pixel: &pixel,
                rotation: &rotation,
            };
            let image_shift = pairs
                .iter()
                .map(|&(m, c)| climb(&IS_LADDER, TieBreak::LevelFirst, &search, m, c))
                .collect_vec();
            let stage = pairs
                .iter()
                .map(|&(m, c)| climb(&STAGE_LADDER, TieBreak::LevelFirst, &search, m, c))
                .collect_vec();
            (image_shift, stage)
        };

        for (&(m, c), (px, rot)) in pairs.iter().zip(pixel.iter().zip(&rotation)) {
            let Ok(entry) = store.entry_mut(m, c) else {
                continue;
            };
            if let Some(px) = px.filter(|r| r.level > 0) {
                entry.pixel_size = px.value;
                entry.pixel_level = px.level;
            }
            if let Some(rot) = rot.filter(|r| r.level > 0) {
                entry.rotation = rot.value;
                entry.rotation_level = rot.level;
            }
        }

        let mut nominal = Vec::new();
        for (kind, column) in [
            (CalKind::PixelSize, tiers_of(&pixel)),
            (CalKind::Rotation, tiers_of(&rotation)),
            (CalKind::ImageShift, tiers_of(&image_shift)),
            (CalKind::Stage, tiers_of(&stage)),
        ] {
            let counts = column.iter().flatten().counts();
            info!(
                "Resolved {kind} for {} of {} mag/camera pairs ({:?}).",
                column.iter().flatten().count(),
                pairs.len(),
                counts.iter().sorted().collect_vec()
            );
            nominal.extend(
                pairs
                    .iter()
                    .zip(&column)
                    .filter(|(_, t)| **t == Some(Tier::Nominal))
                    .map(|(&(m, c), _)| (kind, m, c)),
            );
        }

        Self {
            num_cameras: setup.num_cameras(),
            pixel,
            rotation,
            image_shift,
            stage,
            nominal,
        }
    }

    fn get<T: Copy>(
        &self,
        column: &[Option<Resolved<T>>],
        mag: usize,
        camera: usize,
    ) -> Option<Resolved<T>> {
        if camera >= self.num_cameras {
            return None;
        }
        column.get(mag * self.num_cameras + camera).copied().flatten()
    }

    /// Resolved pixel size in microns, if any tier produced one.
    pub fn pixel_size(&self, mag: usize, camera: usize) -> Option<Resolved<f64>> {
        self.get(&self.pixel, mag, camera)
    }

    /// Resolved rotation in degrees.
    pub fn rotation(&self, mag: usize, camera: usize) -> Option<Resolved<f64>> {
        self.get(&self.rotation, mag, camera)
    }

    /// Resolved image-shift to camera matrix.
    pub fn image_shift_matrix(&self, mag: usize, camera: usize) -> Option<Resolved<ScaleMat>> {
        self.get(&self.image_shift, mag, camera)
    }

    /// Resolved stage to camera matrix at zero tilt.
    pub fn stage_matrix(&self, mag: usize, camera: usize) -> Option<Resolved<ScaleMat>> {
        self.get(&self.stage, mag, camera)
    }

    /// Resolve any kind. Unresolved values come back as a zero scalar or null matrix
    /// with [`NOMINAL_LEVEL`]` + 1` as their level; this is not an error.
    pub fn resolve(&self, kind: CalKind, mag: usize, camera: usize) -> (CalValue, u32) {
        let missing = NOMINAL_LEVEL + 1;
        match kind {
            CalKind::PixelSize => self
                .pixel_size(mag, camera)
                .map_or((CalValue::Scalar(0.), missing), |r| (CalValue::Scalar(r.value), r.level)),
            CalKind::Rotation => self.rotation(mag, camera).map_or(
                (CalValue::Scalar(crate::store::UNKNOWN_ROTATION), missing),
                |r| (CalValue::Scalar(r.value), r.level),
            ),
            CalKind::ImageShift => self.image_shift_matrix(mag, camera).map_or(
                (CalValue::Matrix(ScaleMat::null()), missing),
                |r| (CalValue::Matrix(r.value), r.level),
            ),
            CalKind::Stage => self.stage_matrix(mag, camera).map_or(
                (CalValue::Matrix(ScaleMat::null()), missing),
                |r| (CalValue::Matrix(r.value), r.level),
            ),
        }
    }

    /// (kind, mag, camera) triples that fell through to the nominal table.
    pub fn nominal_fallbacks(&self) -> &[(CalKind, usize, usize)] {
        &self.nominal
    }

    /// One line per kind listing the mag indices that rely on nominal values, or
    /// `None` when everything is backed by a measurement.
    pub fn nominal_summary(&self) -> Option<String> {
        if self.nominal.is_empty() {
            return None;
        }
        let lines = self
            .nominal
            .iter()
            .chunk_by(|(kind, _, _)| *kind)
            .into_iter()
            .map(|(kind, group)| {
                let mags = group.map(|(_, m, c)| format!("{m}/{c}")).join(" ");
                format!("{kind} from nominal values at mag/camera {mags}")
            })
            .collect_vec();
        Some(lines.join("\n"))
    }

    /// Log the nominal-fallback summary.
    pub fn warn_nominal(&self) {
        if let Some(summary) = self.nominal_summary() {
            warn!("Calibrations derived only from the nominal mag table:\n{summary}");
        }
    }
}

fn tiers_of<T>(column: &[Option<Resolved<T>>]) -> Vec<Option<Tier>> {
    column.iter().map(|r| r.as_ref().map(|r| r.tier)).collect()
}
