//! Background correction: raw fluorescence -> background-subtracted
//! fluorescence (§4.B).
//!
//! Two registry entries, mirroring
//! `BACKGROUND_CORRECTION_ALGORITHMS` in
//! `original_source/.../utils/background_correction.py`: the tiled-spline
//! Schwarzfischer correction (`background_schwarzfischer`) and a simpler
//! morphological-opening correction (`background_morphological_opening`).

use half::f16;
use ndarray::Array2;

use crate::cancel::CancelToken;
use crate::error::{PipelineError, Result};
use crate::progress::{should_report, ProgressEvent, ProgressReporter};

/// The smallest float type intermediate background-correction computations
/// can use without losing information already present in the input (§4.B
/// step 7). Grounded on
/// `background_correction.py`'s `np.can_cast(fluor_chan, np.float16)` /
/// `np.float32` dtype ladder; here the check is per-value rather than
/// per-dtype, since the spec phrases it as "the input losslessly casts"
/// rather than numpy's static dtype-safety rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkingPrecision {
    F16,
    F32,
    F64,
}

impl WorkingPrecision {
    fn select(stack: &[Array2<f64>]) -> Self {
        let fits = |roundtrip: fn(f64) -> f64| {
            stack.iter().all(|frame| frame.iter().all(|&v| roundtrip(v) == v))
        };
        if fits(|v| f16::from_f64(v).to_f64()) {
            Self::F16
        } else if fits(|v| v as f32 as f64) {
            Self::F32
        } else {
            Self::F64
        }
    }

    /// Round a value down to this precision and back, emulating storing
    /// intermediate results at the selected working type.
    fn round(self, v: f64) -> f64 {
        match self {
            Self::F16 => f16::from_f64(v).to_f64(),
            Self::F32 => v as f32 as f64,
            Self::F64 => v,
        }
    }
}

/// One tile: its center coordinate and the pixel span it covers.
struct Tile {
    center: f64,
    start: usize,
    end: usize,
}

/// Build `2*div - 1` overlapping-strip borders evenly placed over `[0, n]`,
/// then pair non-adjacent borders two apart into `2*div - 3` tiles, per
/// `_make_tiles` in the original background-correction module.
fn make_tiles(n: usize, div: usize) -> Vec<Tile> {
    let n_borders = 2 * div - 1;
    let mut borders = Vec::with_capacity(n_borders);
    for i in 0..n_borders {
        let frac = i as f64 * n as f64 / (n_borders - 1) as f64;
        borders.push(frac.round() as usize);
    }
    let mut tiles = Vec::with_capacity(n_borders.saturating_sub(2));
    for i in 0..n_borders.saturating_sub(2) {
        let b1 = borders[i];
        let b2 = borders[i + 2];
        tiles.push(Tile {
            center: (b1 + b2) as f64 / 2.0,
            start: b1,
            end: b2,
        });
    }
    tiles
}

fn median(values: &mut [f64]) -> f64 {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}

/// Natural cubic spline through `(xs[i], ys[i])`, evaluable anywhere
/// (extrapolates using the boundary segment's polynomial).
struct CubicSpline {
    xs: Vec<f64>,
    ys: Vec<f64>,
    /// Second derivatives at each knot.
    m: Vec<f64>,
}

impl CubicSpline {
    fn fit(xs: &[f64], ys: &[f64]) -> Self {
        let n = xs.len();
        if n < 3 {
            return Self {
                xs: xs.to_vec(),
                ys: ys.to_vec(),
                m: vec![0.0; n],
            };
        }
        let h: Vec<f64> = (0..n - 1).map(|i| xs[i + 1] - xs[i]).collect();
        // Thomas algorithm for the tridiagonal natural-spline system.
        let mut sub = vec![0.0; n];
        let mut diag = vec![1.0; n];
        let mut sup = vec![0.0; n];
        let mut rhs = vec![0.0; n];
        for i in 1..n - 1 {
            sub[i] = h[i - 1];
            diag[i] = 2.0 * (h[i - 1] + h[i]);
            sup[i] = h[i];
            rhs[i] = 6.0 * ((ys[i + 1] - ys[i]) / h[i] - (ys[i] - ys[i - 1]) / h[i - 1]);
        }
        for i in 1..n - 1 {
            let w = sub[i] / diag[i - 1];
            diag[i] -= w * sup[i - 1];
            rhs[i] -= w * rhs[i - 1];
        }
        let mut m = vec![0.0; n];
        for i in (1..n - 1).rev() {
            m[i] = (rhs[i] - sup[i] * m[i + 1]) / diag[i];
        }
        Self {
            xs: xs.to_vec(),
            ys: ys.to_vec(),
            m,
        }
    }

    fn eval(&self, x: f64) -> f64 {
        let n = self.xs.len();
        if n == 1 {
            return self.ys[0];
        }
        if n == 2 {
            let t = (x - self.xs[0]) / (self.xs[1] - self.xs[0]);
            return self.ys[0] + t * (self.ys[1] - self.ys[0]);
        }
        // Locate the segment, clamping to the boundary segment for
        // out-of-range `x` (linear/cubic extrapolation of that segment).
        let mut i = match self.xs.partition_point(|&xi| xi <= x) {
            0 => 1,
            k if k >= n => n - 1,
            k => k,
        };
        if i == 0 {
            i = 1;
        }
        let lo = i - 1;
        let hi = i;
        let h = self.xs[hi] - self.xs[lo];
        let a = (self.xs[hi] - x) / h;
        let b = (x - self.xs[lo]) / h;
        a * self.ys[lo]
            + b * self.ys[hi]
            + ((a.powi(3) - a) * self.m[lo] + (b.powi(3) - b) * self.m[hi]) * (h * h) / 6.0
    }
}

/// Fit a separable (tensor-product) bicubic spline over `(x_centers,
/// y_centers, support[x][y])` and evaluate it at every integer pixel,
/// yielding a `(height, width)` background surface.
fn spline_surface(
    x_centers: &[f64],
    y_centers: &[f64],
    support: &Array2<f64>,
    height: usize,
    width: usize,
) -> Array2<f64> {
    let ny = y_centers.len();
    let nx = x_centers.len();
    // First pass: interpolate along x for each tile row -> (ny, width).
    let mut along_x = Array2::<f64>::zeros((ny, width));
    for iy in 0..ny {
        let row: Vec<f64> = (0..nx).map(|ix| support[[ix, iy]]).collect();
        let spline = CubicSpline::fit(x_centers, &row);
        for px in 0..width {
            along_x[[iy, px]] = spline.eval(px as f64);
        }
    }
    // Second pass: interpolate along y for each pixel column -> (height, width).
    let mut out = Array2::<f64>::zeros((height, width));
    for px in 0..width {
        let col: Vec<f64> = (0..ny).map(|iy| along_x[[iy, px]]).collect();
        let spline = CubicSpline::fit(y_centers, &col);
        for py in 0..height {
            out[[py, px]] = spline.eval(py as f64);
        }
    }
    out
}

/// One background-correction algorithm, selected from the registry by name.
pub trait Correct: Send + Sync {
    fn name(&self) -> &'static str;

    fn correct(
        &self,
        fluor_stack: &[Array2<f64>],
        mask_stack: &[Array2<bool>],
        fov: usize,
        cancel: &CancelToken,
        progress: &dyn ProgressReporter,
    ) -> Result<Vec<Array2<f32>>>;
}

fn check_shapes(fluor_stack: &[Array2<f64>], mask_stack: &[Array2<bool>]) -> Result<()> {
    if fluor_stack.len() != mask_stack.len() {
        return Err(PipelineError::ShapeMismatch(format!(
            "fluor stack has {} frames, mask stack has {}",
            fluor_stack.len(),
            mask_stack.len()
        )));
    }
    if let (Some(f0), Some(m0)) = (fluor_stack.first(), mask_stack.first()) {
        if f0.dim() != m0.dim() {
            return Err(PipelineError::ShapeMismatch(format!(
                "fluor frame shape {:?} != mask frame shape {:?}",
                f0.dim(),
                m0.dim()
            )));
        }
    }
    Ok(())
}

/// Tiled-spline background correction (§4.B), grounded on
/// `background_schwarzfischer`.
pub struct Schwarzfischer {
    pub div_horiz: usize,
    pub div_vert: usize,
}

impl Default for Schwarzfischer {
    fn default() -> Self {
        Self {
            div_horiz: 7,
            div_vert: 5,
        }
    }
}

impl Correct for Schwarzfischer {
    fn name(&self) -> &'static str {
        "schwarzfischer"
    }

    fn correct(
        &self,
        fluor_stack: &[Array2<f64>],
        mask_stack: &[Array2<bool>],
        fov: usize,
        cancel: &CancelToken,
        progress: &dyn ProgressReporter,
    ) -> Result<Vec<Array2<f32>>> {
        check_shapes(fluor_stack, mask_stack)?;
        let n_frames = fluor_stack.len();
        if n_frames == 0 {
            return Ok(Vec::new());
        }
        let (height, width) = fluor_stack[0].dim();
        let precision = WorkingPrecision::select(fluor_stack);

        let tiles_y = make_tiles(height, self.div_vert);
        let tiles_x = make_tiles(width, self.div_horiz);
        let y_centers: Vec<f64> = tiles_y.iter().map(|t| t.center).collect();
        let x_centers: Vec<f64> = tiles_x.iter().map(|t| t.center).collect();

        let mut bg_frames = Vec::with_capacity(n_frames);
        let mut bg_means = Vec::with_capacity(n_frames);

        for (t, (frame, mask)) in fluor_stack.iter().zip(mask_stack.iter()).enumerate() {
            cancel.check()?;
            if should_report(t, n_frames, 30) {
                progress.report(ProgressEvent {
                    stage: "BackgroundCorrect".into(),
                    fov,
                    t,
                    total: n_frames,
                    message: "Interpolating background".into(),
                });
            }

            let mut support = Array2::<f64>::zeros((tiles_x.len(), tiles_y.len()));
            for (iy, ty) in tiles_y.iter().enumerate() {
                for (ix, tx) in tiles_x.iter().enumerate() {
                    let mut values = Vec::new();
                    for y in ty.start..ty.end {
                        for x in tx.start..tx.end {
                            if !mask[[y, x]] {
                                values.push(frame[[y, x]]);
                            }
                        }
                    }
                    if values.is_empty() {
                        return Err(PipelineError::NumericFailure(format!(
                            "tile (x={}..{}, y={}..{}) has no background pixels to support the spline",
                            tx.start, tx.end, ty.start, ty.end
                        )));
                    }
                    support[[ix, iy]] = precision.round(median(&mut values));
                }
            }

            let mut bg = spline_surface(&x_centers, &y_centers, &support, height, width);
            bg.mapv_inplace(|v| precision.round(v));
            let mean = precision.round(bg.iter().sum::<f64>() / bg.len() as f64);
            bg_means.push(mean);
            bg_frames.push(bg);
        }

        // Pixel-wise median over time of (B_t / m_t), the gain surface.
        let mut gain = Array2::<f64>::zeros((height, width));
        let mut ratios = vec![0.0; n_frames];
        for y in 0..height {
            for x in 0..width {
                for t in 0..n_frames {
                    ratios[t] = bg_frames[t][[y, x]] / bg_means[t];
                }
                gain[[y, x]] = precision.round(median(&mut ratios));
            }
        }

        let mut corrected = Vec::with_capacity(n_frames);
        for (t, frame) in fluor_stack.iter().enumerate() {
            let bg = &bg_frames[t];
            let out = Array2::from_shape_fn((height, width), |(y, x)| {
                precision.round((frame[[y, x]] - bg[[y, x]]) / gain[[y, x]]) as f32
            });
            corrected.push(out);
        }

        progress.report(ProgressEvent {
            stage: "BackgroundCorrect".into(),
            fov,
            t: n_frames.saturating_sub(1),
            total: n_frames,
            message: "Background correction complete".into(),
        });

        Ok(corrected)
    }
}

/// Greyscale morphological opening (erode then dilate with a square
/// footprint), subtracted from the frame and clamped at 0. Grounded on
/// `background_morphological_opening`.
pub struct MorphOpen {
    pub footprint_size: usize,
}

impl Default for MorphOpen {
    fn default() -> Self {
        Self { footprint_size: 25 }
    }
}

fn grey_erode(frame: &Array2<f64>, r: isize) -> Array2<f64> {
    let (h, w) = frame.dim();
    Array2::from_shape_fn((h, w), |(y, x)| {
        let mut m = f64::INFINITY;
        for dy in -r..=r {
            for dx in -r..=r {
                let sy = y as isize + dy;
                let sx = x as isize + dx;
                if sy >= 0 && sx >= 0 && (sy as usize) < h && (sx as usize) < w {
                    m = m.min(frame[[sy as usize, sx as usize]]);
                }
            }
        }
        m
    })
}

fn grey_dilate(frame: &Array2<f64>, r: isize) -> Array2<f64> {
    let (h, w) = frame.dim();
    Array2::from_shape_fn((h, w), |(y, x)| {
        let mut m = f64::NEG_INFINITY;
        for dy in -r..=r {
            for dx in -r..=r {
                let sy = y as isize + dy;
                let sx = x as isize + dx;
                if sy >= 0 && sx >= 0 && (sy as usize) < h && (sx as usize) < w {
                    m = m.max(frame[[sy as usize, sx as usize]]);
                }
            }
        }
        m
    })
}

impl Correct for MorphOpen {
    fn name(&self) -> &'static str {
        "morph-open"
    }

    fn correct(
        &self,
        fluor_stack: &[Array2<f64>],
        mask_stack: &[Array2<bool>],
        fov: usize,
        cancel: &CancelToken,
        progress: &dyn ProgressReporter,
    ) -> Result<Vec<Array2<f32>>> {
        check_shapes(fluor_stack, mask_stack)?;
        let n_frames = fluor_stack.len();
        let r = (self.footprint_size / 2) as isize;
        let precision = WorkingPrecision::select(fluor_stack);
        let mut out = Vec::with_capacity(n_frames);
        for (t, frame) in fluor_stack.iter().enumerate() {
            cancel.check()?;
            if should_report(t, n_frames.max(1), 30) {
                progress.report(ProgressEvent {
                    stage: "BackgroundCorrect".into(),
                    fov,
                    t,
                    total: n_frames,
                    message: "Estimating background (morph open)".into(),
                });
            }
            let mut bg = grey_dilate(&grey_erode(frame, r), r);
            bg.mapv_inplace(|v| precision.round(v));
            let corrected = Array2::from_shape_fn(frame.dim(), |(y, x)| {
                precision.round((frame[[y, x]] - bg[[y, x]]).max(0.0)) as f32
            });
            out.push(corrected);
        }
        Ok(out)
    }
}

/// The closed set of background-correction algorithms, selected by name.
pub enum BackgroundAlgorithm {
    Schwarzfischer(Schwarzfischer),
    MorphOpen(MorphOpen),
}

impl BackgroundAlgorithm {
    pub fn get(name: &str) -> Result<Self> {
        match name {
            "schwarzfischer" => Ok(Self::Schwarzfischer(Schwarzfischer::default())),
            "morph-open" => Ok(Self::MorphOpen(MorphOpen::default())),
            other => Err(PipelineError::InvalidArgument(format!(
                "unknown background correction algorithm: {other}"
            ))),
        }
    }

    pub fn as_dyn(&self) -> &dyn Correct {
        match self {
            Self::Schwarzfischer(a) => a,
            Self::MorphOpen(a) => a,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NullReporter;

    #[test]
    fn precision_selection_prefers_the_smallest_lossless_type() {
        let small_ints = vec![Array2::from_elem((2, 2), 3.0)];
        assert_eq!(WorkingPrecision::select(&small_ints), WorkingPrecision::F16);

        let needs_f32 = vec![Array2::from_elem((2, 2), 100_000.0)];
        assert_eq!(WorkingPrecision::select(&needs_f32), WorkingPrecision::F32);

        let needs_f64 = vec![Array2::from_elem((2, 2), std::f64::consts::PI)];
        assert_eq!(WorkingPrecision::select(&needs_f64), WorkingPrecision::F64);
    }

    #[test]
    fn flat_background_is_nearly_cancelled() {
        let n = 20;
        let mut mask = Array2::from_elem((n, n), false);
        for y in 8..12 {
            for x in 8..12 {
                mask[[y, x]] = true;
            }
        }
        let frame = Array2::from_elem((n, n), 100.0);
        let stack = vec![frame.clone(), frame.clone(), frame];
        let masks = vec![mask.clone(), mask.clone(), mask];

        let algo = Schwarzfischer::default();
        let corrected = algo
            .correct(&stack, &masks, 0, &CancelToken::new(), &NullReporter)
            .unwrap();
        for frame in &corrected {
            for &v in frame.iter() {
                assert!(v.abs() < 1.0, "expected near-zero correction, got {v}");
            }
        }
    }

    #[test]
    fn all_foreground_mask_fails_with_numeric_error() {
        let n = 20;
        let mask = Array2::from_elem((n, n), true);
        let frame = Array2::from_elem((n, n), 100.0);
        let algo = Schwarzfischer::default();
        let err = algo
            .correct(&[frame], &[mask], 0, &CancelToken::new(), &NullReporter)
            .unwrap_err();
        assert!(matches!(err, PipelineError::NumericFailure(_)));
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let algo = Schwarzfischer::default();
        let frame = Array2::<f64>::zeros((10, 10));
        let mask = Array2::from_elem((5, 5), false);
        let err = algo
            .correct(&[frame], &[mask], 0, &CancelToken::new(), &NullReporter)
            .unwrap_err();
        assert!(matches!(err, PipelineError::ShapeMismatch(_)));
    }

    #[test]
    fn morph_open_clamps_negative_to_zero() {
        let n = 10;
        let frame = Array2::from_elem((n, n), 5.0);
        let mask = Array2::from_elem((n, n), false);
        let algo = MorphOpen { footprint_size: 3 };
        let corrected = algo
            .correct(&[frame], &[mask], 0, &CancelToken::new(), &NullReporter)
            .unwrap();
        assert!(corrected[0].iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn registry_rejects_unknown_names() {
        assert!(BackgroundAlgorithm::get("cellpose").is_err());
        assert!(BackgroundAlgorithm::get("schwarzfischer").is_ok());
        assert!(BackgroundAlgorithm::get("morph-open").is_ok());
    }
}
