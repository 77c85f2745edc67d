// THEORY:
// The `optical_flow` module estimates dense motion between two frames: one
// displacement vector per pixel. It follows Farnebäck's two-frame method.
//
// Key architectural principles & algorithm steps:
// 1.  **Polynomial Expansion**: Around every pixel, the image is approximated by a
//     quadratic polynomial fitted with Gaussian-weighted least squares. The fit is
//     separable, so it costs two 1-D passes rather than a 2-D window.
// 2.  **Displacement from Coefficients**: If the second frame is the first shifted
//     by d, the linear coefficients change by a known function of d and the
//     quadratic ones. Each pixel contributes a 2x2 normal-equation system
//     (`G d = h`) built from both expansions.
// 3.  **Neighborhood Averaging**: The per-pixel systems are box-averaged over a
//     square window before solving, which regularises flat regions.
// 4.  **Coarse to Fine**: A pyramid of blurred, downscaled copies is processed from
//     the coarsest level down. Each level starts from the upsampled flow of the
//     level above and refines it for a fixed number of iterations.
// 5.  **Pluggable**: The frame linker only sees the `MotionEstimator` trait, so a
//     fixed field (`StaticFlow`) can stand in where motion is known in advance.

use crate::core_modules::grid::Grid;
use serde::{Deserialize, Serialize};

/// Smallest pyramid level side, in pixels.
const MIN_PYRAMID_SIZE: f64 = 32.0;
/// Width of the attenuated border band in the matrix update.
const BORDER: usize = 5;
/// Attenuation of matrix terms inside the border band, outermost first.
const BORDER_WEIGHTS: [f32; BORDER] = [0.14, 0.14, 0.4472, 0.4472, 0.4472];

/// Per-pixel displacement in pixels, from the previous frame to the next.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowVector {
    /// Horizontal (column) displacement.
    pub dx: f32,
    /// Vertical (row) displacement.
    pub dy: f32,
}

impl FlowVector {
    pub fn magnitude(&self) -> f32 {
        (self.dx * self.dx + self.dy * self.dy).sqrt()
    }
}

/// Dense motion field, one vector per pixel.
pub type FlowField = Grid<FlowVector>;

/// Tunable parameters of the dense flow estimator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Scale between consecutive pyramid levels (< 1).
    #[serde(default = "default_pyramid_scale")]
    pub pyramid_scale: f64,
    /// Number of levels above the full-resolution image.
    #[serde(default = "default_levels")]
    pub levels: usize,
    /// Side of the averaging window, in pixels (odd).
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Refinement iterations per pyramid level.
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    /// Half-size of the polynomial expansion neighborhood.
    #[serde(default = "default_poly_n")]
    pub poly_n: usize,
    /// Standard deviation of the Gaussian weighting the polynomial fit.
    #[serde(default = "default_poly_sigma")]
    pub poly_sigma: f64,
}

fn default_pyramid_scale() -> f64 {
    0.5
}

fn default_levels() -> usize {
    3
}

fn default_window_size() -> usize {
    15
}

fn default_iterations() -> usize {
    3
}

fn default_poly_n() -> usize {
    5
}

fn default_poly_sigma() -> f64 {
    1.2
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            pyramid_scale: default_pyramid_scale(),
            levels: default_levels(),
            window_size: default_window_size(),
            iterations: default_iterations(),
            poly_n: default_poly_n(),
            poly_sigma: default_poly_sigma(),
        }
    }
}

/// Anything that can estimate a dense motion field between two 8-bit frames.
pub trait MotionEstimator: Send + Sync {
    fn estimate(&self, previous: &Grid<u8>, next: &Grid<u8>) -> FlowField;
}

/// A motion estimator that returns the same uniform displacement everywhere.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StaticFlow {
    pub displacement: FlowVector,
}

impl MotionEstimator for StaticFlow {
    fn estimate(&self, previous: &Grid<u8>, _next: &Grid<u8>) -> FlowField {
        Grid::filled(previous.width(), previous.height(), self.displacement)
    }
}

/// Pyramidal polynomial-expansion dense flow.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FarnebackFlow {
    pub config: FlowConfig,
}

impl FarnebackFlow {
    pub fn new(config: FlowConfig) -> Self {
        Self { config }
    }
}

impl MotionEstimator for FarnebackFlow {
    fn estimate(&self, previous: &Grid<u8>, next: &Grid<u8>) -> FlowField {
        dense_flow(previous, next, &self.config)
    }
}

/// Polynomial coefficients of one pixel: `[ry, rx, ryy, rxx, rxy]`.
type Poly = [f32; 5];
/// Normal-equation terms of one pixel: `[g11, g12, g22, h1, h2]`.
type Normal = [f32; 5];

/// Estimates the motion field from `previous` to `next`.
pub fn dense_flow(previous: &Grid<u8>, next: &Grid<u8>, config: &FlowConfig) -> FlowField {
    let width = previous.width();
    let height = previous.height();
    if width == 0 || height == 0 || !previous.same_shape(next) {
        return Grid::new(width, height);
    }

    // --- 1. Pyramid Depth ---
    let mut levels = 0;
    let mut scale = 1.0;
    for k in 0..config.levels {
        scale *= config.pyramid_scale;
        if width as f64 * scale < MIN_PYRAMID_SIZE || height as f64 * scale < MIN_PYRAMID_SIZE {
            break;
        }
        levels = k + 1;
    }

    let frames = [previous.map(f32::from), next.map(f32::from)];
    let gaussian = PolyGaussian::new(config.poly_n, config.poly_sigma);
    let mut flow: Option<FlowField> = None;

    // --- 2. Coarse to Fine ---
    for k in (0..=levels).rev() {
        let scale = config.pyramid_scale.powi(k as i32);
        let sigma = (1.0 / scale - 1.0) * 0.5;
        let smooth_size = ((sigma * 5.0).round() as usize | 1).max(3);
        let level_width = ((width as f64 * scale).round() as usize).max(1);
        let level_height = ((height as f64 * scale).round() as usize).max(1);

        let mut level_flow = match flow.take() {
            None => Grid::new(level_width, level_height),
            Some(coarse) => {
                let factor = (1.0 / config.pyramid_scale) as f32;
                resize_flow(&coarse, level_width, level_height).map(|v| FlowVector {
                    dx: v.dx * factor,
                    dy: v.dy * factor,
                })
            }
        };

        let [r0, r1] = frames.each_ref().map(|frame| {
            let blurred = gaussian_blur(frame, smooth_size, sigma);
            let resized = resize_linear(&blurred, level_width, level_height);
            polynomial_expansion(&resized, &gaussian)
        });

        let mut normals = update_matrices(&r0, &r1, &level_flow);
        for i in 0..config.iterations {
            let refine = i + 1 < config.iterations;
            level_flow = solve_flow(&normals, config.window_size);
            if refine {
                normals = update_matrices(&r0, &r1, &level_flow);
            }
        }

        flow = Some(level_flow);
    }

    flow.unwrap_or_else(|| Grid::new(width, height))
}

/// Gaussian weights of the polynomial fit and the inverse-Gram terms it needs.
struct PolyGaussian {
    n: usize,
    g: Vec<f32>,
    xg: Vec<f32>,
    xxg: Vec<f32>,
    ig11: f64,
    ig03: f64,
    ig33: f64,
    ig55: f64,
}

impl PolyGaussian {
    fn new(n: usize, sigma: f64) -> Self {
        let sigma = if sigma < f32::EPSILON as f64 { n as f64 * 0.3 } else { sigma };
        let raw: Vec<f64> = (0..=n).map(|x| (-((x * x) as f64) / (2.0 * sigma * sigma)).exp()).collect();
        let total: f64 = raw[0] + 2.0 * raw[1..].iter().sum::<f64>();
        let g: Vec<f32> = raw.iter().map(|v| (v / total) as f32).collect();
        let xg: Vec<f32> = g.iter().enumerate().map(|(x, &v)| x as f32 * v).collect();
        let xxg: Vec<f32> = g.iter().enumerate().map(|(x, &v)| (x * x) as f32 * v).collect();

        // Gram matrix of the basis [1, x, y, x^2, y^2, xy] under the weights.
        let (mut g00, mut g11, mut g33, mut g55) = (0.0f64, 0.0f64, 0.0f64, 0.0f64);
        let ni = n as isize;
        for y in -ni..=ni {
            for x in -ni..=ni {
                let w = g[y.unsigned_abs()] as f64 * g[x.unsigned_abs()] as f64;
                let (xf, yf) = (x as f64, y as f64);
                g00 += w;
                g11 += w * xf * xf;
                g33 += w * xf * xf * xf * xf;
                g55 += w * xf * xf * yf * yf;
            }
        }

        // The {1, x^2, y^2} block is [[g00, g11, g11], [g11, g33, g55], [g11, g55, g33]].
        let block = g00 * (g33 + g55) - 2.0 * g11 * g11;
        let det = (g33 - g55) * block;
        Self {
            n,
            g,
            xg,
            xxg,
            ig11: 1.0 / g11,
            ig03: -g11 / block,
            ig33: (g00 * g33 - g11 * g11) / det,
            ig55: 1.0 / g55,
        }
    }
}

/// Fits the quadratic polynomial around every pixel.
fn polynomial_expansion(src: &Grid<f32>, gaussian: &PolyGaussian) -> Grid<Poly> {
    let width = src.width();
    let height = src.height();
    let n = gaussian.n;
    let (g, xg, xxg) = (&gaussian.g, &gaussian.xg, &gaussian.xxg);
    let mut dst: Grid<Poly> = Grid::new(width, height);
    let mut row = vec![[0.0f32; 3]; width];

    for y in 0..height {
        // --- Vertical pass ---
        for (x, acc) in row.iter_mut().enumerate() {
            let mut t = [src.get(y, x) * g[0], 0.0, 0.0];
            for k in 1..=n {
                let above = src.get(y.saturating_sub(k), x);
                let below = src.get((y + k).min(height - 1), x);
                let p = above + below;
                t[0] += g[k] * p;
                t[1] += xg[k] * (below - above);
                t[2] += xxg[k] * p;
            }
            *acc = t;
        }

        // --- Horizontal pass ---
        for x in 0..width {
            let center = row[x];
            let mut b1 = center[0] * g[0];
            let mut b3 = center[1] * g[0];
            let mut b5 = center[2] * g[0];
            let (mut b2, mut b4, mut b6) = (0.0f32, 0.0f32, 0.0f32);
            for k in 1..=n {
                let left = row[x.saturating_sub(k)];
                let right = row[(x + k).min(width - 1)];
                let even = right[0] + left[0];
                b1 += even * g[k];
                b4 += even * xxg[k];
                b2 += (right[0] - left[0]) * xg[k];
                b3 += (right[1] + left[1]) * g[k];
                b6 += (right[1] - left[1]) * xg[k];
                b5 += (right[2] + left[2]) * g[k];
            }
            dst.set(
                y,
                x,
                [
                    (b3 as f64 * gaussian.ig11) as f32,
                    (b2 as f64 * gaussian.ig11) as f32,
                    (b1 as f64 * gaussian.ig03 + b5 as f64 * gaussian.ig33) as f32,
                    (b1 as f64 * gaussian.ig03 + b4 as f64 * gaussian.ig33) as f32,
                    (b6 as f64 * gaussian.ig55) as f32,
                ],
            );
        }
    }

    dst
}

/// Builds the per-pixel normal equations for the current flow estimate.
fn update_matrices(r0: &Grid<Poly>, r1: &Grid<Poly>, flow: &FlowField) -> Grid<Normal> {
    let width = r0.width();
    let height = r0.height();
    let mut normals: Grid<Normal> = Grid::new(width, height);

    for y in 0..height {
        for x in 0..width {
            let p0 = r0.get(y, x);
            let FlowVector { dx, dy } = flow.get(y, x);
            let fx = x as f32 + dx;
            let fy = y as f32 + dy;
            let x1 = fx.floor();
            let y1 = fy.floor();
            let (ax, ay) = (fx - x1, fy - y1);

            let inside = x1 >= 0.0 && y1 >= 0.0 && (x1 as usize) + 1 < width && (y1 as usize) + 1 < height;
            let (mut r2, mut r3, r4, r5, r6);
            if inside {
                let (xi, yi) = (x1 as usize, y1 as usize);
                let (a00, a01, a10, a11) = ((1.0 - ax) * (1.0 - ay), ax * (1.0 - ay), (1.0 - ax) * ay, ax * ay);
                let q00 = r1.get(yi, xi);
                let q01 = r1.get(yi, xi + 1);
                let q10 = r1.get(yi + 1, xi);
                let q11 = r1.get(yi + 1, xi + 1);
                let sample = |c: usize| a00 * q00[c] + a01 * q01[c] + a10 * q10[c] + a11 * q11[c];
                r2 = sample(0);
                r3 = sample(1);
                r4 = (p0[2] + sample(2)) * 0.5;
                r5 = (p0[3] + sample(3)) * 0.5;
                r6 = (p0[4] + sample(4)) * 0.25;
            } else {
                r2 = 0.0;
                r3 = 0.0;
                r4 = p0[2];
                r5 = p0[3];
                r6 = p0[4] * 0.5;
            }

            r2 = (p0[0] - r2) * 0.5;
            r3 = (p0[1] - r3) * 0.5;
            r2 += r4 * dy + r6 * dx;
            r3 += r6 * dy + r5 * dx;

            let mut terms = [r2, r3, r4, r5, r6];
            let weight = border_weight(x, width) * border_weight(y, height);
            if weight != 1.0 {
                terms.iter_mut().for_each(|t| *t *= weight);
            }
            let [r2, r3, r4, r5, r6] = terms;

            normals.set(
                y,
                x,
                [
                    r4 * r4 + r6 * r6,
                    (r4 + r5) * r6,
                    r5 * r5 + r6 * r6,
                    r4 * r2 + r6 * r3,
                    r6 * r2 + r5 * r3,
                ],
            );
        }
    }

    normals
}

/// Attenuation for a coordinate near either edge of an axis.
fn border_weight(i: usize, len: usize) -> f32 {
    let mut weight = 1.0;
    if i < BORDER {
        weight *= BORDER_WEIGHTS[i];
    }
    if i + BORDER >= len {
        weight *= BORDER_WEIGHTS[len - i - 1];
    }
    weight
}

/// Box-averages the normal equations over the window and solves each for the flow.
fn solve_flow(normals: &Grid<Normal>, window_size: usize) -> FlowField {
    let averaged = box_filter(normals, window_size);
    averaged.map(|[g11, g12, g22, h1, h2]| {
        let (g11, g12, g22, h1, h2) = (g11 as f64, g12 as f64, g22 as f64, h1 as f64, h2 as f64);
        let idet = 1.0 / (g11 * g22 - g12 * g12 + 1e-3);
        FlowVector {
            dx: ((g11 * h2 - g12 * h1) * idet) as f32,
            dy: ((g22 * h1 - g12 * h2) * idet) as f32,
        }
    })
}

/// Mean over a `size`x`size` window with replicated borders.
fn box_filter(src: &Grid<Normal>, size: usize) -> Grid<Normal> {
    let width = src.width();
    let height = src.height();
    let half = size / 2;
    let scale = 1.0 / (size * size) as f64;

    // --- Vertical sums ---
    let mut columns = vec![[0.0f64; 5]; width * height];
    for y in 0..height {
        for x in 0..width {
            let mut acc = [0.0f64; 5];
            for k in 0..size {
                let sy = (y + k).saturating_sub(half).min(height - 1);
                for (a, v) in acc.iter_mut().zip(src.get(sy, x)) {
                    *a += v as f64;
                }
            }
            columns[y * width + x] = acc;
        }
    }

    // --- Horizontal sums ---
    Grid::from_fn(width, height, |y, x| {
        let mut acc = [0.0f64; 5];
        for k in 0..size {
            let sx = (x + k).saturating_sub(half).min(width - 1);
            for (a, v) in acc.iter_mut().zip(columns[y * width + sx]) {
                *a += v;
            }
        }
        acc.map(|v| (v * scale) as f32)
    })
}

/// 1-D Gaussian kernel; a non-positive sigma is derived from the size.
fn gaussian_kernel(size: usize, sigma: f64) -> Vec<f32> {
    if sigma <= 0.0 {
        match size {
            1 => return vec![1.0],
            3 => return vec![0.25, 0.5, 0.25],
            5 => return vec![0.0625, 0.25, 0.375, 0.25, 0.0625],
            7 => return vec![0.03125, 0.109375, 0.21875, 0.28125, 0.21875, 0.109375, 0.03125],
            _ => {}
        }
    }
    let sigma = if sigma > 0.0 { sigma } else { 0.3 * ((size as f64 - 1.0) * 0.5 - 1.0) + 0.8 };
    let center = (size as f64 - 1.0) * 0.5;
    let raw: Vec<f64> = (0..size)
        .map(|i| {
            let d = i as f64 - center;
            (-(d * d) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let total: f64 = raw.iter().sum();
    raw.into_iter().map(|v| (v / total) as f32).collect()
}

/// Reflects an out-of-range index back into `0..len`, without repeating the edge.
fn reflect_101(i: isize, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let last = len as isize - 1;
    let mut i = i;
    while i < 0 || i > last {
        i = if i < 0 { -i } else { 2 * last - i };
    }
    i as usize
}

/// Separable Gaussian blur with reflected borders.
fn gaussian_blur(src: &Grid<f32>, size: usize, sigma: f64) -> Grid<f32> {
    let kernel = gaussian_kernel(size, sigma);
    let half = (kernel.len() / 2) as isize;
    let width = src.width();
    let height = src.height();

    let rows = Grid::from_fn(width, height, |y, x| {
        kernel
            .iter()
            .enumerate()
            .map(|(k, &w)| w * src.get(y, reflect_101(x as isize + k as isize - half, width)))
            .sum::<f32>()
    });

    Grid::from_fn(width, height, |y, x| {
        kernel
            .iter()
            .enumerate()
            .map(|(k, &w)| w * rows.get(reflect_101(y as isize + k as isize - half, height), x))
            .sum::<f32>()
    })
}

/// Source sample positions for one destination coordinate (pixel-center aligned).
fn linear_taps(dst: usize, src_len: usize, dst_len: usize) -> (usize, usize, f32) {
    let scale = src_len as f64 / dst_len as f64;
    let pos = (dst as f64 + 0.5) * scale - 0.5;
    let base = pos.floor();
    let frac = (pos - base) as f32;
    if base < 0.0 {
        return (0, 0, 0.0);
    }
    let base = base as usize;
    if base + 1 >= src_len {
        return (src_len - 1, src_len - 1, 0.0);
    }
    (base, base + 1, frac)
}

/// Bilinear resize of a scalar grid.
fn resize_linear(src: &Grid<f32>, width: usize, height: usize) -> Grid<f32> {
    if src.width() == width && src.height() == height {
        return src.clone();
    }
    Grid::from_fn(width, height, |y, x| {
        let (y0, y1, ty) = linear_taps(y, src.height(), height);
        let (x0, x1, tx) = linear_taps(x, src.width(), width);
        let top = src.get(y0, x0) * (1.0 - tx) + src.get(y0, x1) * tx;
        let bottom = src.get(y1, x0) * (1.0 - tx) + src.get(y1, x1) * tx;
        top * (1.0 - ty) + bottom * ty
    })
}

/// Bilinear resize of a flow field (vectors are not rescaled).
fn resize_flow(src: &FlowField, width: usize, height: usize) -> FlowField {
    let dx = resize_linear(&src.map(|v| v.dx), width, height);
    let dy = resize_linear(&src.map(|v| v.dy), width, height);
    Grid::from_fn(width, height, |y, x| FlowVector {
        dx: dx.get(y, x),
        dy: dy.get(y, x),
    })
}
