// THEORY:
// The `distance` module computes the exact Euclidean distance transform of a
// binary mask: for every foreground pixel, how far it is from the nearest
// background pixel. Storm blobs that touch along a thin neck have low distance
// values at the neck and high values at their cores, which is exactly the
// relief the watershed needs to split them.
//
// The transform is separable (Felzenszwalb & Huttenlocher): a 1-D lower
// envelope of parabolas is computed down every column, then along every row of
// the column result. Values are kept squared so that they stay exact integers;
// `euclidean_distance_transform` takes the square root for callers that want
// real distances.

use crate::core_modules::grid::Grid;

/// Squared distance from every foreground pixel to the nearest background pixel.
///
/// Background pixels are 0. If the mask has no background at all, every pixel
/// is `f64::INFINITY`.
pub fn squared_distance_transform(foreground: &Grid<bool>) -> Grid<f64> {
    let width = foreground.width();
    let height = foreground.height();
    let mut out = foreground.map(|fg| if fg { f64::INFINITY } else { 0.0 });

    let mut line = Vec::with_capacity(width.max(height));
    let mut result = vec![0.0; width.max(height)];

    // --- 1. Columns ---
    for col in 0..width {
        line.clear();
        line.extend((0..height).map(|row| out.get(row, col)));
        transform_line(&line, &mut result[..height]);
        for row in 0..height {
            out.set(row, col, result[row]);
        }
    }

    // --- 2. Rows ---
    for row in 0..height {
        line.clear();
        line.extend((0..width).map(|col| out.get(row, col)));
        transform_line(&line, &mut result[..width]);
        for col in 0..width {
            out.set(row, col, result[col]);
        }
    }

    out
}

/// Euclidean distance from every foreground pixel to the nearest background pixel.
pub fn euclidean_distance_transform(foreground: &Grid<bool>) -> Grid<f64> {
    squared_distance_transform(foreground).map(f64::sqrt)
}

/// 1-D squared distance transform of a sampled function `f` (lower envelope of
/// parabolas rooted at every finite sample).
fn transform_line(f: &[f64], out: &mut [f64]) {
    let n = f.len();
    let mut vertices: Vec<usize> = Vec::with_capacity(n);
    let mut bounds: Vec<f64> = Vec::with_capacity(n);

    for q in 0..n {
        if !f[q].is_finite() {
            continue;
        }
        let fq = f[q] + (q * q) as f64;
        let mut intersection = f64::NEG_INFINITY;
        while let Some(&p) = vertices.last() {
            let fp = f[p] + (p * p) as f64;
            intersection = (fq - fp) / (2.0 * (q - p) as f64);
            if intersection <= bounds[bounds.len() - 1] {
                vertices.pop();
                bounds.pop();
                intersection = f64::NEG_INFINITY;
            } else {
                break;
            }
        }
        vertices.push(q);
        bounds.push(intersection);
    }

    if vertices.is_empty() {
        out.iter_mut().for_each(|v| *v = f64::INFINITY);
        return;
    }

    let mut k = 0;
    for (q, value) in out.iter_mut().enumerate() {
        while k + 1 < vertices.len() && bounds[k + 1] < q as f64 {
            k += 1;
        }
        let offset = q as f64 - vertices[k] as f64;
        *value = offset * offset + f[vertices[k]];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Brute force reference: minimum squared distance to any background pixel.
    fn brute_force(mask: &Grid<bool>) -> Grid<f64> {
        Grid::from_fn(mask.width(), mask.height(), |r, c| {
            if !mask.get(r, c) {
                return 0.0;
            }
            let mut best = f64::INFINITY;
            for br in 0..mask.height() {
                for bc in 0..mask.width() {
                    if !mask.get(br, bc) {
                        let dr = r as f64 - br as f64;
                        let dc = c as f64 - bc as f64;
                        best = best.min(dr * dr + dc * dc);
                    }
                }
            }
            best
        })
    }

    #[test]
    fn matches_brute_force_on_irregular_mask() {
        let mask = Grid::from_fn(17, 13, |r, c| (r * 7 + c * 3) % 11 != 0 && !(r == 6 && c > 4));
        assert_eq!(squared_distance_transform(&mask), brute_force(&mask));
    }

    #[test]
    fn square_blob_peaks_at_its_center() {
        let mask = Grid::from_fn(9, 9, |r, c| (1..8).contains(&r) && (1..8).contains(&c));
        let distance = euclidean_distance_transform(&mask);
        assert_eq!(distance.get(0, 0), 0.0);
        assert_eq!(distance.get(1, 1), 1.0);
        assert_eq!(distance.get(4, 4), 4.0);
    }

    #[test]
    fn mask_without_background_is_infinite() {
        let mask = Grid::filled(3, 2, true);
        let distance = squared_distance_transform(&mask);
        assert!(distance.as_slice().iter().all(|v| v.is_infinite()));
    }
}
