// THEORY:
// The `intensity` module is the first analytical layer. It decomposes a single
// radar frame into a stack of cumulative threshold masks, one per intensity
// level, and finds the connected blobs at each level.
//
// Key architectural principles & algorithm steps:
// 1.  **Cumulative Thresholds**: Level L contains every pixel whose class is at
//     least L. A storm core at class 12 therefore appears at levels 1..=12,
//     nested inside ever-larger outer contours.
// 2.  **Sentinel Level**: Level 0 is an all-zero grid so that `levels[L]` means
//     "intensity L" without off-by-one arithmetic.
// 3.  **Noise Clean-up**: Each level drops blobs smaller than the size threshold
//     and fills holes smaller than it before labeling.
// 4.  **Index Alignment**: For every level, `frames[L]`, `labels[L]` and
//     `centroids[L]` describe the same blobs; `centroids[L].len()` always equals
//     the largest label at level L.
// 5.  **Stateless Utility**: Extraction depends on nothing but the frame itself,
//     which is what lets the worker pool analyze frames in parallel.

use crate::core_modules::grid::Grid;
use crate::core_modules::labeling::{
    label_centroids, label_components, remove_small_holes, remove_small_objects, Centroid, Label,
};
use crate::core_modules::palette::{IntensityClass, LEVEL_COUNT};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default minimum blob size, and maximum hole size, in pixels.
pub const DEFAULT_CELL_SIZE_THRESHOLD: usize = 35;

/// Per-intensity-level decomposition of one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntensityArrays {
    /// Identifier of the frame these arrays were extracted from.
    pub frame_id: String,
    /// `frames[L]` holds L on every labeled pixel of level L, 0 elsewhere.
    pub frames: Vec<Grid<IntensityClass>>,
    /// `labels[L]` holds the 4-connected blob labels of level L.
    pub labels: Vec<Grid<Label>>,
    /// `centroids[L][k - 1]` is the centroid of blob k at level L.
    pub centroids: Vec<Vec<Centroid>>,
}

impl IntensityArrays {
    /// Number of intensity levels including the sentinel, always `LEVEL_COUNT`.
    pub fn level_count(&self) -> usize {
        self.frames.len()
    }

    /// Number of blobs detected at `level`, 0 for an out-of-range level.
    pub fn blob_count(&self, level: usize) -> usize {
        self.centroids.get(level).map_or(0, Vec::len)
    }

    pub fn width(&self) -> usize {
        self.frames.first().map_or(0, Grid::width)
    }

    pub fn height(&self) -> usize {
        self.frames.first().map_or(0, Grid::height)
    }

    /// True when no level carries any blob.
    pub fn is_empty(&self) -> bool {
        self.centroids.iter().all(Vec::is_empty)
    }
}

/// Decomposes a per-pixel intensity-class grid into the per-level stack.
pub fn extract_intensity_arrays(
    frame_id: &str,
    classes: &Grid<IntensityClass>,
    cell_size_threshold: usize,
) -> IntensityArrays {
    let width = classes.width();
    let height = classes.height();

    let mut frames = Vec::with_capacity(LEVEL_COUNT);
    let mut labels = Vec::with_capacity(LEVEL_COUNT);
    let mut centroids = Vec::with_capacity(LEVEL_COUNT);

    // --- 0. Sentinel Level ---
    frames.push(Grid::new(width, height));
    labels.push(Grid::new(width, height));
    centroids.push(Vec::new());

    for level in 1..LEVEL_COUNT {
        let threshold = level as IntensityClass;

        // --- 1. Cumulative Mask ---
        let mask = classes.map(|class| class >= threshold);

        // --- 2. Clean-up ---
        let mask = remove_small_objects(&mask, cell_size_threshold);
        let mask = remove_small_holes(&mask, cell_size_threshold);

        // --- 3. Labeling ---
        let (level_labels, count) = label_components(&mask);

        // --- 4. Intensity Frame ---
        let level_frame = level_labels.map(|label| if label != 0 { threshold } else { 0 });

        // --- 5. Centroids ---
        // Labels are consecutive, so every label 1..=count has pixels.
        let level_centroids: Vec<Centroid> = label_centroids(&level_labels, count)
            .into_iter()
            .flatten()
            .collect();

        frames.push(level_frame);
        labels.push(level_labels);
        centroids.push(level_centroids);
    }

    debug!(
        frame_id,
        blobs_per_level = ?centroids.iter().map(Vec::len).collect::<Vec<_>>(),
        "extracted intensity levels"
    );

    IntensityArrays {
        frame_id: frame_id.to_string(),
        frames,
        labels,
        centroids,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A 40x40 frame with a 10x10 block of class 4 wrapping a 6x6 core of class 9.
    fn nested_storm() -> Grid<IntensityClass> {
        Grid::from_fn(40, 40, |r, c| {
            if (12..18).contains(&r) && (12..18).contains(&c) {
                9
            } else if (10..20).contains(&r) && (10..20).contains(&c) {
                4
            } else {
                0
            }
        })
    }

    #[test]
    fn empty_frame_produces_empty_levels() {
        let classes: Grid<IntensityClass> = Grid::new(32, 32);
        let arrays = extract_intensity_arrays("empty", &classes, DEFAULT_CELL_SIZE_THRESHOLD);
        assert_eq!(arrays.level_count(), LEVEL_COUNT);
        assert!(arrays.is_empty());
        for level in 0..LEVEL_COUNT {
            assert_eq!(arrays.labels[level].count_nonzero(), 0);
            assert_eq!(arrays.frames[level].count_nonzero(), 0);
        }
    }

    #[test]
    fn levels_are_cumulative() {
        let arrays = extract_intensity_arrays("nested", &nested_storm(), DEFAULT_CELL_SIZE_THRESHOLD);
        for level in 1..=4 {
            assert_eq!(arrays.blob_count(level), 1, "level {level}");
            assert_eq!(arrays.frames[level].count_nonzero(), 100);
            assert_eq!(arrays.frames[level].get(15, 15), level as u8);
        }
        for level in 5..=9 {
            assert_eq!(arrays.blob_count(level), 1, "level {level}");
            assert_eq!(arrays.frames[level].count_nonzero(), 36);
        }
        for level in 10..LEVEL_COUNT {
            assert_eq!(arrays.blob_count(level), 0, "level {level}");
        }
    }

    #[test]
    fn centroid_count_matches_max_label() {
        let mut classes = nested_storm();
        for r in 25..35 {
            for c in 25..35 {
                classes.set(r, c, 6);
            }
        }
        let arrays = extract_intensity_arrays("two", &classes, DEFAULT_CELL_SIZE_THRESHOLD);
        for level in 0..LEVEL_COUNT {
            let max_label = arrays.labels[level].max_value().unwrap_or(0) as usize;
            assert_eq!(arrays.centroids[level].len(), max_label, "level {level}");
        }
        assert_eq!(arrays.blob_count(5), 2);
        assert_eq!(arrays.centroids[5][0], Centroid { row: 14.5, col: 14.5 });
        assert_eq!(arrays.centroids[5][1], Centroid { row: 29.5, col: 29.5 });
    }

    #[test]
    fn specks_below_threshold_are_dropped() {
        let mut classes: Grid<IntensityClass> = Grid::new(30, 30);
        for r in 2..7 {
            for c in 2..8 {
                classes.set(r, c, 3); // 30 pixels, below 35
            }
        }
        let arrays = extract_intensity_arrays("speck", &classes, DEFAULT_CELL_SIZE_THRESHOLD);
        assert!(arrays.is_empty());
    }

    #[test]
    fn extraction_is_deterministic() {
        let a = extract_intensity_arrays("same", &nested_storm(), DEFAULT_CELL_SIZE_THRESHOLD);
        let b = extract_intensity_arrays("same", &nested_storm(), DEFAULT_CELL_SIZE_THRESHOLD);
        assert_eq!(a, b);
    }
}
