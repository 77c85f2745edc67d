// THEORY:
// The `discrete_cells` module turns the intensity stack into atomic storm cells.
// Two storms whose outer contours touch form one blob at a low threshold, but
// their cores are separate at a higher one. Seeding a watershed from the cores
// and flooding over the distance field of the outer region recovers both
// storms, with a boundary that follows the narrowest part of the joined blob.
//
// Key architectural principles:
// 1.  **Named Levels**: Which level bounds the region (`segmentation_level`) and
//     which level provides the seeds (`seed_level`) are explicit parameters.
// 2.  **Refinement Only**: The cell set is exactly the seed level's label set.
//     The watershed only decides where each seeded cell ends.
// 3.  **Stable Indexing**: `centroids[k - 1]` always describes cell k, for
//     every seed label k, so the cell count equals the seed level's blob count.

use crate::core_modules::distance::squared_distance_transform;
use crate::core_modules::grid::Grid;
use crate::core_modules::intensity::IntensityArrays;
use crate::core_modules::labeling::{label_centroids, Centroid, Label};
use crate::core_modules::watershed::watershed;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SegmentError {
    #[error("{name} {level} is not one of the {levels} intensity levels")]
    LevelOutOfRange {
        name: &'static str,
        level: usize,
        levels: usize,
    },
}

/// Segmentation of one frame into discrete storm cells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscreteCells {
    /// Identifier of the frame these cells were segmented from.
    pub frame_id: String,
    /// Cell label of every pixel; 0 is background.
    pub labels: Grid<Label>,
    /// `centroids[k - 1]` is the centroid of cell k.
    pub centroids: Vec<Centroid>,
}

impl DiscreteCells {
    /// Number of cells in the frame.
    pub fn cell_count(&self) -> usize {
        self.centroids.len()
    }

    /// True when `cell_id` names a cell of this frame.
    pub fn contains_cell(&self, cell_id: Label) -> bool {
        cell_id >= 1 && cell_id as usize <= self.centroids.len()
    }

    pub fn centroid(&self, cell_id: Label) -> Option<Centroid> {
        if !self.contains_cell(cell_id) {
            return None;
        }
        self.centroids.get(cell_id as usize - 1).copied()
    }

    /// Binary mask of every pixel that belongs to any cell.
    pub fn cell_mask(&self) -> Grid<bool> {
        self.labels.nonzero_mask()
    }
}

/// Splits the blobs of `intensity` into discrete cells.
///
/// `segmentation_level` selects the intensity frame whose non-zero pixels form
/// the distance field and the flood mask; `seed_level` selects the label grid
/// that seeds the flood.
pub fn segment_discrete_cells(
    intensity: &IntensityArrays,
    segmentation_level: usize,
    seed_level: usize,
) -> Result<DiscreteCells, SegmentError> {
    let out_of_range = |name: &'static str, level: usize| SegmentError::LevelOutOfRange {
        name,
        level,
        levels: intensity.level_count(),
    };
    let region = intensity
        .frames
        .get(segmentation_level)
        .ok_or_else(|| out_of_range("segmentation level", segmentation_level))?;
    let (seeds, seed_centroids) = intensity
        .labels
        .get(seed_level)
        .zip(intensity.centroids.get(seed_level))
        .ok_or_else(|| out_of_range("seed level", seed_level))?;
    let seed_count = seed_centroids.len();

    // --- 1. Relief ---
    // Flooding -distance from the seeds: cores (far from the edge) flood first.
    let mask = region.nonzero_mask();
    let relief = squared_distance_transform(&mask).map(|d| if d.is_finite() { -(d as i64) } else { i64::MIN });

    // --- 2. Flood ---
    let labels = watershed(&relief, seeds, &mask);

    // --- 3. Centroids ---
    // A seed lying wholly outside the mask keeps its seed-level centroid.
    let centroids: Vec<Centroid> = label_centroids(&labels, seed_count)
        .into_iter()
        .zip(seed_centroids.iter())
        .map(|(cell, &seed)| cell.unwrap_or(seed))
        .collect();

    debug!(
        frame_id = %intensity.frame_id,
        segmentation_level,
        seed_level,
        cells = centroids.len(),
        "segmented discrete cells"
    );

    Ok(DiscreteCells {
        frame_id: intensity.frame_id.clone(),
        labels,
        centroids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::intensity::{extract_intensity_arrays, DEFAULT_CELL_SIZE_THRESHOLD};
    use crate::core_modules::palette::IntensityClass;

    /// Two 12x12 storms of class 8 joined by a class-4 bridge, all inside one class-4 blob.
    fn twin_storms() -> Grid<IntensityClass> {
        Grid::from_fn(60, 30, |r, c| {
            let core_a = (9..21).contains(&r) && (8..20).contains(&c);
            let core_b = (9..21).contains(&r) && (36..48).contains(&c);
            let bridge = (12..18).contains(&r) && (20..36).contains(&c);
            if core_a || core_b {
                8
            } else if bridge {
                4
            } else {
                0
            }
        })
    }

    #[test]
    fn touching_storms_become_two_cells() {
        let intensity = extract_intensity_arrays("twins", &twin_storms(), DEFAULT_CELL_SIZE_THRESHOLD);
        assert_eq!(intensity.blob_count(4), 1);
        assert_eq!(intensity.blob_count(7), 2);

        let cells = segment_discrete_cells(&intensity, 4, 7).expect("Error segmenting cells");
        assert_eq!(cells.cell_count(), 2);
        assert_eq!(cells.labels.get(15, 10), 1);
        assert_eq!(cells.labels.get(15, 40), 2);

        // Every pixel of the low-level blob is assigned to one of the two cells.
        assert_eq!(cells.labels.count_nonzero(), intensity.frames[4].count_nonzero());
        // The bridge is split between the cells.
        assert_eq!(cells.labels.get(15, 21), 1);
        assert_eq!(cells.labels.get(15, 34), 2);
    }

    #[test]
    fn each_cell_lies_within_one_intensity_blob() {
        let intensity = extract_intensity_arrays("twins", &twin_storms(), DEFAULT_CELL_SIZE_THRESHOLD);
        let cells = segment_discrete_cells(&intensity, 4, 7).expect("Error segmenting cells");
        let outer = &intensity.labels[4];
        for cell in 1..=cells.cell_count() as Label {
            let blobs: std::collections::BTreeSet<Label> = (0..cells.labels.len())
                .filter(|&i| cells.labels.as_slice()[i] == cell)
                .map(|i| outer.as_slice()[i])
                .collect();
            assert_eq!(blobs.len(), 1, "cell {cell} spans {blobs:?}");
        }
    }

    #[test]
    fn empty_frame_has_no_cells() {
        let intensity = extract_intensity_arrays("empty", &Grid::new(20, 20), DEFAULT_CELL_SIZE_THRESHOLD);
        let cells = segment_discrete_cells(&intensity, 5, 7).expect("Error segmenting cells");
        assert_eq!(cells.cell_count(), 0);
        assert_eq!(cells.labels.count_nonzero(), 0);
        assert!(!cells.contains_cell(1));
    }

    #[test]
    fn weak_blobs_without_seeds_are_not_cells() {
        let classes = Grid::from_fn(40, 20, |r, c| {
            if (4..14).contains(&r) && (4..14).contains(&c) {
                9
            } else if (4..14).contains(&r) && (24..34).contains(&c) {
                5
            } else {
                0
            }
        });
        let intensity = extract_intensity_arrays("weak", &classes, DEFAULT_CELL_SIZE_THRESHOLD);
        let cells = segment_discrete_cells(&intensity, 5, 7).expect("Error segmenting cells");
        assert_eq!(cells.cell_count(), 1);
        assert_eq!(cells.labels.get(8, 28), 0);
        assert_eq!(cells.centroid(1), Some(Centroid { row: 8.5, col: 8.5 }));
    }

    #[test]
    fn unknown_levels_are_an_error() {
        let intensity = extract_intensity_arrays("twins", &twin_storms(), DEFAULT_CELL_SIZE_THRESHOLD);
        let err = segment_discrete_cells(&intensity, 4, 16).expect_err("Error expected for seed level 16");
        assert_eq!(err, SegmentError::LevelOutOfRange { name: "seed level", level: 16, levels: 16 });
        assert!(segment_discrete_cells(&intensity, 99, 7).is_err());
    }
}
