// THEORY:
// The `linker` module answers "which cells in frame B are continuations of which
// cells in frame A". It is the temporal half of the engine: segmentation sees
// one frame at a time, the linker sees two.
//
// Key architectural principles & algorithm steps:
// 1.  **Motion First**: A dense motion field is estimated between the two binary
//     cell masks, and A's label grid is warped along it into B's time. Overlap is
//     then measured where the cells *will be*, not where they were.
// 2.  **Overlap Regions**: Every connected component of (warped A ∧ B) is one
//     candidate continuation. The regions are inspected independently.
// 3.  **Share Band**: A label's share is the part of its own footprint that
//     lies inside the overlap regions. A cell that doubles covers only half of
//     itself with its predecessor and falls out of the band; the halves of a
//     split (or the parts of a merge) each keep nearly all of their area in the
//     overlap and stay linked. Every pair of accepted labels meeting in one
//     region is a continuation.
// 4.  **Transposed Maps**: Every accepted (A, B) pair is written to both the
//     forward and the backward map, so each map is the exact transpose of the
//     other. Splits and merges are simply sets with more than one element.

use crate::core_modules::discrete_cells::DiscreteCells;
use crate::core_modules::grid::Grid;
use crate::core_modules::labeling::{label_components, label_sizes, Label};
use crate::core_modules::optical_flow::{FlowField, MotionEstimator};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::debug;

/// Cell id to the set of linked cell ids in the neighboring frame.
pub type CellMap = BTreeMap<Label, BTreeSet<Label>>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error(
        "frames '{previous_frame_id}' ({previous_width}x{previous_height}) and \
         '{next_frame_id}' ({next_width}x{next_height}) have different sizes"
    )]
    GridMismatch {
        previous_frame_id: String,
        next_frame_id: String,
        previous_width: usize,
        previous_height: usize,
        next_width: usize,
        next_height: usize,
    },
}

/// Exclusive range of accepted overlap shares.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OverlapBand {
    #[serde(default = "default_min_share")]
    pub min_share: f64,
    #[serde(default = "default_max_share")]
    pub max_share: f64,
}

fn default_min_share() -> f64 {
    0.6
}

fn default_max_share() -> f64 {
    1.7
}

impl Default for OverlapBand {
    fn default() -> Self {
        Self {
            min_share: default_min_share(),
            max_share: default_max_share(),
        }
    }
}

impl OverlapBand {
    /// True when `share` lies strictly inside the band.
    pub fn contains(&self, share: f64) -> bool {
        share > self.min_share && share < self.max_share
    }

    /// True for a finite, non-negative, non-empty band.
    pub fn is_valid(&self) -> bool {
        self.min_share.is_finite()
            && self.max_share.is_finite()
            && self.min_share >= 0.0
            && self.min_share < self.max_share
    }
}

/// The cell correspondence between two consecutive frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameDelta {
    /// The earlier frame; the forward map's keys are its cells.
    pub previous_frame_id: String,
    /// The later frame; the backward map's keys are its cells.
    pub next_frame_id: String,
    /// Earlier cell to the later cells continuing it.
    pub forward: CellMap,
    /// Later cell to the earlier cells it continues.
    pub backward: CellMap,
    /// Motion field estimated from the earlier cell mask to the later one.
    pub cell_flow: FlowField,
}

impl FrameDelta {
    /// Later cells continuing `cell_id` of the earlier frame.
    pub fn children_of(&self, cell_id: Label) -> BTreeSet<Label> {
        self.forward.get(&cell_id).cloned().unwrap_or_default()
    }

    /// Earlier cells continued by `cell_id` of the later frame.
    pub fn parents_of(&self, cell_id: Label) -> BTreeSet<Label> {
        self.backward.get(&cell_id).cloned().unwrap_or_default()
    }

    /// Number of accepted (earlier, later) pairs.
    pub fn link_count(&self) -> usize {
        self.forward.values().map(BTreeSet::len).sum()
    }
}

/// Resamples `labels` along the negated motion field: every pixel takes the
/// label found at `pixel - flow`, rounded to the nearest pixel and clamped to
/// the grid.
pub fn warp_labels(labels: &Grid<Label>, flow: &FlowField) -> Grid<Label> {
    let max_row = labels.height().saturating_sub(1) as f32;
    let max_col = labels.width().saturating_sub(1) as f32;
    Grid::from_fn(labels.width(), labels.height(), |row, col| {
        let motion = flow.get(row, col);
        let src_row = (row as f32 - motion.dy).round().clamp(0.0, max_row) as usize;
        let src_col = (col as f32 - motion.dx).round().clamp(0.0, max_col) as usize;
        labels.get(src_row, src_col)
    })
}

/// Binary cell mask as an 8-bit image (cell pixels 255).
fn motion_mask(cells: &DiscreteCells) -> Grid<u8> {
    cells.labels.map(|label| if label != 0 { 255 } else { 0 })
}

/// Links the cells of `previous` to the cells of the later frame `next`.
pub fn link_cells(
    previous: &DiscreteCells,
    next: &DiscreteCells,
    estimator: &dyn MotionEstimator,
    band: &OverlapBand,
) -> Result<FrameDelta, LinkError> {
    if !previous.labels.same_shape(&next.labels) {
        return Err(LinkError::GridMismatch {
            previous_frame_id: previous.frame_id.clone(),
            next_frame_id: next.frame_id.clone(),
            previous_width: previous.labels.width(),
            previous_height: previous.labels.height(),
            next_width: next.labels.width(),
            next_height: next.labels.height(),
        });
    }

    // --- 1. Motion ---
    let cell_flow = estimator.estimate(&motion_mask(previous), &motion_mask(next));

    // --- 2. Warp ---
    let warped = warp_labels(&previous.labels, &cell_flow);

    // --- 3. Overlap Regions ---
    let width = next.labels.width();
    let height = next.labels.height();
    let overlap = Grid::from_fn(width, height, |row, col| warped.get(row, col) != 0 && next.labels.get(row, col) != 0);
    let (regions, region_count) = label_components(&overlap);

    let warped_count = warped.max_value().unwrap_or(0) as usize;
    let warped_sizes = label_sizes(&warped, warped_count);
    let next_sizes = label_sizes(&next.labels, next.cell_count());
    let mut warped_overlap = vec![0usize; warped_sizes.len()];
    let mut next_overlap = vec![0usize; next_sizes.len()];

    // Labels touching each region, and the overlapped area of every label.
    let mut touching: Vec<(BTreeSet<Label>, BTreeSet<Label>)> = vec![Default::default(); region_count];
    for (index, &region) in regions.as_slice().iter().enumerate() {
        if region == 0 {
            continue;
        }
        let parent = warped.as_slice()[index];
        let child = next.labels.as_slice()[index];
        let (from_previous, from_next) = &mut touching[region as usize - 1];
        from_previous.insert(parent);
        from_next.insert(child);
        if let Some(count) = warped_overlap.get_mut(parent as usize) {
            *count += 1;
        }
        if let Some(count) = next_overlap.get_mut(child as usize) {
            *count += 1;
        }
    }

    // --- 4. Share Band ---
    let accept = |label: Label, overlapped: &[usize], sizes: &[usize]| {
        let footprint = sizes.get(label as usize).copied().unwrap_or(0);
        if label == 0 || footprint == 0 {
            return false;
        }
        let inside = overlapped.get(label as usize).copied().unwrap_or(0);
        band.contains(inside as f64 / footprint as f64)
    };
    let mut forward = CellMap::new();
    let mut backward = CellMap::new();
    for (from_previous, from_next) in &touching {
        let parents: Vec<Label> = from_previous
            .iter()
            .copied()
            .filter(|&l| accept(l, &warped_overlap, &warped_sizes))
            .collect();
        let children: Vec<Label> = from_next
            .iter()
            .copied()
            .filter(|&l| accept(l, &next_overlap, &next_sizes))
            .collect();

        // --- 5. Transposed Maps ---
        for &parent in &parents {
            for &child in &children {
                forward.entry(parent).or_default().insert(child);
                backward.entry(child).or_default().insert(parent);
            }
        }
    }

    let delta = FrameDelta {
        previous_frame_id: previous.frame_id.clone(),
        next_frame_id: next.frame_id.clone(),
        forward,
        backward,
        cell_flow,
    };

    debug!(
        previous = %delta.previous_frame_id,
        next = %delta.next_frame_id,
        regions = region_count,
        links = delta.link_count(),
        "linked frame pair"
    );

    Ok(delta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::labeling::Centroid;
    use crate::core_modules::optical_flow::{FarnebackFlow, FlowVector, StaticFlow};

    /// Builds cells from axis-aligned rectangles `(top, left, height, width)`;
    /// cell k is the k-th rectangle.
    fn cells(frame_id: &str, rects: &[(usize, usize, usize, usize)]) -> DiscreteCells {
        let labels = Grid::from_fn(64, 64, |r, c| {
            rects
                .iter()
                .position(|&(top, left, h, w)| (top..top + h).contains(&r) && (left..left + w).contains(&c))
                .map_or(0, |k| k as Label + 1)
        });
        let centroids = rects
            .iter()
            .map(|&(top, left, h, w)| Centroid {
                row: top as f64 + (h as f64 - 1.0) / 2.0,
                col: left as f64 + (w as f64 - 1.0) / 2.0,
            })
            .collect();
        DiscreteCells {
            frame_id: frame_id.to_string(),
            labels,
            centroids,
        }
    }

    fn set(ids: &[Label]) -> BTreeSet<Label> {
        ids.iter().copied().collect()
    }

    #[test]
    fn identical_frames_link_one_to_one() {
        let a = cells("a", &[(16, 16, 10, 10), (36, 30, 8, 12)]);
        let b = cells("b", &[(16, 16, 10, 10), (36, 30, 8, 12)]);
        let delta = link_cells(&a, &b, &FarnebackFlow::default(), &OverlapBand::default())
            .expect("Error linking identical frames");

        let max_motion = delta.cell_flow.as_slice().iter().map(FlowVector::magnitude).fold(0.0f32, f32::max);
        assert!(max_motion < 1e-3, "max motion {max_motion}");
        assert_eq!(delta.children_of(1), set(&[1]));
        assert_eq!(delta.children_of(2), set(&[2]));
        assert_eq!(delta.parents_of(1), set(&[1]));
        assert_eq!(delta.parents_of(2), set(&[2]));
        assert_eq!(delta.link_count(), 2);
    }

    #[test]
    fn doubled_cell_is_not_a_continuation() {
        // 10x10 grows to 10x20 in place: only half the later cell overlaps.
        let a = cells("a", &[(20, 20, 10, 10)]);
        let b = cells("b", &[(20, 20, 10, 20)]);
        let delta = link_cells(&a, &b, &StaticFlow::default(), &OverlapBand::default())
            .expect("Error linking doubled cell");
        assert!(delta.forward.is_empty());
        assert!(delta.backward.is_empty());
    }

    #[test]
    fn moderate_growth_is_a_continuation() {
        let a = cells("a", &[(20, 20, 10, 10)]);
        let b = cells("b", &[(20, 20, 12, 12)]);
        let delta = link_cells(&a, &b, &StaticFlow::default(), &OverlapBand::default())
            .expect("Error linking grown cell");
        assert_eq!(delta.children_of(1), set(&[1]));
    }

    #[test]
    fn equal_halves_of_a_split_both_continue_the_parent() {
        // A 10x20 cell breaks into two 10x9 halves with a 2-column gap.
        let a = cells("a", &[(20, 20, 10, 20)]);
        let b = cells("b", &[(20, 20, 10, 9), (20, 31, 10, 9)]);
        let delta = link_cells(&a, &b, &StaticFlow::default(), &OverlapBand::default())
            .expect("Error linking split cell");
        assert_eq!(delta.children_of(1), set(&[1, 2]));
        assert_eq!(delta.parents_of(1), set(&[1]));
        assert_eq!(delta.parents_of(2), set(&[1]));
        assert_eq!(delta.link_count(), 2);
    }

    #[test]
    fn equal_cells_merging_both_feed_the_result() {
        let a = cells("a", &[(20, 20, 10, 9), (20, 31, 10, 9)]);
        let b = cells("b", &[(20, 20, 10, 20)]);
        let delta = link_cells(&a, &b, &StaticFlow::default(), &OverlapBand::default())
            .expect("Error linking merged cells");
        assert_eq!(delta.parents_of(1), set(&[1, 2]));
        assert_eq!(delta.children_of(1), set(&[1]));
        assert_eq!(delta.children_of(2), set(&[1]));
    }

    #[test]
    fn sliver_overlap_is_noise() {
        // Only 2 of 8 columns overlap: a quarter of each footprint.
        let a = cells("a", &[(20, 10, 10, 8)]);
        let b = cells("b", &[(20, 16, 10, 8)]);
        let delta = link_cells(&a, &b, &StaticFlow::default(), &OverlapBand::default())
            .expect("Error linking shifted cell");
        assert!(delta.forward.is_empty());
        assert!(delta.backward.is_empty());
    }

    #[test]
    fn known_motion_is_followed() {
        // The cell moves 6 columns right; without motion the overlap would be too small.
        let a = cells("a", &[(20, 10, 10, 8)]);
        let b = cells("b", &[(20, 16, 10, 8)]);
        let still = link_cells(&a, &b, &StaticFlow::default(), &OverlapBand::default())
            .expect("Error linking without motion");
        assert!(still.forward.is_empty());

        let moving = StaticFlow {
            displacement: FlowVector { dx: 6.0, dy: 0.0 },
        };
        let delta = link_cells(&a, &b, &moving, &OverlapBand::default()).expect("Error linking with motion");
        assert_eq!(delta.children_of(1), set(&[1]));
    }

    #[test]
    fn empty_frames_produce_empty_delta() {
        let a = cells("a", &[]);
        let b = cells("b", &[(20, 20, 10, 10)]);
        let delta = link_cells(&a, &b, &StaticFlow::default(), &OverlapBand::default())
            .expect("Error linking empty frame");
        assert!(delta.forward.is_empty());
        assert!(delta.backward.is_empty());
        assert_eq!(delta.previous_frame_id, "a");
        assert_eq!(delta.next_frame_id, "b");
    }

    #[test]
    fn forward_and_backward_are_transposes() {
        let a = cells("a", &[(10, 10, 10, 10), (10, 40, 10, 10), (40, 20, 12, 12)]);
        let b = cells("b", &[(10, 40, 10, 11), (40, 20, 12, 12), (10, 10, 10, 10)]);
        let delta = link_cells(&a, &b, &StaticFlow::default(), &OverlapBand::default())
            .expect("Error linking shuffled cells");

        for (parent, children) in &delta.forward {
            for child in children {
                assert!(delta.parents_of(*child).contains(parent));
            }
        }
        for (child, parents) in &delta.backward {
            for parent in parents {
                assert!(delta.children_of(*parent).contains(child));
            }
        }
        assert_eq!(delta.children_of(1), set(&[3]));
        assert_eq!(delta.children_of(2), set(&[1]));
        assert_eq!(delta.children_of(3), set(&[2]));
    }

    #[test]
    fn mismatched_frames_are_rejected() {
        let a = cells("a", &[]);
        let mut b = cells("b", &[]);
        b.labels = Grid::new(32, 64);
        let err = link_cells(&a, &b, &StaticFlow::default(), &OverlapBand::default())
            .expect_err("Error expected for mismatched frames");
        assert!(matches!(err, LinkError::GridMismatch { next_width: 32, .. }));
    }

    #[test]
    fn warp_follows_negated_flow() {
        let mut labels: Grid<Label> = Grid::new(5, 3);
        labels.set(1, 1, 7);
        let flow = Grid::filled(5, 3, FlowVector { dx: 2.0, dy: 0.0 });
        let warped = warp_labels(&labels, &flow);
        assert_eq!(warped.get(1, 3), 7);
        assert_eq!(warped.get(1, 1), 0);
        // Left edge samples are clamped to column 0.
        assert_eq!(warped.get(1, 0), 0);
    }

    #[test]
    fn band_is_exclusive() {
        let band = OverlapBand::default();
        assert!(!band.contains(0.6));
        assert!(band.contains(0.61));
        assert!(band.contains(1.69));
        assert!(!band.contains(1.7));
        assert!(!band.contains(2.0));
        assert!(band.is_valid());
        assert!(!OverlapBand { min_share: 1.0, max_share: 1.0 }.is_valid());
    }
}
