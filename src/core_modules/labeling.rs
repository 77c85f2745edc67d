// THEORY:
// The `labeling` module is the spatial-grouping toolkit shared by the intensity
// extractor, the segmenter and the frame linker. Everything here operates on
// binary masks and integer label maps, and everything uses 4-connectivity
// (the cross-shaped structuring element): two pixels belong to the same object
// only if they share an edge.
//
// Key architectural principles:
// 1.  **Region Growing**: Components are found by seeding at the first unvisited
//     foreground pixel in raster order and growing through direct neighbors
//     until the region is exhausted. Labels are therefore numbered 1..=N in
//     order of each component's first pixel, which makes labeling fully
//     deterministic.
// 2.  **Morphological Clean-up**: Specks smaller than a size threshold are noise
//     and are removed; background pockets smaller than the same threshold are
//     holes and are filled. Both are expressed as "label, measure, rewrite".
// 3.  **Stateless Utility**: No function here keeps memory between calls.

use crate::core_modules::grid::Grid;
use serde::{Deserialize, Serialize};

/// Integer identifier of a connected component or cell. 0 is background.
pub type Label = u32;

/// Mean (row, col) position of a labeled region's pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Centroid {
    pub row: f64,
    pub col: f64,
}

/// Labels the 4-connected components of `mask`.
///
/// Returns the label grid and the number of components. Background is 0,
/// components are numbered from 1 in raster order of their first pixel.
pub fn label_components(mask: &Grid<bool>) -> (Grid<Label>, usize) {
    let mut labels: Grid<Label> = Grid::new(mask.width(), mask.height());
    let mut next_label: Label = 0;
    let mut stack: Vec<usize> = Vec::new();

    for start in 0..mask.len() {
        if !mask.as_slice()[start] || labels.as_slice()[start] != 0 {
            continue;
        }

        next_label += 1;
        labels.as_mut_slice()[start] = next_label;
        stack.push(start);

        while let Some(current) = stack.pop() {
            for neighbor in mask.neighbors4(current) {
                if mask.as_slice()[neighbor] && labels.as_slice()[neighbor] == 0 {
                    labels.as_mut_slice()[neighbor] = next_label;
                    stack.push(neighbor);
                }
            }
        }
    }

    (labels, next_label as usize)
}

/// Pixel count of every label 1..=count. Index 0 holds the background count.
pub fn label_sizes(labels: &Grid<Label>, count: usize) -> Vec<usize> {
    let mut sizes = vec![0usize; count + 1];
    for &label in labels.as_slice() {
        if let Some(size) = sizes.get_mut(label as usize) {
            *size += 1;
        }
    }
    sizes
}

/// Removes every 4-connected foreground component with fewer than `min_size` pixels.
pub fn remove_small_objects(mask: &Grid<bool>, min_size: usize) -> Grid<bool> {
    if min_size <= 1 {
        return mask.clone();
    }
    let (labels, count) = label_components(mask);
    let sizes = label_sizes(&labels, count);
    labels.map(|label| label != 0 && sizes[label as usize] >= min_size)
}

/// Fills every 4-connected background region with fewer than `area_threshold` pixels.
///
/// A mask with no foreground has nothing to enclose, so it is returned unchanged.
pub fn remove_small_holes(mask: &Grid<bool>, area_threshold: usize) -> Grid<bool> {
    if area_threshold <= 1 || !mask.as_slice().iter().any(|&v| v) {
        return mask.clone();
    }
    let background = mask.map(|v| !v);
    let (labels, count) = label_components(&background);
    let sizes = label_sizes(&labels, count);
    labels.map(|label| label == 0 || sizes[label as usize] < area_threshold)
}

/// Centroid of every label 1..=count; `None` for a label with no pixels.
pub fn label_centroids(labels: &Grid<Label>, count: usize) -> Vec<Option<Centroid>> {
    let mut sums = vec![(0usize, 0.0f64, 0.0f64); count + 1];
    for row in 0..labels.height() {
        for col in 0..labels.width() {
            let label = labels.get(row, col) as usize;
            if label == 0 || label > count {
                continue;
            }
            let entry = &mut sums[label];
            entry.0 += 1;
            entry.1 += row as f64;
            entry.2 += col as f64;
        }
    }

    sums.into_iter()
        .skip(1)
        .map(|(n, row_sum, col_sum)| {
            (n > 0).then(|| Centroid {
                row: row_sum / n as f64,
                col: col_sum / n as f64,
            })
        })
        .collect()
}
