// THEORY:
// The `watershed` module implements marker-controlled watershed flooding, the
// "region growing from seeds" idea taken to a full relief map. Seeds are
// pre-labeled pixels; the flood grows every seed outwards through 4-connected
// neighbors, always advancing whichever frontier pixel is lowest on the relief
// first. Where two floods meet, the boundary follows the ridge between them.
//
// Key architectural principles & algorithm steps:
// 1.  **Priority Flood**: A binary heap orders frontier pixels by relief height,
//     then by insertion age, so that equal heights flood in FIFO order and the
//     result never depends on heap internals.
// 2.  **Label on Push**: A pixel takes the label of the neighbor that reached it
//     first and is never relabeled, so seeds cannot be overwritten.
// 3.  **Masked**: Pixels outside the mask are never flooded and stay 0. Mask
//     regions containing no seed stay 0 as well; the watershed refines seeds,
//     it never invents new labels.

use crate::core_modules::grid::Grid;
use crate::core_modules::labeling::Label;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

/// A relief value that can order a watershed flood. Lower values flood first.
pub trait ReliefValue: Copy {
    fn relief_cmp(&self, other: &Self) -> Ordering;
}

impl ReliefValue for f64 {
    fn relief_cmp(&self, other: &Self) -> Ordering {
        self.total_cmp(other)
    }
}

impl ReliefValue for i64 {
    fn relief_cmp(&self, other: &Self) -> Ordering {
        self.cmp(other)
    }
}

/// Frontier pixel: relief height, insertion age, flat index.
struct FloodEntry<V> {
    height: V,
    age: u64,
    index: usize,
}

impl<V: ReliefValue> PartialEq for FloodEntry<V> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<V: ReliefValue> Eq for FloodEntry<V> {}

impl<V: ReliefValue> PartialOrd for FloodEntry<V> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<V: ReliefValue> Ord for FloodEntry<V> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.height
            .relief_cmp(&other.height)
            .then(self.age.cmp(&other.age))
    }
}

/// Floods `relief` from the labeled `markers`, restricted to `mask`.
///
/// All three grids must share one shape; markers outside the mask are ignored.
pub fn watershed<V: ReliefValue>(relief: &Grid<V>, markers: &Grid<Label>, mask: &Grid<bool>) -> Grid<Label> {
    debug_assert!(relief.same_shape(markers) && relief.same_shape(mask));

    let mut output: Grid<Label> = Grid::new(markers.width(), markers.height());
    let mut heap: BinaryHeap<Reverse<FloodEntry<V>>> = BinaryHeap::new();
    let mut age: u64 = 0;

    // --- 1. Seeding ---
    for index in 0..markers.len() {
        let label = markers.as_slice()[index];
        if label != 0 && mask.as_slice()[index] {
            output.as_mut_slice()[index] = label;
            heap.push(Reverse(FloodEntry {
                height: relief.as_slice()[index],
                age,
                index,
            }));
            age += 1;
        }
    }

    // --- 2. Flooding ---
    while let Some(Reverse(entry)) = heap.pop() {
        let label = output.as_slice()[entry.index];
        for neighbor in output.neighbors4(entry.index) {
            if !mask.as_slice()[neighbor] || output.as_slice()[neighbor] != 0 {
                continue;
            }
            output.as_mut_slice()[neighbor] = label;
            heap.push(Reverse(FloodEntry {
                height: relief.as_slice()[neighbor],
                age,
                index: neighbor,
            }));
            age += 1;
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ridge_splits_two_basins() {
        // Relief along one row: two valleys separated by a ridge at column 4.
        let heights = [1i64, 0, 1, 2, 5, 2, 1, 0, 1];
        let relief = Grid::from_fn(9, 1, |_, c| heights[c]);
        let mut markers: Grid<Label> = Grid::new(9, 1);
        markers.set(0, 1, 1);
        markers.set(0, 7, 2);
        let mask = Grid::filled(9, 1, true);

        let labels = watershed(&relief, &markers, &mask);
        assert_eq!(labels.as_slice()[..4], [1, 1, 1, 1]);
        assert_eq!(labels.as_slice()[5..], [2, 2, 2, 2]);
        assert_ne!(labels.get(0, 4), 0);
    }

    #[test]
    fn unseeded_and_masked_pixels_stay_background() {
        let relief: Grid<i64> = Grid::new(6, 1);
        let mut markers: Grid<Label> = Grid::new(6, 1);
        markers.set(0, 0, 3);
        let mask = Grid::from_fn(6, 1, |_, c| c != 2);

        let labels = watershed(&relief, &markers, &mask);
        assert_eq!(labels.as_slice(), &[3, 3, 0, 0, 0, 0]);
    }

    #[test]
    fn markers_outside_mask_are_ignored() {
        let relief: Grid<f64> = Grid::new(3, 1);
        let mut markers: Grid<Label> = Grid::new(3, 1);
        markers.set(0, 0, 1);
        let mask = Grid::from_fn(3, 1, |_, c| c > 0);
        let labels = watershed(&relief, &markers, &mask);
        assert_eq!(labels.count_nonzero(), 0);
    }
}
