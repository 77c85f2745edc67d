// THEORY:
// The `Grid` is the "dumb" data container underneath every stage of the radar
// analysis. A radar product is a fixed-size raster, and every artifact derived
// from it (intensity classes, threshold masks, label maps, distance fields,
// motion fields) is another raster of the same shape. Keeping a single
// row-major container for all of them means every stage speaks the same
// coordinate language: `(row, col)` with row 0 at the top of the image.
//
// Key architectural principles:
// 1.  **Flat Storage**: Cells live in one contiguous `Vec<T>` in row-major order,
//     exactly like the RGBA frame buffers the pixel layer slices up.
// 2.  **No Behavior**: The grid knows how to index, map and count itself. It
//     does not know what a label or an intensity means.
// 3.  **Serializable**: Grids derive serde so the analysis bundle can persist them
//     without a bespoke wire format. Decoding goes through the same length check
//     as `from_vec`, so a decoded grid is always indexable.

use serde::{Deserialize, Serialize};

/// A row-major 2-D raster with runtime dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawGrid<T>")]
pub struct Grid<T> {
    /// Number of columns.
    width: usize,
    /// Number of rows.
    height: usize,
    /// Cell values, `height * width` long, row after row.
    data: Vec<T>,
}

/// Wire form of a grid, checked before it becomes one.
#[derive(Deserialize)]
struct RawGrid<T> {
    width: usize,
    height: usize,
    data: Vec<T>,
}

impl<T> TryFrom<RawGrid<T>> for Grid<T> {
    type Error = String;

    fn try_from(raw: RawGrid<T>) -> Result<Self, Self::Error> {
        let expected = raw.width.checked_mul(raw.height);
        if expected != Some(raw.data.len()) {
            return Err(format!(
                "grid of {}x{} holds {} values",
                raw.width,
                raw.height,
                raw.data.len()
            ));
        }
        Ok(Self {
            width: raw.width,
            height: raw.height,
            data: raw.data,
        })
    }
}

impl<T: Copy + Default> Grid<T> {
    /// Creates a grid filled with `T::default()`.
    pub fn new(width: usize, height: usize) -> Self {
        Self::filled(width, height, T::default())
    }
}

impl<T: Copy> Grid<T> {
    pub fn filled(width: usize, height: usize, value: T) -> Self {
        Self {
            width,
            height,
            data: vec![value; width * height],
        }
    }

    /// Wraps an existing row-major buffer. Returns `None` if the buffer length
    /// does not match the requested dimensions.
    pub fn from_vec(width: usize, height: usize, data: Vec<T>) -> Option<Self> {
        if data.len() != width * height {
            return None;
        }
        Some(Self {
            width,
            height,
            data,
        })
    }

    /// Builds a grid by evaluating `f(row, col)` for every cell.
    pub fn from_fn(width: usize, height: usize, mut f: impl FnMut(usize, usize) -> T) -> Self {
        let mut data = Vec::with_capacity(width * height);
        for row in 0..height {
            for col in 0..width {
                data.push(f(row, col));
            }
        }
        Self {
            width,
            height,
            data,
        }
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// True when both grids describe the same raster shape.
    pub fn same_shape<U>(&self, other: &Grid<U>) -> bool {
        self.width == other.width && self.height == other.height
    }

    #[inline]
    pub fn index_of(&self, row: usize, col: usize) -> usize {
        row * self.width + col
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> T {
        self.data[row * self.width + col]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, value: T) {
        let index = row * self.width + col;
        self.data[index] = value;
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    /// Applies `f` to every cell, producing a grid of the same shape.
    pub fn map<U: Copy>(&self, f: impl Fn(T) -> U) -> Grid<U> {
        Grid {
            width: self.width,
            height: self.height,
            data: self.data.iter().map(|&v| f(v)).collect(),
        }
    }

    /// The 4-connected neighbors (up, down, left, right) of a flat index that
    /// fall inside the grid.
    pub fn neighbors4(&self, index: usize) -> impl Iterator<Item = usize> + use<T> {
        let width = self.width;
        let height = self.height;
        let row = index / width;
        let col = index % width;
        let up = (row > 0).then(|| index - width);
        let down = (row + 1 < height).then(|| index + width);
        let left = (col > 0).then(|| index - 1);
        let right = (col + 1 < width).then(|| index + 1);
        [up, down, left, right].into_iter().flatten()
    }
}

impl<T: Copy + PartialEq + Default> Grid<T> {
    /// Number of cells that differ from `T::default()`.
    pub fn count_nonzero(&self) -> usize {
        let zero = T::default();
        self.data.iter().filter(|&&v| v != zero).count()
    }

    /// A boolean grid marking every non-default cell.
    pub fn nonzero_mask(&self) -> Grid<bool> {
        let zero = T::default();
        self.map(|v| v != zero)
    }
}

impl<T: Copy + Ord> Grid<T> {
    /// Largest value in the grid, `None` for an empty grid.
    pub fn max_value(&self) -> Option<T> {
        self.data.iter().copied().max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_vec_rejects_wrong_length() {
        assert!(Grid::from_vec(3, 2, vec![0u8; 5]).is_none());
        let grid = Grid::from_vec(3, 2, vec![1u8, 2, 3, 4, 5, 6]).expect("valid shape");
        assert_eq!(grid.get(1, 0), 4);
        assert_eq!(grid.get(0, 2), 3);
    }

    #[test]
    fn decoding_checks_the_buffer_length() {
        let short = serde_json::from_str::<Grid<u32>>(r#"{"width":64,"height":64,"data":[0]}"#);
        assert!(short.is_err());

        let grid = Grid::from_fn(3, 2, |r, c| (r * 3 + c) as u32);
        let bytes = bincode::serialize(&grid).expect("Error encoding grid");
        let decoded: Grid<u32> = bincode::deserialize(&bytes).expect("Error decoding grid");
        assert_eq!(decoded, grid);

        let forged = bincode::serialize(&(4usize, 4usize, vec![1u32; 3])).expect("Error encoding forged grid");
        assert!(bincode::deserialize::<Grid<u32>>(&forged).is_err());
    }

    #[test]
    fn neighbors_stay_inside_the_grid() {
        let grid: Grid<u8> = Grid::new(3, 3);
        let corner: Vec<usize> = grid.neighbors4(0).collect();
        assert_eq!(corner, vec![3, 1]);
        let mut center: Vec<usize> = grid.neighbors4(4).collect();
        center.sort();
        assert_eq!(center, vec![1, 3, 5, 7]);
    }

    #[test]
    fn nonzero_helpers() {
        let grid = Grid::from_fn(4, 4, |r, c| if r == c { 7u32 } else { 0 });
        assert_eq!(grid.count_nonzero(), 4);
        assert_eq!(grid.max_value(), Some(7));
        assert!(grid.nonzero_mask().get(2, 2));
        assert!(!grid.nonzero_mask().get(2, 3));
    }
}
