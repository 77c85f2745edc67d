// THEORY:
// The `palette` module is the bridge between the radar image as the weather
// service publishes it and the ordinal world the analysis layers work in.
// Radar products are indexed-color images: every pixel is a palette index, and
// the palette maps indices to RGBA colors. Fifteen of those colors are
// physically meaningful precipitation-intensity bands; everything else (map
// background, range rings, labels, transparency) means "no signal".
//
// Key architectural principles:
// 1.  **Single Source of Truth**: The color -> class table is a constant. The
//     classes are ordinal: class 15 is heavier rain than class 1, class 0 is
//     background.
// 2.  **Graceful Degradation**: A palette entry that matches no known color
//     degrades to class 0 rather than failing the frame.
// 3.  **Decode at the Edge**: Container decoding belongs to the `image` crate.
//     This module only asks it for RGBA pixels and rebuilds the indexed view
//     (`IndexedImage`) the rest of the pipeline consumes.

use crate::core_modules::grid::Grid;
use std::collections::HashMap;
use thiserror::Error;

/// Ordinal precipitation-intensity class, 0 (background) through 15.
pub type IntensityClass = u8;

/// Highest intensity class in the radar color scale.
pub const MAX_INTENSITY: IntensityClass = 15;

/// Number of intensity levels including the background sentinel at index 0.
pub const LEVEL_COUNT: usize = MAX_INTENSITY as usize + 1;

/// RGBA colors of the 15 precipitation bands, lightest (class 1) to heaviest (class 15).
pub const RADAR_COLOR_SCALE: [[u8; 4]; MAX_INTENSITY as usize] = [
    [245, 245, 255, 255],
    [180, 180, 255, 255],
    [120, 120, 255, 255],
    [20, 20, 255, 255],
    [0, 216, 195, 255],
    [0, 150, 144, 255],
    [0, 102, 102, 255],
    [255, 255, 0, 255],
    [255, 200, 0, 255],
    [255, 150, 0, 255],
    [255, 100, 0, 255],
    [255, 0, 0, 255],
    [200, 0, 0, 255],
    [120, 0, 0, 255],
    [40, 0, 0, 255],
];

/// Errors raised while turning raw frame bytes into an `IndexedImage`.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("image decode error: {0}")]
    Decode(#[from] image::ImageError),

    #[error("unsupported palette: {0}")]
    UnsupportedPalette(String),

    #[error("pixel buffer holds {actual} entries, expected {expected} ({width}x{height})")]
    DimensionMismatch {
        width: usize,
        height: usize,
        expected: usize,
        actual: usize,
    },

    #[error("palette index {index} out of range for a palette of {palette_len} colors")]
    PaletteIndexOutOfRange { index: u8, palette_len: usize },
}

/// Result type for frame decoding.
pub type Result<T> = std::result::Result<T, FrameError>;

/// Maps an RGBA color to its intensity class, 0 when the color is not a precipitation band.
pub fn color_to_class(color: [u8; 4]) -> IntensityClass {
    RADAR_COLOR_SCALE
        .iter()
        .position(|&band| band == color)
        .map(|i| i as IntensityClass + 1)
        .unwrap_or(0)
}

/// A decoded indexed-color radar image: a grid of palette indices plus the palette.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedImage {
    /// Palette index of every pixel.
    pub indices: Grid<u8>,
    /// RGBA color of every palette entry.
    pub palette: Vec<[u8; 4]>,
}

impl IndexedImage {
    /// Builds an indexed image from a raw index buffer and palette, validating both.
    pub fn new(width: usize, height: usize, indices: Vec<u8>, palette: Vec<[u8; 4]>) -> Result<Self> {
        let actual = indices.len();
        let indices = Grid::from_vec(width, height, indices).ok_or(FrameError::DimensionMismatch {
            width,
            height,
            expected: width * height,
            actual,
        })?;
        if palette.len() > 256 {
            return Err(FrameError::UnsupportedPalette(format!(
                "{} entries exceed the 8-bit index range",
                palette.len()
            )));
        }
        if let Some(&index) = indices.as_slice().iter().find(|&&i| i as usize >= palette.len()) {
            return Err(FrameError::PaletteIndexOutOfRange {
                index,
                palette_len: palette.len(),
            });
        }
        Ok(Self { indices, palette })
    }

    /// Rebuilds the indexed view of an RGBA image. Palette entries are assigned
    /// in order of first appearance in raster order.
    pub fn from_rgba(rgba: &image::RgbaImage) -> Result<Self> {
        let width = rgba.width() as usize;
        let height = rgba.height() as usize;
        let mut palette: Vec<[u8; 4]> = Vec::new();
        let mut lookup: HashMap<[u8; 4], u8> = HashMap::new();
        let mut indices = Vec::with_capacity(width * height);

        for pixel in rgba.pixels() {
            let color = pixel.0;
            let index = match lookup.get(&color) {
                Some(&index) => index,
                None => {
                    if palette.len() == 256 {
                        return Err(FrameError::UnsupportedPalette(
                            "more than 256 distinct colors; not an indexed radar product".to_string(),
                        ));
                    }
                    let index = palette.len() as u8;
                    palette.push(color);
                    lookup.insert(color, index);
                    index
                }
            };
            indices.push(index);
        }

        Self::new(width, height, indices, palette)
    }

    /// Decodes PNG (or any format the `image` crate recognises) bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let decoded = image::load_from_memory(bytes)?;
        Self::from_rgba(&decoded.to_rgba8())
    }

    pub fn width(&self) -> usize {
        self.indices.width()
    }

    pub fn height(&self) -> usize {
        self.indices.height()
    }

    /// Expands every pixel through the palette -> class lookup.
    pub fn intensity_classes(&self) -> Grid<IntensityClass> {
        let lookup: Vec<IntensityClass> = self.palette.iter().map(|&c| color_to_class(c)).collect();
        self.indices.map(|index| lookup.get(index as usize).copied().unwrap_or(0))
    }
}
