// THEORY:
// The `bundle` module persists the analysis of one frame so that a sequence can
// be rebuilt later without decoding and segmenting the images again.
//
// Every array (the intensity frames, the intensity labels, the intensity
// centroids, the cell labels, the cell centroids) is bincode-encoded and zlib-
// compressed on its own; the bundle that carries them is bincode-encoded as one
// opaque blob keyed by its frame id. Decoding reproduces the arrays bit for bit.
// Unpacking checks that every grid has one shape and that every label has a
// centroid, so a restored frame cannot index out of range later. The settings
// the analysis was made with travel along with it.

use crate::core_modules::discrete_cells::DiscreteCells;
use crate::core_modules::grid::Grid;
use crate::core_modules::intensity::IntensityArrays;
use crate::core_modules::labeling::{Centroid, Label};
use crate::core_modules::palette::{IntensityClass, LEVEL_COUNT};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// File extension of persisted bundles.
pub const BUNDLE_EXTENSION: &str = "bra";

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("bundle I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("bundle encoding failed: {0}")]
    Encode(#[from] bincode::Error),
    #[error("intensity arrays belong to '{intensity}' but cells belong to '{cells}'")]
    FrameIdMismatch { intensity: String, cells: String },
    #[error("bundle holds {actual} intensity levels, expected {expected}")]
    LevelCount { expected: usize, actual: usize },
    #[error("{array} is {width}x{height}, but the frame is {expected_width}x{expected_height}")]
    ShapeMismatch {
        array: &'static str,
        width: usize,
        height: usize,
        expected_width: usize,
        expected_height: usize,
    },
    #[error("{array} uses label {label} but has only {count} centroids")]
    LabelOutOfRange { array: &'static str, label: Label, count: usize },
}

pub type Result<T> = std::result::Result<T, BundleError>;

/// A zlib-compressed, bincode-encoded value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressedArray {
    bytes: Vec<u8>,
}

impl CompressedArray {
    pub fn compress<T: Serialize>(value: &T) -> Result<Self> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        bincode::serialize_into(&mut encoder, value)?;
        Ok(Self {
            bytes: encoder.finish()?,
        })
    }

    pub fn decompress<T: DeserializeOwned>(&self) -> Result<T> {
        let decoder = ZlibDecoder::new(self.bytes.as_slice());
        Ok(bincode::deserialize_from(decoder)?)
    }

    /// Compressed size in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Parameters an analysis was computed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisSettings {
    pub cell_size_threshold: usize,
    pub segmentation_intensity_level: usize,
    pub seed_intensity_level: usize,
}

/// Rejects a grid whose shape differs from the frame's.
fn check_shape<T: Copy>(array: &'static str, grid: &Grid<T>, width: usize, height: usize) -> Result<()> {
    if grid.width() != width || grid.height() != height {
        return Err(BundleError::ShapeMismatch {
            array,
            width: grid.width(),
            height: grid.height(),
            expected_width: width,
            expected_height: height,
        });
    }
    Ok(())
}

/// Rejects a label grid naming a blob without a centroid.
fn check_labels(array: &'static str, labels: &Grid<Label>, count: usize) -> Result<()> {
    match labels.max_value() {
        Some(label) if label as usize > count => Err(BundleError::LabelOutOfRange { array, label, count }),
        _ => Ok(()),
    }
}

/// The persisted analysis of one frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameBundle {
    pub frame_id: String,
    /// Name of the image the frame was decoded from.
    pub filename: String,
    pub settings: AnalysisSettings,
    intensity_frames: CompressedArray,
    intensity_labels: CompressedArray,
    intensity_centroids: CompressedArray,
    cell_labels: CompressedArray,
    cell_centroids: CompressedArray,
}

impl FrameBundle {
    /// Compresses the analysis of one frame.
    pub fn new(
        filename: &str,
        settings: AnalysisSettings,
        intensity: &IntensityArrays,
        cells: &DiscreteCells,
    ) -> Result<Self> {
        if intensity.frame_id != cells.frame_id {
            return Err(BundleError::FrameIdMismatch {
                intensity: intensity.frame_id.clone(),
                cells: cells.frame_id.clone(),
            });
        }

        Ok(Self {
            frame_id: cells.frame_id.clone(),
            filename: filename.to_string(),
            settings,
            intensity_frames: CompressedArray::compress(&intensity.frames)?,
            intensity_labels: CompressedArray::compress(&intensity.labels)?,
            intensity_centroids: CompressedArray::compress(&intensity.centroids)?,
            cell_labels: CompressedArray::compress(&cells.labels)?,
            cell_centroids: CompressedArray::compress(&cells.centroids)?,
        })
    }

    /// Decompresses the intensity stack and the cell segmentation.
    pub fn unpack(&self) -> Result<(IntensityArrays, DiscreteCells)> {
        let frames: Vec<Grid<IntensityClass>> = self.intensity_frames.decompress()?;
        let labels: Vec<Grid<Label>> = self.intensity_labels.decompress()?;
        let centroids: Vec<Vec<Centroid>> = self.intensity_centroids.decompress()?;
        for actual in [frames.len(), labels.len(), centroids.len()] {
            if actual != LEVEL_COUNT {
                return Err(BundleError::LevelCount {
                    expected: LEVEL_COUNT,
                    actual,
                });
            }
        }

        let cell_labels: Grid<Label> = self.cell_labels.decompress()?;
        let cell_centroids: Vec<Centroid> = self.cell_centroids.decompress()?;

        let (width, height) = (cell_labels.width(), cell_labels.height());
        for (frame, level_labels) in frames.iter().zip(&labels) {
            check_shape("intensity frame", frame, width, height)?;
            check_shape("intensity labels", level_labels, width, height)?;
        }
        for (level_labels, level_centroids) in labels.iter().zip(&centroids) {
            check_labels("intensity labels", level_labels, level_centroids.len())?;
        }
        check_labels("cell labels", &cell_labels, cell_centroids.len())?;

        let intensity = IntensityArrays {
            frame_id: self.frame_id.clone(),
            frames,
            labels,
            centroids,
        };
        let cells = DiscreteCells {
            frame_id: self.frame_id.clone(),
            labels: cell_labels,
            centroids: cell_centroids,
        };
        Ok((intensity, cells))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Writes the bundle to `path`, replacing any existing file.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        bincode::serialize_into(&mut writer, self)?;
        writer.flush()?;
        debug!(frame_id = %self.frame_id, path = %path.display(), "wrote frame bundle");
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let bundle: Self = bincode::deserialize_from(reader)?;
        debug!(frame_id = %bundle.frame_id, path = %path.display(), "read frame bundle");
        Ok(bundle)
    }
}
