// THEORY:
// The `pipeline` module is the top-level API for the storm-cell engine. It ties
// the per-frame layers (palette, intensity extraction, cell segmentation) into
// one call, and wraps the result in a single frame value type that callers pass
// around instead of juggling images, stacks and label grids themselves.
//
// Key architectural principles:
// 1.  **One Frame Type**: `RadarFrame` carries a capability tag. A `Raw` frame
//     holds a decoded radar image and analyzes itself on first request; an
//     `Analyzed` frame was restored from a bundle and already carries its
//     analysis. Both answer the same questions.
// 2.  **Analyze Once**: A raw frame caches its analysis together with the
//     settings it used, so asking twice under the same settings never segments
//     the image twice. Asking under other settings recomputes the cache; a
//     restored frame has no image to recompute from and refuses instead.
// 3.  **Named Parameters**: Every tunable (size threshold, segmentation and seed
//     levels, flow settings, overlap band) lives in `PipelineConfig`, has a
//     default, and is validated before use.

use crate::core_modules::bundle::{AnalysisSettings, BundleError, FrameBundle};
use crate::core_modules::discrete_cells::{segment_discrete_cells, SegmentError};
use crate::core_modules::intensity::{extract_intensity_arrays, DEFAULT_CELL_SIZE_THRESHOLD};
use crate::core_modules::lineage::{FrameSequence, LineageError};
use crate::core_modules::optical_flow::{FarnebackFlow, FlowConfig};
use crate::core_modules::palette::{FrameError, IndexedImage, MAX_INTENSITY};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, info};

// Re-export key data structures for the public API.
pub use crate::core_modules::discrete_cells::DiscreteCells;
pub use crate::core_modules::intensity::IntensityArrays;
pub use crate::core_modules::lineage::{CellLink, LineageTree, Track};
pub use crate::core_modules::linker::{FrameDelta, OverlapBand};

/// Invalid or unreadable pipeline configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} = {value} is outside the intensity levels 1..={max}", max = MAX_INTENSITY)]
    LevelOutOfRange { name: &'static str, value: usize },

    #[error("seed level {seed} is below the segmentation level {segmentation}")]
    SeedBelowSegmentation { seed: usize, segmentation: usize },

    #[error("flow parameter {name} is invalid: {reason}")]
    Flow { name: &'static str, reason: String },

    #[error("overlap band ({min_share}, {max_share}) is empty or not finite")]
    OverlapBand { min_share: f64, max_share: f64 },

    #[error(transparent)]
    Segment(#[from] SegmentError),

    #[error("frame '{frame_id}' was restored with an analysis made under other settings")]
    StaleAnalysis { frame_id: String },

    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// Any failure surfaced by the top-level API.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Bundle(#[from] BundleError),
    #[error(transparent)]
    Lineage(#[from] LineageError),
    #[error("cannot read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Configuration for the storm-cell pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Blobs smaller than this are dropped, holes smaller than this are filled.
    #[serde(default = "default_cell_size_threshold")]
    pub cell_size_threshold: usize,
    /// Level whose pixels form the distance field and the watershed mask.
    #[serde(default = "default_segmentation_intensity_level")]
    pub segmentation_intensity_level: usize,
    /// Level whose blobs seed the watershed and so define the cells.
    #[serde(default = "default_seed_intensity_level")]
    pub seed_intensity_level: usize,
    #[serde(default)]
    pub flow: FlowConfig,
    #[serde(default)]
    pub overlap: OverlapBand,
}

fn default_cell_size_threshold() -> usize {
    DEFAULT_CELL_SIZE_THRESHOLD
}

fn default_segmentation_intensity_level() -> usize {
    5
}

fn default_seed_intensity_level() -> usize {
    7
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cell_size_threshold: default_cell_size_threshold(),
            segmentation_intensity_level: default_segmentation_intensity_level(),
            seed_intensity_level: default_seed_intensity_level(),
            flow: FlowConfig::default(),
            overlap: OverlapBand::default(),
        }
    }
}

impl PipelineConfig {
    /// Loads and validates a JSON configuration. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let max = MAX_INTENSITY as usize;
        for (name, value) in [
            ("segmentation_intensity_level", self.segmentation_intensity_level),
            ("seed_intensity_level", self.seed_intensity_level),
        ] {
            if !(1..=max).contains(&value) {
                return Err(ConfigError::LevelOutOfRange { name, value });
            }
        }
        if self.seed_intensity_level < self.segmentation_intensity_level {
            return Err(ConfigError::SeedBelowSegmentation {
                seed: self.seed_intensity_level,
                segmentation: self.segmentation_intensity_level,
            });
        }

        let flow = &self.flow;
        if !(flow.pyramid_scale > 0.0 && flow.pyramid_scale < 1.0) {
            return Err(ConfigError::Flow {
                name: "pyramid_scale",
                reason: format!("{} is not within (0, 1)", flow.pyramid_scale),
            });
        }
        if flow.window_size == 0 || flow.window_size % 2 == 0 {
            return Err(ConfigError::Flow {
                name: "window_size",
                reason: format!("{} is not a positive odd size", flow.window_size),
            });
        }
        if flow.iterations == 0 {
            return Err(ConfigError::Flow {
                name: "iterations",
                reason: "at least one iteration is required".to_string(),
            });
        }
        if flow.poly_n == 0 || !flow.poly_sigma.is_finite() || flow.poly_sigma < 0.0 {
            return Err(ConfigError::Flow {
                name: "poly_n",
                reason: format!("neighborhood {} with sigma {} cannot be fitted", flow.poly_n, flow.poly_sigma),
            });
        }

        if !self.overlap.is_valid() {
            return Err(ConfigError::OverlapBand {
                min_share: self.overlap.min_share,
                max_share: self.overlap.max_share,
            });
        }
        Ok(())
    }

    /// The settings that shape a single frame's analysis.
    pub fn analysis_settings(&self) -> AnalysisSettings {
        AnalysisSettings {
            cell_size_threshold: self.cell_size_threshold,
            segmentation_intensity_level: self.segmentation_intensity_level,
            seed_intensity_level: self.seed_intensity_level,
        }
    }

    /// The dense motion estimator these settings describe.
    pub fn motion_estimator(&self) -> FarnebackFlow {
        FarnebackFlow::new(self.flow.clone())
    }
}

/// Everything the per-frame layers derive from one radar image.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameAnalysis {
    pub frame_id: String,
    pub settings: AnalysisSettings,
    pub intensity: IntensityArrays,
    pub cells: DiscreteCells,
}

/// Runs intensity extraction and cell segmentation on one decoded image.
pub fn analyze_image(frame_id: &str, image: &IndexedImage, config: &PipelineConfig) -> Result<FrameAnalysis, ConfigError> {
    config.validate()?;

    // Stage 1: Intensity Classes
    let classes = image.intensity_classes();

    // Stage 2: Per-Level Blobs
    let intensity = extract_intensity_arrays(frame_id, &classes, config.cell_size_threshold);

    // Stage 3: Discrete Cells
    let cells = segment_discrete_cells(&intensity, config.segmentation_intensity_level, config.seed_intensity_level)?;

    info!(frame_id, cells = cells.cell_count(), "analyzed frame");
    Ok(FrameAnalysis {
        frame_id: frame_id.to_string(),
        settings: config.analysis_settings(),
        intensity,
        cells,
    })
}

/// What a `RadarFrame` can do without further work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Decoded image; analysis runs on demand.
    Raw,
    /// Restored analysis; no image is held.
    Analyzed,
}

#[derive(Debug)]
enum FrameContent {
    Raw {
        image: IndexedImage,
        analysis: Mutex<Option<Arc<FrameAnalysis>>>,
    },
    Analyzed(Arc<FrameAnalysis>),
}

impl Clone for FrameContent {
    fn clone(&self) -> Self {
        match self {
            Self::Raw { image, analysis } => Self::Raw {
                image: image.clone(),
                analysis: Mutex::new(analysis.lock().unwrap_or_else(PoisonError::into_inner).clone()),
            },
            Self::Analyzed(analysis) => Self::Analyzed(Arc::clone(analysis)),
        }
    }
}

/// A single radar frame, either raw or already analyzed.
#[derive(Debug, Clone)]
pub struct RadarFrame {
    frame_id: String,
    filename: String,
    content: FrameContent,
}

impl RadarFrame {
    pub fn from_image(frame_id: &str, filename: &str, image: IndexedImage) -> Self {
        Self {
            frame_id: frame_id.to_string(),
            filename: filename.to_string(),
            content: FrameContent::Raw {
                image,
                analysis: Mutex::new(None),
            },
        }
    }

    /// Decodes an encoded radar image held in memory.
    pub fn from_png_bytes(frame_id: &str, filename: &str, bytes: &[u8]) -> Result<Self, FrameError> {
        Ok(Self::from_image(frame_id, filename, IndexedImage::decode(bytes)?))
    }

    /// Reads and decodes a radar image; the file stem becomes the frame id.
    pub fn from_png_file(path: &Path) -> Result<Self, PipelineError> {
        let bytes = std::fs::read(path).map_err(|source| PipelineError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let (frame_id, filename) = names_from_path(path);
        Ok(Self::from_png_bytes(&frame_id, &filename, &bytes)?)
    }

    /// Restores an analyzed frame from its bundle.
    pub fn from_bundle(bundle: &FrameBundle) -> Result<Self, BundleError> {
        let (intensity, cells) = bundle.unpack()?;
        Ok(Self {
            frame_id: bundle.frame_id.clone(),
            filename: bundle.filename.clone(),
            content: FrameContent::Analyzed(Arc::new(FrameAnalysis {
                frame_id: bundle.frame_id.clone(),
                settings: bundle.settings,
                intensity,
                cells,
            })),
        })
    }

    pub fn from_bundle_file(path: &Path) -> Result<Self, BundleError> {
        Self::from_bundle(&FrameBundle::read_from(path)?)
    }

    pub fn frame_id(&self) -> &str {
        &self.frame_id
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn kind(&self) -> FrameKind {
        match self.content {
            FrameContent::Raw { .. } => FrameKind::Raw,
            FrameContent::Analyzed(_) => FrameKind::Analyzed,
        }
    }

    /// The latest analysis, if one exists already.
    pub fn analysis(&self) -> Option<Arc<FrameAnalysis>> {
        match &self.content {
            FrameContent::Raw { analysis, .. } => analysis.lock().unwrap_or_else(PoisonError::into_inner).clone(),
            FrameContent::Analyzed(analysis) => Some(Arc::clone(analysis)),
        }
    }

    /// The analysis under `config`, computing and caching it for a raw frame.
    pub fn analyze(&self, config: &PipelineConfig) -> Result<Arc<FrameAnalysis>, ConfigError> {
        let settings = config.analysis_settings();
        match &self.content {
            FrameContent::Analyzed(analysis) if analysis.settings == settings => Ok(Arc::clone(analysis)),
            FrameContent::Analyzed(_) => Err(ConfigError::StaleAnalysis {
                frame_id: self.frame_id.clone(),
            }),
            FrameContent::Raw { image, analysis } => {
                let mut cached = analysis.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(current) = cached.as_ref().filter(|current| current.settings == settings) {
                    return Ok(Arc::clone(current));
                }
                if cached.is_some() {
                    debug!(frame_id = %self.frame_id, "settings changed, analyzing again");
                }
                let computed = Arc::new(analyze_image(&self.frame_id, image, config)?);
                *cached = Some(Arc::clone(&computed));
                Ok(computed)
            }
        }
    }

    /// Packs the frame's analysis for persistence.
    pub fn to_bundle(&self, config: &PipelineConfig) -> Result<FrameBundle, PipelineError> {
        let analysis = self.analyze(config)?;
        Ok(FrameBundle::new(&self.filename, analysis.settings, &analysis.intensity, &analysis.cells)?)
    }
}

/// Frame id (file stem) and file name of a path.
pub(crate) fn names_from_path(path: &Path) -> (String, String) {
    let frame_id = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let filename = path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    (frame_id, filename)
}

/// Analyzes `frames` (oldest first) and links them into a sequence, on the calling thread.
pub fn build_sequence(frames: &[RadarFrame], config: &PipelineConfig) -> Result<FrameSequence, PipelineError> {
    config.validate()?;
    let cells = frames
        .iter()
        .map(|frame| frame.analyze(config).map(|analysis| analysis.cells.clone()))
        .collect::<Result<Vec<_>, _>>()?;
    debug!(frames = cells.len(), "linking frames");
    Ok(FrameSequence::new(cells, &config.motion_estimator(), &config.overlap)?)
}
