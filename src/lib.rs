// THEORY:
// This file is the main entry point for the `storm_cells` library crate.
// It exports the top-level API (`pipeline`, `parallel_pipeline`) together with
// the analysis layers (`core_modules`) they are built from.
//
// The engine reads a chronologically ordered run of weather-radar images and
// answers one question about each storm cell in it: where did it come from, and
// what did it become? Each frame is reduced independently (palette -> intensity
// levels -> discrete cells), adjacent frames are linked by motion-compensated
// overlap, and the links are assembled into a lineage graph that can be walked
// in either direction.

pub mod core_modules;
pub mod parallel_pipeline;
pub mod pipeline;

pub use crate::core_modules::lineage::{FrameSequence, LineageError};
pub use crate::parallel_pipeline::{BatchError, BatchReport, FrameInput, SequenceReport, WorkerPool};
pub use crate::pipeline::{
    analyze_image, build_sequence, ConfigError, FrameAnalysis, FrameKind, PipelineConfig, PipelineError, RadarFrame,
};
