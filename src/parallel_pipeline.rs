// THEORY:
// The `parallel_pipeline` schedules the engine's units of work on a bounded pool
// of blocking workers. There are two kinds of unit: analyzing one frame (decode,
// extract, segment) and linking one adjacent pair of analyzed frames. Frames are
// independent of each other, and pairs are independent of each other once both
// of their frames are analyzed, so each phase fans out completely.
//
// Key architectural principles:
// 1.  **Bounded Fan-Out**: A semaphore sized to the machine's cores gates every
//     unit; the CPU-heavy work itself runs on `spawn_blocking` so it never stalls
//     the async runtime.
// 2.  **Isolated Failures**: A unit that fails (bad image, mismatched pair, even a
//     panicking worker) becomes one `BatchError` in the report. Every other unit
//     still completes.
// 3.  **Order Preserved**: Results come back in input order, so chronology
//     survives the fan-out.

use crate::core_modules::discrete_cells::DiscreteCells;
use crate::core_modules::linker::{link_cells, FrameDelta};
use crate::core_modules::lineage::FrameSequence;
use crate::core_modules::optical_flow::MotionEstimator;
use crate::pipeline::{ConfigError, PipelineConfig, RadarFrame};
use futures::future::join_all;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// A unit of work that did not complete.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BatchError {
    #[error("frame '{frame_id}' failed: {message}")]
    Frame { frame_id: String, message: String },
    #[error("linking '{previous}' to '{next}' failed: {message}")]
    Link {
        previous: String,
        next: String,
        message: String,
    },
    #[error("worker for '{unit}' did not finish: {message}")]
    Worker { unit: String, message: String },
    #[error("sequence assembly failed: {0}")]
    Sequence(String),
}

/// Completed results (in input order) and the failures of the units that did not complete.
#[derive(Debug, Clone)]
pub struct BatchReport<T> {
    pub completed: Vec<T>,
    pub failures: Vec<BatchError>,
}

impl<T> BatchReport<T> {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Where a frame comes from.
#[derive(Debug, Clone)]
pub enum FrameInput {
    /// Encoded image bytes already in memory.
    Png {
        frame_id: String,
        filename: String,
        bytes: Vec<u8>,
    },
    /// An image file; its stem is the frame id.
    PngFile(PathBuf),
    /// A bundle written by an earlier run.
    BundleFile(PathBuf),
    /// A frame that is already loaded.
    Frame(RadarFrame),
}

impl FrameInput {
    /// Name used to report this input.
    fn unit_name(&self) -> String {
        match self {
            FrameInput::Png { frame_id, .. } => frame_id.clone(),
            FrameInput::PngFile(path) | FrameInput::BundleFile(path) => path.display().to_string(),
            FrameInput::Frame(frame) => frame.frame_id().to_string(),
        }
    }

    fn load(self) -> Result<RadarFrame, String> {
        match self {
            FrameInput::Png {
                frame_id,
                filename,
                bytes,
            } => RadarFrame::from_png_bytes(&frame_id, &filename, &bytes).map_err(|e| e.to_string()),
            FrameInput::PngFile(path) => RadarFrame::from_png_file(&path).map_err(|e| e.to_string()),
            FrameInput::BundleFile(path) => RadarFrame::from_bundle_file(&path).map_err(|e| e.to_string()),
            FrameInput::Frame(frame) => Ok(frame),
        }
    }
}

/// The outcome of building a sequence through the pool.
#[derive(Debug)]
pub struct SequenceReport {
    /// `None` when any pair failed to link.
    pub sequence: Option<FrameSequence>,
    /// Frames that were analyzed, in input order.
    pub frames: Vec<RadarFrame>,
    pub failures: Vec<BatchError>,
}

/// Bounded pool of blocking workers for frame analysis and pair linking.
pub struct WorkerPool {
    config: Arc<PipelineConfig>,
    estimator: Arc<dyn MotionEstimator>,
    permits: Arc<Semaphore>,
    workers: usize,
}

impl WorkerPool {
    /// A pool with one worker per CPU.
    pub fn new(config: PipelineConfig) -> Result<Self, ConfigError> {
        Self::with_workers(config, num_cpus::get())
    }

    pub fn with_workers(config: PipelineConfig, workers: usize) -> Result<Self, ConfigError> {
        config.validate()?;
        let workers = workers.max(1);
        let estimator: Arc<dyn MotionEstimator> = Arc::new(config.motion_estimator());
        Ok(Self {
            config: Arc::new(config),
            estimator,
            permits: Arc::new(Semaphore::new(workers)),
            workers,
        })
    }

    /// Replaces the motion estimator used for linking.
    pub fn with_estimator(mut self, estimator: Arc<dyn MotionEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs `job` on a blocking worker once a permit is free.
    fn run_blocking<T, F>(&self, unit: String, job: F) -> impl Future<Output = Result<T, BatchError>> + use<T, F>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, BatchError> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        async move {
            let _permit = permits.acquire_owned().await.map_err(|e| BatchError::Worker {
                unit: unit.clone(),
                message: e.to_string(),
            })?;
            tokio::task::spawn_blocking(job)
                .await
                .map_err(|e| BatchError::Worker {
                    unit,
                    message: e.to_string(),
                })?
        }
    }

    /// Loads and analyzes every input.
    pub async fn analyze_batch(&self, inputs: Vec<FrameInput>) -> BatchReport<RadarFrame> {
        let jobs = inputs.into_iter().map(|input| {
            let unit = input.unit_name();
            let config = Arc::clone(&self.config);
            self.run_blocking(unit.clone(), move || {
                let frame = input.load().map_err(|message| BatchError::Frame {
                    frame_id: unit.clone(),
                    message,
                })?;
                frame.analyze(&config).map_err(|e| BatchError::Frame {
                    frame_id: frame.frame_id().to_string(),
                    message: e.to_string(),
                })?;
                Ok(frame)
            })
        });

        let report = collect(join_all(jobs).await);
        for failure in &report.failures {
            warn!(%failure, "frame analysis failed");
        }
        info!(
            analyzed = report.completed.len(),
            failed = report.failures.len(),
            workers = self.workers,
            "analyzed frame batch"
        );
        report
    }

    /// Links every adjacent pair of `cells`. Each completed delta keeps the
    /// position of its earlier frame.
    pub async fn link_batch(&self, cells: Vec<DiscreteCells>) -> BatchReport<(usize, FrameDelta)> {
        let cells = Arc::new(cells);
        let jobs = (1..cells.len()).map(|next| {
            let cells = Arc::clone(&cells);
            let estimator = Arc::clone(&self.estimator);
            let band = self.config.overlap;
            let unit = format!("{} -> {}", cells[next - 1].frame_id, cells[next].frame_id);
            self.run_blocking(unit, move || {
                let (previous, current) = (&cells[next - 1], &cells[next]);
                link_cells(previous, current, estimator.as_ref(), &band)
                    .map(|delta| (next - 1, delta))
                    .map_err(|e| BatchError::Link {
                        previous: previous.frame_id.clone(),
                        next: current.frame_id.clone(),
                        message: e.to_string(),
                    })
            })
        });

        let report = collect(join_all(jobs).await);
        for failure in &report.failures {
            warn!(%failure, "frame linking failed");
        }
        report
    }

    /// Analyzes the inputs (oldest first), links the frames that analyzed
    /// cleanly, and assembles the sequence.
    pub async fn build_sequence(&self, inputs: Vec<FrameInput>) -> SequenceReport {
        let analyzed = self.analyze_batch(inputs).await;
        let mut failures = analyzed.failures;
        let frames = analyzed.completed;

        let cells: Vec<DiscreteCells> = frames
            .iter()
            .filter_map(|frame| frame.analyze(&self.config).ok().map(|analysis| analysis.cells.clone()))
            .collect();
        let linked = self.link_batch(cells.clone()).await;

        let sequence = if linked.is_clean() {
            let mut deltas = linked.completed;
            deltas.sort_by_key(|(position, _)| *position);
            let deltas = deltas.into_iter().map(|(_, delta)| delta).collect();
            match FrameSequence::from_parts(cells, deltas) {
                Ok(sequence) => Some(sequence),
                Err(e) => {
                    failures.push(BatchError::Sequence(e.to_string()));
                    None
                }
            }
        } else {
            failures.extend(linked.failures);
            None
        };

        SequenceReport {
            sequence,
            frames,
            failures,
        }
    }
}

fn collect<T>(results: Vec<Result<T, BatchError>>) -> BatchReport<T> {
    let mut report = BatchReport {
        completed: Vec::with_capacity(results.len()),
        failures: Vec::new(),
    };
    for result in results {
        match result {
            Ok(value) => report.completed.push(value),
            Err(failure) => report.failures.push(failure),
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::palette::{IndexedImage, RADAR_COLOR_SCALE};
    use crate::core_modules::optical_flow::StaticFlow;
    use crate::pipeline::build_sequence;

    /// A 48x48 frame with one square storm of class 8 at `(top, left)`.
    fn storm(frame_id: &str, top: usize, left: usize, side: usize) -> RadarFrame {
        let palette = vec![[0, 0, 0, 0], RADAR_COLOR_SCALE[7]];
        let indices = (0..48 * 48)
            .map(|i| {
                let (r, c) = (i / 48, i % 48);
                u8::from((top..top + side).contains(&r) && (left..left + side).contains(&c))
            })
            .collect();
        let image = IndexedImage::new(48, 48, indices, palette).expect("Error building image");
        RadarFrame::from_image(frame_id, &format!("{frame_id}.png"), image)
    }

    fn pool() -> WorkerPool {
        WorkerPool::with_workers(PipelineConfig::default(), 2)
            .expect("Error building pool")
            .with_estimator(Arc::new(StaticFlow::default()))
    }

    #[tokio::test]
    async fn bad_frames_do_not_sink_the_batch() {
        let inputs = vec![
            FrameInput::Frame(storm("a", 10, 10, 12)),
            FrameInput::Png {
                frame_id: "broken".to_string(),
                filename: "broken.png".to_string(),
                bytes: b"not an image".to_vec(),
            },
            FrameInput::Frame(storm("c", 20, 20, 12)),
        ];
        let report = pool().analyze_batch(inputs).await;

        let ids: Vec<&str> = report.completed.iter().map(RadarFrame::frame_id).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert!(report.completed.iter().all(|f| f.analysis().is_some()));
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(&report.failures[0], BatchError::Frame { frame_id, .. } if frame_id == "broken"));
    }

    #[tokio::test]
    async fn pooled_sequence_matches_sequential_build() {
        let frames = vec![storm("t0", 10, 10, 12), storm("t1", 10, 10, 13), storm("t2", 10, 10, 14)];
        let config = PipelineConfig::default();

        let pool = WorkerPool::with_workers(config.clone(), 3).expect("Error building pool");
        let inputs = frames.iter().cloned().map(FrameInput::Frame).collect();
        let report = pool.build_sequence(inputs).await;
        assert!(report.failures.is_empty(), "{:?}", report.failures);
        let pooled = report.sequence.expect("Error building pooled sequence");

        let sequential = build_sequence(&frames, &config).expect("Error building sequential sequence");
        assert_eq!(pooled.frame_ids(), sequential.frame_ids());
        assert_eq!(pooled.deltas(), sequential.deltas());
        assert_eq!(pooled.get_track("t2", 1), sequential.get_track("t2", 1));
    }

    #[tokio::test]
    async fn mismatched_pairs_are_reported() {
        let small = {
            let image = IndexedImage::new(8, 8, vec![0; 64], vec![[0, 0, 0, 0]]).expect("Error building image");
            RadarFrame::from_image("small", "small.png", image)
        };
        let inputs = vec![FrameInput::Frame(storm("big", 10, 10, 12)), FrameInput::Frame(small)];
        let report = pool().build_sequence(inputs).await;
        assert!(report.sequence.is_none());
        assert_eq!(report.frames.len(), 2);
        assert!(matches!(&report.failures[..], [BatchError::Link { previous, .. }] if previous == "big"));
    }

    #[tokio::test]
    async fn frames_analyzed_earlier_follow_the_pool_settings() {
        let frame = storm("t0", 10, 10, 12);
        let earlier = frame.analyze(&PipelineConfig::default()).expect("Error analyzing frame");
        assert_eq!(earlier.cells.cell_count(), 1);

        // Class 8 storms never reach level 9, so the pool sees no cells.
        let strict = PipelineConfig { seed_intensity_level: 9, ..Default::default() };
        let pool = WorkerPool::with_workers(strict, 2).expect("Error building pool");
        let report = pool.build_sequence(vec![FrameInput::Frame(frame)]).await;
        let sequence = report.sequence.expect("Error building sequence");
        assert_eq!(sequence.get_frame("t0").map(DiscreteCells::cell_count), Ok(0));
    }

    #[tokio::test]
    async fn empty_input_builds_an_empty_sequence() {
        let report = pool().build_sequence(Vec::new()).await;
        let sequence = report.sequence.expect("Error building empty sequence");
        assert!(sequence.is_empty());
        assert!(report.failures.is_empty());
    }

    #[test]
    fn pools_always_have_a_worker() {
        let pool = WorkerPool::with_workers(PipelineConfig::default(), 0).expect("Error building pool");
        assert_eq!(pool.workers(), 1);
        assert!(WorkerPool::new(PipelineConfig::default()).is_ok());
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let config = PipelineConfig { seed_intensity_level: 2, ..Default::default() };
        assert!(WorkerPool::new(config).is_err());
    }
}
