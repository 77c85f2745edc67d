// This file is an example of how to use the `storm_cells` library.
// The main library entry point is `src/lib.rs`.
//
// Usage: storm_cells [--config <file.json>] [--save-bundles <dir>] <frame>...
// Frames are radar PNGs or `.bra` bundles; they are processed in file-name order.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use storm_cells::core_modules::bundle::BUNDLE_EXTENSION;
use storm_cells::{FrameInput, PipelineConfig, WorkerPool};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

struct Args {
    config: Option<PathBuf>,
    bundle_dir: Option<PathBuf>,
    frames: Vec<PathBuf>,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        config: None,
        bundle_dir: None,
        frames: Vec::new(),
    };
    let mut raw = std::env::args().skip(1);
    while let Some(arg) = raw.next() {
        match arg.as_str() {
            "--config" => args.config = Some(raw.next().context("--config needs a file")?.into()),
            "--save-bundles" => args.bundle_dir = Some(raw.next().context("--save-bundles needs a directory")?.into()),
            _ => args.frames.push(arg.into()),
        }
    }
    if args.frames.is_empty() {
        bail!("usage: storm_cells [--config <file.json>] [--save-bundles <dir>] <frame>...");
    }
    args.frames.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(args)
}

fn frame_input(path: &Path) -> FrameInput {
    let is_bundle = path.extension().is_some_and(|ext| ext == BUNDLE_EXTENSION);
    if is_bundle {
        FrameInput::BundleFile(path.to_path_buf())
    } else {
        FrameInput::PngFile(path.to_path_buf())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Storm Cells Engine - Example Runner");
    let args = parse_args()?;
    let config = match &args.config {
        Some(path) => PipelineConfig::from_json_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => PipelineConfig::default(),
    };

    let pool = WorkerPool::new(config)?;
    let inputs = args.frames.iter().map(|path| frame_input(path)).collect();
    let report = pool.build_sequence(inputs).await;
    for failure in &report.failures {
        warn!(%failure, "skipped");
    }

    if let Some(dir) = &args.bundle_dir {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        for frame in &report.frames {
            let path = dir.join(format!("{}.{}", frame.frame_id(), BUNDLE_EXTENSION));
            frame.to_bundle(pool.config())?.write_to(&path)?;
            info!(path = %path.display(), "saved bundle");
        }
    }

    let Some(sequence) = report.sequence else {
        bail!("no sequence could be assembled ({} failures)", report.failures.len());
    };

    for frame_id in sequence.frame_ids() {
        let cells = sequence.get_frame(frame_id)?;
        for cell_id in 1..=cells.cell_count() as u32 {
            let track = sequence.get_track(frame_id, cell_id)?;
            let parents = sequence.get_cell_parents(frame_id, cell_id)?;
            let children = sequence.get_cell_children(frame_id, cell_id)?;
            info!(
                frame_id = %frame_id,
                cell_id,
                parents = ?parents.cells,
                children = ?children.cells,
                span = track.frame_span(),
                "cell"
            );
        }
    }

    if let Some(last) = sequence.frame_ids().last() {
        let cells = sequence.get_frame(last)?;
        for cell_id in 1..=cells.cell_count() as u32 {
            let track = sequence.get_track(last, cell_id)?;
            println!("{}", serde_json::to_string_pretty(&track)?);
        }
    }
    Ok(())
}
