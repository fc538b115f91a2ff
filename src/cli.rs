//! `mutrace run`: drives the orchestrator against pre-materialized raw
//! stacks, since ND2 reading is out of this crate's scope (§1).
//!
//! Mirrors the teacher's `Cli`/`Commands` dispatch (`clap::Subcommand`) and
//! its `progress(f64, &str)` -> stderr JSON convention, reused here as the
//! `ProgressReporter` sink.

use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use clap::{Args, Parser, Subcommand};
use ndarray::Array2;

use mutrace::cancel::CancelToken;
use mutrace::catalog::ResultCatalog;
use mutrace::error::{PipelineError, Result};
use mutrace::metadata::{ChannelSelection, FrameSource, MicroscopyMetadata};
use mutrace::orchestrator;
use mutrace::progress::{ProgressEvent, ProgressReporter};
use mutrace::stages::{self, PipelineParams};
use mutrace::store::{self, FrameStore};
use mutrace::tracking::TrackerParams;

#[derive(Parser)]
#[command(name = "mutrace", about = "mutrace: per-FOV live-cell microscopy processing pipeline")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    Run(RunArgs),
}

#[derive(Args, Clone)]
pub struct RunArgs {
    /// Directory holding metadata.json and per-FOV raw channel stacks
    #[arg(long)]
    pub input: String,

    /// Output directory for masks, labels, corrected fluorescence, traces and the catalog
    #[arg(long)]
    pub output: String,

    /// Phase-contrast channel index
    #[arg(long)]
    pub pc_channel: Option<usize>,

    /// Fluorescence channel index (repeatable)
    #[arg(long = "fl-channel")]
    pub fl_channels: Vec<usize>,

    /// First FOV to process, inclusive (-1 = start of range)
    #[arg(long, default_value_t = -1)]
    pub fov_start: i64,

    /// Last FOV to process, inclusive (-1 = end of range)
    #[arg(long, default_value_t = -1)]
    pub fov_end: i64,

    /// Number of FOVs copied per batch before fanning out to workers
    #[arg(long, default_value_t = 2)]
    pub batch_size: usize,

    /// Number of worker threads processing FOV sub-ranges in parallel
    #[arg(long, default_value_t = 2)]
    pub n_workers: usize,

    /// Binarization algorithm: log-std or global-otsu
    #[arg(long, default_value = "log-std")]
    pub binarize_algorithm: String,

    /// Background correction algorithm: schwarzfischer or morph-open
    #[arg(long, default_value = "schwarzfischer")]
    pub background_algorithm: String,

    /// Time units recorded in the result catalog
    #[arg(long, default_value = "min")]
    pub time_units: String,
}

/// A `FrameSource` over a directory of pre-materialized raw stacks:
/// `<input>/metadata.json` plus `<input>/fov_<fff>/ch_<c>.zarr` per channel.
/// Stands in for a real microscopy-file reader (§1 names that reader as an
/// external collaborator out of scope).
struct DirFrameSource {
    metadata: MicroscopyMetadata,
    input_dir: PathBuf,
    opened: Mutex<HashMap<(usize, usize), FrameStore<u16>>>,
}

impl DirFrameSource {
    fn open(input_dir: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(input_dir.join("metadata.json"))?;
        let metadata: MicroscopyMetadata = serde_json::from_str(&text)
            .map_err(|e| PipelineError::IoFailure(std::io::Error::other(e.to_string())))?;
        Ok(Self {
            metadata,
            input_dir: input_dir.to_path_buf(),
            opened: Mutex::new(HashMap::new()),
        })
    }

    fn channel_path(&self, fov: usize, channel: usize) -> PathBuf {
        self.input_dir.join(format!("fov_{fov:03}")).join(format!("ch_{channel}.zarr"))
    }
}

impl FrameSource for DirFrameSource {
    fn metadata(&self) -> &MicroscopyMetadata {
        &self.metadata
    }

    fn read_frame(&self, fov: usize, channel: usize, frame: usize) -> Result<Array2<u16>> {
        let mut opened = self.opened.lock().unwrap();
        if let std::collections::hash_map::Entry::Vacant(e) = opened.entry((fov, channel)) {
            let path = self.channel_path(fov, channel);
            let store = store::open_store(&path)?;
            let fs = FrameStore::<u16>::open(
                &store,
                "/",
                self.metadata.n_frames,
                self.metadata.height,
                self.metadata.width,
            )?;
            e.insert(fs);
        }
        opened[&(fov, channel)].read_frame(frame)
    }
}

/// Emits each event as a JSON line on stderr, matching the teacher's
/// `progress(f64, &str)` -> `serde_json::json!(...)` convention.
struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let _ = writeln!(
            io::stderr(),
            "{}",
            serde_json::json!({
                "stage": event.stage,
                "fov": event.fov,
                "t": event.t,
                "total": event.total,
                "message": event.message,
            })
        );
        let _ = io::stderr().flush();
    }
}

pub fn run(args: RunArgs) -> std::result::Result<bool, Box<dyn std::error::Error>> {
    let output_dir = PathBuf::from(&args.output);
    let source = DirFrameSource::open(Path::new(&args.input))?;
    let metadata = source.metadata().clone();

    let channels = ChannelSelection {
        pc: args.pc_channel,
        fl: args.fl_channels.clone(),
        ..Default::default()
    };
    if !channels.is_valid() {
        return Err("--pc-channel must not also appear in --fl-channel".into());
    }

    let params = PipelineParams {
        channels,
        binarize_algorithm: args.binarize_algorithm.clone(),
        background_algorithm: args.background_algorithm.clone(),
        tracker: TrackerParams::default(),
        ..Default::default()
    };

    let mut catalog = ResultCatalog::new();
    stages::ensure_catalog_scalars(&mut catalog, &output_dir, &params, &args.time_units);

    let cancel = CancelToken::new();
    let progress = StderrProgress;

    let success = orchestrator::run_complete_workflow(
        &metadata,
        &source,
        &mut catalog,
        &output_dir,
        args.fov_start,
        args.fov_end,
        args.batch_size,
        args.n_workers,
        &params,
        &cancel,
        &progress,
    )?;
    Ok(success)
}
