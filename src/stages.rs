//! Per-stage drivers: Copy, Segment, BackgroundCorrect, Track, Extract
//! (§4.F). Each reads its inputs from the catalog's previously-recorded
//! paths and writes its own outputs, recording them back into the catalog.
//! Idempotent: if a stage's output artifact already exists on disk, it
//! records the path and skips recomputation.

use std::path::{Path, PathBuf};

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::background::BackgroundAlgorithm;
use crate::binarize::BinarizeAlgorithm;
use crate::cancel::CancelToken;
use crate::catalog::{CatalogChannels, ResultCatalog};
use crate::error::{PipelineError, Result};
use crate::features;
use crate::metadata::{ChannelSelection, FrameSource, MicroscopyMetadata};
use crate::progress::{should_report, ProgressEvent, ProgressReporter};
use crate::store::{self, FrameStore};
use crate::tracking::{self, TrackerParams};

/// Scheduling/algorithm knobs shared by the stages, analogous to
/// `ProcessingContext.params` in the original (mask_size, binarization
/// method, div_horiz/div_vert, tracker size thresholds).
#[derive(Debug, Clone)]
pub struct PipelineParams {
    pub channels: ChannelSelection,
    pub binarize_algorithm: String,
    pub background_algorithm: String,
    pub div_horiz: usize,
    pub div_vert: usize,
    pub tracker: TrackerParams,
}

impl Default for PipelineParams {
    fn default() -> Self {
        Self {
            channels: ChannelSelection::default(),
            binarize_algorithm: "log-std".to_string(),
            background_algorithm: "schwarzfischer".to_string(),
            div_horiz: 7,
            div_vert: 5,
            tracker: TrackerParams::default(),
        }
    }
}

fn fov_dir(output_dir: &Path, fov: usize) -> PathBuf {
    output_dir.join(format!("fov_{fov:03}"))
}

fn artifact_path(output_dir: &Path, fov: usize, base_name: &str, suffix: &str) -> PathBuf {
    fov_dir(output_dir, fov).join(format!("{base_name}_fov_{fov:03}_{suffix}.zarr"))
}

fn read_stack_f64(store_root: &Path, shape: (usize, usize, usize)) -> Result<Vec<Array2<f64>>> {
    let (n_frames, height, width) = shape;
    let store = store::open_store(store_root)?;
    let fs = FrameStore::<u16>::open(&store, "/", n_frames, height, width)?;
    (0..n_frames)
        .map(|t| fs.read_frame(t).map(|f| f.mapv(|v| v as f64)))
        .collect()
}

fn read_stack_bool(store_root: &Path, shape: (usize, usize, usize)) -> Result<Vec<Array2<bool>>> {
    let (n_frames, height, width) = shape;
    let store = store::open_store(store_root)?;
    let fs = FrameStore::<bool>::open(&store, "/", n_frames, height, width)?;
    (0..n_frames).map(|t| fs.read_frame(t)).collect()
}

fn read_stack_f32(store_root: &Path, shape: (usize, usize, usize)) -> Result<Vec<Array2<f32>>> {
    let (n_frames, height, width) = shape;
    let store = store::open_store(store_root)?;
    let fs = FrameStore::<f32>::open(&store, "/", n_frames, height, width)?;
    (0..n_frames).map(|t| fs.read_frame(t)).collect()
}

fn read_stack_u16(store_root: &Path, shape: (usize, usize, usize)) -> Result<Vec<Array2<u16>>> {
    let (n_frames, height, width) = shape;
    let store = store::open_store(store_root)?;
    let fs = FrameStore::<u16>::open(&store, "/", n_frames, height, width)?;
    (0..n_frames).map(|t| fs.read_frame(t)).collect()
}

fn write_stack_bool(store_root: &Path, frames: &[Array2<bool>]) -> Result<()> {
    let (height, width) = frames[0].dim();
    let store = store::open_store(store_root)?;
    let fs = FrameStore::<bool>::create(&store, "/", frames.len(), height, width)?;
    for (t, frame) in frames.iter().enumerate() {
        fs.write_frame(t, frame)?;
    }
    Ok(())
}

fn write_stack_f32(store_root: &Path, frames: &[Array2<f32>]) -> Result<()> {
    let (height, width) = frames[0].dim();
    let store = store::open_store(store_root)?;
    let fs = FrameStore::<f32>::create(&store, "/", frames.len(), height, width)?;
    for (t, frame) in frames.iter().enumerate() {
        fs.write_frame(t, frame)?;
    }
    Ok(())
}

fn write_stack_u16(store_root: &Path, frames: &[Array2<u16>]) -> Result<()> {
    let (height, width) = frames[0].dim();
    let store = store::open_store(store_root)?;
    let fs = FrameStore::<u16>::create(&store, "/", frames.len(), height, width)?;
    for (t, frame) in frames.iter().enumerate() {
        fs.write_frame(t, frame)?;
    }
    Ok(())
}

/// Copy stage: materializes raw pc/fl stacks from the external reader.
/// Driven separately from the catalog-only stages since it needs the reader.
pub struct CopyStage;

impl CopyStage {
    #[allow(clippy::too_many_arguments)]
    pub fn process_fov(
        &self,
        source: &dyn FrameSource,
        catalog: &mut ResultCatalog,
        output_dir: &Path,
        fov: usize,
        params: &PipelineParams,
        cancel: &CancelToken,
        progress: &dyn ProgressReporter,
    ) -> Result<()> {
        let metadata = source.metadata();
        std::fs::create_dir_all(fov_dir(output_dir, fov))?;

        if let Some(pc_ch) = params.channels.pc {
            let path = artifact_path(output_dir, fov, &metadata.base_name, "pc_raw");
            if !path.exists() {
                let mut frames = Vec::with_capacity(metadata.n_frames);
                for t in 0..metadata.n_frames {
                    cancel.check()?;
                    if should_report(t, metadata.n_frames, 30) {
                        progress.report(ProgressEvent {
                            stage: "Copy".into(),
                            fov,
                            t,
                            total: metadata.n_frames,
                            message: "Copying phase contrast".into(),
                        });
                    }
                    frames.push(source.read_frame(fov, pc_ch, t)?);
                }
                write_stack_u16(&path, &frames)?;
            }
            catalog.set_pc(fov, pc_ch, path);
        }

        for &fl_ch in &params.channels.fl {
            let path = artifact_path(output_dir, fov, &metadata.base_name, &format!("fl_raw_ch_{fl_ch}"));
            if !path.exists() {
                let mut frames = Vec::with_capacity(metadata.n_frames);
                for t in 0..metadata.n_frames {
                    cancel.check()?;
                    if should_report(t, metadata.n_frames, 30) {
                        progress.report(ProgressEvent {
                            stage: "Copy".into(),
                            fov,
                            t,
                            total: metadata.n_frames,
                            message: format!("Copying fluorescence channel {fl_ch}"),
                        });
                    }
                    frames.push(source.read_frame(fov, fl_ch, t)?);
                }
                write_stack_u16(&path, &frames)?;
            }
            catalog.add_fl(fov, fl_ch, path);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn process_all_fovs(
        &self,
        source: &dyn FrameSource,
        catalog: &mut ResultCatalog,
        output_dir: &Path,
        fov_start: usize,
        fov_end: usize,
        params: &PipelineParams,
        cancel: &CancelToken,
        progress: &dyn ProgressReporter,
    ) -> Result<()> {
        for fov in fov_start..=fov_end {
            cancel.check()?;
            if let Err(e) = self.process_fov(source, catalog, output_dir, fov, params, cancel, progress) {
                if matches!(e, PipelineError::Cancelled) {
                    return Err(e);
                }
                tracing::warn!("FOV {fov}: Copy failed: {e}");
            }
        }
        Ok(())
    }
}

/// Common shape for the catalog-driven stages (Segment, BackgroundCorrect,
/// Track, Extract): everything they need is already on disk, named in the
/// catalog.
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    #[allow(clippy::too_many_arguments)]
    fn process_fov(
        &self,
        metadata: &MicroscopyMetadata,
        catalog: &mut ResultCatalog,
        output_dir: &Path,
        fov: usize,
        params: &PipelineParams,
        cancel: &CancelToken,
        progress: &dyn ProgressReporter,
    ) -> Result<()>;

    #[allow(clippy::too_many_arguments)]
    fn process_all_fovs(
        &self,
        metadata: &MicroscopyMetadata,
        catalog: &mut ResultCatalog,
        output_dir: &Path,
        fov_start: usize,
        fov_end: usize,
        params: &PipelineParams,
        cancel: &CancelToken,
        progress: &dyn ProgressReporter,
    ) -> Result<()> {
        for fov in fov_start..=fov_end {
            cancel.check()?;
            if let Err(e) = self.process_fov(metadata, catalog, output_dir, fov, params, cancel, progress) {
                if matches!(e, PipelineError::Cancelled) {
                    return Err(e);
                }
                tracing::warn!("FOV {fov}: {} failed: {e}", self.name());
            }
        }
        Ok(())
    }
}

pub struct SegmentStage;

impl Stage for SegmentStage {
    fn name(&self) -> &'static str {
        "Segment"
    }

    #[allow(clippy::too_many_arguments)]
    fn process_fov(
        &self,
        metadata: &MicroscopyMetadata,
        catalog: &mut ResultCatalog,
        output_dir: &Path,
        fov: usize,
        params: &PipelineParams,
        cancel: &CancelToken,
        progress: &dyn ProgressReporter,
    ) -> Result<()> {
        let pc = catalog
            .results
            .get(&fov)
            .and_then(|r| r.pc.clone())
            .ok_or_else(|| PipelineError::NotFound(fov_dir(output_dir, fov)))?;
        let (pc_ch, pc_path) = pc;

        let seg_path = artifact_path(output_dir, fov, &metadata.base_name, "seg");
        if !seg_path.exists() {
            let shape = metadata.stack_shape();
            let pc_frames = read_stack_f64(&pc_path, shape)?;
            let algo = BinarizeAlgorithm::get(&params.binarize_algorithm)?;
            let mut masks = Vec::with_capacity(pc_frames.len());
            for (t, frame) in pc_frames.iter().enumerate() {
                cancel.check()?;
                if should_report(t, pc_frames.len(), 30) {
                    progress.report(ProgressEvent {
                        stage: "Segment".into(),
                        fov,
                        t,
                        total: pc_frames.len(),
                        message: "Binarizing".into(),
                    });
                }
                masks.push(algo.as_dyn().binarize_frame(frame)?);
            }
            write_stack_bool(&seg_path, &masks)?;
        }
        catalog.set_seg(fov, pc_ch, seg_path);
        Ok(())
    }
}

pub struct BackgroundCorrectStage;

impl Stage for BackgroundCorrectStage {
    fn name(&self) -> &'static str {
        "BackgroundCorrect"
    }

    #[allow(clippy::too_many_arguments)]
    fn process_fov(
        &self,
        metadata: &MicroscopyMetadata,
        catalog: &mut ResultCatalog,
        output_dir: &Path,
        fov: usize,
        params: &PipelineParams,
        cancel: &CancelToken,
        progress: &dyn ProgressReporter,
    ) -> Result<()> {
        let entry = catalog
            .results
            .get(&fov)
            .cloned()
            .ok_or_else(|| PipelineError::NotFound(fov_dir(output_dir, fov)))?;
        let (_, seg_path) = entry
            .seg
            .clone()
            .ok_or_else(|| PipelineError::NotFound(fov_dir(output_dir, fov)))?;
        let shape = metadata.stack_shape();
        let mask = read_stack_bool(&seg_path, shape)?;

        for (ch, fl_path) in &entry.fl {
            let ch = *ch;
            let corrected_path =
                artifact_path(output_dir, fov, &metadata.base_name, &format!("fl_corrected_ch_{ch}"));
            if !corrected_path.exists() {
                let fluor = read_stack_f64(fl_path, shape)?;
                let algo = BackgroundAlgorithm::get(&params.background_algorithm)?;
                let corrected = algo.as_dyn().correct(&fluor, &mask, fov, cancel, progress)?;
                write_stack_f32(&corrected_path, &corrected)?;
            }
            catalog.add_fl_background(fov, ch, corrected_path);
        }
        Ok(())
    }
}

/// Sidecar alongside a labels stack recording the tracker's per-cell `good`
/// flag, since `FrameStore` only carries fixed-dtype pixel arrays and the
/// catalog carries paths, not per-cell metadata.
#[derive(Serialize, Deserialize)]
struct TraceGoodSidecar {
    good: Vec<bool>,
}

fn good_sidecar_path(labels_path: &Path) -> PathBuf {
    let mut p = labels_path.as_os_str().to_owned();
    p.push(".good.json");
    PathBuf::from(p)
}

pub struct TrackStage;

impl Stage for TrackStage {
    fn name(&self) -> &'static str {
        "Track"
    }

    #[allow(clippy::too_many_arguments)]
    fn process_fov(
        &self,
        metadata: &MicroscopyMetadata,
        catalog: &mut ResultCatalog,
        output_dir: &Path,
        fov: usize,
        params: &PipelineParams,
        cancel: &CancelToken,
        progress: &dyn ProgressReporter,
    ) -> Result<()> {
        let seg = catalog
            .results
            .get(&fov)
            .and_then(|r| r.seg.clone())
            .ok_or_else(|| PipelineError::NotFound(fov_dir(output_dir, fov)))?;
        let (seg_ch, seg_path) = seg;

        let labeled_path = artifact_path(output_dir, fov, &metadata.base_name, "seg_labeled");
        if !labeled_path.exists() {
            let shape = metadata.stack_shape();
            let masks = read_stack_bool(&seg_path, shape)?;
            let outcome = tracking::track_masks(&masks, &params.tracker, fov, cancel, progress)?;
            write_stack_u16(&labeled_path, &outcome.labels)?;
            let sidecar = TraceGoodSidecar {
                good: outcome.trace_good,
            };
            let json = serde_json::to_string(&sidecar)
                .map_err(|e| PipelineError::IoFailure(std::io::Error::other(e.to_string())))?;
            std::fs::write(good_sidecar_path(&labeled_path), json)?;
        }
        catalog.set_seg_labeled(fov, seg_ch, labeled_path);
        Ok(())
    }
}

pub struct ExtractStage;

impl Stage for ExtractStage {
    fn name(&self) -> &'static str {
        "Extract"
    }

    #[allow(clippy::too_many_arguments)]
    fn process_fov(
        &self,
        metadata: &MicroscopyMetadata,
        catalog: &mut ResultCatalog,
        output_dir: &Path,
        fov: usize,
        _params: &PipelineParams,
        cancel: &CancelToken,
        progress: &dyn ProgressReporter,
    ) -> Result<()> {
        cancel.check()?;
        let entry = catalog
            .results
            .get(&fov)
            .cloned()
            .ok_or_else(|| PipelineError::NotFound(fov_dir(output_dir, fov)))?;
        let (_, labeled_path) = entry
            .seg_labeled
            .clone()
            .ok_or_else(|| PipelineError::NotFound(fov_dir(output_dir, fov)))?;

        let traces_path = fov_dir(output_dir, fov).join(format!(
            "{}_fov_{:03}_traces.csv",
            metadata.base_name, fov
        ));
        if !traces_path.exists() {
            let shape = metadata.stack_shape();
            let labels = read_stack_u16(&labeled_path, shape)?;

            let fluor = if let Some((_, path)) = entry.fl_background.first() {
                read_stack_f32(path, shape)?
            } else if let Some((_, path)) = entry.fl.first() {
                read_stack_f64(path, shape)?
                    .into_iter()
                    .map(|f| f.mapv(|v| v as f32))
                    .collect()
            } else {
                return Err(PipelineError::NotFound(fov_dir(output_dir, fov)));
            };

            let sidecar_path = good_sidecar_path(&labeled_path);
            let cell_good: Option<Vec<bool>> = std::fs::read_to_string(&sidecar_path)
                .ok()
                .and_then(|s| serde_json::from_str::<TraceGoodSidecar>(&s).ok())
                .map(|s| s.good);

            progress.report(ProgressEvent {
                stage: "Extract".into(),
                fov,
                t: 0,
                total: metadata.n_frames,
                message: "Starting feature extraction".into(),
            });

            let table = features::extract(
                fov,
                &fluor,
                &labels,
                &metadata.timepoints,
                cell_good.as_deref(),
            )?;
            std::fs::create_dir_all(fov_dir(output_dir, fov))?;
            table.write_csv(&traces_path)?;
        }
        catalog.set_traces(fov, traces_path);
        Ok(())
    }
}

/// Initialize the scalar catalog fields (output_dir, channels, time_units)
/// the first time a run touches this catalog.
pub fn ensure_catalog_scalars(catalog: &mut ResultCatalog, output_dir: &Path, params: &PipelineParams, time_units: &str) {
    if catalog.output_dir.is_none() {
        catalog.output_dir = Some(output_dir.to_path_buf());
    }
    if catalog.channels.is_none() {
        catalog.channels = Some(CatalogChannels {
            pc: params.channels.pc,
            fl: params.channels.fl.clone(),
        });
    }
    if catalog.time_units.is_none() {
        catalog.time_units = Some(time_units.to_string());
    }
}
