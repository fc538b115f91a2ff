//! End-to-end workflow orchestration: batching, worker pool, context merge,
//! catalog persistence (§4.G).
//!
//! Grounded in `original_source/.../processing/workflow/run.py`:
//! `_compute_batches`, `_split_worker_ranges`, `_merge_contexts`,
//! `run_single_worker`, `run_complete_workflow`. The original dispatches
//! workers on a `ThreadPoolExecutor`; here a sized `rayon::ThreadPool` plays
//! the same role.

use std::path::Path;

use rayon::ThreadPoolBuilder;

use crate::cancel::CancelToken;
use crate::catalog::ResultCatalog;
use crate::error::{PipelineError, Result};
use crate::metadata::{FrameSource, MicroscopyMetadata};
use crate::progress::ProgressReporter;
use crate::stages::{BackgroundCorrectStage, CopyStage, ExtractStage, PipelineParams, SegmentStage, Stage, TrackStage};

/// Split contiguous FOV indices into batches of `batch_size`, the last one
/// possibly shorter.
fn compute_batches(fovs: &[usize], batch_size: usize) -> Vec<Vec<usize>> {
    let batch_size = batch_size.max(1);
    fovs.chunks(batch_size).map(|c| c.to_vec()).collect()
}

/// Split a batch into up to `n_workers` contiguous, as-even-as-possible
/// sub-ranges; any remainder FOVs go to the earliest workers.
fn split_worker_ranges(fovs: &[usize], n_workers: usize) -> Vec<Vec<usize>> {
    if n_workers == 0 {
        return if fovs.is_empty() { vec![] } else { vec![fovs.to_vec()] };
    }
    let per_worker = fovs.len() / n_workers;
    let remainder = fovs.len() % n_workers;
    let mut ranges = Vec::new();
    let mut start = 0;
    for i in 0..n_workers {
        let count = per_worker + usize::from(i < remainder);
        if count > 0 {
            ranges.push(fovs[start..start + count].to_vec());
            start += count;
        }
    }
    ranges
}

/// Resolve the `-1`-as-"default" sentinel the scheduling knobs use (§6),
/// then validate the resulting inclusive range against `n_fovs`.
fn resolve_fov_range(fov_start: i64, fov_end: i64, n_fovs: usize) -> Result<(usize, usize)> {
    let n = n_fovs as i64;
    let start = if fov_start < 0 { 0 } else { fov_start };
    let end = if fov_end < 0 { n - 1 } else { fov_end };
    if start < 0 || end >= n || start > end {
        return Err(PipelineError::InvalidRange { start, end, n_fovs });
    }
    Ok((start as usize, end as usize))
}

/// Run Segment -> BackgroundCorrect -> Track -> Extract over one contiguous
/// sub-range, against a private copy of the catalog. Returns
/// `(successful_fov_count, worker_catalog)`.
fn run_single_worker(
    fov_range: &[usize],
    metadata: &MicroscopyMetadata,
    catalog: &ResultCatalog,
    output_dir: &Path,
    params: &PipelineParams,
    cancel: &CancelToken,
    progress: &dyn ProgressReporter,
) -> (usize, ResultCatalog) {
    let mut worker_catalog = catalog.clone();
    let fov_start = fov_range[0];
    let fov_end = fov_range[fov_range.len() - 1];

    let stages: [&dyn Stage; 4] = [&SegmentStage, &BackgroundCorrectStage, &TrackStage, &ExtractStage];
    for stage in stages {
        if cancel.is_cancelled() {
            break;
        }
        if let Err(e) = stage.process_all_fovs(metadata, &mut worker_catalog, output_dir, fov_start, fov_end, params, cancel, progress) {
            tracing::warn!("worker for FOVs {fov_start}-{fov_end}: {} aborted: {e}", stage.name());
            break;
        }
    }

    let successful = fov_range
        .iter()
        .filter(|&&fov| {
            worker_catalog
                .results
                .get(&fov)
                .map(|r| r.traces.is_some())
                .unwrap_or(false)
        })
        .count();
    (successful, worker_catalog)
}

/// Persist the catalog to `<output_dir>/processing_results.yaml`, merging
/// with whatever is already on disk (another process or a prior run may
/// have written partial results there).
fn persist_catalog(catalog: &ResultCatalog, output_dir: &Path) -> Result<()> {
    let path = output_dir.join("processing_results.yaml");
    let mut on_disk = if path.exists() {
        let text = std::fs::read_to_string(&path)?;
        ResultCatalog::from_yaml(&text).unwrap_or_default()
    } else {
        ResultCatalog::default()
    };
    on_disk.merge(catalog);
    let yaml = on_disk.to_yaml()?;
    std::fs::write(&path, yaml)?;
    Ok(())
}

/// `run_complete_workflow(metadata, catalog, fov_start, fov_end, batch_size,
/// n_workers, cancel_token) -> success` (§4.G). `fov_start`/`fov_end` use the
/// `-1` sentinel for "default to the full range", matching §6's scheduling
/// knobs.
#[allow(clippy::too_many_arguments)]
pub fn run_complete_workflow(
    metadata: &MicroscopyMetadata,
    source: &dyn FrameSource,
    catalog: &mut ResultCatalog,
    output_dir: &Path,
    fov_start: i64,
    fov_end: i64,
    batch_size: usize,
    n_workers: usize,
    params: &PipelineParams,
    cancel: &CancelToken,
    progress: &dyn ProgressReporter,
) -> Result<bool> {
    std::fs::create_dir_all(output_dir)?;
    let (start, end) = resolve_fov_range(fov_start, fov_end, metadata.n_fovs)?;
    let total_fovs = end - start + 1;
    let fov_indices: Vec<usize> = (start..=end).collect();

    let pool = ThreadPoolBuilder::new()
        .num_threads(n_workers.max(1))
        .build()
        .map_err(|e| PipelineError::IoFailure(std::io::Error::other(e.to_string())))?;

    let batches = compute_batches(&fov_indices, batch_size);
    let mut completed_fovs = 0usize;

    for batch_fovs in &batches {
        cancel.check()?;

        CopyStage.process_all_fovs(
            source,
            catalog,
            output_dir,
            batch_fovs[0],
            batch_fovs[batch_fovs.len() - 1],
            params,
            cancel,
            progress,
        )?;

        cancel.check()?;

        let worker_ranges = split_worker_ranges(batch_fovs, n_workers);
        let snapshot = catalog.clone();
        let results: Vec<(usize, ResultCatalog)> = pool.install(|| {
            use rayon::prelude::*;
            worker_ranges
                .par_iter()
                .filter(|r| !r.is_empty())
                .map(|range| run_single_worker(range, metadata, &snapshot, output_dir, params, cancel, progress))
                .collect()
        });

        for (successful, worker_catalog) in &results {
            catalog.merge(worker_catalog);
            completed_fovs += successful;
        }

        persist_catalog(catalog, output_dir)?;
        cancel.check()?;
    }

    Ok(completed_fovs == total_fovs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ChannelSelection;
    use crate::tracking::TrackerParams;
    use ndarray::Array2;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[test]
    fn batches_split_contiguous_ranges_with_a_short_last_batch() {
        let fovs: Vec<usize> = (0..10).collect();
        let batches = compute_batches(&fovs, 3);
        assert_eq!(
            batches,
            vec![vec![0, 1, 2], vec![3, 4, 5], vec![6, 7, 8], vec![9]]
        );
    }

    #[test]
    fn worker_ranges_distribute_remainder_to_earliest_workers() {
        let fovs: Vec<usize> = (0..10).collect();
        let ranges = split_worker_ranges(&fovs, 3);
        assert_eq!(ranges, vec![vec![0, 1, 2, 3], vec![4, 5, 6], vec![7, 8, 9]]);
    }

    #[test]
    fn fov_range_resolution_defaults_and_validates() {
        assert_eq!(resolve_fov_range(-1, -1, 5).unwrap(), (0, 4));
        assert_eq!(resolve_fov_range(1, 3, 5).unwrap(), (1, 3));
        assert!(resolve_fov_range(3, 1, 5).is_err());
        assert!(resolve_fov_range(0, 5, 5).is_err());
    }

    struct FakeSource {
        metadata: MicroscopyMetadata,
        frames: Mutex<BTreeMap<(usize, usize, usize), Array2<u16>>>,
    }

    impl FrameSource for FakeSource {
        fn metadata(&self) -> &MicroscopyMetadata {
            &self.metadata
        }
        fn read_frame(&self, fov: usize, channel: usize, frame: usize) -> Result<Array2<u16>> {
            Ok(self.frames.lock().unwrap()[&(fov, channel, frame)].clone())
        }
    }

    fn make_source(n_fovs: usize, n_frames: usize, h: usize, w: usize) -> FakeSource {
        let mut frames = BTreeMap::new();
        for fov in 0..n_fovs {
            for t in 0..n_frames {
                let mut pc = Array2::<u16>::from_elem((h, w), 10);
                for y in 1..h / 2 {
                    for x in 1..w / 2 {
                        pc[[y, x]] = 200;
                    }
                }
                frames.insert((fov, 0, t), pc);
                frames.insert((fov, 1, t), Array2::<u16>::from_elem((h, w), 50));
            }
        }
        FakeSource {
            metadata: MicroscopyMetadata {
                n_fovs,
                n_channels: 2,
                n_frames,
                height: h,
                width: w,
                channel_names: vec!["pc".into(), "fl".into()],
                timepoints: (0..n_frames).map(|t| t as f64).collect(),
                base_name: "test".into(),
            },
            frames: Mutex::new(frames),
        }
    }

    #[test]
    fn end_to_end_run_over_multiple_fovs_and_batches_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let source = make_source(4, 3, 20, 20);
        let mut catalog = ResultCatalog::new();
        let params = PipelineParams {
            channels: ChannelSelection {
                pc: Some(0),
                fl: vec![1],
                ..Default::default()
            },
            tracker: TrackerParams {
                min_size: 1,
                max_size: 0,
                ignore_size: 0,
            },
            ..Default::default()
        };
        let cancel = CancelToken::new();
        let progress = crate::progress::NullReporter;

        let ok = run_complete_workflow(
            source.metadata(),
            &source,
            &mut catalog,
            dir.path(),
            -1,
            -1,
            2,
            2,
            &params,
            &cancel,
            &progress,
        )
        .unwrap();
        assert!(ok);
        for fov in 0..4 {
            assert!(catalog.results[&fov].traces.is_some());
        }
        assert!(dir.path().join("processing_results.yaml").exists());
    }

    #[test]
    fn cancellation_before_start_yields_unsuccessful_run() {
        let dir = tempfile::tempdir().unwrap();
        let source = make_source(2, 2, 10, 10);
        let mut catalog = ResultCatalog::new();
        let params = PipelineParams {
            channels: ChannelSelection {
                pc: Some(0),
                fl: vec![1],
                ..Default::default()
            },
            ..Default::default()
        };
        let cancel = CancelToken::new();
        cancel.cancel();
        let progress = crate::progress::NullReporter;

        let err = run_complete_workflow(
            source.metadata(),
            &source,
            &mut catalog,
            dir.path(),
            -1,
            -1,
            2,
            2,
            &params,
            &cancel,
            &progress,
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
    }

    #[test]
    fn out_of_range_fov_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let source = make_source(2, 2, 10, 10);
        let mut catalog = ResultCatalog::new();
        let params = PipelineParams::default();
        let cancel = CancelToken::new();
        let progress = crate::progress::NullReporter;

        let err = run_complete_workflow(
            source.metadata(),
            &source,
            &mut catalog,
            dir.path(),
            0,
            5,
            2,
            2,
            &params,
            &cancel,
            &progress,
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidRange { .. }));
    }
}
