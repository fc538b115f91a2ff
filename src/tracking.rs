//! Cell tracking: per-frame labels -> a stable-cell-id labels stack (§4.D).
//!
//! Grounded line-for-line on `original_source/.../tracking/old.py`
//! (`Tracker.track`, `_get_trace_checks`, `check_coordinate_overlap`,
//! `intercalation_iterator`): bounding-box overlap prefilter, exact
//! pixel-coordinate overlap with an intercalated short-circuit search,
//! size/edge-based region classification, and the disambiguation/sibling
//! policy that marks ambiguous ancestry untrackable.

use std::collections::HashMap;

use ndarray::Array2;

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::labeling::label_frame;
use crate::progress::{ProgressEvent, ProgressReporter};

pub const DEFAULT_MIN_SIZE: usize = 1000;
pub const DEFAULT_MAX_SIZE: usize = 10000;
pub const DEFAULT_IGNORE_SIZE: usize = 300;

#[derive(Debug, Clone, Copy)]
pub struct TrackerParams {
    pub min_size: usize,
    pub max_size: usize,
    pub ignore_size: usize,
}

impl Default for TrackerParams {
    fn default() -> Self {
        Self {
            min_size: DEFAULT_MIN_SIZE,
            max_size: DEFAULT_MAX_SIZE,
            ignore_size: DEFAULT_IGNORE_SIZE,
        }
    }
}

/// One connected region within a single frame (§4.D).
#[derive(Debug, Clone)]
struct Region {
    label: u16,
    area: usize,
    bbox: (usize, usize, usize, usize), // y0, x0, y1 (excl), x1 (excl)
    coords: Vec<(usize, usize)>,
}

/// Derived classification flags for one region (§4.D).
#[derive(Debug, Clone)]
struct RegionCheck {
    label: u16,
    area: usize,
    good: bool,
    edge: bool,
    ignore: bool,
}

fn regions_from_labels(labels: &Array2<u16>) -> Vec<Region> {
    let mut by_label: HashMap<u16, Vec<(usize, usize)>> = HashMap::new();
    for ((y, x), &l) in labels.indexed_iter() {
        if l != 0 {
            by_label.entry(l).or_default().push((y, x));
        }
    }
    let mut regions: Vec<Region> = by_label
        .into_iter()
        .map(|(label, coords)| {
            let y0 = coords.iter().map(|&(y, _)| y).min().unwrap();
            let y1 = coords.iter().map(|&(y, _)| y).max().unwrap() + 1;
            let x0 = coords.iter().map(|&(_, x)| x).min().unwrap();
            let x1 = coords.iter().map(|&(_, x)| x).max().unwrap() + 1;
            Region {
                label,
                area: coords.len(),
                bbox: (y0, x0, y1, x1),
                coords,
            }
        })
        .collect();
    regions.sort_by_key(|r| r.label);
    regions
}

fn classify(region: &Region, height: usize, width: usize, params: &TrackerParams) -> RegionCheck {
    let edge = region
        .coords
        .iter()
        .any(|&(y, x)| y == 0 || y == height - 1 || x == 0 || x == width - 1);
    let large = params.max_size > 0 && region.area > params.max_size;
    let small = region.area < params.min_size;
    let ignore = small && region.area <= params.ignore_size;
    let good = !edge && !small && !large;
    RegionCheck {
        label: region.label,
        area: region.area,
        good,
        edge,
        ignore,
    }
}

fn bbox_overlap(a: (usize, usize, usize, usize), b: (usize, usize, usize, usize)) -> bool {
    let (ay0, ax0, ay1, ax1) = a;
    let (by0, bx0, by1, bx1) = b;
    ay0 < by1 && ay1 > by0 && ax0 < bx1 && ax1 > bx0
}

/// Generator order for `intercalation_iterator`: interleave from both ends
/// toward the middle.
fn intercalation_order(n: usize) -> Vec<usize> {
    if n == 0 {
        return Vec::new();
    }
    let n_i = n as isize;
    let mut out = Vec::with_capacity(n);
    let (mut i1, step1, stop1, mut i2, step2) = if n % 2 == 1 {
        out.push(0usize);
        (n_i - 1, -2isize, 0isize, 1isize, 2isize)
    } else {
        (0isize, 2isize, n_i, n_i - 1, -2isize)
    };
    while i1 != stop1 {
        out.push(i1 as usize);
        out.push(i2 as usize);
        i1 += step1;
        i2 += step2;
    }
    out
}

/// Exact pixel-coordinate overlap test, short-circuiting on the first shared
/// pixel found while walking shared `y` rows in intercalated order.
fn check_coordinate_overlap(coords1: &[(usize, usize)], coords2: &[(usize, usize)]) -> bool {
    use std::collections::HashSet;
    let ys1: HashSet<usize> = coords1.iter().map(|&(y, _)| y).collect();
    let ys2: HashSet<usize> = coords2.iter().map(|&(y, _)| y).collect();
    let mut shared_y: Vec<usize> = ys1.intersection(&ys2).cloned().collect();
    shared_y.sort_unstable();
    for idx in intercalation_order(shared_y.len()) {
        let y = shared_y[idx];
        let xs1: HashSet<usize> = coords1.iter().filter(|&&(yy, _)| yy == y).map(|&(_, x)| x).collect();
        let xs2: HashSet<usize> = coords2.iter().filter(|&&(yy, _)| yy == y).map(|&(_, x)| x).collect();
        if xs1.intersection(&xs2).next().is_some() {
            return true;
        }
    }
    false
}

/// Outcome of tracking a mask/labels stack: the re-labeled stack in which
/// equal labels across frames denote the same cell, plus per-trace bookkeeping.
pub struct TrackOutput {
    pub labels: Vec<Array2<u16>>,
    pub n_traces: usize,
    /// Per retained trace (indexed 0..n_traces), conjunction of `good` across
    /// its frames.
    pub trace_good: Vec<bool>,
}

/// Track a per-frame-labeled stack (already connected-component labeled,
/// independently per frame). This is the core of §4.D.
pub fn track_labeled(
    labels_per_frame: &[Array2<u16>],
    params: &TrackerParams,
    fov: usize,
    cancel: &CancelToken,
    progress: &dyn ProgressReporter,
) -> Result<TrackOutput> {
    let n_frames = labels_per_frame.len();
    if n_frames == 0 {
        return Ok(TrackOutput {
            labels: Vec::new(),
            n_traces: 0,
            trace_good: Vec::new(),
        });
    }
    let (height, width) = labels_per_frame[0].dim();
    let regions_per_frame: Vec<Vec<Region>> = labels_per_frame.iter().map(regions_from_labels).collect();

    let mut traces: Vec<Vec<(usize, u16)>> = Vec::new();
    let mut trace_good: Vec<Vec<bool>> = Vec::new();
    let mut traces_selection: Vec<Option<bool>> = Vec::new();

    let mut prev_checks: HashMap<u16, RegionCheck> = HashMap::new();
    let mut prev_idx: HashMap<u16, usize> = HashMap::new();

    progress.report(ProgressEvent {
        stage: "Track".into(),
        fov,
        t: 0,
        total: n_frames,
        message: "Tracking cells".into(),
    });

    for region in &regions_per_frame[0] {
        let ck = classify(region, height, width, params);
        if ck.ignore {
            continue;
        }
        let is_select = if ck.edge {
            None
        } else if ck.good {
            Some(true)
        } else {
            Some(false)
        };
        let idx = traces.len();
        prev_idx.insert(region.label, idx);
        traces.push(vec![(0, region.label)]);
        trace_good.push(vec![ck.good]);
        traces_selection.push(is_select);
        prev_checks.insert(region.label, ck);
    }

    for t in 1..n_frames {
        cancel.check()?;
        if t % 30 == 0 || t + 1 == n_frames {
            progress.report(ProgressEvent {
                stage: "Track".into(),
                fov,
                t,
                total: n_frames,
                message: "Tracking cells".into(),
            });
        }

        let regions_prev_active: Vec<&Region> = regions_per_frame[t - 1]
            .iter()
            .filter(|r| prev_idx.contains_key(&r.label))
            .collect();

        let mut new_checks: HashMap<u16, RegionCheck> = HashMap::new();
        let mut new_idx: HashMap<u16, usize> = HashMap::new();

        for cur in &regions_per_frame[t] {
            let candidates: Vec<&&Region> = regions_prev_active
                .iter()
                .filter(|p| bbox_overlap(cur.bbox, p.bbox))
                .collect();
            if candidates.is_empty() {
                continue;
            }

            let cki = classify(cur, height, width, params);
            if cki.ignore {
                continue;
            }
            let mut is_select = if cki.edge {
                None
            } else if cki.good {
                Some(true)
            } else {
                Some(false)
            };
            new_checks.insert(cur.label, cki.clone());

            let mut parents: Vec<RegionCheck> = Vec::new();
            for p in &candidates {
                if !check_coordinate_overlap(&cur.coords, &p.coords) {
                    continue;
                }
                let ckj = match prev_checks.get(&p.label) {
                    Some(c) => c.clone(),
                    None => continue,
                };
                if ckj.edge {
                    is_select = None;
                    parents.push(ckj);
                    break;
                }
                parents.push(ckj);
            }
            parents.sort_by_key(|p| p.area);

            let mut assigned: Option<usize> = None;
            if is_select.is_some() {
                if parents.is_empty() {
                    continue;
                } else if parents[0].ignore || (parents.len() > 1 && !parents[1].ignore) {
                    is_select = None;
                } else {
                    assigned = Some(0);
                }
            }

            if is_select.is_none() {
                for p in &parents {
                    if let Some(&invalid_idx) = prev_idx.get(&p.label) {
                        traces_selection[invalid_idx] = None;
                    }
                }
                continue;
            }

            let parent = &parents[assigned.unwrap()];
            let trace_idx = match prev_idx.get(&parent.label) {
                Some(&i) => i,
                None => continue,
            };
            if traces_selection[trace_idx].is_none() {
                continue;
            }
            let has_nonignored_sibling = new_idx
                .iter()
                .any(|(l, &x)| x == trace_idx && !new_checks[l].ignore);
            if has_nonignored_sibling {
                traces_selection[trace_idx] = None;
            } else if is_select == Some(false) && traces_selection[trace_idx] == Some(true) {
                traces_selection[trace_idx] = Some(false);
            }
            new_idx.insert(cur.label, trace_idx);
            traces[trace_idx].push((t, cur.label));
            trace_good[trace_idx].push(cki.good);
        }

        prev_idx = new_idx;
        prev_checks = new_checks;
    }

    let mut retained_labels: Vec<Array2<u16>> = (0..n_frames)
        .map(|_| Array2::<u16>::zeros((height, width)))
        .collect();
    let mut out_good = Vec::new();
    let mut n_traces = 0usize;

    let region_lookup: Vec<HashMap<u16, &Region>> = regions_per_frame
        .iter()
        .map(|regions| regions.iter().map(|r| (r.label, r)).collect())
        .collect();

    for (i, trace) in traces.iter().enumerate() {
        if trace.len() != n_frames || traces_selection[i].is_none() {
            continue;
        }
        n_traces += 1;
        let out_label = n_traces as u16;
        for &(t, label) in trace {
            if let Some(region) = region_lookup[t].get(&label) {
                for &(y, x) in &region.coords {
                    retained_labels[t][[y, x]] = out_label;
                }
            }
        }
        out_good.push(trace_good[i].iter().all(|&g| g));
    }

    if n_traces == 0 {
        progress.report(ProgressEvent {
            stage: "Track".into(),
            fov,
            t: n_frames.saturating_sub(1),
            total: n_frames,
            message: "No traces survived tracking".into(),
        });
    }

    Ok(TrackOutput {
        labels: retained_labels,
        n_traces,
        trace_good: out_good,
    })
}

/// Track a boolean mask stack: label each frame independently, then track.
pub fn track_masks(
    masks: &[Array2<bool>],
    params: &TrackerParams,
    fov: usize,
    cancel: &CancelToken,
    progress: &dyn ProgressReporter,
) -> Result<TrackOutput> {
    let labeled: Vec<Array2<u16>> = masks.iter().map(label_frame).collect();
    track_labeled(&labeled, params, fov, cancel, progress)
}
