//! Feature extraction: labeled + intensity stacks -> a tidy per-cell
//! time-series table (§4.E, §6).

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use ndarray::Array2;

use crate::error::{PipelineError, Result};

/// One built-in or registered feature: a pure function from (labels frame,
/// intensity frame) to a per-cell value map. Additional features can be
/// registered without touching the dense-grid reshaping logic (§4.E).
pub type FeatureFn = fn(&Array2<u16>, &Array2<f32>) -> HashMap<u16, f64>;

fn feature_intensity_mean(labels: &Array2<u16>, fluor: &Array2<f32>) -> HashMap<u16, f64> {
    let mut sum: HashMap<u16, f64> = HashMap::new();
    let mut count: HashMap<u16, usize> = HashMap::new();
    for ((y, x), &l) in labels.indexed_iter() {
        if l != 0 {
            *sum.entry(l).or_insert(0.0) += fluor[[y, x]] as f64;
            *count.entry(l).or_insert(0) += 1;
        }
    }
    sum.into_iter()
        .map(|(l, s)| (l, s / count[&l] as f64))
        .collect()
}

/// The registry of additional (non-base) per-cell features, keyed by name in
/// registration order (§4.E's "extendable registry").
pub fn feature_registry() -> Vec<(&'static str, FeatureFn)> {
    vec![("intensity_mean", feature_intensity_mean)]
}

/// One row of the tidy trace table (§3 `TraceRow`, §6 CSV schema).
#[derive(Debug, Clone)]
pub struct TraceRow {
    pub fov: usize,
    pub cell: u16,
    pub frame: usize,
    pub time: f64,
    pub exist: bool,
    pub good: bool,
    pub position_x: f64,
    pub position_y: f64,
    /// Additional feature columns in registration order (`area`,
    /// `intensity_total`, then the registry's entries).
    pub features: Vec<(String, f64)>,
}

#[derive(Debug)]
pub struct TraceTable {
    pub feature_names: Vec<String>,
    pub rows: Vec<TraceRow>,
}

impl TraceTable {
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut wtr = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(path)
            .map_err(|e| PipelineError::IoFailure(std::io::Error::other(e.to_string())))?;

        let mut header = vec![
            "fov".to_string(),
            "time".to_string(),
            "cell".to_string(),
            "good".to_string(),
            "exist".to_string(),
            "position_x".to_string(),
            "position_y".to_string(),
        ];
        header.extend(self.feature_names.iter().cloned());
        wtr.write_record(&header)
            .map_err(|e| PipelineError::IoFailure(std::io::Error::other(e.to_string())))?;

        let fmt = |v: f64| format!("{v:.6}");
        for row in &self.rows {
            let mut record = vec![
                row.fov.to_string(),
                fmt(row.time),
                row.cell.to_string(),
                row.good.to_string(),
                row.exist.to_string(),
                fmt(row.position_x),
                fmt(row.position_y),
            ];
            for (_, v) in &row.features {
                record.push(fmt(*v));
            }
            wtr.write_record(&record)
                .map_err(|e| PipelineError::IoFailure(std::io::Error::other(e.to_string())))?;
        }
        wtr.flush()?;
        Ok(())
    }
}

/// Extract per-(cell, frame) features from a corrected-fluorescence stack and
/// a tracked-labels stack, then reshape to the dense (cell, frame) grid
/// (§4.E). `cell_good` is the tracker's per-cell good flag (§4.D), indexed by
/// `cell_id - 1`; when absent every cell defaults to `good = true`.
pub fn extract(
    fov: usize,
    corrected: &[Array2<f32>],
    labels: &[Array2<u16>],
    times: &[f64],
    cell_good: Option<&[bool]>,
) -> Result<TraceTable> {
    if corrected.len() != labels.len() || labels.len() != times.len() {
        return Err(PipelineError::ShapeMismatch(format!(
            "extract: {} fluor frames, {} label frames, {} timepoints",
            corrected.len(),
            labels.len(),
            times.len()
        )));
    }
    let registry = feature_registry();
    let mut feature_names: Vec<String> = vec!["area".to_string(), "intensity_total".to_string()];
    feature_names.extend(registry.iter().map(|(name, _)| name.to_string()));

    // (position_x, position_y, area, intensity_total, registry feature values)
    type FrameEntry = (f64, f64, f64, f64, Vec<f64>);

    let n_frames = labels.len();
    let mut per_frame: Vec<HashMap<u16, FrameEntry>> = Vec::with_capacity(n_frames);
    let mut all_cells: BTreeSet<u16> = BTreeSet::new();

    for (fluor_frame, label_frame) in corrected.iter().zip(labels.iter()) {
        if fluor_frame.dim() != label_frame.dim() {
            return Err(PipelineError::ShapeMismatch(format!(
                "fluor frame shape {:?} != labels frame shape {:?}",
                fluor_frame.dim(),
                label_frame.dim()
            )));
        }
        let mut sum_x: HashMap<u16, f64> = HashMap::new();
        let mut sum_y: HashMap<u16, f64> = HashMap::new();
        let mut count: HashMap<u16, f64> = HashMap::new();
        let mut intensity: HashMap<u16, f64> = HashMap::new();
        for ((y, x), &l) in label_frame.indexed_iter() {
            if l == 0 {
                continue;
            }
            *sum_x.entry(l).or_insert(0.0) += x as f64;
            *sum_y.entry(l).or_insert(0.0) += y as f64;
            *count.entry(l).or_insert(0.0) += 1.0;
            *intensity.entry(l).or_insert(0.0) += fluor_frame[[y, x]] as f64;
            all_cells.insert(l);
        }
        let registered: Vec<HashMap<u16, f64>> = registry
            .iter()
            .map(|(_, f)| f(label_frame, fluor_frame))
            .collect();

        let mut frame_entries: HashMap<u16, FrameEntry> = HashMap::new();
        for (&l, &n) in &count {
            let px = sum_x[&l] / n;
            let py = sum_y[&l] / n;
            let area = n;
            let total = intensity[&l];
            let extra: Vec<f64> = registered.iter().map(|m| *m.get(&l).unwrap_or(&0.0)).collect();
            frame_entries.insert(l, (px, py, area, total, extra));
        }
        per_frame.push(frame_entries);
    }

    let mut rows: Vec<TraceRow> = Vec::new();
    for &cell in &all_cells {
        let good = cell_good
            .and_then(|g| g.get(cell as usize - 1).copied())
            .unwrap_or(true);
        for (t, &time) in times.iter().enumerate() {
            match per_frame[t].get(&cell) {
                Some(&(px, py, area, total, ref extra)) => {
                    let mut features = vec![("area".to_string(), area), ("intensity_total".to_string(), total)];
                    for (i, (name, _)) in registry.iter().enumerate() {
                        features.push((name.to_string(), extra[i]));
                    }
                    rows.push(TraceRow {
                        fov,
                        cell,
                        frame: t,
                        time,
                        exist: true,
                        good,
                        position_x: px,
                        position_y: py,
                        features,
                    });
                }
                None => {
                    let mut features = vec![
                        ("area".to_string(), f64::NAN),
                        ("intensity_total".to_string(), f64::NAN),
                    ];
                    for (name, _) in &registry {
                        features.push((name.to_string(), f64::NAN));
                    }
                    rows.push(TraceRow {
                        fov,
                        cell,
                        frame: t,
                        time,
                        exist: false,
                        good,
                        position_x: f64::NAN,
                        position_y: f64::NAN,
                        features,
                    });
                }
            }
        }
    }

    // Rows sorted by (cell ascending, time ascending) — already the
    // construction order since `all_cells` is a BTreeSet and frames are
    // iterated in order within each cell.
    Ok(TraceTable { feature_names, rows })
}

/// Dense grid bookkeeping helper used by property tests: for a given cell and
/// frame, whether the labels stack actually contains that cell's label.
pub fn cell_exists_in_frame(labels: &Array2<u16>, cell: u16) -> bool {
    labels.iter().any(|&v| v == cell)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_cell_single_frame_has_expected_area_and_centroid() {
        let mut labels = Array2::<u16>::zeros((4, 4));
        for y in 1..3 {
            for x in 1..3 {
                labels[[y, x]] = 1;
            }
        }
        let fluor = Array2::<f32>::from_elem((4, 4), 2.0);
        let table = extract(0, &[fluor], &[labels], &[0.0], None).unwrap();
        assert_eq!(table.rows.len(), 1);
        let row = &table.rows[0];
        assert!(row.exist);
        assert!(row.good);
        assert_eq!(row.position_x, 1.5);
        assert_eq!(row.position_y, 1.5);
        let area = row.features.iter().find(|(n, _)| n == "area").unwrap().1;
        let total = row.features.iter().find(|(n, _)| n == "intensity_total").unwrap().1;
        assert_eq!(area, 4.0);
        assert_eq!(total, 8.0);
    }

    #[test]
    fn missing_frames_are_padded_with_nan_and_exist_false() {
        let mut l0 = Array2::<u16>::zeros((3, 3));
        l0[[1, 1]] = 1;
        let l1 = Array2::<u16>::zeros((3, 3)); // cell 1 vanished in frame 1
        let fluor = Array2::<f32>::from_elem((3, 3), 1.0);
        let table = extract(
            0,
            &[fluor.clone(), fluor],
            &[l0, l1],
            &[0.0, 1.0],
            None,
        )
        .unwrap();
        assert_eq!(table.rows.len(), 2);
        let frame1 = table.rows.iter().find(|r| r.frame == 1).unwrap();
        assert!(!frame1.exist);
        assert!(frame1.position_x.is_nan());
        let area_nan = frame1.features.iter().find(|(n, _)| n == "area").unwrap().1;
        assert!(area_nan.is_nan());
    }

    #[test]
    fn good_flag_comes_from_tracker_cell_good_slice() {
        let mut labels = Array2::<u16>::zeros((3, 3));
        labels[[1, 1]] = 2;
        let fluor = Array2::<f32>::from_elem((3, 3), 1.0);
        let cell_good = [true, false];
        let table = extract(0, &[fluor], &[labels], &[0.0], Some(&cell_good)).unwrap();
        assert!(!table.rows[0].good);
    }

    #[test]
    fn rows_are_sorted_by_cell_then_time() {
        let mut l0 = Array2::<u16>::zeros((5, 5));
        l0[[0, 0]] = 2;
        l0[[4, 4]] = 1;
        let fluor = Array2::<f32>::from_elem((5, 5), 1.0);
        let table = extract(0, std::slice::from_ref(&fluor), &[l0], &[0.0], None).unwrap();
        let cells: Vec<u16> = table.rows.iter().map(|r| r.cell).collect();
        assert_eq!(cells, vec![1, 2]);
    }

    #[test]
    fn mismatched_stack_lengths_are_rejected() {
        let labels = vec![Array2::<u16>::zeros((2, 2))];
        let fluor = vec![Array2::<f32>::zeros((2, 2)), Array2::<f32>::zeros((2, 2))];
        let err = extract(0, &fluor, &labels, &[0.0], None).unwrap_err();
        assert!(matches!(err, PipelineError::ShapeMismatch(_)));
    }

    #[test]
    fn csv_round_trip_writes_header_and_nan_literal() {
        let mut labels = Array2::<u16>::zeros((3, 3));
        labels[[1, 1]] = 1;
        let empty = Array2::<u16>::zeros((3, 3));
        let fluor = Array2::<f32>::from_elem((3, 3), 1.0);
        let table = extract(0, &[fluor.clone(), fluor], &[labels, empty], &[0.0, 1.0], None).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("traces.csv");
        table.write_csv(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("fov,time,cell,good,exist,position_x,position_y,area,intensity_total,intensity_mean"));
        assert!(contents.contains("NaN"));
    }
}
