//! End-to-end smoke test: builds a tiny pre-materialized raw-stack input
//! directory, runs the `mutrace run` binary against it, and checks that the
//! expected on-disk artifacts and catalog show up.

use std::process::Command;

use mutrace::metadata::MicroscopyMetadata;
use mutrace::store::{self, FrameStore};
use ndarray::Array2;

fn write_channel_stack(
    input_dir: &std::path::Path,
    fov: usize,
    channel: usize,
    n_frames: usize,
    height: usize,
    width: usize,
    value_at: impl Fn(usize, usize, usize) -> u16,
) {
    let fov_dir = input_dir.join(format!("fov_{fov:03}"));
    std::fs::create_dir_all(&fov_dir).unwrap();
    let path = fov_dir.join(format!("ch_{channel}.zarr"));
    let store = store::open_store(&path).unwrap();
    let fs = FrameStore::<u16>::create(&store, "/", n_frames, height, width).unwrap();
    for t in 0..n_frames {
        let frame = Array2::from_shape_fn((height, width), |(y, x)| value_at(t, y, x));
        fs.write_frame(t, &frame).unwrap();
    }
}

#[test]
fn run_subcommand_produces_catalog_and_traces_for_every_fov() {
    let dir = tempfile::tempdir().unwrap();
    let input_dir = dir.path().join("input");
    let output_dir = dir.path().join("output");
    std::fs::create_dir_all(&input_dir).unwrap();

    let metadata = MicroscopyMetadata {
        n_fovs: 2,
        n_channels: 2,
        n_frames: 3,
        height: 24,
        width: 24,
        channel_names: vec!["pc".into(), "fl".into()],
        timepoints: vec![0.0, 1.0, 2.0],
        base_name: "smoke".into(),
    };
    std::fs::write(
        input_dir.join("metadata.json"),
        serde_json::to_string(&metadata).unwrap(),
    )
    .unwrap();

    for fov in 0..metadata.n_fovs {
        write_channel_stack(&input_dir, fov, 0, metadata.n_frames, metadata.height, metadata.width, |_, y, x| {
            if (6..14).contains(&y) && (6..14).contains(&x) {
                200
            } else {
                10
            }
        });
        write_channel_stack(&input_dir, fov, 1, metadata.n_frames, metadata.height, metadata.width, |_, _, _| 50);
    }

    let output = Command::new(env!("CARGO_BIN_EXE_mutrace"))
        .args([
            "run",
            "--input",
            input_dir.to_str().unwrap(),
            "--output",
            output_dir.to_str().unwrap(),
            "--pc-channel",
            "0",
            "--fl-channel",
            "1",
            "--batch-size",
            "2",
            "--n-workers",
            "2",
        ])
        .output()
        .expect("failed to run mutrace binary");

    assert!(
        output.status.success(),
        "stdout: {}\nstderr: {}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );

    let catalog_path = output_dir.join("processing_results.yaml");
    assert!(catalog_path.exists());
    let catalog = mutrace::catalog::ResultCatalog::from_yaml(&std::fs::read_to_string(&catalog_path).unwrap()).unwrap();
    for fov in 0..metadata.n_fovs {
        let entry = catalog.results.get(&fov).expect("fov entry present");
        assert!(entry.traces.is_some());
        assert!(entry.traces.as_ref().unwrap().exists());
    }
}
