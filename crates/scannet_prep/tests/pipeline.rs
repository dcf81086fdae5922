use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use scannet_prep::pipeline::SplitSummary;
use scannet_prep::{
    BatchPipeline, LabelRemap, LabelTable, PrepConfig, ScanOptions, ScanProcessor, ScanRecord,
    Split, SplitOutcome, IGNORE_LABEL,
};
use tempfile::TempDir;

const LABELS: &str = "id\traw_category\tcategory\tcount\tnyu40id\tnyu40class\n\
1\twall\twall\t8277\t1\twall\n\
2\tchair\tchair\t4646\t5\tchair\n\
3\tfloor\tfloor\t4312\t2\tfloor\n";

const IDENTITY: &str = "axisAlignment = 1 0 0 0 0 1 0 0 0 0 1 0 0 0 0 1";

/// Write `<raw>/scans/<id>/...` with `n` vertices on a line along x.
/// The first half is a wall (object 0), the rest a chair (object 1).
fn write_scan(raw: &Path, id: &str, n: usize) {
    let dir = raw.join("scans").join(id);
    fs::create_dir_all(&dir).unwrap();

    let mut ply = format!(
        "ply\nformat ascii 1.0\nelement vertex {}\nproperty float x\nproperty float y\n\
         property float z\nproperty uchar red\nproperty uchar green\nproperty uchar blue\nend_header\n",
        n
    );
    for i in 0..n {
        ply.push_str(&format!("{} 0 0 255 255 255\n", i));
    }
    fs::write(dir.join(format!("{}_vh_clean_2.ply", id)), ply).unwrap();

    let seg: Vec<String> = (0..n).map(|i| if i < n / 2 { "0" } else { "1" }.to_string()).collect();
    fs::write(
        dir.join(format!("{}_vh_clean_2.0.010000.segs.json", id)),
        format!(r#"{{"sceneId": "{}", "segIndices": [{}]}}"#, id, seg.join(", ")),
    )
    .unwrap();

    fs::write(
        dir.join(format!("{}.aggregation.json", id)),
        r#"{"segGroups": [
            {"objectId": 0, "label": "wall", "segments": [0]},
            {"objectId": 1, "label": "chair", "segments": [1]}
        ]}"#,
    )
    .unwrap();

    fs::write(dir.join(format!("{}.txt", id)), format!("sceneType = Office\n{}\n", IDENTITY)).unwrap();
}

fn write_metadata(raw: &Path, split: Split, ids: &[&str]) {
    let meta = raw.join("metadata");
    fs::create_dir_all(&meta).unwrap();
    fs::write(meta.join("scannetv2-labels.combined.tsv"), LABELS).unwrap();
    fs::write(meta.join(split.list_file()), ids.join("\n")).unwrap();
}

fn ids(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn read_summary(path: &Path) -> SplitSummary {
    serde_json::from_slice(&fs::read(path).unwrap()).unwrap()
}

#[test]
fn four_vertex_chair_end_to_end() {
    let tmp = TempDir::new().unwrap();
    let raw = tmp.path().join("raw");
    let dir = raw.join("scans/scene0000_00");
    fs::create_dir_all(&dir).unwrap();

    fs::write(
        dir.join("scene0000_00_vh_clean_2.ply"),
        "ply\nformat ascii 1.0\nelement vertex 4\nproperty float x\nproperty float y\n\
         property float z\nproperty uchar red\nproperty uchar green\nproperty uchar blue\n\
         end_header\n-1 -1 0 0 0 0\n3 -1 0 0 0 0\n-1 1 2 0 0 0\n3 1 2 0 0 0\n",
    )
    .unwrap();
    fs::write(
        dir.join("scene0000_00_vh_clean_2.0.010000.segs.json"),
        r#"{"segIndices": [42, 42, 42, 42]}"#,
    )
    .unwrap();
    fs::write(
        dir.join("scene0000_00.aggregation.json"),
        r#"{"segGroups": [{"objectId": 0, "label": "chair", "segments": [42]}]}"#,
    )
    .unwrap();
    fs::write(dir.join("scene0000_00.txt"), IDENTITY).unwrap();

    let config = PrepConfig::new(&raw, tmp.path().join("out"));
    let options = ScanOptions {
        valid_class_ids: vec![3, 4, 5],
        ..config.scan_options()
    };
    let table = LabelTable::ByName(HashMap::from([("chair".to_string(), 5)]));
    let processor = ScanProcessor::new(table, LabelRemap::new(&options.valid_class_ids, 40), options);
    let pipeline = BatchPipeline::new(config, processor).unwrap();

    let out = tmp.path().join("out/train.scnp");
    let outcome = pipeline.run(Split::Train, &ids(&["scene0000_00"]), &out).unwrap();
    assert!(matches!(outcome, SplitOutcome::Written(ref s) if s.included == 1));

    let pack = scanpack::read_file(&out).unwrap();
    let record = pack.record(0).unwrap();

    assert_eq!(record.scan_id, "scene0000_00");
    assert_eq!(record.semantic_labels, &[2, 2, 2, 2]);
    assert_eq!(record.instance_labels, Some(&[1u32, 1, 1, 1][..]));
    assert_eq!(
        record.instance_boxes,
        Some(&[[1.0f32, 0.0, 1.0, 4.0, 2.0, 2.0, 5.0]][..])
    );
}

#[test]
fn order_matches_request_with_and_without_workers() {
    let tmp = TempDir::new().unwrap();
    let raw = tmp.path().join("raw");
    let requested = ["scene0005_00", "scene0001_00", "scene0009_00", "scene0003_00", "scene0002_00"];
    for (i, id) in requested.iter().enumerate() {
        write_scan(&raw, id, 4 + 2 * i);
    }
    write_metadata(&raw, Split::Train, &requested);

    let run = |workers: Option<usize>, out_dir: &str| {
        let mut config = PrepConfig::new(&raw, tmp.path().join(out_dir));
        config.seed = Some(11);
        if let Some(n) = workers {
            config.use_multiprocessing = true;
            config.process_workers = n;
        }
        let pipeline = BatchPipeline::from_config(config).unwrap();
        match pipeline.run_split(Split::Train).unwrap() {
            SplitOutcome::Written(summary) => summary,
            other => panic!("unexpected {:?}", other),
        }
    };

    let sequential = run(None, "seq");
    let parallel = run(Some(3), "par");
    assert_eq!(sequential.included, 5);
    assert_eq!(parallel.included, 5);

    let seq_bytes = fs::read(tmp.path().join("seq/train.scnp")).unwrap();
    let par_bytes = fs::read(tmp.path().join("par/train.scnp")).unwrap();
    assert_eq!(seq_bytes, par_bytes);

    let pack = scanpack::parse_pack_bytes(&seq_bytes).unwrap();
    assert_eq!(pack.scan_ids, ids(&requested));
    for (i, _) in requested.iter().enumerate() {
        assert_eq!(pack.point_range(i).unwrap().len(), 4 + 2 * i);
    }

    // wall -> dense 0, chair -> dense 4 in the 20-class space.
    let first = pack.record(0).unwrap();
    assert_eq!(first.semantic_labels, &[0, 0, 4, 4]);
}

#[test]
fn failed_scans_are_skipped_and_reported() {
    let tmp = TempDir::new().unwrap();
    let raw = tmp.path().join("raw");
    write_scan(&raw, "scene0000_00", 6);
    write_scan(&raw, "scene0001_00", 6);
    write_scan(&raw, "scene0003_00", 4);

    // Unknown label and a missing scan directory.
    fs::write(
        raw.join("scans/scene0001_00/scene0001_00.aggregation.json"),
        r#"{"segGroups": [{"objectId": 0, "label": "spaceship", "segments": [0]}]}"#,
    )
    .unwrap();
    write_metadata(
        &raw,
        Split::Val,
        &["scene0000_00", "scene0001_00", "scene0002_00", "scene0003_00"],
    );

    let mut config = PrepConfig::new(&raw, tmp.path().join("out"));
    config.use_multiprocessing = true;
    config.process_workers = 2;
    let pipeline = BatchPipeline::from_config(config).unwrap();

    let SplitOutcome::Written(summary) = pipeline.run_split(Split::Val).unwrap() else {
        panic!("split was skipped");
    };

    assert_eq!(summary.requested, 4);
    assert_eq!(summary.included, 2);
    assert_eq!(summary.total_points, 10);
    let failed: Vec<&str> = summary.failed.iter().map(|f| f.scan_id.as_str()).collect();
    assert_eq!(failed, vec!["scene0001_00", "scene0002_00"]);
    assert!(summary.failed[0].error.contains("spaceship"));

    assert_eq!(read_summary(&tmp.path().join("out/val.summary.json")), summary);

    let pack = scanpack::read_file(tmp.path().join("out/val.scnp")).unwrap();
    assert_eq!(pack.requested_count, 4);
    assert_eq!(pack.scan_ids, ids(&["scene0000_00", "scene0003_00"]));
}

#[test]
fn malformed_scans_fail_alone() {
    let tmp = TempDir::new().unwrap();
    let raw = tmp.path().join("raw");
    let requested = [
        "scene0000_00",
        "scene0001_00",
        "scene0002_00",
        "scene0003_00",
        "scene0004_00",
    ];
    for id in &requested {
        write_scan(&raw, id, 4);
    }
    let scan = |id: &str, suffix: &str| raw.join("scans").join(id).join(format!("{}{}", id, suffix));

    fs::write(
        scan("scene0001_00", "_vh_clean_2.ply"),
        "ply\nformat ascii 1.0\nelement vertex 4611686018427387904\nproperty float x\n\
         property float y\nproperty float z\nproperty uchar red\nproperty uchar green\n\
         property uchar blue\nend_header\n0 0 0 1 1 1\n",
    )
    .unwrap();
    fs::write(
        scan("scene0002_00", ".aggregation.json"),
        r#"{"segGroups": [{"objectId": 4294967295, "label": "chair", "segments": [1]}]}"#,
    )
    .unwrap();
    fs::write(
        scan("scene0003_00", ".aggregation.json"),
        r#"{"segGroups": [{"objectId": 2000000000, "label": "chair", "segments": [1]}]}"#,
    )
    .unwrap();
    fs::write(
        scan("scene0004_00", ".aggregation.json"),
        r#"{"segGroups": [{"objectId": 0, "label": "wall", "segments": [0, 77]}]}"#,
    )
    .unwrap();
    write_metadata(&raw, Split::Train, &requested);

    let mut config = PrepConfig::new(&raw, tmp.path().join("out"));
    config.use_multiprocessing = true;
    config.process_workers = 2;
    let pipeline = BatchPipeline::from_config(config).unwrap();

    let SplitOutcome::Written(summary) = pipeline.run_split(Split::Train).unwrap() else {
        panic!("split was skipped");
    };

    assert_eq!(summary.requested, 5);
    assert_eq!(summary.included, 1);
    let failed: Vec<&str> = summary.failed.iter().map(|f| f.scan_id.as_str()).collect();
    assert_eq!(failed, requested[1..].to_vec());
    assert!(summary.failed[0].error.contains("4611686018427387904"));
    assert!(summary.failed[1].error.contains("4294967295"));
    assert!(summary.failed[2].error.contains("2000000000"));
    assert!(summary.failed[3].error.contains("77"));

    let pack = scanpack::read_file(tmp.path().join("out/train.scnp")).unwrap();
    assert_eq!(pack.scan_ids, ids(&["scene0000_00"]));
}

#[test]
fn second_run_is_a_no_op() {
    let tmp = TempDir::new().unwrap();
    let raw = tmp.path().join("raw");
    write_scan(&raw, "scene0000_00", 8);
    write_metadata(&raw, Split::Train, &["scene0000_00"]);

    let mut config = PrepConfig::new(&raw, tmp.path().join("out"));
    config.max_num_point = Some(5);
    let pipeline = BatchPipeline::from_config(config).unwrap();

    assert!(matches!(pipeline.run_split(Split::Train).unwrap(), SplitOutcome::Written(_)));
    let out = tmp.path().join("out/train.scnp");
    let before = fs::read(&out).unwrap();

    // Removing the raw data proves nothing is read again.
    fs::remove_dir_all(raw.join("scans")).unwrap();

    assert_eq!(
        pipeline.run_split(Split::Train).unwrap(),
        SplitOutcome::Skipped(out.clone())
    );
    assert_eq!(fs::read(&out).unwrap(), before);

    let pack = scanpack::parse_pack_bytes(&before).unwrap();
    assert_eq!(pack.total_points(), 5);
}

#[test]
fn options_shape_the_collated_pack() {
    let tmp = TempDir::new().unwrap();
    let raw = tmp.path().join("raw");
    write_scan(&raw, "scene0000_00", 8);
    write_metadata(&raw, Split::Train, &["scene0000_00"]);

    let mut config = PrepConfig::new(&raw, tmp.path().join("out"));
    config.use_instance_labels = false;
    config.use_instance_bboxes = false;
    config.donotcare_class_ids = BTreeSet::from([1]);
    config.encoding = scanpack::PayloadEncoding::Deflate(6);

    let marker = |mut r: ScanRecord| {
        r.positions.iter_mut().for_each(|p| p[1] = -1.0);
        r
    };
    let pipeline = BatchPipeline::from_config(config)
        .unwrap()
        .with_pre_transform(Arc::new(marker));

    pipeline.run_split(Split::Train).unwrap();

    let pack = scanpack::read_file(tmp.path().join("out/train.scnp")).unwrap();
    assert!(pack.instance_labels.is_none());
    assert!(pack.instance_boxes.is_none());
    // Only the chair half survives the wall filter.
    assert_eq!(pack.semantic_labels, vec![4; 4]);
    assert!(pack.positions.iter().all(|p| p[1] == -1.0 && p[0] >= 4.0));
    assert!(pack.semantic_labels.iter().all(|&l| l != IGNORE_LABEL));
}

#[test]
fn missing_label_table_fails_setup() {
    let tmp = TempDir::new().unwrap();
    let config = PrepConfig::new(tmp.path().join("raw"), tmp.path().join("out"));
    assert!(matches!(
        BatchPipeline::from_config(config),
        Err(scannet_prep::PrepError::Io { .. })
    ));
}
