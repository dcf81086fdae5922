//! Run configuration: dataset release, split selection and processing flags.
//!
//! Everything the pipeline needs is carried in an immutable [`PrepConfig`]
//! handed to it at construction time.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use scanpack::PayloadEncoding;
use serde::{Deserialize, Serialize};

use crate::classes::VALID_CLASS_IDS;
use crate::error::{PrepError, Result};
use crate::scan::ScanOptions;

/// Root of the public dataset mirror.
pub const BASE_URL: &str = "http://kaldir.vc.in.tum.de/scannet/";

/// Every per-scan file suffix published by the release.
pub const FILE_TYPES: [&str; 13] = [
    ".aggregation.json",
    ".sens",
    ".txt",
    "_vh_clean.ply",
    "_vh_clean_2.0.010000.segs.json",
    "_vh_clean_2.ply",
    "_vh_clean.segs.json",
    "_vh_clean.aggregation.json",
    "_vh_clean_2.labels.ply",
    "_2d-instance.zip",
    "_2d-instance-filt.zip",
    "_2d-label.zip",
    "_2d-label-filt.zip",
];

/// Suffixes available for test scans (no annotations are published for them).
pub const FILE_TYPES_TEST: [&str; 4] = [".sens", ".txt", "_vh_clean.ply", "_vh_clean_2.ply"];

/// The four files the scan processor reads.
pub const DEFAULT_FILE_TYPES: [&str; 4] = [
    ".txt",
    "_vh_clean_2.ply",
    "_vh_clean_2.0.010000.segs.json",
    ".aggregation.json",
];

pub const MESH_SUFFIX: &str = "_vh_clean_2.ply";
pub const AGGREGATION_SUFFIX: &str = ".aggregation.json";
pub const SEGMENTATION_SUFFIX: &str = "_vh_clean_2.0.010000.segs.json";
pub const METADATA_SUFFIX: &str = ".txt";

/// Label table columns used to resolve aggregation labels.
pub const LABEL_FROM_COLUMN: &str = "raw_category";
pub const LABEL_TO_COLUMN: &str = "nyu40id";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Release {
    V2,
    V1,
}

impl Release {
    pub fn name(self) -> &'static str {
        match self {
            Release::V2 => "v2",
            Release::V1 => "v1",
        }
    }

    /// Path of the scan directory below [`BASE_URL`].
    pub fn scans_path(self) -> &'static str {
        match self {
            Release::V2 => "v2/scans",
            Release::V1 => "v1/scans",
        }
    }

    pub fn tasks_path(self) -> &'static str {
        match self {
            Release::V2 => "v2/tasks",
            Release::V1 => "v1/tasks",
        }
    }

    pub fn label_map_file(self) -> &'static str {
        match self {
            Release::V2 => "scannetv2-labels.combined.tsv",
            Release::V1 => "scannet-labels.combined.tsv",
        }
    }

    /// URL of the plain-text list of every scan id in the release.
    pub fn scan_list_url(self) -> String {
        format!("{}{}.txt", BASE_URL, self.scans_path())
    }
}

impl fmt::Display for Release {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Val,
    Test,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Train, Split::Val, Split::Test];

    pub fn name(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
            Split::Test => "test",
        }
    }

    /// Scan list shipped in `metadata/`.
    pub fn list_file(self) -> String {
        format!("scannetv2_{}.txt", self.name())
    }

    pub fn output_file(self) -> String {
        format!("{}.scnp", self.name())
    }

    /// Raw directory holding this split's scans.
    pub fn raw_subdir(self) -> &'static str {
        match self {
            Split::Train | Split::Val => "scans",
            Split::Test => "scans_test",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reject suffixes that the release does not publish.
pub fn validate_file_types<S: AsRef<str>>(file_types: &[S]) -> Result<()> {
    for ft in file_types {
        let ft = ft.as_ref();
        if !FILE_TYPES.contains(&ft) {
            return Err(PrepError::config(format!(
                "unknown file type '{}' (expected one of: {})",
                ft,
                FILE_TYPES.join(", ")
            )));
        }
    }

    Ok(())
}

/// Restrict requested suffixes to what exists for test scans.
pub fn test_file_types<S: AsRef<str>>(file_types: &[S]) -> Vec<String> {
    file_types
        .iter()
        .map(AsRef::as_ref)
        .filter(|ft| FILE_TYPES_TEST.contains(ft))
        .map(str::to_owned)
        .collect()
}

#[derive(Debug, Clone)]
pub struct PrepConfig {
    /// Root of the downloaded release (`scans/`, `scans_test/`, `metadata/`).
    pub raw_dir: PathBuf,
    /// Destination of split packs and their summaries.
    pub processed_dir: PathBuf,
    pub version: Release,
    pub use_instance_labels: bool,
    pub use_instance_bboxes: bool,
    /// Raw class ids whose vertices are dropped before subsampling.
    pub donotcare_class_ids: BTreeSet<u32>,
    pub max_num_point: Option<usize>,
    pub use_multiprocessing: bool,
    pub process_workers: usize,
    pub file_types: Vec<String>,
    /// Fixed seed makes subsampling reproducible per scan.
    pub seed: Option<u64>,
    /// Overrides `metadata/<release label map>`.
    pub label_map_file: Option<PathBuf>,
    pub encoding: PayloadEncoding,
}

impl PrepConfig {
    pub fn new<P: Into<PathBuf>, Q: Into<PathBuf>>(raw_dir: P, processed_dir: Q) -> Self {
        Self {
            raw_dir: raw_dir.into(),
            processed_dir: processed_dir.into(),
            version: Release::V2,
            use_instance_labels: true,
            use_instance_bboxes: true,
            donotcare_class_ids: BTreeSet::new(),
            max_num_point: None,
            use_multiprocessing: false,
            process_workers: 4,
            file_types: DEFAULT_FILE_TYPES.iter().map(|s| s.to_string()).collect(),
            seed: None,
            label_map_file: None,
            encoding: PayloadEncoding::Raw,
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_file_types(&self.file_types)?;

        if self.use_multiprocessing && self.process_workers == 0 {
            return Err(PrepError::config("process_workers must be at least 1"));
        }
        if self.max_num_point == Some(0) {
            return Err(PrepError::config("max_num_point must be positive when set"));
        }
        if let PayloadEncoding::Deflate(level) = self.encoding {
            if level > 10 {
                return Err(PrepError::config(format!(
                    "deflate level {} out of range 0..=10",
                    level
                )));
            }
        }

        Ok(())
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.raw_dir.join("metadata")
    }

    pub fn label_map_path(&self) -> PathBuf {
        match &self.label_map_file {
            Some(path) => path.clone(),
            None => self.metadata_dir().join(self.version.label_map_file()),
        }
    }

    pub fn split_list_path(&self, split: Split) -> PathBuf {
        self.metadata_dir().join(split.list_file())
    }

    pub fn scans_dir(&self, split: Split) -> PathBuf {
        self.raw_dir.join(split.raw_subdir())
    }

    pub fn output_path(&self, split: Split) -> PathBuf {
        self.processed_dir.join(split.output_file())
    }

    pub fn summary_path(&self, split: Split) -> PathBuf {
        summary_path_for(&self.output_path(split))
    }

    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            donotcare_class_ids: self.donotcare_class_ids.clone(),
            valid_class_ids: VALID_CLASS_IDS.to_vec(),
            max_num_point: self.max_num_point,
            use_instance_labels: self.use_instance_labels,
            use_instance_bboxes: self.use_instance_bboxes,
            seed: self.seed,
        }
    }
}

/// `train.scnp` -> `train.summary.json`, in the same directory.
pub fn summary_path_for(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("split");
    output.with_file_name(format!("{}.summary.json", stem))
}
