//! Per-scan processing: read, fuse, filter, subsample, remap.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;
use rand::rngs::StdRng;
use rand::seq::index;
use rand::SeedableRng;
use scanpack::RecordView;

use crate::classes::LabelRemap;
use crate::config::{AGGREGATION_SUFFIX, MESH_SUFFIX, METADATA_SUFFIX, SEGMENTATION_SUFFIX};
use crate::error::{PrepError, Result};
use crate::fusion::{fuse, FusedScan};
use crate::readers::{self, LabelTable};

/// The four raw files of one scan, `<scans_dir>/<id>/<id><suffix>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanPaths {
    pub scan_id: String,
    pub mesh: PathBuf,
    pub aggregation: PathBuf,
    pub segmentation: PathBuf,
    pub metadata: PathBuf,
}

impl ScanPaths {
    pub fn new(scans_dir: &Path, scan_id: &str) -> Self {
        let dir = scans_dir.join(scan_id);
        let file = |suffix: &str| dir.join(format!("{}{}", scan_id, suffix));

        Self {
            scan_id: scan_id.to_owned(),
            mesh: file(MESH_SUFFIX),
            aggregation: file(AGGREGATION_SUFFIX),
            segmentation: file(SEGMENTATION_SUFFIX),
            metadata: file(METADATA_SUFFIX),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOptions {
    /// Raw class ids whose vertices are removed.
    pub donotcare_class_ids: BTreeSet<u32>,
    /// Classes kept in the dense label space; also filters instance boxes.
    pub valid_class_ids: Vec<u32>,
    pub max_num_point: Option<usize>,
    pub use_instance_labels: bool,
    pub use_instance_bboxes: bool,
    pub seed: Option<u64>,
}

/// Final per-scan output.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRecord {
    pub scan_id: String,
    pub positions: Vec<[f32; 3]>,
    /// RGB scaled to 0..=1.
    pub colors: Vec<[f32; 3]>,
    /// Dense class index or [`crate::classes::IGNORE_LABEL`].
    pub semantic_labels: Vec<i32>,
    pub instance_labels: Option<Vec<u32>>,
    /// `[cx, cy, cz, dx, dy, dz, raw_label]`
    pub instance_boxes: Option<Vec<[f32; 7]>>,
}

impl ScanRecord {
    pub fn num_points(&self) -> usize {
        self.positions.len()
    }

    pub fn as_view(&self) -> RecordView<'_> {
        RecordView {
            scan_id: &self.scan_id,
            positions: &self.positions,
            colors: &self.colors,
            semantic_labels: &self.semantic_labels,
            instance_labels: self.instance_labels.as_deref(),
            instance_boxes: self.instance_boxes.as_deref(),
        }
    }
}

/// Caller-supplied record rewrite applied before collation.
pub trait RecordTransform: Send + Sync {
    fn apply(&self, record: ScanRecord) -> ScanRecord;
}

impl<F> RecordTransform for F
where
    F: Fn(ScanRecord) -> ScanRecord + Send + Sync,
{
    fn apply(&self, record: ScanRecord) -> ScanRecord {
        self(record)
    }
}

/// FNV-1a, so a fixed run seed yields a distinct but stable stream per scan.
fn scan_hash(scan_id: &str) -> u64 {
    scan_id.bytes().fold(0xcbf2_9ce4_8422_2325u64, |h, b| {
        (h ^ b as u64).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

pub struct ScanProcessor {
    label_table: LabelTable,
    remap: LabelRemap,
    options: ScanOptions,
    pre_transform: Option<Arc<dyn RecordTransform>>,
}

impl fmt::Debug for ScanProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanProcessor")
            .field("labels", &self.label_table.len())
            .field("num_classes", &self.remap.num_classes())
            .field("options", &self.options)
            .field("pre_transform", &self.pre_transform.is_some())
            .finish()
    }
}

impl ScanProcessor {
    pub fn new(label_table: LabelTable, remap: LabelRemap, options: ScanOptions) -> Self {
        Self {
            label_table,
            remap,
            options,
            pre_transform: None,
        }
    }

    pub fn with_pre_transform(mut self, transform: Arc<dyn RecordTransform>) -> Self {
        self.pre_transform = Some(transform);
        self
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    /// Read and fuse one scan, then shape its record. Errors are returned, never logged here.
    pub fn process_scan(&self, paths: &ScanPaths) -> Result<ScanRecord> {
        let vertices = readers::read_vertices(&paths.mesh)?;
        let alignment = readers::read_axis_alignment(&paths.metadata)?;
        let (object_to_segs, label_to_segs) = readers::read_aggregation(&paths.aggregation)?;
        let (segments, seg_vertex_count) = readers::read_segmentation(&paths.segmentation)?;

        if seg_vertex_count != vertices.len() {
            return Err(PrepError::lookup(format!(
                "{}: segmentation covers {} vertices but mesh has {}",
                paths.scan_id,
                seg_vertex_count,
                vertices.len()
            )));
        }

        let fused = fuse(
            vertices,
            &segments,
            &object_to_segs,
            &label_to_segs,
            &self.label_table,
            &alignment,
        )?;

        self.shape_record(&paths.scan_id, fused)
    }

    fn rng_for(&self, scan_id: &str) -> StdRng {
        match self.options.seed {
            Some(seed) => StdRng::seed_from_u64(seed ^ scan_hash(scan_id)),
            None => StdRng::from_entropy(),
        }
    }

    /// Filter, subsample and remap a fused scan into its record.
    pub fn shape_record(&self, scan_id: &str, fused: FusedScan) -> Result<ScanRecord> {
        let FusedScan {
            positions,
            colors,
            semantic_labels,
            instance_ids,
            instance_boxes,
            ..
        } = fused;

        let colors = colors
            .ok_or_else(|| PrepError::lookup(format!("{}: mesh has no vertex colors", scan_id)))?;

        let opts = &self.options;

        let mut keep: Vec<usize> = (0..positions.len())
            .filter(|&i| !opts.donotcare_class_ids.contains(&semantic_labels[i]))
            .collect();

        let boxes: Vec<[f32; 7]> = instance_boxes
            .iter()
            .filter(|b| opts.valid_class_ids.contains(&b.label))
            .map(|b| b.to_array())
            .collect();

        if let Some(max) = opts.max_num_point {
            if keep.len() > max {
                let mut rng = self.rng_for(scan_id);
                keep = index::sample(&mut rng, keep.len(), max)
                    .into_iter()
                    .map(|i| keep[i])
                    .collect();
            }
        }

        debug!(
            "{}: kept {} of {} vertices, {} of {} boxes",
            scan_id,
            keep.len(),
            positions.len(),
            boxes.len(),
            instance_boxes.len()
        );

        let record = ScanRecord {
            scan_id: scan_id.to_owned(),
            positions: keep.iter().map(|&i| positions[i]).collect(),
            colors: keep
                .iter()
                .map(|&i| {
                    let [r, g, b] = colors[i];
                    [r / 255.0, g / 255.0, b / 255.0]
                })
                .collect(),
            semantic_labels: keep
                .iter()
                .map(|&i| self.remap.map(semantic_labels[i]))
                .collect(),
            instance_labels: opts
                .use_instance_labels
                .then(|| keep.iter().map(|&i| instance_ids[i]).collect()),
            instance_boxes: opts.use_instance_bboxes.then_some(boxes),
        };

        Ok(match &self.pre_transform {
            Some(transform) => transform.apply(record),
            None => record,
        })
    }
}
