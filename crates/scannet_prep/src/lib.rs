//! ScanNet mesh-to-point-cloud preparation.
//!
//! Raw scans (mesh, over-segmentation, object aggregation, metadata) are read
//! by [`readers`], joined and realigned by [`fusion`], filtered and remapped per
//! scan by [`scan`], and collated per split into a `scanpack` file by
//! [`pipeline`]. [`download`] fetches the raw release through a pluggable
//! transport.

pub mod classes;
pub mod config;
pub mod download;
pub mod error;
pub mod fusion;
pub mod pipeline;
pub mod progress;
pub mod readers;
pub mod scan;

pub use classes::{LabelRemap, CLASS_LABELS, IGNORE_LABEL, VALID_CLASS_IDS};
pub use config::{PrepConfig, Release, Split};
pub use error::{PrepError, Result};
pub use fusion::{fuse, AxisAlignment, FusedScan, InstanceBox};
pub use pipeline::{BatchPipeline, SplitOutcome, SplitSummary};
pub use readers::{
    read_aggregation, read_label_table, read_segmentation, read_vertices, read_vertices_xyz,
    LabelTable, VertexBuffer,
};
pub use scan::{RecordTransform, ScanOptions, ScanPaths, ScanProcessor, ScanRecord};
