//! Split-level batch processing.
//!
//! A split is processed at most once: when its pack already exists the run is
//! skipped without touching anything. The check is not a lock, so two
//! concurrent runs over the same output directory may both proceed; the last
//! rename wins.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use scanpack::SplitPack;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::classes::LabelRemap;
use crate::config::{summary_path_for, PrepConfig, Split, LABEL_FROM_COLUMN, LABEL_TO_COLUMN};
use crate::error::{PrepError, Result};
use crate::progress::Tick;
use crate::readers::read_label_table;
use crate::scan::{RecordTransform, ScanPaths, ScanProcessor, ScanRecord};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedScan {
    pub scan_id: String,
    pub error: String,
}

/// Written next to each pack as `<split>.summary.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitSummary {
    pub split: Split,
    pub requested: usize,
    pub included: usize,
    pub total_points: usize,
    pub failed: Vec<FailedScan>,
    pub output: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitOutcome {
    /// Pack already present; nothing was read or written.
    Skipped(PathBuf),
    Written(SplitSummary),
}

/// One scan id per line; blank lines are ignored.
pub fn read_split_list(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path).map_err(|e| PrepError::io(path, e))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_owned)
        .collect())
}

/// Scan directories directly below `scans_dir`.
pub fn discover_scans(scans_dir: &Path) -> BTreeSet<String> {
    WalkDir::new(scans_dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_dir())
        .filter_map(|entry| entry.file_name().to_str().map(str::to_owned))
        .collect()
}

/// Requested ids with no directory under `scans_dir`, in request order.
pub fn missing_scans(scans_dir: &Path, scan_ids: &[String]) -> Vec<String> {
    let local = discover_scans(scans_dir);
    scan_ids
        .iter()
        .filter(|id| !local.contains(id.as_str()))
        .cloned()
        .collect()
}

/// Concatenate records in order into a pack.
pub fn collate(
    requested: usize,
    records: &[ScanRecord],
    with_instance_labels: bool,
    with_instance_boxes: bool,
) -> Result<SplitPack> {
    let requested = u32::try_from(requested)
        .map_err(|_| PrepError::config(format!("{} scans exceed the pack limit", requested)))?;

    let mut pack = SplitPack::new(requested, with_instance_labels, with_instance_boxes);
    for record in records {
        pack.push_record(record.as_view())?;
    }

    Ok(pack)
}

#[derive(Debug)]
pub struct BatchPipeline {
    config: PrepConfig,
    processor: ScanProcessor,
}

impl BatchPipeline {
    pub fn new(config: PrepConfig, processor: ScanProcessor) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, processor })
    }

    /// Load the label table named by `config` and build the 20-class processor.
    pub fn from_config(config: PrepConfig) -> Result<Self> {
        config.validate()?;

        let label_table = read_label_table(&config.label_map_path(), LABEL_FROM_COLUMN, LABEL_TO_COLUMN)?;
        let processor = ScanProcessor::new(label_table, LabelRemap::scannet(), config.scan_options());

        Ok(Self { config, processor })
    }

    pub fn with_pre_transform(mut self, transform: Arc<dyn RecordTransform>) -> Self {
        self.processor = self.processor.with_pre_transform(transform);
        self
    }

    pub fn config(&self) -> &PrepConfig {
        &self.config
    }

    /// Process a split using its list file and default output slot.
    pub fn run_split(&self, split: Split) -> Result<SplitOutcome> {
        let output = self.config.output_path(split);
        if output.exists() {
            info!("{} exists, skipping split {}", output.display(), split);
            return Ok(SplitOutcome::Skipped(output));
        }

        let scan_ids = read_split_list(&self.config.split_list_path(split))?;
        self.run(split, &scan_ids, &output)
    }

    pub fn run(&self, split: Split, scan_ids: &[String], output: &Path) -> Result<SplitOutcome> {
        if output.exists() {
            info!("{} exists, skipping split {}", output.display(), split);
            return Ok(SplitOutcome::Skipped(output.to_path_buf()));
        }

        let scans_dir = self.config.scans_dir(split);

        let missing = missing_scans(&scans_dir, scan_ids);
        if !missing.is_empty() {
            warn!(
                "split {}: {} of {} scans not found under {}",
                split,
                missing.len(),
                scan_ids.len(),
                scans_dir.display()
            );
            for id in &missing {
                debug!("missing scan {}", id);
            }
        }

        let tick = Tick::new(1);
        let results = self.process_all(&scans_dir, scan_ids)?;

        let mut records = Vec::with_capacity(results.len());
        let mut failed = Vec::new();
        for (id, result) in scan_ids.iter().zip(results) {
            match result {
                Ok(record) => records.push(record),
                Err(e) => failed.push(FailedScan {
                    scan_id: id.clone(),
                    error: e.to_string(),
                }),
            }
        }

        let pack = collate(
            scan_ids.len(),
            &records,
            self.config.use_instance_labels,
            self.config.use_instance_bboxes,
        )?;

        let summary = SplitSummary {
            split,
            requested: scan_ids.len(),
            included: records.len(),
            total_points: pack.total_points(),
            failed,
            output: output.to_path_buf(),
        };

        write_outputs(output, &pack, &summary, &self.config)?;

        info!(
            "split {}: {}/{} scans, {} points, {:.2} scans/s -> {}",
            split,
            summary.included,
            summary.requested,
            summary.total_points,
            tick.rate(summary.requested),
            output.display()
        );

        Ok(SplitOutcome::Written(summary))
    }

    /// Results come back in `scan_ids` order whatever the worker count.
    fn process_all(&self, scans_dir: &Path, scan_ids: &[String]) -> Result<Vec<Result<ScanRecord>>> {
        let total = scan_ids.len();

        if !self.config.use_multiprocessing {
            return Ok(scan_ids
                .iter()
                .enumerate()
                .map(|(i, id)| self.process_one(scans_dir, i, total, id))
                .collect());
        }

        let pool = ThreadPoolBuilder::new()
            .num_threads(self.config.process_workers)
            .thread_name(|i| format!("scan-worker-{}", i))
            .build()
            .map_err(|e| PrepError::config(format!("cannot start {} workers: {}", self.config.process_workers, e)))?;

        Ok(pool.install(|| {
            scan_ids
                .par_iter()
                .enumerate()
                .map(|(i, id)| self.process_one(scans_dir, i, total, id))
                .collect()
        }))
    }

    fn process_one(&self, scans_dir: &Path, index: usize, total: usize, scan_id: &str) -> Result<ScanRecord> {
        let paths = ScanPaths::new(scans_dir, scan_id);

        match self.processor.process_scan(&paths) {
            Ok(record) => {
                info!(
                    "{}/{}| scan_name: {}, points: {}",
                    index + 1,
                    total,
                    scan_id,
                    record.num_points()
                );
                Ok(record)
            }
            Err(e) => {
                warn!("{}/{}| scan_name: {} skipped: {}", index + 1, total, scan_id, e);
                Err(e)
            }
        }
    }
}

/// Summary first, then the pack via rename; the pack's presence marks the split done.
fn write_outputs(output: &Path, pack: &SplitPack, summary: &SplitSummary, config: &PrepConfig) -> Result<()> {
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent).map_err(|e| PrepError::io(parent, e))?;
    }

    let summary_path = summary_path_for(output);
    let file = File::create(&summary_path).map_err(|e| PrepError::io(&summary_path, e))?;
    serde_json::to_writer_pretty(BufWriter::new(file), summary).map_err(io::Error::from)?;

    let mut partial = output.as_os_str().to_owned();
    partial.push(".partial");
    let partial = PathBuf::from(partial);

    scanpack::write_file(&partial, pack, config.encoding)?;
    fs::rename(&partial, output)?;

    debug!("wrote {} and {}", output.display(), summary_path.display());

    Ok(())
}
