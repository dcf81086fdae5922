//! Raw release retrieval through a pluggable [`Fetch`] transport.
//!
//! Every file goes to a `.part` sibling first and is renamed into place once
//! complete, so an existing destination is always a finished download and is
//! never fetched again.

use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::Serialize;

use crate::config::{Release, BASE_URL};
use crate::progress::Tick;

pub const TOS_URL: &str = "http://kaldir.vc.in.tum.de/scannet/ScanNet_TOS.pdf";

/// Split lists and label table mirrored alongside the benchmark code.
pub const METADATA_BASE_URL: &str =
    "https://raw.githubusercontent.com/facebookresearch/votenet/master/scannet/meta_data/";

pub const METADATA_FILES: [&str; 4] = [
    "scannetv2-labels.combined.tsv",
    "scannetv2_train.txt",
    "scannetv2_test.txt",
    "scannetv2_val.txt",
];

/// Transport that writes the resource at `url` to `destination`.
pub trait Fetch: Sync {
    fn fetch(&self, url: &str, destination: &Path) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    Fetched,
    Skipped,
}

pub fn fetch_if_missing(fetcher: &dyn Fetch, url: &str, out_file: &Path) -> io::Result<FetchStatus> {
    if out_file.is_file() {
        warn!("skipping download of existing file {}", out_file.display());
        return Ok(FetchStatus::Skipped);
    }

    if let Some(dir) = out_file.parent() {
        fs::create_dir_all(dir)?;
    }

    let mut part = out_file.as_os_str().to_owned();
    part.push(".part");
    let part = PathBuf::from(part);

    info!("\t{} > {}", url, out_file.display());

    if let Err(e) = fetcher.fetch(url, &part).and_then(|_| fs::rename(&part, out_file)) {
        let _ = fs::remove_file(&part);
        return Err(e);
    }

    Ok(FetchStatus::Fetched)
}

/// `.sens` streams are identical across releases; `use_v1_sens` fetches them from v1.
pub fn scan_file_url(release: Release, scan_id: &str, file_type: &str, use_v1_sens: bool) -> String {
    let release = if use_v1_sens && file_type == ".sens" {
        Release::V1
    } else {
        release
    };

    format!(
        "{}{}/{}/{}{}",
        BASE_URL,
        release.scans_path(),
        scan_id,
        scan_id,
        file_type
    )
}

pub fn download_scan(
    fetcher: &dyn Fetch,
    release: Release,
    scan_id: &str,
    out_dir: &Path,
    file_types: &[String],
    use_v1_sens: bool,
) -> io::Result<()> {
    info!("downloading {} scan {}", release, scan_id);

    for ft in file_types {
        let url = scan_file_url(release, scan_id, ft, use_v1_sens);
        let out_file = out_dir.join(format!("{}{}", scan_id, ft));
        fetch_if_missing(fetcher, &url, &out_file)?;
    }

    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FailedDownload {
    pub id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DownloadReport {
    pub completed: Vec<String>,
    pub failed: Vec<FailedDownload>,
}

impl DownloadReport {
    fn record(&mut self, id: &str, result: io::Result<()>) {
        match result {
            Ok(()) => self.completed.push(id.to_owned()),
            Err(e) => {
                warn!("download of {} failed: {}", id, e);
                self.failed.push(FailedDownload {
                    id: id.to_owned(),
                    error: e.to_string(),
                });
            }
        }
    }

    pub fn merge(&mut self, other: DownloadReport) {
        self.completed.extend(other.completed);
        self.failed.extend(other.failed);
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Best effort over `scan_ids`; a failing scan is reported and the rest continue.
pub fn download_release(
    fetcher: &dyn Fetch,
    release: Release,
    scan_ids: &[String],
    out_dir: &Path,
    file_types: &[String],
    use_v1_sens: bool,
) -> DownloadReport {
    let mut report = DownloadReport::default();
    if scan_ids.is_empty() {
        return report;
    }

    info!("downloading {} {} scans to {}", scan_ids.len(), release, out_dir.display());

    let mut tick = Tick::new(25);
    for (i, scan_id) in scan_ids.iter().enumerate() {
        let result = download_scan(
            fetcher,
            release,
            scan_id,
            &out_dir.join(scan_id),
            file_types,
            use_v1_sens,
        );
        report.record(scan_id, result);

        if tick.should(i + 1) {
            info!(
                "{}/{} scans, {:.2} scans/s",
                i + 1,
                scan_ids.len(),
                tick.rate(i + 1)
            );
            tick.bump();
        }
    }

    if !report.failed.is_empty() {
        let ids: Vec<&str> = report.failed.iter().map(|f| f.id.as_str()).collect();
        warn!("failed downloads: {:?}", ids);
    }

    report
}

/// Label table of `release` into `out_dir`.
pub fn download_label_map(fetcher: &dyn Fetch, release: Release, out_dir: &Path) -> io::Result<FetchStatus> {
    let file = release.label_map_file();
    let url = format!("{}{}/{}", BASE_URL, release.tasks_path(), file);
    fetch_if_missing(fetcher, &url, &out_dir.join(file))
}

/// Split lists and label table into `metadata_dir`.
pub fn download_metadata(fetcher: &dyn Fetch, metadata_dir: &Path) -> DownloadReport {
    let mut report = DownloadReport::default();
    for file in METADATA_FILES {
        let url = format!("{}{}", METADATA_BASE_URL, file);
        let result = fetch_if_missing(fetcher, &url, &metadata_dir.join(file)).map(|_| ());
        report.record(file, result);
    }
    report
}

/// Fetch (or reuse) the release's scan list under `out_dir` and return its ids.
pub fn release_scan_ids(fetcher: &dyn Fetch, release: Release, out_dir: &Path) -> io::Result<Vec<String>> {
    let list = out_dir.join(format!("scans_{}.txt", release));
    fetch_if_missing(fetcher, &release.scan_list_url(), &list)?;

    Ok(fs::read_to_string(&list)?
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_owned)
        .collect())
}

/// Serves URLs below known prefixes from a local directory tree.
#[derive(Debug, Clone)]
pub struct MirrorFetcher {
    root: PathBuf,
    prefixes: Vec<String>,
}

impl MirrorFetcher {
    /// Mirrors [`BASE_URL`] and [`METADATA_BASE_URL`] at `root`.
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            prefixes: vec![BASE_URL.to_owned(), METADATA_BASE_URL.to_owned()],
        }
    }

    pub fn with_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.prefixes.push(prefix.into());
        self
    }

    pub fn resolve(&self, url: &str) -> io::Result<PathBuf> {
        let relative = self
            .prefixes
            .iter()
            .find_map(|p| url.strip_prefix(p.as_str()))
            .ok_or_else(|| io::Error::new(ErrorKind::NotFound, format!("{} is outside the mirror", url)))?;

        if relative.split('/').any(|c| c == "..") {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("{} escapes the mirror", url),
            ));
        }

        Ok(self.root.join(relative))
    }
}

impl Fetch for MirrorFetcher {
    fn fetch(&self, url: &str, destination: &Path) -> io::Result<()> {
        let source = self.resolve(url)?;
        fs::copy(&source, destination).map(|_| ())
    }
}
