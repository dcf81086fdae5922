use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use log::{info, warn};
use std::{collections::BTreeMap, path::PathBuf};

use scanpack::PayloadEncoding;
use scannet_prep::{
    classes::{class_name, IGNORE_LABEL},
    config::{test_file_types, validate_file_types, DEFAULT_FILE_TYPES, FILE_TYPES},
    download::{
        download_label_map, download_metadata, download_release, release_scan_ids, MirrorFetcher,
        TOS_URL,
    },
    pipeline::read_split_list,
    BatchPipeline, PrepConfig, Release, Split, SplitOutcome,
};

#[derive(Parser, Debug)]
#[command(name = "scannet_prep", version)]
#[command(about = "Convert ScanNet scans into labelled point-cloud split packs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process raw scans into one pack per split
    Prepare(PrepareArgs),

    /// Fetch the raw release from a local mirror
    Download(DownloadArgs),

    /// Summarise a written pack, or one scan inside it
    Inspect(InspectArgs),
}

#[derive(Args, Debug)]
struct PrepareArgs {
    #[arg(long, env = "SCANNET_RAW_DIR", default_value = "data/scannet/raw")]
    raw_dir: PathBuf,

    #[arg(long, env = "SCANNET_PROCESSED_DIR", default_value = "data/scannet/processed")]
    processed_dir: PathBuf,

    #[arg(long, value_enum, default_value_t = Release::V2)]
    version: Release,

    /// Splits to build; an existing pack skips its split
    #[arg(long, value_enum, value_delimiter = ',', default_values_t = [Split::Train, Split::Val])]
    splits: Vec<Split>,

    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    use_instance_labels: bool,

    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    use_instance_bboxes: bool,

    /// Raw class ids whose points are dropped, e.g. `0,13`
    #[arg(long, value_delimiter = ',')]
    donotcare_class_ids: Vec<u32>,

    /// Random subsample budget per scan
    #[arg(long)]
    max_num_point: Option<usize>,

    #[arg(long, default_value_t = false)]
    use_multiprocessing: bool,

    #[arg(long, env = "SCANNET_WORKERS", default_value_t = 4)]
    process_workers: usize,

    /// Seed for reproducible subsampling
    #[arg(long)]
    seed: Option<u64>,

    /// Label table to use instead of `metadata/<release>.tsv`
    #[arg(long)]
    label_map_file: Option<PathBuf>,

    /// Deflate the pack payload at this level (0..=10)
    #[arg(long)]
    deflate: Option<u8>,
}

impl PrepareArgs {
    fn to_config(&self) -> PrepConfig {
        let mut config = PrepConfig::new(&self.raw_dir, &self.processed_dir);
        config.version = self.version;
        config.use_instance_labels = self.use_instance_labels;
        config.use_instance_bboxes = self.use_instance_bboxes;
        config.donotcare_class_ids = self.donotcare_class_ids.iter().copied().collect();
        config.max_num_point = self.max_num_point;
        config.use_multiprocessing = self.use_multiprocessing;
        config.process_workers = self.process_workers;
        config.seed = self.seed;
        config.label_map_file = self.label_map_file.clone();
        config.encoding = match self.deflate {
            Some(level) => PayloadEncoding::Deflate(level),
            None => PayloadEncoding::Raw,
        };
        config
    }
}

#[derive(Args, Debug)]
struct DownloadArgs {
    #[arg(long, env = "SCANNET_RAW_DIR", default_value = "data/scannet/raw")]
    raw_dir: PathBuf,

    /// Directory mirroring the release URL layout
    #[arg(long, env = "SCANNET_MIRROR")]
    mirror: PathBuf,

    #[arg(long, value_enum, default_value_t = Release::V2)]
    version: Release,

    /// File suffixes to fetch per scan
    #[arg(long, value_delimiter = ',', default_values_t = DEFAULT_FILE_TYPES.map(String::from))]
    types: Vec<String>,

    /// Explicit scan ids; defaults to the full release list
    #[arg(long, value_delimiter = ',')]
    scans: Vec<String>,

    /// Leave out the (large) `.sens` streams
    #[arg(long, default_value_t = false)]
    skip_sens: bool,

    /// Also fetch test scans listed in `metadata/scannetv2_test.txt`
    #[arg(long, default_value_t = false)]
    with_test: bool,

    /// Confirm the ScanNet terms of use
    #[arg(long, default_value_t = false)]
    agree_tos: bool,
}

#[derive(Args, Debug)]
struct InspectArgs {
    #[arg(value_name = "PACK")]
    file: PathBuf,

    /// Print the label histogram of one scan
    #[arg(long)]
    scan: Option<String>,
}

fn prepare(args: &PrepareArgs) -> Result<()> {
    let pipeline = BatchPipeline::from_config(args.to_config()).context("failed to set up pipeline")?;

    for &split in &args.splits {
        let outcome = pipeline
            .run_split(split)
            .with_context(|| format!("split {} failed", split))?;

        match outcome {
            SplitOutcome::Skipped(path) => info!("{}: kept existing {}", split, path.display()),
            SplitOutcome::Written(summary) => {
                if !summary.failed.is_empty() {
                    warn!(
                        "{}: {} of {} scans failed, see {}",
                        split,
                        summary.failed.len(),
                        summary.requested,
                        pipeline.config().summary_path(split).display()
                    );
                }
            }
        }
    }

    Ok(())
}

fn download(args: &DownloadArgs) -> Result<()> {
    if !args.agree_tos {
        bail!(
            "downloading requires agreeing to the ScanNet terms of use ({}); pass --agree-tos",
            TOS_URL
        );
    }

    validate_file_types(&args.types).with_context(|| format!("known types: {}", FILE_TYPES.join(", ")))?;

    let mut types = args.types.clone();
    if args.skip_sens {
        types.retain(|t| t != ".sens");
    }

    let fetcher = MirrorFetcher::new(&args.mirror);

    let scan_ids = if args.scans.is_empty() {
        release_scan_ids(&fetcher, args.version, &args.raw_dir).context("failed to fetch the release scan list")?
    } else {
        args.scans.clone()
    };

    download_label_map(&fetcher, args.version, &args.raw_dir).context("failed to fetch the label map")?;

    let mut report = download_release(
        &fetcher,
        args.version,
        &scan_ids,
        &args.raw_dir.join(Split::Train.raw_subdir()),
        &types,
        true,
    );

    let metadata_dir = args.raw_dir.join("metadata");
    report.merge(download_metadata(&fetcher, &metadata_dir));

    if args.with_test {
        let test_ids = read_split_list(&metadata_dir.join(Split::Test.list_file()))?;
        report.merge(download_release(
            &fetcher,
            args.version,
            &test_ids,
            &args.raw_dir.join(Split::Test.raw_subdir()),
            &test_file_types(&types),
            true,
        ));
    }

    info!(
        "download finished: {} ok, {} failed",
        report.completed.len(),
        report.failed.len()
    );

    Ok(())
}

fn inspect(args: &InspectArgs) -> Result<()> {
    let pack = scanpack::read_file(&args.file).with_context(|| format!("cannot read {}", args.file.display()))?;

    println!(
        "{}: {}/{} scans, {} points, {} boxes",
        args.file.display(),
        pack.record_count(),
        pack.requested_count,
        pack.total_points(),
        pack.total_boxes()
    );

    let Some(scan_id) = &args.scan else {
        for (i, id) in pack.scan_ids.iter().enumerate() {
            let points = pack.point_range(i).map(|r| r.len()).unwrap_or(0);
            println!("  {:>5} {} {:>9} points", i, id, points);
        }
        return Ok(());
    };

    let record = pack
        .position_of(scan_id)
        .and_then(|i| pack.record(i))
        .with_context(|| format!("{} is not in {}", scan_id, args.file.display()))?;

    let mut histogram: BTreeMap<i32, usize> = BTreeMap::new();
    for &label in record.semantic_labels {
        *histogram.entry(label).or_default() += 1;
    }

    println!(
        "{}: {} points, {} boxes",
        record.scan_id,
        record.positions.len(),
        record.instance_boxes.map(|b| b.len()).unwrap_or(0)
    );
    for (label, count) in histogram {
        let name = if label == IGNORE_LABEL {
            "ignore"
        } else {
            class_name(label).unwrap_or("?")
        };
        println!("  {:>5} {:<16} {:>9}", label, name, count);
    }

    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match &cli.command {
        Command::Prepare(args) => prepare(args),
        Command::Download(args) => download(args),
        Command::Inspect(args) => inspect(args),
    }
}
