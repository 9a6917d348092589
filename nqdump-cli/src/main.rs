use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result, bail};
use clap::Parser;
use nqdump::{Codec, DumpError, DumpOptions, QmcCipher};
use rayon::prelude::*;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

#[derive(Parser)]
#[command(
    name = "nqdump",
    version,
    about = "Decode NCM and QMC/MFLAC protected audio files",
    after_help = "Supported: .ncm, .qmc0/2/3/4/6/8, .qmcflac, .qmcogg, .tkm, .bkcmp3, \
                  .bkcflac, .666c6163, .6f6767, .6d7033, .6d3461, .776176, .mflac"
)]
struct Cli {
    /// Files or directories to decode (directories expand to their direct children)
    #[arg(required = true)]
    paths: Vec<PathBuf>,
    /// Output directory (default: next to each input)
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,
    /// Recurse into subdirectories
    #[arg(short, long)]
    recursive: bool,
    /// Number of files decoded in parallel
    #[arg(short, long, value_name = "N")]
    jobs: Option<usize>,
    /// Do not write tags into decoded NCM tracks
    #[arg(long)]
    no_tags: bool,
    /// Do not download album art that is not embedded
    #[arg(long)]
    no_fetch_cover: bool,
    /// Use the positional-hash cipher for static-table QMC files
    #[arg(long)]
    legacy_qmc: bool,
    /// Remove source file after successful conversion
    #[arg(short = 'm', long = "remove")]
    remove: bool,
    /// Verbose logging (same as RUST_LOG=debug)
    #[arg(short, long)]
    verbose: bool,
}

enum Outcome {
    Done,
    Skipped,
    Failed,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let files = collect_files(&cli.paths, cli.recursive);
    if files.is_empty() {
        bail!("no files to decode");
    }

    if let Some(dir) = &cli.output {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    let options = DumpOptions {
        output_dir: cli.output.clone(),
        qmc_cipher: if cli.legacy_qmc {
            QmcCipher::Legacy
        } else {
            QmcCipher::Static
        },
        write_tags: !cli.no_tags,
        fetch_cover: !cli.no_fetch_cover,
        ..DumpOptions::default()
    };

    let mut pool = rayon::ThreadPoolBuilder::new();
    if let Some(jobs) = cli.jobs {
        pool = pool.num_threads(jobs.max(1));
    }
    let pool = pool.build().context("failed to start worker pool")?;

    let done = AtomicUsize::new(0);
    let skipped = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    pool.install(|| {
        files.par_iter().for_each(|(file, explicit)| {
            let counter = match dump_one(file, *explicit, &options, cli.remove) {
                Outcome::Done => &done,
                Outcome::Skipped => &skipped,
                Outcome::Failed => &failed,
            };
            counter.fetch_add(1, Ordering::Relaxed);
        });
    });

    let failed = failed.into_inner();
    info!(
        done = done.into_inner(),
        skipped = skipped.into_inner(),
        failed,
        "finished"
    );
    if failed > 0 {
        bail!("{failed} file(s) failed");
    }
    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Expand arguments into `(file, named explicitly)` pairs.
fn collect_files(paths: &[PathBuf], recursive: bool) -> Vec<(PathBuf, bool)> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            let depth = if recursive { usize::MAX } else { 1 };
            for entry in WalkDir::new(path)
                .min_depth(1)
                .max_depth(depth)
                .sort_by_file_name()
                .into_iter()
            {
                match entry {
                    Ok(entry) if entry.file_type().is_file() => {
                        files.push((entry.into_path(), false));
                    }
                    Ok(_) => {}
                    Err(e) => warn!("skipping unreadable entry: {e}"),
                }
            }
        } else {
            files.push((path.clone(), true));
        }
    }
    files
}

fn dump_one(file: &Path, explicit: bool, options: &DumpOptions, remove: bool) -> Outcome {
    let route = nqdump::format::route_for(file);
    if route.is_none() && !explicit {
        debug!("skipping {}", file.display());
        return Outcome::Skipped;
    }

    match nqdump::convert(file, options) {
        Ok(out) => {
            info!("{} -> {}", file.display(), out.display());
            if remove {
                if let Err(e) = std::fs::remove_file(file) {
                    warn!("failed to remove {}: {e}", file.display());
                }
            }
            Outcome::Done
        }
        Err(DumpError::Unsupported { extension })
            if route.is_some_and(|r| r.codec == Codec::Unsupported) =>
        {
            warn!(
                "{}: .{extension} is not supported, try https://github.com/unlock-music/unlock-music/",
                file.display()
            );
            Outcome::Skipped
        }
        Err(DumpError::KeyRecoveryFailed) => {
            error!(
                "{}: mflac decode failed, try downgrading the QQ Music client and re-downloading the song",
                file.display()
            );
            Outcome::Failed
        }
        Err(e) => {
            error!("{}: {e}", file.display());
            Outcome::Failed
        }
    }
}
