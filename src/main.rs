mod batch;
mod download;
mod engine;
mod error;
mod file;
mod options;
mod state;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

use batch::BatchSummary;
use download::progress::Progress;
use download::search::Outcome;
use engine::Engine;
use options::{Options, MIB, RANGE_CONCURRENCY_WARNING, VALID_QUALITIES};

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    #[clap(subcommand)]
    subcmd: SubCmd,

    #[clap(short, long, default_value = "15")]
    /// set the maximum number of items downloaded in parallel
    workers: usize,

    #[clap(long, default_value = "15")]
    /// set the maximum number of parallel chunk requests per item
    chunk_workers: usize,

    #[clap(short, long, default_value = "20")]
    /// set the chunk size in mega bytes
    chunk_size: u64,

    #[clap(short, long, default_value = "3")]
    /// set the number of attempts per chunk
    retries: usize,

    #[clap(long, default_value = "30")]
    /// set the per request timeout in seconds
    timeout: u64,

    #[clap(long, env = "DOWNLOAD_PATH", default_value = "downloads")]
    /// directory downloads and the cache are written to
    download_path: PathBuf,

    #[clap(short, long, env = "VIDEO_QUALITY", value_parser = quality_parser)]
    /// preferred quality of progressive sources
    quality: Option<String>,

    #[clap(long)]
    /// wipe the cache before running
    clear_cache: bool,

    #[clap(long)]
    /// ignore cached metadata
    no_cache: bool,

    #[clap(short = 'Q', long)]
    /// do not draw progress bars
    quiet: bool,

    #[clap(long, default_value = "ffmpeg")]
    /// program used to remux segmented streams
    ffmpeg: PathBuf,

    #[clap(long)]
    /// referer and origin sent with every request
    referer: Option<String>,
}

#[derive(Subcommand, Debug)]
enum SubCmd {
    /// Download every item of a manifest
    Batch {
        /// path or url of a json manifest
        manifest: String,

        #[clap(short, long)]
        /// batch name used for the ledger, defaults to the manifest file name
        name: Option<String>,
    },
    /// Download a single item of a manifest
    Item {
        /// path or url of a json manifest
        manifest: String,

        /// id of the item to download
        id: String,

        #[clap(short, long)]
        name: Option<String>,
    },
    /// Download a single file or stream from a url
    Download {
        #[clap(value_parser = url_parser)]
        /// provide a download link
        url: Url,

        /// provide a output file name
        output: PathBuf,
    },
    /// Inspect or clear the cache
    Cache {
        #[clap(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand, Debug)]
enum CacheAction {
    /// List cached entries
    List,
    /// Remove every cached entry
    Clear,
}

fn url_parser(url: &str) -> Result<Url, String> {
    if !url.starts_with("http") {
        return Err("URL must start with http or https".to_string());
    }
    Url::parse(url).map_err(|err| err.to_string())
}

fn quality_parser(quality: &str) -> Result<String, String> {
    if VALID_QUALITIES.contains(&quality) {
        Ok(quality.to_string())
    } else {
        Err(format!("quality must be one of {}", VALID_QUALITIES.join(", ")))
    }
}

impl Args {
    fn options(&self) -> Options {
        Options {
            chunk_size: self.chunk_size * MIB,
            max_chunk_workers: self.chunk_workers,
            max_item_workers: self.workers,
            max_retries_per_chunk: self.retries,
            request_timeout: Duration::from_secs(self.timeout),
            download_path: self.download_path.clone(),
            preferred_quality: self.quality.clone(),
            use_cache: !self.no_cache,
            show_progress: !self.quiet,
            ffmpeg: self.ffmpeg.clone(),
            referer: self.referer.clone(),
            ..Options::default()
        }
    }
}

fn report(batch: &str, summary: &BatchSummary) -> anyhow::Result<()> {
    println!(
        "{}: {} total, {} already complete, {} downloaded, {} failed, {} cancelled",
        batch, summary.total, summary.already_complete, summary.succeeded, summary.failed, summary.cancelled
    );
    for failure in &summary.failures {
        eprintln!("  {} ({}): {}", failure.title, failure.id, failure.cause);
    }

    if summary.has_failures() {
        bail!("{} item(s) failed", summary.failed);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let options = args.options();

    let progress = Progress::new(options.show_progress);
    let logs = progress.log_writer();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vidfetch=info")))
        .with_writer(move || logs.clone())
        .init();

    if options.effective_range_concurrency() > RANGE_CONCURRENCY_WARNING {
        warn!(
            workers = options.max_item_workers,
            chunk_workers = options.max_chunk_workers,
            "up to {} concurrent range requests",
            options.effective_range_concurrency()
        );
    }

    let engine = Engine::new(options, progress).await?;
    if args.clear_cache {
        engine.store().clear().await?;
        info!(path = %engine.store().root().display(), "cache cleared");
    }

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping after in-flight work is aborted");
            interrupt.cancel();
        }
    });

    match args.subcmd {
        SubCmd::Batch { manifest, name } => {
            let batch = name.unwrap_or_else(|| file::batch_name(&manifest));
            let resolver = engine.manifest_resolver(&manifest);
            let summary = engine.run_batch(&resolver, &batch, None, &cancel).await?;
            report(&batch, &summary)?;
        }
        SubCmd::Item { manifest, id, name } => {
            let batch = name.unwrap_or_else(|| file::batch_name(&manifest));
            let resolver = engine.manifest_resolver(&manifest);
            let summary = engine.run_batch(&resolver, &batch, Some(&id), &cancel).await?;
            report(&batch, &summary)?;
        }
        SubCmd::Download { url, output } => match engine.download_one(url.clone(), output.clone(), &cancel).await {
            Outcome::Success(done) => {
                println!("Finished downloading {} ({} bytes) from: {}", output.display(), done.bytes, url);
            }
            Outcome::Failed(err) => bail!("downloading {} failed: {}", url, err),
        },
        SubCmd::Cache { action: CacheAction::List } => {
            for entry in engine.store().list().await? {
                println!("{:<10} {:<48} {:>10}", entry.partition.dir_name(), entry.key, entry.size);
            }
        }
        SubCmd::Cache { action: CacheAction::Clear } => {
            engine.store().clear().await?;
            println!("Cleared {}", engine.store().root().display());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_map_onto_options() {
        let args = Args::parse_from([
            "vidfetch",
            "--workers",
            "4",
            "--chunk-size",
            "8",
            "--no-cache",
            "--quality",
            "720p",
            "batch",
            "course.json",
        ]);
        let options = args.options();

        assert_eq!(options.max_item_workers, 4);
        assert_eq!(options.chunk_size, 8 * MIB);
        assert!(!options.use_cache);
        assert_eq!(options.preferred_quality.as_deref(), Some("720p"));
        assert!(matches!(args.subcmd, SubCmd::Batch { ref manifest, name: None } if manifest == "course.json"));
    }

    #[test]
    fn rejects_bad_quality_and_url() {
        assert!(Args::try_parse_from(["vidfetch", "--quality", "4k", "cache", "list"]).is_err());
        assert!(Args::try_parse_from(["vidfetch", "download", "ftp://x/y.mp4", "out.mp4"]).is_err());
    }

    #[test]
    fn failures_make_report_an_error() {
        let ok = BatchSummary { total: 2, succeeded: 2, ..BatchSummary::default() };
        assert!(report("course", &ok).is_ok());

        let failed = BatchSummary { total: 2, succeeded: 1, failed: 1, ..BatchSummary::default() };
        assert!(report("course", &failed).is_err());
    }
}
