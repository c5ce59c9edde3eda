use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, ValueEnum};

use weir::export::{CorpusExporter, ExportScheme};
use weir::ingest::{
    ContentExtractor, Coordinator, Fetcher, SanitizeLevel, SanitizePolicy, Scheduler,
};
use weir::storage::{Database, FeedRegistration, FeedStatus, StorageError};
use weir::Config;

/// On-disk file format for `--export`.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum ExportFormat {
    Json,
    Html,
}

impl From<ExportFormat> for ExportScheme {
    fn from(format: ExportFormat) -> Self {
        match format {
            ExportFormat::Json => ExportScheme::Json,
            ExportFormat::Html => ExportScheme::Html,
        }
    }
}

/// Sanitization applied to exported HTML bodies.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum SanitizeMode {
    Raw,
    Safe,
    Text,
}

impl From<SanitizeMode> for SanitizeLevel {
    fn from(mode: SanitizeMode) -> Self {
        match mode {
            SanitizeMode::Raw => SanitizeLevel::Raw,
            SanitizeMode::Safe => SanitizeLevel::Safe,
            SanitizeMode::Text => SanitizeLevel::Text,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "weir",
    about = "Scheduled RSS/Atom ingestion into a deduplicated article corpus.\n\
             Without a mode flag, runs the ingestion scheduler until interrupted."
)]
struct Args {
    /// Configuration file (TOML)
    #[arg(long, value_name = "FILE", default_value = "weir.toml")]
    config: PathBuf,

    /// Import feeds from an OPML file, then continue into the selected mode
    #[arg(long, value_name = "FILE")]
    import: Option<PathBuf>,

    /// Write the registered feeds to an OPML file and exit
    #[arg(long, value_name = "FILE")]
    export_opml: Option<PathBuf>,

    /// Export the stored corpus into a directory and exit
    #[arg(long, value_name = "DIR")]
    export: Option<PathBuf>,

    /// File format for --export
    #[arg(long, value_enum, default_value_t = ExportFormat::Json, requires = "export")]
    format: ExportFormat,

    /// Sanitize level for --export HTML bodies
    #[arg(long, value_enum, default_value_t = SanitizeMode::Safe, requires = "export")]
    sanitize: SanitizeMode,

    /// Limit --export to these categories (repeatable)
    #[arg(long, value_name = "CATEGORY", requires = "export")]
    category: Vec<String>,

    /// Run a single ingestion pass and exit
    #[arg(long)]
    once: bool,

    /// Print feed health and recent ingestion jobs, then exit
    #[arg(long)]
    status: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config = Config::load(&args.config).context("Failed to load configuration")?;

    // One connection per concurrent feed worker, plus one for job bookkeeping.
    let db = match Database::open(&config.database_path, config.concurrency as u32 + 1).await {
        Ok(db) => db,
        Err(StorageError::InstanceLocked) => {
            eprintln!(
                "Error: Another instance of weir appears to be running. Please close it and try again."
            );
            std::process::exit(1);
        }
        Err(e) => {
            return Err(anyhow::anyhow!("Failed to open database: {}", e));
        }
    };

    if let Some(import_file) = &args.import {
        let path = import_file
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in OPML path"))?;
        let registrations = weir::ingest::parse_opml(path)
            .await
            .context("Failed to parse OPML file")?;
        if registrations.is_empty() {
            eprintln!(
                "Warning: no usable feeds found in {}",
                import_file.display()
            );
        } else {
            db.register_feeds(&registrations)
                .await
                .context("Failed to register imported feeds")?;
            println!(
                "Imported {} feeds from {}",
                registrations.len(),
                import_file.display()
            );
        }
    }

    if let Some(dest) = &args.export_opml {
        let feeds = db.all_feeds().await.context("Failed to list feeds")?;
        let registrations: Vec<FeedRegistration> = feeds
            .into_iter()
            .map(|feed| FeedRegistration {
                url: feed.url,
                title: Some(feed.title),
                tags: feed.tags,
                extra: feed.extra,
            })
            .collect();
        weir::ingest::export_to_file(&registrations, dest)
            .context("Failed to write OPML file")?;
        println!(
            "Exported {} feeds to {}",
            registrations.len(),
            dest.display()
        );
        return Ok(());
    }

    if let Some(dir) = &args.export {
        let policy = SanitizePolicy::new(config.allowed_tags.clone());
        let exporter = CorpusExporter::new(db, args.format.into(), args.sanitize.into(), policy);
        let filter = (!args.category.is_empty()).then_some(args.category.as_slice());
        let summary = exporter
            .export(dir, filter)
            .await
            .context("Corpus export failed")?;
        println!(
            "Exported {} posts from {} feeds into {} categories under {}",
            summary.posts,
            summary.feeds,
            summary.categories,
            dir.display()
        );
        return Ok(());
    }

    if args.status {
        let feeds = db.all_feeds().await.context("Failed to list feeds")?;
        let posts = db.post_count().await.context("Failed to count posts")?;
        println!("{} feeds registered, {} posts stored", feeds.len(), posts);

        let errored: Vec<_> = feeds
            .iter()
            .filter(|f| f.status == FeedStatus::Error)
            .collect();
        if !errored.is_empty() {
            println!("{} feeds failing:", errored.len());
            for feed in errored {
                println!(
                    "  {} ({} consecutive failures): {}",
                    feed.url,
                    feed.consecutive_errors,
                    feed.last_error.as_deref().unwrap_or("unknown error")
                );
            }
        }

        let since = Utc::now() - chrono::Duration::days(7);
        let jobs = db
            .recent_jobs(since, 10)
            .await
            .context("Failed to query jobs")?;
        if jobs.is_empty() {
            println!("No ingestion jobs in the last 7 days.");
        } else {
            println!("Recent jobs:");
            for job in jobs {
                let finished = job
                    .finished_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "in progress".to_string());
                println!(
                    "  #{} {:?} started {} finished {}",
                    job.id,
                    job.status,
                    job.started_at.format("%Y-%m-%d %H:%M:%S"),
                    finished
                );
            }
        }
        return Ok(());
    }

    let fetcher = Fetcher::from_config(&config).context("Failed to build HTTP client")?;
    let policy = SanitizePolicy::new(config.allowed_tags.clone());
    let extractor = ContentExtractor::new(fetcher.clone(), policy);
    let coordinator = Coordinator::new(db, fetcher, extractor, config.concurrency);

    if args.once {
        let cancel = AtomicBool::new(false);
        let summary = coordinator
            .run_once(&cancel)
            .await
            .context("Ingestion pass failed")?;
        println!(
            "Job #{}: {} feeds processed ({} unchanged, {} failed), {} new posts, {} duplicates, {} failed entries",
            summary.job_id,
            summary.feeds_processed,
            summary.feeds_unchanged,
            summary.feeds_failed,
            summary.new_posts,
            summary.duplicates,
            summary.failed
        );
        return Ok(());
    }

    let scheduler = Scheduler::new(
        coordinator,
        Duration::from_secs(config.tick_interval_secs),
    );
    let handle = scheduler.spawn();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    if handle.is_running() {
        tracing::info!("Letting the in-flight ingestion tick wind down");
    }
    handle.shutdown().await;

    println!("Goodbye!");
    Ok(())
}
