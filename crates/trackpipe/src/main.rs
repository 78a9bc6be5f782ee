//! # trackpipe CLI
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `trackpipe init` | Create the SQLite database and its tables |
//! | `trackpipe transform <key>` | Transform a raw object into the transformed bucket |
//! | `trackpipe load <key>` | Load a transformed object in batched transactions |
//! | `trackpipe query '<json>'` | Run an analytical query |
//! | `trackpipe stats` | Show stored tracks and load progress |
//! | `trackpipe serve` | Start the HTTP invocation gateway |
//!
//! ## Examples
//!
//! ```bash
//! trackpipe init --config ./config/trackpipe.toml
//! trackpipe transform spotify_2023.csv
//! trackpipe load spotify_2023_transformed.csv --batch-size 500
//! trackpipe query --action top_artists --metric energy --limit 5
//! trackpipe query '{"action": "songs_filtered", "min_popularity": 80}'
//! ```
//!
//! Logs go to stderr (`LOG_LEVEL`, default `info`); command results go to
//! stdout as JSON.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use trackpipe::config::{self, Config, MAX_BATCH_SIZE};
use trackpipe::event::object_from_event;
use trackpipe::load::{run_load, LoadOptions};
use trackpipe::object_store::{self, ObjectRef, ObjectStore};
use trackpipe::query::run_query;
use trackpipe::transform::run_transform;
use trackpipe::{migrate, server, stats};
use trackpipe_core::query::QueryRequest;

/// trackpipe: streaming transform-and-load pipeline for track datasets.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(name = "trackpipe", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/trackpipe.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Where a transform or load reads from.
#[derive(clap::Args)]
struct ObjectArgs {
    /// Object key.
    key: Option<String>,

    /// Bucket; defaults to the configured raw/transformed bucket.
    #[arg(long)]
    bucket: Option<String>,

    /// Full invocation event as JSON (`{bucket, key}` or an S3 notification).
    #[arg(long, conflicts_with_all = ["key", "bucket"])]
    event: Option<String>,
}

impl ObjectArgs {
    fn resolve(&self, default_bucket: &str) -> anyhow::Result<ObjectRef> {
        let event = match &self.event {
            Some(raw) => serde_json::from_str(raw).context("--event is not valid JSON")?,
            None => json!({ "bucket": self.bucket, "key": self.key }),
        };
        Ok(object_from_event(&event, default_bucket)?)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it again is safe.
    Init,

    /// Normalize and enrich a raw object into the transformed bucket.
    Transform {
        #[command(flatten)]
        object: ObjectArgs,
    },

    /// Load a transformed object into the store.
    ///
    /// Resumes from the source's checkpoint unless `--full` is given.
    Load {
        #[command(flatten)]
        object: ObjectArgs,

        /// Ignore the checkpoint and reload every batch.
        #[arg(long)]
        full: bool,

        /// Start at this batch index instead of the checkpoint's.
        #[arg(long)]
        resume_from: Option<u64>,

        /// Rows per batch (overrides `[load].batch_size`).
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Run an analytical query.
    ///
    /// Pass a JSON request, or build one from flags.
    Query {
        /// Request as JSON, e.g. `{"action": "top_artists", "limit": 5}`.
        request: Option<String>,

        #[arg(long, conflicts_with = "request")]
        action: Option<String>,

        #[arg(long)]
        metric: Option<String>,

        #[arg(long)]
        group_by: Option<String>,

        #[arg(long)]
        category: Option<String>,

        #[arg(long)]
        min_popularity: Option<f64>,

        #[arg(long)]
        min_danceability: Option<f64>,

        #[arg(long)]
        min_energy: Option<f64>,

        #[arg(long)]
        limit: Option<i64>,
    },

    /// Show stored tracks and load progress.
    Stats,

    /// Start the HTTP invocation gateway on `[server].bind`.
    Serve,
}

fn init_logging() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("LOG_LEVEL")
        .from_env_lossy();
    // Ignore a second init (tests may have installed one).
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn objects(cfg: &Config) -> anyhow::Result<Arc<dyn ObjectStore>> {
    Ok(Arc::from(object_store::from_config(&cfg.objects)?))
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Transform { object } => {
            let input = object.resolve(&cfg.objects.raw_bucket)?;
            let report = run_transform(&cfg, objects(&cfg)?, input).await?;
            print_json(&report)?;
        }
        Commands::Load {
            object,
            full,
            resume_from,
            batch_size,
        } => {
            let mut options = LoadOptions::from_config(&cfg.load);
            if let Some(size) = batch_size {
                if !(1..=MAX_BATCH_SIZE).contains(&size) {
                    anyhow::bail!("--batch-size must be between 1 and {}", MAX_BATCH_SIZE);
                }
                options.batch_size = size;
            }
            options.full = full;
            options.resume_from = resume_from;

            let source = object.resolve(&cfg.objects.transformed_bucket)?;
            let result = run_load(&cfg, objects(&cfg)?, source, options).await?;
            print_json(&result)?;
            if !result.is_completed() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Query {
            request,
            action,
            metric,
            group_by,
            category,
            min_popularity,
            min_danceability,
            min_energy,
            limit,
        } => {
            let event = match request {
                Some(raw) => serde_json::from_str(&raw).context("request is not valid JSON")?,
                None => {
                    let mut fields = Map::new();
                    let flags = [
                        ("action", action.map(Value::from)),
                        ("metric", metric.map(Value::from)),
                        ("group_by", group_by.map(Value::from)),
                        ("category", category.map(Value::from)),
                        ("min_popularity", min_popularity.map(Value::from)),
                        ("min_danceability", min_danceability.map(Value::from)),
                        ("min_energy", min_energy.map(Value::from)),
                        ("limit", limit.map(Value::from)),
                    ];
                    for (name, value) in flags {
                        if let Some(value) = value {
                            fields.insert(name.to_string(), value);
                        }
                    }
                    Value::Object(fields)
                }
            };
            let request = QueryRequest::from_event(event)?;
            let response = run_query(&cfg, &request).await?;
            print_json(&response)?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(ExitCode::SUCCESS)
}
