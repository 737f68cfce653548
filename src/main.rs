use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use reco_lite::config::{EngineFile, RecommenderConfig, ScheduleConfig, WatchdogConfig};
use reco_lite::model::{ProductId, ProductPair, Recommendation};
use reco_lite::reader::{JsonLinesReader, MemorySource};
use reco_lite::shutdown::install_shutdown_handler;
use reco_lite::updater::JobState;
use reco_lite::{schedule, RecommendSettings, Recommender, UpdateJob};

#[derive(Parser, Debug)]
#[command(name = "reco-lite")]
#[command(version)]
#[command(about = "Recommendation model builder and server with background updates")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Build a model from JSON-lines files and save it
    Rebuild {
        #[command(flatten)]
        source: SourceArgs,

        /// Where to write the model file
        #[arg(long, short = 'm')]
        model: PathBuf,
    },

    /// Recommend products for one consumer from a saved model
    Recommend {
        #[command(flatten)]
        query: QueryArgs,

        /// Consumer ID
        consumer: u64,

        /// Candidate product IDs (comma-separated)
        #[arg(long, value_delimiter = ',', required = true)]
        candidates: Vec<ProductId>,
    },

    /// Products similar to a set of seed products, from a saved model
    Similar {
        #[command(flatten)]
        query: QueryArgs,

        /// Seed product IDs (comma-separated)
        #[arg(long, value_delimiter = ',', required = true)]
        seeds: Vec<ProductId>,

        /// Candidate product IDs (comma-separated)
        #[arg(long, value_delimiter = ',', required = true)]
        candidates: Vec<ProductId>,
    },

    /// Suggest the next product pair to show a consumer
    NextPair {
        #[command(flatten)]
        query: QueryArgs,

        /// Consumer ID
        consumer: u64,
    },

    /// Keep a model fresh from growing JSON-lines files until interrupted
    ServeDemo {
        #[command(flatten)]
        source: SourceArgs,

        /// Model file to load at start and save to periodically
        #[arg(long, short = 'm')]
        model: PathBuf,

        /// Seconds between incremental updates
        #[arg(long, default_value = "300")]
        update_secs: u64,

        /// Seconds between model saves
        #[arg(long, default_value = "3600")]
        save_secs: u64,
    },
}

#[derive(clap::Args, Debug)]
struct SourceArgs {
    /// Events file, one JSON object per line
    #[arg(long, short = 'e')]
    events: PathBuf,

    /// Products file, one JSON object per line
    #[arg(long, short = 'p')]
    products: Option<PathBuf>,

    /// Events per batch
    #[arg(long, default_value = "1000")]
    batch_size: usize,

    /// Engine selection (JSON)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
struct QueryArgs {
    /// Model file to load
    #[arg(long, short = 'm')]
    model: PathBuf,

    /// Engine selection (JSON); must match the one the model was built with
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Maximum number of results
    #[arg(long, short = 'n', default_value = "10")]
    max_results: usize,

    /// Shuffle results with equal scores
    #[arg(long)]
    randomize: bool,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct RecommendOutput<'a> {
    generation: u64,
    results: &'a [Recommendation],
}

// =============================================================================
// Helper Functions
// =============================================================================

fn load_engine_config(
    name: &str,
    path: Option<&Path>,
) -> Result<RecommenderConfig, Box<dyn std::error::Error>> {
    let mut config = RecommenderConfig::new(name);
    if let Some(path) = path {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("{}: {}", path.display(), e))?;
        let file: EngineFile = serde_json::from_str(&text)
            .map_err(|e| format!("{}: {}", path.display(), e))?;
        config = config.with_scoring(file.scoring).with_decision(file.decision);
        if let Some(excluded) = file.excluded_events {
            config = config.with_excluded_events(excluded);
        }
    }
    Ok(config)
}

fn json_reader(source: &SourceArgs) -> JsonLinesReader {
    let reader = JsonLinesReader::new(&source.events, source.batch_size);
    match &source.products {
        Some(products) => reader.with_products(products),
        None => reader,
    }
}

fn check_job(job: &UpdateJob, state: &JobState) -> Result<(), Box<dyn std::error::Error>> {
    if state.is_success() {
        return Ok(());
    }
    Err(format!(
        "{} job {}: {}",
        job,
        state.status,
        state.error.as_deref().unwrap_or("no error recorded")
    )
    .into())
}

/// Start a one-shot instance with the given model loaded.
async fn open_model(query: &QueryArgs) -> Result<Recommender, Box<dyn std::error::Error>> {
    if !query.model.is_file() {
        return Err(format!("model file not found: {}", query.model.display()).into());
    }
    let config = load_engine_config("cli", query.config.as_deref())?
        .with_watchdog(WatchdogConfig::disabled());
    // No live source: a failed load falls back to an empty rebuild, which is
    // reported as an empty model below.
    let recommender = Recommender::start(config, MemorySource::new().reader(1));
    let job = UpdateJob::Load(query.model.clone());
    let state = recommender.schedule_and_wait(job.clone()).await?;
    check_job(&job, &state)?;
    let status = recommender.status().await;
    if status.events == 0 && status.products == 0 {
        return Err(format!("model {} is empty or unreadable", query.model.display()).into());
    }
    Ok(recommender)
}

fn settings(query: &QueryArgs) -> RecommendSettings {
    let settings = RecommendSettings::top(query.max_results);
    if query.randomize {
        settings.randomized()
    } else {
        settings
    }
}

fn print_results(
    generation: u64,
    results: &[Recommendation],
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match output {
        OutputFormat::Json => {
            let out = RecommendOutput {
                generation,
                results,
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Table => {
            if results.is_empty() {
                println!("No eligible candidates.");
                return Ok(());
            }
            println!("{:<6} {:<12} {:<10} EXPLANATION", "RANK", "PRODUCT", "SCORE");
            println!("{}", "-".repeat(60));
            for (rank, rec) in results.iter().enumerate() {
                println!(
                    "{:<6} {:<12} {:<10.4} {}",
                    rank + 1,
                    rec.product,
                    rec.score,
                    rec.explanation.as_deref().unwrap_or("-")
                );
            }
            println!();
            println!("Model generation {}", generation);
        }
    }
    Ok(())
}

async fn generation(recommender: &Recommender) -> u64 {
    recommender
        .snapshot()
        .await
        .map_or(0, |snapshot| snapshot.generation())
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn handle_rebuild(source: SourceArgs, model: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_engine_config("cli", source.config.as_deref())?
        .with_model_path(&model)
        .with_watchdog(WatchdogConfig::disabled());
    let recommender = Recommender::start(config, json_reader(&source));

    let full = recommender.schedule_and_wait(UpdateJob::Full).await?;
    check_job(&UpdateJob::Full, &full)?;
    let save = UpdateJob::Save(model.clone());
    let saved = recommender.schedule_and_wait(save.clone()).await?;
    check_job(&save, &saved)?;

    let status = recommender.status().await;
    recommender.shutdown().await;
    println!("Model written to {}", model.display());
    println!("Products:  {}", status.products);
    println!("Consumers: {}", status.consumers);
    println!("Events:    {}", status.events);
    Ok(())
}

async fn handle_recommend(
    query: QueryArgs,
    consumer: u64,
    candidates: Vec<ProductId>,
) -> Result<(), Box<dyn std::error::Error>> {
    let recommender = open_model(&query).await?;
    let results = recommender
        .recommend(consumer, &candidates, &settings(&query))
        .await?;
    let generation = generation(&recommender).await;
    recommender.shutdown().await;
    print_results(generation, &results, &query.output)
}

async fn handle_similar(
    query: QueryArgs,
    seeds: Vec<ProductId>,
    candidates: Vec<ProductId>,
) -> Result<(), Box<dyn std::error::Error>> {
    let recommender = open_model(&query).await?;
    let results = recommender
        .similar(&seeds, &candidates, &settings(&query))
        .await?;
    let generation = generation(&recommender).await;
    recommender.shutdown().await;
    print_results(generation, &results, &query.output)
}

async fn handle_next_pair(query: QueryArgs, consumer: u64) -> Result<(), Box<dyn std::error::Error>> {
    let recommender = open_model(&query).await?;
    let pair = recommender.get_next_pair(consumer).await?;
    let profiling = recommender.needs_profiling(consumer).await?;
    recommender.shutdown().await;

    match query.output {
        OutputFormat::Json => {
            #[derive(Serialize)]
            struct NextPairOutput {
                consumer: u64,
                needs_profiling: bool,
                pair: Option<ProductPair>,
            }
            let out = NextPairOutput {
                consumer,
                needs_profiling: profiling,
                pair,
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Table => {
            println!("Consumer:        {}", consumer);
            println!("Needs profiling: {}", profiling);
            match pair {
                Some(pair) => println!("Next pair:       {} vs {}", pair.first, pair.second),
                None => println!("Next pair:       (fewer than two unseen products)"),
            }
        }
    }
    Ok(())
}

async fn run_serve_demo(
    source: SourceArgs,
    model: PathBuf,
    update_secs: u64,
    save_secs: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = install_shutdown_handler();
    let config = load_engine_config("demo", source.config.as_deref())?
        .with_model_path(&model)
        .with_schedule(ScheduleConfig {
            update_interval: Duration::from_secs(update_secs),
            save_interval: Duration::from_secs(save_secs),
            ..Default::default()
        });
    // Stopped explicitly below so the final save can still run after a signal.
    let recommender = Arc::new(Recommender::start(config, json_reader(&source)));
    let escalation = recommender.escalation();

    let first = recommender.initialize().await?;
    tracing::info!(job_id = %first.id(), kind = %first.kind(), "Initial build scheduled");
    let trigger = schedule::spawn_periodic(recommender.clone(), shutdown.clone());

    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = escalation.cancelled() => {
            tracing::error!("Watchdog escalated, stopping for restart");
        }
    }

    if !escalation.is_cancelled() && recommender.is_ready().await {
        match recommender.persist_now().await {
            Ok(handle) => {
                let state = handle.wait_until_finished().await;
                tracing::info!(status = %state.status, "Final save finished");
            }
            Err(e) => tracing::warn!(error = %e, "Final save not scheduled"),
        }
    }
    recommender.shutdown().await;
    if let Err(e) = trigger.await {
        tracing::warn!(error = %e, "Periodic trigger ended abnormally");
    }

    if escalation.is_cancelled() {
        return Err("watchdog escalation".into());
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Commands::Rebuild { source, model } => {
            handle_rebuild(source, model).await?;
        }
        Commands::Recommend {
            query,
            consumer,
            candidates,
        } => {
            handle_recommend(query, consumer, candidates).await?;
        }
        Commands::Similar {
            query,
            seeds,
            candidates,
        } => {
            handle_similar(query, seeds, candidates).await?;
        }
        Commands::NextPair { query, consumer } => {
            handle_next_pair(query, consumer).await?;
        }
        Commands::ServeDemo {
            source,
            model,
            update_secs,
            save_secs,
        } => {
            run_serve_demo(source, model, update_secs, save_secs).await?;
        }
    }

    Ok(())
}
