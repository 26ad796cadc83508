mod input;
mod logging;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use pricewatch_core::app::{DataChangedFn, RunController, RunSummary};
use pricewatch_core::config::ScraperConfig;
use pricewatch_core::domain::{Field, ProgressFn, RankedRow};
use pricewatch_core::impls::{ChromiumLauncher, HttpImageFetcher, SqlitePriceStore};
use pricewatch_core::ports::{ImageFetcher, PriceStore};
use pricewatch_core::queue::{DeadTask, read_checkpoint};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "pricewatch", version, about = "Competitor price ranks from partsbooking.ru")]
struct Cli {
    /// Debug logging for pricewatch crates (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scrape every (part, brand) row of a CSV file
    Run(RunArgs),
    /// Print the stored ranks for one part number
    Show(ShowArgs),
    /// List dead-lettered tasks from the checkpoint
    Dead(DeadArgs),
}

#[derive(Args, Debug)]
struct ConfigArgs {
    /// JSON config file; every field is optional
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// CSV with part and brand columns
    #[arg(long)]
    input: PathBuf,

    #[command(flatten)]
    config: ConfigArgs,

    /// Number of concurrent pages
    #[arg(long)]
    workers: Option<usize>,

    /// Print the run summary as JSON
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug)]
struct ShowArgs {
    #[arg(long)]
    part: String,

    #[command(flatten)]
    config: ConfigArgs,

    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug)]
struct DeadArgs {
    /// Checkpoint file (defaults to the configured path)
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    #[command(flatten)]
    config: ConfigArgs,

    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct DeadReport<'a> {
    checkpoint: &'a Path,
    outstanding: usize,
    dead: &'a [DeadTask],
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    let _ = dotenv::dotenv();
    let cli = Cli::parse();
    logging::init_tracing(cli.verbose)?;

    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Show(args) => show(args).await,
        Command::Dead(args) => dead(args).await,
    }
}

fn load_config(args: &ConfigArgs) -> Result<ScraperConfig> {
    let mut config = match &args.config {
        Some(path) => ScraperConfig::from_json_file(path)?,
        None => ScraperConfig::default(),
    };
    config.apply_env();
    Ok(config)
}

async fn open_store(config: &ScraperConfig) -> Result<SqlitePriceStore> {
    SqlitePriceStore::open(&config.database_path)
        .await
        .with_context(|| format!("opening database {}", config.database_path.display()))
}

async fn run(args: RunArgs) -> Result<()> {
    let mut config = load_config(&args.config)?;
    if let Some(workers) = args.workers {
        config.workers = workers;
    }

    let rows = input::read_rows(&args.input)?;
    let store: Arc<dyn PriceStore> = Arc::new(open_store(&config).await?);
    let launcher = Arc::new(ChromiumLauncher::new(&config));
    let images: Option<Arc<dyn ImageFetcher>> = if config.images.enabled {
        let fetcher = HttpImageFetcher::new(&config.images, config.proxy.as_ref())
            .context("building image client")?;
        Some(Arc::new(fetcher))
    } else {
        None
    };
    let controller = RunController::new(config, store, launcher, images)?;

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight tasks");
            let _ = cancel_tx.send(true);
        }
    });

    let progress: ProgressFn = Arc::new(|percent: Option<f64>, message: &str| match percent {
        Some(percent) => info!(percent, "{message}"),
        None => info!("{message}"),
    });
    let on_data_changed: DataChangedFn = Arc::new(|| debug!("price table updated"));

    let summary = controller
        .run(rows, progress, on_data_changed, cancel_rx)
        .await
        .context("run failed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!("run {}", summary.run_id);
    println!(
        "  input {}  unsupported {}  already stored {}  resumed {}  queued {}",
        summary.total_input, summary.unsupported, summary.already_stored, summary.resumed, summary.queued
    );
    println!(
        "  succeeded {}  skipped {}  requeued {}  dead {}",
        summary.succeeded, summary.skipped, summary.requeued, summary.dead_lettered
    );
    println!(
        "  rows written {}  rows dropped {}  elapsed {:.1}s{}",
        summary.rows_written,
        summary.rows_dropped,
        summary.elapsed_ms as f64 / 1000.0,
        if summary.cancelled { "  (cancelled)" } else { "" }
    );
    for dead in &summary.dead {
        println!("  dead: {} ({} attempts): {}", dead.task, dead.task.attempts, dead.error);
    }
}

async fn show(args: ShowArgs) -> Result<()> {
    let config = load_config(&args.config)?;
    let store = open_store(&config).await?;
    let rows = store
        .find_by_part(args.part.trim())
        .await
        .context("reading prices")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else if rows.is_empty() {
        println!("no rows for {}", args.part.trim());
    } else {
        for row in &rows {
            println!("{}", format_row(row));
        }
    }
    Ok(())
}

fn cell(field: &Option<Field>) -> String {
    field.as_ref().map(Field::to_string).unwrap_or_else(|| "-".into())
}

fn code(code: &Option<String>) -> &str {
    code.as_deref().unwrap_or("-")
}

fn format_row(row: &RankedRow) -> String {
    format!(
        "{} / {}: rank {} at {} | leader {} @ {} | over {} @ {} | under {} @ {}",
        row.brand_name,
        row.part_number,
        cell(&row.rank_pos),
        cell(&row.our_price),
        code(&row.leader_code),
        cell(&row.leader_price),
        code(&row.over_code),
        cell(&row.over_price),
        code(&row.under_code),
        cell(&row.under_price),
    )
}

async fn dead(args: DeadArgs) -> Result<()> {
    let config = load_config(&args.config)?;
    let path = args.checkpoint.unwrap_or(config.checkpoint_path);
    print_dead(&path, args.json).await
}

async fn print_dead(path: &Path, json: bool) -> Result<()> {
    let Some(state) = read_checkpoint(path)
        .await
        .with_context(|| format!("reading checkpoint {}", path.display()))?
    else {
        println!("no checkpoint at {}", path.display());
        return Ok(());
    };
    if json {
        let report = DeadReport {
            checkpoint: path,
            outstanding: state.outstanding(),
            dead: &state.dead,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    if state.dead.is_empty() {
        println!("no dead-lettered tasks");
    }
    for dead in &state.dead {
        println!("{}\t{}\t{}\t{}", dead.task.brand_name, dead.task.part_number, dead.task.attempts, dead.error);
    }
    println!(
        "{} dead, {} outstanding",
        state.dead.len(),
        state.outstanding()
    );
    Ok(())
}
