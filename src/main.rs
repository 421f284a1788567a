mod browser;
mod config;
mod currency;
mod db;
mod error;
mod extract;
mod locators;
mod persist;
mod pipeline;
mod retry;
mod transform;

#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::browser::{Browser, StaticBrowser};
use crate::config::{OutputMode, Settings};
use crate::currency::{CurrencyNormalizer, FileRateStore, HttpRateSource};
use crate::locators::FileLocatorStore;
use crate::persist::Sink;
use crate::pipeline::{Outcome, Pipeline, RunReport};

#[derive(Parser)]
#[command(name = "listing_scraper", about = "Product listing scraper with USD price normalization")]
struct Cli {
    /// TOML config file (default: ./scraper.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every configured search instruction
    Run,
    /// Discard cached locators for a category and derive them again
    Calibrate {
        /// Category whose locators are rebuilt
        category: String,
    },
    /// Refresh exchange rates if needed and print them
    Rates,
    /// Show record counts per category
    Stats,
    /// Latest stored records of a category
    Records {
        category: String,
        /// Max rows to display
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    let result = match cli.command {
        Commands::Run => run(&settings).await,
        Commands::Calibrate { category } => {
            let browser = StaticBrowser::new(settings.page_load_timeout())?;
            let store = FileLocatorStore::new(&settings.storage.locator_cache_dir);
            let set = extract::recalibrate(&browser, &settings.site, &category, &store).await;
            browser.close().await;
            let set = set.with_context(|| format!("Calibration failed for {category}"))?;
            println!("Title selector: {}", set.title_selector);
            println!("Price selector: {}", set.price_selector);
            println!("Saved to {}", store.path_for(&category).display());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Rates => {
            let currency = normalizer(&settings)?;
            let table = currency.ensure_fresh_rates().await?;
            println!(
                "Base {} | fetched {} | next refresh {}",
                table.base_currency, table.fetched_at, table.next_refresh_at
            );
            for (code, rate) in &table.rates {
                println!("  {:<4} {:>14.4}", code, rate);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Stats => {
            let conn = db::connect(&settings.storage.database_path)?;
            let s = db::get_stats(&conn)?;
            println!("Websites:   {}", s.websites);
            if s.categories.is_empty() {
                println!("No records yet. Run 'run' first.");
            }
            for (category, count) in &s.categories {
                println!("{:<11} {}", format!("{category}:"), count);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Records { category, limit } => {
            let conn = db::connect(&settings.storage.database_path)?;
            db::ensure_fact_table(&conn, &category)?;
            let rows = db::fetch_records(&conn, &category, limit)?;
            if rows.is_empty() {
                println!("No records for {category}.");
                return Ok(ExitCode::SUCCESS);
            }

            println!(
                "{:>6} | {:<12} | {:<48} | {:>10} | {:<20}",
                "#", "Website", "Product", "USD", "Recorded"
            );
            println!("{}", "-".repeat(108));
            for r in &rows {
                println!(
                    "{:>6} | {:<12} | {:<48} | {:>10} | {:<20}",
                    r.id,
                    truncate(&r.website, 12),
                    truncate(&r.product_name, 48),
                    r.price_usd,
                    r.recorded_at
                );
            }
            Ok(ExitCode::SUCCESS)
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

async fn run(settings: &Settings) -> anyhow::Result<ExitCode> {
    let browser = StaticBrowser::new(settings.page_load_timeout())?;
    let locators = FileLocatorStore::new(&settings.storage.locator_cache_dir);
    let currency = normalizer(settings)?;
    let sink = match settings.output {
        OutputMode::Database => {
            let conn = db::connect(&settings.storage.database_path)?;
            db::init_schema(&conn)?;
            Sink::Database(conn)
        }
        OutputMode::Csv => Sink::Csv,
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing the current stage attempt");
            on_signal.cancel();
        }
    });

    let pb = ProgressBar::new(settings.instructions.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} {msg}")?
            .progress_chars("=> "),
    );

    println!("Running {} search instructions...", settings.instructions.len());
    let report = Pipeline::new(
        &browser,
        &settings.site,
        &settings.retry,
        &locators,
        &currency,
        &sink,
    )
    .with_cancel(cancel)
    .with_progress(pb)
    .run(&settings.instructions)
    .await;

    print_report(&report);
    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn normalizer(settings: &Settings) -> anyhow::Result<CurrencyNormalizer> {
    let cfg = &settings.currency;
    let source = HttpRateSource::new(
        cfg.rates_url.as_str(),
        Duration::from_secs(cfg.request_timeout_secs),
    )?;
    Ok(CurrencyNormalizer::new(
        Box::new(source),
        Box::new(FileRateStore::new(&cfg.cache_path)),
        cfg.allow_stale_fallback,
    ))
}

fn print_report(report: &RunReport) {
    println!(
        "{:<36} | {:<12} | {:>9} | {:<32} | {}",
        "Instruction", "State", "Persisted", "Attempts", "Reason"
    );
    println!("{}", "-".repeat(110));

    for r in &report.instructions {
        let attempts = r
            .attempts
            .iter()
            .map(|(stage, n)| format!("{stage}={n}"))
            .collect::<Vec<_>>()
            .join(" ");
        let (persisted, reason) = match &r.outcome {
            Outcome::Succeeded { persisted } => (persisted.to_string(), String::new()),
            Outcome::Failed { stage, reason } => ("-".into(), format!("{stage}: {reason}")),
            Outcome::Skipped => ("-".into(), "skipped".into()),
        };
        println!(
            "{:<36} | {:<12} | {:>9} | {:<32} | {}",
            truncate(&r.instruction, 36),
            format!("{:?}", r.state),
            persisted,
            attempts,
            reason
        );
    }

    println!(
        "\n{} succeeded, {} failed, {} skipped | {} records persisted",
        report.succeeded(),
        report.failed(),
        report.skipped(),
        report.persisted()
    );
    if let Some(cause) = &report.aborted {
        println!("Run aborted: {cause}");
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
