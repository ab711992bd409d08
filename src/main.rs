//! # EMA — SMS prompt scheduler
//!
//! Command-line entrypoints around the engine. The periodic scan is meant
//! to be driven by an external cron (`ema scan` every 5 minutes) or by the
//! built-in loop (`ema run`).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ema_channels::TwilioTransport;
use ema_core::config::{AppConfig, StudyConfig};
use ema_engine::survey::RenderOutcome;
use ema_engine::{EmaEngine, SimpleRuleEvaluator, SqliteStore, run_tick_loop};

#[derive(Parser)]
#[command(name = "ema", version, about = "SMS-based EMA prompt scheduler and notifier")]
struct Cli {
    /// Settings file (defaults to ~/.ema/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scan loop in-process
    Run {
        /// Minutes between sweeps (defaults to the configured interval)
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Run one sweep and exit (cron entrypoint)
    Scan,
    /// Evaluate window eligibility for a record (record-saved trigger)
    RecordSaved { record: String },
    /// Mark a survey submitted
    SurveySubmit { record: String, instance: i64 },
    /// Check whether a survey is still open for a participant
    SurveyRender { record: String, instance: i64 },
    /// List a record's windows with instance counts
    Summary { record: String },
    /// Delete all incomplete instances for a record/window
    Clear { record: String, window: String },
    /// Parse and validate the study configuration
    ValidateConfig,
    /// Seed one record data field (reference store only)
    SetField {
        record: String,
        event: u64,
        field: String,
        value: String,
    },
}

fn build_engine(app: AppConfig) -> Result<EmaEngine> {
    let study_raw = std::fs::read_to_string(&app.study_config_path).with_context(|| {
        format!("failed to read study config {}", app.study_config_path.display())
    })?;
    let study = StudyConfig::from_json(&study_raw)?;

    let store = Arc::new(SqliteStore::open(&app.database_path)?);
    let rules = Arc::new(SimpleRuleEvaluator::new(store.clone(), app.project.clone()));
    let transport = Arc::new(TwilioTransport::new(app.transport.clone()));

    Ok(EmaEngine {
        project: app.project.clone(),
        app,
        study,
        repo: store.clone(),
        records: store,
        rules,
        transport,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .init();

    let app = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };

    match cli.command {
        Command::ValidateConfig => {
            let raw = std::fs::read_to_string(&app.study_config_path).with_context(|| {
                format!("failed to read {}", app.study_config_path.display())
            })?;
            let study = StudyConfig::from_json(&raw)?;
            println!(
                "ok: {} windows, {} schedules",
                study.windows.len(),
                study.schedules.len()
            );
        }
        Command::Run { interval } => {
            let minutes = interval.unwrap_or(app.scan_interval_minutes);
            let engine = build_engine(app)?;
            run_tick_loop(Arc::new(engine), minutes).await;
        }
        Command::Scan => {
            let engine = build_engine(app)?;
            let outcome = engine.tick().await?;
            println!(
                "{} examined, {} updated, {} sent, {} errors",
                outcome.examined, outcome.updated, outcome.sent, outcome.errors
            );
        }
        Command::RecordSaved { record } => {
            let engine = build_engine(app)?;
            engine.record_saved(&record).await?;
        }
        Command::SurveySubmit { record, instance } => {
            let engine = build_engine(app)?;
            engine.survey_submit(&record, instance).await?;
            println!("instance {record}-{instance} completed");
        }
        Command::SurveyRender { record, instance } => {
            let engine = build_engine(app)?;
            match engine.survey_render(&record, instance).await? {
                RenderOutcome::Open => println!("open"),
                RenderOutcome::Closed(message) => println!("closed: {message}"),
            }
        }
        Command::Summary { record } => {
            let engine = build_engine(app)?;
            for summary in engine.window_summary(&record).await? {
                println!(
                    "{}: {} instances ({} incomplete)",
                    summary.window_name, summary.total, summary.incomplete
                );
            }
        }
        Command::Clear { record, window } => {
            let engine = build_engine(app)?;
            let deleted = engine.clear_window(&record, &window).await?;
            println!("deleted {} instances", deleted.len());
        }
        Command::SetField { record, event, field, value } => {
            let store = SqliteStore::open(&app.database_path)?;
            store.set_record_field(&record, event, &field, &value)?;
        }
    }
    Ok(())
}
