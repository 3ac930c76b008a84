//! Dataplane CLI: run one pipeline stage per invocation.
//!
//! Commands:
//! - `universe-sync`: dp0, publish the mapped universe and its drift report
//! - `eod-snapshot`: dp1, end-of-day bars for one exchange
//! - `corporate-actions`: dp2, splits and dividends
//! - `adjusted-series`: dp3, adjusted close series with lineage
//! - `news-signals`: dp5, headlines for the day's top movers
//! - `retention-cleanup`: remove expired mirrors and drift reports
//! - `validate-policies`: check every policy document and the universe
//!
//! A completed stage prints its one-line summary on stdout. A stage skipped
//! because another run holds its lock prints `LOCK_HELD <expires_at>` and
//! exits 0. Any fatal error prints `STAGE_FAILED:<message>` on stderr and
//! exits 1. Logs always go to stderr.

use anyhow::{Context, Result};
use chrono::{NaiveDate, SecondsFormat};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use dataplane_core::fetch::{ReqwestTransport, ThreadSleeper};
use dataplane_core::policy::POLICY_DIR;
use dataplane_core::{run_cleanup, PolicySet, RunContext};
use dataplane_runner::{
    AdjustedSeries, CorporateActions, EodSnapshot, NewsSignals, Secrets, Stage, StageOutcome, StageRunner,
    Universe, UniverseSync,
};

#[derive(Parser)]
#[command(name = "dataplane", about = "Dataplane CLI: fetch, validate and publish market data stages")]
struct Cli {
    /// Run root holding `policies/`, `mirrors/` and `public/`.
    #[arg(long, env = "RV_ROOT", default_value = ".", global = true)]
    root: PathBuf,

    /// Emit logs as newline-delimited JSON.
    #[arg(long, default_value_t = false, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// dp0: publish the mapped universe and report drift against the source list.
    UniverseSync,
    /// dp1: end-of-day snapshot for one exchange.
    EodSnapshot {
        /// Exchange code from the symbol mapping.
        #[arg(long, default_value = "US")]
        exchange: String,

        /// Trading date (YYYY-MM-DD). Defaults to the latest weekday.
        #[arg(long)]
        trading_date: Option<NaiveDate>,
    },
    /// dp2: splits and dividends for every mapped symbol.
    CorporateActions {
        /// First event date requested (YYYY-MM-DD). Defaults to 1990-01-01.
        #[arg(long)]
        from: Option<NaiveDate>,
    },
    /// dp3: adjusted close series with input lineage.
    AdjustedSeries,
    /// dp5: news signals for the day's top movers.
    NewsSignals,
    /// Remove mirrors and drift reports past their retention window.
    RetentionCleanup,
    /// Check every policy document and the symbol mapping, reporting all failures.
    ValidatePolicies,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("STAGE_FAILED:{e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Logs go to stderr so stdout carries only the summary line.
fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let layer = fmt::layer().with_target(false).with_writer(std::io::stderr);

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(layer.json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(layer)
            .try_init()
            .ok();
    }
}

fn run(cli: Cli) -> Result<()> {
    let stage: Box<dyn Stage> = match cli.command {
        Commands::ValidatePolicies => return validate_policies(&cli.root),
        Commands::RetentionCleanup => return retention_cleanup(&cli.root),
        Commands::UniverseSync => Box::new(UniverseSync),
        Commands::EodSnapshot {
            exchange,
            trading_date,
        } => Box::new(EodSnapshot::new(&exchange, trading_date)),
        Commands::CorporateActions { from } => {
            Box::new(from.map(CorporateActions::new).unwrap_or_default())
        }
        Commands::AdjustedSeries => Box::new(AdjustedSeries),
        Commands::NewsSignals => Box::new(NewsSignals),
    };
    run_stage(&cli.root, stage.as_ref())
}

fn run_stage(root: &Path, stage: &dyn Stage) -> Result<()> {
    let policies = PolicySet::load(root)
        .with_context(|| format!("loading policies under {}", root.display()))?;
    let fingerprint = policies.fingerprint().context("fingerprinting policies")?;
    let run = RunContext::from_env(root, Some(&fingerprint));
    let transport = ReqwestTransport::new()?;
    let sleeper = ThreadSleeper;

    info!(stage = stage.id(), run_id = %run.run_id, commit = %run.commit, "run starting");
    let outcome = StageRunner::new(&run, &policies, &transport, &sleeper)
        .with_secrets(Secrets::from_env())
        .run(stage)?;

    match outcome {
        StageOutcome::Completed(report) => println!("{}", report.summary),
        StageOutcome::LockHeld(lock) => println!(
            "LOCK_HELD {}",
            lock.expires_at.to_rfc3339_opts(SecondsFormat::Millis, true)
        ),
    }
    Ok(())
}

fn retention_cleanup(root: &Path) -> Result<()> {
    let policies = PolicySet::load(root)
        .with_context(|| format!("loading policies under {}", root.display()))?;
    let fingerprint = policies.fingerprint().context("fingerprinting policies")?;
    let run = RunContext::from_env(root, Some(&fingerprint));
    info!(run_id = %run.run_id, strategy = ?policies.retention.active_strategy, "retention cleanup starting");
    let report = run_cleanup(&run, &policies.retention)?;
    println!("{}", report.summary());
    Ok(())
}

fn validate_policies(root: &Path) -> Result<()> {
    let mut failures = PolicySet::check_dir(&root.join(POLICY_DIR));
    match Universe::load(root) {
        Ok(universe) if universe.is_empty() => failures.push("UNIVERSE_EMPTY".to_string()),
        Ok(_) => {}
        Err(e) => failures.push(e.to_string()),
    }

    if failures.is_empty() {
        println!("POLICIES_OK");
        return Ok(());
    }
    for failure in &failures {
        eprintln!("{failure}");
    }
    anyhow::bail!("POLICY_INVALID:{} problem(s)", failures.len())
}
