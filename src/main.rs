//! Isolation Lab - Transaction Isolation Test Harness
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌──────────────┐    ┌──────────┐
//! │  Config  │───▶│  Reset   │───▶│ Orchestrator │───▶│ Verifier │──┐
//! │  (YAML)  │    │ balances │    │  (N tasks)   │    │ (sum, ≥0)│  │
//! └──────────┘    └──────────┘    └──────────────┘    └──────────┘  │
//!                       ▲                repetitions × levels        │
//!                       └────────────────────────────────────────────┘
//! ```
//!
//! Exit codes: 0 invariant held, 1 invariant violated, 2 campaign aborted,
//! 3 nothing verified.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use isolation_lab::campaign::{CampaignSummary, TestCampaign, Verdict};
use isolation_lab::config::AppConfig;
use isolation_lab::db::Database;
use isolation_lab::store::TransactionalStore;

const EXIT_VIOLATION: u8 = 1;
const EXIT_FATAL: u8 = 2;
const EXIT_INCONCLUSIVE: u8 = 3;

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

fn use_json_summary() -> bool {
    std::env::args().any(|a| a == "--json")
}

#[tokio::main]
async fn main() -> ExitCode {
    let env = get_env();
    let app_config = match AppConfig::load(&env) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ {}", e);
            return ExitCode::from(EXIT_FATAL);
        }
    };
    let _log_guard = isolation_lab::logging::init_logging(&app_config);

    tracing::info!(
        git_hash = env!("GIT_HASH"),
        "Starting Isolation Lab in {} mode",
        env
    );

    let root = CancellationToken::new();
    let interrupt = root.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted - cancelling campaign");
            interrupt.cancel();
        }
    });

    match run(&app_config, root).await {
        Ok(summary) => {
            if use_json_summary() {
                match serde_json::to_string_pretty(&summary) {
                    Ok(json) => println!("{}", json),
                    Err(e) => eprintln!("❌ Failed to encode summary: {}", e),
                }
            } else {
                print_summary(&summary);
            }

            match summary.verdict() {
                Verdict::Held => ExitCode::SUCCESS,
                Verdict::Violated => ExitCode::from(EXIT_VIOLATION),
                Verdict::Inconclusive => ExitCode::from(EXIT_INCONCLUSIVE),
            }
        }
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "Campaign aborted");
            eprintln!("❌ Campaign aborted: {:#}", e);
            ExitCode::from(EXIT_FATAL)
        }
    }
}

async fn run(config: &AppConfig, root: CancellationToken) -> anyhow::Result<CampaignSummary> {
    let url = config.database_url()?;
    let db = Database::connect(&url, &config.run)
        .await
        .context("connecting to PostgreSQL")?;
    db.health_check().await.context("database health check")?;
    db.ensure_schema(&config.campaign)
        .await
        .context("preparing accounts table")?;

    let store: Arc<dyn TransactionalStore> = Arc::new(db.store());
    let campaign = TestCampaign::new(store, config.run, config.campaign.clone())?;
    let summary = campaign.run_with_token(root).await?;
    Ok(summary)
}

fn print_summary(summary: &CampaignSummary) {
    let elapsed = summary.finished_at - summary.started_at;

    println!("\n=== Isolation Lab: {} store ===", summary.store);
    println!(
        "concurrency={} attempts/batch={} repetitions={} elapsed={}ms",
        summary.run.concurrency,
        summary.run.attempts(),
        summary.run.repetitions,
        elapsed.num_milliseconds()
    );
    println!(
        "{:<18} {:>6} {:>9} {:>11} {:>10} {:>10} {:>9} {:>7} {:>10} {:>11} {:>11}",
        "isolation",
        "reps",
        "attempts",
        "transferred",
        "no-funds",
        "conflicts",
        "cancelled",
        "failed",
        "overdrawn",
        "unverified",
        "violations"
    );
    for level in &summary.levels {
        println!(
            "{:<18} {:>6} {:>9} {:>11} {:>10} {:>10} {:>9} {:>7} {:>10} {:>11} {:>11}",
            level.isolation.as_str(),
            level.repetitions,
            level.attempted,
            level.transferred,
            level.insufficient_funds,
            level.conflict_failures,
            level.cancelled,
            level.failed,
            level.over_withdrawals,
            level.unverified + level.abandoned,
            level.invariant_violations
        );
    }

    if summary.timed_out {
        println!("⚠️  Deadline reached before every repetition ran");
    }
    let unverified = summary.total_unverified();
    if unverified > 0 {
        println!(
            "⚠️  {} repetition(s) never verified ({} verified)",
            unverified,
            summary.total_verified()
        );
    }

    match summary.verdict() {
        Verdict::Violated => {
            println!("❌ {} invariant violation(s)", summary.total_violations());
            for level in summary.levels.iter().filter(|l| l.invariant_violations > 0) {
                for v in &level.violations {
                    println!(
                        "   {} rep {}: source={} dest={} total={}",
                        level.isolation,
                        v.repetition,
                        v.snapshot.source_balance,
                        v.snapshot.dest_balance,
                        v.snapshot.total()
                    );
                }
            }
        }
        Verdict::Inconclusive => println!("❓ No repetition was verified"),
        Verdict::Held if unverified > 0 => {
            println!("✅ Invariant held for every verified repetition")
        }
        Verdict::Held => println!("✅ Invariant held for every repetition"),
    }
}
