//! Orbit CLI.
//!
//! This is the entry point for the `orbit` binary. Results are printed to
//! stdout as JSON; logs go to stderr.

mod cli;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use orbit_auth::{AuthConfig, Session};
use orbit_control::{
    HttpControlPlaneClient, Orchestrator, OrchestratorService, PerTargetOutcome, TargetOutcome,
};
use orbit_store::RocksStore;

use cli::{Cli, Command, RunArgs};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,orbit=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    tracing::info!(
        url = %cli.url,
        username = %cli.username,
        data_dir = %cli.data_dir.display(),
        "Orbit configuration loaded"
    );

    let auth = AuthConfig::new(&cli.url, &cli.username, &cli.password);
    let session = Arc::new(Session::new(auth).context("failed to build token client")?);
    let client = Arc::new(
        HttpControlPlaneClient::new(&cli.url, session).context("failed to build HTTP client")?,
    );

    tracing::info!(path = %cli.data_dir.display(), "Opening RocksDB store");
    let store = Arc::new(
        RocksStore::open(&cli.data_dir)
            .with_context(|| format!("failed to open store at {}", cli.data_dir.display()))?,
    );

    let orbit = Arc::new(OrchestratorService::new(client, store, cli.engine.config()));

    let on_signal = orbit.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted; remote tasks keep running");
            on_signal.cancel();
        }
    });

    match cli.command {
        Command::Run(args) => run(&*orbit, &args).await,
        Command::Retry { task_id } => {
            let result = orbit.retry_failed(&task_id).await?;
            print_json(&result)?;
            Ok(exit_code(result.is_success()))
        }
        Command::Status {
            kind,
            target,
            status,
        } => {
            let summaries = orbit.query_status(kind, target.as_ref(), status).await?;
            print_json(&summaries)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// `orbit run`: a single target is monitored directly, several go through a
/// batch.
async fn run(orbit: &dyn Orchestrator, args: &RunArgs) -> anyhow::Result<ExitCode> {
    let params = args.params();

    if let ([target], false) = (args.targets.as_slice(), args.parallel) {
        let result = orbit.submit_and_monitor(args.kind, target, &params).await?;
        print_json(&result)?;
        return Ok(exit_code(result.is_success()));
    }

    let policy = args.on_failure.policy();
    let outcomes = orbit
        .submit_batch(args.kind, &args.targets, &params, args.mode(), policy.as_ref())
        .await?;

    let ok = outcomes.iter().all(succeeded);
    print_json(&outcomes)?;
    Ok(exit_code(ok))
}

fn succeeded(outcome: &PerTargetOutcome) -> bool {
    match &outcome.outcome {
        TargetOutcome::Completed(result) => result.is_success(),
        TargetOutcome::Submitted(_) => true,
        _ => false,
    }
}

fn exit_code(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{json}");
    Ok(())
}
