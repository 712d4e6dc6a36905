use anyhow::{Context, Result};
use bridge_lite::{
    AcceptingFeedback, ConcurrencyConfig, CorrectionService, Diff, InMemoryIntentStore, Intent,
    IntentStore, PhilosophicalActor, PipelineOrchestrator, ReevaluationRequest, RuleBasedJudge,
    TechnicalActor, TracingAuditSink,
};
use clap::{Parser, Subcommand};
use futures::future::join_all;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "bridge-lite")]
#[command(about = "Concurrent intent correction playground")]
struct Cli {
    /// JSON concurrency config; defaults apply to missing fields
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run concurrent re-evaluations plus a locked pipeline run on one intent
    Simulate {
        #[arg(long, default_value_t = 4)]
        workers: usize,
        #[arg(long, default_value_t = 3)]
        rounds: usize,
    },
    /// Print the effective configuration as JSON
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to install tracing subscriber")?;

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Simulate { workers, rounds } => simulate(config, workers, rounds).await,
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<ConcurrencyConfig> {
    let Some(path) = path else {
        return Ok(ConcurrencyConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config '{}'", path.display()))?;
    ConcurrencyConfig::from_json_str(&raw)
        .with_context(|| format!("Invalid config '{}'", path.display()))
}

async fn simulate(config: ConcurrencyConfig, workers: usize, rounds: usize) -> Result<()> {
    let store = Arc::new(InMemoryIntentStore::with_config(config.clone()));
    let audit = Arc::new(TracingAuditSink);
    let orchestrator = Arc::new(PipelineOrchestrator::new(
        store.clone(),
        audit.clone(),
        Arc::new(RuleBasedJudge),
        Arc::new(AcceptingFeedback),
        config.clone(),
    ));
    let corrections = Arc::new(CorrectionService::new(store.clone(), audit, config));

    let intent = orchestrator
        .create(
            Intent::from_json("simulation", json!({"status": "received"}))?
                .with_actors(TechnicalActor::Daemon, PhilosophicalActor::Yuno),
        )
        .await?;
    let id = intent.id;

    let mut tasks = Vec::with_capacity(workers * rounds + 1);
    {
        let orchestrator = orchestrator.clone();
        tasks.push(tokio::spawn(async move {
            orchestrator.execute_with_lock(&id, None).await.map(|_| ())
        }));
    }
    for worker in 0..workers {
        for round in 0..rounds {
            let corrections = corrections.clone();
            tasks.push(tokio::spawn(async move {
                let diff = Diff::new().set(format!("worker_{worker}.round_{round}"), true);
                let request = ReevaluationRequest::new(id, diff, PhilosophicalActor::Yuno)
                    .reason(format!("worker {worker} round {round}"));
                corrections.reevaluate(request).await.map(|_| ())
            }));
        }
    }

    for joined in join_all(tasks).await {
        joined.context("Simulation task panicked")??;
    }

    let final_intent = store.get(&id).await?;
    println!("{}", serde_json::to_string_pretty(&final_intent)?);
    Ok(())
}
