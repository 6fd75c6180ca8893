//! Evalkit CLI - Run eval sets from the command line
//!
//! Agents are replayed from recorded eval sets, so runs are deterministic and
//! need no model access.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use evalkit_core::prelude::*;

#[derive(Parser)]
#[command(name = "evalkit")]
#[command(about = "Evaluation runner for conversational agents", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run inference over an eval set and print the results as JSON
    Infer {
        #[command(flatten)]
        target: Target,

        /// Only run these case ids
        #[arg(long = "case")]
        cases: Vec<String>,

        /// Write results to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Score inference results produced by `infer`
    Evaluate {
        #[command(flatten)]
        target: Target,

        /// Inference results file
        #[arg(short, long)]
        inferences: PathBuf,

        /// Metric to compute, as `name` or `name=threshold`
        #[arg(short, long = "metric", default_value = "final_response_match=1.0")]
        metrics: Vec<String>,

        /// Write results to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List available metrics
    Metrics,
    /// Version information
    Version,
}

#[derive(Args)]
struct Target {
    /// Eval set file (JSON or YAML)
    #[arg(short, long)]
    eval_set: PathBuf,

    /// Recorded answers to replay; defaults to the eval set itself
    #[arg(short, long)]
    recording: Option<PathBuf>,

    /// App name the eval set belongs to
    #[arg(short, long, env = "EVALKIT_APP", default_value = "default")]
    app: String,

    /// Run cases on the worker pool
    #[arg(long)]
    parallel: bool,

    /// Workers per pool
    #[arg(long)]
    parallelism: Option<usize>,
}

struct Loaded {
    service: LocalEvalService,
    eval_set_id: String,
}

impl Target {
    fn load(&self, config: &EvalServiceConfig) -> Result<Loaded> {
        let set = EvalSet::load(&self.eval_set)
            .with_context(|| format!("Failed to load eval set {}", self.eval_set.display()))?;
        let recording = match self.recording.as_deref() {
            Some(path) => EvalSet::load(path)
                .with_context(|| format!("Failed to load recording {}", path.display()))?,
            None => set.clone(),
        };

        let eval_set_id = set.eval_set_id.clone();
        let source = Arc::new(InMemoryCaseSource::new());
        source.put(&self.app, set)?;

        let mut options = vec![with_case_source(source)];
        if self.parallel {
            options.push(with_parallel_inference(true));
            options.push(with_parallel_evaluation(true));
        }
        if let Some(parallelism) = self.parallelism {
            options.push(with_case_parallelism(parallelism));
        }

        let runtime = Arc::new(ReplayRuntime::from_set(&recording));
        let service = LocalEvalService::from_config(runtime, config, options)?;
        Ok(Loaded {
            service,
            eval_set_id,
        })
    }
}

fn parse_metric(spec: &str) -> Result<EvalMetric> {
    match spec.split_once('=') {
        Some((name, threshold)) => {
            let threshold: f64 = threshold
                .parse()
                .with_context(|| format!("Invalid threshold in metric {:?}", spec))?;
            Ok(EvalMetric::new(name, threshold))
        }
        None => Ok(EvalMetric::new(spec, 1.0)),
    }
}

fn write_json(value: &impl serde::Serialize, output: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => std::fs::write(path, json)
            .with_context(|| format!("Failed to write {}", path.display()))?,
        None => println!("{}", json),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Infer {
            target,
            cases,
            output,
        } => {
            let config = EvalServiceConfig::load()?;
            let loaded = target.load(&config)?;
            let request =
                InferenceRequest::new(&target.app, &loaded.eval_set_id).with_case_ids(cases);
            let results = loaded
                .service
                .infer(&EvalContext::new(), request, [])
                .await?;

            let failed = results
                .iter()
                .filter(|r| r.status == EvalStatus::Failed)
                .count();
            tracing::info!(cases = results.len(), failed, "inference complete");
            write_json(&results, output.as_deref())?;
        }
        Commands::Evaluate {
            target,
            inferences,
            metrics,
            output,
        } => {
            let config = EvalServiceConfig::load()?;
            let loaded = target.load(&config)?;
            let content = std::fs::read_to_string(&inferences)
                .with_context(|| format!("Failed to read {}", inferences.display()))?;
            let inference_results: Vec<InferenceResult> = serde_json::from_str(&content)
                .with_context(|| format!("Invalid inference results in {}", inferences.display()))?;
            let metrics = metrics
                .iter()
                .map(|m| parse_metric(m))
                .collect::<Result<Vec<_>>>()?;

            let request =
                EvaluateRequest::new(&target.app, &loaded.eval_set_id, inference_results, metrics);
            let results = loaded
                .service
                .evaluate(&EvalContext::new(), request, [])
                .await?;

            for result in &results {
                tracing::info!(eval_id = %result.eval_id, status = %result.final_eval_status, "case scored");
            }
            write_json(&results, output.as_deref())?;
        }
        Commands::Metrics => {
            let registry = Registry::with_builtins();
            for name in registry.names() {
                let description = registry
                    .get(&name)
                    .map(|e| e.description().to_string())
                    .unwrap_or_default();
                println!("{:<24} {}", name, description);
            }
        }
        Commands::Version => {
            println!("evalkit {}", env!("CARGO_PKG_VERSION"));
            println!("evalkit-core {}", evalkit_core::VERSION);
        }
    }

    Ok(())
}
