use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Mutex;
use sweep_runner::{Aggregation, ProgressSink, SweepConfig, SweepPhase};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "sweep", version, about = "Seed-sweep runner for judge scoring")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ConfigArgs {
    /// Number of seeds to run (seeds 1..=N).
    #[arg(long, default_value_t = 100)]
    seeds: u32,
    /// Worker pool size; defaults to the host's available parallelism.
    #[arg(long)]
    jobs: Option<usize>,
    #[arg(long, default_value = "./log")]
    log_root: PathBuf,
    #[arg(long, default_value = "java")]
    launcher: String,
    #[arg(long, default_value = "MapRecoloringVis")]
    judge: String,
    #[arg(long, default_value = "./a.out")]
    solver: PathBuf,
}

impl ConfigArgs {
    fn into_config(self) -> SweepConfig {
        SweepConfig {
            seeds: self.seeds,
            jobs: self.jobs,
            log_root: self.log_root,
            launcher: self.launcher,
            judge_class: self.judge,
            solver: self.solver,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Dispatch every seed through the judge, then aggregate the logs.
    Run {
        #[command(flatten)]
        config: ConfigArgs,
        #[arg(long)]
        json: bool,
    },
    /// Re-aggregate the logs of an existing run directory.
    Aggregate {
        run_dir: PathBuf,
        #[arg(long)]
        jobs: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Print the resolved sweep plan without running anything.
    Describe {
        #[command(flatten)]
        config: ConfigArgs,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run { config, json } => {
            let config = config.into_config();
            let progress = CliProgress::new(!json);
            let report = sweep_runner::run_sweep(&config, &progress)?;
            progress.finish();
            let failed_trials = report.trials.iter().filter(|t| !t.succeeded()).count();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "run_dir": report.run_dir.display().to_string(),
                    "trials": report.trials.len(),
                    "failed_trials": failed_trials,
                    "aggregation": aggregation_to_json(&report.aggregation),
                })));
            }
            println!("run_dir: {}", report.run_dir.display());
            println!("trials: {}", report.trials.len());
            if failed_trials > 0 {
                println!("failed_trials: {}", failed_trials);
            }
            print_aggregation(&report.aggregation);
        }
        Commands::Aggregate {
            run_dir,
            jobs,
            json,
        } => {
            let progress = CliProgress::new(!json);
            let aggregation = sweep_runner::aggregate_run_dir(&run_dir, jobs, &progress)?;
            progress.finish();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "aggregate",
                    "run_dir": run_dir.display().to_string(),
                    "aggregation": aggregation_to_json(&aggregation),
                })));
            }
            println!("run_dir: {}", run_dir.display());
            print_aggregation(&aggregation);
        }
        Commands::Describe { config, json } => {
            let config = config.into_config();
            let workers = config.worker_count();
            let command = sweep_runner::judge_command_prefix(&config);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "seeds": config.seeds,
                    "workers": workers,
                    "log_root": config.log_root.display().to_string(),
                    "judge_command": command,
                })));
            }
            println!("seeds: {}", config.seeds);
            println!("workers: {}", workers);
            println!("log_root: {}", config.log_root.display());
            println!("judge_command: {:?}", command);
        }
    }
    Ok(None)
}

fn print_aggregation(aggregation: &Aggregation) {
    for failure in &aggregation.failures {
        println!("unusable_seed: {} ({})", failure.seed, failure.reason);
    }
    println!("parsed: {}", aggregation.scores.len());
    println!("mean: {}", aggregation.stats.mean);
    println!("std: {}", aggregation.stats.std);
}

fn aggregation_to_json(aggregation: &Aggregation) -> Value {
    json!({
        "parsed": aggregation.scores.len(),
        "mean": aggregation.stats.mean,
        "std": aggregation.stats.std,
        "failures": aggregation
            .failures
            .iter()
            .map(|f| {
                json!({
                    "seed": f.seed,
                    "log": f.log_path.display().to_string(),
                    "reason": f.reason,
                })
            })
            .collect::<Vec<_>>(),
    })
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Aggregate { json, .. }
        | Commands::Describe { json, .. } => *json,
    }
}

struct CliProgress {
    enabled: bool,
    bar: Mutex<Option<ProgressBar>>,
}

impl CliProgress {
    fn new(enabled: bool) -> Self {
        Self {
            enabled,
            bar: Mutex::new(None),
        }
    }

    fn finish(&self) {
        if let Some(bar) = self.bar.lock().expect("progress lock").take() {
            bar.finish_and_clear();
        }
    }
}

impl ProgressSink for CliProgress {
    fn begin_phase(&self, phase: SweepPhase, total: u64) {
        if !self.enabled {
            return;
        }
        let bar = ProgressBar::new(total);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{msg:>9} [{bar:40.cyan/blue}] {pos}/{len}")
                .expect("progress template")
                .progress_chars("=> "),
        );
        bar.set_message(phase.as_str());
        let mut slot = self.bar.lock().expect("progress lock");
        if let Some(prev) = slot.take() {
            prev.finish_and_clear();
        }
        *slot = Some(bar);
    }

    fn task_done(&self, _phase: SweepPhase) {
        if let Some(bar) = self.bar.lock().expect("progress lock").as_ref() {
            bar.inc(1);
        }
    }
}
