use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{anyhow, Result};
use chrono::Local;
use rayon::prelude::*;
use serde_json::json;
use sweep_analysis::{parse_seed_log, seed_log_path, ScoreStats};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub seeds: u32,
    pub jobs: Option<usize>,
    pub log_root: PathBuf,
    pub launcher: String,
    pub judge_class: String,
    pub solver: PathBuf,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            seeds: 100,
            jobs: None,
            log_root: PathBuf::from("./log"),
            launcher: "java".to_string(),
            judge_class: "MapRecoloringVis".to_string(),
            solver: PathBuf::from("./a.out"),
        }
    }
}

impl SweepConfig {
    pub fn worker_count(&self) -> usize {
        self.jobs.unwrap_or_else(default_parallelism)
    }
}

pub fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Argv for one judge invocation:
/// `<launcher> <judge-class> -novis -exec <solver> -seed <seed>`.
pub fn judge_command(config: &SweepConfig, seed: u32) -> Vec<String> {
    let mut argv = judge_command_prefix(config);
    argv.push("-seed".to_string());
    argv.push(seed.to_string());
    argv
}

/// The fixed part of the argv, without the trailing `-seed <seed>` pair.
pub fn judge_command_prefix(config: &SweepConfig) -> Vec<String> {
    vec![
        config.launcher.clone(),
        config.judge_class.clone(),
        "-novis".to_string(),
        "-exec".to_string(),
        config.solver.to_string_lossy().to_string(),
    ]
}

/// Timestamp-named directory holding every log of one invocation. Retained
/// for audit, never cleaned up automatically.
pub fn create_run_dir(log_root: &Path) -> Result<PathBuf> {
    let run_dir = log_root.join(Local::now().format("%Y%m%d-%H%M%S").to_string());
    fs::create_dir_all(&run_dir).map_err(|e| {
        anyhow!(
            "cannot create run directory {}: {}",
            run_dir.display(),
            e
        )
    })?;
    Ok(run_dir)
}

#[derive(Debug, Clone)]
pub struct TrialOutcome {
    pub seed: u32,
    pub log_path: PathBuf,
    pub exit_code: Option<i32>,
}

impl TrialOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs the judge for one seed, capturing its stdout verbatim into the
/// seed's log file (overwriting any prior file). Stderr stays on the parent's
/// stream. A spawn failure is an error; a non-zero exit is recorded in the
/// outcome and left to the caller.
pub fn run_trial(config: &SweepConfig, seed: u32, run_dir: &Path) -> Result<TrialOutcome> {
    let log_path = seed_log_path(run_dir, seed);
    let log_file = File::create(&log_path)
        .map_err(|e| anyhow!("cannot create log {}: {}", log_path.display(), e))?;
    let command = judge_command(config, seed);
    let status = Command::new(&command[0])
        .args(&command[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::from(log_file))
        .stderr(Stdio::inherit())
        .status()
        .map_err(|e| {
            anyhow!(
                "cannot launch judge for seed {}: {} (command: {})",
                seed,
                e,
                command.join(" ")
            )
        })?;
    Ok(TrialOutcome {
        seed,
        log_path,
        exit_code: status.code(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepPhase {
    Dispatch,
    Aggregate,
}

impl SweepPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            SweepPhase::Dispatch => "dispatch",
            SweepPhase::Aggregate => "aggregate",
        }
    }
}

/// Explicit progress handle passed into the orchestrator; the CLI backs it
/// with a terminal bar, library callers use [`NoProgress`].
pub trait ProgressSink: Sync {
    fn begin_phase(&self, _phase: SweepPhase, _total: u64) {}
    fn task_done(&self, _phase: SweepPhase) {}
}

pub struct NoProgress;

impl ProgressSink for NoProgress {}

pub fn build_worker_pool(workers: usize) -> Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .map_err(|e| anyhow!("cannot build worker pool: {}", e))
}

#[derive(Debug, Clone)]
pub struct SeedScore {
    pub seed: u32,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct SeedFailure {
    pub seed: u32,
    pub log_path: PathBuf,
    pub reason: String,
}

#[derive(Debug)]
pub struct Aggregation {
    pub scores: Vec<SeedScore>,
    pub failures: Vec<SeedFailure>,
    pub stats: ScoreStats,
}

#[derive(Debug)]
pub struct SweepReport {
    pub run_dir: PathBuf,
    pub trials: Vec<TrialOutcome>,
    pub aggregation: Aggregation,
}

/// Drives the two phases in sequence: dispatch every seed through the worker
/// pool, then parse every log through the same pool once all writes are done.
pub fn run_sweep(config: &SweepConfig, progress: &dyn ProgressSink) -> Result<SweepReport> {
    let run_dir = create_run_dir(&config.log_root)?;
    let workers = config.worker_count();
    write_run_manifest(&run_dir, config, workers)?;
    let pool = build_worker_pool(workers)?;

    let seeds: Vec<u32> = (1..=config.seeds).collect();

    progress.begin_phase(SweepPhase::Dispatch, seeds.len() as u64);
    let trials = pool.install(|| {
        seeds
            .par_iter()
            .map(|&seed| {
                let outcome = run_trial(config, seed, &run_dir);
                progress.task_done(SweepPhase::Dispatch);
                outcome
            })
            .collect::<Result<Vec<_>>>()
    })?;
    for trial in trials.iter().filter(|t| !t.succeeded()) {
        warn!(
            seed = trial.seed,
            exit_code = ?trial.exit_code,
            log = %trial.log_path.display(),
            "judge exited abnormally; captured log kept as-is"
        );
    }

    let aggregation = aggregate_seeds(&pool, &run_dir, &seeds, progress)?;
    Ok(SweepReport {
        run_dir,
        trials,
        aggregation,
    })
}

/// Re-runs the aggregation phase over an existing run directory, discovering
/// seeds from the log files present.
pub fn aggregate_run_dir(
    run_dir: &Path,
    jobs: Option<usize>,
    progress: &dyn ProgressSink,
) -> Result<Aggregation> {
    let seeds = collect_seeds(run_dir)?;
    if seeds.is_empty() {
        return Err(anyhow!("no .ltsv logs found under {}", run_dir.display()));
    }
    let pool = build_worker_pool(jobs.unwrap_or_else(default_parallelism))?;
    aggregate_seeds(&pool, run_dir, &seeds, progress)
}

pub fn collect_seeds(run_dir: &Path) -> Result<Vec<u32>> {
    let entries = fs::read_dir(run_dir)
        .map_err(|e| anyhow!("cannot read run directory {}: {}", run_dir.display(), e))?;
    let mut seeds = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(stem) = name.strip_suffix(".ltsv") {
            if let Ok(seed) = stem.parse::<u32>() {
                seeds.push(seed);
            }
        }
    }
    seeds.sort_unstable();
    Ok(seeds)
}

fn aggregate_seeds(
    pool: &rayon::ThreadPool,
    run_dir: &Path,
    seeds: &[u32],
    progress: &dyn ProgressSink,
) -> Result<Aggregation> {
    progress.begin_phase(SweepPhase::Aggregate, seeds.len() as u64);
    let parsed: Vec<(u32, Result<f64, sweep_analysis::ParseError>)> = pool.install(|| {
        seeds
            .par_iter()
            .map(|&seed| {
                let result = parse_seed_log(run_dir, seed);
                progress.task_done(SweepPhase::Aggregate);
                (seed, result)
            })
            .collect()
    });

    let mut scores = Vec::new();
    let mut failures = Vec::new();
    for (seed, result) in parsed {
        match result {
            Ok(score) => scores.push(SeedScore { seed, score }),
            Err(err) => {
                let failure = SeedFailure {
                    seed,
                    log_path: seed_log_path(run_dir, seed),
                    reason: err.to_string(),
                };
                warn!(
                    seed,
                    log = %failure.log_path.display(),
                    "unusable log: {}",
                    failure.reason
                );
                failures.push(failure);
            }
        }
    }

    // Fail-soft per seed, fail-loud in aggregate: unusable logs outnumbering
    // usable ones fails the whole phase.
    if failures.len() > scores.len() {
        return Err(anyhow!(
            "aggregation failed: {} of {} seeds produced unusable logs under {}",
            failures.len(),
            failures.len() + scores.len(),
            run_dir.display()
        ));
    }

    let values: Vec<f64> = scores.iter().map(|s| s.score).collect();
    let stats = ScoreStats::from_scores(&values)
        .ok_or_else(|| anyhow!("no seeds to aggregate under {}", run_dir.display()))?;
    info!("mean: {}, std: {}", stats.mean, stats.std);

    Ok(Aggregation {
        scores,
        failures,
        stats,
    })
}

fn write_run_manifest(run_dir: &Path, config: &SweepConfig, workers: usize) -> Result<()> {
    let manifest = json!({
        "schema_version": "run_manifest_v1",
        "created_at": Local::now().to_rfc3339(),
        "seeds": config.seeds,
        "workers": workers,
        "judge_command": judge_command_prefix(config),
    });
    let path = run_dir.join("run_manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest)?;
    fs::write(&path, bytes)
        .map_err(|e| anyhow!("cannot write {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let stamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock before epoch")
            .as_micros();
        let dir = std::env::temp_dir().join(format!(
            "sweep_runner_{}_{}_{}",
            tag,
            std::process::id(),
            stamp
        ));
        fs::create_dir_all(&dir).expect("temp dir");
        dir
    }

    #[cfg(unix)]
    fn write_fake_judge(dir: &Path, script: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake_judge.sh");
        fs::write(&path, script).expect("write script");
        let mut perms = fs::metadata(&path).expect("stat").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("chmod");
        path
    }

    fn test_config(launcher: &Path, log_root: PathBuf) -> SweepConfig {
        SweepConfig {
            seeds: 3,
            jobs: Some(2),
            log_root,
            launcher: launcher.to_string_lossy().to_string(),
            judge_class: "FakeVis".to_string(),
            solver: PathBuf::from("./a.out"),
        }
    }

    #[test]
    fn judge_command_matches_fixed_invocation() {
        let config = SweepConfig::default();
        assert_eq!(
            judge_command(&config, 7),
            vec!["java", "MapRecoloringVis", "-novis", "-exec", "./a.out", "-seed", "7"]
        );
    }

    #[test]
    fn worker_count_honors_explicit_jobs() {
        let config = SweepConfig {
            jobs: Some(4),
            ..SweepConfig::default()
        };
        assert_eq!(config.worker_count(), 4);
        assert!(SweepConfig::default().worker_count() >= 1);
    }

    #[test]
    fn create_run_dir_fails_fast_when_root_is_a_file() {
        let root = temp_dir("bad_root");
        let blocker = root.join("log");
        fs::write(&blocker, "not a directory").expect("blocker file");
        let err = create_run_dir(&blocker).expect_err("must fail");
        assert!(err.to_string().contains("cannot create run directory"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn collect_seeds_discovers_and_sorts_log_files() {
        let root = temp_dir("collect");
        for name in ["0003.ltsv", "0001.ltsv", "0100.ltsv", "notes.txt", "junk.ltsv"] {
            fs::write(root.join(name), "").expect("seed file");
        }
        let seeds = collect_seeds(&root).expect("seeds");
        assert_eq!(seeds, vec![1, 3, 100]);
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn run_trial_captures_judge_stdout_to_seed_log() {
        let root = temp_dir("run_trial");
        let judge = write_fake_judge(
            &root,
            "#!/bin/sh\nprintf 'H:10\\tW:20\\n'\nprintf 'bestUsed:5\\nbestRecolor:100\\n'\n",
        );
        let run_dir = root.join("20240101-000000");
        fs::create_dir_all(&run_dir).expect("run dir");
        let config = test_config(&judge, root.join("log"));

        let outcome = run_trial(&config, 7, &run_dir).expect("trial");
        assert!(outcome.succeeded());
        assert_eq!(outcome.log_path, run_dir.join("0007.ltsv"));
        let contents = fs::read_to_string(&outcome.log_path).expect("log contents");
        assert_eq!(contents, "H:10\tW:20\nbestUsed:5\nbestRecolor:100\n");
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn run_trial_overwrites_a_previous_log() {
        let root = temp_dir("overwrite");
        let judge = write_fake_judge(&root, "#!/bin/sh\nprintf 'H:1\\tW:1\\n'\n");
        let run_dir = root.join("run");
        fs::create_dir_all(&run_dir).expect("run dir");
        fs::write(run_dir.join("0001.ltsv"), "stale contents from an old run\n")
            .expect("stale log");
        let config = test_config(&judge, root.join("log"));

        run_trial(&config, 1, &run_dir).expect("trial");
        let contents = fs::read_to_string(run_dir.join("0001.ltsv")).expect("log contents");
        assert_eq!(contents, "H:1\tW:1\n");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn run_trial_propagates_a_missing_launcher() {
        let root = temp_dir("missing_launcher");
        let run_dir = root.join("run");
        fs::create_dir_all(&run_dir).expect("run dir");
        let config = test_config(&root.join("no_such_judge"), root.join("log"));

        let err = run_trial(&config, 1, &run_dir).expect_err("spawn must fail");
        assert!(err.to_string().contains("cannot launch judge for seed 1"));
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn run_trial_tolerates_nonzero_exit() {
        let root = temp_dir("nonzero_exit");
        let judge = write_fake_judge(&root, "#!/bin/sh\nprintf 'partial\\n'\nexit 3\n");
        let run_dir = root.join("run");
        fs::create_dir_all(&run_dir).expect("run dir");
        let config = test_config(&judge, root.join("log"));

        let outcome = run_trial(&config, 2, &run_dir).expect("trial");
        assert!(!outcome.succeeded());
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(
            fs::read_to_string(&outcome.log_path).expect("log contents"),
            "partial\n"
        );
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn full_sweep_over_three_seeds_matches_hand_computed_stats() {
        let root = temp_dir("full_sweep");
        // Score per seed works out to bestUsed * (100 / 10 / 10) = seed.
        let judge = write_fake_judge(
            &root,
            "#!/bin/sh\nprintf 'H:10\\tW:10\\n'\nprintf 'bestUsed:%s\\n' \"$6\"\nprintf 'bestRecolor:100\\n'\n",
        );
        let config = test_config(&judge, root.join("log"));

        let report = run_sweep(&config, &NoProgress).expect("sweep");
        let run_name = report
            .run_dir
            .file_name()
            .and_then(|n| n.to_str())
            .expect("run dir name");
        assert_eq!(run_name.len(), "20240101-000000".len());
        assert!(report.run_dir.join("run_manifest.json").exists());
        assert_eq!(report.trials.len(), 3);
        assert!(report.trials.iter().all(|t| t.succeeded()));

        let agg = &report.aggregation;
        assert!(agg.failures.is_empty());
        let seeds: Vec<u32> = agg.scores.iter().map(|s| s.seed).collect();
        assert_eq!(seeds, vec![1, 2, 3]);
        assert!((agg.stats.mean - 2.0).abs() < 1e-9);
        assert!((agg.stats.std - (2.0f64 / 3.0).sqrt()).abs() < 1e-9);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn aggregation_is_fail_soft_for_a_minority_of_bad_logs() {
        let root = temp_dir("fail_soft");
        fs::write(root.join("0001.ltsv"), "H:10\tW:10\nbestUsed:1\tbestRecolor:100\n")
            .expect("good log");
        fs::write(root.join("0002.ltsv"), "H:10\tW:10\nbestUsed:3\tbestRecolor:100\n")
            .expect("good log");
        fs::write(root.join("0003.ltsv"), "W:10\n").expect("bad log");

        let agg = aggregate_run_dir(&root, Some(2), &NoProgress).expect("aggregate");
        assert_eq!(agg.scores.len(), 2);
        assert_eq!(agg.failures.len(), 1);
        assert_eq!(agg.failures[0].seed, 3);
        assert!(agg.failures[0].reason.contains("missing dimension field H"));
        assert!((agg.stats.mean - 2.0).abs() < 1e-9);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn aggregation_fails_loud_when_bad_logs_outnumber_good_ones() {
        let root = temp_dir("fail_loud");
        fs::write(root.join("0001.ltsv"), "H:10\tW:10\nbestUsed:1\tbestRecolor:100\n")
            .expect("good log");
        fs::write(root.join("0002.ltsv"), "W:10\n").expect("bad log");
        fs::write(root.join("0003.ltsv"), "no fields at all\n").expect("bad log");

        let err = aggregate_run_dir(&root, Some(2), &NoProgress).expect_err("must fail");
        assert!(err.to_string().contains("2 of 3 seeds"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn aggregating_an_empty_run_dir_is_an_error() {
        let root = temp_dir("empty_run");
        let err = aggregate_run_dir(&root, Some(1), &NoProgress).expect_err("must fail");
        assert!(err.to_string().contains("no .ltsv logs"));
        let _ = fs::remove_dir_all(root);
    }
}
