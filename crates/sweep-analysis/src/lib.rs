use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Multiplier applied to runs that never report a `bestUsed` line.
pub const DEFAULT_BEST_USED: f64 = 1e9;
pub const DEFAULT_BEST_RECOLOR: f64 = 40000.0;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("cannot read log {path}: {source}")]
    UnreadableLog {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed field '{chunk}' in {path} line {line}: expected key:value")]
    MalformedField {
        path: PathBuf,
        line: usize,
        chunk: String,
    },
    #[error("non-numeric value for {key} in {path} line {line}: '{value}'")]
    NonNumericValue {
        path: PathBuf,
        line: usize,
        key: String,
        value: String,
    },
    #[error("missing dimension field {field} in {path}")]
    MissingDimension { path: PathBuf, field: &'static str },
}

pub fn seed_log_name(seed: u32) -> String {
    format!("{:04}.ltsv", seed)
}

pub fn seed_log_path(run_dir: &Path, seed: u32) -> PathBuf {
    run_dir.join(seed_log_name(seed))
}

pub fn parse_seed_log(run_dir: &Path, seed: u32) -> Result<f64, ParseError> {
    parse_log(&seed_log_path(run_dir, seed))
}

/// Extracts the scoring fields from one captured judge log and derives the
/// seed's score as `bestUsed * (bestRecolor / H / W)`.
///
/// Field lines are tab-separated `key:value` chunks; the last occurrence of a
/// key wins across the whole file. Human-readable `Score =` summary lines and
/// lines without any `:` carry no fields and are skipped.
pub fn parse_log(path: &Path) -> Result<f64, ParseError> {
    let data = fs::read_to_string(path).map_err(|source| ParseError::UnreadableLog {
        path: path.to_path_buf(),
        source,
    })?;

    let mut height: Option<f64> = None;
    let mut width: Option<f64> = None;
    let mut best_used = DEFAULT_BEST_USED;
    let mut best_recolor = DEFAULT_BEST_RECOLOR;

    for (idx, line) in data.lines().enumerate() {
        if line.contains("Score =") {
            continue;
        }
        if !line.contains(':') {
            continue;
        }
        for chunk in line.trim().split('\t') {
            let (key, value) =
                chunk
                    .split_once(':')
                    .ok_or_else(|| ParseError::MalformedField {
                        path: path.to_path_buf(),
                        line: idx + 1,
                        chunk: chunk.to_string(),
                    })?;
            match key {
                "H" => height = Some(parse_value(path, idx + 1, key, value)?),
                "W" => width = Some(parse_value(path, idx + 1, key, value)?),
                "bestUsed" => best_used = parse_value(path, idx + 1, key, value)?,
                "bestRecolor" => best_recolor = parse_value(path, idx + 1, key, value)?,
                _ => {}
            }
        }
    }

    let height = height.ok_or_else(|| ParseError::MissingDimension {
        path: path.to_path_buf(),
        field: "H",
    })?;
    let width = width.ok_or_else(|| ParseError::MissingDimension {
        path: path.to_path_buf(),
        field: "W",
    })?;
    Ok(best_used * (best_recolor / height / width))
}

fn parse_value(path: &Path, line: usize, key: &str, value: &str) -> Result<f64, ParseError> {
    value
        .trim()
        .parse::<f64>()
        .map_err(|_| ParseError::NonNumericValue {
            path: path.to_path_buf(),
            line,
            key: key.to_string(),
            value: value.to_string(),
        })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreStats {
    pub mean: f64,
    pub std: f64,
    pub count: usize,
}

impl ScoreStats {
    /// Mean and population standard deviation. `None` for an empty batch.
    pub fn from_scores(scores: &[f64]) -> Option<Self> {
        if scores.is_empty() {
            return None;
        }
        let n = scores.len() as f64;
        let mean = scores.iter().sum::<f64>() / n;
        let variance = scores
            .iter()
            .map(|s| {
                let d = s - mean;
                d * d
            })
            .sum::<f64>()
            / n;
        Some(Self {
            mean,
            std: variance.sqrt(),
            count: scores.len(),
        })
    }
}
