//! Locating the artifacts the external tools produce.
//!
//! The tools report where they wrote things only through their stdout. Each
//! [`ArtifactParser`] implements one output contract; the coordination code
//! only sees the trait.

use serde::Deserialize;
use std::path::{Path, PathBuf};

pub trait ArtifactParser: Send + Sync {
    /// Contract identifier, for logs.
    fn name(&self) -> &'static str;

    /// Path of the weights file produced by a training run.
    fn trained_weights(&self, stdout: &str) -> Option<PathBuf>;

    /// Directory holding the results of a detection run.
    fn results_dir(&self, stdout: &str) -> Option<PathBuf>;
}

/// Which output contract the installed tools speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Yolov5,
    Json,
}

impl OutputFormat {
    pub fn parser(&self) -> Box<dyn ArtifactParser> {
        match self {
            OutputFormat::Yolov5 => Box::new(Yolov5Markers),
            OutputFormat::Json => Box::new(JsonResult),
        }
    }
}

/// Text markers printed by yolov5's `train.py` and `detect.py`.
///
/// Training: `Optimizer stripped from <dir>/last.pt, 14.4MB`
/// Detection: `Results saved to <dir>` (the directory is usually bold).
#[derive(Debug, Clone, Copy, Default)]
pub struct Yolov5Markers;

const WEIGHTS_MARKER: &str = "Optimizer stripped from ";
const WEIGHTS_FILE: &str = "last.pt";
const RESULTS_MARKER: &str = "Results saved to";

impl ArtifactParser for Yolov5Markers {
    fn name(&self) -> &'static str {
        "yolov5-text-v1"
    }

    fn trained_weights(&self, stdout: &str) -> Option<PathBuf> {
        stdout.lines().find_map(|line| {
            let line = strip_ansi(line);
            let rest = line.trim().strip_prefix(WEIGHTS_MARKER)?;
            let end = rest.find(WEIGHTS_FILE)? + WEIGHTS_FILE.len();
            Some(PathBuf::from(rest[..end].trim()))
        })
    }

    fn results_dir(&self, stdout: &str) -> Option<PathBuf> {
        stdout.lines().find_map(|line| {
            let line = strip_ansi(line);
            let dir = line.trim().strip_prefix(RESULTS_MARKER)?.trim();
            (!dir.is_empty()).then(|| PathBuf::from(dir))
        })
    }
}

/// A final JSON object line, e.g. `{"weights": "runs/train/exp/weights/last.pt"}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonResult;

#[derive(Deserialize)]
struct ToolResult {
    weights: Option<PathBuf>,
    results_dir: Option<PathBuf>,
}

impl JsonResult {
    fn last_result(stdout: &str) -> impl Iterator<Item = ToolResult> + '_ {
        stdout
            .lines()
            .rev()
            .map(str::trim)
            .filter(|line| line.starts_with('{'))
            .filter_map(|line| serde_json::from_str::<ToolResult>(line).ok())
    }
}

impl ArtifactParser for JsonResult {
    fn name(&self) -> &'static str {
        "json-v1"
    }

    fn trained_weights(&self, stdout: &str) -> Option<PathBuf> {
        Self::last_result(stdout).find_map(|r| r.weights)
    }

    fn results_dir(&self, stdout: &str) -> Option<PathBuf> {
        Self::last_result(stdout).find_map(|r| r.results_dir)
    }
}

/// Resolve a tool-reported path against the tool's working directory.
pub fn resolve(base: &Path, reported: &Path) -> PathBuf {
    if reported.is_absolute() {
        reported.to_path_buf()
    } else {
        base.join(reported)
    }
}

/// Remove ANSI CSI escape sequences (`ESC [ ... final`).
fn strip_ansi(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' && chars.peek() == Some(&'[') {
            chars.next();
            for c in chars.by_ref() {
                if ('@'..='~').contains(&c) {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}
