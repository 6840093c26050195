//! Execution trace export under `<export_dir>/<run_id>/`.
//!
//! Each run directory holds `trace.jsonl` (one [`TraceEntry`] per line, in
//! execution order) and `meta.json`. Exports are append-only audit artifacts;
//! nothing here rewrites an existing run.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::stats::{Summary, summarize};
use crate::core::types::ExecutionResult;
use crate::executor::{ExecutionReport, ExecutionStop, TraceEntry};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMeta {
    pub run_id: String,
    pub goal: String,
    pub stop: ExecutionStop,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub steps: usize,
}

#[derive(Debug, Clone)]
pub struct RunPaths {
    pub dir: PathBuf,
    pub trace_path: PathBuf,
    pub meta_path: PathBuf,
}

impl RunPaths {
    /// Paths for `run_id`, which must name a single directory inside `export_dir`.
    pub fn new(export_dir: &Path, run_id: &str) -> Result<Self> {
        if run_id.trim().is_empty()
            || run_id.contains(['/', '\\'])
            || run_id.contains("..")
            || Path::new(run_id).is_absolute()
        {
            bail!("invalid run id '{run_id}'");
        }
        let dir = export_dir.join(run_id);
        Ok(Self {
            trace_path: dir.join("trace.jsonl"),
            meta_path: dir.join("meta.json"),
            dir,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportedRun {
    pub meta: RunMeta,
    pub trace: Vec<TraceEntry>,
}

/// Run id derived from the report's start time (`20260101T120000.123Z`).
pub fn default_run_id(report: &ExecutionReport) -> String {
    report.started_at.format("%Y%m%dT%H%M%S%.3fZ").to_string()
}

pub fn write_run(export_dir: &Path, run_id: &str, report: &ExecutionReport) -> Result<RunPaths> {
    let paths = RunPaths::new(export_dir, run_id)?;
    if paths.meta_path.exists() {
        bail!("run {} already exported at {}", run_id, paths.dir.display());
    }
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create run dir {}", paths.dir.display()))?;

    let mut trace = fs::File::create(&paths.trace_path)
        .with_context(|| format!("create {}", paths.trace_path.display()))?;
    for entry in &report.trace {
        let line = serde_json::to_string(entry).context("serialize trace entry")?;
        writeln!(trace, "{line}").with_context(|| format!("write {}", paths.trace_path.display()))?;
    }

    // meta.json last so a partially written run is never listed.
    let meta = RunMeta {
        run_id: run_id.to_string(),
        goal: report.goal.clone(),
        stop: report.stop.clone(),
        started_at: report.started_at,
        finished_at: report.finished_at,
        duration_ms: report.duration_ms(),
        steps: report.trace.len(),
    };
    let mut buf = serde_json::to_string_pretty(&meta).context("serialize run meta")?;
    buf.push('\n');
    fs::write(&paths.meta_path, buf)
        .with_context(|| format!("write {}", paths.meta_path.display()))?;
    Ok(paths)
}

pub fn read_run(dir: &Path) -> Result<ExportedRun> {
    let paths = RunPaths {
        dir: dir.to_path_buf(),
        trace_path: dir.join("trace.jsonl"),
        meta_path: dir.join("meta.json"),
    };
    let meta_text = fs::read_to_string(&paths.meta_path)
        .with_context(|| format!("read {}", paths.meta_path.display()))?;
    let meta: RunMeta = serde_json::from_str(&meta_text)
        .with_context(|| format!("parse {}", paths.meta_path.display()))?;

    let trace_text = fs::read_to_string(&paths.trace_path)
        .with_context(|| format!("read {}", paths.trace_path.display()))?;
    let mut trace = Vec::new();
    for (index, line) in trace_text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let entry: TraceEntry = serde_json::from_str(line).with_context(|| {
            format!("parse {} line {}", paths.trace_path.display(), index + 1)
        })?;
        trace.push(entry);
    }
    Ok(ExportedRun { meta, trace })
}

/// Every exported run under `export_dir`, ordered by directory name.
pub fn read_runs(export_dir: &Path) -> Result<Vec<ExportedRun>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(export_dir)
        .with_context(|| format!("read directory {}", export_dir.display()))?
    {
        let entry = entry.with_context(|| format!("read entry in {}", export_dir.display()))?;
        let path = entry.path();
        if path.join("meta.json").is_file() {
            dirs.push(path);
        }
    }
    dirs.sort();
    dirs.iter().map(|dir| read_run(dir)).collect()
}

/// Latency report across exported runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsReport {
    pub runs: usize,
    pub run_duration_ms: Summary,
    /// Dispatched-step latency keyed by capability name.
    pub step_latency_ms: BTreeMap<String, Summary>,
}

pub fn stats_report(runs: &[ExportedRun]) -> StatsReport {
    let durations: Vec<f64> = runs.iter().map(|run| run.meta.duration_ms as f64).collect();
    let mut per_capability: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for entry in runs.iter().flat_map(|run| &run.trace) {
        if matches!(entry.result, ExecutionResult::Skipped(_)) {
            continue;
        }
        per_capability
            .entry(entry.capability.clone())
            .or_default()
            .push(entry.duration_ms as f64);
    }
    StatsReport {
        runs: runs.len(),
        run_duration_ms: summarize(&durations),
        step_latency_ms: per_capability
            .into_iter()
            .map(|(capability, samples)| (capability, summarize(&samples)))
            .collect(),
    }
}
