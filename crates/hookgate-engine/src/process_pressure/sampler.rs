//! OS process sampling
//!
//! The monitor never shells out directly; it asks a [`ProcessSampler`].
//! [`PsSampler`] reads the process table through `ps`, bounded by a timeout.
//! Tests plug in synthetic samplers.

use async_trait::async_trait;
use hookgate_core::fail_open::with_timeout;
use hookgate_core::{HookgateError, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Aggregate resource use of the host agent's processes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessPressureSample {
    pub total_rss_mb: u64,
    pub process_count: u64,
}

/// Source of process-pressure samples
#[async_trait]
pub trait ProcessSampler: Send + Sync {
    async fn sample(&self) -> Result<ProcessPressureSample>;
}

/// Sampler backed by `ps -axo pid=,rss=,args=`
#[derive(Debug, Clone)]
pub struct PsSampler {
    patterns: Vec<String>,
    timeout: Duration,
}

impl PsSampler {
    pub fn new(patterns: Vec<String>, timeout: Duration) -> Self {
        Self { patterns, timeout }
    }

    async fn run_ps() -> Result<String> {
        let mut cmd = Command::new("ps");
        cmd.args(["-axo", "pid=,rss=,args="])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = cmd
            .output()
            .await
            .map_err(|e| HookgateError::Sampler(format!("Failed to execute ps: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HookgateError::Sampler(format!(
                "ps failed with exit code {:?}: {}",
                output.status.code(),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ProcessSampler for PsSampler {
    #[instrument(skip(self), fields(timeout_ms = self.timeout.as_millis() as u64))]
    async fn sample(&self) -> Result<ProcessPressureSample> {
        let stdout = with_timeout("process sampling", self.timeout, Self::run_ps()).await?;
        let sample = parse_ps_output(&stdout, &self.patterns);
        debug!(
            "Sampled {} matching processes, {} MB RSS",
            sample.process_count, sample.total_rss_mb
        );
        Ok(sample)
    }
}

/// Sum RSS over `ps` rows whose command line matches any pattern
///
/// Rows are `PID RSS_KB ARGS...`; malformed rows are skipped. Matching is a
/// case-insensitive substring test. An empty pattern list matches nothing.
pub fn parse_ps_output(output: &str, patterns: &[String]) -> ProcessPressureSample {
    let patterns: Vec<String> = patterns
        .iter()
        .map(|p| p.trim().to_lowercase())
        .filter(|p| !p.is_empty())
        .collect();
    if patterns.is_empty() {
        return ProcessPressureSample::default();
    }

    let mut total_rss_kb: u64 = 0;
    let mut process_count: u64 = 0;

    for line in output.lines() {
        let mut fields = line.split_whitespace();
        let (Some(pid), Some(rss)) = (fields.next(), fields.next()) else {
            continue;
        };
        if pid.parse::<u32>().is_err() {
            continue;
        }
        let Ok(rss_kb) = rss.parse::<u64>() else {
            continue;
        };

        let args = fields.collect::<Vec<_>>().join(" ").to_lowercase();
        if patterns.iter().any(|p| args.contains(p.as_str())) {
            total_rss_kb = total_rss_kb.saturating_add(rss_kb);
            process_count += 1;
        }
    }

    ProcessPressureSample {
        total_rss_mb: total_rss_kb / 1024,
        process_count,
    }
}
