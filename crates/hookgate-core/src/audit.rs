//! Audit stream - one JSON line per dispatch or hook decision
//!
//! The audit log is a write-only side channel. Every write is fail-open:
//! a full disk or a missing permission costs us the line, never the
//! dispatch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use crate::fail_open::fail_open;
use crate::Result;

/// Where in the pipeline a record was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStage {
    /// Dispatcher-level record (hook ran, hook failed, action blocked)
    Dispatch,
    /// A hook changed persisted or in-memory state
    State,
    /// A hook decided to do nothing, or degraded after a failure
    Skip,
    /// A hook injected content or asked the host to act
    Inject,
}

/// One audit line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub ts: DateTime<Utc>,
    pub hook_id: String,
    pub stage: AuditStage,
    /// Stable, machine-matchable reason code
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl AuditEntry {
    pub fn new(hook_id: impl Into<String>, stage: AuditStage, reason: impl Into<String>) -> Self {
        Self {
            ts: Utc::now(),
            hook_id: hook_id.into(),
            stage,
            reason: reason.into(),
            event_type: None,
            session_id: None,
        }
    }

    pub fn event(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        let session_id = session_id.into();
        if !session_id.is_empty() {
            self.session_id = Some(session_id);
        }
        self
    }
}

/// Append-only JSONL audit sink
#[derive(Debug, Clone, Default)]
pub struct AuditLog {
    path: Option<PathBuf>,
}

impl AuditLog {
    /// Audit log writing to `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// Audit log that drops every record
    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Record an entry
    ///
    /// This operation is fail-open - write failures are logged and dropped
    pub async fn record(&self, entry: AuditEntry) {
        let Some(path) = &self.path else {
            return;
        };
        fail_open("audit::record", || append_line(path, &entry)).await;
    }

    /// Read every parseable entry back (diagnostics and tests)
    pub async fn read_entries(&self) -> Result<Vec<AuditEntry>> {
        let Some(path) = &self.path else {
            return Ok(Vec::new());
        };
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

async fn append_line(path: &Path, entry: &AuditEntry) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let mut line = serde_json::to_string(entry)?;
    line.push('\n');

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_records_append_as_jsonl() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path().join("nested/audit.jsonl"));

        log.record(
            AuditEntry::new("autopilot", AuditStage::Inject, "continuation_sent")
                .event("session.idle")
                .session("ses_1"),
        )
        .await;
        log.record(AuditEntry::new("dispatcher", AuditStage::Dispatch, "hook_ok")).await;

        let raw = std::fs::read_to_string(dir.path().join("nested/audit.jsonl")).unwrap();
        assert_eq!(raw.lines().count(), 2);
        assert!(raw.contains("\"hookId\":\"autopilot\""));
        assert!(raw.contains("\"stage\":\"inject\""));

        let entries = log.read_entries().await.unwrap();
        assert_eq!(entries[0].reason, "continuation_sent");
        assert_eq!(entries[0].session_id.as_deref(), Some("ses_1"));
        assert_eq!(entries[1].event_type, None);
    }

    #[tokio::test]
    async fn test_unwritable_path_is_swallowed() {
        let dir = TempDir::new().unwrap();
        // A directory where the file should be makes the open fail
        let target = dir.path().join("audit.jsonl");
        std::fs::create_dir_all(&target).unwrap();

        let log = AuditLog::new(&target);
        log.record(AuditEntry::new("x", AuditStage::Skip, "nope")).await;
    }

    #[tokio::test]
    async fn test_disabled_log_is_silent() {
        let log = AuditLog::disabled();
        log.record(AuditEntry::new("x", AuditStage::Skip, "nope")).await;
        assert!(log.read_entries().await.unwrap().is_empty());
    }

    #[test]
    fn test_empty_session_is_omitted() {
        let entry = AuditEntry::new("x", AuditStage::State, "r").session("");
        assert_eq!(entry.session_id, None);
    }
}
