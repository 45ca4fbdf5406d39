//! Persisted autopilot loop state
//!
//! One JSON file per project directory holds at most one active loop.
//! Writes go to a uniquely named sibling temp file and are renamed into
//! place, so a reader in another host process never sees a torn record.
//! Within this process every read-modify-write runs under one async mutex.

use chrono::{DateTime, Utc};
use hookgate_core::config::CompletionMode;
use hookgate_core::{HookgateError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

fn default_completion_promise() -> String {
    "DONE".to_string()
}

fn default_iteration() -> u64 {
    1
}

/// State of the continuation loop for one project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutopilotLoopState {
    #[serde(default)]
    pub active: bool,
    pub session_id: String,
    /// The original task the loop keeps pushing toward
    #[serde(default)]
    pub prompt: String,
    #[serde(default = "default_iteration")]
    pub iteration: u64,
    /// 0 means unbounded
    #[serde(default)]
    pub max_iterations: u64,
    #[serde(default)]
    pub completion_mode: CompletionMode,
    #[serde(default = "default_completion_promise")]
    pub completion_promise: String,
    /// Informational; records written without it load as "now"
    #[serde(default = "Utc::now")]
    pub started_at: DateTime<Utc>,
    /// Consecutive completion signals ignored because work was still open
    #[serde(default)]
    pub ignored_completions: u64,
}

impl AutopilotLoopState {
    /// Fresh active loop at iteration 1
    pub fn new(
        session_id: impl Into<String>,
        prompt: impl Into<String>,
        max_iterations: u64,
        completion_mode: CompletionMode,
        completion_promise: impl Into<String>,
    ) -> Self {
        Self {
            active: true,
            session_id: session_id.into(),
            prompt: prompt.into(),
            iteration: 1,
            max_iterations,
            completion_mode,
            completion_promise: completion_promise.into(),
            started_at: Utc::now(),
            ignored_completions: 0,
        }
    }

    /// Whether another continuation is allowed at the current iteration
    pub fn can_continue(&self) -> bool {
        self.max_iterations == 0 || self.iteration < self.max_iterations
    }

    pub fn belongs_to(&self, session_id: &str) -> bool {
        self.active && self.session_id == session_id
    }
}

/// File-backed store for [`AutopilotLoopState`]
#[derive(Debug)]
pub struct LoopStateStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl LoopStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current state, `None` if no loop was started
    pub async fn load(&self) -> Result<Option<AutopilotLoopState>> {
        let _guard = self.lock.lock().await;
        self.read().await
    }

    /// Write `state`, replacing whatever was there
    pub async fn save(&self, state: &AutopilotLoopState) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.write(state).await
    }

    /// Delete the state file; returns true if one existed
    pub async fn clear(&self) -> Result<bool> {
        let _guard = self.lock.lock().await;
        self.remove().await
    }

    /// Delete the state if it belongs to `session_id`; returns true if removed
    ///
    /// Ownership ignores `active`. A file that no longer parses is matched
    /// on its raw `sessionId`, and one with no readable owner is removed.
    pub async fn clear_session(&self, session_id: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let owner = match self.read().await {
            Ok(None) => return Ok(false),
            Ok(Some(state)) => Some(state.session_id),
            Err(e) => {
                warn!("Loop state is unreadable, matching on raw owner: {}", e);
                self.raw_owner().await
            }
        };

        match owner {
            Some(owner) if owner != session_id => Ok(false),
            _ => self.remove().await,
        }
    }

    /// Read-modify-write inside the critical section
    ///
    /// `f` sees the current state and returns what to persist: `Some` is
    /// written back, `None` deletes the file. The closure's second return
    /// value is handed back to the caller. Nothing is written when no state
    /// exists.
    pub async fn update<F, T>(&self, f: F) -> Result<Option<T>>
    where
        F: FnOnce(AutopilotLoopState) -> (Option<AutopilotLoopState>, T),
    {
        let _guard = self.lock.lock().await;
        let Some(current) = self.read().await? else {
            return Ok(None);
        };

        let (next, value) = f(current);
        match next {
            Some(state) => self.write(&state).await?,
            None => {
                self.remove().await?;
            }
        }
        Ok(Some(value))
    }

    async fn read(&self) -> Result<Option<AutopilotLoopState>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(HookgateError::State(format!(
                    "Failed to read loop state {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        serde_json::from_str(&content).map(Some).map_err(|e| {
            HookgateError::State(format!(
                "Failed to parse loop state {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    async fn raw_owner(&self) -> Option<String> {
        let content = tokio::fs::read_to_string(&self.path).await.ok()?;
        let value: Value = serde_json::from_str(&content).ok()?;
        value
            .get("sessionId")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    #[instrument(skip(self, state), fields(path = %self.path.display()))]
    async fn write(&self, state: &AutopilotLoopState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let json = serde_json::to_string_pretty(state)?;
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "loop-state".to_string());
        let tmp = self
            .path
            .with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

        tokio::fs::write(&tmp, json).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        debug!("Saved loop state at iteration {}", state.iteration);
        Ok(())
    }

    async fn remove(&self) -> Result<bool> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> LoopStateStore {
        LoopStateStore::new(dir.path().join(".hookgate").join("autopilot-state.json"))
    }

    #[tokio::test]
    async fn test_missing_file_loads_as_none() {
        let dir = TempDir::new().unwrap();
        assert_eq!(store(&dir).load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let state =
            AutopilotLoopState::new("ses_1", "ship it", 5, CompletionMode::Objective, "DONE");

        store.save(&state).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(state));

        // No temp files left behind
        let leftovers: Vec<_> = std::fs::read_dir(store.path().parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_missing_fields_are_defaulted() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(
            store.path(),
            r#"{"active":true,"sessionId":"ses_1","maxIterations":3}"#,
        )
        .unwrap();

        let before = Utc::now();
        let state = store.load().await.unwrap().unwrap();
        assert!(state.started_at >= before);
        assert_eq!(state.completion_mode, CompletionMode::Promise);
        assert_eq!(state.completion_promise, "DONE");
        assert_eq!(state.iteration, 1);
        assert_eq!(state.max_iterations, 3);
        assert_eq!(state.ignored_completions, 0);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_a_state_error() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(store.path(), "{not json").unwrap();

        assert!(matches!(store.load().await, Err(HookgateError::State(_))));
    }

    #[tokio::test]
    async fn test_clear_session_matches_owner() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut state =
            AutopilotLoopState::new("ses_1", "task", 3, CompletionMode::Promise, "DONE");
        state.active = false;
        store.save(&state).await.unwrap();

        assert!(!store.clear_session("ses_2").await.unwrap());
        assert!(store.path().exists());
        assert!(store.clear_session("ses_1").await.unwrap());
        assert!(!store.path().exists());
        assert!(!store.clear_session("ses_1").await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_session_removes_unparseable_file() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();

        // Owner still readable: only that session may remove it
        std::fs::write(store.path(), r#"{"sessionId":"ses_1","iteration":"two"}"#).unwrap();
        assert!(store.load().await.is_err());
        assert!(!store.clear_session("ses_2").await.unwrap());
        assert!(store.clear_session("ses_1").await.unwrap());
        assert!(!store.path().exists());

        // No owner at all: any session cleanup removes it
        std::fs::write(store.path(), "{not json").unwrap();
        assert!(store.clear_session("ses_9").await.unwrap());
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn test_update_writes_and_deletes() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        // Nothing to update yet
        let none: Option<()> = store.update(|s| (Some(s), ())).await.unwrap();
        assert!(none.is_none());

        store
            .save(&AutopilotLoopState::new("s", "task", 3, CompletionMode::Promise, "DONE"))
            .await
            .unwrap();

        let iteration = store
            .update(|mut s| {
                s.iteration += 1;
                let i = s.iteration;
                (Some(s), i)
            })
            .await
            .unwrap();
        assert_eq!(iteration, Some(2));
        assert_eq!(store.load().await.unwrap().unwrap().iteration, 2);

        store.update(|_| (None, ())).await.unwrap();
        assert!(!store.path().exists());
        assert!(!store.clear().await.unwrap());
    }

    #[test]
    fn test_can_continue() {
        let mut state = AutopilotLoopState::new("s", "", 2, CompletionMode::Promise, "DONE");
        assert!(state.can_continue());
        state.iteration = 2;
        assert!(!state.can_continue());

        state.max_iterations = 0;
        assert!(state.can_continue());
    }
}
