//! Completion signal detection
//!
//! The agent signals it is done by emitting a marker in its latest reply:
//!
//! ```xml
//! <promise>DONE</promise>
//! ```
//!
//! or, in objective mode:
//!
//! ```xml
//! <objective-complete>true</objective-complete>
//! ```
//!
//! Matching is a case-insensitive substring search, so the marker may sit
//! anywhere inside surrounding prose.

use hookgate_core::config::CompletionMode;
use hookgate_core::{HookgateError, Result, SessionMessage};
use regex::Regex;

const OBJECTIVE_PATTERN: &str = r"(?i)<objective-complete>\s*true\s*</objective-complete>";

/// Compiled completion matcher for one loop
#[derive(Debug, Clone)]
pub struct CompletionDetector {
    pattern: Regex,
}

impl CompletionDetector {
    pub fn new(mode: CompletionMode, promise: &str) -> Result<Self> {
        let source = match mode {
            CompletionMode::Promise => {
                let token = match promise.trim() {
                    "" => "DONE",
                    token => token,
                };
                format!(r"(?is)<promise>\s*{}\s*</promise>", regex::escape(token))
            }
            CompletionMode::Objective => OBJECTIVE_PATTERN.to_string(),
        };

        let pattern = Regex::new(&source)
            .map_err(|e| HookgateError::Other(format!("Invalid completion pattern: {}", e)))?;
        Ok(Self { pattern })
    }

    pub fn is_complete(&self, text: &str) -> bool {
        self.pattern.is_match(text)
    }
}

/// Text of the most recent assistant message, if any
pub fn latest_assistant_text(messages: &[SessionMessage]) -> Option<String> {
    messages
        .iter()
        .rev()
        .find(|m| m.is_assistant())
        .map(SessionMessage::text)
}
