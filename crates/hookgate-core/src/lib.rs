//! # hookgate-core
//!
//! Core types for the Hookgate hook orchestration engine.
//!
//! Hookgate sits between an AI coding-agent host and a set of policy hooks.
//! The host emits lifecycle events; hooks inspect, block, rewrite or react to
//! them in a deterministic order.
//!
//! This crate holds the pieces every other crate leans on:
//!
//! - the unified error type and fail-open helpers
//! - the config normalizer (untyped JSON in, fully defaulted config out)
//! - the versioned event/message contract exchanged with the host
//! - the best-effort JSONL audit stream

pub mod audit;
pub mod config;
mod error;
pub mod fail_open;
mod types;

pub use audit::{AuditEntry, AuditLog, AuditStage};
pub use config::{normalize, GatewayConfig};
pub use error::{HookgateError, Result};
pub use types::*;
