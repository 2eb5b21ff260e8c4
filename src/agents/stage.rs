use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

use crate::error::{ErrorCategory, Result};

/// The three pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Scraper,
    Analyzer,
    Notifier,
}

pub const PIPELINE_ORDER: [StageKind; 3] =
    [StageKind::Scraper, StageKind::Analyzer, StageKind::Notifier];

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Scraper => "scraper",
            StageKind::Analyzer => "analyzer",
            StageKind::Notifier => "notifier",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "scraper" => Some(StageKind::Scraper),
            "analyzer" => Some(StageKind::Analyzer),
            "notifier" => Some(StageKind::Notifier),
            _ => None,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of pipeline work. Implementations exchange JSON payloads: each
/// stage receives the previous stage's output (when one exists) and returns
/// its own.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Stable stage name used for registration, state keys, and logs.
    fn name(&self) -> &str;

    async fn run(&self, input: Option<&Value>) -> Result<Value>;
}

/// Outcome of one stage execution, the contract between the runner and the
/// orchestrator. Never persisted.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub error_category: Option<ErrorCategory>,
    pub duration: Duration,
    pub retries_used: u32,
}

impl ExecutionResult {
    pub fn succeeded(data: Value, duration: Duration, retries_used: u32) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            error_category: None,
            duration,
            retries_used,
        }
    }

    pub fn failed(
        error: String,
        category: ErrorCategory,
        duration: Duration,
        retries_used: u32,
    ) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            error_category: Some(category),
            duration,
            retries_used,
        }
    }
}
