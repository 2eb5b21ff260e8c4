use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::time::Instant;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::agents::stage::{ExecutionResult, Stage};
use crate::error::{ErrorCategory, ErrorClassifier, PipelineError, Result};

/// One line of the in-memory execution log.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionLogEntry {
    pub timestamp: DateTime<Utc>,
    pub agent: String,
    pub success: bool,
    pub duration_seconds: f64,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorCategory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jobs_found: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jobs_analyzed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_sent: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionStats {
    pub total_executions: usize,
    pub successful: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub average_duration_seconds: f64,
    pub average_attempts: f64,
}

pub(crate) fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Executes stages with category-aware retry. Every error is classified by
/// message; each category's policy caps how many retries it earns and how
/// long to back off between them.
pub struct AgentRunner {
    classifier: ErrorClassifier,
    execution_log: Vec<ExecutionLogEntry>,
}

impl AgentRunner {
    pub fn new() -> Self {
        Self::with_classifier(ErrorClassifier::default())
    }

    pub fn with_classifier(classifier: ErrorClassifier) -> Self {
        Self {
            classifier,
            execution_log: Vec::new(),
        }
    }

    /// Access to the rule list, for callers extending the taxonomy.
    pub fn classifier_mut(&mut self) -> &mut ErrorClassifier {
        &mut self.classifier
    }

    pub fn classify(&self, message: &str) -> ErrorCategory {
        self.classifier.classify(message)
    }

    /// Runs `stage` until it succeeds or retries are exhausted. The retries
    /// actually attempted are the smaller of `max_retries` and the failing
    /// category's own cap; the backoff wait suspends the calling task.
    pub async fn run_with_retry(
        &mut self,
        stage: &dyn Stage,
        input: Option<&Value>,
        max_retries: u32,
    ) -> ExecutionResult {
        let start = Instant::now();
        let mut attempt: u32 = 0;
        info!(
            "Running agent '{}' (max_retries={})",
            stage.name(),
            max_retries
        );

        loop {
            match self.attempt_stage(stage, input).await {
                Ok(output) => {
                    let result = ExecutionResult::succeeded(output, start.elapsed(), attempt);
                    info!(
                        "Agent '{}' succeeded after {} attempt(s) in {:.2}s",
                        stage.name(),
                        attempt + 1,
                        result.duration.as_secs_f64()
                    );
                    self.log_execution(stage.name(), &result, attempt + 1);
                    return result;
                }
                Err(err) => {
                    let message = err.to_string();
                    let category = self.classifier.classify(&message);
                    let policy = category.retry_policy();
                    let allowed_retries = max_retries.min(policy.max_retries);

                    if attempt >= allowed_retries {
                        warn!(
                            "Agent '{}' failed after {} attempt(s) ({}): {}",
                            stage.name(),
                            attempt + 1,
                            category,
                            message
                        );
                        let result =
                            ExecutionResult::failed(message, category, start.elapsed(), attempt);
                        self.log_execution(stage.name(), &result, attempt + 1);
                        return result;
                    }

                    let delay = policy.delay_for_attempt(attempt);
                    warn!(
                        "Agent '{}' attempt {} failed ({}): {}; retrying in {}s",
                        stage.name(),
                        attempt + 1,
                        category,
                        message,
                        delay.as_secs()
                    );
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn attempt_stage(&self, stage: &dyn Stage, input: Option<&Value>) -> Result<Value> {
        let output = stage.run(input).await?;
        if let Err(problem) = validate_stage_output(stage.name(), &output) {
            return Err(PipelineError::ValidationError(problem).into());
        }
        Ok(output)
    }

    fn log_execution(&mut self, agent: &str, result: &ExecutionResult, attempts: u32) {
        let mut entry = ExecutionLogEntry {
            timestamp: Utc::now(),
            agent: agent.to_string(),
            success: result.success,
            duration_seconds: round2(result.duration.as_secs_f64()),
            attempts,
            error: result.error.clone(),
            error_type: result.error_category,
            jobs_found: None,
            jobs_analyzed: None,
            email_sent: None,
        };

        if let Some(data) = &result.data {
            entry.jobs_found = data
                .get("jobs")
                .and_then(Value::as_array)
                .map(|jobs| jobs.len() as u64);
            entry.jobs_analyzed = data
                .get("analyzed_jobs")
                .and_then(Value::as_array)
                .map(|jobs| jobs.len() as u64);
            entry.email_sent = data.get("email_sent").and_then(Value::as_bool);
        }

        debug!(
            "Logged execution of '{}' (success={}, attempts={})",
            agent, result.success, attempts
        );
        self.execution_log.push(entry);
    }

    /// Log entries, optionally filtered to one agent.
    pub fn execution_logs(&self, agent: Option<&str>) -> Vec<ExecutionLogEntry> {
        match agent {
            Some(name) => self
                .execution_log
                .iter()
                .filter(|entry| entry.agent == name)
                .cloned()
                .collect(),
            None => self.execution_log.clone(),
        }
    }

    pub fn execution_stats(&self) -> ExecutionStats {
        let total = self.execution_log.len();
        if total == 0 {
            return ExecutionStats::default();
        }

        let successful = self
            .execution_log
            .iter()
            .filter(|entry| entry.success)
            .count();
        let duration_sum: f64 = self
            .execution_log
            .iter()
            .map(|entry| entry.duration_seconds)
            .sum();
        let attempt_sum: u64 = self
            .execution_log
            .iter()
            .map(|entry| entry.attempts as u64)
            .sum();

        ExecutionStats {
            total_executions: total,
            successful,
            failed: total - successful,
            success_rate: round1(successful as f64 / total as f64 * 100.0),
            average_duration_seconds: round2(duration_sum / total as f64),
            average_attempts: round2(attempt_sum as f64 / total as f64),
        }
    }

    pub fn clear_logs(&mut self) {
        self.execution_log.clear();
    }
}

impl Default for AgentRunner {
    fn default() -> Self {
        Self::new()
    }
}

/// Contract checks for the known stage outputs. Unknown stage names pass
/// through so custom stages can define their own shapes.
pub fn validate_stage_output(agent: &str, output: &Value) -> std::result::Result<(), String> {
    match agent {
        "scraper" => match output.get("jobs") {
            Some(jobs) if jobs.is_array() => Ok(()),
            Some(_) => Err(format!(
                "Output validation failed for '{}': 'jobs' must be a list",
                agent
            )),
            None => Err(format!(
                "Output validation failed for '{}': missing required field 'jobs'",
                agent
            )),
        },
        "analyzer" => {
            for field in ["analyzed_jobs", "skill_frequency"] {
                if output.get(field).is_none() {
                    return Err(format!(
                        "Output validation failed for '{}': missing required field '{}'",
                        agent, field
                    ));
                }
            }
            Ok(())
        }
        "notifier" => match output.get("email_sent") {
            Some(sent) if sent.is_boolean() => Ok(()),
            Some(_) => Err(format!(
                "Output validation failed for '{}': 'email_sent' must be a boolean",
                agent
            )),
            None => Err(format!(
                "Output validation failed for '{}': missing required field 'email_sent'",
                agent
            )),
        },
        _ => Ok(()),
    }
}
