use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agents::runner::{round1, round2, AgentRunner, ExecutionStats};
use crate::agents::stage::{ExecutionResult, Stage, StageKind, PIPELINE_ORDER};
use crate::config::{OrchestratorConfig, StorageConfig};
use crate::context::{
    AgentState, AgentStatus, ContextManager, ErrorRecord, PipelineState, PipelineStatus, TrendData,
};
use crate::error::Result;

pub type StageStartCallback = Box<dyn Fn(&str) -> Result<()> + Send + Sync>;
pub type StageCompleteCallback = Box<dyn Fn(&str, &ExecutionResult) -> Result<()> + Send + Sync>;
pub type PipelineCompleteCallback = Box<dyn Fn(&PipelineRun) -> Result<()> + Send + Sync>;

/// Summary of one pipeline pass
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub status: PipelineStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub completed_agents: Vec<String>,
    pub failed_agents: Vec<String>,
    pub agents: BTreeMap<String, StageOutcome>,
    pub errors: Vec<RunError>,
}

/// Per-agent outcome within a pipeline run
#[derive(Debug, Clone, Serialize)]
pub struct StageOutcome {
    pub success: bool,
    pub duration_seconds: f64,
    pub retries_used: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&ExecutionResult> for StageOutcome {
    fn from(result: &ExecutionResult) -> Self {
        Self {
            success: result.success,
            duration_seconds: round2(result.duration.as_secs_f64()),
            retries_used: result.retries_used,
            error: result.error.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunError {
    pub agent: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub total_agents: usize,
    pub healthy_agents: usize,
    pub health_percentage: f64,
}

/// Comprehensive orchestrator status for operational queries
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub pipeline: PipelineState,
    pub agents: BTreeMap<String, AgentState>,
    pub health: HealthSummary,
    pub registered_agents: Vec<String>,
    pub recent_errors: Vec<ErrorRecord>,
    pub execution_stats: ExecutionStats,
}

/// Sequences the registered agents in pipeline order, threads each agent's
/// output into the next one, and keeps the persisted context in step with
/// what actually happened.
pub struct Orchestrator {
    config: OrchestratorConfig,
    storage: StorageConfig,
    context: ContextManager,
    runner: AgentRunner,
    stages: HashMap<String, Arc<dyn Stage>>,
    on_agent_start: Option<StageStartCallback>,
    on_agent_complete: Option<StageCompleteCallback>,
    on_pipeline_complete: Option<PipelineCompleteCallback>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        storage: StorageConfig,
        context: ContextManager,
    ) -> Self {
        Self {
            config,
            storage,
            context,
            runner: AgentRunner::new(),
            stages: HashMap::new(),
            on_agent_start: None,
            on_agent_complete: None,
            on_pipeline_complete: None,
        }
    }

    pub fn with_runner(mut self, runner: AgentRunner) -> Self {
        self.runner = runner;
        self
    }

    /// Register an agent implementation under the name it reports
    pub fn register_stage(&mut self, stage: Arc<dyn Stage>) {
        let name = stage.name().to_string();
        info!("Registered agent '{}'", name);
        self.stages.insert(name, stage);
    }

    pub fn registered_stages(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stages.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn on_agent_start<F>(&mut self, callback: F)
    where
        F: Fn(&str) -> Result<()> + Send + Sync + 'static,
    {
        self.on_agent_start = Some(Box::new(callback));
    }

    pub fn on_agent_complete<F>(&mut self, callback: F)
    where
        F: Fn(&str, &ExecutionResult) -> Result<()> + Send + Sync + 'static,
    {
        self.on_agent_complete = Some(Box::new(callback));
    }

    pub fn on_pipeline_complete<F>(&mut self, callback: F)
    where
        F: Fn(&PipelineRun) -> Result<()> + Send + Sync + 'static,
    {
        self.on_pipeline_complete = Some(Box::new(callback));
    }

    pub fn context(&self) -> &ContextManager {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut ContextManager {
        &mut self.context
    }

    pub fn runner(&self) -> &AgentRunner {
        &self.runner
    }

    pub fn runner_mut(&mut self) -> &mut AgentRunner {
        &mut self.runner
    }

    /// Run the full agent sequence. Agents named in `skip` are left out;
    /// `stop_on_error` falls back to the configured default when `None`.
    pub async fn run_pipeline(
        &mut self,
        skip: &[&str],
        stop_on_error: Option<bool>,
    ) -> PipelineRun {
        let stop_on_error = stop_on_error.unwrap_or(self.config.stop_on_error);
        let run_id = Uuid::new_v4();
        info!(
            "Starting pipeline run {} (stop_on_error={})",
            run_id, stop_on_error
        );
        self.context.start_pipeline().await;

        let mut run = PipelineRun {
            run_id,
            status: PipelineStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            completed_agents: Vec::new(),
            failed_agents: Vec::new(),
            agents: BTreeMap::new(),
            errors: Vec::new(),
        };
        let mut previous_output: Option<Value> = None;
        let mut aborted = false;

        for kind in PIPELINE_ORDER {
            let name = kind.as_str();
            if skip.contains(&name) {
                info!("Skipping agent '{}'", name);
                continue;
            }

            if !self.stages.contains_key(name) {
                let message = format!("No implementation registered for agent '{}'", name);
                error!("{}", message);
                self.context.add_error(name, &message).await;
                run.errors.push(RunError {
                    agent: name.to_string(),
                    error: message,
                });
                run.failed_agents.push(name.to_string());
                if stop_on_error {
                    aborted = true;
                    break;
                }
                continue;
            }

            let result = self.execute_agent(name, previous_output.as_ref()).await;
            run.agents
                .insert(name.to_string(), StageOutcome::from(&result));

            if result.success {
                run.completed_agents.push(name.to_string());
                if kind == StageKind::Analyzer {
                    if let Some(output) = &result.data {
                        self.record_daily_history(output).await;
                    }
                }
                previous_output = result.data;
            } else {
                let message = result
                    .error
                    .clone()
                    .unwrap_or_else(|| "unknown failure".to_string());
                run.errors.push(RunError {
                    agent: name.to_string(),
                    error: message,
                });
                run.failed_agents.push(name.to_string());
                // downstream agents fall back to persisted files
                previous_output = None;
                if stop_on_error {
                    aborted = true;
                    break;
                }
            }
        }

        run.status = if aborted {
            PipelineStatus::Failed
        } else if run.failed_agents.is_empty() {
            PipelineStatus::Completed
        } else if !run.completed_agents.is_empty() {
            PipelineStatus::Partial
        } else {
            PipelineStatus::Failed
        };
        run.completed_at = Some(Utc::now());

        if run.status == PipelineStatus::Failed && run.completed_agents.is_empty() {
            self.context.fail_pipeline("All agents failed").await;
        } else {
            self.context.complete_pipeline(run.status).await;
        }

        if let Some(callback) = &self.on_pipeline_complete {
            if let Err(e) = callback(&run) {
                warn!("on_pipeline_complete callback failed: {}", e);
            }
        }

        info!(
            "Pipeline run {} finished with status '{}' ({} completed, {} failed)",
            run_id,
            run.status,
            run.completed_agents.len(),
            run.failed_agents.len()
        );
        run
    }

    /// Execute a single registered agent with full context bookkeeping.
    /// Also usable on its own for single-agent invocations.
    pub async fn execute_agent(&mut self, name: &str, input: Option<&Value>) -> ExecutionResult {
        let Some(stage) = self.stages.get(name).cloned() else {
            let message = format!("No implementation registered for agent '{}'", name);
            error!("{}", message);
            self.context.add_error(name, &message).await;
            let category = self.runner.classify(&message);
            return ExecutionResult::failed(message, category, Duration::ZERO, 0);
        };

        if let Some(callback) = &self.on_agent_start {
            if let Err(e) = callback(name) {
                warn!("on_agent_start callback failed for '{}': {}", name, e);
            }
        }

        self.context.set_current_agent(Some(name)).await;
        self.context
            .set_agent_status(name, AgentStatus::Running)
            .await;

        let result = self
            .runner
            .run_with_retry(stage.as_ref(), input, self.config.max_retries)
            .await;

        let duration_seconds = round2(result.duration.as_secs_f64());
        if result.success {
            let metrics = Self::extract_metrics(result.data.as_ref());
            self.context
                .update_agent_state(name, AgentStatus::Completed, duration_seconds, metrics)
                .await;
        } else {
            self.context
                .update_agent_state(name, AgentStatus::Failed, duration_seconds, Map::new())
                .await;
            let message = result
                .error
                .clone()
                .unwrap_or_else(|| "unknown failure".to_string());
            self.context.add_error(name, &message).await;
        }

        self.context.set_current_agent(None).await;

        if let Some(callback) = &self.on_agent_complete {
            if let Err(e) = callback(name, &result) {
                warn!("on_agent_complete callback failed for '{}': {}", name, e);
            }
        }

        if self.config.auto_save_context {
            if let Err(e) = self.context.save().await {
                warn!("Failed to persist context after '{}': {}", name, e);
            }
        }

        result
    }

    /// Classify and record an out-of-band agent error; when the category's
    /// policy allows retries, re-execute the agent with input recovered from
    /// the preceding agent's persisted output.
    pub async fn handle_error(
        &mut self,
        agent: &str,
        error_message: &str,
        auto_retry: bool,
    ) -> Option<ExecutionResult> {
        let category = self.runner.classify(error_message);
        error!(
            "Handling {} error for agent '{}': {}",
            category, agent, error_message
        );
        self.context.add_error(agent, error_message).await;

        if !auto_retry || category.retry_policy().max_retries == 0 {
            return None;
        }

        let input = self.cached_input_for(agent).await;
        info!("Re-executing agent '{}' after {} error", agent, category);
        let result = self.execute_agent(agent, input.as_ref()).await;
        if result.success {
            self.context.resolve_error(agent).await;
            info!("Agent '{}' recovered", agent);
        }
        Some(result)
    }

    /// Read the preceding agent's last persisted output so recovery does
    /// not require re-running that agent.
    async fn cached_input_for(&self, agent: &str) -> Option<Value> {
        let path = match StageKind::from_name(agent)? {
            StageKind::Scraper => return None,
            StageKind::Analyzer => self.storage.jobs_path(),
            StageKind::Notifier => self.storage.analysis_path(),
        };

        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(value) => {
                    debug!(
                        "Recovered cached input for '{}' from {}",
                        agent,
                        path.display()
                    );
                    Some(value)
                }
                Err(e) => {
                    warn!("Cached input at {} is unreadable: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                debug!(
                    "No cached input for '{}' at {}: {}",
                    agent,
                    path.display(),
                    e
                );
                None
            }
        }
    }

    fn extract_metrics(data: Option<&Value>) -> Map<String, Value> {
        let mut metrics = Map::new();
        if let Some(data) = data {
            if let Some(jobs) = data.get("jobs").and_then(Value::as_array) {
                metrics.insert("jobs_found".to_string(), json!(jobs.len()));
            }
            if let Some(analyzed) = data.get("analyzed_jobs").and_then(Value::as_array) {
                metrics.insert("jobs_analyzed".to_string(), json!(analyzed.len()));
            }
            if let Some(sent) = data.get("email_sent").and_then(Value::as_bool) {
                metrics.insert("email_sent".to_string(), json!(sent));
            }
        }
        metrics
    }

    /// Fold successful analyzer output into the rolling daily history
    async fn record_daily_history(&mut self, output: &Value) {
        let total_jobs = output
            .get("analyzed_jobs")
            .and_then(Value::as_array)
            .map(|jobs| jobs.len() as u64)
            .unwrap_or(0);
        let top_skills: Vec<String> = output
            .get("insights")
            .and_then(|insights| insights.get("top_skills"))
            .and_then(Value::as_array)
            .map(|skills| {
                skills
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let skill_frequency: BTreeMap<String, u64> = output
            .get("skill_frequency")
            .and_then(Value::as_object)
            .map(|frequency| {
                frequency
                    .iter()
                    .filter_map(|(skill, count)| count.as_u64().map(|n| (skill.clone(), n)))
                    .collect()
            })
            .unwrap_or_default();

        self.context
            .update_history(None, total_jobs, top_skills, skill_frequency)
            .await;
        debug!("Folded analyzer output into daily history");
    }

    /// Comprehensive status snapshot for the status query
    pub fn pipeline_status(&self) -> StatusReport {
        let agents = self.context.agent_states().clone();
        let total_agents = agents.len();
        let healthy_agents = agents
            .values()
            .filter(|state| matches!(state.status, AgentStatus::Completed | AgentStatus::Idle))
            .count();
        let health_percentage = if total_agents == 0 {
            0.0
        } else {
            round1(healthy_agents as f64 / total_agents as f64 * 100.0)
        };

        StatusReport {
            pipeline: self.context.pipeline_state().clone(),
            agents,
            health: HealthSummary {
                total_agents,
                healthy_agents,
                health_percentage,
            },
            registered_agents: self.registered_stages(),
            recent_errors: self.context.recent_errors(5).to_vec(),
            execution_stats: self.runner.execution_stats(),
        }
    }

    pub fn trend_data(&self, days: u32) -> TrendData {
        self.context.trend_data(days)
    }

    /// Clear persisted context and execution logs back to a fresh state
    pub async fn reset(&mut self) {
        self.context.reset().await;
        self.runner.clear_logs();
        info!("Orchestrator state reset");
    }
}

/// Run the whole pipeline on a background task, handing the orchestrator
/// back with the run summary once it finishes.
pub fn run_detached(
    mut orchestrator: Orchestrator,
    skip: Vec<String>,
    stop_on_error: Option<bool>,
) -> JoinHandle<(Orchestrator, PipelineRun)> {
    tokio::spawn(async move {
        let skip_refs: Vec<&str> = skip.iter().map(String::as_str).collect();
        let run = orchestrator.run_pipeline(&skip_refs, stop_on_error).await;
        (orchestrator, run)
    })
}
