pub mod orchestrator;
pub mod runner;
pub mod stage;


#[cfg(test)]
mod orchestrator_test;

pub use orchestrator::{
    run_detached, HealthSummary, Orchestrator, PipelineRun, RunError, StageOutcome, StatusReport,
};
pub use runner::{validate_stage_output, AgentRunner, ExecutionLogEntry, ExecutionStats};
pub use stage::{ExecutionResult, Stage, StageKind, PIPELINE_ORDER};
