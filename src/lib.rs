pub mod agents;
pub mod analyzer;
pub mod browser;
pub mod config;
pub mod context;
pub mod error;
pub mod notifier;
pub mod scraper;

pub use agents::{AgentRunner, Orchestrator, PipelineRun, Stage};
pub use config::Config;
pub use context::{ContextManager, PipelineStatus};
pub use error::{PipelineError, Result};
