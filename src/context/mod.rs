use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::agents::stage::PIPELINE_ORDER;
use crate::error::Result;

pub const MAX_ERROR_RECORDS: usize = 100;
pub const HISTORY_WINDOW_DAYS: i64 = 90;
pub const MAX_TREND_POINTS: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    Idle,
    Running,
    Completed,
    Failed,
    Partial,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Idle => "idle",
            PipelineStatus::Running => "running",
            PipelineStatus::Completed => "completed",
            PipelineStatus::Failed => "failed",
            PipelineStatus::Partial => "partial",
        }
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Running => "running",
            AgentStatus::Completed => "completed",
            AgentStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    pub status: PipelineStatus,
    pub current_agent: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            status: PipelineStatus::Idle,
            current_agent: None,
            started_at: None,
            last_updated: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub last_run: Option<DateTime<Utc>>,
    pub status: AgentStatus,
    pub duration_seconds: f64,
    /// Stage-specific counters (jobs_found, jobs_analyzed, email_sent).
    #[serde(default)]
    pub metrics: Map<String, Value>,
}

impl Default for AgentState {
    fn default() -> Self {
        Self {
            last_run: None,
            status: AgentStatus::Idle,
            duration_seconds: 0.0,
            metrics: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub agent: String,
    pub error: String,
    pub resolved: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyStat {
    pub date: NaiveDate,
    pub total_jobs: u64,
    pub top_skills: Vec<String>,
    pub skill_frequency: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct History {
    pub daily_stats: Vec<DailyStat>,
    pub skill_trends: BTreeMap<String, Vec<u64>>,
}

/// The whole persisted state document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineContext {
    pub pipeline_state: PipelineState,
    pub agent_states: BTreeMap<String, AgentState>,
    pub history: History,
    pub errors: Vec<ErrorRecord>,
}

impl Default for PipelineContext {
    fn default() -> Self {
        let mut agent_states = BTreeMap::new();
        for kind in PIPELINE_ORDER {
            agent_states.insert(kind.as_str().to_string(), AgentState::default());
        }
        Self {
            pipeline_state: PipelineState::default(),
            agent_states,
            history: History::default(),
            errors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrendData {
    pub daily_stats: Vec<DailyStat>,
    pub skill_trends: BTreeMap<String, Vec<u64>>,
    pub period_days: u32,
    pub data_points: usize,
}

/// Owns the context document: loads it at startup, hands out typed views, and
/// rewrites the whole file after every mutation.
pub struct ContextManager {
    path: PathBuf,
    context: PipelineContext,
}

impl ContextManager {
    /// Loads the context from `path`. A missing file starts fresh; a corrupt
    /// file is discarded and recreated so a bad write never blocks the next
    /// run.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => match serde_json::from_str::<PipelineContext>(&raw) {
                Ok(context) => {
                    debug!("Loaded context from {}", path.display());
                    Ok(Self { path, context })
                }
                Err(e) => {
                    error!(
                        "Context file {} is corrupt ({}); recreating defaults",
                        path.display(),
                        e
                    );
                    let mut manager = Self {
                        path,
                        context: PipelineContext::default(),
                    };
                    manager.save().await?;
                    Ok(manager)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No context file at {}; starting fresh", path.display());
                let mut manager = Self {
                    path,
                    context: PipelineContext::default(),
                };
                manager.save().await?;
                Ok(manager)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn context(&self) -> &PipelineContext {
        &self.context
    }

    pub fn pipeline_state(&self) -> &PipelineState {
        &self.context.pipeline_state
    }

    pub fn agent_states(&self) -> &BTreeMap<String, AgentState> {
        &self.context.agent_states
    }

    /// Serializes the whole document and replaces the file via a temp-file
    /// rename, so a crash mid-write leaves the previous document intact.
    pub async fn save(&mut self) -> Result<()> {
        self.context.pipeline_state.last_updated = Some(Utc::now());
        let serialized = serde_json::to_string_pretty(&self.context)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serialized.as_bytes()).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("Persisted context to {}", self.path.display());
        Ok(())
    }

    async fn persist(&mut self) {
        if let Err(e) = self.save().await {
            warn!(
                "Failed to persist context to {}: {}",
                self.path.display(),
                e
            );
        }
    }

    pub async fn set_current_agent(&mut self, agent: Option<&str>) {
        self.context.pipeline_state.current_agent = agent.map(str::to_string);
        self.persist().await;
    }

    /// Flips an agent's status without touching its recorded metrics.
    pub async fn set_agent_status(&mut self, agent: &str, status: AgentStatus) {
        match self.context.agent_states.get_mut(agent) {
            Some(state) => state.status = status,
            None => {
                warn!("Ignoring status update for unknown agent '{}'", agent);
                return;
            }
        }
        self.persist().await;
    }

    /// Overwrites an agent's state wholesale after a completed or failed run.
    pub async fn update_agent_state(
        &mut self,
        agent: &str,
        status: AgentStatus,
        duration_seconds: f64,
        metrics: Map<String, Value>,
    ) {
        match self.context.agent_states.get_mut(agent) {
            Some(state) => {
                state.last_run = Some(Utc::now());
                state.status = status;
                state.duration_seconds = duration_seconds;
                state.metrics = metrics;
            }
            None => {
                warn!("Ignoring state update for unknown agent '{}'", agent);
                return;
            }
        }
        self.persist().await;
    }

    pub async fn start_pipeline(&mut self) {
        let state = &mut self.context.pipeline_state;
        state.status = PipelineStatus::Running;
        state.started_at = Some(Utc::now());
        state.current_agent = None;
        self.persist().await;
    }

    pub async fn complete_pipeline(&mut self, status: PipelineStatus) {
        self.context.pipeline_state.status = status;
        self.context.pipeline_state.current_agent = None;
        self.persist().await;
    }

    pub async fn fail_pipeline(&mut self, error: &str) {
        self.context.pipeline_state.status = PipelineStatus::Failed;
        self.context.pipeline_state.current_agent = None;
        self.push_error_record("pipeline", error);
        self.persist().await;
    }

    fn push_error_record(&mut self, agent: &str, message: &str) {
        self.context.errors.push(ErrorRecord {
            timestamp: Utc::now(),
            agent: agent.to_string(),
            error: message.to_string(),
            resolved: false,
        });
        let overflow = self.context.errors.len().saturating_sub(MAX_ERROR_RECORDS);
        if overflow > 0 {
            self.context.errors.drain(..overflow);
        }
    }

    pub async fn add_error(&mut self, agent: &str, message: &str) {
        self.push_error_record(agent, message);
        self.persist().await;
    }

    /// Marks the most recent unresolved error for `agent` as resolved.
    pub async fn resolve_error(&mut self, agent: &str) -> bool {
        let record = self
            .context
            .errors
            .iter_mut()
            .rev()
            .find(|record| record.agent == agent && !record.resolved);
        match record {
            Some(record) => {
                record.resolved = true;
                self.persist().await;
                true
            }
            None => false,
        }
    }

    /// The most recent `limit` errors, oldest first.
    pub fn recent_errors(&self, limit: usize) -> &[ErrorRecord] {
        let len = self.context.errors.len();
        &self.context.errors[len - limit.min(len)..]
    }

    pub fn unresolved_errors(&self) -> Vec<&ErrorRecord> {
        self.context
            .errors
            .iter()
            .filter(|record| !record.resolved)
            .collect()
    }

    /// Upserts the daily stat for `date` (today when `None`), appends each
    /// skill's count to its trend series, and prunes stats that fell out of
    /// the trailing window. One call, one persist.
    pub async fn update_history(
        &mut self,
        date: Option<NaiveDate>,
        total_jobs: u64,
        top_skills: Vec<String>,
        skill_frequency: BTreeMap<String, u64>,
    ) {
        let date = date.unwrap_or_else(|| Utc::now().date_naive());
        let stat = DailyStat {
            date,
            total_jobs,
            top_skills,
            skill_frequency: skill_frequency.clone(),
        };

        let stats = &mut self.context.history.daily_stats;
        match stats.iter_mut().find(|existing| existing.date == date) {
            Some(existing) => *existing = stat,
            None => stats.push(stat),
        }

        for (skill, count) in &skill_frequency {
            let series = self
                .context
                .history
                .skill_trends
                .entry(skill.clone())
                .or_default();
            series.push(*count);
            let excess = series.len().saturating_sub(MAX_TREND_POINTS);
            if excess > 0 {
                series.drain(..excess);
            }
        }

        let cutoff = Utc::now().date_naive() - chrono::Duration::days(HISTORY_WINDOW_DAYS);
        self.context
            .history
            .daily_stats
            .retain(|stat| stat.date >= cutoff);

        self.persist().await;
    }

    pub fn trend_data(&self, days: u32) -> TrendData {
        let cutoff = Utc::now().date_naive() - chrono::Duration::days(days as i64);
        let daily_stats: Vec<DailyStat> = self
            .context
            .history
            .daily_stats
            .iter()
            .filter(|stat| stat.date >= cutoff)
            .cloned()
            .collect();
        TrendData {
            data_points: daily_stats.len(),
            daily_stats,
            skill_trends: self.context.history.skill_trends.clone(),
            period_days: days,
        }
    }

    pub async fn reset(&mut self) {
        self.context = PipelineContext::default();
        self.persist().await;
        info!("Context reset to defaults");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn frequency(pairs: &[(&str, u64)]) -> BTreeMap<String, u64> {
        pairs
            .iter()
            .map(|(skill, count)| (skill.to_string(), *count))
            .collect()
    }

    #[tokio::test]
    async fn missing_file_starts_fresh_and_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("context.json");

        let manager = ContextManager::load(&path).await.unwrap();

        assert!(path.exists());
        assert_eq!(manager.pipeline_state().status, PipelineStatus::Idle);
        assert_eq!(manager.agent_states().len(), 3);
        assert!(manager.agent_states().contains_key("scraper"));
    }

    #[tokio::test]
    async fn corrupt_file_is_recreated_from_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("context.json");
        tokio::fs::write(&path, b"{not json at all").await.unwrap();

        let manager = ContextManager::load(&path).await.unwrap();

        assert_eq!(manager.pipeline_state().status, PipelineStatus::Idle);
        // The recreated document must parse on the next load.
        let reloaded = ContextManager::load(&path).await.unwrap();
        assert!(reloaded.context().errors.is_empty());
    }

    #[tokio::test]
    async fn save_round_trips_mutations() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("context.json");

        {
            let mut manager = ContextManager::load(&path).await.unwrap();
            manager.start_pipeline().await;
            let mut metrics = Map::new();
            metrics.insert("jobs_found".to_string(), json!(12));
            manager
                .update_agent_state("scraper", AgentStatus::Completed, 3.5, metrics)
                .await;
        }

        let manager = ContextManager::load(&path).await.unwrap();
        assert_eq!(manager.pipeline_state().status, PipelineStatus::Running);
        let scraper = &manager.agent_states()["scraper"];
        assert_eq!(scraper.status, AgentStatus::Completed);
        assert_eq!(scraper.duration_seconds, 3.5);
        assert_eq!(scraper.metrics["jobs_found"], json!(12));
        assert!(scraper.last_run.is_some());
    }

    #[tokio::test]
    async fn save_leaves_no_temp_file_behind() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("context.json");

        let mut manager = ContextManager::load(&path).await.unwrap();
        manager.save().await.unwrap();

        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["context.json"]);
    }

    #[tokio::test]
    async fn unknown_agent_updates_are_ignored() {
        let dir = tempdir().unwrap();
        let mut manager = ContextManager::load(dir.path().join("context.json"))
            .await
            .unwrap();

        manager
            .update_agent_state("mystery", AgentStatus::Completed, 1.0, Map::new())
            .await;

        assert!(!manager.agent_states().contains_key("mystery"));
        assert_eq!(manager.agent_states().len(), 3);
    }

    #[tokio::test]
    async fn error_log_caps_at_limit_evicting_oldest() {
        let dir = tempdir().unwrap();
        let mut manager = ContextManager::load(dir.path().join("context.json"))
            .await
            .unwrap();

        for i in 0..MAX_ERROR_RECORDS + 10 {
            manager.add_error("scraper", &format!("error {}", i)).await;
        }

        let errors = &manager.context().errors;
        assert_eq!(errors.len(), MAX_ERROR_RECORDS);
        assert_eq!(errors[0].error, "error 10");
        assert_eq!(errors.last().unwrap().error, "error 109");
    }

    #[tokio::test]
    async fn resolve_error_flips_most_recent_unresolved() {
        let dir = tempdir().unwrap();
        let mut manager = ContextManager::load(dir.path().join("context.json"))
            .await
            .unwrap();

        manager.add_error("analyzer", "first failure").await;
        manager.add_error("scraper", "other agent").await;
        manager.add_error("analyzer", "second failure").await;

        assert!(manager.resolve_error("analyzer").await);

        let errors = &manager.context().errors;
        assert!(!errors[0].resolved);
        assert!(!errors[1].resolved);
        assert!(errors[2].resolved);
        assert_eq!(manager.unresolved_errors().len(), 2);

        // Next resolution takes the remaining analyzer entry.
        assert!(manager.resolve_error("analyzer").await);
        assert!(manager.context().errors[0].resolved);
        assert!(!manager.resolve_error("analyzer").await);
    }

    #[tokio::test]
    async fn update_history_upserts_by_date() {
        let dir = tempdir().unwrap();
        let mut manager = ContextManager::load(dir.path().join("context.json"))
            .await
            .unwrap();
        let today = Utc::now().date_naive();

        manager
            .update_history(
                Some(today),
                10,
                vec!["python".to_string()],
                frequency(&[("python", 8)]),
            )
            .await;
        manager
            .update_history(
                Some(today),
                14,
                vec!["sql".to_string()],
                frequency(&[("sql", 9)]),
            )
            .await;

        let stats = &manager.context().history.daily_stats;
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].total_jobs, 14);
        assert_eq!(stats[0].top_skills, vec!["sql"]);
    }

    #[tokio::test]
    async fn skill_trends_cap_at_thirty_points() {
        let dir = tempdir().unwrap();
        let mut manager = ContextManager::load(dir.path().join("context.json"))
            .await
            .unwrap();
        let today = Utc::now().date_naive();

        for i in 0..MAX_TREND_POINTS as u64 + 5 {
            manager
                .update_history(Some(today), i, Vec::new(), frequency(&[("python", i)]))
                .await;
        }

        let series = &manager.context().history.skill_trends["python"];
        assert_eq!(series.len(), MAX_TREND_POINTS);
        // Oldest observations were evicted first.
        assert_eq!(series[0], 5);
        assert_eq!(*series.last().unwrap(), 34);
    }

    #[tokio::test]
    async fn daily_stats_outside_window_are_pruned() {
        let dir = tempdir().unwrap();
        let mut manager = ContextManager::load(dir.path().join("context.json"))
            .await
            .unwrap();
        let today = Utc::now().date_naive();
        let stale = today - chrono::Duration::days(HISTORY_WINDOW_DAYS + 5);
        let recent = today - chrono::Duration::days(3);

        manager
            .update_history(Some(stale), 5, Vec::new(), frequency(&[("python", 5)]))
            .await;
        // The stale entry is dropped as soon as the window is enforced.
        assert!(manager.context().history.daily_stats.is_empty());

        manager
            .update_history(Some(recent), 7, Vec::new(), frequency(&[("python", 7)]))
            .await;
        let stats = &manager.context().history.daily_stats;
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].date, recent);
    }

    #[tokio::test]
    async fn trend_data_filters_by_period() {
        let dir = tempdir().unwrap();
        let mut manager = ContextManager::load(dir.path().join("context.json"))
            .await
            .unwrap();
        let today = Utc::now().date_naive();

        manager
            .update_history(
                Some(today - chrono::Duration::days(40)),
                3,
                Vec::new(),
                frequency(&[("python", 3)]),
            )
            .await;
        manager
            .update_history(
                Some(today - chrono::Duration::days(2)),
                6,
                Vec::new(),
                frequency(&[("python", 6)]),
            )
            .await;

        let trends = manager.trend_data(30);
        assert_eq!(trends.period_days, 30);
        assert_eq!(trends.data_points, 1);
        assert_eq!(trends.daily_stats[0].total_jobs, 6);
        assert_eq!(trends.skill_trends["python"], vec![3, 6]);

        let wide = manager.trend_data(60);
        assert_eq!(wide.data_points, 2);
    }

    #[tokio::test]
    async fn reset_restores_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("context.json");
        let mut manager = ContextManager::load(&path).await.unwrap();

        manager.start_pipeline().await;
        manager.add_error("scraper", "boom").await;
        manager.reset().await;

        assert_eq!(manager.pipeline_state().status, PipelineStatus::Idle);
        assert!(manager.context().errors.is_empty());

        let reloaded = ContextManager::load(&path).await.unwrap();
        assert!(reloaded.context().errors.is_empty());
    }

    #[tokio::test]
    async fn recent_errors_returns_newest_slice() {
        let dir = tempdir().unwrap();
        let mut manager = ContextManager::load(dir.path().join("context.json"))
            .await
            .unwrap();

        for i in 0..8 {
            manager.add_error("scraper", &format!("error {}", i)).await;
        }

        let recent = manager.recent_errors(5);
        assert_eq!(recent.len(), 5);
        assert_eq!(recent[0].error, "error 3");
        assert_eq!(recent[4].error, "error 7");

        assert_eq!(manager.recent_errors(50).len(), 8);
    }
}
