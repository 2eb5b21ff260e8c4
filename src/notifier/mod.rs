pub mod delivery;
pub mod report;

use async_trait::async_trait;
use chrono::{Local, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use crate::agents::Stage;
use crate::config::{NotifierConfig, StorageConfig};
use crate::error::{PipelineError, Result};

pub use delivery::{deliver_with_retry, DeliveryProvider, EmailMessage, MailGateway};
pub use report::{render_html, ReportData, SkillBar};

/// The notify stage: renders the analysis into an HTML report, saves it to a
/// dated file, and delivers it by email.
///
/// Email delivery failure after retries downgrades the run to "partial"
/// instead of failing the stage, since the report itself already exists.
pub struct NotifierStage {
    config: NotifierConfig,
    storage: StorageConfig,
    provider: Option<Arc<dyn DeliveryProvider>>,
}

impl NotifierStage {
    pub fn new(config: NotifierConfig, storage: StorageConfig) -> Self {
        Self {
            config,
            storage,
            provider: None,
        }
    }

    /// Replaces the mail gateway with a caller-supplied provider.
    pub fn with_provider(
        config: NotifierConfig,
        storage: StorageConfig,
        provider: Arc<dyn DeliveryProvider>,
    ) -> Self {
        Self {
            config,
            storage,
            provider: Some(provider),
        }
    }

    async fn load_analysis(&self, input: Option<&Value>) -> Result<Value> {
        if let Some(doc) = input {
            if doc.get("analyzed_jobs").is_some() {
                return Ok(doc.clone());
            }
        }

        let path = self.storage.analysis_path();
        let raw = tokio::fs::read_to_string(&path).await.map_err(|e| {
            PipelineError::StorageError(format!(
                "analysis file not found at {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    async fn save_report(&self, html: &str) -> Result<std::path::PathBuf> {
        let path = self.storage.report_path(Local::now().date_naive());
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&path, html).await?;
        info!("Report saved to {}", path.display());
        Ok(path)
    }

    async fn deliver(&self, data: &ReportData, html: String) -> Result<()> {
        let message = EmailMessage {
            from: self.config.sender.clone(),
            to: self.config.recipient.clone(),
            subject: format!(
                "{} {} ({} jobs)",
                self.config.subject_prefix, data.report_date, data.total_jobs
            ),
            html_body: html,
        };

        match &self.provider {
            Some(provider) => deliver_with_retry(provider.as_ref(), &message).await,
            None => {
                let gateway = MailGateway::new(&self.config)?;
                deliver_with_retry(&gateway, &message).await
            }
        }
    }
}

#[async_trait]
impl Stage for NotifierStage {
    fn name(&self) -> &str {
        "notifier"
    }

    async fn run(&self, input: Option<&Value>) -> Result<Value> {
        info!("Starting notification process");
        let started = Utc::now();
        let mut errors: Vec<String> = Vec::new();

        let analysis = self.load_analysis(input).await?;
        let data = ReportData::from_analysis(&analysis)?;
        let html = render_html(&data);
        info!(
            "Report created: {} characters, {} jobs",
            html.len(),
            data.total_jobs
        );

        let mut report_path = None;
        if self.config.save_report {
            report_path = Some(self.save_report(&html).await?);
        }

        let mut email_sent = false;
        if self.config.send_email {
            match self.deliver(&data, html).await {
                Ok(()) => email_sent = true,
                Err(e) => {
                    warn!("Email delivery failed: {}", e);
                    errors.push(format!("Email sending failed: {}", e));
                }
            }
        }

        let status = if self.config.send_email && !email_sent {
            "partial"
        } else {
            "completed"
        };

        Ok(json!({
            "status": status,
            "timestamp": started,
            "jobs_count": data.total_jobs,
            "report_saved": report_path.is_some(),
            "report_path": report_path,
            "email_sent": email_sent,
            "errors": errors,
            "completed_at": Utc::now(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::delivery::MockDeliveryProvider;
    use super::*;
    use crate::config::Config;
    use tempfile::tempdir;

    fn stage_config(dir: &std::path::Path, send_email: bool) -> (NotifierConfig, StorageConfig) {
        let mut config = Config::default();
        config.storage.data_dir = dir.to_path_buf();
        config.notifier.send_email = send_email;
        config.notifier.save_report = true;
        (config.notifier, config.storage)
    }

    fn analysis() -> Value {
        json!({
            "analyzed_jobs": [
                {"job_id": "1", "title": "Data Engineer", "company": "Maple",
                 "location": "Toronto", "summary": "Build pipelines."},
            ],
            "skill_frequency": {"Python": 3, "SQL": 1},
            "insights": {
                "top_skills": ["Python"],
                "trending_skills": [],
                "recommendation": "Learn Python.",
            },
        })
    }

    #[tokio::test]
    async fn saves_report_and_sends_email() {
        let dir = tempdir().unwrap();
        let (notifier, storage) = stage_config(dir.path(), true);
        let mut provider = MockDeliveryProvider::new();
        provider
            .expect_send()
            .times(1)
            .withf(|m| m.subject.contains("(1 jobs)") && m.html_body.contains("Data Engineer"))
            .returning(|_| Ok(()));
        let stage = NotifierStage::with_provider(notifier, storage.clone(), Arc::new(provider));

        let output = stage.run(Some(&analysis())).await.unwrap();

        assert_eq!(output["status"], "completed");
        assert_eq!(output["email_sent"], true);
        assert_eq!(output["report_saved"], true);
        assert_eq!(output["jobs_count"], 1);
        let path = storage.report_path(Local::now().date_naive());
        let saved = tokio::fs::read_to_string(path).await.unwrap();
        assert!(saved.contains("Most Requested Skills"));
    }

    #[tokio::test(start_paused = true)]
    async fn delivery_failure_downgrades_to_partial() {
        let dir = tempdir().unwrap();
        let (notifier, storage) = stage_config(dir.path(), true);
        let mut provider = MockDeliveryProvider::new();
        provider.expect_send().times(3).returning(|_| {
            Err(Box::new(PipelineError::NetworkError("unreachable".to_string())) as _)
        });
        let stage = NotifierStage::with_provider(notifier, storage, Arc::new(provider));

        let output = stage.run(Some(&analysis())).await.unwrap();

        assert_eq!(output["status"], "partial");
        assert_eq!(output["email_sent"], false);
        assert_eq!(output["report_saved"], true);
        assert!(output["errors"][0]
            .as_str()
            .unwrap()
            .contains("Email sending failed"));
    }

    #[tokio::test]
    async fn falls_back_to_analysis_file() {
        let dir = tempdir().unwrap();
        let (mut notifier, storage) = stage_config(dir.path(), false);
        notifier.save_report = false;
        tokio::fs::write(
            storage.analysis_path(),
            serde_json::to_string(&analysis()).unwrap(),
        )
        .await
        .unwrap();
        let stage = NotifierStage::new(notifier, storage);

        let output = stage.run(None).await.unwrap();

        assert_eq!(output["status"], "completed");
        assert_eq!(output["jobs_count"], 1);
        assert_eq!(output["report_saved"], false);
        assert_eq!(output["email_sent"], false);
    }

    #[tokio::test]
    async fn missing_analysis_is_an_error() {
        let dir = tempdir().unwrap();
        let (notifier, storage) = stage_config(dir.path(), false);
        let stage = NotifierStage::new(notifier, storage);

        let err = stage.run(None).await.unwrap_err().to_string();
        assert!(err.contains("analysis file not found"));
    }
}
