mod tests {
    use crate::agents::orchestrator::{run_detached, Orchestrator};
    use crate::agents::tests::ScriptedStage;
    use crate::config::Config;
    use crate::context::{AgentStatus, ContextManager, PipelineStatus};
    use serde_json::json;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    async fn build_orchestrator(data_dir: &Path) -> Orchestrator {
        let mut config = Config::default();
        config.storage.data_dir = data_dir.to_path_buf();
        let context = ContextManager::load(config.storage.context_path())
            .await
            .expect("failed to load context");
        Orchestrator::new(config.orchestrator, config.storage, context)
    }

    fn scraper_output() -> serde_json::Value {
        json!({"jobs": [{"id": "a"}, {"id": "b"}], "total_count": 2})
    }

    fn analyzer_output() -> serde_json::Value {
        json!({
            "analyzed_jobs": [{"id": "a"}, {"id": "b"}],
            "skill_frequency": {"python": 2, "sql": 1},
            "insights": {"top_skills": ["python"]}
        })
    }

    fn notifier_output() -> serde_json::Value {
        json!({"email_sent": false, "report_saved": true})
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_pipeline_completes() {
        let dir = tempdir().unwrap();
        let mut orchestrator = build_orchestrator(dir.path()).await;

        let scraper = Arc::new(ScriptedStage::succeeding("scraper", scraper_output()));
        let analyzer = Arc::new(ScriptedStage::flaky(
            "analyzer",
            2,
            "connection timeout talking to the api",
            analyzer_output(),
        ));
        let notifier = Arc::new(ScriptedStage::succeeding("notifier", notifier_output()));
        orchestrator.register_stage(scraper.clone());
        orchestrator.register_stage(analyzer.clone());
        orchestrator.register_stage(notifier.clone());

        let run = orchestrator.run_pipeline(&[], None).await;

        assert_eq!(run.status, PipelineStatus::Completed);
        assert_eq!(run.completed_agents, vec!["scraper", "analyzer", "notifier"]);
        assert!(run.failed_agents.is_empty());
        assert!(run.agents["scraper"].success);
        assert_eq!(run.agents["analyzer"].retries_used, 2);
        assert!(run.completed_at.is_some());

        // each agent receives the previous agent's output
        assert_eq!(analyzer.last_input(), Some(scraper_output()));
        assert_eq!(notifier.last_input(), Some(analyzer_output()));
        assert_eq!(analyzer.call_count(), 3);
    }

    #[tokio::test]
    async fn test_missing_agent_aborts_when_stopping_on_error() {
        let dir = tempdir().unwrap();
        let mut orchestrator = build_orchestrator(dir.path()).await;
        let scraper = Arc::new(ScriptedStage::succeeding("scraper", scraper_output()));
        orchestrator.register_stage(scraper);

        let run = orchestrator.run_pipeline(&[], Some(true)).await;

        assert_eq!(run.status, PipelineStatus::Failed);
        assert_eq!(run.completed_agents, vec!["scraper"]);
        assert_eq!(run.failed_agents, vec!["analyzer"]);
        // the notifier never ran because the pipeline stopped at the analyzer
        assert!(!run.agents.contains_key("notifier"));
        assert!(run.errors[0].error.contains("No implementation registered"));
    }

    #[tokio::test]
    async fn test_downstream_agents_run_when_not_stopping() {
        let dir = tempdir().unwrap();
        let mut orchestrator = build_orchestrator(dir.path()).await;

        let scraper = Arc::new(ScriptedStage::succeeding("scraper", scraper_output()));
        let analyzer = Arc::new(ScriptedStage::failing(
            "analyzer",
            "invalid response from model",
        ));
        let notifier = Arc::new(ScriptedStage::succeeding("notifier", notifier_output()));
        orchestrator.register_stage(scraper);
        orchestrator.register_stage(analyzer);
        orchestrator.register_stage(notifier.clone());

        let run = orchestrator.run_pipeline(&[], Some(false)).await;

        assert_eq!(run.status, PipelineStatus::Partial);
        assert_eq!(run.completed_agents, vec!["scraper", "notifier"]);
        assert_eq!(run.failed_agents, vec!["analyzer"]);
        // the notifier saw no upstream output and must fall back to disk
        assert_eq!(notifier.call_count(), 1);
        assert_eq!(notifier.last_input(), None);
    }

    #[tokio::test]
    async fn test_all_agents_failing_marks_pipeline_failed() {
        let dir = tempdir().unwrap();
        let mut orchestrator = build_orchestrator(dir.path()).await;
        for name in ["scraper", "analyzer", "notifier"] {
            orchestrator.register_stage(Arc::new(ScriptedStage::failing(
                name,
                "invalid output from upstream",
            )));
        }

        let run = orchestrator.run_pipeline(&[], Some(false)).await;

        assert_eq!(run.status, PipelineStatus::Failed);
        assert!(run.completed_agents.is_empty());
        assert_eq!(run.failed_agents.len(), 3);
        assert_eq!(
            orchestrator.context().pipeline_state().status,
            PipelineStatus::Failed
        );
        let pipeline_errors: Vec<_> = orchestrator
            .context()
            .unresolved_errors()
            .into_iter()
            .filter(|record| record.agent == "pipeline")
            .collect();
        assert_eq!(pipeline_errors.len(), 1);
        assert_eq!(pipeline_errors[0].error, "All agents failed");
    }

    #[tokio::test]
    async fn test_skip_agents() {
        let dir = tempdir().unwrap();
        let mut orchestrator = build_orchestrator(dir.path()).await;
        let analyzer = Arc::new(ScriptedStage::succeeding("analyzer", analyzer_output()));
        orchestrator.register_stage(analyzer.clone());

        let run = orchestrator
            .run_pipeline(&["scraper", "notifier"], None)
            .await;

        assert_eq!(run.status, PipelineStatus::Completed);
        assert_eq!(run.completed_agents, vec!["analyzer"]);
        assert_eq!(run.agents.len(), 1);
        assert_eq!(analyzer.last_input(), None);
    }

    #[tokio::test]
    async fn test_callbacks_fire_and_failures_do_not_abort() {
        let dir = tempdir().unwrap();
        let mut orchestrator = build_orchestrator(dir.path()).await;
        orchestrator.register_stage(Arc::new(ScriptedStage::succeeding(
            "scraper",
            scraper_output(),
        )));
        orchestrator.register_stage(Arc::new(ScriptedStage::succeeding(
            "analyzer",
            analyzer_output(),
        )));
        orchestrator.register_stage(Arc::new(ScriptedStage::succeeding(
            "notifier",
            notifier_output(),
        )));

        let starts = Arc::new(AtomicU32::new(0));
        let completes = Arc::new(AtomicU32::new(0));
        let pipeline_done = Arc::new(AtomicU32::new(0));

        let counter = starts.clone();
        orchestrator.on_agent_start(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            // a broken callback must not take the pipeline down with it
            Err("callback exploded".into())
        });
        let counter = completes.clone();
        orchestrator.on_agent_complete(move |_, result| {
            assert!(result.success);
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let counter = pipeline_done.clone();
        orchestrator.on_pipeline_complete(move |run| {
            assert_eq!(run.status, PipelineStatus::Completed);
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let run = orchestrator.run_pipeline(&[], None).await;

        assert_eq!(run.status, PipelineStatus::Completed);
        assert_eq!(starts.load(Ordering::SeqCst), 3);
        assert_eq!(completes.load(Ordering::SeqCst), 3);
        assert_eq!(pipeline_done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_history_recorded_on_analyzer_success() {
        let dir = tempdir().unwrap();
        let mut orchestrator = build_orchestrator(dir.path()).await;
        orchestrator.register_stage(Arc::new(ScriptedStage::succeeding(
            "scraper",
            scraper_output(),
        )));
        orchestrator.register_stage(Arc::new(ScriptedStage::succeeding(
            "analyzer",
            analyzer_output(),
        )));

        let run = orchestrator.run_pipeline(&["notifier"], None).await;
        assert_eq!(run.status, PipelineStatus::Completed);

        let trends = orchestrator.trend_data(30);
        assert_eq!(trends.data_points, 1);
        assert_eq!(trends.daily_stats[0].total_jobs, 2);
        assert_eq!(trends.daily_stats[0].top_skills, vec!["python"]);
        assert_eq!(trends.skill_trends["python"], vec![2]);
        assert_eq!(trends.skill_trends["sql"], vec![1]);
    }

    #[tokio::test]
    async fn test_execute_agent_records_state_and_persists() {
        let dir = tempdir().unwrap();
        let mut orchestrator = build_orchestrator(dir.path()).await;
        orchestrator.register_stage(Arc::new(ScriptedStage::succeeding(
            "scraper",
            json!({"jobs": [{"id": "a"}, {"id": "b"}, {"id": "c"}]}),
        )));

        let result = orchestrator.execute_agent("scraper", None).await;

        assert!(result.success);
        let state = &orchestrator.context().agent_states()["scraper"];
        assert_eq!(state.status, AgentStatus::Completed);
        assert!(state.last_run.is_some());
        assert_eq!(state.metrics["jobs_found"], json!(3));
        // auto_save_context writes the context file after the run
        assert!(dir.path().join("context.json").exists());
    }

    #[tokio::test]
    async fn test_execute_agent_without_registration_fails() {
        let dir = tempdir().unwrap();
        let mut orchestrator = build_orchestrator(dir.path()).await;

        let result = orchestrator.execute_agent("analyzer", None).await;

        assert!(!result.success);
        assert!(result
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("No implementation registered"));
        let unresolved = orchestrator.context().unresolved_errors();
        assert!(unresolved.iter().any(|record| record.agent == "analyzer"));
    }

    #[tokio::test]
    async fn test_handle_error_recovers_with_cached_input() {
        let dir = tempdir().unwrap();
        let mut orchestrator = build_orchestrator(dir.path()).await;
        let analyzer = Arc::new(ScriptedStage::succeeding("analyzer", analyzer_output()));
        orchestrator.register_stage(analyzer.clone());

        // the scraper's persisted output is the recovery input
        let cached = json!({"jobs": [{"id": "x"}], "total_count": 1});
        tokio::fs::write(
            dir.path().join("jobs.json"),
            serde_json::to_string(&cached).unwrap(),
        )
        .await
        .unwrap();

        let result = orchestrator
            .handle_error("analyzer", "connection timeout during analysis", true)
            .await
            .expect("expected a retry");

        assert!(result.success);
        assert_eq!(analyzer.last_input(), Some(cached));
        assert!(orchestrator
            .context()
            .unresolved_errors()
            .iter()
            .all(|record| record.agent != "analyzer"));
    }

    #[tokio::test]
    async fn test_handle_error_without_auto_retry_only_records() {
        let dir = tempdir().unwrap();
        let mut orchestrator = build_orchestrator(dir.path()).await;
        let analyzer = Arc::new(ScriptedStage::succeeding("analyzer", analyzer_output()));
        orchestrator.register_stage(analyzer.clone());

        let result = orchestrator
            .handle_error("analyzer", "rate limit exceeded", false)
            .await;

        assert!(result.is_none());
        assert_eq!(analyzer.call_count(), 0);
        let unresolved = orchestrator.context().unresolved_errors();
        assert!(unresolved.iter().any(|record| record.agent == "analyzer"));
    }

    #[tokio::test]
    async fn test_status_report_reflects_last_run() {
        let dir = tempdir().unwrap();
        let mut orchestrator = build_orchestrator(dir.path()).await;
        orchestrator.register_stage(Arc::new(ScriptedStage::succeeding(
            "scraper",
            scraper_output(),
        )));
        orchestrator.register_stage(Arc::new(ScriptedStage::failing(
            "analyzer",
            "invalid response from model",
        )));
        orchestrator.register_stage(Arc::new(ScriptedStage::succeeding(
            "notifier",
            notifier_output(),
        )));

        orchestrator.run_pipeline(&[], Some(false)).await;
        let report = orchestrator.pipeline_status();

        assert_eq!(report.pipeline.status, PipelineStatus::Partial);
        assert_eq!(report.health.total_agents, 3);
        assert_eq!(report.health.healthy_agents, 2);
        assert_eq!(report.health.health_percentage, 66.7);
        assert_eq!(
            report.registered_agents,
            vec!["analyzer", "notifier", "scraper"]
        );
        assert!(!report.recent_errors.is_empty());
        assert_eq!(report.execution_stats.total_executions, 3);
        assert_eq!(report.execution_stats.failed, 1);
    }

    #[tokio::test]
    async fn test_reset_clears_state_but_keeps_registrations() {
        let dir = tempdir().unwrap();
        let mut orchestrator = build_orchestrator(dir.path()).await;
        orchestrator.register_stage(Arc::new(ScriptedStage::succeeding(
            "scraper",
            scraper_output(),
        )));
        orchestrator.run_pipeline(&["analyzer", "notifier"], None).await;

        orchestrator.reset().await;

        assert_eq!(
            orchestrator.context().pipeline_state().status,
            PipelineStatus::Idle
        );
        assert!(orchestrator.context().recent_errors(10).is_empty());
        assert_eq!(orchestrator.runner().execution_logs(None).len(), 0);
        assert_eq!(orchestrator.registered_stages(), vec!["scraper"]);
    }

    #[tokio::test]
    async fn test_run_detached_hands_back_the_orchestrator() {
        let dir = tempdir().unwrap();
        let mut orchestrator = build_orchestrator(dir.path()).await;
        orchestrator.register_stage(Arc::new(ScriptedStage::succeeding(
            "scraper",
            scraper_output(),
        )));
        orchestrator.register_stage(Arc::new(ScriptedStage::succeeding(
            "analyzer",
            analyzer_output(),
        )));
        orchestrator.register_stage(Arc::new(ScriptedStage::succeeding(
            "notifier",
            notifier_output(),
        )));

        let handle = run_detached(orchestrator, Vec::new(), None);
        let (orchestrator, run) = handle.await.expect("pipeline task panicked");

        assert_eq!(run.status, PipelineStatus::Completed);
        assert_eq!(
            orchestrator.context().pipeline_state().status,
            PipelineStatus::Completed
        );
    }
}
