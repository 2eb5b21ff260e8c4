use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use linkedin_job_pipeline::agents::{run_detached, Orchestrator, StatusReport};
use linkedin_job_pipeline::analyzer::AnalyzerStage;
use linkedin_job_pipeline::config::{ConfigManager, FileConfigManager};
use linkedin_job_pipeline::context::{ContextManager, PipelineStatus, TrendData};
use linkedin_job_pipeline::notifier::NotifierStage;
use linkedin_job_pipeline::scraper::ScraperStage;

#[derive(Parser, Debug)]
#[command(
    name = "linkedin-job-pipeline",
    about = "Scrapes job postings, analyzes them with an LLM, and emails a daily report"
)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Run only the scraper stage
    #[arg(long, conflicts_with_all = ["analyze_only", "notify_only"])]
    scrape_only: bool,

    /// Run only the analyzer stage
    #[arg(long, conflicts_with = "notify_only")]
    analyze_only: bool,

    /// Run only the notifier stage
    #[arg(long)]
    notify_only: bool,

    /// Print pipeline status and exit
    #[arg(long)]
    status: bool,

    /// Print skill trends over the given number of days and exit
    #[arg(long, value_name = "DAYS", num_args = 0..=1, default_missing_value = "30")]
    trends: Option<u32>,
}

impl Cli {
    fn skipped_agents(&self) -> Vec<String> {
        let skip = |name: &str| name.to_string();
        if self.scrape_only {
            vec![skip("analyzer"), skip("notifier")]
        } else if self.analyze_only {
            vec![skip("scraper"), skip("notifier")]
        } else if self.notify_only {
            vec![skip("scraper"), skip("analyzer")]
        } else {
            Vec::new()
        }
    }
}

#[tokio::main]
async fn main() -> linkedin_job_pipeline::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config_manager = FileConfigManager::new(cli.config.clone());
    let config = config_manager.load_config().await?;

    tokio::fs::create_dir_all(&config.storage.data_dir).await?;
    let context = ContextManager::load(config.storage.context_path()).await?;

    let mut orchestrator = Orchestrator::new(
        config.orchestrator.clone(),
        config.storage.clone(),
        context,
    );
    orchestrator.register_stage(Arc::new(ScraperStage::new(
        config.search.clone(),
        config.scraper.clone(),
        config.storage.clone(),
    )?));
    orchestrator.register_stage(Arc::new(AnalyzerStage::new(
        config.analyzer.clone(),
        config.storage.clone(),
    )));
    orchestrator.register_stage(Arc::new(NotifierStage::new(
        config.notifier.clone(),
        config.storage.clone(),
    )));

    if cli.status {
        print_status(&orchestrator.pipeline_status());
        return Ok(());
    }
    if let Some(days) = cli.trends {
        print_trends(&orchestrator.trend_data(days));
        return Ok(());
    }

    let skip = cli.skipped_agents();
    let mut handle = run_detached(orchestrator, skip, None);

    let run = tokio::select! {
        joined = &mut handle => {
            let (_, run) = joined.map_err(|e| {
                linkedin_job_pipeline::PipelineError::AgentError(format!(
                    "pipeline task panicked: {}",
                    e
                ))
            })?;
            run
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting down");
            handle.abort();
            return Ok(());
        }
    };

    println!(
        "Pipeline run {} finished: {} ({} completed, {} failed)",
        run.run_id,
        run.status,
        run.completed_agents.len(),
        run.failed_agents.len()
    );
    for error in &run.errors {
        eprintln!("  [{}] {}", error.agent, error.error);
    }

    if run.status == PipelineStatus::Failed {
        std::process::exit(1);
    }
    Ok(())
}

fn print_status(report: &StatusReport) {
    println!("Pipeline: {}", report.pipeline.status);
    if let Some(agent) = &report.pipeline.current_agent {
        println!("  current agent: {}", agent);
    }
    if let Some(updated) = report.pipeline.last_updated {
        println!("  last updated:  {}", updated.to_rfc3339());
    }

    println!("Agents ({} registered):", report.registered_agents.len());
    for (name, state) in &report.agents {
        let last_run = state
            .last_run
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "  {:<10} {:<10} last run {} ({:.2}s)",
            name, state.status, last_run, state.duration_seconds
        );
        for (metric, value) in &state.metrics {
            println!("    {}: {}", metric, value);
        }
    }

    println!(
        "Health: {}/{} agents healthy ({:.1}%)",
        report.health.healthy_agents, report.health.total_agents, report.health.health_percentage
    );

    if report.recent_errors.is_empty() {
        println!("Recent errors: none");
    } else {
        println!("Recent errors:");
        for record in &report.recent_errors {
            let resolved = if record.resolved { " (resolved)" } else { "" };
            println!(
                "  {} [{}] {}{}",
                record.timestamp.to_rfc3339(),
                record.agent,
                record.error,
                resolved
            );
        }
    }

    let stats = &report.execution_stats;
    println!(
        "Executions: {} total, {} ok, {} failed, {:.1}% success, avg {:.2}s",
        stats.total_executions,
        stats.successful,
        stats.failed,
        stats.success_rate,
        stats.average_duration_seconds
    );
}

fn print_trends(trends: &TrendData) {
    println!(
        "Trends over the last {} days ({} data points)",
        trends.period_days, trends.data_points
    );
    if trends.skill_trends.is_empty() {
        println!("No trend data recorded yet.");
        return;
    }

    for (skill, counts) in &trends.skill_trends {
        let average = counts.iter().sum::<u64>() as f64 / counts.len() as f64;
        let first = *counts.first().unwrap_or(&0);
        let last = *counts.last().unwrap_or(&0);
        let direction = if last > first {
            "rising"
        } else if last < first {
            "falling"
        } else {
            "flat"
        };
        println!(
            "  {:<24} avg {:>5.1}/day, {} observations, {}",
            skill,
            average,
            counts.len(),
            direction
        );
    }
}
