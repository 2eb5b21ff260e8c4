use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub search: SearchConfig,
    pub scraper: ScraperConfig,
    pub analyzer: AnalyzerConfig,
    pub notifier: NotifierConfig,
    pub orchestrator: OrchestratorConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SearchConfig {
    pub keywords: Vec<String>,
    pub location: String,
    /// LinkedIn time filter parameter, e.g. "r86400" for the last 24 hours.
    pub time_filter: String,
    pub max_jobs_per_search: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScraperConfig {
    pub headless: bool,
    #[serde(with = "humantime_serde")]
    pub page_load_timeout: Duration,
    pub rate_limit_delay: (u64, u64), // seconds
    pub max_scroll_rounds: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnalyzerConfig {
    pub model: String,
    pub base_url: String,
    pub max_tokens: u32,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotifierConfig {
    pub send_email: bool,
    pub save_report: bool,
    /// HTTP mail gateway endpoint; required when send_email is enabled.
    pub gateway_url: Option<String>,
    pub api_key_env: String,
    pub sender: String,
    pub recipient: String,
    pub subject_prefix: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrchestratorConfig {
    pub max_retries: u32,
    pub stop_on_error: bool,
    pub auto_save_context: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub jobs_file: String,
    pub analysis_file: String,
    pub context_file: String,
}

impl StorageConfig {
    pub fn jobs_path(&self) -> PathBuf {
        self.data_dir.join(&self.jobs_file)
    }

    pub fn analysis_path(&self) -> PathBuf {
        self.data_dir.join(&self.analysis_file)
    }

    pub fn context_path(&self) -> PathBuf {
        self.data_dir.join(&self.context_file)
    }

    pub fn report_path(&self, date: chrono::NaiveDate) -> PathBuf {
        self.data_dir.join(format!("report_{}.html", date.format("%Y-%m-%d")))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            search: SearchConfig {
                keywords: vec![
                    "Data Engineer".to_string(),
                    "Data Scientist".to_string(),
                    "ML Engineer".to_string(),
                    "Machine Learning Engineer".to_string(),
                ],
                location: "Canada".to_string(),
                time_filter: "r86400".to_string(),
                max_jobs_per_search: 25,
            },
            scraper: ScraperConfig {
                headless: true,
                page_load_timeout: Duration::from_secs(30),
                rate_limit_delay: (2, 5),
                max_scroll_rounds: 10,
            },
            analyzer: AnalyzerConfig {
                model: "gpt-4o-mini".to_string(),
                base_url: "https://api.openai.com/v1".to_string(),
                max_tokens: 2000,
                api_key_env: "OPENAI_API_KEY".to_string(),
                request_timeout: Duration::from_secs(60),
            },
            notifier: NotifierConfig {
                send_email: false,
                save_report: true,
                gateway_url: None,
                api_key_env: "MAIL_GATEWAY_API_KEY".to_string(),
                sender: "job-pipeline@localhost".to_string(),
                recipient: String::new(),
                subject_prefix: "[Data Jobs]".to_string(),
            },
            orchestrator: OrchestratorConfig {
                max_retries: 3,
                stop_on_error: true,
                auto_save_context: true,
            },
            storage: StorageConfig {
                data_dir: PathBuf::from("./data"),
                jobs_file: "jobs.json".to_string(),
                analysis_file: "analysis.json".to_string(),
                context_file: "context.json".to_string(),
            },
        }
    }
}

#[async_trait::async_trait]
pub trait ConfigManager {
    async fn load_config(&self) -> Result<Config>;
    async fn save_config(&self, config: &Config) -> Result<()>;
    fn validate_config(&self, config: &Config) -> Result<()>;
}

pub struct FileConfigManager {
    config_path: PathBuf,
}

impl FileConfigManager {
    pub fn new(config_path: PathBuf) -> Self {
        Self { config_path }
    }
}

#[async_trait::async_trait]
impl ConfigManager for FileConfigManager {
    async fn load_config(&self) -> Result<Config> {
        info!("Loading configuration from {:?}", self.config_path);

        // check if config file exists, create default if not
        if !self.config_path.exists() {
            warn!(
                "Configuration file not found, creating default config at {:?}",
                self.config_path
            );
            self.create_default_config().await?;
        }

        // read and parse the config file
        let config_content = fs::read_to_string(&self.config_path)
            .map_err(|e| PipelineError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&config_content)
            .map_err(|e| PipelineError::ConfigError(format!("Failed to parse TOML config: {}", e)))?;

        // validate the loaded config
        self.validate_config(&config)?;

        info!("Configuration loaded successfully");
        Ok(config)
    }

    async fn save_config(&self, config: &Config) -> Result<()> {
        info!("Saving configuration to {:?}", self.config_path);

        let toml_content = toml::to_string_pretty(config)
            .map_err(|e| PipelineError::ConfigError(format!("Failed to serialize config: {}", e)))?;

        fs::write(&self.config_path, toml_content)
            .map_err(|e| PipelineError::ConfigError(format!("Failed to write config file: {}", e)))?;

        info!("Configuration saved successfully");
        Ok(())
    }

    fn validate_config(&self, config: &Config) -> Result<()> {
        debug!("Validating configuration");

        // checking search config
        if config.search.keywords.is_empty() {
            return Err(
                PipelineError::ConfigError("Search keywords cannot be empty".to_string()).into(),
            );
        }
        for keyword in &config.search.keywords {
            if keyword.trim().is_empty() {
                return Err(PipelineError::ConfigError(
                    "Search keyword cannot be blank".to_string(),
                )
                .into());
            }
        }
        if config.search.location.trim().is_empty() {
            return Err(
                PipelineError::ConfigError("Search location cannot be empty".to_string()).into(),
            );
        }
        if config.search.max_jobs_per_search == 0 {
            return Err(PipelineError::ConfigError(
                "max_jobs_per_search must be greater than 0".to_string(),
            )
            .into());
        }
        if config.search.max_jobs_per_search > 200 {
            return Err(PipelineError::ConfigError(
                "max_jobs_per_search cannot exceed 200".to_string(),
            )
            .into());
        }

        // checking scraper config
        if config.scraper.page_load_timeout.is_zero() {
            return Err(PipelineError::ConfigError(
                "page_load_timeout must be greater than zero".to_string(),
            )
            .into());
        }
        if config.scraper.rate_limit_delay.0 > config.scraper.rate_limit_delay.1 {
            return Err(PipelineError::ConfigError(
                "rate_limit_delay minimum cannot exceed maximum".to_string(),
            )
            .into());
        }
        if config.scraper.rate_limit_delay.1 > 60 {
            return Err(PipelineError::ConfigError(
                "rate_limit_delay maximum cannot exceed 60 seconds".to_string(),
            )
            .into());
        }
        if config.scraper.max_scroll_rounds == 0 {
            return Err(PipelineError::ConfigError(
                "max_scroll_rounds must be greater than 0".to_string(),
            )
            .into());
        }

        // checking analyzer config
        if config.analyzer.model.trim().is_empty() {
            return Err(
                PipelineError::ConfigError("Analyzer model cannot be empty".to_string()).into(),
            );
        }
        if !config.analyzer.base_url.starts_with("http://")
            && !config.analyzer.base_url.starts_with("https://")
        {
            return Err(PipelineError::ConfigError(
                "Analyzer base_url must start with http:// or https://".to_string(),
            )
            .into());
        }
        if config.analyzer.max_tokens == 0 {
            return Err(
                PipelineError::ConfigError("max_tokens must be greater than 0".to_string()).into(),
            );
        }

        // checking notifier config
        if config.notifier.send_email {
            match &config.notifier.gateway_url {
                Some(url) if url.starts_with("http://") || url.starts_with("https://") => {}
                Some(url) => {
                    return Err(PipelineError::ConfigError(format!(
                        "gateway_url '{}' must start with http:// or https://",
                        url
                    ))
                    .into());
                }
                None => {
                    return Err(PipelineError::ConfigError(
                        "gateway_url is required when send_email is enabled".to_string(),
                    )
                    .into());
                }
            }
            if config.notifier.recipient.trim().is_empty() {
                return Err(PipelineError::ConfigError(
                    "recipient is required when send_email is enabled".to_string(),
                )
                .into());
            }
        }

        // checking orchestrator config
        if config.orchestrator.max_retries > 10 {
            return Err(
                PipelineError::ConfigError("max_retries cannot exceed 10".to_string()).into(),
            );
        }

        // checking storage config
        if config.storage.data_dir.as_os_str().is_empty() {
            return Err(
                PipelineError::ConfigError("data_dir cannot be empty".to_string()).into(),
            );
        }
        for (field, value) in [
            ("jobs_file", &config.storage.jobs_file),
            ("analysis_file", &config.storage.analysis_file),
            ("context_file", &config.storage.context_file),
        ] {
            if value.trim().is_empty() {
                return Err(
                    PipelineError::ConfigError(format!("{} cannot be empty", field)).into(),
                );
            }
            if value.contains('/') || value.contains('\\') {
                return Err(PipelineError::ConfigError(format!(
                    "{} must be a file name, not a path: '{}'",
                    field, value
                ))
                .into());
            }
        }

        debug!("Configuration validation passed");
        Ok(())
    }
}

impl FileConfigManager {
    /// Create a default configuration file
    async fn create_default_config(&self) -> Result<()> {
        let default_config = Config::default();
        let toml_content = toml::to_string_pretty(&default_config).map_err(|e| {
            PipelineError::ConfigError(format!("Failed to serialize default config: {}", e))
        })?;

        // Create parent directory if it doesn't exist
        if let Some(parent) = self.config_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    PipelineError::ConfigError(format!("Failed to create config directory: {}", e))
                })?;
            }
        }

        fs::write(&self.config_path, toml_content).map_err(|e| {
            PipelineError::ConfigError(format!("Failed to write default config: {}", e))
        })?;

        info!("Default configuration file created at {:?}", self.config_path);
        Ok(())
    }
}
