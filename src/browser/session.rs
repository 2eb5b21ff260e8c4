use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetUserAgentOverrideParams,
};
use chromiumoxide::page::Page;
use futures::StreamExt;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::browser::stealth::{
    generate_stealth_script, BrowserFingerprint, FingerprintRandomizer,
};
use crate::config::ScraperConfig;
use crate::error::{PipelineError, Result};

/// One headless Chrome session with a randomized fingerprint. The pipeline
/// runs a single scraping pass per day, so one session is all it needs.
pub struct BrowserSession {
    id: Uuid,
    browser: Browser,
    page: Page,
    handler_task: JoinHandle<()>,
    fingerprint: BrowserFingerprint,
    user_agent: String,
    page_load_timeout: Duration,
}

impl BrowserSession {
    pub async fn launch(config: &ScraperConfig) -> Result<Self> {
        let id = Uuid::new_v4();
        let (browser, handler_task) = Self::create_browser(config).await?;

        info!("Creating page for browser session {}", id);
        let page = match tokio::time::timeout(
            Duration::from_secs(10),
            browser.new_page("about:blank"),
        )
        .await
        {
            Ok(Ok(page)) => page,
            Ok(Err(e)) => {
                error!("Failed to create page for session {}: {}", id, e);
                return Err(
                    PipelineError::BrowserError(format!("Failed to create page: {}", e)).into(),
                );
            }
            Err(_) => {
                error!("Timeout creating page for session {}", id);
                return Err(
                    PipelineError::BrowserError("Timeout creating page".to_string()).into(),
                );
            }
        };

        let fingerprint = FingerprintRandomizer::generate();
        let user_agent = fingerprint.user_agent.clone();

        let device_metrics = SetDeviceMetricsOverrideParams::builder()
            .width(fingerprint.viewport_width as i64)
            .height(fingerprint.viewport_height as i64)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(|e| {
                PipelineError::BrowserError(format!("Failed to build device metrics: {}", e))
            })?;
        page.execute(device_metrics)
            .await
            .map_err(|e| PipelineError::BrowserError(format!("Failed to set viewport: {}", e)))?;

        let user_agent_params = SetUserAgentOverrideParams::builder()
            .user_agent(&user_agent)
            .accept_language(&fingerprint.language)
            .platform(&fingerprint.platform)
            .build()
            .map_err(|e| {
                PipelineError::BrowserError(format!("Failed to build user agent params: {}", e))
            })?;
        page.execute(user_agent_params)
            .await
            .map_err(|e| PipelineError::BrowserError(format!("Failed to set user agent: {}", e)))?;

        info!("Browser session {} ready", id);
        Ok(Self {
            id,
            browser,
            page,
            handler_task,
            fingerprint,
            user_agent,
            page_load_timeout: config.page_load_timeout,
        })
    }

    async fn create_browser(config: &ScraperConfig) -> Result<(Browser, JoinHandle<()>)> {
        // unique user data dir to avoid singleton lock issues
        let user_data_dir = format!(
            "/tmp/linkedin-pipeline-{}-{}",
            std::process::id(),
            Uuid::new_v4()
        );
        let _ = std::fs::create_dir_all(&user_data_dir);

        let mut builder = BrowserConfig::builder().no_sandbox().args(vec![
            &format!("--user-data-dir={}", user_data_dir),
            "--no-sandbox",
            "--disable-gpu",
            "--disable-dev-shm-usage",
            "--disable-extensions",
            "--disable-plugins",
            "--mute-audio",
            "--no-first-run",
            "--disable-default-apps",
            "--disable-sync",
            "--disable-background-networking",
            "--remote-debugging-port=0",
            "--disable-background-timer-throttling",
            "--disable-renderer-backgrounding",
            "--disable-backgrounding-occluded-windows",
            "--disable-blink-features=AutomationControlled",
            "--disable-logging",
            "--silent",
            "--log-level=3",
        ]);
        if !config.headless {
            builder = builder.with_head();
        }

        let browser_config = builder.build().map_err(|e| {
            PipelineError::BrowserError(format!("Failed to create browser config: {}", e))
        })?;

        // chrome startup is flaky enough to deserve a few attempts
        let mut last_error = None;
        for attempt in 1..=3 {
            match Browser::launch(browser_config.clone()).await {
                Ok((browser, handler)) => {
                    info!("Browser launched on attempt {}", attempt);

                    let handler_task = tokio::spawn(async move {
                        let mut handler = handler;
                        while let Some(event) = handler.next().await {
                            if let Err(e) = event {
                                // filter out common websocket deserialization noise
                                let message = e.to_string();
                                if message.contains("data did not match any variant")
                                    || message.contains("untagged enum Message")
                                {
                                    debug!("Ignoring WebSocket deserialization error: {}", e);
                                } else {
                                    warn!("Browser handler error: {}", e);
                                }
                            }
                        }
                        debug!("Browser handler task ended");
                    });

                    return Ok((browser, handler_task));
                }
                Err(e) => {
                    error!("Browser launch attempt {} failed: {}", attempt, e);
                    last_error = Some(e);
                    if attempt < 3 {
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        }

        Err(PipelineError::BrowserError(format!(
            "Failed to launch browser after 3 attempts: {}",
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string())
        ))
        .into())
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Navigate to `url`, wait for the load to settle, then re-apply the
    /// stealth overrides on the fresh document.
    pub async fn goto(&self, url: &str) -> Result<()> {
        debug!("Session {} navigating to {}", self.id, url);
        self.page.goto(url).await.map_err(|e| {
            PipelineError::BrowserError(format!("Failed to navigate to {}: {}", url, e))
        })?;

        if tokio::time::timeout(self.page_load_timeout, self.page.wait_for_navigation())
            .await
            .is_err()
        {
            warn!(
                "Session {} navigation to {} did not settle within {:?}",
                self.id, url, self.page_load_timeout
            );
        }

        self.inject_stealth_script().await?;
        Ok(())
    }

    async fn inject_stealth_script(&self) -> Result<()> {
        let script = generate_stealth_script(&self.fingerprint);
        self.page.evaluate(script.as_str()).await.map_err(|e| {
            PipelineError::BrowserError(format!("Failed to inject stealth script: {}", e))
        })?;
        debug!("Injected stealth script for session {}", self.id);
        Ok(())
    }

    pub async fn content(&self) -> Result<String> {
        self.page
            .content()
            .await
            .map_err(|e| PipelineError::BrowserError(format!("Failed to get page content: {}", e)).into())
    }

    pub async fn scroll_height(&self) -> Result<i64> {
        let height = self
            .page
            .evaluate("document.body.scrollHeight")
            .await
            .map_err(|e| PipelineError::BrowserError(format!("Failed to read scroll height: {}", e)))?
            .into_value::<i64>()
            .map_err(|e| {
                PipelineError::BrowserError(format!("Unexpected scroll height value: {}", e))
            })?;
        Ok(height)
    }

    pub async fn scroll_to_bottom(&self) -> Result<()> {
        self.page
            .evaluate("window.scrollTo(0, document.body.scrollHeight)")
            .await
            .map_err(|e| PipelineError::BrowserError(format!("Failed to scroll page: {}", e)))?;
        Ok(())
    }

    /// Click the element matching `selector`, if present.
    pub async fn click(&self, selector: &str) -> Result<()> {
        let element = self.page.find_element(selector).await.map_err(|e| {
            PipelineError::BrowserError(format!("Element '{}' not found: {}", selector, e))
        })?;
        element.click().await.map_err(|e| {
            PipelineError::BrowserError(format!("Failed to click '{}': {}", selector, e))
        })?;
        Ok(())
    }

    pub async fn type_into(&self, selector: &str, text: &str) -> Result<()> {
        let element = self.page.find_element(selector).await.map_err(|e| {
            PipelineError::BrowserError(format!("Element '{}' not found: {}", selector, e))
        })?;
        element.click().await.map_err(|e| {
            PipelineError::BrowserError(format!("Failed to focus '{}': {}", selector, e))
        })?;
        element.type_str(text).await.map_err(|e| {
            PipelineError::BrowserError(format!("Failed to type into '{}': {}", selector, e))
        })?;
        Ok(())
    }

    /// Poll for `selector` until it appears or `timeout` elapses.
    pub async fn wait_for_element(&self, selector: &str, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.page.find_element(selector).await.is_ok() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(PipelineError::BrowserError(format!(
                    "Timed out waiting for element '{}'",
                    selector
                ))
                .into());
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    pub async fn close(mut self) -> Result<()> {
        if let Err(e) = self.page.close().await {
            warn!("Failed to close page for session {}: {}", self.id, e);
        }
        self.browser
            .close()
            .await
            .map_err(|e| PipelineError::BrowserError(format!("Failed to close browser: {}", e)))?;
        let _ = self.handler_task.await;
        info!("Closed browser session {}", self.id);
        Ok(())
    }
}
