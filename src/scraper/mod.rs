pub mod extract;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::agents::Stage;
use crate::browser::BrowserSession;
use crate::config::{ScraperConfig, SearchConfig, StorageConfig};
use crate::error::Result;
use crate::scraper::extract::{
    extract_requirements, search_url, JobCard, JobCardParser, JobDetailParser,
};

pub use extract::{parse_relative_date, TECH_KEYWORDS};

const LOGIN_URL: &str = "https://www.linkedin.com/login";
const EMAIL_ENV: &str = "LINKEDIN_EMAIL";
const PASSWORD_ENV: &str = "LINKEDIN_PASSWORD";

/// One fully scraped job posting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    #[serde(flatten)]
    pub card: JobCard,
    pub search_keyword: String,
    pub description: String,
    pub posted_date: Option<NaiveDate>,
    pub requirements: Vec<String>,
    pub scraped_at: DateTime<Utc>,
}

/// The scrape stage: drives a chromium session through the configured
/// keyword searches, collects job cards from the results list, then visits
/// each job page for the description.
pub struct ScraperStage {
    search: SearchConfig,
    scraper: ScraperConfig,
    storage: StorageConfig,
    card_parser: JobCardParser,
    detail_parser: JobDetailParser,
}

impl ScraperStage {
    pub fn new(search: SearchConfig, scraper: ScraperConfig, storage: StorageConfig) -> Result<Self> {
        Ok(Self {
            search,
            scraper,
            storage,
            card_parser: JobCardParser::new()?,
            detail_parser: JobDetailParser::new()?,
        })
    }

    /// Random pause between page actions, drawn from the configured range.
    async fn pace(&self) {
        let (min, max) = self.scraper.rate_limit_delay;
        let millis = rand::thread_rng().gen_range(min * 1000..=max.max(min) * 1000);
        debug!("Pacing for {}ms", millis);
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }

    /// Job ids persisted by earlier runs, so repeated daily scrapes skip
    /// postings they have already collected.
    async fn load_seen_ids(&self) -> HashSet<String> {
        let path = self.storage.jobs_path();
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(_) => return HashSet::new(),
        };
        match serde_json::from_str::<Value>(&raw) {
            Ok(doc) => {
                let ids: HashSet<String> = doc
                    .get("jobs")
                    .and_then(Value::as_array)
                    .map(|jobs| {
                        jobs.iter()
                            .filter_map(|job| job.get("job_id"))
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                info!("Loaded {} previously scraped job ids", ids.len());
                ids
            }
            Err(e) => {
                warn!("Existing jobs file at {} is unreadable: {}", path.display(), e);
                HashSet::new()
            }
        }
    }

    /// Optional login. Credentials come from the environment; without them
    /// the scraper works the public results pages.
    async fn login(&self, session: &BrowserSession) -> Result<bool> {
        let (Ok(email), Ok(password)) = (std::env::var(EMAIL_ENV), std::env::var(PASSWORD_ENV))
        else {
            info!("No LinkedIn credentials in environment; scraping without login");
            return Ok(false);
        };

        info!("Logging in to LinkedIn");
        session.goto(LOGIN_URL).await?;
        self.pace().await;

        session.type_into("#username", &email).await?;
        session.type_into("#password", &password).await?;
        session.click("button[type='submit']").await?;
        self.pace().await;

        // the global nav only renders once the session is authenticated
        match session
            .wait_for_element(".global-nav", Duration::from_secs(15))
            .await
        {
            Ok(()) => {
                info!("LinkedIn login succeeded");
                Ok(true)
            }
            Err(e) => {
                warn!("LinkedIn login did not complete (possible checkpoint): {}", e);
                Ok(false)
            }
        }
    }

    /// Scroll the results list collecting cards until the per-search cap or
    /// the scroll budget is reached.
    async fn collect_cards(
        &self,
        session: &BrowserSession,
        keyword: &str,
        seen: &mut HashSet<String>,
    ) -> Result<Vec<JobCard>> {
        let url = search_url(keyword, &self.search.location, &self.search.time_filter);
        info!("Searching jobs for keyword '{}'", keyword);
        session.goto(&url).await?;
        self.pace().await;

        let mut collected: Vec<JobCard> = Vec::new();
        for round in 0..self.scraper.max_scroll_rounds {
            let html = session.content().await?;
            for card in self.card_parser.parse_cards(&html) {
                if collected.len() >= self.search.max_jobs_per_search {
                    break;
                }
                if seen.insert(card.job_id.clone()) {
                    collected.push(card);
                }
            }

            if collected.len() >= self.search.max_jobs_per_search {
                break;
            }
            debug!(
                "Scroll round {} for '{}': {} cards so far",
                round + 1,
                keyword,
                collected.len()
            );
            session.scroll_to_bottom().await?;
            self.pace().await;
        }

        info!("Found {} new jobs for keyword '{}'", collected.len(), keyword);
        Ok(collected)
    }

    /// Visit the job page and fill in description, posted date, and the
    /// keyword-matched requirements. Extraction failures degrade to an empty
    /// description rather than losing the card.
    async fn extract_details(&self, session: &BrowserSession, card: JobCard, keyword: &str) -> Job {
        let url = card.url.clone().unwrap_or_else(|| {
            format!("https://www.linkedin.com/jobs/view/{}", card.job_id)
        });
        info!("Extracting details for job '{}' ({})", card.title, card.job_id);

        let mut description = String::new();
        let mut posted_date = None;

        match session.goto(&url).await {
            Ok(()) => {
                self.pace().await;
                // expand the truncated description when the button is present
                if session.click(".jobs-description__footer-button").await.is_ok() {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                match session.content().await {
                    Ok(html) => {
                        description = self.detail_parser.extract_description(&html);
                        posted_date = Some(
                            self.detail_parser
                                .extract_posted_date(&html, Utc::now().date_naive()),
                        );
                    }
                    Err(e) => warn!("Failed to capture job page for {}: {}", card.job_id, e),
                }
            }
            Err(e) => warn!("Failed to open job page for {}: {}", card.job_id, e),
        }

        let requirements = extract_requirements(&description);
        Job {
            card,
            search_keyword: keyword.to_string(),
            description,
            posted_date,
            requirements,
            scraped_at: Utc::now(),
        }
    }

    async fn save_jobs(&self, jobs: &[Job]) -> Result<()> {
        let path = self.storage.jobs_path();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let document = json!({
            "jobs": jobs,
            "scraped_at": Utc::now(),
            "total_count": jobs.len(),
        });
        tokio::fs::write(&path, serde_json::to_string_pretty(&document)?).await?;
        info!("Saved {} jobs to {}", jobs.len(), path.display());
        Ok(())
    }

    async fn scrape(&self) -> Result<Vec<Job>> {
        let session = BrowserSession::launch(&self.scraper).await?;
        let mut seen = self.load_seen_ids().await;

        let result = async {
            self.login(&session).await?;

            let mut cards: Vec<(JobCard, String)> = Vec::new();
            for keyword in &self.search.keywords {
                match self.collect_cards(&session, keyword, &mut seen).await {
                    Ok(found) => {
                        cards.extend(found.into_iter().map(|card| (card, keyword.clone())))
                    }
                    Err(e) => warn!("Search for '{}' failed: {}", keyword, e),
                }
                self.pace().await;
            }

            let mut jobs = Vec::with_capacity(cards.len());
            for (card, keyword) in cards {
                jobs.push(self.extract_details(&session, card, &keyword).await);
                self.pace().await;
            }
            Ok(jobs)
        }
        .await;

        if let Err(e) = session.close().await {
            warn!("Failed to close browser session: {}", e);
        }
        result
    }
}

#[async_trait]
impl Stage for ScraperStage {
    fn name(&self) -> &str {
        "scraper"
    }

    async fn run(&self, _input: Option<&Value>) -> Result<Value> {
        let jobs = self.scrape().await?;
        if jobs.is_empty() {
            warn!("Scrape pass found no new jobs");
        }
        self.save_jobs(&jobs).await?;

        Ok(json!({
            "jobs": jobs,
            "scraped_at": Utc::now(),
            "total_count": jobs.len(),
        }))
    }
}
