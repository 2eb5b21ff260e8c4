use chrono::NaiveDate;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};

pub const JOBS_BASE_URL: &str = "https://www.linkedin.com/jobs/search/";

/// Basic card info scraped from the search results list. Details are filled
/// in later by visiting each job page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCard {
    pub job_id: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub url: Option<String>,
}

/// Builds the jobs search URL for one keyword with the configured location,
/// time-posted filter, and newest-first sort.
pub fn search_url(keyword: &str, location: &str, time_filter: &str) -> String {
    format!(
        "{}?keywords={}&location={}&f_TPR={}&sortBy=DD",
        JOBS_BASE_URL,
        encode_query(keyword),
        encode_query(location),
        time_filter
    )
}

fn encode_query(value: &str) -> String {
    value.replace(' ', "%20")
}

/// CSS-selector extraction over captured results-page HTML.
pub struct JobCardParser {
    card_selector: Selector,
    title_selector: Selector,
    company_selector: Selector,
    location_selector: Selector,
    link_selector: Selector,
}

impl JobCardParser {
    pub fn new() -> Result<Self> {
        Ok(Self {
            card_selector: Selector::parse(
                ".jobs-search-results__list-item, [data-occludable-job-id]",
            )
            .map_err(|e| PipelineError::ParseError(format!("Invalid card selector: {}", e)))?,
            title_selector: Selector::parse(".job-card-list__title")
                .map_err(|e| PipelineError::ParseError(format!("Invalid title selector: {}", e)))?,
            company_selector: Selector::parse(".job-card-container__primary-description")
                .map_err(|e| {
                    PipelineError::ParseError(format!("Invalid company selector: {}", e))
                })?,
            location_selector: Selector::parse(".job-card-container__metadata-item").map_err(
                |e| PipelineError::ParseError(format!("Invalid location selector: {}", e)),
            )?,
            link_selector: Selector::parse("a.job-card-list__title, a[href*='/jobs/view/']")
                .map_err(|e| PipelineError::ParseError(format!("Invalid link selector: {}", e)))?,
        })
    }

    /// Pulls every job card out of a results page. Cards that fail to parse
    /// are skipped so one broken element never loses the rest of the page.
    pub fn parse_cards(&self, html: &str) -> Vec<JobCard> {
        let document = Html::parse_document(html);
        let mut cards = Vec::new();

        for element in document.select(&self.card_selector) {
            match self.parse_single_card(&element) {
                Some(card) => cards.push(card),
                None => {
                    debug!("Skipped a job card without usable fields");
                }
            }
        }

        debug!("Parsed {} job cards from results page", cards.len());
        cards
    }

    fn parse_single_card(&self, element: &ElementRef) -> Option<JobCard> {
        let title = self.select_text(element, &self.title_selector)?;
        let company = self
            .select_text(element, &self.company_selector)
            .unwrap_or_default();
        let location = self
            .select_text(element, &self.location_selector)
            .unwrap_or_default();

        let url = element
            .select(&self.link_selector)
            .next()
            .and_then(|link| link.value().attr("href"))
            .map(|href| href.split('?').next().unwrap_or(href).to_string());

        let job_id = element
            .value()
            .attr("data-occludable-job-id")
            .map(str::to_string)
            .or_else(|| url.as_deref().and_then(job_id_from_url))
            .unwrap_or_else(|| fingerprint_id(&title, &company));

        Some(JobCard {
            job_id,
            title,
            company,
            location,
            url,
        })
    }

    fn select_text(&self, element: &ElementRef, selector: &Selector) -> Option<String> {
        let text: String = element.select(selector).next()?.text().collect();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(collapse_whitespace(trimmed))
        }
    }
}

/// Pulls the job id out of a /jobs/view/<id>/ link.
pub fn job_id_from_url(url: &str) -> Option<String> {
    let rest = url.split("/view/").nth(1)?;
    let id = rest.split('/').next()?.trim();
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

/// Stable fallback id for cards whose DOM id attribute is missing.
fn fingerprint_id(title: &str, company: &str) -> String {
    let digest = md5::compute(format!("{}|{}", title, company).as_bytes());
    format!("md5-{:x}", digest)
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Extraction over a captured job-detail page.
pub struct JobDetailParser {
    description_selectors: Vec<Selector>,
    posted_date_selectors: Vec<Selector>,
}

impl JobDetailParser {
    pub fn new() -> Result<Self> {
        let description_selectors = Self::parse_selectors(&[
            ".jobs-description__content",
            "#job-details",
            ".jobs-search__job-details--container",
        ])?;
        let posted_date_selectors = Self::parse_selectors(&[
            ".jobs-unified-top-card__posted-date",
            ".jobs-unified-top-card__subtitle-secondary-grouping span",
            ".job-details-jobs-unified-top-card__primary-description-container span",
        ])?;
        Ok(Self {
            description_selectors,
            posted_date_selectors,
        })
    }

    fn parse_selectors(sources: &[&str]) -> Result<Vec<Selector>> {
        sources
            .iter()
            .map(|source| {
                Selector::parse(source).map_err(|e| {
                    PipelineError::ParseError(format!("Invalid selector '{}': {}", source, e))
                        .into()
                })
            })
            .collect()
    }

    /// The full description text, from the first selector that yields a
    /// non-trivial amount of content. LinkedIn moves this container around
    /// between layouts, hence the fallback list.
    pub fn extract_description(&self, html: &str) -> String {
        let document = Html::parse_document(html);
        for selector in &self.description_selectors {
            if let Some(element) = document.select(selector).next() {
                let text: String = element.text().collect::<Vec<_>>().join("\n");
                let trimmed = text.trim();
                if trimmed.len() > 50 {
                    return trimmed.to_string();
                }
            }
        }
        warn!("No description container found on job page");
        String::new()
    }

    /// The posted date, resolved from relative phrasing ("3 days ago") to an
    /// absolute date. Falls back to `today` when nothing matches.
    pub fn extract_posted_date(&self, html: &str, today: NaiveDate) -> NaiveDate {
        let document = Html::parse_document(html);
        for selector in &self.posted_date_selectors {
            for element in document.select(selector) {
                let text: String = element.text().collect();
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    if let Some(date) = parse_relative_date(trimmed, today) {
                        return date;
                    }
                }
            }
        }
        today
    }
}

/// Resolves LinkedIn's relative posted-date phrases against `today`. Returns
/// `None` for text that does not look like a date phrase at all.
pub fn parse_relative_date(text: &str, today: NaiveDate) -> Option<NaiveDate> {
    let lower = text.to_lowercase();

    if lower.contains("just now") || lower.contains("moment") || lower.contains("hour") {
        return Some(today);
    }
    if lower.contains("day") {
        let days = leading_number(&lower).unwrap_or(1);
        return Some(today - chrono::Duration::days(days));
    }
    if lower.contains("week") {
        let weeks = leading_number(&lower).unwrap_or(1);
        return Some(today - chrono::Duration::weeks(weeks));
    }
    if lower.contains("month") || lower.contains("minute") || lower.contains("ago") {
        return Some(today);
    }
    None
}

fn leading_number(text: &str) -> Option<i64> {
    let digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Tech keywords matched against descriptions for the static requirements
/// list. The analyzer's LLM pass extracts the richer skill sets.
pub const TECH_KEYWORDS: &[&str] = &[
    // Programming languages
    "Python", "Java", "Scala", "SQL", "JavaScript", "Go", "Rust",
    // Big data
    "Spark", "Hadoop", "Kafka", "Flink", "Hive", "Presto", "Trino",
    // Cloud
    "AWS", "GCP", "Azure", "S3", "EC2", "Lambda", "Redshift", "BigQuery",
    "Snowflake", "Databricks",
    // Data tooling
    "Airflow", "dbt", "Luigi", "Prefect", "Dagster",
    // Databases
    "PostgreSQL", "MySQL", "MongoDB", "Redis", "Elasticsearch", "Cassandra",
    "DynamoDB",
    // ML/AI
    "TensorFlow", "PyTorch", "Scikit-learn", "Keras", "MLflow", "SageMaker",
    "Kubeflow",
    // DevOps
    "Docker", "Kubernetes", "Terraform", "CI/CD", "Git", "Jenkins",
    // Visualization
    "Tableau", "Power BI", "Looker", "Metabase",
];

/// Case-insensitive keyword scan over a description.
pub fn extract_requirements(description: &str) -> Vec<String> {
    let lower = description.to_lowercase();
    TECH_KEYWORDS
        .iter()
        .filter(|keyword| lower.contains(&keyword.to_lowercase()))
        .map(|keyword| keyword.to_string())
        .collect()
}
