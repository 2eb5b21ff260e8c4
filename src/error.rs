use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Browser error: {0}")]
    BrowserError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Agent error: {0}")]
    AgentError(String),
}

/// Failure categories the runner retries by. Classification looks only at an
/// error's rendered message, so upstream errors never need to carry a type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    RateLimit,
    ApiError,
    NetworkError,
    ValidationError,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::ApiError => "api_error",
            ErrorCategory::NetworkError => "network_error",
            ErrorCategory::ValidationError => "validation_error",
            ErrorCategory::Unknown => "unknown",
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            ErrorCategory::RateLimit => RetryPolicy {
                max_retries: 5,
                base_delay: Duration::from_secs(60),
                max_delay: Duration::from_secs(300),
                backoff_factor: 2,
            },
            ErrorCategory::ApiError => RetryPolicy {
                max_retries: 3,
                base_delay: Duration::from_secs(5),
                max_delay: Duration::from_secs(30),
                backoff_factor: 2,
            },
            ErrorCategory::NetworkError => RetryPolicy {
                max_retries: 3,
                base_delay: Duration::from_secs(30),
                max_delay: Duration::from_secs(300),
                backoff_factor: 2,
            },
            ErrorCategory::ValidationError => RetryPolicy {
                max_retries: 1,
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
                backoff_factor: 1,
            },
            ErrorCategory::Unknown => RetryPolicy {
                max_retries: 2,
                base_delay: Duration::from_secs(10),
                max_delay: Duration::from_secs(60),
                backoff_factor: 2,
            },
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: u32,
}

impl RetryPolicy {
    /// Delay to wait after failed attempt `attempt` (0-indexed), capped at
    /// `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.base_delay * self.backoff_factor.saturating_pow(attempt.min(16));
        scaled.min(self.max_delay)
    }
}

/// One classification rule: a predicate over the lowercased error message.
pub struct ClassificationRule {
    category: ErrorCategory,
    predicate: Box<dyn Fn(&str) -> bool + Send + Sync>,
}

impl ClassificationRule {
    pub fn new<P>(category: ErrorCategory, predicate: P) -> Self
    where
        P: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Self {
            category,
            predicate: Box::new(predicate),
        }
    }

    /// Rule that fires when any of the given keywords appears in the message.
    pub fn keywords(category: ErrorCategory, keywords: &[&str]) -> Self {
        let needles: Vec<String> = keywords.iter().map(|k| k.to_lowercase()).collect();
        Self::new(category, move |message| {
            needles.iter().any(|needle| message.contains(needle.as_str()))
        })
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    fn matches(&self, message: &str) -> bool {
        (self.predicate)(message)
    }
}

/// Ordered rule list mapping error messages to categories. The first matching
/// rule wins; anything unmatched is `Unknown`.
pub struct ErrorClassifier {
    rules: Vec<ClassificationRule>,
}

impl ErrorClassifier {
    pub fn new(rules: Vec<ClassificationRule>) -> Self {
        Self { rules }
    }

    /// Appends a rule after the existing ones.
    pub fn add_rule(&mut self, rule: ClassificationRule) {
        self.rules.push(rule);
    }

    /// Inserts a rule at `index`, ahead of lower-priority rules.
    pub fn insert_rule(&mut self, index: usize, rule: ClassificationRule) {
        let index = index.min(self.rules.len());
        self.rules.insert(index, rule);
    }

    pub fn classify(&self, message: &str) -> ErrorCategory {
        let message = message.to_lowercase();
        self.rules
            .iter()
            .find(|rule| rule.matches(&message))
            .map(|rule| rule.category())
            .unwrap_or(ErrorCategory::Unknown)
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(vec![
            ClassificationRule::keywords(
                ErrorCategory::RateLimit,
                &["rate limit", "too many requests", "429", "throttle"],
            ),
            ClassificationRule::keywords(
                ErrorCategory::ApiError,
                &["api error", "openai", "authentication", "unauthorized", "403"],
            ),
            ClassificationRule::keywords(
                ErrorCategory::NetworkError,
                &["network", "connection", "timeout", "dns", "socket"],
            ),
            ClassificationRule::keywords(
                ErrorCategory::ValidationError,
                &["validation", "invalid", "missing required"],
            ),
        ])
    }
}

// Conversion implementations for common error types
impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::StorageError(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::ParseError(err.to_string())
    }
}

impl From<toml::de::Error> for PipelineError {
    fn from(err: toml::de::Error) -> Self {
        PipelineError::ConfigError(err.to_string())
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        PipelineError::NetworkError(err.to_string())
    }
}

impl From<chromiumoxide::error::CdpError> for PipelineError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        PipelineError::BrowserError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_each_category_by_keyword() {
        let classifier = ErrorClassifier::default();

        assert_eq!(
            classifier.classify("HTTP 429 Too Many Requests"),
            ErrorCategory::RateLimit
        );
        assert_eq!(
            classifier.classify("OpenAI returned an unexpected payload"),
            ErrorCategory::ApiError
        );
        assert_eq!(
            classifier.classify("connection reset by peer"),
            ErrorCategory::NetworkError
        );
        assert_eq!(
            classifier.classify("missing required field 'jobs'"),
            ErrorCategory::ValidationError
        );
        assert_eq!(
            classifier.classify("something exploded"),
            ErrorCategory::Unknown
        );
    }

    #[test]
    fn rate_limit_wins_keyword_collisions() {
        let classifier = ErrorClassifier::default();

        // Messages that also contain api/network/validation keywords must
        // still land on the highest-priority match.
        assert_eq!(
            classifier.classify("rate limit hit while calling openai over the network"),
            ErrorCategory::RateLimit
        );
        assert_eq!(
            classifier.classify("429: invalid request, connection throttled"),
            ErrorCategory::RateLimit
        );
        // Api outranks network and validation.
        assert_eq!(
            classifier.classify("api error: connection timeout was invalid"),
            ErrorCategory::ApiError
        );
        // Network outranks validation.
        assert_eq!(
            classifier.classify("network failure: invalid frame"),
            ErrorCategory::NetworkError
        );
    }

    #[test]
    fn classification_is_case_insensitive() {
        let classifier = ErrorClassifier::default();
        assert_eq!(
            classifier.classify("Rate Limit Exceeded"),
            ErrorCategory::RateLimit
        );
        assert_eq!(
            classifier.classify("UNAUTHORIZED"),
            ErrorCategory::ApiError
        );
    }

    #[test]
    fn inserted_rules_take_priority() {
        let mut classifier = ErrorClassifier::default();
        classifier.insert_rule(
            0,
            ClassificationRule::new(ErrorCategory::ValidationError, |message| {
                message.contains("schema mismatch")
            }),
        );

        // Would otherwise classify as NetworkError via "connection".
        assert_eq!(
            classifier.classify("schema mismatch on connection payload"),
            ErrorCategory::ValidationError
        );
        // Untouched messages still follow the default order.
        assert_eq!(
            classifier.classify("connection refused"),
            ErrorCategory::NetworkError
        );
    }

    #[test]
    fn appended_rules_catch_previously_unknown_errors() {
        let mut classifier = ErrorClassifier::default();
        assert_eq!(
            classifier.classify("quota exhausted for project"),
            ErrorCategory::Unknown
        );

        classifier.add_rule(ClassificationRule::keywords(
            ErrorCategory::RateLimit,
            &["quota exhausted"],
        ));
        assert_eq!(
            classifier.classify("quota exhausted for project"),
            ErrorCategory::RateLimit
        );
    }

    #[test]
    fn rate_limit_backoff_caps_at_max_delay() {
        let policy = ErrorCategory::RateLimit.retry_policy();

        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(120));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(240));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(300));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(300));
    }

    #[test]
    fn validation_errors_retry_once_without_delay() {
        let policy = ErrorCategory::ValidationError.retry_policy();

        assert_eq!(policy.max_retries, 1);
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(5), Duration::ZERO);
    }
}
