use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of content source a record was scanned from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Paper,
    BlogPost,
    Project,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paper => "paper",
            Self::BlogPost => "blog_post",
            Self::Project => "project",
        }
    }

    pub fn all() -> [SourceType; 3] {
        [Self::Paper, Self::BlogPost, Self::Project]
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "paper" => Ok(Self::Paper),
            "blog_post" => Ok(Self::BlogPost),
            "project" => Ok(Self::Project),
            other => Err(PipelineError::General(format!(
                "unknown source type: {other}"
            ))),
        }
    }
}

/// Raw record as produced by a scanner, before normalization.
///
/// Scanners emit partial data all the time, so every field is defaulted;
/// the normalizer decides what is required.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawRecord {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub link: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default, alias = "published")]
    pub published_at: Option<NaiveDate>,
    #[serde(default)]
    pub authors: Vec<String>,
}

/// Canonical unit of digest content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentItem {
    pub source_type: SourceType,
    /// Stable key derived from the canonical link (the source lives in the
    /// URL's origin), used for dedup and idempotent re-ingestion.
    pub identity_key: String,
    pub title: String,
    pub link: String,
    pub summary: String,
    pub authors: Vec<String>,
    pub published_at: NaiveDate,
    pub scanned_at: DateTime<Utc>,
    /// Duplicate-free, ordered by rule priority. Empty until classified.
    pub topic_tags: Vec<String>,
}

impl ContentItem {
    /// First tag in rule-priority order, if classified.
    pub fn primary_tag(&self) -> Option<&str> {
        self.topic_tags.first().map(String::as_str)
    }
}

/// One scanner run's output, appended to the daily-scan store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanBatch {
    pub batch_id: Uuid,
    pub source_type: SourceType,
    pub collected_at: DateTime<Utc>,
    pub records: Vec<RawRecord>,
}

impl ScanBatch {
    pub fn new(source_type: SourceType, collected_at: DateTime<Utc>, records: Vec<RawRecord>) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            source_type,
            collected_at,
            records,
        }
    }
}

/// Result of one scan cycle: records plus any per-record errors the source
/// reported. Per-record errors never fail the cycle.
#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    pub records: Vec<RawRecord>,
    pub record_errors: Vec<String>,
}

/// The time window one digest covers, as `YYYY-MM`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeriodId(String);

impl PeriodId {
    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self(format!("{:04}-{:02}", at.year(), at.month()))
    }

    /// The period immediately before `at`'s period; the compile cycle for a
    /// period runs once its boundary has been crossed.
    pub fn previous(at: DateTime<Utc>) -> Self {
        let (year, month) = if at.month() == 1 {
            (at.year() - 1, 12)
        } else {
            (at.year(), at.month() - 1)
        };
        Self(format!("{year:04}-{month:02}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn parts(&self) -> Option<(i32, u32)> {
        let (year, month) = self.0.split_once('-')?;
        let year = year.parse().ok()?;
        let month: u32 = month.parse().ok()?;
        (1..=12).contains(&month).then_some((year, month))
    }

    /// Whether a published/collected date falls inside this period.
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.parts()
            .map(|(year, month)| date.year() == year && date.month() == month)
            .unwrap_or(false)
    }

    /// Human-readable month, e.g. `January 2025`. Used for digest titles.
    pub fn display_month(&self) -> String {
        self.parts()
            .and_then(|(year, month)| NaiveDate::from_ymd_opt(year, month, 1))
            .map(|d| d.format("%B %Y").to_string())
            .unwrap_or_else(|| self.0.clone())
    }
}

impl fmt::Display for PeriodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PeriodId {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        let candidate = Self(s.to_string());
        if candidate.parts().is_none() {
            return Err(PipelineError::InvalidPeriod(s.to_string()));
        }
        Ok(candidate)
    }
}

/// Items-per-source-type counts, derived from the digest's sections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCounts {
    pub papers: usize,
    pub blog_posts: usize,
    pub projects: usize,
}

impl SourceCounts {
    pub fn add(&mut self, source_type: SourceType) {
        match source_type {
            SourceType::Paper => self.papers += 1,
            SourceType::BlogPost => self.blog_posts += 1,
            SourceType::Project => self.projects += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.papers + self.blog_posts + self.projects
    }
}

/// One topical section of a compiled digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestSection {
    pub key: String,
    pub title: String,
    pub items: Vec<ContentItem>,
}

/// The compiled, sectioned content for one period, pre-rendering.
///
/// Owned by the compiler until handed to the emitter; read-only thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestDocument {
    pub period_id: PeriodId,
    pub title: String,
    pub generated_at: DateTime<Utc>,
    /// Explicitly ordered; section order is the classifier's rule order.
    pub sections: Vec<DigestSection>,
    /// Derived from `sections`; never mutated independently.
    pub source_counts: SourceCounts,
}

impl DigestDocument {
    pub fn section_keys(&self) -> Vec<&str> {
        self.sections.iter().map(|s| s.key.as_str()).collect()
    }

    pub fn item_count(&self) -> usize {
        self.sections.iter().map(|s| s.items.len()).sum()
    }

    /// Re-derives the per-source counts from the section contents.
    pub fn recompute_source_counts(&self) -> SourceCounts {
        let mut counts = SourceCounts::default();
        for section in &self.sections {
            for item in &section.items {
                counts.add(item.source_type);
            }
        }
        counts
    }
}

/// Output representation a subscriber can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Html,
    Text,
    Markdown,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Html => "html",
            Self::Text => "text",
            Self::Markdown => "markdown",
        }
    }

    pub fn all() -> [OutputFormat; 3] {
        [Self::Html, Self::Text, Self::Markdown]
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "html" => Ok(Self::Html),
            "text" => Ok(Self::Text),
            "markdown" => Ok(Self::Markdown),
            other => Err(PipelineError::General(format!("unknown format: {other}"))),
        }
    }
}

/// How often a subscriber wants digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Weekly,
    Monthly,
    Quarterly,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Quarterly => "quarterly",
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-subscriber delivery preference, consumed as a filter predicate only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberPreference {
    pub format: OutputFormat,
    pub frequency: Frequency,
    /// Topic tags the subscriber cares about; empty means all.
    #[serde(default)]
    pub categories: Vec<String>,
}

impl Default for SubscriberPreference {
    fn default() -> Self {
        Self {
            format: OutputFormat::Html,
            frequency: Frequency::Monthly,
            categories: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscriber {
    pub subscriber_id: Uuid,
    pub email: String,
    pub preference: SubscriberPreference,
}

/// One unit of work for the external transport.
#[derive(Debug, Clone)]
pub struct DeliveryJob {
    pub subscriber_id: Uuid,
    pub email: String,
    pub format: OutputFormat,
    pub artifact: String,
}

/// Retry behavior for failed compile attempts.
///
/// Delays grow as `initial_interval * multiplier^(attempt - 1)`, capped at
/// `max_interval`. The computation is deterministic so `next_retry_at` can
/// be persisted and unit-tested without timers.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum compile attempts per period, including the first.
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_secs(300),
            multiplier: 2.0,
            max_interval: Duration::from_secs(3600),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt after `attempt` (1-indexed) failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as f64;
        let delay_ms = self.initial_interval.as_millis() as f64 * self.multiplier.powf(exponent);
        let capped_ms = delay_ms.min(self.max_interval.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    pub fn attempts_exhausted(&self, attempt_count: u32) -> bool {
        attempt_count >= self.max_attempts
    }
}

/// What happens to the previous digest when a period is force-recompiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupersededDigestPolicy {
    /// Keep the old document, flagged as superseded.
    Retain,
    /// Delete the old document.
    Discard,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often recurring scan cycles run.
    pub scan_interval: Duration,
    /// In-cycle retries for a transiently unavailable source.
    pub scan_max_retries: u32,
    pub scan_retry_delay: Duration,
    /// A `running` record untouched for longer than this is abandoned.
    pub staleness_timeout: Duration,
    pub retry: RetryPolicy,
    /// Formats emitted for every compiled digest.
    pub formats: Vec<OutputFormat>,
    /// Cycle type matched against subscriber frequency preferences.
    pub cycle_frequency: Frequency,
    pub digest_title: String,
    pub superseded_policy: SupersededDigestPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(24 * 3600),
            scan_max_retries: 3,
            scan_retry_delay: Duration::from_secs(5),
            staleness_timeout: Duration::from_secs(3600),
            retry: RetryPolicy::default(),
            formats: OutputFormat::all().to_vec(),
            cycle_frequency: Frequency::Monthly,
            digest_title: "Open Data Digest".to_string(),
            superseded_policy: SupersededDigestPolicy::Retain,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("malformed record: {reason}")]
    MalformedRecord { reason: String },

    #[error("no items remained for period {period_id} after classification")]
    EmptyDigest { period_id: String },

    #[error("render failed for {format}: {message}")]
    Render {
        format: OutputFormat,
        message: String,
    },

    #[error("source {source_type} unavailable: {message}")]
    SourceUnavailable {
        source_type: SourceType,
        message: String,
    },

    #[error("delivery failed for subscriber {subscriber_id}: {message}")]
    Transport {
        subscriber_id: Uuid,
        message: String,
    },

    #[error("invalid period id: {0} (expected YYYY-MM)")]
    InvalidPeriod(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    General(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
