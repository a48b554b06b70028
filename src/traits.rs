use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::types::{
    DeliveryJob, DigestDocument, OutputFormat, Result, ScanOutcome, SourceType, Subscriber,
};

/// A per-source content scanner (arXiv, tech blogs, project listings, ...).
///
/// `scan` reports per-record problems inside [`ScanOutcome::record_errors`]
/// and only returns `Err` for total source unavailability.
#[async_trait]
pub trait Scanner: Send + Sync {
    fn source_type(&self) -> SourceType;

    /// Human-readable name for logs.
    fn name(&self) -> String;

    async fn scan(&self) -> Result<ScanOutcome>;
}

/// Renders one digest document into one output format.
///
/// Implementations must be pure functions of the document: no hidden state,
/// no re-ordering or re-classification of content.
pub trait Renderer: Send + Sync {
    fn format(&self) -> OutputFormat;

    fn render(&self, digest: &DigestDocument) -> Result<String>;
}

/// Hands one delivery job to the outside world (SMTP or otherwise).
/// Failures are per-job; the caller reports them, never aggregates silently.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, job: &DeliveryJob) -> Result<()>;
}

/// Read-only view of the subscriber list. The selector takes one snapshot
/// at cycle start and ignores changes mid-cycle.
#[async_trait]
pub trait SubscriberStore: Send + Sync {
    async fn snapshot(&self) -> Result<Vec<Subscriber>>;
}

/// In-memory subscriber store for tests and the demo binary.
#[derive(Debug, Default)]
pub struct InMemorySubscriberStore {
    subscribers: RwLock<Vec<Subscriber>>,
}

impl InMemorySubscriberStore {
    pub fn new(subscribers: Vec<Subscriber>) -> Self {
        Self {
            subscribers: RwLock::new(subscribers),
        }
    }

    pub async fn add(&self, subscriber: Subscriber) {
        self.subscribers.write().await.push(subscriber);
    }
}

#[async_trait]
impl SubscriberStore for InMemorySubscriberStore {
    async fn snapshot(&self) -> Result<Vec<Subscriber>> {
        Ok(self.subscribers.read().await.clone())
    }
}
