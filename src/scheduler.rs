use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::classifier::Classifier;
use crate::compiler::{default_section_titles, DigestCompiler};
use crate::dedup::dedup;
use crate::emitter::{EmitReport, MultiFormatEmitter, RenderFailure};
use crate::normalizer::normalize_batch;
use crate::render::default_renderers;
use crate::selector::{select_delivery_jobs, SkippedDelivery};
use crate::store::PipelineStore;
use crate::traits::{Scanner, SubscriberStore, Transport};
use crate::types::{
    ContentItem, DigestDocument, OutputFormat, PeriodId, PipelineError, Result, RetryPolicy,
    ScanBatch, SchedulerConfig, SourceType,
};

/// Lifecycle state of one period's compile run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(PipelineError::General(format!(
                "invalid run status: {other}"
            ))),
        }
    }
}

/// Scheduling state for one period's compile cycle, retained indefinitely
/// as an audit trail.
///
/// Transitions are pure functions of (record, event, now) so they unit-test
/// without timers; the [`Scheduler`] is the only writer.
#[derive(Debug, Clone)]
pub struct CompileRunRecord {
    pub period_id: PeriodId,
    pub status: RunStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl CompileRunRecord {
    pub fn new(period_id: PeriodId, now: DateTime<Utc>) -> Self {
        Self {
            period_id,
            status: RunStatus::Pending,
            attempt_count: 0,
            last_error: None,
            next_retry_at: None,
            started_at: None,
            updated_at: now,
        }
    }

    /// `pending`/`failed` (or, with `force`, `succeeded`) -> `running`.
    pub fn begin_attempt(&self, now: DateTime<Utc>, force: bool) -> Result<Self> {
        match self.status {
            RunStatus::Running => Err(PipelineError::General(format!(
                "compile for {} is already running",
                self.period_id
            ))),
            RunStatus::Succeeded if !force => Err(PipelineError::General(format!(
                "compile for {} already succeeded; pass force to recompile",
                self.period_id
            ))),
            _ => Ok(Self {
                status: RunStatus::Running,
                attempt_count: self.attempt_count + 1,
                next_retry_at: None,
                started_at: Some(now),
                updated_at: now,
                ..self.clone()
            }),
        }
    }

    /// `running` -> `succeeded`. Terminal until force-recompiled.
    pub fn complete(&self, now: DateTime<Utc>) -> Self {
        Self {
            status: RunStatus::Succeeded,
            last_error: None,
            next_retry_at: None,
            updated_at: now,
            ..self.clone()
        }
    }

    /// `running` -> `failed`, scheduling a retry unless attempts are
    /// exhausted.
    pub fn fail(&self, error: &str, policy: &RetryPolicy, now: DateTime<Utc>) -> Self {
        let next_retry_at = if policy.attempts_exhausted(self.attempt_count) {
            None
        } else {
            let delay = policy.delay_for_attempt(self.attempt_count);
            Some(now + ChronoDuration::seconds(delay.as_secs() as i64))
        };
        Self {
            status: RunStatus::Failed,
            last_error: Some(error.to_string()),
            next_retry_at,
            updated_at: now,
            ..self.clone()
        }
    }

    /// Detects an abandoned `running` record (process died mid-compile).
    ///
    /// Returns the recovered record: back to `pending` when attempts
    /// remain, escalated to `failed` otherwise, never skipped to
    /// `succeeded`. `None` when the record is not stale.
    pub fn recover_stale(
        &self,
        timeout: std::time::Duration,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        if self.status != RunStatus::Running {
            return None;
        }
        let cutoff = now - ChronoDuration::seconds(timeout.as_secs() as i64);
        if self.updated_at > cutoff {
            return None;
        }

        let recovered = if policy.attempts_exhausted(self.attempt_count) {
            Self {
                status: RunStatus::Failed,
                last_error: Some("abandoned while running and attempts exhausted".to_string()),
                next_retry_at: None,
                updated_at: now,
                ..self.clone()
            }
        } else {
            Self {
                status: RunStatus::Pending,
                last_error: Some("abandoned while running".to_string()),
                next_retry_at: None,
                updated_at: now,
                ..self.clone()
            }
        };
        Some(recovered)
    }

    /// Whether a failed run is eligible for another attempt at `now`.
    pub fn retry_due(&self, now: DateTime<Utc>) -> bool {
        self.status == RunStatus::Failed
            && self
                .next_retry_at
                .map(|at| at <= now)
                .unwrap_or(false)
    }
}

/// Result of one scan cycle.
#[derive(Debug)]
pub struct ScanCycleReport {
    pub source_type: SourceType,
    pub batch_id: Option<Uuid>,
    pub records: usize,
    pub record_errors: Vec<String>,
}

/// Post-compile delivery summary; failures are per-job and surfaced.
#[derive(Debug, Default)]
pub struct DeliveryReport {
    pub sent: usize,
    pub failures: Vec<String>,
    pub skipped: Vec<SkippedDelivery>,
}

/// Everything a successful compile cycle produced.
#[derive(Debug)]
pub struct CompileSuccess {
    pub record: CompileRunRecord,
    pub digest: DigestDocument,
    pub artifacts: HashMap<OutputFormat, String>,
    pub render_failures: Vec<RenderFailure>,
    pub dropped_records: usize,
    pub duplicates_merged: usize,
    pub delivery: Option<DeliveryReport>,
}

/// Outcome of a `trigger_compile` call.
#[derive(Debug)]
pub enum CompileOutcome {
    /// This call compiled the digest.
    Compiled(Box<CompileSuccess>),
    /// The period already has a digest; nothing was recomputed.
    AlreadySucceeded {
        record: CompileRunRecord,
        digest: DigestDocument,
    },
    /// Another compile for this period is in flight; this call was a no-op.
    AlreadyRunning(CompileRunRecord),
    /// The attempt failed (or a failed record is waiting out its backoff /
    /// has exhausted its attempts).
    Failed(CompileRunRecord),
}

impl CompileOutcome {
    pub fn record(&self) -> &CompileRunRecord {
        match self {
            Self::Compiled(success) => &success.record,
            Self::AlreadySucceeded { record, .. } => record,
            Self::AlreadyRunning(record) => record,
            Self::Failed(record) => record,
        }
    }
}

/// Drives recurring scan cycles and per-period compile cycles.
///
/// Sole writer of run-record status; scan cycles are serialized per source
/// type and compile cycles per period, while different sources and periods
/// proceed independently.
pub struct Scheduler {
    store: Arc<PipelineStore>,
    config: SchedulerConfig,
    classifier: Classifier,
    compiler: DigestCompiler,
    emitter: MultiFormatEmitter,
    scanners: HashMap<SourceType, Box<dyn Scanner>>,
    subscriber_store: Option<Arc<dyn SubscriberStore>>,
    transport: Option<Arc<dyn Transport>>,
    scan_locks: Mutex<HashMap<SourceType, Arc<Mutex<()>>>>,
    compile_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    is_running: Arc<RwLock<bool>>,
}

impl Scheduler {
    pub fn new(store: Arc<PipelineStore>, config: SchedulerConfig) -> Self {
        let classifier = Classifier::default();
        let compiler = DigestCompiler::new(classifier.section_order(), default_section_titles());
        Self {
            store,
            config,
            classifier,
            compiler,
            emitter: MultiFormatEmitter::new(default_renderers()),
            scanners: HashMap::new(),
            subscriber_store: None,
            transport: None,
            scan_locks: Mutex::new(HashMap::new()),
            compile_locks: Mutex::new(HashMap::new()),
            is_running: Arc::new(RwLock::new(false)),
        }
    }

    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.compiler =
            DigestCompiler::new(classifier.section_order(), default_section_titles());
        self.classifier = classifier;
        self
    }

    pub fn with_emitter(mut self, emitter: MultiFormatEmitter) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn register_scanner(&mut self, scanner: Box<dyn Scanner>) {
        info!(source_type = %scanner.source_type(), name = %scanner.name(), "registered scanner");
        self.scanners.insert(scanner.source_type(), scanner);
    }

    pub fn set_subscriber_store(&mut self, store: Arc<dyn SubscriberStore>) {
        self.subscriber_store = Some(store);
    }

    pub fn set_transport(&mut self, transport: Arc<dyn Transport>) {
        self.transport = Some(transport);
    }

    pub fn store(&self) -> &Arc<PipelineStore> {
        &self.store
    }

    /// Runs one scan cycle for `source_type`, appending the records to the
    /// daily-scan store as a new batch.
    ///
    /// Transient source failures are retried in-cycle with exponential
    /// backoff; only total unavailability fails the cycle, and only this
    /// source's cycle.
    pub async fn trigger_scan(&self, source_type: SourceType) -> Result<ScanCycleReport> {
        let scanner = self.scanners.get(&source_type).ok_or_else(|| {
            PipelineError::SourceUnavailable {
                source_type,
                message: "no scanner registered".to_string(),
            }
        })?;

        let lock = {
            let mut locks = self.scan_locks.lock().await;
            locks.entry(source_type).or_default().clone()
        };
        let _guard = lock.lock().await;

        let mut backoff = ExponentialBackoff {
            current_interval: self.config.scan_retry_delay,
            initial_interval: self.config.scan_retry_delay,
            max_interval: self.config.scan_retry_delay * 32,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut last_error = None;
        for attempt in 0..=self.config.scan_max_retries {
            match scanner.scan().await {
                Ok(outcome) => {
                    for record_error in &outcome.record_errors {
                        warn!(%source_type, "scanner reported record error: {record_error}");
                    }

                    if outcome.records.is_empty() {
                        info!(%source_type, "scan cycle found no records");
                        return Ok(ScanCycleReport {
                            source_type,
                            batch_id: None,
                            records: 0,
                            record_errors: outcome.record_errors,
                        });
                    }

                    let batch = ScanBatch::new(source_type, Utc::now(), outcome.records);
                    self.store.append_batch(&batch).await?;
                    info!(
                        %source_type,
                        batch_id = %batch.batch_id,
                        records = batch.records.len(),
                        "scan cycle appended batch"
                    );
                    return Ok(ScanCycleReport {
                        source_type,
                        batch_id: Some(batch.batch_id),
                        records: batch.records.len(),
                        record_errors: outcome.record_errors,
                    });
                }
                Err(e) => {
                    warn!(%source_type, attempt, "scan attempt failed: {e}");
                    last_error = Some(e);
                    if attempt < self.config.scan_max_retries {
                        if let Some(delay) = backoff.next_backoff() {
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                    }
                }
            }
        }

        let message = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown scan failure".to_string());
        error!(%source_type, "scan cycle failed after retries: {message}");
        Err(PipelineError::SourceUnavailable {
            source_type,
            message,
        })
    }

    /// Runs scan cycles for every registered source. One source failing
    /// never aborts the others; partial results are still appended.
    pub async fn scan_all_sources(&self) -> Vec<ScanCycleReport> {
        let mut reports = Vec::new();
        let sources: Vec<SourceType> = self.scanners.keys().copied().collect();
        for source_type in sources {
            match self.trigger_scan(source_type).await {
                Ok(report) => reports.push(report),
                Err(e) => error!(%source_type, "scan cycle failed: {e}"),
            }
        }
        reports
    }

    /// Runs (or re-runs, with `force`) the compile cycle for `period_id`.
    ///
    /// Idempotent for `force = false`: an already-succeeded period returns
    /// its existing digest with no recomputation, an in-flight compile is a
    /// no-op returning the existing record, and a failed run waiting out
    /// its backoff (or out of attempts) is left alone.
    pub async fn trigger_compile(&self, period_id: &PeriodId, force: bool) -> Result<CompileOutcome> {
        self.recover_stale_runs().await?;

        let lock = {
            let mut locks = self.compile_locks.lock().await;
            locks
                .entry(period_id.to_string())
                .or_default()
                .clone()
        };
        let Ok(_guard) = lock.try_lock() else {
            let record = self
                .store
                .get_run(period_id)
                .await?
                .unwrap_or_else(|| CompileRunRecord::new(period_id.clone(), Utc::now()));
            debug!(%period_id, "compile already in flight; trigger is a no-op");
            return Ok(CompileOutcome::AlreadyRunning(record));
        };

        let now = Utc::now();
        let record = match self.store.get_run(period_id).await? {
            Some(record) => record,
            None => {
                let record = CompileRunRecord::new(period_id.clone(), now);
                self.store.save_run(&record).await?;
                record
            }
        };

        match record.status {
            RunStatus::Running => {
                // Not stale yet (recover_stale_runs just ran); leave it be.
                return Ok(CompileOutcome::AlreadyRunning(record));
            }
            RunStatus::Succeeded if !force => {
                let digest = self.store.current_digest(period_id).await?.ok_or_else(|| {
                    PipelineError::General(format!(
                        "run for {period_id} succeeded but no digest is stored"
                    ))
                })?;
                debug!(%period_id, "period already compiled; returning existing digest");
                return Ok(CompileOutcome::AlreadySucceeded { record, digest });
            }
            RunStatus::Failed if !force => {
                if self.config.retry.attempts_exhausted(record.attempt_count) {
                    warn!(
                        %period_id,
                        attempts = record.attempt_count,
                        "compile attempts exhausted; not retrying without force"
                    );
                    return Ok(CompileOutcome::Failed(record));
                }
                if !record.retry_due(now) {
                    debug!(%period_id, next_retry_at = ?record.next_retry_at, "backoff pending");
                    return Ok(CompileOutcome::Failed(record));
                }
            }
            _ => {}
        }

        let record = record.begin_attempt(now, force)?;
        self.store.save_run(&record).await?;
        info!(%period_id, attempt = record.attempt_count, force, "compile cycle starting");

        match self.compile_attempt(period_id).await {
            Ok((digest, report, dropped_records, duplicates_merged)) => {
                self.store
                    .store_digest(&digest, self.config.superseded_policy)
                    .await?;
                let record = record.complete(Utc::now());
                self.store.save_run(&record).await?;

                let delivery = self.deliver(&digest, &report).await;

                info!(
                    %period_id,
                    items = digest.item_count(),
                    dropped_records,
                    duplicates_merged,
                    "compile cycle succeeded"
                );
                Ok(CompileOutcome::Compiled(Box::new(CompileSuccess {
                    record,
                    artifacts: report.artifacts,
                    render_failures: report.failures,
                    digest,
                    dropped_records,
                    duplicates_merged,
                    delivery,
                })))
            }
            Err(e) => {
                let record = record.fail(&e.to_string(), &self.config.retry, Utc::now());
                self.store.save_run(&record).await?;
                error!(
                    %period_id,
                    attempt = record.attempt_count,
                    next_retry_at = ?record.next_retry_at,
                    "compile cycle failed: {e}"
                );
                Ok(CompileOutcome::Failed(record))
            }
        }
    }

    /// One compile attempt: batches -> normalize -> dedup -> classify ->
    /// compile -> emit. Pure pipeline stages; no partial digest escapes.
    async fn compile_attempt(
        &self,
        period_id: &PeriodId,
    ) -> Result<(DigestDocument, EmitReport, usize, usize)> {
        let batches = self.store.batches_for_period(period_id).await?;

        let mut items: Vec<ContentItem> = Vec::new();
        let mut dropped_records = 0;
        for batch in &batches {
            let (batch_items, dropped) = normalize_batch(batch);
            items.extend(batch_items);
            dropped_records += dropped;
        }

        let before_dedup = items.len();
        let items = dedup(items);
        let duplicates_merged = before_dedup - items.len();

        let items = self.classifier.classify_all(items);

        let title = format!(
            "{} - {}",
            self.config.digest_title,
            period_id.display_month()
        );
        let digest = self.compiler.compile(period_id.clone(), title, items)?;

        let report = self.emitter.emit(&digest, &self.config.formats);
        if report.all_failed() {
            let formats: Vec<String> = report
                .failures
                .iter()
                .map(|f| f.format.to_string())
                .collect();
            return Err(PipelineError::General(format!(
                "every requested format failed to render: {}",
                formats.join(", ")
            )));
        }

        Ok((digest, report, dropped_records, duplicates_merged))
    }

    /// Hands the finished artifacts to the transport, when one is wired.
    async fn deliver(&self, digest: &DigestDocument, report: &EmitReport) -> Option<DeliveryReport> {
        let subscriber_store = self.subscriber_store.as_ref()?;

        let subscribers = match subscriber_store.snapshot().await {
            Ok(subscribers) => subscribers,
            Err(e) => {
                error!("failed to snapshot subscribers: {e}");
                return Some(DeliveryReport {
                    failures: vec![format!("subscriber snapshot failed: {e}")],
                    ..DeliveryReport::default()
                });
            }
        };

        let selection =
            select_delivery_jobs(digest, report, &subscribers, self.config.cycle_frequency);
        let mut delivery = DeliveryReport {
            skipped: selection.skipped,
            ..DeliveryReport::default()
        };

        let Some(transport) = self.transport.as_ref() else {
            debug!("no transport configured; delivery jobs computed but not sent");
            return Some(delivery);
        };

        for job in &selection.jobs {
            match transport.send(job).await {
                Ok(()) => delivery.sent += 1,
                Err(e) => {
                    warn!(subscriber_id = %job.subscriber_id, "delivery failed: {e}");
                    delivery.failures.push(e.to_string());
                }
            }
        }
        Some(delivery)
    }

    /// Sweeps `running` records abandoned past the staleness timeout back
    /// to `pending` (or `failed` when out of attempts).
    pub async fn recover_stale_runs(&self) -> Result<usize> {
        let now = Utc::now();
        let mut recovered = 0;
        for record in self.store.list_runs().await? {
            if let Some(recovered_record) =
                record.recover_stale(self.config.staleness_timeout, &self.config.retry, now)
            {
                warn!(
                    period_id = %recovered_record.period_id,
                    status = %recovered_record.status,
                    "recovered abandoned compile run"
                );
                self.store.save_run(&recovered_record).await?;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Re-triggers every failed run whose backoff has elapsed.
    pub async fn retry_due_compiles(&self) -> Result<Vec<CompileOutcome>> {
        let now = Utc::now();
        let mut outcomes = Vec::new();
        for record in self.store.list_runs().await? {
            if record.retry_due(now) {
                info!(period_id = %record.period_id, "retrying failed compile");
                outcomes.push(self.trigger_compile(&record.period_id, false).await?);
            }
        }
        Ok(outcomes)
    }

    /// The recurring driver: scans every registered source each interval
    /// and compiles a period once its boundary has been crossed, retrying
    /// failed runs as their backoff elapses.
    pub async fn run(&self) -> Result<()> {
        {
            let mut is_running = self.is_running.write().await;
            if *is_running {
                return Err(PipelineError::General(
                    "scheduler is already running".to_string(),
                ));
            }
            *is_running = true;
        }

        info!(
            sources = self.scanners.len(),
            scan_interval_secs = self.config.scan_interval.as_secs(),
            "scheduler loop starting"
        );

        let mut ticker = tokio::time::interval(self.config.scan_interval);
        while *self.is_running.read().await {
            ticker.tick().await;

            self.scan_all_sources().await;

            if let Err(e) = self.recover_stale_runs().await {
                error!("stale-run recovery failed: {e}");
            }

            let previous = PeriodId::previous(Utc::now());
            match self.trigger_compile(&previous, false).await {
                Ok(outcome) => {
                    debug!(period_id = %previous, status = %outcome.record().status, "periodic compile check")
                }
                Err(e) => error!(period_id = %previous, "compile check failed: {e}"),
            }

            if let Err(e) = self.retry_due_compiles().await {
                error!("retry sweep failed: {e}");
            }
        }

        info!("scheduler loop stopped");
        Ok(())
    }

    pub async fn stop(&self) {
        let mut is_running = self.is_running.write().await;
        *is_running = false;
    }
}
