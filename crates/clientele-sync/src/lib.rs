//! Sync orchestration: single-flight runs, watermark resolution, per-record reconciliation,
//! enrichment sweeps, tag write-back and webhook ingestion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clientele_core::{
    merge_customer, needs_inference, Customer, CustomerRecord, Enrichment, EnrichmentPatch,
    EnrichmentStatus, InferenceInput, SyncCounters, SyncLog, SyncLogUpdate, SyncType,
};
use clientele_enrich::GenderClassifier;
use clientele_source::{CustomerSource, Paginator, SourceError, WireCustomer};
use clientele_storage::{CustomerStore, StoreError, UpsertOutcome};
use serde::Serialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

mod config;

pub use config::{parse_start_date, SyncConfig};

pub const CRATE_NAME: &str = "clientele-sync";

/// Subtracted from every incremental watermark to absorb clock skew at the boundary.
pub const WATERMARK_MARGIN_MINUTES: i64 = 5;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("a sync is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Source(#[from] SourceError),
}

/// Process-wide single-flight flag. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct SyncState {
    running: Arc<AtomicBool>,
}

impl SyncState {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Claims the flag, or `None` when a run already holds it.
    pub fn try_start(&self) -> Option<SyncGuard> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SyncGuard {
                running: Arc::clone(&self.running),
            })
    }
}

/// Releases the single-flight flag when dropped, whatever way the run ended.
#[derive(Debug)]
pub struct SyncGuard {
    running: Arc<AtomicBool>,
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncRequest {
    pub sync_type: SyncType,
    /// Caller-supplied lower bound; outranks every other watermark source.
    pub since: Option<DateTime<Utc>>,
}

impl SyncRequest {
    pub fn incremental() -> Self {
        Self::default()
    }

    pub fn full() -> Self {
        Self {
            sync_type: SyncType::Full,
            since: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub run_id: Uuid,
    pub log_id: i64,
    pub sync_type: SyncType,
    pub updated_since: Option<DateTime<Utc>>,
    pub counters: SyncCounters,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatusView {
    pub last_sync_at: Option<DateTime<Utc>>,
    pub is_syncing: bool,
    pub customer_count: i64,
    pub last_log: Option<SyncLog>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EnrichOutcome {
    pub processed: u32,
    pub enriched: u32,
    pub failed: u32,
}

/// First available boundary in priority order, pulled back by the safety margin.
pub fn resolve_watermark(
    explicit: Option<DateTime<Utc>>,
    configured: Option<DateTime<Utc>>,
    latest_customer_update: Option<DateTime<Utc>>,
    last_completed_sync: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    explicit
        .or(configured)
        .or(latest_customer_update)
        .or(last_completed_sync)
        .map(|boundary| boundary - chrono::Duration::minutes(WATERMARK_MARGIN_MINUTES))
}

/// Classifies pending customers and persists a terminal enrichment state for each. A row that
/// left `pending` while the classifier ran is counted as processed and left alone.
#[derive(Clone)]
pub struct Enricher {
    store: Arc<dyn CustomerStore>,
    classifier: Arc<dyn GenderClassifier>,
    inference_delay: Duration,
}

impl Enricher {
    pub fn new(
        store: Arc<dyn CustomerStore>,
        classifier: Arc<dyn GenderClassifier>,
        inference_delay: Duration,
    ) -> Self {
        Self {
            store,
            classifier,
            inference_delay,
        }
    }

    pub async fn enrich_pending(&self, limit: u32) -> Result<EnrichOutcome, StoreError> {
        let pending = self.store.pending_customers(limit).await?;
        let mut outcome = EnrichOutcome::default();
        for (i, customer) in pending.iter().enumerate() {
            if i > 0 && !self.inference_delay.is_zero() {
                tokio::time::sleep(self.inference_delay).await;
            }
            let inference = self.classifier.infer_gender(&customer.inference_input()).await;
            let enrichment = Enrichment::settled(inference);
            outcome.processed += 1;
            match self.store.settle_pending(customer.external_id, enrichment).await {
                Ok(false) => {
                    debug!(
                        external_id = customer.external_id,
                        "customer settled elsewhere; keeping stored enrichment"
                    );
                }
                Ok(true) if enrichment.status == EnrichmentStatus::Complete => {
                    outcome.enriched += 1
                }
                Ok(true) => outcome.failed += 1,
                Err(err) => {
                    warn!(
                        external_id = customer.external_id,
                        error = %err,
                        "failed to persist enrichment"
                    );
                    outcome.failed += 1;
                }
            }
        }
        info!(
            processed = outcome.processed,
            enriched = outcome.enriched,
            failed = outcome.failed,
            "enrichment pass finished"
        );
        Ok(outcome)
    }

    pub async fn reset_all(&self) -> Result<u64, StoreError> {
        let reset = self.store.reset_all_enrichments().await?;
        warn!(reset, "reset enrichment for every customer");
        Ok(reset)
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: Arc<dyn CustomerStore>,
    source: Arc<dyn CustomerSource>,
    classifier: Arc<dyn GenderClassifier>,
    state: SyncState,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn CustomerStore>,
        source: Arc<dyn CustomerSource>,
        classifier: Arc<dyn GenderClassifier>,
    ) -> Self {
        Self {
            config,
            store,
            source,
            classifier,
            state: SyncState::default(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn CustomerStore> {
        &self.store
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    pub fn enricher(&self) -> Enricher {
        Enricher::new(
            Arc::clone(&self.store),
            Arc::clone(&self.classifier),
            self.config.inference_delay,
        )
    }

    /// Runs a sync to completion on the caller's task. Fails fast with
    /// [`SyncError::AlreadyRunning`] instead of waiting for an active run.
    pub async fn run_sync(&self, request: SyncRequest) -> Result<SyncSummary, SyncError> {
        let guard = self.state.try_start().ok_or(SyncError::AlreadyRunning)?;
        self.run_guarded(guard, request).await
    }

    /// Claims the single-flight flag now and runs the sync in the background.
    pub fn spawn_sync(self: &Arc<Self>, request: SyncRequest) -> Result<(), SyncError> {
        let guard = self.state.try_start().ok_or(SyncError::AlreadyRunning)?;
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = pipeline.run_guarded(guard, request).await {
                error!(error = %err, "background sync failed");
            }
        });
        Ok(())
    }

    pub async fn status(&self) -> Result<SyncStatusView, StoreError> {
        let last_completed = self.store.latest_completed_sync().await?;
        Ok(SyncStatusView {
            last_sync_at: last_completed.and_then(|log| log.completed_at),
            is_syncing: self.state.is_running(),
            customer_count: self.store.count_customers().await?,
            last_log: self.store.get_latest_sync_log().await?,
        })
    }

    /// Applies a platform webhook payload. Create and update share this path, so a
    /// redelivered create is an idempotent update that keeps enrichment.
    pub async fn ingest_webhook(
        &self,
        customer: WireCustomer,
    ) -> Result<UpsertOutcome, StoreError> {
        let record = customer.normalize();
        let existing = self.store.get_by_external_id(record.external_id).await?;
        let upsert = merge_customer(existing.as_ref(), record, EnrichmentPatch::Preserve);
        let outcome = self.store.upsert_customer(upsert).await?;
        info!(
            external_id = outcome.customer.external_id,
            created = outcome.created,
            "applied customer webhook"
        );
        Ok(outcome)
    }

    async fn run_guarded(
        &self,
        _guard: SyncGuard,
        request: SyncRequest,
    ) -> Result<SyncSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, sync_type = request.sync_type.as_str());
        async move {
            let started_at = Utc::now();
            let log = self.store.create_sync_log(request.sync_type, started_at).await?;
            let mut counters = SyncCounters::default();
            let executed = self.execute(&request, &mut counters).await;
            let finished_at = Utc::now();

            // A log that cannot be marked completed still has to leave `running`.
            let outcome = match executed {
                Ok(updated_since) => self
                    .store
                    .update_sync_log(log.id, SyncLogUpdate::Completed(counters), finished_at)
                    .await
                    .map(|_| updated_since)
                    .map_err(SyncError::from),
                Err(err) => Err(err),
            };

            match outcome {
                Ok(updated_since) => {
                    info!(
                        processed = counters.processed,
                        created = counters.created,
                        updated = counters.updated,
                        failed = counters.failed,
                        "sync completed"
                    );
                    self.spawn_sweep();
                    Ok(SyncSummary {
                        run_id,
                        log_id: log.id,
                        sync_type: request.sync_type,
                        updated_since,
                        counters,
                        started_at,
                        finished_at,
                    })
                }
                Err(err) => {
                    error!(error = %err, processed = counters.processed, "sync failed");
                    let update = SyncLogUpdate::Failed {
                        counters,
                        error_message: err.to_string(),
                    };
                    if let Err(log_err) =
                        self.store.update_sync_log(log.id, update, finished_at).await
                    {
                        error!(error = %log_err, log_id = log.id, "could not record sync failure");
                    }
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn execute(
        &self,
        request: &SyncRequest,
        counters: &mut SyncCounters,
    ) -> Result<Option<DateTime<Utc>>, SyncError> {
        let updated_since = match request.sync_type {
            SyncType::Full => None,
            SyncType::Incremental => self.resolve_since(request.since).await?,
        };
        info!(updated_since = ?updated_since, "fetching customers");

        let mut paginator = Paginator::new(self.source.as_ref(), updated_since);
        while let Some(batch) = paginator.next_batch().await? {
            debug!(page = paginator.pages_fetched(), records = batch.len(), "processing batch");
            for record in batch {
                let external_id = record.external_id;
                counters.processed += 1;
                match self.reconcile(record).await {
                    Ok(outcome) => {
                        if outcome.created {
                            counters.created += 1;
                        } else {
                            counters.updated += 1;
                        }
                        if self.config.tag_writeback_enabled {
                            self.write_back(&outcome.customer).await;
                        }
                    }
                    Err(err) => {
                        counters.failed += 1;
                        warn!(external_id, error = %err, "customer failed; continuing");
                        self.mark_failed(external_id).await;
                    }
                }
            }
        }
        Ok(updated_since)
    }

    async fn resolve_since(
        &self,
        explicit: Option<DateTime<Utc>>,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let latest_customer = self.store.latest_customer_update().await?;
        let last_completed = self
            .store
            .latest_completed_sync()
            .await?
            .and_then(|log| log.completed_at);
        Ok(resolve_watermark(
            explicit,
            self.config.sync_start_date,
            latest_customer,
            last_completed,
        ))
    }

    async fn reconcile(&self, record: CustomerRecord) -> Result<UpsertOutcome, StoreError> {
        let existing = self.store.get_by_external_id(record.external_id).await?;
        let patch = if needs_inference(existing.as_ref()) {
            let inference = self
                .classifier
                .infer_gender(&InferenceInput::from(&record))
                .await;
            if !self.config.inference_delay.is_zero() {
                tokio::time::sleep(self.config.inference_delay).await;
            }
            EnrichmentPatch::Inferred(inference)
        } else {
            EnrichmentPatch::Preserve
        };
        let upsert = merge_customer(existing.as_ref(), record, patch);
        self.store.upsert_customer(upsert).await
    }

    async fn mark_failed(&self, external_id: i64) {
        let result = async {
            if let Some(existing) = self.store.get_by_external_id(external_id).await? {
                let enrichment = Enrichment {
                    status: EnrichmentStatus::Failed,
                    ..existing.enrichment()
                };
                self.store.set_enrichment(external_id, enrichment).await?;
            }
            Ok::<_, StoreError>(())
        }
        .await;
        if let Err(err) = result {
            warn!(external_id, error = %err, "could not mark customer failed");
        }
    }

    /// Pushes the canonical gender tag and metafield when the tag string would change.
    async fn write_back(&self, customer: &Customer) {
        let Some(gender) = customer.gender_inferred.filter(|g| g.is_known()) else {
            return;
        };
        let desired = customer.tags.with_gender_tag(gender);
        if desired.to_joined() == customer.tags.to_joined() {
            debug!(external_id = customer.external_id, "gender tag already current");
            return;
        }

        let result = async {
            self.source.update_tags(customer.external_id, &desired).await?;
            self.source
                .set_gender_metafield(customer.external_id, gender)
                .await?;
            self.store.set_tags(customer.external_id, &desired).await?;
            Ok::<_, SyncError>(())
        }
        .await;
        match result {
            Ok(()) => {
                info!(external_id = customer.external_id, %gender, "wrote gender back to source")
            }
            Err(err) => {
                warn!(external_id = customer.external_id, error = %err, "tag write-back failed")
            }
        }
    }

    fn spawn_sweep(&self) {
        let limit = self.config.enrich_sweep_limit;
        if limit == 0 {
            return;
        }
        let enricher = self.enricher();
        tokio::spawn(
            async move {
                if let Err(err) = enricher.enrich_pending(limit).await {
                    warn!(error = %err, "post-sync enrichment sweep failed");
                }
            }
            .instrument(info_span!("enrich_sweep", limit)),
        );
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> anyhow::Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let pipeline = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_sync(SyncRequest::incremental()).await {
                    Ok(summary) => info!(
                        processed = summary.counters.processed,
                        "scheduled sync finished"
                    ),
                    Err(SyncError::AlreadyRunning) => {
                        info!("scheduled sync skipped; another sync is running")
                    }
                    Err(err) => error!(error = %err, "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}
