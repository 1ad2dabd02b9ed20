//! Reconciliation store: idempotent customer upserts, filtered queries, aggregates and the sync
//! journal.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clientele_core::{
    Customer, CustomerQuery, CustomerStats, CustomerUpsert, Enrichment, ExportActivity, ExportDay,
    Page, SyncLog, SyncLogUpdate, SyncType, TagSet,
};
use thiserror::Error;

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "clientele-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("sync log {0} is not running")]
    SyncLogNotRunning(i64),
    #[error("unexpected value {value:?} in column {column}")]
    Corrupt { column: &'static str, value: String },
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Result of an upsert: the stored row and whether the external id was new.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOutcome {
    pub customer: Customer,
    pub created: bool,
}

/// Persistence seam for customers, sync logs and export activity.
///
/// Upserts are keyed on `external_id` and must be a single conflict-resolving write. The store
/// applies the enrichment carried by the [`CustomerUpsert`] verbatim; merge decisions belong to
/// the caller (see [`clientele_core::merge_customer`]).
#[async_trait]
pub trait CustomerStore: Send + Sync {
    async fn upsert_customer(&self, upsert: CustomerUpsert) -> Result<UpsertOutcome>;

    async fn get_by_external_id(&self, external_id: i64) -> Result<Option<Customer>>;

    async fn get_customers(&self, query: &CustomerQuery) -> Result<Page<Customer>>;

    /// Population-wide aggregates; `now` anchors the 7/30 day windows.
    async fn get_stats(&self, now: DateTime<Utc>) -> Result<CustomerStats>;

    async fn count_customers(&self) -> Result<i64>;

    /// Individual tags across all customers, split, trimmed, de-duplicated and sorted.
    async fn distinct_tags(&self) -> Result<Vec<String>>;

    async fn distinct_cities(&self) -> Result<Vec<String>>;

    async fn distinct_provinces(&self) -> Result<Vec<String>>;

    /// Oldest-first batch of rows still waiting for enrichment.
    async fn pending_customers(&self, limit: u32) -> Result<Vec<Customer>>;

    /// Returns false when no row has this external id.
    async fn set_enrichment(&self, external_id: i64, enrichment: Enrichment) -> Result<bool>;

    /// Like `set_enrichment`, but only touches a row that is still pending. Returns false when
    /// the row is gone or something else settled it first.
    async fn settle_pending(&self, external_id: i64, enrichment: Enrichment) -> Result<bool>;

    async fn set_tags(&self, external_id: i64, tags: &TagSet) -> Result<bool>;

    /// Clears every label and puts all rows back to pending. Returns the affected row count.
    async fn reset_all_enrichments(&self) -> Result<u64>;

    /// Newest source-side update timestamp across stored customers.
    async fn latest_customer_update(&self) -> Result<Option<DateTime<Utc>>>;

    async fn create_sync_log(
        &self,
        sync_type: SyncType,
        started_at: DateTime<Utc>,
    ) -> Result<SyncLog>;

    /// Moves a running log to its terminal state. Fails with [`StoreError::SyncLogNotRunning`]
    /// for logs that already finished.
    async fn update_sync_log(
        &self,
        id: i64,
        update: SyncLogUpdate,
        completed_at: DateTime<Utc>,
    ) -> Result<SyncLog>;

    async fn get_latest_sync_log(&self) -> Result<Option<SyncLog>>;

    /// Completed log with the most recent `completed_at`.
    async fn latest_completed_sync(&self) -> Result<Option<SyncLog>>;

    async fn record_export(&self, format: &str, record_count: i64) -> Result<ExportActivity>;

    /// Per-day export totals since `since`, oldest day first.
    async fn export_activity(&self, since: DateTime<Utc>) -> Result<Vec<ExportDay>>;
}

/// Sorted union of individual tags across raw comma-joined tag strings.
pub fn collect_distinct_tags<'a, I>(raw: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a TagSet>,
{
    let mut tags = std::collections::BTreeSet::new();
    for set in raw {
        for tag in set.iter() {
            tags.insert(tag.to_string());
        }
    }
    tags.into_iter().collect()
}
