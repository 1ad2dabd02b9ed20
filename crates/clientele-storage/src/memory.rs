use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use clientele_core::{
    CountryCount, Customer, CustomerQuery, CustomerStats, CustomerUpsert, Enrichment,
    EnrichmentStatus, ExportActivity, ExportDay, Gender, Page, Pagination,
    SortColumn, SortDirection, SyncLog, SyncLogUpdate, SyncStatus, SyncType, TagSet,
    TOP_COUNTRIES_LIMIT,
};
use tokio::sync::Mutex;

use crate::{collect_distinct_tags, CustomerStore, Result, StoreError, UpsertOutcome};

/// In-process store with the same semantics as [`crate::PgStore`]. Every operation runs under
/// one lock, so upserts are atomic per record.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    customers: BTreeMap<i64, Customer>,
    next_customer_id: i64,
    sync_logs: Vec<SyncLog>,
    exports: Vec<ExportActivity>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every sync log, oldest first.
    pub async fn sync_logs(&self) -> Vec<SyncLog> {
        self.state.lock().await.sync_logs.clone()
    }

    pub async fn customers(&self) -> Vec<Customer> {
        self.state.lock().await.customers.values().cloned().collect()
    }
}

fn directed(ordering: Ordering, direction: SortDirection) -> Ordering {
    match direction {
        SortDirection::Asc => ordering,
        SortDirection::Desc => ordering.reverse(),
    }
}

/// Mirrors `ORDER BY col dir NULLS LAST`.
fn cmp_nullable<T: PartialOrd>(a: Option<T>, b: Option<T>, direction: SortDirection) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => directed(a.partial_cmp(&b).unwrap_or(Ordering::Equal), direction),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn compare(a: &Customer, b: &Customer, column: SortColumn, direction: SortDirection) -> Ordering {
    match column {
        SortColumn::CreatedAtSource => {
            cmp_nullable(a.created_at_source, b.created_at_source, direction)
        }
        SortColumn::UpdatedAtSource => {
            cmp_nullable(a.updated_at_source, b.updated_at_source, direction)
        }
        SortColumn::LastOrderAt => cmp_nullable(a.last_order_at, b.last_order_at, direction),
        SortColumn::TotalSpent => cmp_nullable(Some(a.total_spent), Some(b.total_spent), direction),
        SortColumn::OrdersCount => {
            cmp_nullable(Some(a.orders_count), Some(b.orders_count), direction)
        }
        SortColumn::FirstName => {
            cmp_nullable(a.first_name.as_ref(), b.first_name.as_ref(), direction)
        }
        SortColumn::LastName => cmp_nullable(a.last_name.as_ref(), b.last_name.as_ref(), direction),
        SortColumn::Email => cmp_nullable(a.email.as_ref(), b.email.as_ref(), direction),
        SortColumn::City => cmp_nullable(a.city.as_ref(), b.city.as_ref(), direction),
        SortColumn::Province => cmp_nullable(a.province.as_ref(), b.province.as_ref(), direction),
        SortColumn::Country => cmp_nullable(a.country.as_ref(), b.country.as_ref(), direction),
        SortColumn::GenderConfidence => {
            cmp_nullable(a.gender_confidence, b.gender_confidence, direction)
        }
    }
    .then(a.id.cmp(&b.id))
}

fn distinct_non_empty<'a>(values: impl Iterator<Item = Option<&'a String>>) -> Vec<String> {
    values
        .flatten()
        .filter(|v| !v.is_empty())
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[async_trait]
impl CustomerStore for MemoryStore {
    async fn upsert_customer(&self, upsert: CustomerUpsert) -> Result<UpsertOutcome> {
        let CustomerUpsert { record, enrichment } = upsert;
        let now = Utc::now();
        let mut state = self.state.lock().await;

        let (id, created_at, created) = match state.customers.get(&record.external_id) {
            Some(existing) => (existing.id, existing.created_at, false),
            None => {
                state.next_customer_id += 1;
                (state.next_customer_id, now, true)
            }
        };

        let customer = Customer {
            id,
            external_id: record.external_id,
            email: record.email,
            phone: record.phone,
            first_name: record.first_name,
            last_name: record.last_name,
            city: record.city,
            country: record.country,
            province: record.province,
            postal_code: record.postal_code,
            tags: record.tags,
            orders_count: record.orders_count.max(0),
            total_spent: record.total_spent.max(0.0),
            created_at_source: record.created_at_source,
            updated_at_source: record.updated_at_source,
            last_order_at: record.last_order_at,
            gender_inferred: enrichment.gender,
            gender_confidence: enrichment.confidence,
            enrichment_status: enrichment.status,
            created_at,
            updated_at: now,
        };
        state.customers.insert(customer.external_id, customer.clone());
        Ok(UpsertOutcome { customer, created })
    }

    async fn get_by_external_id(&self, external_id: i64) -> Result<Option<Customer>> {
        Ok(self.state.lock().await.customers.get(&external_id).cloned())
    }

    async fn get_customers(&self, query: &CustomerQuery) -> Result<Page<Customer>> {
        let state = self.state.lock().await;
        let mut matching = state
            .customers
            .values()
            .filter(|c| query.filter.matches(c))
            .cloned()
            .collect::<Vec<_>>();
        matching.sort_by(|a, b| compare(a, b, query.sort, query.direction));

        let total_count = matching.len() as u64;
        let data = match query.page_size {
            Some(size) => matching
                .into_iter()
                .skip(usize::try_from(query.offset()).unwrap_or(usize::MAX))
                .take(size as usize)
                .collect(),
            None => matching,
        };
        Ok(Page {
            data,
            pagination: Pagination::for_query(query, total_count),
        })
    }

    async fn get_stats(&self, now: DateTime<Utc>) -> Result<CustomerStats> {
        let state = self.state.lock().await;
        let week_ago = now - Duration::days(7);
        let month_ago = now - Duration::days(30);

        let mut stats = CustomerStats::default();
        let mut countries: HashMap<&str, i64> = HashMap::new();
        for c in state.customers.values() {
            stats.total_customers += 1;
            match c.gender_inferred {
                Some(Gender::Male) => stats.gender_counts.male += 1,
                Some(Gender::Female) => stats.gender_counts.female += 1,
                Some(Gender::Unknown) => stats.gender_counts.unknown += 1,
                None => stats.gender_counts.unprocessed += 1,
            }
            if c.enrichment_status == EnrichmentStatus::Pending {
                stats.pending_enrichment += 1;
            }
            if c.created_at_source.is_some_and(|t| t >= week_ago) {
                stats.new_last_7_days += 1;
            }
            if c.created_at_source.is_some_and(|t| t >= month_ago) {
                stats.new_last_30_days += 1;
            }
            if let Some(country) = c.country.as_deref().filter(|c| !c.is_empty()) {
                *countries.entry(country).or_default() += 1;
            }
            stats.total_revenue += c.total_spent;
            stats.total_orders += i64::from(c.orders_count);
        }

        let mut top = countries
            .into_iter()
            .map(|(country, count)| CountryCount {
                country: country.to_string(),
                count,
            })
            .collect::<Vec<_>>();
        top.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.country.cmp(&b.country)));
        top.truncate(TOP_COUNTRIES_LIMIT);
        stats.top_countries = top;
        Ok(stats.with_averages())
    }

    async fn count_customers(&self) -> Result<i64> {
        Ok(self.state.lock().await.customers.len() as i64)
    }

    async fn distinct_tags(&self) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        Ok(collect_distinct_tags(state.customers.values().map(|c| &c.tags)))
    }

    async fn distinct_cities(&self) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        Ok(distinct_non_empty(state.customers.values().map(|c| c.city.as_ref())))
    }

    async fn distinct_provinces(&self) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        Ok(distinct_non_empty(state.customers.values().map(|c| c.province.as_ref())))
    }

    async fn pending_customers(&self, limit: u32) -> Result<Vec<Customer>> {
        let state = self.state.lock().await;
        let mut pending = state
            .customers
            .values()
            .filter(|c| c.enrichment_status == EnrichmentStatus::Pending)
            .cloned()
            .collect::<Vec<_>>();
        pending.sort_by_key(|c| c.id);
        pending.truncate(limit as usize);
        Ok(pending)
    }

    async fn set_enrichment(&self, external_id: i64, enrichment: Enrichment) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(c) = state.customers.get_mut(&external_id) else {
            return Ok(false);
        };
        c.gender_inferred = enrichment.gender;
        c.gender_confidence = enrichment.confidence;
        c.enrichment_status = enrichment.status;
        c.updated_at = Utc::now();
        Ok(true)
    }

    async fn settle_pending(&self, external_id: i64, enrichment: Enrichment) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(c) = state
            .customers
            .get_mut(&external_id)
            .filter(|c| c.enrichment_status == EnrichmentStatus::Pending)
        else {
            return Ok(false);
        };
        c.gender_inferred = enrichment.gender;
        c.gender_confidence = enrichment.confidence;
        c.enrichment_status = enrichment.status;
        c.updated_at = Utc::now();
        Ok(true)
    }

    async fn set_tags(&self, external_id: i64, tags: &TagSet) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(c) = state.customers.get_mut(&external_id) else {
            return Ok(false);
        };
        c.tags = tags.clone();
        c.updated_at = Utc::now();
        Ok(true)
    }

    async fn reset_all_enrichments(&self) -> Result<u64> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        for c in state.customers.values_mut() {
            c.gender_inferred = None;
            c.gender_confidence = None;
            c.enrichment_status = EnrichmentStatus::Pending;
            c.updated_at = now;
        }
        Ok(state.customers.len() as u64)
    }

    async fn latest_customer_update(&self) -> Result<Option<DateTime<Utc>>> {
        let state = self.state.lock().await;
        Ok(state
            .customers
            .values()
            .filter_map(|c| c.updated_at_source)
            .max())
    }

    async fn create_sync_log(
        &self,
        sync_type: SyncType,
        started_at: DateTime<Utc>,
    ) -> Result<SyncLog> {
        let mut state = self.state.lock().await;
        let log = SyncLog {
            id: state.sync_logs.len() as i64 + 1,
            sync_type,
            status: SyncStatus::Running,
            customers_processed: 0,
            customers_created: 0,
            customers_updated: 0,
            customers_failed: 0,
            error_message: None,
            started_at,
            completed_at: None,
        };
        state.sync_logs.push(log.clone());
        Ok(log)
    }

    async fn update_sync_log(
        &self,
        id: i64,
        update: SyncLogUpdate,
        completed_at: DateTime<Utc>,
    ) -> Result<SyncLog> {
        let mut state = self.state.lock().await;
        let log = state
            .sync_logs
            .iter_mut()
            .find(|l| l.id == id && l.status == SyncStatus::Running)
            .ok_or(StoreError::SyncLogNotRunning(id))?;
        let (status, counters, error_message) = match update {
            SyncLogUpdate::Completed(counters) => (SyncStatus::Completed, counters, None),
            SyncLogUpdate::Failed {
                counters,
                error_message,
            } => (SyncStatus::Failed, counters, Some(error_message)),
        };
        log.status = status;
        log.customers_processed = counters.processed;
        log.customers_created = counters.created;
        log.customers_updated = counters.updated;
        log.customers_failed = counters.failed;
        log.error_message = error_message;
        log.completed_at = Some(completed_at);
        Ok(log.clone())
    }

    async fn get_latest_sync_log(&self) -> Result<Option<SyncLog>> {
        let state = self.state.lock().await;
        Ok(state
            .sync_logs
            .iter()
            .max_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)))
            .cloned())
    }

    async fn latest_completed_sync(&self) -> Result<Option<SyncLog>> {
        let state = self.state.lock().await;
        Ok(state
            .sync_logs
            .iter()
            .filter(|l| l.status == SyncStatus::Completed && l.completed_at.is_some())
            .max_by_key(|l| l.completed_at)
            .cloned())
    }

    async fn record_export(&self, format: &str, record_count: i64) -> Result<ExportActivity> {
        let mut state = self.state.lock().await;
        let activity = ExportActivity {
            id: state.exports.len() as i64 + 1,
            format: format.to_string(),
            record_count,
            created_at: Utc::now(),
        };
        state.exports.push(activity.clone());
        Ok(activity)
    }

    async fn export_activity(&self, since: DateTime<Utc>) -> Result<Vec<ExportDay>> {
        let state = self.state.lock().await;
        let mut days: BTreeMap<chrono::NaiveDate, (i64, i64)> = BTreeMap::new();
        for e in state.exports.iter().filter(|e| e.created_at >= since) {
            let entry = days.entry(e.created_at.date_naive()).or_default();
            entry.0 += 1;
            entry.1 += e.record_count;
        }
        Ok(days
            .into_iter()
            .map(|(day, (exports, records))| ExportDay {
                day,
                exports,
                records,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use clientele_core::{
        merge_customer, CustomerFilter, CustomerRecord, EnrichmentPatch, Inference, SyncCounters,
    };

    fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 9, 30, 0).single().unwrap()
    }

    fn record(external_id: i64) -> CustomerRecord {
        CustomerRecord {
            external_id,
            email: Some(format!("customer{external_id}@example.com")),
            first_name: Some(format!("First{external_id}")),
            last_name: Some("Example".into()),
            city: Some("Austin".into()),
            country: Some("United States".into()),
            province: Some("Texas".into()),
            tags: TagSet::parse("newsletter"),
            orders_count: 2,
            total_spent: 40.0,
            created_at_source: Some(ts(2026, 1, 1)),
            updated_at_source: Some(ts(2026, 1, 2)),
            ..Default::default()
        }
    }

    async fn seed(store: &MemoryStore, rec: CustomerRecord, patch: EnrichmentPatch) -> Customer {
        let existing = store.get_by_external_id(rec.external_id).await.unwrap();
        let upsert = merge_customer(existing.as_ref(), rec, patch);
        store.upsert_customer(upsert).await.unwrap().customer
    }

    #[tokio::test]
    async fn upsert_is_idempotent_per_external_id() {
        let store = MemoryStore::new();
        let first = store
            .upsert_customer(merge_customer(None, record(42), EnrichmentPatch::Preserve))
            .await
            .unwrap();
        let second = store
            .upsert_customer(merge_customer(None, record(42), EnrichmentPatch::Preserve))
            .await
            .unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(store.count_customers().await.unwrap(), 1);
        assert_eq!(first.customer.id, second.customer.id);
        let mut a = first.customer.clone();
        let mut b = second.customer.clone();
        a.updated_at = b.updated_at;
        b.created_at = a.created_at;
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn resync_without_inference_keeps_enrichment() {
        let store = MemoryStore::new();
        seed(
            &store,
            record(7),
            EnrichmentPatch::Inferred(Inference::new(Gender::Female, 0.9)),
        )
        .await;

        let mut changed = record(7);
        changed.city = Some("Dallas".into());
        let after = seed(&store, changed, EnrichmentPatch::Preserve).await;

        assert_eq!(after.city.as_deref(), Some("Dallas"));
        assert_eq!(after.gender_inferred, Some(Gender::Female));
        assert_eq!(after.gender_confidence, Some(0.9));
        assert_eq!(after.enrichment_status, EnrichmentStatus::Complete);
    }

    #[tokio::test]
    async fn count_matches_filter_and_pages_round_up() {
        let store = MemoryStore::new();
        for id in 1..=23 {
            let mut rec = record(id);
            rec.total_spent = id as f64 * 10.0;
            if id % 3 == 0 {
                rec.province = Some("Ontario".into());
            }
            seed(&store, rec, EnrichmentPatch::Preserve).await;
        }

        let filter = CustomerFilter {
            min_spent: Some(50.0),
            region: Some("South".into()),
            ..Default::default()
        };
        let expected = store
            .customers()
            .await
            .iter()
            .filter(|c| c.total_spent >= 50.0 && c.province.as_deref() == Some("Texas"))
            .count() as u64;

        let page = store
            .get_customers(&CustomerQuery {
                filter,
                page: 2,
                page_size: Some(5),
                sort: SortColumn::TotalSpent,
                direction: SortDirection::Asc,
            })
            .await
            .unwrap();

        assert_eq!(page.pagination.total_count, expected);
        assert_eq!(page.pagination.total_pages, expected.div_ceil(5));
        assert_eq!(page.data.len(), 5);
        let spent = page.data.iter().map(|c| c.total_spent).collect::<Vec<_>>();
        let mut sorted = spent.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(spent, sorted);
    }

    #[tokio::test]
    async fn default_sort_is_newest_source_creation_first_with_nulls_last() {
        let store = MemoryStore::new();
        let mut old = record(1);
        old.created_at_source = Some(ts(2025, 5, 1));
        let mut new = record(2);
        new.created_at_source = Some(ts(2026, 2, 1));
        let mut undated = record(3);
        undated.created_at_source = None;
        for rec in [old, new, undated] {
            seed(&store, rec, EnrichmentPatch::Preserve).await;
        }

        let page = store.get_customers(&CustomerQuery::default()).await.unwrap();
        let ids = page.data.iter().map(|c| c.external_id).collect::<Vec<_>>();
        assert_eq!(ids, vec![2, 1, 3]);
    }

    #[tokio::test]
    async fn distinct_tags_are_split_trimmed_and_sorted() {
        let store = MemoryStore::new();
        let mut a = record(1);
        a.tags = TagSet::parse("vip, wholesale");
        let mut b = record(2);
        b.tags = TagSet::parse(" wholesale ,  autumn");
        seed(&store, a, EnrichmentPatch::Preserve).await;
        seed(&store, b, EnrichmentPatch::Preserve).await;

        assert_eq!(
            store.distinct_tags().await.unwrap(),
            vec!["autumn", "vip", "wholesale"]
        );
        assert_eq!(store.distinct_cities().await.unwrap(), vec!["Austin"]);
    }

    #[tokio::test]
    async fn stats_cover_whole_population() {
        let store = MemoryStore::new();
        let now = ts(2026, 3, 1);
        let mut recent = record(1);
        recent.created_at_source = Some(now - Duration::days(3));
        recent.total_spent = 100.0;
        recent.orders_count = 4;
        let mut month = record(2);
        month.created_at_source = Some(now - Duration::days(20));
        month.country = Some("Canada".into());
        month.total_spent = 50.0;
        month.orders_count = 1;
        let mut old = record(3);
        old.created_at_source = Some(now - Duration::days(90));
        old.total_spent = 0.0;
        old.orders_count = 0;

        seed(&store, recent, EnrichmentPatch::Inferred(Inference::new(Gender::Male, 0.8))).await;
        seed(&store, month, EnrichmentPatch::Preserve).await;
        seed(&store, old, EnrichmentPatch::Inferred(Inference::new(Gender::Female, 0.7))).await;

        let stats = store.get_stats(now).await.unwrap();
        assert_eq!(stats.total_customers, 3);
        assert_eq!(stats.gender_counts.male, 1);
        assert_eq!(stats.gender_counts.female, 1);
        assert_eq!(stats.gender_counts.unprocessed, 1);
        assert_eq!(stats.pending_enrichment, 1);
        assert_eq!(stats.new_last_7_days, 1);
        assert_eq!(stats.new_last_30_days, 2);
        assert_eq!(stats.top_countries[0].country, "United States");
        assert_eq!(stats.top_countries[0].count, 2);
        assert_eq!(stats.total_revenue, 150.0);
        assert_eq!(stats.total_orders, 5);
        assert_eq!(stats.average_spend, 50.0);
        assert_eq!(stats.average_order_value, 30.0);
    }

    #[tokio::test]
    async fn reset_returns_affected_count() {
        let store = MemoryStore::new();
        seed(&store, record(1), EnrichmentPatch::Inferred(Inference::new(Gender::Male, 1.0))).await;
        seed(&store, record(2), EnrichmentPatch::Preserve).await;

        assert_eq!(store.reset_all_enrichments().await.unwrap(), 2);
        let c = store.get_by_external_id(1).await.unwrap().unwrap();
        assert_eq!(c.gender_inferred, None);
        assert_eq!(c.enrichment_status, EnrichmentStatus::Pending);
        assert_eq!(store.pending_customers(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn settle_pending_skips_rows_settled_elsewhere() {
        let store = MemoryStore::new();
        seed(&store, record(1), EnrichmentPatch::Preserve).await;
        seed(&store, record(2), EnrichmentPatch::Preserve).await;
        seed(&store, record(2), EnrichmentPatch::Inferred(Inference::new(Gender::Male, 0.9))).await;

        let unusable = Enrichment::settled(Inference::unknown());
        assert!(store.settle_pending(1, unusable).await.unwrap());
        assert!(!store.settle_pending(2, unusable).await.unwrap());
        assert!(!store.settle_pending(3, unusable).await.unwrap());

        let first = store.get_by_external_id(1).await.unwrap().unwrap();
        assert_eq!(first.enrichment_status, EnrichmentStatus::Failed);
        let second = store.get_by_external_id(2).await.unwrap().unwrap();
        assert_eq!(second.enrichment_status, EnrichmentStatus::Complete);
        assert_eq!(second.gender_inferred, Some(Gender::Male));
    }

    #[tokio::test]
    async fn sync_logs_transition_once() {
        let store = MemoryStore::new();
        let log = store.create_sync_log(SyncType::Incremental, ts(2026, 1, 1)).await.unwrap();
        assert_eq!(log.status, SyncStatus::Running);
        assert!(store.latest_completed_sync().await.unwrap().is_none());

        let counters = SyncCounters {
            processed: 3,
            created: 2,
            updated: 1,
            failed: 0,
        };
        let done = store
            .update_sync_log(log.id, SyncLogUpdate::Completed(counters), ts(2026, 1, 2))
            .await
            .unwrap();
        assert_eq!(done.status, SyncStatus::Completed);
        assert_eq!(done.customers_processed, 3);

        let again = store
            .update_sync_log(
                log.id,
                SyncLogUpdate::Failed {
                    counters,
                    error_message: "late".into(),
                },
                ts(2026, 1, 3),
            )
            .await;
        assert!(matches!(again, Err(StoreError::SyncLogNotRunning(id)) if id == log.id));
        assert_eq!(
            store.latest_completed_sync().await.unwrap().unwrap().completed_at,
            Some(ts(2026, 1, 2))
        );
    }

    #[tokio::test]
    async fn export_activity_groups_by_day() {
        let store = MemoryStore::new();
        store.record_export("csv", 10).await.unwrap();
        store.record_export("csv", 5).await.unwrap();
        let days = store
            .export_activity(Utc::now() - Duration::days(1))
            .await
            .unwrap();
        assert_eq!(days.len(), 1);
        assert_eq!(days[0].exports, 2);
        assert_eq!(days[0].records, 15);
    }
}
