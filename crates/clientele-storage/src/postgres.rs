use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use clientele_core::{
    CountryCount, Customer, CustomerFilter, CustomerQuery, CustomerStats, CustomerUpsert,
    Enrichment, EnrichmentStatus, ExportActivity, ExportDay, Gender, GenderCounts, Page,
    Pagination, SyncLog, SyncLogUpdate, SyncStatus, SyncType, TagSet, TOP_COUNTRIES_LIMIT,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, info};

use crate::{collect_distinct_tags, CustomerStore, Result, StoreError, UpsertOutcome};

const CUSTOMER_COLUMNS: &str = "id, external_id, email, phone, first_name, last_name, city, \
     country, province, postal_code, tags, orders_count, total_spent, created_at_source, \
     updated_at_source, last_order_at, gender_inferred, gender_confidence, enrichment_status, \
     created_at, updated_at";

const SYNC_LOG_COLUMNS: &str = "id, sync_type, status, customers_processed, customers_created, \
     customers_updated, customers_failed, error_message, started_at, completed_at";

/// PostgreSQL-backed store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn corrupt(column: &'static str, value: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        column,
        value: value.into(),
    }
}

fn customer_from_row(row: &PgRow) -> Result<Customer> {
    let gender: Option<String> = row.try_get("gender_inferred")?;
    let gender_inferred = match gender {
        Some(raw) => Some(Gender::parse(&raw).ok_or_else(|| corrupt("gender_inferred", raw))?),
        None => None,
    };
    let status: String = row.try_get("enrichment_status")?;
    let enrichment_status =
        EnrichmentStatus::parse(&status).ok_or_else(|| corrupt("enrichment_status", status))?;
    let tags: String = row.try_get("tags")?;

    Ok(Customer {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        city: row.try_get("city")?,
        country: row.try_get("country")?,
        province: row.try_get("province")?,
        postal_code: row.try_get("postal_code")?,
        tags: TagSet::parse(&tags),
        orders_count: row.try_get("orders_count")?,
        total_spent: row.try_get("total_spent")?,
        created_at_source: row.try_get("created_at_source")?,
        updated_at_source: row.try_get("updated_at_source")?,
        last_order_at: row.try_get("last_order_at")?,
        gender_inferred,
        gender_confidence: row.try_get("gender_confidence")?,
        enrichment_status,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn sync_log_from_row(row: &PgRow) -> Result<SyncLog> {
    let sync_type: String = row.try_get("sync_type")?;
    let status: String = row.try_get("status")?;
    Ok(SyncLog {
        id: row.try_get("id")?,
        sync_type: SyncType::parse(&sync_type).ok_or_else(|| corrupt("sync_type", sync_type))?,
        status: SyncStatus::parse(&status).ok_or_else(|| corrupt("status", status))?,
        customers_processed: row.try_get("customers_processed")?,
        customers_created: row.try_get("customers_created")?,
        customers_updated: row.try_get("customers_updated")?,
        customers_failed: row.try_get("customers_failed")?,
        error_message: row.try_get("error_message")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn escape_like(needle: &str) -> String {
    needle
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Appends the WHERE clause for `filter`. Shared by the count and the page query so both see
/// the same predicate.
fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &CustomerFilter) {
    qb.push(" WHERE TRUE");
    if !filter.genders.is_empty() {
        let genders = filter
            .genders
            .iter()
            .map(|g| g.as_str().to_string())
            .collect::<Vec<_>>();
        qb.push(" AND gender_inferred = ANY(").push_bind(genders).push(")");
    }
    if let Some(from) = filter.created_from {
        qb.push(" AND created_at_source >= ").push_bind(from);
    }
    if let Some(to) = filter.created_to {
        qb.push(" AND created_at_source <= ").push_bind(to);
    }
    if let Some(from) = filter.last_order_from {
        qb.push(" AND last_order_at >= ").push_bind(from);
    }
    if let Some(to) = filter.last_order_to {
        qb.push(" AND last_order_at <= ").push_bind(to);
    }
    if !filter.cities.is_empty() {
        qb.push(" AND city = ANY(").push_bind(filter.cities.clone()).push(")");
    }
    if let Some(provinces) = filter.province_constraint() {
        qb.push(" AND province = ANY(").push_bind(provinces).push(")");
    }
    if let Some(needle) = filter.tag_needle() {
        // Per tag, so a needle never matches across the ", " separator.
        qb.push(
            " AND EXISTS (SELECT 1 FROM unnest(string_to_array(tags, ',')) AS t(tag) \
             WHERE LOWER(BTRIM(t.tag)) LIKE ",
        )
        .push_bind(format!("%{}%", escape_like(&needle)))
        .push(")");
    }
    if let Some(min) = filter.min_spent {
        qb.push(" AND total_spent >= ").push_bind(min);
    }
    if let Some(max) = filter.max_spent {
        qb.push(" AND total_spent <= ").push_bind(max);
    }
    if let Some(min) = filter.min_orders {
        qb.push(" AND orders_count >= ").push_bind(min);
    }
    if let Some(max) = filter.max_orders {
        qb.push(" AND orders_count <= ").push_bind(max);
    }
}

#[async_trait]
impl CustomerStore for PgStore {
    async fn upsert_customer(&self, upsert: CustomerUpsert) -> Result<UpsertOutcome> {
        let CustomerUpsert { record, enrichment } = upsert;
        let sql = format!(
            r#"
            INSERT INTO customers (
                external_id, email, phone, first_name, last_name, city, country, province,
                postal_code, tags, orders_count, total_spent, created_at_source,
                updated_at_source, last_order_at, gender_inferred, gender_confidence,
                enrichment_status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            ON CONFLICT (external_id) DO UPDATE SET
                email = EXCLUDED.email,
                phone = EXCLUDED.phone,
                first_name = EXCLUDED.first_name,
                last_name = EXCLUDED.last_name,
                city = EXCLUDED.city,
                country = EXCLUDED.country,
                province = EXCLUDED.province,
                postal_code = EXCLUDED.postal_code,
                tags = EXCLUDED.tags,
                orders_count = EXCLUDED.orders_count,
                total_spent = EXCLUDED.total_spent,
                created_at_source = EXCLUDED.created_at_source,
                updated_at_source = EXCLUDED.updated_at_source,
                last_order_at = EXCLUDED.last_order_at,
                gender_inferred = EXCLUDED.gender_inferred,
                gender_confidence = EXCLUDED.gender_confidence,
                enrichment_status = EXCLUDED.enrichment_status,
                updated_at = NOW()
            RETURNING {CUSTOMER_COLUMNS}, (xmax = 0) AS inserted
            "#
        );

        let row = sqlx::query(&sql)
            .bind(record.external_id)
            .bind(record.email)
            .bind(record.phone)
            .bind(record.first_name)
            .bind(record.last_name)
            .bind(record.city)
            .bind(record.country)
            .bind(record.province)
            .bind(record.postal_code)
            .bind(record.tags.to_joined())
            .bind(record.orders_count.max(0))
            .bind(record.total_spent.max(0.0))
            .bind(record.created_at_source)
            .bind(record.updated_at_source)
            .bind(record.last_order_at)
            .bind(enrichment.gender.map(Gender::as_str))
            .bind(enrichment.confidence)
            .bind(enrichment.status.as_str())
            .fetch_one(&self.pool)
            .await?;

        let created: bool = row.try_get("inserted")?;
        let customer = customer_from_row(&row)?;
        debug!(external_id = customer.external_id, created, "customer upserted");
        Ok(UpsertOutcome { customer, created })
    }

    async fn get_by_external_id(&self, external_id: i64) -> Result<Option<Customer>> {
        let sql = format!("SELECT {CUSTOMER_COLUMNS} FROM customers WHERE external_id = $1");
        let row = sqlx::query(&sql)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(customer_from_row).transpose()
    }

    async fn get_customers(&self, query: &CustomerQuery) -> Result<Page<Customer>> {
        let mut count_qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM customers");
        push_filter(&mut count_qb, &query.filter);
        let total: i64 = count_qb
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await?;

        let mut qb =
            QueryBuilder::<Postgres>::new(format!("SELECT {CUSTOMER_COLUMNS} FROM customers"));
        push_filter(&mut qb, &query.filter);
        qb.push(format!(
            " ORDER BY {} {} NULLS LAST, id ASC",
            query.sort.column(),
            query.direction.keyword()
        ));
        if let Some(size) = query.page_size {
            qb.push(" LIMIT ")
                .push_bind(i64::from(size))
                .push(" OFFSET ")
                .push_bind(query.offset() as i64);
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        let data = rows
            .iter()
            .map(customer_from_row)
            .collect::<Result<Vec<_>>>()?;
        let total_count = u64::try_from(total).unwrap_or_default();
        Ok(Page {
            data,
            pagination: Pagination::for_query(query, total_count),
        })
    }

    async fn get_stats(&self, now: DateTime<Utc>) -> Result<CustomerStats> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE gender_inferred = 'male') AS male,
                   COUNT(*) FILTER (WHERE gender_inferred = 'female') AS female,
                   COUNT(*) FILTER (WHERE gender_inferred = 'unknown') AS unknown,
                   COUNT(*) FILTER (WHERE gender_inferred IS NULL) AS unprocessed,
                   COUNT(*) FILTER (WHERE enrichment_status = 'pending') AS pending,
                   COUNT(*) FILTER (WHERE created_at_source >= $1) AS new_7,
                   COUNT(*) FILTER (WHERE created_at_source >= $2) AS new_30,
                   COALESCE(SUM(total_spent), 0)::float8 AS revenue,
                   COALESCE(SUM(orders_count), 0)::bigint AS orders
              FROM customers
            "#,
        )
        .bind(now - Duration::days(7))
        .bind(now - Duration::days(30))
        .fetch_one(&self.pool)
        .await?;

        let countries = sqlx::query(
            r#"
            SELECT country, COUNT(*) AS count
              FROM customers
             WHERE country IS NOT NULL AND country <> ''
             GROUP BY country
             ORDER BY count DESC, country ASC
             LIMIT $1
            "#,
        )
        .bind(TOP_COUNTRIES_LIMIT as i64)
        .fetch_all(&self.pool)
        .await?;

        let top_countries = countries
            .iter()
            .map(|r| -> Result<CountryCount> {
                Ok(CountryCount {
                    country: r.try_get("country")?,
                    count: r.try_get("count")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(CustomerStats {
            total_customers: row.try_get("total")?,
            gender_counts: GenderCounts {
                male: row.try_get("male")?,
                female: row.try_get("female")?,
                unknown: row.try_get("unknown")?,
                unprocessed: row.try_get("unprocessed")?,
            },
            pending_enrichment: row.try_get("pending")?,
            new_last_7_days: row.try_get("new_7")?,
            new_last_30_days: row.try_get("new_30")?,
            top_countries,
            total_revenue: row.try_get("revenue")?,
            total_orders: row.try_get("orders")?,
            ..Default::default()
        }
        .with_averages())
    }

    async fn count_customers(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM customers")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn distinct_tags(&self) -> Result<Vec<String>> {
        let raw: Vec<String> = sqlx::query_scalar("SELECT tags FROM customers WHERE tags <> ''")
            .fetch_all(&self.pool)
            .await?;
        let sets = raw.iter().map(|t| TagSet::parse(t)).collect::<Vec<_>>();
        Ok(collect_distinct_tags(&sets))
    }

    async fn distinct_cities(&self) -> Result<Vec<String>> {
        let cities = sqlx::query_scalar(
            "SELECT DISTINCT city FROM customers \
             WHERE city IS NOT NULL AND city <> '' ORDER BY city",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(cities)
    }

    async fn distinct_provinces(&self) -> Result<Vec<String>> {
        let provinces = sqlx::query_scalar(
            "SELECT DISTINCT province FROM customers \
             WHERE province IS NOT NULL AND province <> '' ORDER BY province",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(provinces)
    }

    async fn pending_customers(&self, limit: u32) -> Result<Vec<Customer>> {
        let sql = format!(
            "SELECT {CUSTOMER_COLUMNS} FROM customers \
             WHERE enrichment_status = 'pending' ORDER BY id LIMIT $1"
        );
        let rows = sqlx::query(&sql)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(customer_from_row).collect()
    }

    async fn set_enrichment(&self, external_id: i64, enrichment: Enrichment) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE customers
               SET gender_inferred = $2,
                   gender_confidence = $3,
                   enrichment_status = $4,
                   updated_at = NOW()
             WHERE external_id = $1
            "#,
        )
        .bind(external_id)
        .bind(enrichment.gender.map(Gender::as_str))
        .bind(enrichment.confidence)
        .bind(enrichment.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn settle_pending(&self, external_id: i64, enrichment: Enrichment) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE customers
               SET gender_inferred = $2,
                   gender_confidence = $3,
                   enrichment_status = $4,
                   updated_at = NOW()
             WHERE external_id = $1
               AND enrichment_status = 'pending'
            "#,
        )
        .bind(external_id)
        .bind(enrichment.gender.map(Gender::as_str))
        .bind(enrichment.confidence)
        .bind(enrichment.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_tags(&self, external_id: i64, tags: &TagSet) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE customers SET tags = $2, updated_at = NOW() WHERE external_id = $1",
        )
        .bind(external_id)
        .bind(tags.to_joined())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn reset_all_enrichments(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE customers
               SET gender_inferred = NULL,
                   gender_confidence = NULL,
                   enrichment_status = 'pending',
                   updated_at = NOW()
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn latest_customer_update(&self) -> Result<Option<DateTime<Utc>>> {
        let latest = sqlx::query_scalar("SELECT MAX(updated_at_source) FROM customers")
            .fetch_one(&self.pool)
            .await?;
        Ok(latest)
    }

    async fn create_sync_log(
        &self,
        sync_type: SyncType,
        started_at: DateTime<Utc>,
    ) -> Result<SyncLog> {
        let sql = format!(
            "INSERT INTO sync_logs (sync_type, status, started_at) \
             VALUES ($1, 'running', $2) RETURNING {SYNC_LOG_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(sync_type.as_str())
            .bind(started_at)
            .fetch_one(&self.pool)
            .await?;
        sync_log_from_row(&row)
    }

    async fn update_sync_log(
        &self,
        id: i64,
        update: SyncLogUpdate,
        completed_at: DateTime<Utc>,
    ) -> Result<SyncLog> {
        let (status, counters, error_message) = match update {
            SyncLogUpdate::Completed(counters) => (SyncStatus::Completed, counters, None),
            SyncLogUpdate::Failed {
                counters,
                error_message,
            } => (SyncStatus::Failed, counters, Some(error_message)),
        };
        let sql = format!(
            r#"
            UPDATE sync_logs
               SET status = $2,
                   customers_processed = $3,
                   customers_created = $4,
                   customers_updated = $5,
                   customers_failed = $6,
                   error_message = $7,
                   completed_at = $8
             WHERE id = $1 AND status = 'running'
            RETURNING {SYNC_LOG_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(status.as_str())
            .bind(counters.processed)
            .bind(counters.created)
            .bind(counters.updated)
            .bind(counters.failed)
            .bind(error_message)
            .bind(completed_at)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => sync_log_from_row(&row),
            None => Err(StoreError::SyncLogNotRunning(id)),
        }
    }

    async fn get_latest_sync_log(&self) -> Result<Option<SyncLog>> {
        let sql = format!(
            "SELECT {SYNC_LOG_COLUMNS} FROM sync_logs ORDER BY started_at DESC, id DESC LIMIT 1"
        );
        let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
        row.as_ref().map(sync_log_from_row).transpose()
    }

    async fn latest_completed_sync(&self) -> Result<Option<SyncLog>> {
        let sql = format!(
            r#"
            SELECT {SYNC_LOG_COLUMNS}
              FROM sync_logs
             WHERE status = 'completed' AND completed_at IS NOT NULL
             ORDER BY completed_at DESC
             LIMIT 1
            "#
        );
        let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
        row.as_ref().map(sync_log_from_row).transpose()
    }

    async fn record_export(&self, format: &str, record_count: i64) -> Result<ExportActivity> {
        let row = sqlx::query(
            r#"
            INSERT INTO export_activity (format, record_count)
            VALUES ($1, $2)
            RETURNING id, format, record_count, created_at
            "#,
        )
        .bind(format)
        .bind(record_count)
        .fetch_one(&self.pool)
        .await?;
        Ok(ExportActivity {
            id: row.try_get("id")?,
            format: row.try_get("format")?,
            record_count: row.try_get("record_count")?,
            created_at: row.try_get("created_at")?,
        })
    }

    async fn export_activity(&self, since: DateTime<Utc>) -> Result<Vec<ExportDay>> {
        let rows = sqlx::query(
            r#"
            SELECT (created_at AT TIME ZONE 'UTC')::date AS day,
                   COUNT(*) AS exports,
                   COALESCE(SUM(record_count), 0)::bigint AS records
              FROM export_activity
             WHERE created_at >= $1
             GROUP BY 1
             ORDER BY 1
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| -> Result<ExportDay> {
                let day: NaiveDate = r.try_get("day")?;
                Ok(ExportDay {
                    day,
                    exports: r.try_get("exports")?,
                    records: r.try_get("records")?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn built_sql(filter: &CustomerFilter) -> String {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM customers");
        push_filter(&mut qb, filter);
        qb.sql().to_string()
    }

    #[test]
    fn empty_filter_adds_no_predicates() {
        assert_eq!(
            built_sql(&CustomerFilter::default()),
            "SELECT COUNT(*) FROM customers WHERE TRUE"
        );
    }

    #[test]
    fn filter_predicates_are_bound_not_interpolated() {
        let filter = CustomerFilter {
            genders: vec![Gender::Male],
            region: Some("West".into()),
            tag: Some("50%_off".into()),
            min_orders: Some(2),
            ..Default::default()
        };
        let sql = built_sql(&filter);
        assert!(sql.contains("gender_inferred = ANY($1)"));
        assert!(sql.contains("province = ANY($2)"));
        assert!(sql.contains("LOWER(tags) LIKE $3"));
        assert!(sql.contains("orders_count >= $4"));
        assert!(!sql.contains("50%"));
    }

    #[test]
    fn unknown_region_contributes_nothing() {
        let filter = CustomerFilter {
            region: Some("Atlantis".into()),
            ..Default::default()
        };
        assert!(!built_sql(&filter).contains("province"));
    }

    #[test]
    fn like_metacharacters_are_escaped() {
        assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
    }
}
