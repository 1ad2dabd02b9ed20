//! Source platform contracts: paginated customer pulls, write-back calls, retry policy and the
//! wire-to-domain normalization shared by the HTTP client, fixtures and webhooks.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clientele_core::{CustomerRecord, Gender, TagSet};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod fixture;
mod shopify;

pub use fixture::{FixtureRequest, FixtureSource, SourceWrite};
pub use shopify::{parse_next_cursor, CallLimit, RateLimitTracker, ShopifyClient, ShopifyConfig};

pub const CRATE_NAME: &str = "clientele-source";

pub const METAFIELD_NAMESPACE: &str = "marketing";
pub const METAFIELD_KEY: &str = "inferred_gender";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("rate limit exceeded after {attempts} attempts")]
    RateLimitExceeded { attempts: u32 },
    #[error("malformed response: {0}")]
    Decode(String),
    #[error("invalid source configuration: {0}")]
    Config(String),
    #[error("fixture error: {0}")]
    Fixture(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Bounded retry for rate-limit rejections and transient transport failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first request.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Wait before retrying a 429: the server's hint, never shorter than our own backoff.
    pub fn rate_limit_delay(&self, attempt_index: u32, retry_after: Duration) -> Duration {
        retry_after.max(self.delay_for_attempt(attempt_index))
    }
}

/// One page of normalized customers plus the opaque cursor for the next one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CustomerPage {
    pub records: Vec<CustomerRecord>,
    pub next_cursor: Option<String>,
}

#[async_trait]
pub trait CustomerSource: Send + Sync {
    /// Requested page size; a shorter page ends pagination.
    fn page_size(&self) -> usize;

    /// Delay applied between consecutive pages of a bulk pull.
    fn pacing_delay(&self) -> Duration {
        Duration::ZERO
    }

    async fn fetch_page(
        &self,
        cursor: Option<&str>,
        updated_since: Option<DateTime<Utc>>,
    ) -> Result<CustomerPage, SourceError>;

    async fn update_tags(&self, external_id: i64, tags: &TagSet) -> Result<(), SourceError>;

    async fn set_gender_metafield(
        &self,
        external_id: i64,
        gender: Gender,
    ) -> Result<(), SourceError>;
}

/// Pull-based pagination over a [`CustomerSource`].
pub struct Paginator<'a, S: ?Sized> {
    source: &'a S,
    updated_since: Option<DateTime<Utc>>,
    cursor: Option<String>,
    pages: usize,
    done: bool,
}

impl<'a, S: CustomerSource + ?Sized> Paginator<'a, S> {
    pub fn new(source: &'a S, updated_since: Option<DateTime<Utc>>) -> Self {
        Self {
            source,
            updated_since,
            cursor: None,
            pages: 0,
            done: false,
        }
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages
    }

    /// Next non-empty batch, or `None` once the source is exhausted.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<CustomerRecord>>, SourceError> {
        if self.done {
            return Ok(None);
        }
        if self.pages > 0 {
            let pacing = self.source.pacing_delay();
            if !pacing.is_zero() {
                tokio::time::sleep(pacing).await;
            }
        }

        let page = self
            .source
            .fetch_page(self.cursor.as_deref(), self.updated_since)
            .await?;
        self.pages += 1;

        let short = page.records.len() < self.source.page_size();
        match page.next_cursor {
            Some(cursor) if !short => self.cursor = Some(cursor),
            _ => self.done = true,
        }

        if page.records.is_empty() {
            self.done = true;
            return Ok(None);
        }
        Ok(Some(page.records))
    }
}

/// Drives pagination to exhaustion, handing every batch to `on_batch` in source order.
/// Returns the number of records observed.
pub async fn fetch_all<S, F, Fut, E>(
    source: &S,
    updated_since: Option<DateTime<Utc>>,
    mut on_batch: F,
) -> Result<usize, E>
where
    S: CustomerSource + ?Sized,
    F: FnMut(Vec<CustomerRecord>) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: From<SourceError>,
{
    let mut paginator = Paginator::new(source, updated_since);
    let mut total = 0usize;
    while let Some(batch) = paginator.next_batch().await? {
        total += batch.len();
        on_batch(batch).await?;
    }
    Ok(total)
}

/// Customer object as the platform serializes it (REST list, webhooks, fixture files).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireCustomer {
    pub id: i64,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub tags: Option<String>,
    #[serde(default)]
    pub orders_count: Option<i64>,
    #[serde(default)]
    pub total_spent: Option<WireMoney>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_order_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub default_address: Option<WireAddress>,
}

/// Money arrives as a decimal string, occasionally as a bare number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireMoney {
    Text(String),
    Number(f64),
}

impl WireMoney {
    pub fn amount(&self) -> f64 {
        let value = match self {
            WireMoney::Text(text) => text.trim().parse::<f64>().unwrap_or(0.0),
            WireMoney::Number(n) => *n,
        };
        if value.is_finite() && value > 0.0 {
            value
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireAddress {
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub province: Option<String>,
    #[serde(default)]
    pub province_code: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub country_code: Option<String>,
    #[serde(default)]
    pub zip: Option<String>,
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl WireCustomer {
    /// Flattens the default address, parses money and drops blank strings.
    pub fn normalize(self) -> CustomerRecord {
        let address = self.default_address.unwrap_or_default();
        CustomerRecord {
            external_id: self.id,
            email: clean(self.email),
            phone: clean(self.phone),
            first_name: clean(self.first_name),
            last_name: clean(self.last_name),
            city: clean(address.city),
            country: clean(address.country).or_else(|| clean(address.country_code)),
            province: clean(address.province).or_else(|| clean(address.province_code)),
            postal_code: clean(address.zip),
            tags: TagSet::parse(self.tags.as_deref().unwrap_or_default()),
            orders_count: self
                .orders_count
                .map(|n| i32::try_from(n.max(0)).unwrap_or(i32::MAX))
                .unwrap_or(0),
            total_spent: self.total_spent.as_ref().map_or(0.0, WireMoney::amount),
            created_at_source: self.created_at,
            updated_at_source: self.updated_at,
            last_order_at: self.last_order_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn retry_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn rate_limit_delay_honours_server_hint() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        };
        assert_eq!(
            policy.rate_limit_delay(0, Duration::from_secs(5)),
            Duration::from_secs(5)
        );
        assert_eq!(
            policy.rate_limit_delay(3, Duration::ZERO),
            Duration::from_millis(800)
        );
    }

    #[test]
    fn wire_customer_is_flattened() {
        let wire: WireCustomer = serde_json::from_value(json!({
            "id": 7_001,
            "email": "ada@example.com",
            "first_name": " Ada ",
            "last_name": "",
            "tags": "vip,  gender:female , vip",
            "orders_count": 3,
            "total_spent": "199.90",
            "created_at": "2024-01-15T10:30:00-05:00",
            "updated_at": "2024-02-01T00:00:00Z",
            "default_address": {
                "city": "Atlanta",
                "province": null,
                "province_code": "GA",
                "country": "United States",
                "zip": "30301"
            }
        }))
        .unwrap();

        let record = wire.normalize();
        assert_eq!(record.external_id, 7_001);
        assert_eq!(record.first_name.as_deref(), Some("Ada"));
        assert_eq!(record.last_name, None);
        assert_eq!(record.province.as_deref(), Some("GA"));
        assert_eq!(record.postal_code.as_deref(), Some("30301"));
        assert_eq!(record.total_spent, 199.9);
        assert_eq!(record.orders_count, 3);
        assert_eq!(record.tags.to_joined(), "vip, gender:female");
        assert_eq!(
            record.created_at_source.map(|t| t.to_rfc3339()),
            Some("2024-01-15T15:30:00+00:00".to_string())
        );
    }

    #[test]
    fn bad_money_becomes_zero() {
        assert_eq!(WireMoney::Text("n/a".into()).amount(), 0.0);
        assert_eq!(WireMoney::Number(-4.0).amount(), 0.0);
        assert_eq!(WireMoney::Number(12.5).amount(), 12.5);
    }

    #[tokio::test]
    async fn fetch_all_stops_on_short_page() {
        let records = (1..=540)
            .map(|id| CustomerRecord {
                external_id: id,
                ..Default::default()
            })
            .collect::<Vec<_>>();
        let source = FixtureSource::from_records(records, 250);

        let mut sizes = Vec::new();
        let total = fetch_all(&source, None, |batch| {
            sizes.push(batch.len());
            async { Ok::<_, SourceError>(()) }
        })
        .await
        .unwrap();

        assert_eq!(sizes, vec![250, 250, 40]);
        assert_eq!(total, 540);
        assert_eq!(source.requests().await.len(), 3);
    }

    #[tokio::test]
    async fn fetch_all_stops_without_cursor_on_full_page() {
        let records = (1..=500)
            .map(|id| CustomerRecord {
                external_id: id,
                ..Default::default()
            })
            .collect::<Vec<_>>();
        let source = FixtureSource::from_records(records, 250);

        let mut seen = 0;
        let total = fetch_all(&source, None, |batch| {
            seen += batch.len();
            async { Ok::<_, SourceError>(()) }
        })
        .await
        .unwrap();

        assert_eq!(total, 500);
        assert_eq!(seen, 500);
        assert_eq!(source.requests().await.len(), 2);
    }

    #[tokio::test]
    async fn batch_errors_stop_iteration() {
        let records = (1..=10)
            .map(|id| CustomerRecord {
                external_id: id,
                ..Default::default()
            })
            .collect::<Vec<_>>();
        let source = FixtureSource::from_records(records, 5);

        let result = fetch_all(&source, None, |_batch| async {
            Err::<(), _>(SourceError::Decode("stop".into()))
        })
        .await;

        assert!(matches!(result, Err(SourceError::Decode(_))));
        assert_eq!(source.requests().await.len(), 1);
    }
}
