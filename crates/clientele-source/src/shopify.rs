use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use clientele_core::{Gender, TagSet};
use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};
use reqwest::{Method, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info_span, warn, Instrument};

use crate::{
    classify_reqwest_error, CustomerPage, CustomerSource, RetryDisposition, RetryPolicy,
    SourceError, WireCustomer, METAFIELD_KEY, METAFIELD_NAMESPACE,
};

const ACCESS_TOKEN_HEADER: &str = "x-shopify-access-token";
const CALL_LIMIT_HEADER: &str = "x-shopify-shop-api-call-limit";

#[derive(Debug, Clone)]
pub struct ShopifyConfig {
    /// `my-shop.myshopify.com`, or a full `http(s)://` base URL.
    pub store_domain: String,
    pub access_token: String,
    pub api_version: String,
    pub page_size: usize,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    /// Used when a 429 carries no usable `Retry-After`.
    pub default_retry_after: Duration,
    /// Remaining-call margin at which requests are delayed up front.
    pub safety_margin: u32,
    pub throttle_delay: Duration,
    pub pacing_delay: Duration,
    pub near_limit_pacing_delay: Duration,
}

impl ShopifyConfig {
    pub fn new(store_domain: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            store_domain: store_domain.into(),
            access_token: access_token.into(),
            api_version: "2024-01".to_string(),
            page_size: 250,
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            default_retry_after: Duration::from_secs(5),
            safety_margin: 5,
            throttle_delay: Duration::from_secs(2),
            pacing_delay: Duration::from_millis(500),
            near_limit_pacing_delay: Duration::from_secs(2),
        }
    }

    fn api_base(&self) -> Result<Url, SourceError> {
        let domain = self.store_domain.trim().trim_end_matches('/');
        if domain.is_empty() {
            return Err(SourceError::Config("store domain is empty".into()));
        }
        let origin = if domain.starts_with("http://") || domain.starts_with("https://") {
            domain.to_string()
        } else {
            format!("https://{domain}")
        };
        Url::parse(&format!("{origin}/admin/api/{}/", self.api_version))
            .map_err(|e| SourceError::Config(format!("invalid store domain {domain:?}: {e}")))
    }
}

/// Parsed `"<current>/<max>"` call budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallLimit {
    pub current: u32,
    pub max: u32,
}

impl CallLimit {
    pub fn parse(raw: &str) -> Option<Self> {
        let (current, max) = raw.trim().split_once('/')?;
        Some(Self {
            current: current.trim().parse().ok()?,
            max: max.trim().parse().ok()?,
        })
    }

    pub fn remaining(&self) -> u32 {
        self.max.saturating_sub(self.current)
    }
}

/// Latest call budget reported by the platform. `max == 0` means nothing observed yet.
#[derive(Debug, Default)]
pub struct RateLimitTracker {
    current: AtomicU32,
    max: AtomicU32,
}

impl RateLimitTracker {
    pub fn observe(&self, headers: &HeaderMap) {
        if let Some(limit) = headers
            .get(CALL_LIMIT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(CallLimit::parse)
        {
            self.current.store(limit.current, Ordering::Relaxed);
            self.max.store(limit.max, Ordering::Relaxed);
        }
    }

    pub fn latest(&self) -> Option<CallLimit> {
        let max = self.max.load(Ordering::Relaxed);
        (max > 0).then(|| CallLimit {
            current: self.current.load(Ordering::Relaxed),
            max,
        })
    }

    pub fn near_limit(&self, margin: u32) -> bool {
        self.latest().is_some_and(|l| l.remaining() <= margin)
    }
}

/// Extracts the `page_info` cursor of the `rel="next"` entry of a `Link` header.
pub fn parse_next_cursor(link: &str) -> Option<String> {
    link.split(',').find_map(|entry| {
        let mut parts = entry.split(';');
        let target = parts.next()?.trim();
        let is_next = parts.any(|p| {
            let p = p.trim();
            p == "rel=\"next\"" || p == "rel=next"
        });
        if !is_next {
            return None;
        }
        let url = Url::parse(target.trim_start_matches('<').trim_end_matches('>')).ok()?;
        url.query_pairs()
            .find(|(k, _)| k == "page_info")
            .map(|(_, v)| v.into_owned())
    })
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let secs = headers.get(RETRY_AFTER)?.to_str().ok()?.trim().parse::<f64>().ok()?;
    (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs))
}

#[derive(Debug, Deserialize)]
struct CustomersEnvelope {
    #[serde(default)]
    customers: Vec<WireCustomer>,
}

/// Shopify Admin REST client for customers.
#[derive(Debug)]
pub struct ShopifyClient {
    client: reqwest::Client,
    base: Url,
    config: ShopifyConfig,
    limits: RateLimitTracker,
}

impl ShopifyClient {
    pub fn new(config: ShopifyConfig) -> Result<Self, SourceError> {
        let base = config.api_base()?;
        let mut headers = HeaderMap::new();
        let token = HeaderValue::from_str(&config.access_token)
            .map_err(|_| SourceError::Config("access token is not a valid header value".into()))?;
        headers.insert(ACCESS_TOKEN_HEADER, token);

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base,
            config,
            limits: RateLimitTracker::default(),
        })
    }

    pub fn rate_limits(&self) -> &RateLimitTracker {
        &self.limits
    }

    fn endpoint(&self, path: &str) -> Result<Url, SourceError> {
        self.base
            .join(path)
            .map_err(|e| SourceError::Config(format!("bad endpoint {path}: {e}")))
    }

    /// Sends one logical request, absorbing 429s and transient transport failures up to the
    /// retry budget. Any other non-success status is returned as an error.
    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<serde_json::Value>,
    ) -> Result<Response, SourceError> {
        let span = info_span!("shopify_request", %method, path = url.path());
        async {
            let max_attempts = self.config.retry.max_attempts.max(1);
            let mut attempt = 0u32;
            loop {
                if self.limits.near_limit(self.config.safety_margin) {
                    let delay_ms = self.config.throttle_delay.as_millis() as u64;
                    debug!(delay_ms, "near call limit; throttling");
                    tokio::time::sleep(self.config.throttle_delay).await;
                }

                let mut request = self.client.request(method.clone(), url.clone());
                if let Some(body) = &body {
                    request = request.json(body);
                }
                let attempt_index = attempt;
                attempt += 1;

                match request.send().await {
                    Ok(resp) => {
                        self.limits.observe(resp.headers());
                        let status = resp.status();
                        if status.is_success() {
                            return Ok(resp);
                        }
                        if status == StatusCode::TOO_MANY_REQUESTS {
                            if attempt >= max_attempts {
                                return Err(SourceError::RateLimitExceeded { attempts: attempt });
                            }
                            let hint = retry_after(resp.headers())
                                .unwrap_or(self.config.default_retry_after);
                            let wait = self.config.retry.rate_limit_delay(attempt_index, hint);
                            let wait_ms = wait.as_millis() as u64;
                            warn!(attempt, wait_ms, "rate limited; retrying");
                            tokio::time::sleep(wait).await;
                            continue;
                        }
                        return Err(SourceError::HttpStatus {
                            status: status.as_u16(),
                            url: resp.url().to_string(),
                        });
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < max_attempts
                        {
                            let wait = self.config.retry.delay_for_attempt(attempt_index);
                            warn!(attempt, error = %err, "transient request failure; retrying");
                            tokio::time::sleep(wait).await;
                            continue;
                        }
                        return Err(SourceError::Request(err));
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl CustomerSource for ShopifyClient {
    fn page_size(&self) -> usize {
        self.config.page_size
    }

    fn pacing_delay(&self) -> Duration {
        if self.limits.near_limit(self.config.safety_margin) {
            self.config.near_limit_pacing_delay
        } else {
            self.config.pacing_delay
        }
    }

    async fn fetch_page(
        &self,
        cursor: Option<&str>,
        updated_since: Option<DateTime<Utc>>,
    ) -> Result<CustomerPage, SourceError> {
        let mut url = self.endpoint("customers.json")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", &self.config.page_size.to_string());
            // The platform rejects filters alongside a page cursor.
            match (cursor, updated_since) {
                (Some(cursor), _) => {
                    query.append_pair("page_info", cursor);
                }
                (None, Some(since)) => {
                    query.append_pair(
                        "updated_at_min",
                        &since.to_rfc3339_opts(SecondsFormat::Secs, true),
                    );
                }
                (None, None) => {}
            }
        }

        let resp = self.send(Method::GET, url, None).await?;
        let next_cursor = resp
            .headers()
            .get(reqwest::header::LINK)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_next_cursor);
        let envelope: CustomersEnvelope = resp
            .json()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))?;

        Ok(CustomerPage {
            records: envelope
                .customers
                .into_iter()
                .map(WireCustomer::normalize)
                .collect(),
            next_cursor,
        })
    }

    async fn update_tags(&self, external_id: i64, tags: &TagSet) -> Result<(), SourceError> {
        let url = self.endpoint(&format!("customers/{external_id}.json"))?;
        let body = json!({ "customer": { "id": external_id, "tags": tags.to_joined() } });
        self.send(Method::PUT, url, Some(body)).await?;
        Ok(())
    }

    async fn set_gender_metafield(
        &self,
        external_id: i64,
        gender: Gender,
    ) -> Result<(), SourceError> {
        let url = self.endpoint(&format!("customers/{external_id}/metafields.json"))?;
        let body = json!({
            "metafield": {
                "namespace": METAFIELD_NAMESPACE,
                "key": METAFIELD_KEY,
                "value": gender.as_str(),
                "type": "single_line_text_field",
            }
        });
        self.send(Method::POST, url, Some(body)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Mutex};

    use axum::extract::{Path, Query, State};
    use axum::http::{HeaderMap as AxumHeaders, StatusCode as AxumStatus};
    use axum::response::{IntoResponse, Response as AxumResponse};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::Value;

    use crate::fetch_all;

    #[derive(Default)]
    struct FakeShop {
        hits: AtomicUsize,
        queries: Mutex<Vec<HashMap<String, String>>>,
        bodies: Mutex<Vec<(String, Value)>>,
        tokens: Mutex<Vec<String>>,
        throttle_first: usize,
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn fast_config(base: &str) -> ShopifyConfig {
        ShopifyConfig {
            page_size: 2,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
            },
            default_retry_after: Duration::ZERO,
            throttle_delay: Duration::ZERO,
            pacing_delay: Duration::ZERO,
            near_limit_pacing_delay: Duration::ZERO,
            ..ShopifyConfig::new(base, "shpat_test")
        }
    }

    fn customer(id: i64) -> Value {
        json!({
            "id": id,
            "email": format!("c{id}@example.com"),
            "first_name": "Sam",
            "total_spent": "10.00",
            "orders_count": 1,
            "updated_at": "2024-03-01T12:00:00Z",
            "default_address": { "province": "Texas", "country": "United States" }
        })
    }

    async fn list_customers(
        State(shop): State<Arc<FakeShop>>,
        Query(params): Query<HashMap<String, String>>,
        headers: AxumHeaders,
    ) -> AxumResponse {
        let hit = shop.hits.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if let Some(token) = headers.get(ACCESS_TOKEN_HEADER).and_then(|v| v.to_str().ok()) {
            shop.tokens.lock().unwrap().push(token.to_string());
        }
        if hit < shop.throttle_first {
            return (AxumStatus::TOO_MANY_REQUESTS, [("retry-after", "0")], "slow down")
                .into_response();
        }
        shop.queries.lock().unwrap().push(params.clone());

        match params.get("page_info").map(String::as_str) {
            None => {
                let host = headers
                    .get("host")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("localhost")
                    .to_string();
                let link = format!(
                    "<http://{host}/admin/api/2024-01/customers.json?limit=2&page_info=p2>; \
                     rel=\"next\""
                );
                (
                    [
                        ("link", link),
                        (CALL_LIMIT_HEADER, "1/40".to_string()),
                    ],
                    Json(json!({ "customers": [customer(1), customer(2)] })),
                )
                    .into_response()
            }
            Some("p2") => (
                [(CALL_LIMIT_HEADER, "2/40")],
                Json(json!({ "customers": [customer(3)] })),
            )
                .into_response(),
            Some(_) => AxumStatus::BAD_REQUEST.into_response(),
        }
    }

    async fn write_customer(
        State(shop): State<Arc<FakeShop>>,
        Path(rest): Path<String>,
        Json(body): Json<Value>,
    ) -> AxumResponse {
        shop.bodies.lock().unwrap().push((rest, body.clone()));
        Json(body).into_response()
    }

    fn router(shop: Arc<FakeShop>) -> Router {
        Router::new()
            .route("/admin/api/2024-01/customers.json", get(list_customers))
            .route(
                "/admin/api/2024-01/customers/{*rest}",
                post(write_customer).put(write_customer),
            )
            .with_state(shop)
    }

    #[test]
    fn next_cursor_comes_from_link_header() {
        let base = "https://shop.myshopify.com/admin/api/2024-01/customers.json?limit=250";
        let link = format!(
            "<{base}&page_info=abc>; rel=\"previous\", <{base}&page_info=def>; rel=\"next\""
        );
        let link = link.as_str();
        assert_eq!(parse_next_cursor(link).as_deref(), Some("def"));
        assert_eq!(
            parse_next_cursor("<https://x.test/c.json?page_info=abc>; rel=\"previous\""),
            None
        );
        assert_eq!(parse_next_cursor(""), None);
    }

    #[test]
    fn call_limit_tracks_remaining_budget() {
        assert_eq!(CallLimit::parse("39/40").map(|l| l.remaining()), Some(1));
        assert_eq!(CallLimit::parse("garbage"), None);

        let tracker = RateLimitTracker::default();
        assert!(!tracker.near_limit(5));
        let mut headers = HeaderMap::new();
        headers.insert(CALL_LIMIT_HEADER, HeaderValue::from_static("36/40"));
        tracker.observe(&headers);
        assert!(tracker.near_limit(5));
        headers.insert(CALL_LIMIT_HEADER, HeaderValue::from_static("10/40"));
        tracker.observe(&headers);
        assert!(!tracker.near_limit(5));
    }

    #[test]
    fn api_base_accepts_bare_domains() {
        let base = ShopifyConfig::new("acme.myshopify.com", "t").api_base().unwrap();
        assert_eq!(base.as_str(), "https://acme.myshopify.com/admin/api/2024-01/");
        assert!(ShopifyConfig::new("  ", "t").api_base().is_err());
    }

    #[tokio::test]
    async fn paginates_with_link_cursor() {
        let shop = Arc::new(FakeShop::default());
        let base = serve(router(shop.clone())).await;
        let client = ShopifyClient::new(fast_config(&base)).unwrap();
        let since = DateTime::parse_from_rfc3339("2024-02-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let mut ids = Vec::new();
        let total = fetch_all(&client, Some(since), |batch| {
            ids.extend(batch.iter().map(|r| r.external_id));
            async { Ok::<_, SourceError>(()) }
        })
        .await
        .unwrap();

        assert_eq!(total, 3);
        assert_eq!(ids, vec![1, 2, 3]);
        let queries = shop.queries.lock().unwrap().clone();
        assert_eq!(
            queries[0].get("updated_at_min").map(String::as_str),
            Some("2024-02-01T00:00:00Z")
        );
        assert_eq!(queries[1].get("page_info").map(String::as_str), Some("p2"));
        assert!(!queries[1].contains_key("updated_at_min"));
        assert!(shop.tokens.lock().unwrap().iter().all(|t| t == "shpat_test"));
        assert_eq!(client.rate_limits().latest(), Some(CallLimit { current: 2, max: 40 }));
    }

    #[tokio::test]
    async fn retries_after_rate_limit() {
        let shop = Arc::new(FakeShop {
            throttle_first: 2,
            ..Default::default()
        });
        let base = serve(router(shop.clone())).await;
        let client = ShopifyClient::new(fast_config(&base)).unwrap();

        let page = client.fetch_page(None, None).await.unwrap();
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.next_cursor.as_deref(), Some("p2"));
        assert_eq!(shop.hits.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn persistent_rate_limit_is_bounded() {
        let shop = Arc::new(FakeShop {
            throttle_first: usize::MAX,
            ..Default::default()
        });
        let base = serve(router(shop.clone())).await;
        let client = ShopifyClient::new(fast_config(&base)).unwrap();

        let err = client.fetch_page(None, None).await.unwrap_err();
        assert!(matches!(err, SourceError::RateLimitExceeded { attempts: 3 }));
        assert_eq!(shop.hits.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn other_error_statuses_are_fatal() {
        let shop = Arc::new(FakeShop::default());
        let base = serve(router(shop.clone())).await;
        let client = ShopifyClient::new(fast_config(&base)).unwrap();

        let err = client.fetch_page(Some("bogus"), None).await.unwrap_err();
        assert!(matches!(err, SourceError::HttpStatus { status: 400, .. }));
        assert_eq!(shop.hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn writes_tags_and_metafield() {
        let shop = Arc::new(FakeShop::default());
        let base = serve(router(shop.clone())).await;
        let client = ShopifyClient::new(fast_config(&base)).unwrap();

        client
            .update_tags(42, &TagSet::parse("vip, gender:female"))
            .await
            .unwrap();
        client.set_gender_metafield(42, Gender::Female).await.unwrap();

        let bodies = shop.bodies.lock().unwrap().clone();
        assert_eq!(bodies[0].0, "42.json");
        assert_eq!(bodies[0].1["customer"]["tags"], "vip, gender:female");
        assert_eq!(bodies[1].0, "42/metafields.json");
        assert_eq!(bodies[1].1["metafield"]["namespace"], "marketing");
        assert_eq!(bodies[1].1["metafield"]["key"], "inferred_gender");
        assert_eq!(bodies[1].1["metafield"]["value"], "female");
    }
}
