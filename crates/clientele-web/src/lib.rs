//! JSON API over the customer store, sync controls, CSV export and platform webhooks.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use clientele_core::{
    region_names, Customer, CustomerFilter, CustomerQuery, FilterOptions, Gender, SortColumn,
    SortDirection, SyncType, DEFAULT_PAGE_SIZE,
};
use clientele_source::WireCustomer;
use clientele_storage::CustomerStore;
use clientele_sync::{SyncError, SyncPipeline, SyncRequest};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "clientele-web";

pub const HMAC_HEADER: &str = "x-shopify-hmac-sha256";

const MAX_PAGE_SIZE: u32 = 500;
const DEFAULT_ACTIVITY_DAYS: i64 = 365;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn CustomerStore>,
    pub pipeline: Arc<SyncPipeline>,
    pub webhook_secret: Option<String>,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>) -> Self {
        Self {
            store: Arc::clone(pipeline.store()),
            webhook_secret: pipeline.config().webhook_secret.clone(),
            pipeline,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/customers", get(customers_handler))
        .route("/api/customers/export", get(export_handler))
        .route("/api/customers/filters", get(filters_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/sync", post(sync_trigger_handler))
        .route("/api/sync/status", get(sync_status_handler))
        .route("/api/enrich", post(enrich_handler))
        .route("/api/enrich/reset", post(enrich_reset_handler))
        .route("/api/export/activity", get(export_activity_handler))
        .route("/webhooks/customers/create", post(webhook_handler))
        .route("/webhooks/customers/update", post(webhook_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(pipeline: Arc<SyncPipeline>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(AppState::new(pipeline))).await?;
    Ok(())
}

/// Raw list/export parameters. Multi-valued fields are comma separated.
#[derive(Debug, Default, Deserialize)]
pub struct CustomerParams {
    pub gender: Option<String>,
    pub created_from: Option<String>,
    pub created_to: Option<String>,
    pub last_order_from: Option<String>,
    pub last_order_to: Option<String>,
    pub city: Option<String>,
    pub province: Option<String>,
    pub region: Option<String>,
    pub tag: Option<String>,
    pub min_spent: Option<f64>,
    pub max_spent: Option<f64>,
    pub min_orders: Option<i32>,
    pub max_orders: Option<i32>,
    pub sort: Option<String>,
    pub direction: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

impl CustomerParams {
    pub fn to_filter(&self) -> Result<CustomerFilter, String> {
        let genders = split_list(self.gender.as_deref())
            .into_iter()
            .map(|g| {
                Gender::parse(&g.to_ascii_lowercase())
                    .ok_or_else(|| format!("unknown gender {g:?}"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(CustomerFilter {
            genders,
            created_from: parse_bound("created_from", self.created_from.as_deref(), false)?,
            created_to: parse_bound("created_to", self.created_to.as_deref(), true)?,
            last_order_from: parse_bound(
                "last_order_from",
                self.last_order_from.as_deref(),
                false,
            )?,
            last_order_to: parse_bound("last_order_to", self.last_order_to.as_deref(), true)?,
            cities: split_list(self.city.as_deref()),
            provinces: split_list(self.province.as_deref()),
            region: self.region.clone().filter(|r| !r.trim().is_empty()),
            tag: self.tag.clone().filter(|t| !t.trim().is_empty()),
            min_spent: self.min_spent,
            max_spent: self.max_spent,
            min_orders: self.min_orders,
            max_orders: self.max_orders,
        })
    }

    pub fn to_query(&self) -> Result<CustomerQuery, String> {
        let sort = match self.sort.as_deref() {
            Some(raw) => {
                SortColumn::parse(raw).ok_or_else(|| format!("unknown sort column {raw:?}"))?
            }
            None => SortColumn::default(),
        };
        let direction = match self.direction.as_deref() {
            Some(raw) => {
                SortDirection::parse(raw).ok_or_else(|| format!("unknown direction {raw:?}"))?
            }
            None => SortDirection::default(),
        };
        let page = self.page.unwrap_or(1);
        if page == 0 {
            return Err("page is 1-indexed".to_string());
        }
        let page_size = self.page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        Ok(CustomerQuery {
            filter: self.to_filter()?,
            sort,
            direction,
            page,
            page_size: Some(page_size),
        })
    }
}

fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|r| {
        r.split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

/// RFC 3339, or a bare date taken as the start (or end) of that UTC day.
fn parse_bound(
    name: &str,
    raw: Option<&str>,
    end_of_day: bool,
) -> Result<Option<DateTime<Utc>>, String> {
    let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
        return Ok(None);
    };
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(Some(ts.with_timezone(&Utc)));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| format!("invalid {name} {raw:?}"))?;
    let time = if end_of_day {
        date.and_hms_opt(23, 59, 59)
    } else {
        date.and_hms_opt(0, 0, 0)
    };
    Ok(time.map(|t| t.and_utc()))
}

async fn customers_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CustomerParams>,
) -> Response {
    let query = match params.to_query() {
        Ok(q) => q,
        Err(msg) => return bad_request(msg),
    };
    match state.store.get_customers(&query).await {
        Ok(page) => Json(page).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn export_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CustomerParams>,
) -> Response {
    let query = match params.to_query() {
        Ok(q) => CustomerQuery {
            page: 1,
            page_size: None,
            ..q
        },
        Err(msg) => return bad_request(msg),
    };
    let page = match state.store.get_customers(&query).await {
        Ok(page) => page,
        Err(err) => return server_error(err.into()),
    };
    let count = page.data.len() as i64;
    if let Err(err) = state.store.record_export("csv", count).await {
        warn!(error = %err, "failed to record export activity");
    }
    info!(records = count, "exported customers");
    (
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (header::CONTENT_DISPOSITION, "attachment; filename=\"customers.csv\""),
        ],
        customers_csv(&page.data),
    )
        .into_response()
}

const CSV_HEADER: [&str; 18] = [
    "id",
    "external_id",
    "email",
    "phone",
    "first_name",
    "last_name",
    "city",
    "province",
    "country",
    "postal_code",
    "tags",
    "orders_count",
    "total_spent",
    "gender",
    "gender_confidence",
    "enrichment_status",
    "created_at_source",
    "last_order_at",
];

pub fn customers_csv(customers: &[Customer]) -> String {
    let mut out = CSV_HEADER.join(",");
    out.push('\n');
    for c in customers {
        let opt = |v: &Option<String>| v.clone().unwrap_or_default();
        let ts = |v: Option<DateTime<Utc>>| v.map(|t| t.to_rfc3339()).unwrap_or_default();
        let row = [
            c.id.to_string(),
            c.external_id.to_string(),
            opt(&c.email),
            opt(&c.phone),
            opt(&c.first_name),
            opt(&c.last_name),
            opt(&c.city),
            opt(&c.province),
            opt(&c.country),
            opt(&c.postal_code),
            c.tags.to_joined(),
            c.orders_count.to_string(),
            format!("{:.2}", c.total_spent),
            c.gender_inferred.map(|g| g.as_str().to_string()).unwrap_or_default(),
            c.gender_confidence.map(|v| v.to_string()).unwrap_or_default(),
            c.enrichment_status.as_str().to_string(),
            ts(c.created_at_source),
            ts(c.last_order_at),
        ];
        let cells = row.iter().map(|v| csv_escape(v)).collect::<Vec<_>>();
        out.push_str(&cells.join(","));
        out.push('\n');
    }
    out
}

fn csv_escape(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

async fn filters_handler(State(state): State<Arc<AppState>>) -> Response {
    let options = async {
        Ok::<_, clientele_storage::StoreError>(FilterOptions {
            tags: state.store.distinct_tags().await?,
            cities: state.store.distinct_cities().await?,
            provinces: state.store.distinct_provinces().await?,
            regions: region_names().into_iter().map(str::to_string).collect(),
        })
    }
    .await;
    match options {
        Ok(options) => Json(options).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.get_stats(Utc::now()).await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => server_error(err.into()),
    }
}

#[derive(Debug, Default, Deserialize)]
struct SyncTriggerParams {
    #[serde(rename = "type")]
    sync_type: Option<String>,
    since: Option<String>,
}

async fn sync_trigger_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SyncTriggerParams>,
) -> Response {
    let sync_type = match params.sync_type.as_deref() {
        Some(raw) => match SyncType::parse(raw) {
            Some(t) => t,
            None => return bad_request(format!("unknown sync type {raw:?}")),
        },
        None => SyncType::Incremental,
    };
    let since = match parse_bound("since", params.since.as_deref(), false) {
        Ok(since) => since,
        Err(msg) => return bad_request(msg),
    };
    match state.pipeline.spawn_sync(SyncRequest { sync_type, since }) {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(json!({ "status": "started", "sync_type": sync_type })),
        )
            .into_response(),
        Err(SyncError::AlreadyRunning) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": "a sync is already running" })),
        )
            .into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn sync_status_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.status().await {
        Ok(status) => Json(status).into_response(),
        Err(err) => server_error(err.into()),
    }
}

#[derive(Debug, Default, Deserialize)]
struct EnrichParams {
    limit: Option<u32>,
}

async fn enrich_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<EnrichParams>,
) -> Response {
    let limit = params.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    match state.pipeline.enricher().enrich_pending(limit).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn enrich_reset_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.enricher().reset_all().await {
        Ok(reset) => Json(json!({ "reset": reset })).into_response(),
        Err(err) => server_error(err.into()),
    }
}

#[derive(Debug, Default, Deserialize)]
struct ActivityParams {
    days: Option<i64>,
}

async fn export_activity_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ActivityParams>,
) -> Response {
    let days = params.days.unwrap_or(DEFAULT_ACTIVITY_DAYS).clamp(1, 3660);
    let since = Utc::now() - Duration::days(days);
    match state.store.export_activity(since).await {
        Ok(activity) => Json(activity).into_response(),
        Err(err) => server_error(err.into()),
    }
}

/// Constant-time check of a base64 HMAC-SHA256 signature over the raw body.
pub fn verify_webhook(secret: &str, body: &[u8], signature: &str) -> bool {
    let Ok(expected) = STANDARD.decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(secret) = state.webhook_secret.as_deref().filter(|s| !s.is_empty()) else {
        warn!("rejecting webhook; no secret configured");
        return unauthorized();
    };
    let signature = headers
        .get(HMAC_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !verify_webhook(secret, &body, signature) {
        warn!("rejecting webhook with bad signature");
        return unauthorized();
    }

    let customer: WireCustomer = match serde_json::from_slice(&body) {
        Ok(c) => c,
        Err(err) => return bad_request(format!("invalid customer payload: {err}")),
    };
    match state.pipeline.ingest_webhook(customer).await {
        Ok(outcome) => Json(json!({
            "external_id": outcome.customer.external_id,
            "created": outcome.created,
        }))
        .into_response(),
        Err(err) => server_error(err.into()),
    }
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" }))).into_response()
}

fn bad_request(msg: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": format!("Server error: {err}") })),
    )
        .into_response()
}
