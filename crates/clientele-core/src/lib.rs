//! Core domain model for the customer mirror: records, enrichment state, tags, filters and sync
//! journal types.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "clientele-core";

/// Prefix of the segmentation tag written back to the source platform.
pub const GENDER_TAG_PREFIX: &str = "gender:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
    Unknown,
}

impl Gender {
    pub const ALL: [Gender; 3] = [Gender::Male, Gender::Female, Gender::Unknown];

    pub fn as_str(self) -> &'static str {
        match self {
            Gender::Male => "male",
            Gender::Female => "female",
            Gender::Unknown => "unknown",
        }
    }

    /// Strict parse: only the three canonical lowercase labels (surrounding whitespace ignored).
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "male" => Some(Gender::Male),
            "female" => Some(Gender::Female),
            "unknown" => Some(Gender::Unknown),
            _ => None,
        }
    }

    pub fn is_known(self) -> bool {
        !matches!(self, Gender::Unknown)
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EnrichmentStatus {
    #[default]
    Pending,
    Complete,
    Failed,
}

impl EnrichmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EnrichmentStatus::Pending => "pending",
            EnrichmentStatus::Complete => "complete",
            EnrichmentStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(EnrichmentStatus::Pending),
            "complete" => Some(EnrichmentStatus::Complete),
            "failed" => Some(EnrichmentStatus::Failed),
            _ => None,
        }
    }
}

/// Validated classifier output. Confidence is always within `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Inference {
    pub gender: Gender,
    pub confidence: f64,
}

impl Inference {
    pub fn new(gender: Gender, confidence: f64) -> Self {
        let confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        Self { gender, confidence }
    }

    pub fn unknown() -> Self {
        Self {
            gender: Gender::Unknown,
            confidence: 0.0,
        }
    }

    /// `unknown` at zero confidence is what every failure path degrades to.
    pub fn is_usable(&self) -> bool {
        self.gender.is_known() || self.confidence > 0.0
    }
}

/// Ordered, de-duplicated set of segmentation tags.
///
/// The platform and the database both carry tags as one comma-joined string; that
/// representation only exists at the (de)serialization edges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct TagSet(Vec<String>);

impl TagSet {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn parse(raw: &str) -> Self {
        let mut set = Self::new();
        for tag in raw.split(',') {
            set.insert(tag);
        }
        set
    }

    pub fn from_tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::new();
        for tag in tags {
            set.insert(tag.as_ref());
        }
        set
    }

    /// Returns false when the trimmed tag is empty or already present.
    pub fn insert(&mut self, tag: &str) -> bool {
        let tag = tag.trim();
        if tag.is_empty() || self.contains(tag) {
            return false;
        }
        self.0.push(tag.to_string());
        true
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.0.iter().any(|t| t == tag)
    }

    /// Removes every tag starting with `prefix` (ASCII case-insensitive). Returns how many were
    /// dropped.
    pub fn remove_prefixed(&mut self, prefix: &str) -> usize {
        let before = self.0.len();
        let prefix = prefix.to_ascii_lowercase();
        self.0.retain(|t| !t.to_ascii_lowercase().starts_with(&prefix));
        before - self.0.len()
    }

    /// Replaces any existing `gender:` tag with the canonical tag for `gender`.
    pub fn with_gender_tag(&self, gender: Gender) -> TagSet {
        let mut next = self.clone();
        next.remove_prefixed(GENDER_TAG_PREFIX);
        next.insert(&format!("{GENDER_TAG_PREFIX}{gender}"));
        next
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_joined(&self) -> String {
        self.0.join(", ")
    }
}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_joined())
    }
}

impl From<String> for TagSet {
    fn from(value: String) -> Self {
        TagSet::parse(&value)
    }
}

impl From<&str> for TagSet {
    fn from(value: &str) -> Self {
        TagSet::parse(value)
    }
}

impl From<TagSet> for String {
    fn from(value: TagSet) -> Self {
        value.to_joined()
    }
}

/// Normalized customer as handed over by the source client. Never carries local state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CustomerRecord {
    pub external_id: i64,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub province: Option<String>,
    pub postal_code: Option<String>,
    pub tags: TagSet,
    pub orders_count: i32,
    pub total_spent: f64,
    pub created_at_source: Option<DateTime<Utc>>,
    pub updated_at_source: Option<DateTime<Utc>>,
    pub last_order_at: Option<DateTime<Utc>>,
}

/// Persisted enrichment state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Enrichment {
    pub gender: Option<Gender>,
    pub confidence: Option<f64>,
    pub status: EnrichmentStatus,
}

impl Enrichment {
    pub fn pending() -> Self {
        Self::default()
    }

    pub fn complete(inference: Inference) -> Self {
        Self {
            gender: Some(inference.gender),
            confidence: Some(inference.confidence),
            status: EnrichmentStatus::Complete,
        }
    }

    /// Terminal state for an enrichment attempt: usable results complete, unusable ones fail.
    pub fn settled(inference: Inference) -> Self {
        if inference.is_usable() {
            Self::complete(inference)
        } else {
            Self {
                gender: Some(Gender::Unknown),
                confidence: Some(0.0),
                status: EnrichmentStatus::Failed,
            }
        }
    }
}

/// Canonical stored customer row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: i64,
    pub external_id: i64,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub province: Option<String>,
    pub postal_code: Option<String>,
    pub tags: TagSet,
    pub orders_count: i32,
    pub total_spent: f64,
    pub created_at_source: Option<DateTime<Utc>>,
    pub updated_at_source: Option<DateTime<Utc>>,
    pub last_order_at: Option<DateTime<Utc>>,
    pub gender_inferred: Option<Gender>,
    pub gender_confidence: Option<f64>,
    pub enrichment_status: EnrichmentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Customer {
    pub fn enrichment(&self) -> Enrichment {
        Enrichment {
            gender: self.gender_inferred,
            confidence: self.gender_confidence,
            status: self.enrichment_status,
        }
    }

    pub fn inference_input(&self) -> InferenceInput {
        InferenceInput {
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            email: self.email.clone(),
            country: self.country.clone(),
        }
    }
}

/// Identifying fields the classifier is allowed to see.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InferenceInput {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub country: Option<String>,
}

impl From<&CustomerRecord> for InferenceInput {
    fn from(record: &CustomerRecord) -> Self {
        Self {
            first_name: record.first_name.clone(),
            last_name: record.last_name.clone(),
            email: record.email.clone(),
            country: record.country.clone(),
        }
    }
}

/// Fully resolved write for one customer: source fields plus the enrichment the caller decided on.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomerUpsert {
    pub record: CustomerRecord,
    pub enrichment: Enrichment,
}

/// How an upsert treats the enrichment columns.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EnrichmentPatch {
    /// Keep whatever is stored; new rows start pending.
    Preserve,
    /// A fresh inference. Known genders complete the record, `unknown` leaves prior state alone.
    Inferred(Inference),
    /// Explicit administrative reset back to pending.
    Reset,
    /// Mark the record failed, keeping any previously stored label.
    Failed,
}

pub fn needs_inference(existing: Option<&Customer>) -> bool {
    existing.map_or(true, |c| c.enrichment_status != EnrichmentStatus::Complete)
}

/// Merges an incoming source record with the stored row. Source fields always win; enrichment
/// only changes as directed by `patch`, so a routine re-sync never discards completed work.
pub fn merge_customer(
    existing: Option<&Customer>,
    incoming: CustomerRecord,
    patch: EnrichmentPatch,
) -> CustomerUpsert {
    let prior = existing.map(Customer::enrichment).unwrap_or_default();
    let enrichment = match patch {
        EnrichmentPatch::Preserve => prior,
        EnrichmentPatch::Inferred(inference) if inference.gender.is_known() => {
            Enrichment::complete(inference)
        }
        EnrichmentPatch::Inferred(_) => prior,
        EnrichmentPatch::Reset => Enrichment::pending(),
        EnrichmentPatch::Failed => Enrichment {
            status: EnrichmentStatus::Failed,
            ..prior
        },
    };
    CustomerUpsert {
        record: incoming,
        enrichment,
    }
}

pub struct Region {
    pub name: &'static str,
    pub provinces: &'static [(&'static str, &'static str)],
}

/// US Census Bureau regions, as (code, name) pairs.
pub const REGIONS: &[Region] = &[
    Region {
        name: "Northeast",
        provinces: &[
            ("CT", "Connecticut"),
            ("ME", "Maine"),
            ("MA", "Massachusetts"),
            ("NH", "New Hampshire"),
            ("RI", "Rhode Island"),
            ("VT", "Vermont"),
            ("NJ", "New Jersey"),
            ("NY", "New York"),
            ("PA", "Pennsylvania"),
        ],
    },
    Region {
        name: "Midwest",
        provinces: &[
            ("IL", "Illinois"),
            ("IN", "Indiana"),
            ("MI", "Michigan"),
            ("OH", "Ohio"),
            ("WI", "Wisconsin"),
            ("IA", "Iowa"),
            ("KS", "Kansas"),
            ("MN", "Minnesota"),
            ("MO", "Missouri"),
            ("NE", "Nebraska"),
            ("ND", "North Dakota"),
            ("SD", "South Dakota"),
        ],
    },
    Region {
        name: "South",
        provinces: &[
            ("DE", "Delaware"),
            ("FL", "Florida"),
            ("GA", "Georgia"),
            ("MD", "Maryland"),
            ("NC", "North Carolina"),
            ("SC", "South Carolina"),
            ("VA", "Virginia"),
            ("DC", "District of Columbia"),
            ("WV", "West Virginia"),
            ("AL", "Alabama"),
            ("KY", "Kentucky"),
            ("MS", "Mississippi"),
            ("TN", "Tennessee"),
            ("AR", "Arkansas"),
            ("LA", "Louisiana"),
            ("OK", "Oklahoma"),
            ("TX", "Texas"),
        ],
    },
    Region {
        name: "West",
        provinces: &[
            ("AZ", "Arizona"),
            ("CO", "Colorado"),
            ("ID", "Idaho"),
            ("MT", "Montana"),
            ("NV", "Nevada"),
            ("NM", "New Mexico"),
            ("UT", "Utah"),
            ("WY", "Wyoming"),
            ("AK", "Alaska"),
            ("CA", "California"),
            ("HI", "Hawaii"),
            ("OR", "Oregon"),
            ("WA", "Washington"),
        ],
    },
];

pub fn region_names() -> Vec<&'static str> {
    REGIONS.iter().map(|r| r.name).collect()
}

/// Province values (codes and full names) belonging to `region`, matched case-insensitively.
/// Empty for unknown regions.
pub fn region_provinces(region: &str) -> Vec<String> {
    let region = region.trim();
    REGIONS
        .iter()
        .find(|r| r.name.eq_ignore_ascii_case(region))
        .map(|r| {
            r.provinces
                .iter()
                .flat_map(|(code, name)| [code.to_string(), name.to_string()])
                .collect()
        })
        .unwrap_or_default()
}

/// AND-combined predicates over the customer table. Empty lists and `None`s contribute nothing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomerFilter {
    pub genders: Vec<Gender>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    pub last_order_from: Option<DateTime<Utc>>,
    pub last_order_to: Option<DateTime<Utc>>,
    pub cities: Vec<String>,
    pub provinces: Vec<String>,
    pub region: Option<String>,
    pub tag: Option<String>,
    pub min_spent: Option<f64>,
    pub max_spent: Option<f64>,
    pub min_orders: Option<i32>,
    pub max_orders: Option<i32>,
}

impl CustomerFilter {
    /// Explicit provinces take precedence over a region; an unknown region yields no constraint.
    pub fn province_constraint(&self) -> Option<Vec<String>> {
        if !self.provinces.is_empty() {
            return Some(self.provinces.clone());
        }
        let provinces = self
            .region
            .as_deref()
            .map(region_provinces)
            .unwrap_or_default();
        if provinces.is_empty() {
            None
        } else {
            Some(provinces)
        }
    }

    pub fn tag_needle(&self) -> Option<String> {
        self.tag
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
    }

    pub fn matches(&self, c: &Customer) -> bool {
        if !self.genders.is_empty()
            && !c.gender_inferred.is_some_and(|g| self.genders.contains(&g))
        {
            return false;
        }
        if !within(c.created_at_source, self.created_from, self.created_to) {
            return false;
        }
        if !within(c.last_order_at, self.last_order_from, self.last_order_to) {
            return false;
        }
        if !self.cities.is_empty() && !c.city.as_ref().is_some_and(|v| self.cities.contains(v)) {
            return false;
        }
        if let Some(provinces) = self.province_constraint() {
            if !c.province.as_ref().is_some_and(|v| provinces.contains(v)) {
                return false;
            }
        }
        if let Some(needle) = self.tag_needle() {
            if !c.tags.iter().any(|tag| tag.to_lowercase().contains(&needle)) {
                return false;
            }
        }
        if self.min_spent.is_some_and(|min| c.total_spent < min)
            || self.max_spent.is_some_and(|max| c.total_spent > max)
        {
            return false;
        }
        if self.min_orders.is_some_and(|min| c.orders_count < min)
            || self.max_orders.is_some_and(|max| c.orders_count > max)
        {
            return false;
        }
        true
    }
}

fn within(
    value: Option<DateTime<Utc>>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> bool {
    if from.is_none() && to.is_none() {
        return true;
    }
    let Some(value) = value else {
        return false;
    };
    from.map_or(true, |f| value >= f) && to.map_or(true, |t| value <= t)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortColumn {
    #[default]
    CreatedAtSource,
    UpdatedAtSource,
    LastOrderAt,
    TotalSpent,
    OrdersCount,
    FirstName,
    LastName,
    Email,
    City,
    Province,
    Country,
    GenderConfidence,
}

impl SortColumn {
    pub fn column(self) -> &'static str {
        match self {
            SortColumn::CreatedAtSource => "created_at_source",
            SortColumn::UpdatedAtSource => "updated_at_source",
            SortColumn::LastOrderAt => "last_order_at",
            SortColumn::TotalSpent => "total_spent",
            SortColumn::OrdersCount => "orders_count",
            SortColumn::FirstName => "first_name",
            SortColumn::LastName => "last_name",
            SortColumn::Email => "email",
            SortColumn::City => "city",
            SortColumn::Province => "province",
            SortColumn::Country => "country",
            SortColumn::GenderConfidence => "gender_confidence",
        }
    }

    /// Accepts the column name in snake_case or camelCase (`totalSpent`).
    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value
            .chars()
            .filter(|c| *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        let column = match normalized.as_str() {
            "createdatsource" | "createdat" => SortColumn::CreatedAtSource,
            "updatedatsource" | "updatedat" => SortColumn::UpdatedAtSource,
            "lastorderat" => SortColumn::LastOrderAt,
            "totalspent" => SortColumn::TotalSpent,
            "orderscount" => SortColumn::OrdersCount,
            "firstname" => SortColumn::FirstName,
            "lastname" => SortColumn::LastName,
            "email" => SortColumn::Email,
            "city" => SortColumn::City,
            "province" => SortColumn::Province,
            "country" => SortColumn::Country,
            "genderconfidence" => SortColumn::GenderConfidence,
            _ => return None,
        };
        Some(column)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl SortDirection {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "asc" => Some(SortDirection::Asc),
            "desc" => Some(SortDirection::Desc),
            _ => None,
        }
    }

    pub fn keyword(self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

pub const DEFAULT_PAGE_SIZE: u32 = 50;

#[derive(Debug, Clone, PartialEq)]
pub struct CustomerQuery {
    pub filter: CustomerFilter,
    pub sort: SortColumn,
    pub direction: SortDirection,
    /// 1-indexed.
    pub page: u32,
    /// `None` returns every matching row on a single page (export).
    pub page_size: Option<u32>,
}

impl Default for CustomerQuery {
    fn default() -> Self {
        Self {
            filter: CustomerFilter::default(),
            sort: SortColumn::default(),
            direction: SortDirection::default(),
            page: 1,
            page_size: Some(DEFAULT_PAGE_SIZE),
        }
    }
}

impl CustomerQuery {
    pub fn offset(&self) -> u64 {
        match self.page_size {
            Some(size) => u64::from(self.page.max(1) - 1) * u64::from(size),
            None => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: u32,
    pub page_size: u32,
    pub total_count: u64,
    pub total_pages: u64,
}

impl Pagination {
    pub fn new(page: u32, page_size: u32, total_count: u64) -> Self {
        let total_pages = if page_size == 0 {
            0
        } else {
            total_count.div_ceil(u64::from(page_size))
        };
        Self {
            page: page.max(1),
            page_size,
            total_count,
            total_pages,
        }
    }

    pub fn for_query(query: &CustomerQuery, total_count: u64) -> Self {
        match query.page_size {
            Some(size) => Self::new(query.page, size, total_count),
            None => Self {
                page: 1,
                page_size: u32::try_from(total_count).unwrap_or(u32::MAX),
                total_count,
                total_pages: u64::from(total_count > 0),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GenderCounts {
    pub male: i64,
    pub female: i64,
    pub unknown: i64,
    /// Rows with no label yet.
    pub unprocessed: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountryCount {
    pub country: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CustomerStats {
    pub total_customers: i64,
    pub gender_counts: GenderCounts,
    pub pending_enrichment: i64,
    pub new_last_7_days: i64,
    pub new_last_30_days: i64,
    pub top_countries: Vec<CountryCount>,
    pub total_revenue: f64,
    pub total_orders: i64,
    pub average_spend: f64,
    pub average_order_value: f64,
}

impl CustomerStats {
    /// Fills the two derived averages from the population totals.
    pub fn with_averages(mut self) -> Self {
        self.average_spend = if self.total_customers > 0 {
            self.total_revenue / self.total_customers as f64
        } else {
            0.0
        };
        self.average_order_value = if self.total_orders > 0 {
            self.total_revenue / self.total_orders as f64
        } else {
            0.0
        };
        self
    }
}

pub const TOP_COUNTRIES_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncType {
    #[default]
    Incremental,
    Full,
}

impl SyncType {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncType::Incremental => "incremental",
            SyncType::Full => "full",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "incremental" => Some(SyncType::Incremental),
            "full" => Some(SyncType::Full),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Running,
    Completed,
    Failed,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Running => "running",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(SyncStatus::Running),
            "completed" => Some(SyncStatus::Completed),
            "failed" => Some(SyncStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, SyncStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SyncCounters {
    pub processed: i32,
    pub created: i32,
    pub updated: i32,
    pub failed: i32,
}

/// Sync journal entry. Exactly one terminal transition after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncLog {
    pub id: i64,
    pub sync_type: SyncType,
    pub status: SyncStatus,
    pub customers_processed: i32,
    pub customers_created: i32,
    pub customers_updated: i32,
    pub customers_failed: i32,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Terminal outcome written onto a running sync log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncLogUpdate {
    Completed(SyncCounters),
    Failed {
        counters: SyncCounters,
        error_message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportActivity {
    pub id: i64,
    pub format: String,
    pub record_count: i64,
    pub created_at: DateTime<Utc>,
}

/// One calendar cell of the export history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportDay {
    pub day: NaiveDate,
    pub exports: i64,
    pub records: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FilterOptions {
    pub tags: Vec<String>,
    pub cities: Vec<String>,
    pub provinces: Vec<String>,
    pub regions: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, 12, 0, 0).single().unwrap()
    }

    fn stored(external_id: i64) -> Customer {
        Customer {
            id: external_id,
            external_id,
            email: Some(format!("c{external_id}@example.com")),
            phone: None,
            first_name: Some("Ada".into()),
            last_name: Some("Lovelace".into()),
            city: Some("Austin".into()),
            country: Some("United States".into()),
            province: Some("Texas".into()),
            postal_code: None,
            tags: TagSet::parse("vip, newsletter"),
            orders_count: 3,
            total_spent: 120.5,
            created_at_source: Some(ts(2)),
            updated_at_source: Some(ts(3)),
            last_order_at: Some(ts(3)),
            gender_inferred: Some(Gender::Female),
            gender_confidence: Some(0.93),
            enrichment_status: EnrichmentStatus::Complete,
            created_at: ts(4),
            updated_at: ts(4),
        }
    }

    #[test]
    fn inference_confidence_is_clamped() {
        assert_eq!(Inference::new(Gender::Male, 1.7).confidence, 1.0);
        assert_eq!(Inference::new(Gender::Male, -0.2).confidence, 0.0);
        assert_eq!(Inference::new(Gender::Male, f64::NAN).confidence, 0.0);
    }

    #[test]
    fn tag_set_trims_dedups_and_keeps_order() {
        let tags = TagSet::parse(" vip,newsletter , vip,, wholesale ");
        assert_eq!(tags.iter().collect::<Vec<_>>(), vec!["vip", "newsletter", "wholesale"]);
        assert_eq!(tags.to_joined(), "vip, newsletter, wholesale");
        assert!(TagSet::parse("").is_empty());
    }

    #[test]
    fn gender_tag_replaces_prior_label() {
        let tags = TagSet::parse("vip, Gender:male, newsletter");
        let next = tags.with_gender_tag(Gender::Female);
        assert_eq!(next.to_joined(), "vip, newsletter, gender:female");
        assert_eq!(next.with_gender_tag(Gender::Female), next);
    }

    #[test]
    fn tag_set_serializes_as_joined_string() {
        let tags = TagSet::parse("a,b");
        assert_eq!(serde_json::to_string(&tags).unwrap(), "\"a, b\"");
        let back: TagSet = serde_json::from_str("\"b , a\"").unwrap();
        assert_eq!(back.iter().collect::<Vec<_>>(), vec!["b", "a"]);
    }

    #[test]
    fn preserve_keeps_completed_enrichment() {
        let existing = stored(7);
        let incoming = CustomerRecord {
            external_id: 7,
            email: Some("new@example.com".into()),
            ..Default::default()
        };
        let merged = merge_customer(Some(&existing), incoming, EnrichmentPatch::Preserve);
        assert_eq!(merged.record.email.as_deref(), Some("new@example.com"));
        assert_eq!(merged.enrichment, existing.enrichment());
        assert_eq!(merged.enrichment.status, EnrichmentStatus::Complete);
    }

    #[test]
    fn new_rows_start_pending() {
        let merged = merge_customer(None, CustomerRecord::default(), EnrichmentPatch::Preserve);
        assert_eq!(merged.enrichment, Enrichment::pending());
    }

    #[test]
    fn unknown_inference_does_not_overwrite() {
        let existing = stored(1);
        let merged = merge_customer(
            Some(&existing),
            CustomerRecord::default(),
            EnrichmentPatch::Inferred(Inference::unknown()),
        );
        assert_eq!(merged.enrichment, existing.enrichment());

        let merged = merge_customer(
            None,
            CustomerRecord::default(),
            EnrichmentPatch::Inferred(Inference::new(Gender::Male, 0.8)),
        );
        assert_eq!(merged.enrichment.status, EnrichmentStatus::Complete);
        assert_eq!(merged.enrichment.gender, Some(Gender::Male));
        assert_eq!(merged.enrichment.confidence, Some(0.8));
    }

    #[test]
    fn failed_patch_keeps_label_but_flags_status() {
        let existing = stored(1);
        let merged =
            merge_customer(Some(&existing), CustomerRecord::default(), EnrichmentPatch::Failed);
        assert_eq!(merged.enrichment.status, EnrichmentStatus::Failed);
        assert_eq!(merged.enrichment.gender, Some(Gender::Female));
        let reset =
            merge_customer(Some(&existing), CustomerRecord::default(), EnrichmentPatch::Reset);
        assert_eq!(reset.enrichment, Enrichment::pending());
    }

    #[test]
    fn settled_marks_unusable_results_failed() {
        assert_eq!(Enrichment::settled(Inference::unknown()).status, EnrichmentStatus::Failed);
        assert_eq!(
            Enrichment::settled(Inference::new(Gender::Unknown, 0.4)).status,
            EnrichmentStatus::Complete
        );
    }

    #[test]
    fn needs_inference_only_skips_complete_rows() {
        let mut c = stored(1);
        assert!(!needs_inference(Some(&c)));
        c.enrichment_status = EnrichmentStatus::Failed;
        assert!(needs_inference(Some(&c)));
        assert!(needs_inference(None));
    }

    #[test]
    fn region_filter_matches_codes_and_names_only_in_region() {
        let filter = CustomerFilter {
            region: Some("south".into()),
            ..Default::default()
        };
        let mut c = stored(1);
        assert!(filter.matches(&c));
        c.province = Some("TX".into());
        assert!(filter.matches(&c));
        c.province = Some("Ontario".into());
        assert!(!filter.matches(&c));
        c.province = None;
        assert!(!filter.matches(&c));

        let unknown_region = CustomerFilter {
            region: Some("Atlantis".into()),
            ..Default::default()
        };
        assert_eq!(unknown_region.province_constraint(), None);
        assert!(unknown_region.matches(&c));
    }

    #[test]
    fn explicit_provinces_override_region() {
        let filter = CustomerFilter {
            provinces: vec!["Ontario".into()],
            region: Some("South".into()),
            ..Default::default()
        };
        let mut c = stored(1);
        assert!(!filter.matches(&c));
        c.province = Some("Ontario".into());
        assert!(filter.matches(&c));
    }

    #[test]
    fn filter_predicates_combine_with_and() {
        let c = stored(1);
        let filter = CustomerFilter {
            genders: vec![Gender::Female],
            tag: Some("NEWS".into()),
            min_spent: Some(100.0),
            max_orders: Some(3),
            created_from: Some(ts(1)),
            ..Default::default()
        };
        assert!(filter.matches(&c));

        let too_rich = CustomerFilter {
            min_spent: Some(500.0),
            ..filter.clone()
        };
        assert!(!too_rich.matches(&c));

        let wrong_gender = CustomerFilter {
            genders: vec![Gender::Male, Gender::Unknown],
            ..filter
        };
        assert!(!wrong_gender.matches(&c));
    }

    #[test]
    fn tag_filter_matches_within_a_single_tag() {
        let c = stored(1);
        let across = CustomerFilter {
            tag: Some("p, n".into()),
            ..Default::default()
        };
        assert!(!across.matches(&c));

        let within = CustomerFilter {
            tag: Some("EWSLET".into()),
            ..Default::default()
        };
        assert!(within.matches(&c));
    }

    #[test]
    fn pagination_rounds_up() {
        assert_eq!(Pagination::new(1, 50, 0).total_pages, 0);
        assert_eq!(Pagination::new(1, 50, 50).total_pages, 1);
        assert_eq!(Pagination::new(1, 50, 51).total_pages, 2);
        let query = CustomerQuery {
            page: 3,
            page_size: Some(20),
            ..Default::default()
        };
        assert_eq!(query.offset(), 40);
    }

    #[test]
    fn sort_column_accepts_camel_and_snake_case() {
        assert_eq!(SortColumn::parse("totalSpent"), Some(SortColumn::TotalSpent));
        assert_eq!(SortColumn::parse("orders_count"), Some(SortColumn::OrdersCount));
        assert_eq!(SortColumn::parse("password"), None);
    }

    #[test]
    fn stats_averages_handle_zero_orders() {
        let stats = CustomerStats {
            total_customers: 4,
            total_revenue: 200.0,
            total_orders: 0,
            ..Default::default()
        }
        .with_averages();
        assert_eq!(stats.average_spend, 50.0);
        assert_eq!(stats.average_order_value, 0.0);
    }
}
