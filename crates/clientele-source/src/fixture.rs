use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clientele_core::{CustomerRecord, Gender, TagSet};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::{CustomerPage, CustomerSource, SourceError, WireCustomer};

/// A page request observed by [`FixtureSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureRequest {
    pub cursor: Option<String>,
    pub updated_since: Option<DateTime<Utc>>,
}

/// A write-back call observed by [`FixtureSource`].
#[derive(Debug, Clone, PartialEq)]
pub enum SourceWrite {
    Tags { external_id: i64, tags: TagSet },
    Metafield { external_id: i64, gender: Gender },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FixtureFile {
    Envelope { customers: Vec<WireCustomer> },
    Bare(Vec<WireCustomer>),
}

/// In-memory stand-in for the platform. Cursors are record offsets; `updated_since` filters on
/// the source update timestamp before paging.
#[derive(Debug)]
pub struct FixtureSource {
    records: Vec<CustomerRecord>,
    page_size: usize,
    page_delay: Duration,
    fail_at_page: Option<usize>,
    requests: Mutex<Vec<FixtureRequest>>,
    writes: Mutex<Vec<SourceWrite>>,
}

impl FixtureSource {
    pub fn from_records(records: Vec<CustomerRecord>, page_size: usize) -> Self {
        Self {
            records,
            page_size: page_size.max(1),
            page_delay: Duration::ZERO,
            fail_at_page: None,
            requests: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
        }
    }

    /// Loads `{"customers": [...]}` or a bare array of platform customer objects.
    pub fn from_json_file(path: impl AsRef<Path>, page_size: usize) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SourceError::Fixture(format!("reading {}: {e}", path.display())))?;
        let file: FixtureFile = serde_json::from_str(&text)
            .map_err(|e| SourceError::Fixture(format!("parsing {}: {e}", path.display())))?;
        let wire = match file {
            FixtureFile::Envelope { customers } => customers,
            FixtureFile::Bare(customers) => customers,
        };
        Ok(Self::from_records(
            wire.into_iter().map(WireCustomer::normalize).collect(),
            page_size,
        ))
    }

    /// Sleeps before serving every page.
    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }

    /// Fails the n-th (0-based) page request with a server error.
    pub fn with_failure_at_page(mut self, page: usize) -> Self {
        self.fail_at_page = Some(page);
        self
    }

    pub async fn requests(&self) -> Vec<FixtureRequest> {
        self.requests.lock().await.clone()
    }

    pub async fn writes(&self) -> Vec<SourceWrite> {
        self.writes.lock().await.clone()
    }
}

#[async_trait]
impl CustomerSource for FixtureSource {
    fn page_size(&self) -> usize {
        self.page_size
    }

    async fn fetch_page(
        &self,
        cursor: Option<&str>,
        updated_since: Option<DateTime<Utc>>,
    ) -> Result<CustomerPage, SourceError> {
        let request_no = {
            let mut requests = self.requests.lock().await;
            requests.push(FixtureRequest {
                cursor: cursor.map(str::to_string),
                updated_since,
            });
            requests.len() - 1
        };
        if !self.page_delay.is_zero() {
            tokio::time::sleep(self.page_delay).await;
        }
        if self.fail_at_page == Some(request_no) {
            return Err(SourceError::HttpStatus {
                status: 500,
                url: format!("fixture://customers?page={request_no}"),
            });
        }

        let offset = match cursor {
            Some(c) => c
                .parse::<usize>()
                .map_err(|_| SourceError::Decode(format!("bad fixture cursor {c:?}")))?,
            None => 0,
        };
        let matching = self
            .records
            .iter()
            .filter(|r| match (updated_since, r.updated_at_source) {
                (Some(since), Some(updated)) => updated >= since,
                _ => true,
            })
            .collect::<Vec<_>>();

        let end = (offset + self.page_size).min(matching.len());
        let records = matching
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|r| (*r).clone())
            .collect();
        let next_cursor = (end < matching.len()).then(|| end.to_string());
        Ok(CustomerPage {
            records,
            next_cursor,
        })
    }

    async fn update_tags(&self, external_id: i64, tags: &TagSet) -> Result<(), SourceError> {
        self.writes.lock().await.push(SourceWrite::Tags {
            external_id,
            tags: tags.clone(),
        });
        Ok(())
    }

    async fn set_gender_metafield(
        &self,
        external_id: i64,
        gender: Gender,
    ) -> Result<(), SourceError> {
        self.writes
            .lock()
            .await
            .push(SourceWrite::Metafield { external_id, gender });
        Ok(())
    }
}
