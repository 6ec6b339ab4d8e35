//! Record-store REST client + HTTP fetch utilities for FSLP.
//!
//! The store is reached exclusively through a PostgREST-style interface:
//! filtered selects, row inserts (optionally merge-on-conflict), filtered
//! patches, exact counts via the `Content-Range` header, and RPC for the
//! operations that must be evaluated atomically on the store side (job
//! claiming, county scheduling). Every request carries a static bearer
//! credential.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, USER_AGENT};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, warn};
use uuid::Uuid;

use fslp_core::{
    County, ForeclosureLead, JobCounts, JobDetail, JobStatus, LeadRefresh, ScrapeJob,
    ScrapeSource, StagedLead, StagingPatch,
};

pub const CRATE_NAME: &str = "fslp-store";

pub const STAGING_TABLE: &str = "scraped_leads";
pub const PRODUCTION_TABLE: &str = "foreclosure_leads";
pub const JOBS_TABLE: &str = "scrape_jobs";
pub const COUNTIES_TABLE: &str = "counties";
pub const SOURCES_TABLE: &str = "scrape_sources";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("store returned status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding store response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("{0}")]
    Message(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_transport_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Capped exponential backoff for transient HTTP failures.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Cooperative throttle: a randomized sleep within [min, max] after each
/// store call, to stay under third-party and store-side rate limits.
#[derive(Debug, Clone, Copy)]
pub struct PacingConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(250),
            max_delay: Duration::from_millis(750),
        }
    }
}

impl PacingConfig {
    fn pick_delay(&self) -> Duration {
        let min = self.min_delay.as_millis() as u64;
        let max = self.max_delay.as_millis() as u64;
        if max <= min {
            return self.min_delay;
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    pub async fn pause(&self) {
        let delay = self.pick_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub base_url: String,
    pub service_key: String,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
    pub pacing: PacingConfig,
}

impl StoreConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("FSLP_STORE_URL")
                .unwrap_or_else(|_| "http://localhost:54321".to_string()),
            service_key: std::env::var("FSLP_STORE_KEY").unwrap_or_default(),
            timeout: std::env::var("FSLP_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or_else(|| Duration::from_secs(30)),
            backoff: BackoffPolicy::default(),
            pacing: PacingConfig::default(),
        }
    }
}

/// One predicate in a filtered select/patch, rendered as a PostgREST
/// query-string operator (`col=eq.v`, `col=is.null`, `col=in.(a,b)`).
#[derive(Debug, Clone)]
pub struct Filter {
    column: String,
    op: FilterOp,
}

#[derive(Debug, Clone)]
enum FilterOp {
    Eq(String),
    Lt(String),
    Lte(String),
    Gte(String),
    IsNull,
    In(Vec<String>),
    NotIn(Vec<String>),
    Raw(String),
}

impl Filter {
    pub fn eq(column: &str, value: impl ToString) -> Self {
        Self {
            column: column.to_string(),
            op: FilterOp::Eq(value.to_string()),
        }
    }

    pub fn lt(column: &str, value: impl ToString) -> Self {
        Self {
            column: column.to_string(),
            op: FilterOp::Lt(value.to_string()),
        }
    }

    pub fn lte(column: &str, value: impl ToString) -> Self {
        Self {
            column: column.to_string(),
            op: FilterOp::Lte(value.to_string()),
        }
    }

    pub fn gte(column: &str, value: impl ToString) -> Self {
        Self {
            column: column.to_string(),
            op: FilterOp::Gte(value.to_string()),
        }
    }

    pub fn is_null(column: &str) -> Self {
        Self {
            column: column.to_string(),
            op: FilterOp::IsNull,
        }
    }

    pub fn any_of(column: &str, values: &[&str]) -> Self {
        Self {
            column: column.to_string(),
            op: FilterOp::In(values.iter().map(|v| v.to_string()).collect()),
        }
    }

    pub fn none_of(column: &str, values: &[&str]) -> Self {
        Self {
            column: column.to_string(),
            op: FilterOp::NotIn(values.iter().map(|v| v.to_string()).collect()),
        }
    }

    /// Escape hatch for operators without a dedicated constructor
    /// (`or=(...)`, array containment, ...). The value is passed through
    /// verbatim as the parameter value.
    pub fn raw(param: &str, rendered: &str) -> Self {
        Self {
            column: param.to_string(),
            op: FilterOp::Raw(rendered.to_string()),
        }
    }

    fn to_query_pair(&self) -> (String, String) {
        let value = match &self.op {
            FilterOp::Eq(v) => format!("eq.{v}"),
            FilterOp::Lt(v) => format!("lt.{v}"),
            FilterOp::Lte(v) => format!("lte.{v}"),
            FilterOp::Gte(v) => format!("gte.{v}"),
            FilterOp::IsNull => "is.null".to_string(),
            FilterOp::In(vs) => format!("in.({})", vs.join(",")),
            FilterOp::NotIn(vs) => format!("not.in.({})", vs.join(",")),
            FilterOp::Raw(v) => v.clone(),
        };
        (self.column.clone(), value)
    }
}

/// Builder for a filtered, projected, ordered, paginated select.
#[derive(Debug, Clone)]
pub struct SelectQuery {
    table: String,
    projection: String,
    filters: Vec<Filter>,
    order: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

impl SelectQuery {
    pub fn table(name: &str) -> Self {
        Self {
            table: name.to_string(),
            projection: "*".to_string(),
            filters: Vec::new(),
            order: None,
            limit: None,
            offset: None,
        }
    }

    pub fn select(mut self, projection: &str) -> Self {
        self.projection = projection.to_string();
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order(mut self, order: &str) -> Self {
        self.order = Some(order.to_string());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![("select".to_string(), self.projection.clone())];
        for filter in &self.filters {
            pairs.push(filter.to_query_pair());
        }
        if let Some(order) = &self.order {
            pairs.push(("order".to_string(), order.clone()));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit".to_string(), limit.to_string()));
        }
        if let Some(offset) = self.offset {
            pairs.push(("offset".to_string(), offset.to_string()));
        }
        pairs
    }
}

/// Exact count arrives as the total after the slash: `0-24/1234`.
fn parse_content_range_total(header: &str) -> Option<u64> {
    header.rsplit('/').next()?.trim().parse().ok()
}

/// Low-level REST client: authenticated requests, retry with backoff on
/// transient failures, cooperative pacing after every call.
#[derive(Debug)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    service_key: String,
    backoff: BackoffPolicy,
    pacing: PacingConfig,
}

impl RestClient {
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&config.service_key) {
            headers.insert("apikey", value);
        }
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", config.service_key)) {
            headers.insert(AUTHORIZATION, value);
        }
        let http = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers)
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            service_key: config.service_key.clone(),
            backoff: config.backoff,
            pacing: config.pacing,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, path)
    }

    async fn send(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, StoreError> {
        let mut outcome = None;
        for attempt in 0..=self.backoff.max_retries {
            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        outcome = Some(Ok(resp));
                        break;
                    }
                    let url = resp.url().to_string();
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    outcome = Some(Err(StoreError::HttpStatus {
                        status: status.as_u16(),
                        url,
                    }));
                    break;
                }
                Err(err) => {
                    if classify_transport_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        outcome = Some(Err(StoreError::Request(err)));
                        continue;
                    }
                    outcome = Some(Err(StoreError::Request(err)));
                    break;
                }
            }
        }
        self.pacing.pause().await;
        outcome.unwrap_or_else(|| {
            Err(StoreError::Message(
                "request loop produced no outcome".to_string(),
            ))
        })
    }

    pub async fn select_rows<T: DeserializeOwned>(
        &self,
        query: &SelectQuery,
    ) -> Result<Vec<T>, StoreError> {
        let url = self.endpoint(&query.table);
        let pairs = query.query_pairs();
        let resp = self
            .send(|| self.http.request(Method::GET, &url).query(&pairs))
            .await?;
        Ok(resp.json().await?)
    }

    pub async fn insert_rows<T: Serialize>(
        &self,
        table: &str,
        rows: &[T],
        merge_on_conflict: bool,
    ) -> Result<(), StoreError> {
        let url = self.endpoint(table);
        let prefer = if merge_on_conflict {
            "return=minimal,resolution=merge-duplicates"
        } else {
            "return=minimal"
        };
        let body = serde_json::to_value(rows)?;
        self.send(|| {
            self.http
                .request(Method::POST, &url)
                .header("Prefer", prefer)
                .json(&body)
        })
        .await?;
        Ok(())
    }

    pub async fn update_rows<P: Serialize>(
        &self,
        table: &str,
        filters: &[Filter],
        patch: &P,
    ) -> Result<(), StoreError> {
        let url = self.endpoint(table);
        let pairs: Vec<_> = filters.iter().map(Filter::to_query_pair).collect();
        let body = serde_json::to_value(patch)?;
        self.send(|| {
            self.http
                .request(Method::PATCH, &url)
                .query(&pairs)
                .header("Prefer", "return=minimal")
                .json(&body)
        })
        .await?;
        Ok(())
    }

    pub async fn count_rows(&self, table: &str, filters: &[Filter]) -> Result<u64, StoreError> {
        let url = self.endpoint(table);
        let mut pairs = vec![("select".to_string(), "*".to_string())];
        pairs.extend(filters.iter().map(Filter::to_query_pair));
        let resp = self
            .send(|| {
                self.http
                    .request(Method::HEAD, &url)
                    .query(&pairs)
                    .header("Prefer", "count=exact")
            })
            .await?;
        let total = resp
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total);
        total.ok_or_else(|| StoreError::Message(format!("missing exact count for {table}")))
    }

    /// Invoke a store-side procedure. An empty response body decodes as
    /// JSON `null`, so `T = Option<_>` works for void procedures.
    pub async fn rpc<A: Serialize, T: DeserializeOwned>(
        &self,
        function: &str,
        args: &A,
    ) -> Result<T, StoreError> {
        let url = format!("{}/rest/v1/rpc/{}", self.base_url, function);
        let body = serde_json::to_value(args)?;
        let resp = self.send(|| self.http.request(Method::POST, &url).json(&body)).await?;
        let text = resp.text().await?;
        let text = if text.trim().is_empty() { "null" } else { &text };
        Ok(serde_json::from_str(text)?)
    }

    pub fn service_key(&self) -> &str {
        &self.service_key
    }
}

/// The typed store operations the importer, worker, and scheduler need.
/// `RestStore` speaks the REST protocol; `MemoryStore` backs tests and
/// local development.
#[async_trait]
pub trait RecordStore: Send + Sync {
    // Importer
    async fn fetch_unimported(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StagedLead>, StoreError>;
    async fn count_unimported(&self) -> Result<u64, StoreError>;
    async fn production_exists(
        &self,
        property_address: &str,
        state_abbr: &str,
    ) -> Result<bool, StoreError>;
    async fn insert_production(&self, lead: &ForeclosureLead) -> Result<(), StoreError>;
    async fn update_staging(&self, id: Uuid, patch: &StagingPatch) -> Result<(), StoreError>;

    // Worker
    async fn claim_next_job(&self, worker_id: &str) -> Result<Option<Uuid>, StoreError>;
    async fn load_job(&self, id: Uuid) -> Result<Option<JobDetail>, StoreError>;
    async fn find_production_by_id(
        &self,
        id: &str,
    ) -> Result<Option<ForeclosureLead>, StoreError>;
    async fn patch_production(&self, id: &str, refresh: &LeadRefresh) -> Result<(), StoreError>;
    async fn complete_job(&self, id: Uuid, counts: JobCounts) -> Result<(), StoreError>;
    async fn requeue_job(
        &self,
        id: Uuid,
        attempt_number: i32,
        next_retry_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError>;
    async fn fail_job(&self, id: Uuid, error: &str) -> Result<(), StoreError>;
    async fn record_county_success(
        &self,
        county_id: Uuid,
        new_leads: i64,
    ) -> Result<(), StoreError>;
    async fn record_county_failure(&self, county_id: Uuid) -> Result<(), StoreError>;

    // Scheduler
    async fn due_counties(&self, limit: usize) -> Result<Vec<County>, StoreError>;
    async fn county_job_in_flight(&self, county_id: Uuid) -> Result<bool, StoreError>;
    async fn enqueue_county_job(&self, county: &County) -> Result<(), StoreError>;
    async fn active_nationwide_sources(&self) -> Result<Vec<ScrapeSource>, StoreError>;
    async fn source_job_since(
        &self,
        source_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
    async fn enqueue_source_job(
        &self,
        source: &ScrapeSource,
        state_abbr: &str,
    ) -> Result<(), StoreError>;
    async fn stale_running_jobs(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<ScrapeJob>, StoreError>;

    // Seeding
    async fn insert_counties(&self, counties: &[County]) -> Result<(), StoreError>;
    async fn insert_sources(&self, sources: &[ScrapeSource]) -> Result<(), StoreError>;
}

/// REST-backed store implementation.
pub struct RestStore {
    client: RestClient,
}

impl RestStore {
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        Ok(Self {
            client: RestClient::new(config)?,
        })
    }

    pub fn client(&self) -> &RestClient {
        &self.client
    }

    async fn load_county(&self, id: Uuid) -> Result<Option<County>, StoreError> {
        let query = SelectQuery::table(COUNTIES_TABLE)
            .filter(Filter::eq("id", id))
            .limit(1);
        let rows: Vec<County> = self.client.select_rows(&query).await?;
        Ok(rows.into_iter().next())
    }

    async fn load_source(&self, id: Uuid) -> Result<Option<ScrapeSource>, StoreError> {
        let query = SelectQuery::table(SOURCES_TABLE)
            .filter(Filter::eq("id", id))
            .limit(1);
        let rows: Vec<ScrapeSource> = self.client.select_rows(&query).await?;
        Ok(rows.into_iter().next())
    }
}

#[async_trait]
impl RecordStore for RestStore {
    async fn fetch_unimported(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StagedLead>, StoreError> {
        let query = SelectQuery::table(STAGING_TABLE)
            .filter(Filter::eq("imported", "false"))
            .order("id.asc")
            .limit(limit)
            .offset(offset);
        self.client.select_rows(&query).await
    }

    async fn count_unimported(&self) -> Result<u64, StoreError> {
        self.client
            .count_rows(STAGING_TABLE, &[Filter::eq("imported", "false")])
            .await
    }

    async fn production_exists(
        &self,
        property_address: &str,
        state_abbr: &str,
    ) -> Result<bool, StoreError> {
        let query = SelectQuery::table(PRODUCTION_TABLE)
            .select("id")
            .filter(Filter::eq("property_address", property_address))
            .filter(Filter::eq("state_abbr", state_abbr))
            .limit(1);
        let rows: Vec<serde_json::Value> = self.client.select_rows(&query).await?;
        Ok(!rows.is_empty())
    }

    async fn insert_production(&self, lead: &ForeclosureLead) -> Result<(), StoreError> {
        self.client
            .insert_rows(PRODUCTION_TABLE, std::slice::from_ref(lead), false)
            .await
    }

    async fn update_staging(&self, id: Uuid, patch: &StagingPatch) -> Result<(), StoreError> {
        self.client
            .update_rows(STAGING_TABLE, &[Filter::eq("id", id)], patch)
            .await
    }

    async fn claim_next_job(&self, worker_id: &str) -> Result<Option<Uuid>, StoreError> {
        self.client
            .rpc("get_next_scrape_job", &json!({ "p_worker_id": worker_id }))
            .await
    }

    async fn load_job(&self, id: Uuid) -> Result<Option<JobDetail>, StoreError> {
        let query = SelectQuery::table(JOBS_TABLE)
            .filter(Filter::eq("id", id))
            .limit(1);
        let mut rows: Vec<ScrapeJob> = self.client.select_rows(&query).await?;
        let Some(job) = rows.drain(..).next() else {
            return Ok(None);
        };

        let mut detail = JobDetail {
            job,
            scraper_name: None,
            source_name: None,
            county_name: None,
            base_url: None,
        };
        if let Some(source_id) = detail.job.source_id {
            if let Some(source) = self.load_source(source_id).await? {
                detail.scraper_name = source.scraper_name.clone();
                detail.base_url = source.base_url.clone();
                detail.source_name = Some(source.name);
            }
        }
        if let Some(county_id) = detail.job.county_id {
            if let Some(county) = self.load_county(county_id).await? {
                detail.county_name = Some(county.name);
            }
        }
        Ok(Some(detail))
    }

    async fn find_production_by_id(
        &self,
        id: &str,
    ) -> Result<Option<ForeclosureLead>, StoreError> {
        let query = SelectQuery::table(PRODUCTION_TABLE)
            .filter(Filter::eq("id", id))
            .limit(1);
        let rows: Vec<ForeclosureLead> = self.client.select_rows(&query).await?;
        Ok(rows.into_iter().next())
    }

    async fn patch_production(&self, id: &str, refresh: &LeadRefresh) -> Result<(), StoreError> {
        self.client
            .update_rows(PRODUCTION_TABLE, &[Filter::eq("id", id)], refresh)
            .await
    }

    async fn complete_job(&self, id: Uuid, counts: JobCounts) -> Result<(), StoreError> {
        let patch = json!({
            "status": JobStatus::Completed,
            "completed_at": Utc::now(),
            "leads_found": counts.leads_found,
            "leads_new": counts.leads_new,
            "leads_updated": counts.leads_updated,
        });
        self.client
            .update_rows(JOBS_TABLE, &[Filter::eq("id", id)], &patch)
            .await
    }

    async fn requeue_job(
        &self,
        id: Uuid,
        attempt_number: i32,
        next_retry_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError> {
        let patch = json!({
            "status": JobStatus::Pending,
            "attempt_number": attempt_number,
            "next_retry_at": next_retry_at,
            "error_message": error,
            "worker_id": serde_json::Value::Null,
        });
        self.client
            .update_rows(JOBS_TABLE, &[Filter::eq("id", id)], &patch)
            .await
    }

    async fn fail_job(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let patch = json!({
            "status": JobStatus::Failed,
            "completed_at": Utc::now(),
            "error_message": error,
        });
        self.client
            .update_rows(JOBS_TABLE, &[Filter::eq("id", id)], &patch)
            .await
    }

    async fn record_county_success(
        &self,
        county_id: Uuid,
        new_leads: i64,
    ) -> Result<(), StoreError> {
        // Read-modify-write: the REST surface has no in-place increment.
        let Some(county) = self.load_county(county_id).await? else {
            return Ok(());
        };
        let now = Utc::now();
        let patch = json!({
            "last_scraped_at": now,
            "last_successful_scrape": now,
            "consecutive_failures": 0,
            "total_leads_found": county.total_leads_found + new_leads,
        });
        self.client
            .update_rows(COUNTIES_TABLE, &[Filter::eq("id", county_id)], &patch)
            .await
    }

    async fn record_county_failure(&self, county_id: Uuid) -> Result<(), StoreError> {
        let Some(county) = self.load_county(county_id).await? else {
            return Ok(());
        };
        let patch = json!({
            "last_scraped_at": Utc::now(),
            "consecutive_failures": county.consecutive_failures + 1,
        });
        self.client
            .update_rows(COUNTIES_TABLE, &[Filter::eq("id", county_id)], &patch)
            .await
    }

    async fn due_counties(&self, limit: usize) -> Result<Vec<County>, StoreError> {
        let now = Utc::now().to_rfc3339();
        let query = SelectQuery::table(COUNTIES_TABLE)
            .filter(Filter::eq("is_active", "true"))
            .filter(Filter::eq("has_online_records", "true"))
            .filter(Filter::lt(
                "consecutive_failures",
                fslp_core::COUNTY_FAILURE_THRESHOLD,
            ))
            .filter(Filter::raw(
                "or",
                &format!("(next_scheduled_scrape.is.null,next_scheduled_scrape.lte.{now})"),
            ))
            .order("next_scheduled_scrape.asc.nullsfirst")
            .limit(limit);
        self.client.select_rows(&query).await
    }

    async fn county_job_in_flight(&self, county_id: Uuid) -> Result<bool, StoreError> {
        let query = SelectQuery::table(JOBS_TABLE)
            .select("id")
            .filter(Filter::eq("county_id", county_id))
            .filter(Filter::any_of("status", &["pending", "running"]))
            .limit(1);
        let rows: Vec<serde_json::Value> = self.client.select_rows(&query).await?;
        Ok(!rows.is_empty())
    }

    async fn enqueue_county_job(&self, county: &County) -> Result<(), StoreError> {
        // Store-side procedure: creates the job and pushes the county's
        // next_scheduled_scrape forward in one evaluation.
        let _: Option<Uuid> = self
            .client
            .rpc("schedule_county_scrape", &json!({ "p_county_id": county.id }))
            .await?;
        Ok(())
    }

    async fn active_nationwide_sources(&self) -> Result<Vec<ScrapeSource>, StoreError> {
        let query = SelectQuery::table(SOURCES_TABLE)
            .filter(Filter::eq("is_active", "true"))
            .filter(Filter::raw("states_covered", "cs.{ALL}"));
        self.client.select_rows(&query).await
    }

    async fn source_job_since(
        &self,
        source_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let query = SelectQuery::table(JOBS_TABLE)
            .select("id")
            .filter(Filter::eq("source_id", source_id))
            .filter(Filter::any_of("status", &["pending", "running"]))
            .filter(Filter::gte("created_at", since.to_rfc3339()))
            .limit(1);
        let rows: Vec<serde_json::Value> = self.client.select_rows(&query).await?;
        Ok(!rows.is_empty())
    }

    async fn enqueue_source_job(
        &self,
        source: &ScrapeSource,
        state_abbr: &str,
    ) -> Result<(), StoreError> {
        let mut job = ScrapeJob::new_pending();
        job.source_id = Some(source.id);
        job.state_abbr = Some(state_abbr.to_string());
        self.client.insert_rows(JOBS_TABLE, &[job], false).await
    }

    async fn stale_running_jobs(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<ScrapeJob>, StoreError> {
        let query = SelectQuery::table(JOBS_TABLE)
            .filter(Filter::eq("status", "running"))
            .filter(Filter::lt("started_at", older_than.to_rfc3339()));
        self.client.select_rows(&query).await
    }

    async fn insert_counties(&self, counties: &[County]) -> Result<(), StoreError> {
        self.client.insert_rows(COUNTIES_TABLE, counties, true).await
    }

    async fn insert_sources(&self, sources: &[ScrapeSource]) -> Result<(), StoreError> {
        self.client.insert_rows(SOURCES_TABLE, sources, true).await
    }
}

#[derive(Default)]
struct MemoryState {
    staged: Vec<StagedLead>,
    production: Vec<ForeclosureLead>,
    jobs: Vec<ScrapeJob>,
    counties: Vec<County>,
    sources: Vec<ScrapeSource>,
    fail_production_inserts: bool,
}

/// In-memory store used by tests and local development. A single mutex
/// serializes all access, so the claim operation is atomic by
/// construction: many concurrent claimers each receive a distinct job.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push_staged(&self, lead: StagedLead) {
        self.state.lock().await.staged.push(lead);
    }

    pub async fn push_production(&self, lead: ForeclosureLead) {
        self.state.lock().await.production.push(lead);
    }

    pub async fn push_job(&self, job: ScrapeJob) {
        self.state.lock().await.jobs.push(job);
    }

    pub async fn push_county(&self, county: County) {
        self.state.lock().await.counties.push(county);
    }

    pub async fn push_source(&self, source: ScrapeSource) {
        self.state.lock().await.sources.push(source);
    }

    /// Make production inserts fail, to exercise error paths.
    pub async fn set_fail_production_inserts(&self, fail: bool) {
        self.state.lock().await.fail_production_inserts = fail;
    }

    pub async fn staged(&self) -> Vec<StagedLead> {
        self.state.lock().await.staged.clone()
    }

    pub async fn production(&self) -> Vec<ForeclosureLead> {
        self.state.lock().await.production.clone()
    }

    pub async fn jobs(&self) -> Vec<ScrapeJob> {
        self.state.lock().await.jobs.clone()
    }

    pub async fn counties(&self) -> Vec<County> {
        self.state.lock().await.counties.clone()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn fetch_unimported(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StagedLead>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .staged
            .iter()
            .filter(|lead| !lead.imported)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count_unimported(&self) -> Result<u64, StoreError> {
        let state = self.state.lock().await;
        Ok(state.staged.iter().filter(|lead| !lead.imported).count() as u64)
    }

    async fn production_exists(
        &self,
        property_address: &str,
        state_abbr: &str,
    ) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        Ok(state.production.iter().any(|lead| {
            lead.property_address.as_deref() == Some(property_address)
                && lead.state_abbr.as_deref() == Some(state_abbr)
        }))
    }

    async fn insert_production(&self, lead: &ForeclosureLead) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.fail_production_inserts {
            return Err(StoreError::Message("simulated insert failure".to_string()));
        }
        state.production.push(lead.clone());
        Ok(())
    }

    async fn update_staging(&self, id: Uuid, patch: &StagingPatch) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        for lead in state.staged.iter_mut().filter(|lead| lead.id == id) {
            if let Some(score) = patch.quality_score {
                lead.quality_score = Some(score);
            }
            if let Some(notes) = &patch.validation_notes {
                lead.validation_notes = Some(notes.clone());
            }
            if let Some(imported) = patch.imported {
                lead.imported = imported;
            }
            if let Some(imported_at) = patch.imported_at {
                lead.imported_at = Some(imported_at);
            }
        }
        Ok(())
    }

    async fn claim_next_job(&self, worker_id: &str) -> Result<Option<Uuid>, StoreError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut claimable: Vec<usize> = state
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, job)| {
                job.status == JobStatus::Pending
                    && job.next_retry_at.map_or(true, |at| at <= now)
            })
            .map(|(i, _)| i)
            .collect();
        claimable.sort_by_key(|&i| {
            let job = &state.jobs[i];
            (
                job.priority,
                job.next_retry_at.or(job.created_at).unwrap_or(now),
            )
        });
        let Some(&index) = claimable.first() else {
            return Ok(None);
        };
        let job = &mut state.jobs[index];
        job.status = JobStatus::Running;
        job.worker_id = Some(worker_id.to_string());
        job.started_at = Some(now);
        Ok(Some(job.id))
    }

    async fn load_job(&self, id: Uuid) -> Result<Option<JobDetail>, StoreError> {
        let state = self.state.lock().await;
        let Some(job) = state.jobs.iter().find(|job| job.id == id).cloned() else {
            return Ok(None);
        };
        let source = job
            .source_id
            .and_then(|sid| state.sources.iter().find(|s| s.id == sid));
        let county_name = job
            .county_id
            .and_then(|cid| state.counties.iter().find(|c| c.id == cid))
            .map(|c| c.name.clone());
        Ok(Some(JobDetail {
            scraper_name: source.and_then(|s| s.scraper_name.clone()),
            source_name: source.map(|s| s.name.clone()),
            base_url: source.and_then(|s| s.base_url.clone()),
            county_name,
            job,
        }))
    }

    async fn find_production_by_id(
        &self,
        id: &str,
    ) -> Result<Option<ForeclosureLead>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .production
            .iter()
            .find(|lead| lead.id.as_deref() == Some(id))
            .cloned())
    }

    async fn patch_production(&self, id: &str, refresh: &LeadRefresh) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        for lead in state
            .production
            .iter_mut()
            .filter(|lead| lead.id.as_deref() == Some(id))
        {
            if let Some(sale_date) = &refresh.sale_date {
                lead.sale_date = Some(sale_date.clone());
            }
            if let Some(sale_amount) = refresh.sale_amount {
                lead.sale_amount = Some(sale_amount);
            }
            if let Some(source) = &refresh.source {
                lead.source = Some(source.clone());
            }
            if let Some(batch_id) = &refresh.batch_id {
                lead.batch_id = Some(batch_id.clone());
            }
            if let Some(last_updated) = refresh.last_updated {
                lead.last_updated = Some(last_updated);
            }
        }
        Ok(())
    }

    async fn complete_job(&self, id: Uuid, counts: JobCounts) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        for job in state.jobs.iter_mut().filter(|job| job.id == id) {
            job.status = JobStatus::Completed;
            job.completed_at = Some(Utc::now());
            job.leads_found = counts.leads_found;
            job.leads_new = counts.leads_new;
            job.leads_updated = counts.leads_updated;
        }
        Ok(())
    }

    async fn requeue_job(
        &self,
        id: Uuid,
        attempt_number: i32,
        next_retry_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        for job in state.jobs.iter_mut().filter(|job| job.id == id) {
            job.status = JobStatus::Pending;
            job.attempt_number = attempt_number;
            job.next_retry_at = Some(next_retry_at);
            job.error_message = Some(error.to_string());
            job.worker_id = None;
        }
        Ok(())
    }

    async fn fail_job(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        for job in state.jobs.iter_mut().filter(|job| job.id == id) {
            job.status = JobStatus::Failed;
            job.completed_at = Some(Utc::now());
            job.error_message = Some(error.to_string());
        }
        Ok(())
    }

    async fn record_county_success(
        &self,
        county_id: Uuid,
        new_leads: i64,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        for county in state.counties.iter_mut().filter(|c| c.id == county_id) {
            county.last_scraped_at = Some(now);
            county.last_successful_scrape = Some(now);
            county.consecutive_failures = 0;
            county.total_leads_found += new_leads;
        }
        Ok(())
    }

    async fn record_county_failure(&self, county_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        for county in state.counties.iter_mut().filter(|c| c.id == county_id) {
            county.last_scraped_at = Some(Utc::now());
            county.consecutive_failures += 1;
        }
        Ok(())
    }

    async fn due_counties(&self, limit: usize) -> Result<Vec<County>, StoreError> {
        let state = self.state.lock().await;
        let now = Utc::now();
        Ok(state
            .counties
            .iter()
            .filter(|county| {
                county.is_active
                    && county.has_online_records
                    && county.consecutive_failures < fslp_core::COUNTY_FAILURE_THRESHOLD
                    && county.next_scheduled_scrape.map_or(true, |at| at <= now)
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn county_job_in_flight(&self, county_id: Uuid) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        Ok(state.jobs.iter().any(|job| {
            job.county_id == Some(county_id)
                && matches!(job.status, JobStatus::Pending | JobStatus::Running)
        }))
    }

    async fn enqueue_county_job(&self, county: &County) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let mut job = ScrapeJob::new_pending();
        job.county_id = Some(county.id);
        job.state_abbr = Some(county.state_abbr.clone());
        state.jobs.push(job);
        let next = Utc::now() + ChronoDuration::hours(county.scrape_frequency_hours);
        for row in state.counties.iter_mut().filter(|c| c.id == county.id) {
            row.next_scheduled_scrape = Some(next);
        }
        Ok(())
    }

    async fn active_nationwide_sources(&self) -> Result<Vec<ScrapeSource>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .sources
            .iter()
            .filter(|source| source.is_active && source.is_nationwide())
            .cloned()
            .collect())
    }

    async fn source_job_since(
        &self,
        source_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        Ok(state.jobs.iter().any(|job| {
            job.source_id == Some(source_id)
                && matches!(job.status, JobStatus::Pending | JobStatus::Running)
                && job.created_at.map_or(false, |at| at >= since)
        }))
    }

    async fn enqueue_source_job(
        &self,
        source: &ScrapeSource,
        state_abbr: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let mut job = ScrapeJob::new_pending();
        job.source_id = Some(source.id);
        job.state_abbr = Some(state_abbr.to_string());
        state.jobs.push(job);
        Ok(())
    }

    async fn stale_running_jobs(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<ScrapeJob>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .iter()
            .filter(|job| {
                job.status == JobStatus::Running
                    && job.started_at.map_or(false, |at| at < older_than)
            })
            .cloned()
            .collect())
    }

    async fn insert_counties(&self, counties: &[County]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.counties.extend_from_slice(counties);
        Ok(())
    }

    async fn insert_sources(&self, sources: &[ScrapeSource]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.sources.extend_from_slice(sources);
        Ok(())
    }
}

/// Browser-alike user agents rotated across page fetches.
pub const DEFAULT_USER_AGENTS: [&str; 5] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
];

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub timeout: Duration,
    pub user_agents: Vec<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub pacing: PacingConfig,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agents: DEFAULT_USER_AGENTS.iter().map(|s| s.to_string()).collect(),
            global_concurrency: 8,
            per_source_concurrency: 2,
            backoff: BackoffPolicy::default(),
            pacing: PacingConfig {
                min_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(3),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedPage {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Page fetcher for scraper adapters: global + per-source concurrency
/// limits, randomized pacing between requests, rotating user agents,
/// and retry with backoff on transient failures.
#[derive(Debug)]
pub struct PageFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    user_agents: Vec<String>,
    backoff: BackoffPolicy,
    pacing: PacingConfig,
}

impl PageFetcher {
    pub fn new(config: FetchConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building fetch client")?;
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            user_agents: config.user_agents,
            backoff: config.backoff,
            pacing: config.pacing,
        })
    }

    async fn per_source_semaphore(&self, source: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    fn pick_user_agent(&self) -> Option<String> {
        if self.user_agents.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..self.user_agents.len());
        Some(self.user_agents[index].clone())
    }

    pub async fn fetch(&self, source: &str, url: &str) -> Result<FetchedPage, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        self.pacing.pause().await;

        let span = info_span!("page_fetch", source, url);
        let _guard = span.enter();

        let user_agent = self.pick_user_agent();
        let mut last_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let mut request = self.client.get(url);
            if let Some(ua) = &user_agent {
                request = request.header(USER_AGENT, ua);
            }
            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedPage {
                            status,
                            final_url,
                            body,
                        });
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_transport_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(attempt, error = %err, "page fetch retry");
                        last_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_error.expect("retry loop captures a transport error"),
        ))
    }
}
