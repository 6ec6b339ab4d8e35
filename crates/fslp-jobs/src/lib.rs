//! Scrape job scheduling and execution.
//!
//! The scheduler and workers are independent processes that coordinate
//! only through the record store: the scheduler enqueues job rows, and
//! each worker claims one job at a time through the store's atomic
//! claim operation. Idempotency comes from content-fingerprint upserts,
//! not from delivery guarantees.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use fslp_adapters::{scraper_for_name, LeadScraper, ScrapeOutcome, ScraperParams};
use fslp_core::{state_codes, ForeclosureLead, JobCounts, JobDetail, LeadRefresh, ScrapeJob};
use fslp_store::{PageFetcher, RecordStore, StoreError};

pub const CRATE_NAME: &str = "fslp-jobs";

/// Retry delay after the k-th failed attempt: 60 * 2^k seconds.
pub fn retry_delay_seconds(attempt_number: i32) -> i64 {
    let exponent = attempt_number.clamp(0, 20) as u32;
    60 * 2i64.pow(exponent)
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub poll_interval: Duration,
    pub error_backoff: Duration,
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self {
            worker_id: std::env::var("FSLP_WORKER_ID")
                .unwrap_or_else(|_| format!("worker-{}", std::process::id())),
            poll_interval: env_secs("FSLP_POLL_INTERVAL_SECS", 10),
            error_backoff: env_secs("FSLP_ERROR_BACKOFF_SECS", 30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    pub error_backoff: Duration,
    pub county_batch: usize,
    pub states_per_source: usize,
    pub source_window: Duration,
    pub stale_after: Duration,
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        Self {
            tick_interval: env_secs("FSLP_SCHEDULER_INTERVAL_SECS", 300),
            error_backoff: env_secs("FSLP_SCHEDULER_ERROR_BACKOFF_SECS", 60),
            county_batch: 100,
            states_per_source: 10,
            source_window: Duration::from_secs(24 * 3600),
            stale_after: env_secs("FSLP_JOB_STALE_SECS", 30 * 60),
        }
    }
}

fn env_secs(var: &str, default: u64) -> Duration {
    Duration::from_secs(
        std::env::var(var)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default),
    )
}

/// Route a failed execution through the retry/backoff policy: requeue
/// with exponential delay while attempts remain, otherwise fail
/// terminally and feed the county circuit breaker.
pub async fn route_job_failure(
    store: &dyn RecordStore,
    job: &ScrapeJob,
    error: &str,
) -> Result<(), StoreError> {
    if job.attempts_remaining() {
        let delay = retry_delay_seconds(job.attempt_number);
        let next_retry_at = Utc::now() + ChronoDuration::seconds(delay);
        store
            .requeue_job(job.id, job.attempt_number + 1, next_retry_at, error)
            .await?;
        info!(job_id = %job.id, delay_seconds = delay, "job scheduled for retry");
    } else {
        store.fail_job(job.id, error).await?;
        if let Some(county_id) = job.county_id {
            store.record_county_failure(county_id).await?;
        }
        warn!(job_id = %job.id, error, "job failed terminally");
    }
    Ok(())
}

pub type ScraperResolver =
    Arc<dyn Fn(Option<&str>, ScraperParams) -> Box<dyn LeadScraper> + Send + Sync>;

/// Claims and executes scrape jobs until told to shut down.
pub struct Worker {
    store: Arc<dyn RecordStore>,
    http: Arc<PageFetcher>,
    config: WorkerConfig,
    resolver: ScraperResolver,
}

impl Worker {
    pub fn new(store: Arc<dyn RecordStore>, http: Arc<PageFetcher>, config: WorkerConfig) -> Self {
        Self {
            store,
            http,
            config,
            resolver: Arc::new(|name, params| scraper_for_name(name, params)),
        }
    }

    /// Substitute the scraper registry, for tests.
    pub fn with_resolver(mut self, resolver: ScraperResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(worker_id = %self.config.worker_id, "starting job worker");

        while !*shutdown.borrow() {
            match self.store.claim_next_job(&self.config.worker_id).await {
                Ok(Some(job_id)) => {
                    if let Err(err) = self.process_job(job_id).await {
                        error!(error = %err, %job_id, "job processing error");
                        idle(&mut shutdown, self.config.error_backoff).await;
                    }
                }
                Ok(None) => idle(&mut shutdown, self.config.poll_interval).await,
                Err(err) => {
                    error!(error = %err, "claiming next job failed");
                    idle(&mut shutdown, self.config.error_backoff).await;
                }
            }
        }

        info!(worker_id = %self.config.worker_id, "job worker stopped");
        Ok(())
    }

    async fn process_job(&self, job_id: Uuid) -> Result<()> {
        let Some(detail) = self.store.load_job(job_id).await? else {
            error!(%job_id, "claimed job not found");
            return Ok(());
        };

        let params = ScraperParams {
            state_abbr: detail.job.state_abbr.clone(),
            county_id: detail.job.county_id,
            county_name: detail.county_name.clone(),
            listing_url: detail.base_url.clone(),
            batch_id: ScraperParams::new_batch_id(),
        };
        let scraper = (self.resolver)(detail.scraper_name.as_deref(), params);
        info!(
            %job_id,
            scraper = scraper.name(),
            state = detail.job.state_abbr.as_deref().unwrap_or("-"),
            county = detail.county_name.as_deref().unwrap_or("-"),
            "executing scraper"
        );

        // The adapter runs in its own task so that even a panic inside
        // it lands on the failure path instead of killing the worker.
        let http = self.http.clone();
        let handle = tokio::spawn(async move { scraper.scrape(&http).await });

        match handle.await {
            Ok(Ok(outcome)) => self.record_success(&detail, outcome).await?,
            Ok(Err(err)) => route_job_failure(self.store.as_ref(), &detail.job, &err.to_string()).await?,
            Err(join_err) => {
                route_job_failure(
                    self.store.as_ref(),
                    &detail.job,
                    &format!("scraper panicked: {join_err}"),
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn record_success(
        &self,
        detail: &JobDetail,
        outcome: ScrapeOutcome,
    ) -> Result<(), StoreError> {
        let found = outcome.leads.len() as i64;
        let (new, updated) = self.persist_leads(&outcome.leads).await;

        self.store
            .complete_job(
                detail.job.id,
                JobCounts {
                    leads_found: found,
                    leads_new: new,
                    leads_updated: updated,
                },
            )
            .await?;

        if found > 0 {
            if let Some(county_id) = detail.job.county_id {
                self.store.record_county_success(county_id, new).await?;
            }
        }

        info!(
            job_id = %detail.job.id,
            found,
            new,
            updated,
            pages = outcome.pages_scraped,
            duration_seconds = outcome.duration_seconds,
            "job completed"
        );
        Ok(())
    }

    /// Upsert keyed by content fingerprint: an existing row gets only
    /// its mutable fields refreshed, a new row is inserted in full.
    /// Per-lead failures are logged and skipped.
    async fn persist_leads(&self, leads: &[fslp_core::NormalizedLead]) -> (i64, i64) {
        let mut new = 0i64;
        let mut updated = 0i64;
        let now = Utc::now();

        for lead in leads {
            let id = lead.fingerprint();
            let result = match self.store.find_production_by_id(&id).await {
                Ok(Some(_)) => {
                    let refresh = LeadRefresh {
                        sale_date: lead.sale_date.clone(),
                        sale_amount: lead.sale_amount,
                        source: Some(lead.source.clone()),
                        batch_id: Some(lead.batch_id.clone()),
                        last_updated: Some(now),
                    };
                    self.store
                        .patch_production(&id, &refresh)
                        .await
                        .map(|()| updated += 1)
                }
                Ok(None) => {
                    let row = ForeclosureLead::from_normalized(lead);
                    self.store
                        .insert_production(&row)
                        .await
                        .map(|()| new += 1)
                }
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                warn!(error = %err, lead_id = %id, "failed to save lead");
            }
        }

        (new, updated)
    }
}

async fn idle(shutdown: &mut watch::Receiver<bool>, duration: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = shutdown.changed() => {}
    }
}

/// Enqueues due county and nationwide-source jobs on a fixed interval,
/// and requeues jobs orphaned in `running` by a dead worker.
pub struct Scheduler {
    store: Arc<dyn RecordStore>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(store: Arc<dyn RecordStore>, config: SchedulerConfig) -> Self {
        Self { store, config }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("starting job scheduler");

        while !*shutdown.borrow() {
            let pause = match self.tick().await {
                Ok(()) => self.config.tick_interval,
                Err(err) => {
                    error!(error = %err, "scheduler tick failed");
                    self.config.error_backoff
                }
            };
            idle(&mut shutdown, pause).await;
        }

        info!("job scheduler stopped");
        Ok(())
    }

    pub async fn tick(&self) -> Result<()> {
        self.reap_stale_jobs().await?;
        self.schedule_due_counties().await?;
        self.schedule_nationwide_sources().await?;
        Ok(())
    }

    async fn schedule_due_counties(&self) -> Result<()> {
        let counties = self.store.due_counties(self.config.county_batch).await?;
        for county in counties {
            // Skip counties with a job already pending or running, so a
            // slow scrape does not pile up duplicates.
            if self.store.county_job_in_flight(county.id).await? {
                continue;
            }
            self.store.enqueue_county_job(&county).await?;
            debug!(county = %county.name, state = %county.state_abbr, "scheduled county scrape");
        }
        Ok(())
    }

    async fn schedule_nationwide_sources(&self) -> Result<()> {
        let since = Utc::now() - ChronoDuration::seconds(self.config.source_window.as_secs() as i64);
        for source in self.store.active_nationwide_sources().await? {
            if self.store.source_job_since(source.id, since).await? {
                continue;
            }
            // Bounded fan-out per tick; remaining states pick up on the
            // next pass once these jobs drain.
            for state in state_codes().take(self.config.states_per_source) {
                self.store.enqueue_source_job(&source, state).await?;
            }
            info!(source = %source.name, states = self.config.states_per_source, "scheduled nationwide source");
        }
        Ok(())
    }

    async fn reap_stale_jobs(&self) -> Result<()> {
        let cutoff = Utc::now() - ChronoDuration::seconds(self.config.stale_after.as_secs() as i64);
        for job in self.store.stale_running_jobs(cutoff).await? {
            warn!(job_id = %job.id, worker = job.worker_id.as_deref().unwrap_or("-"), "requeueing stale running job");
            route_job_failure(
                self.store.as_ref(),
                &job,
                "worker lost: job stale in running state",
            )
            .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fslp_adapters::{ScrapeError, ScrapeOutcome};
    use fslp_core::{County, JobStatus, NormalizedLead, ScrapeSource, SourceType};
    use fslp_store::{FetchConfig, MemoryStore};

    fn sample_lead(address: &str) -> NormalizedLead {
        NormalizedLead {
            source: "stub".to_string(),
            source_type: SourceType::CountySurplus,
            batch_id: "20240301_120000".to_string(),
            property_address: address.to_string(),
            city: None,
            state_abbr: "TX".to_string(),
            zip_code: None,
            parcel_id: None,
            county: Some("Harris".to_string()),
            owner_name: "Jane Doe".to_string(),
            owner_address: None,
            case_number: Some("2024-TX-1".to_string()),
            sale_date: Some("2024-02-01".to_string()),
            sale_amount: Some(100_000.0),
            opening_bid: None,
            overage_amount: Some(12_000.0),
            lender_name: None,
            trustee_name: None,
            foreclosure_type: None,
            source_url: None,
            scraped_at: Utc::now(),
        }
    }

    struct StubScraper {
        leads: Vec<NormalizedLead>,
        fail: bool,
    }

    #[async_trait]
    impl LeadScraper for StubScraper {
        fn name(&self) -> &'static str {
            "stub"
        }

        fn source_type(&self) -> SourceType {
            SourceType::CountySurplus
        }

        async fn scrape(&self, _http: &PageFetcher) -> Result<ScrapeOutcome, ScrapeError> {
            if self.fail {
                return Err(ScrapeError::Message("site unreachable".to_string()));
            }
            Ok(ScrapeOutcome {
                leads: self.leads.clone(),
                pages_scraped: 1,
                duration_seconds: 0.1,
                source_url: None,
            })
        }

        fn parse_listing(&self, _fragment: &str) -> Option<NormalizedLead> {
            None
        }
    }

    fn stub_resolver(leads: Vec<NormalizedLead>, fail: bool) -> ScraperResolver {
        Arc::new(move |_name, _params| {
            Box::new(StubScraper {
                leads: leads.clone(),
                fail,
            })
        })
    }

    fn test_worker(store: Arc<MemoryStore>, resolver: ScraperResolver) -> Worker {
        let http = Arc::new(PageFetcher::new(FetchConfig::default()).unwrap());
        let config = WorkerConfig {
            worker_id: "test-worker".to_string(),
            poll_interval: Duration::from_millis(10),
            error_backoff: Duration::from_millis(10),
        };
        Worker::new(store, http, config).with_resolver(resolver)
    }

    fn county(failures: i32) -> County {
        County {
            id: Uuid::new_v4(),
            name: "Harris".to_string(),
            state_abbr: "TX".to_string(),
            is_active: true,
            has_online_records: true,
            consecutive_failures: failures,
            scrape_frequency_hours: 24,
            next_scheduled_scrape: None,
            last_scraped_at: None,
            last_successful_scrape: None,
            total_leads_found: 0,
        }
    }

    fn nationwide_source() -> ScrapeSource {
        ScrapeSource {
            id: Uuid::new_v4(),
            name: "Auction Aggregator".to_string(),
            scraper_name: Some("auction-list".to_string()),
            source_type: Some(SourceType::Aggregator),
            base_url: Some("https://auctions.example.com".to_string()),
            states_covered: vec!["ALL".to_string()],
            is_active: true,
            rate_limit: 10,
        }
    }

    fn scheduler_config() -> SchedulerConfig {
        SchedulerConfig {
            tick_interval: Duration::from_secs(300),
            error_backoff: Duration::from_secs(60),
            county_batch: 100,
            states_per_source: 10,
            source_window: Duration::from_secs(24 * 3600),
            stale_after: Duration::from_secs(30 * 60),
        }
    }

    #[test]
    fn retry_delays_double_per_attempt() {
        assert_eq!(retry_delay_seconds(0), 60);
        assert_eq!(retry_delay_seconds(1), 120);
        assert_eq!(retry_delay_seconds(2), 240);
        assert!(retry_delay_seconds(3) > retry_delay_seconds(2));
    }

    #[tokio::test]
    async fn successful_job_counts_new_and_updated_separately() {
        let store = Arc::new(MemoryStore::new());
        let harris = county(3);
        let county_id = harris.id;
        store.push_county(harris).await;

        let existing = sample_lead("1 KNOWN RD");
        store
            .push_production(ForeclosureLead::from_normalized(&existing))
            .await;

        let mut job = ScrapeJob::new_pending();
        job.county_id = Some(county_id);
        job.state_abbr = Some("TX".to_string());
        store.push_job(job).await;

        let leads = vec![existing.clone(), sample_lead("2 NEW ST")];
        let worker = test_worker(store.clone(), stub_resolver(leads, false));

        let job_id = store.claim_next_job("test-worker").await.unwrap().unwrap();
        worker.process_job(job_id).await.unwrap();

        let jobs = store.jobs().await;
        assert_eq!(jobs[0].status, JobStatus::Completed);
        assert_eq!(jobs[0].leads_found, 2);
        assert_eq!(jobs[0].leads_new, 1);
        assert_eq!(jobs[0].leads_updated, 1);
        assert_eq!(store.production().await.len(), 2);

        let counties = store.counties().await;
        assert_eq!(counties[0].consecutive_failures, 0);
        assert_eq!(counties[0].total_leads_found, 1);
        assert!(counties[0].last_successful_scrape.is_some());
    }

    #[tokio::test]
    async fn refresh_touches_only_mutable_fields() {
        let store = Arc::new(MemoryStore::new());
        let lead = sample_lead("1 KNOWN RD");
        let mut row = ForeclosureLead::from_normalized(&lead);
        row.primary_phone = Some("555-0100".to_string());
        row.apn_number = Some("123-456-789".to_string());
        store.push_production(row).await;

        let mut rescraped = lead.clone();
        rescraped.sale_amount = Some(110_000.0);
        rescraped.batch_id = "20240401_120000".to_string();

        let mut job = ScrapeJob::new_pending();
        job.state_abbr = Some("TX".to_string());
        store.push_job(job).await;

        let worker = test_worker(store.clone(), stub_resolver(vec![rescraped], false));
        let job_id = store.claim_next_job("test-worker").await.unwrap().unwrap();
        worker.process_job(job_id).await.unwrap();

        let production = store.production().await;
        assert_eq!(production.len(), 1);
        let updated = &production[0];
        assert_eq!(updated.sale_amount, Some(110_000.0));
        assert_eq!(updated.batch_id.as_deref(), Some("20240401_120000"));
        assert!(updated.last_updated.is_some());
        // Enrichment fields survive the re-scrape untouched.
        assert_eq!(updated.primary_phone.as_deref(), Some("555-0100"));
        assert_eq!(updated.apn_number.as_deref(), Some("123-456-789"));
    }

    #[tokio::test]
    async fn failed_job_requeues_with_exponential_backoff() {
        let store = Arc::new(MemoryStore::new());
        let mut job = ScrapeJob::new_pending();
        job.state_abbr = Some("TX".to_string());
        store.push_job(job).await;

        let worker = test_worker(store.clone(), stub_resolver(Vec::new(), true));
        let job_id = store.claim_next_job("test-worker").await.unwrap().unwrap();
        let before = Utc::now();
        worker.process_job(job_id).await.unwrap();

        let jobs = store.jobs().await;
        assert_eq!(jobs[0].status, JobStatus::Pending);
        assert_eq!(jobs[0].attempt_number, 1);
        assert_eq!(jobs[0].error_message.as_deref(), Some("site unreachable"));
        let retry_at = jobs[0].next_retry_at.unwrap();
        let delta = (retry_at - before).num_seconds();
        assert!((55..=70).contains(&delta), "unexpected backoff {delta}s");
    }

    #[tokio::test]
    async fn exhausted_attempts_fail_terminally_and_trip_the_breaker() {
        let store = Arc::new(MemoryStore::new());
        let harris = county(2);
        let county_id = harris.id;
        store.push_county(harris).await;

        let mut job = ScrapeJob::new_pending();
        job.county_id = Some(county_id);
        job.attempt_number = 3;
        store.push_job(job).await;

        let worker = test_worker(store.clone(), stub_resolver(Vec::new(), true));
        let job_id = store.claim_next_job("test-worker").await.unwrap().unwrap();
        worker.process_job(job_id).await.unwrap();

        let jobs = store.jobs().await;
        assert_eq!(jobs[0].status, JobStatus::Failed);
        assert!(jobs[0].completed_at.is_some());
        assert_eq!(store.counties().await[0].consecutive_failures, 3);
    }

    #[tokio::test]
    async fn scheduler_skips_counties_past_failure_threshold() {
        let store = Arc::new(MemoryStore::new());
        store.push_county(county(5)).await;
        store.push_county(county(4)).await;

        let scheduler = Scheduler::new(store.clone(), scheduler_config());
        scheduler.tick().await.unwrap();

        let jobs = store.jobs().await;
        assert_eq!(jobs.len(), 1, "only the healthy county is scheduled");
    }

    #[tokio::test]
    async fn scheduler_does_not_stack_jobs_for_one_county() {
        let store = Arc::new(MemoryStore::new());
        store.push_county(county(0)).await;

        let scheduler = Scheduler::new(store.clone(), scheduler_config());
        scheduler.tick().await.unwrap();
        scheduler.tick().await.unwrap();

        assert_eq!(store.jobs().await.len(), 1);
    }

    #[tokio::test]
    async fn nationwide_sources_fan_out_bounded_and_once_per_window() {
        let store = Arc::new(MemoryStore::new());
        store.push_source(nationwide_source()).await;

        let scheduler = Scheduler::new(store.clone(), scheduler_config());
        scheduler.tick().await.unwrap();

        let jobs = store.jobs().await;
        assert_eq!(jobs.len(), 10);
        assert!(jobs.iter().all(|j| j.source_id.is_some()));
        assert!(jobs.iter().all(|j| j.state_abbr.is_some()));

        scheduler.tick().await.unwrap();
        assert_eq!(store.jobs().await.len(), 10, "window not yet elapsed");
    }

    #[tokio::test]
    async fn reaper_requeues_jobs_stuck_in_running() {
        let store = Arc::new(MemoryStore::new());
        let mut stale = ScrapeJob::new_pending();
        stale.status = JobStatus::Running;
        stale.worker_id = Some("dead-worker".to_string());
        stale.started_at = Some(Utc::now() - ChronoDuration::hours(2));
        store.push_job(stale).await;

        let mut fresh = ScrapeJob::new_pending();
        fresh.status = JobStatus::Running;
        fresh.started_at = Some(Utc::now());
        let fresh_id = fresh.id;
        store.push_job(fresh).await;

        let scheduler = Scheduler::new(store.clone(), scheduler_config());
        scheduler.tick().await.unwrap();

        let jobs = store.jobs().await;
        let stale_after = jobs.iter().find(|j| j.id != fresh_id).unwrap();
        assert_eq!(stale_after.status, JobStatus::Pending);
        assert_eq!(stale_after.attempt_number, 1);
        assert!(stale_after.next_retry_at.is_some());

        let fresh_after = jobs.iter().find(|j| j.id == fresh_id).unwrap();
        assert_eq!(fresh_after.status, JobStatus::Running);
    }
}
