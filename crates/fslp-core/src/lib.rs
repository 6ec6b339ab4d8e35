//! Core domain model for FSLP: lead records, scrape jobs, counties, sources.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fslp-core";

/// Lifecycle state of a queued scrape job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

/// Kind of data source a lead was scraped from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    CountySurplus,
    TrusteeSale,
    Auction,
    TaxLien,
    SheriffSale,
    HudForeclosure,
    Reo,
    Preforeclosure,
    Aggregator,
    #[serde(other)]
    Other,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceType::CountySurplus => "county_surplus",
            SourceType::TrusteeSale => "trustee_sale",
            SourceType::Auction => "auction",
            SourceType::TaxLien => "tax_lien",
            SourceType::SheriffSale => "sheriff_sale",
            SourceType::HudForeclosure => "hud_foreclosure",
            SourceType::Reo => "reo",
            SourceType::Preforeclosure => "preforeclosure",
            SourceType::Aggregator => "aggregator",
            SourceType::Other => "other",
        }
    }

    /// Production-side foreclosure classification for this source kind.
    /// Unrecognized kinds fall through to "other".
    pub fn foreclosure_type(self) -> &'static str {
        match self {
            SourceType::CountySurplus => "tax-sale-overage",
            SourceType::TrusteeSale => "trustee-sale-overage",
            SourceType::Auction => "auction",
            SourceType::TaxLien => "tax-lien",
            SourceType::SheriffSale => "sheriff-sale",
            SourceType::HudForeclosure => "hud-foreclosure",
            SourceType::Reo => "bank-owned",
            SourceType::Preforeclosure => "pre-foreclosure",
            SourceType::Aggregator | SourceType::Other => "other",
        }
    }

    /// Sources whose records come from official money lists rather than
    /// aggregated listings.
    pub fn is_high_value(self) -> bool {
        matches!(self, SourceType::CountySurplus | SourceType::TrusteeSale)
    }
}

/// How a state runs foreclosures; drives downstream outreach timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ForeclosureRegime {
    Judicial,
    NonJudicial,
    Both,
}

/// Two-letter code, display name, foreclosure regime.
pub const US_STATES: [(&str, &str, ForeclosureRegime); 51] = [
    ("AL", "Alabama", ForeclosureRegime::NonJudicial),
    ("AK", "Alaska", ForeclosureRegime::NonJudicial),
    ("AZ", "Arizona", ForeclosureRegime::NonJudicial),
    ("AR", "Arkansas", ForeclosureRegime::Both),
    ("CA", "California", ForeclosureRegime::NonJudicial),
    ("CO", "Colorado", ForeclosureRegime::NonJudicial),
    ("CT", "Connecticut", ForeclosureRegime::Judicial),
    ("DE", "Delaware", ForeclosureRegime::Judicial),
    ("DC", "District of Columbia", ForeclosureRegime::NonJudicial),
    ("FL", "Florida", ForeclosureRegime::Judicial),
    ("GA", "Georgia", ForeclosureRegime::NonJudicial),
    ("HI", "Hawaii", ForeclosureRegime::Both),
    ("ID", "Idaho", ForeclosureRegime::NonJudicial),
    ("IL", "Illinois", ForeclosureRegime::Judicial),
    ("IN", "Indiana", ForeclosureRegime::Judicial),
    ("IA", "Iowa", ForeclosureRegime::Both),
    ("KS", "Kansas", ForeclosureRegime::Judicial),
    ("KY", "Kentucky", ForeclosureRegime::Judicial),
    ("LA", "Louisiana", ForeclosureRegime::Judicial),
    ("ME", "Maine", ForeclosureRegime::Judicial),
    ("MD", "Maryland", ForeclosureRegime::Both),
    ("MA", "Massachusetts", ForeclosureRegime::NonJudicial),
    ("MI", "Michigan", ForeclosureRegime::NonJudicial),
    ("MN", "Minnesota", ForeclosureRegime::NonJudicial),
    ("MS", "Mississippi", ForeclosureRegime::NonJudicial),
    ("MO", "Missouri", ForeclosureRegime::NonJudicial),
    ("MT", "Montana", ForeclosureRegime::NonJudicial),
    ("NE", "Nebraska", ForeclosureRegime::Both),
    ("NV", "Nevada", ForeclosureRegime::NonJudicial),
    ("NH", "New Hampshire", ForeclosureRegime::NonJudicial),
    ("NJ", "New Jersey", ForeclosureRegime::Judicial),
    ("NM", "New Mexico", ForeclosureRegime::Judicial),
    ("NY", "New York", ForeclosureRegime::Judicial),
    ("NC", "North Carolina", ForeclosureRegime::NonJudicial),
    ("ND", "North Dakota", ForeclosureRegime::Both),
    ("OH", "Ohio", ForeclosureRegime::Judicial),
    ("OK", "Oklahoma", ForeclosureRegime::Both),
    ("OR", "Oregon", ForeclosureRegime::NonJudicial),
    ("PA", "Pennsylvania", ForeclosureRegime::Judicial),
    ("RI", "Rhode Island", ForeclosureRegime::NonJudicial),
    ("SC", "South Carolina", ForeclosureRegime::Judicial),
    ("SD", "South Dakota", ForeclosureRegime::Both),
    ("TN", "Tennessee", ForeclosureRegime::NonJudicial),
    ("TX", "Texas", ForeclosureRegime::NonJudicial),
    ("UT", "Utah", ForeclosureRegime::NonJudicial),
    ("VT", "Vermont", ForeclosureRegime::Judicial),
    ("VA", "Virginia", ForeclosureRegime::NonJudicial),
    ("WA", "Washington", ForeclosureRegime::NonJudicial),
    ("WV", "West Virginia", ForeclosureRegime::NonJudicial),
    ("WI", "Wisconsin", ForeclosureRegime::Judicial),
    ("WY", "Wyoming", ForeclosureRegime::NonJudicial),
];

pub fn is_valid_state_code(code: &str) -> bool {
    let code = code.trim();
    code.len() == 2
        && US_STATES
            .iter()
            .any(|(abbr, _, _)| abbr.eq_ignore_ascii_case(code))
}

pub fn state_codes() -> impl Iterator<Item = &'static str> {
    US_STATES.iter().map(|(abbr, _, _)| *abbr)
}

/// Content-derived identity for a lead: first 16 hex chars of
/// SHA-256 over `address|state|owner|sale_date`. Two scrapes of the
/// same sale collapse onto one production row through this key.
pub fn lead_fingerprint(
    property_address: &str,
    state_abbr: &str,
    owner_name: &str,
    sale_date: Option<&str>,
) -> String {
    let unique = format!(
        "{}|{}|{}|{}",
        property_address,
        state_abbr,
        owner_name,
        sale_date.unwrap_or("")
    );
    let mut hasher = Sha256::new();
    hasher.update(unique.as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}

/// Row in the `scraped_leads` staging table. Written by scraper
/// adapters, mutated only by the importer, never deleted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StagedLead {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_abbr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zip_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub county: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sale_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sale_amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opening_bid: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closing_bid: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overage_amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trustee_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<SourceType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(default)]
    pub imported: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imported_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scraped_at: Option<DateTime<Utc>>,
}

/// Normalized handoff contract from scraper adapters into persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedLead {
    pub source: String,
    pub source_type: SourceType,
    pub batch_id: String,
    pub property_address: String,
    pub city: Option<String>,
    pub state_abbr: String,
    pub zip_code: Option<String>,
    pub parcel_id: Option<String>,
    pub county: Option<String>,
    pub owner_name: String,
    pub owner_address: Option<String>,
    pub case_number: Option<String>,
    pub sale_date: Option<String>,
    pub sale_amount: Option<f64>,
    pub opening_bid: Option<f64>,
    pub overage_amount: Option<f64>,
    pub lender_name: Option<String>,
    pub trustee_name: Option<String>,
    pub foreclosure_type: Option<String>,
    pub source_url: Option<String>,
    pub scraped_at: DateTime<Utc>,
}

impl NormalizedLead {
    pub fn fingerprint(&self) -> String {
        lead_fingerprint(
            &self.property_address,
            &self.state_abbr,
            &self.owner_name,
            self.sale_date.as_deref(),
        )
    }
}

/// Row in the `foreclosure_leads` production table. Enrichment fields
/// (APN, assessed value, contact info) are filled in asynchronously by
/// external scripts via partial patches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForeclosureLead {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_abbr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zip_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parcel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub county: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sale_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sale_amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_market_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mortgage_amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lender_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trustee_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreclosure_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<SourceType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apn_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assessed_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub square_footage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scraped_lead_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scraped_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl ForeclosureLead {
    /// Full production row for a freshly scraped lead, keyed by its
    /// content fingerprint.
    pub fn from_normalized(lead: &NormalizedLead) -> Self {
        Self {
            id: Some(lead.fingerprint()),
            owner_name: Some(lead.owner_name.clone()),
            property_address: Some(lead.property_address.clone()),
            city: lead.city.clone(),
            state_abbr: Some(lead.state_abbr.clone()),
            zip_code: lead.zip_code.clone(),
            parcel_id: lead.parcel_id.clone(),
            county: lead.county.clone(),
            case_number: lead.case_number.clone(),
            sale_date: lead.sale_date.clone(),
            sale_amount: lead.sale_amount,
            lender_name: lead.lender_name.clone(),
            trustee_name: lead.trustee_name.clone(),
            foreclosure_type: lead
                .foreclosure_type
                .clone()
                .or_else(|| Some(lead.source_type.foreclosure_type().to_string())),
            source: Some(lead.source.clone()),
            source_type: Some(lead.source_type),
            batch_id: Some(lead.batch_id.clone()),
            scraped_at: Some(lead.scraped_at),
            ..Default::default()
        }
    }
}

/// Partial update applied to a staging row by the importer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StagingPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imported: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imported_at: Option<DateTime<Utc>>,
}

/// The only production fields a re-scrape may overwrite on an existing
/// row; everything else (enrichment included) is left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeadRefresh {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sale_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sale_amount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

/// Row in the `scrape_jobs` queue table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeJob {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub county_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_abbr: Option<String>,
    #[serde(default = "default_job_type")]
    pub job_type: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
    pub status: JobStatus,
    #[serde(default)]
    pub attempt_number: i32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub leads_found: i64,
    #[serde(default)]
    pub leads_new: i64,
    #[serde(default)]
    pub leads_updated: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

fn default_job_type() -> String {
    "scheduled".to_string()
}

fn default_priority() -> i32 {
    5
}

fn default_max_attempts() -> i32 {
    3
}

impl ScrapeJob {
    pub fn new_pending() -> Self {
        Self {
            id: Uuid::new_v4(),
            source_id: None,
            county_id: None,
            state_abbr: None,
            job_type: default_job_type(),
            priority: default_priority(),
            status: JobStatus::Pending,
            attempt_number: 0,
            max_attempts: default_max_attempts(),
            next_retry_at: None,
            error_message: None,
            worker_id: None,
            leads_found: 0,
            leads_new: 0,
            leads_updated: 0,
            created_at: Some(Utc::now()),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn attempts_remaining(&self) -> bool {
        self.attempt_number < self.max_attempts
    }
}

/// A claimed job joined with the scraper it should run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDetail {
    pub job: ScrapeJob,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scraper_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub county_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

/// Lead counters stamped onto a completed job.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct JobCounts {
    pub leads_found: i64,
    pub leads_new: i64,
    pub leads_updated: i64,
}

/// Row in the `counties` scheduling table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct County {
    pub id: Uuid,
    pub name: String,
    pub state_abbr: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub has_online_records: bool,
    #[serde(default)]
    pub consecutive_failures: i32,
    #[serde(default = "default_scrape_frequency_hours")]
    pub scrape_frequency_hours: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_scheduled_scrape: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scraped_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_scrape: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_leads_found: i64,
}

fn default_true() -> bool {
    true
}

fn default_scrape_frequency_hours() -> i64 {
    24
}

/// Counties failing this many times in a row are excluded from
/// scheduling until manually reset.
pub const COUNTY_FAILURE_THRESHOLD: i32 = 5;

/// Row in the `scrape_sources` registry table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeSource {
    pub id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scraper_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<SourceType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default)]
    pub states_covered: Vec<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,
}

fn default_rate_limit() -> u32 {
    10
}

impl ScrapeSource {
    pub fn is_nationwide(&self) -> bool {
        self.states_covered.iter().any(|s| s == "ALL")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_and_short() {
        let a = lead_fingerprint("123 MAIN ST", "TX", "John Smith", Some("2024-03-01"));
        let b = lead_fingerprint("123 MAIN ST", "TX", "John Smith", Some("2024-03-01"));
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn fingerprint_distinguishes_sale_dates() {
        let dated = lead_fingerprint("123 MAIN ST", "TX", "John Smith", Some("2024-03-01"));
        let undated = lead_fingerprint("123 MAIN ST", "TX", "John Smith", None);
        assert_ne!(dated, undated);
    }

    #[test]
    fn state_codes_validate_case_insensitively() {
        assert!(is_valid_state_code("TX"));
        assert!(is_valid_state_code("tx"));
        assert!(is_valid_state_code(" DC "));
        assert!(!is_valid_state_code("ZZ"));
        assert!(!is_valid_state_code("TEX"));
        assert!(!is_valid_state_code(""));
    }

    #[test]
    fn source_types_map_to_foreclosure_types() {
        assert_eq!(SourceType::CountySurplus.foreclosure_type(), "tax-sale-overage");
        assert_eq!(SourceType::TrusteeSale.foreclosure_type(), "trustee-sale-overage");
        assert_eq!(SourceType::Reo.foreclosure_type(), "bank-owned");
        assert_eq!(SourceType::Other.foreclosure_type(), "other");
        assert_eq!(SourceType::Aggregator.foreclosure_type(), "other");
    }

    #[test]
    fn unknown_source_type_deserializes_as_other() {
        let parsed: SourceType = serde_json::from_str("\"mystery_feed\"").unwrap();
        assert_eq!(parsed, SourceType::Other);
    }

    #[test]
    fn staging_patch_omits_unset_fields() {
        let patch = StagingPatch {
            quality_score: Some(55),
            ..Default::default()
        };
        let json = serde_json::to_string(&patch).unwrap();
        assert_eq!(json, "{\"quality_score\":55}");
    }

    #[test]
    fn production_row_from_normalized_defaults_foreclosure_type() {
        let lead = NormalizedLead {
            source: "county-surplus".into(),
            source_type: SourceType::CountySurplus,
            batch_id: "20240301_120000".into(),
            property_address: "500 OAK AVE".into(),
            city: Some("Houston".into()),
            state_abbr: "TX".into(),
            zip_code: Some("77002".into()),
            parcel_id: None,
            county: Some("Harris".into()),
            owner_name: "Jane Doe".into(),
            owner_address: None,
            case_number: Some("2024-TX-9".into()),
            sale_date: Some("2024-02-01".into()),
            sale_amount: Some(120_000.0),
            opening_bid: None,
            overage_amount: Some(15_000.0),
            lender_name: None,
            trustee_name: None,
            foreclosure_type: None,
            source_url: None,
            scraped_at: Utc::now(),
        };
        let row = ForeclosureLead::from_normalized(&lead);
        assert_eq!(row.id.as_deref(), Some(lead.fingerprint().as_str()));
        assert_eq!(row.foreclosure_type.as_deref(), Some("tax-sale-overage"));
        assert_eq!(row.sale_amount, Some(120_000.0));
    }
}
