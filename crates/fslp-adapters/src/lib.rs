//! Scraper adapter contract + HTML adapter implementations.
//!
//! Every lead source implements the same shape: fetch one or more pages,
//! parse listings into [`NormalizedLead`] records, report pages scraped
//! and duration. Site-specific selectors are business data and expected
//! to churn; the contract and the parse helpers are the stable part.

use std::time::Instant;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use uuid::Uuid;

use fslp_core::{NormalizedLead, SourceType};
use fslp_store::{FetchError, PageFetcher};

pub const CRATE_NAME: &str = "fslp-adapters";

/// Scraper run when a job names no implementation, and the fallback for
/// unrecognized names.
pub const DEFAULT_SCRAPER: &str = "auction-list";

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl From<FetchError> for ScrapeError {
    fn from(err: FetchError) -> Self {
        Self::Anyhow(err.into())
    }
}

/// Result of one scrape run.
#[derive(Debug, Clone)]
pub struct ScrapeOutcome {
    pub leads: Vec<NormalizedLead>,
    pub pages_scraped: u32,
    pub duration_seconds: f64,
    pub source_url: Option<String>,
}

/// Job-scoped parameters handed to a scraper at construction.
#[derive(Debug, Clone, Default)]
pub struct ScraperParams {
    pub state_abbr: Option<String>,
    pub county_id: Option<Uuid>,
    pub county_name: Option<String>,
    pub listing_url: Option<String>,
    pub batch_id: String,
}

impl ScraperParams {
    pub fn new_batch_id() -> String {
        Utc::now().format("%Y%m%d_%H%M%S").to_string()
    }
}

#[async_trait]
pub trait LeadScraper: Send + Sync {
    fn name(&self) -> &'static str;
    fn source_type(&self) -> SourceType;

    /// Execute a full scrape run against the configured target.
    async fn scrape(&self, http: &PageFetcher) -> Result<ScrapeOutcome, ScrapeError>;

    /// Parse a single listing fragment. Returns None when the fragment
    /// carries no usable lead.
    fn parse_listing(&self, fragment: &str) -> Option<NormalizedLead>;
}

/// Resolve a scraper implementation by registry name, falling back to
/// the nationwide default.
pub fn scraper_for_name(name: Option<&str>, params: ScraperParams) -> Box<dyn LeadScraper> {
    match name.unwrap_or(DEFAULT_SCRAPER) {
        "county-surplus" => Box::new(CountySurplusScraper::new(params)),
        _ => Box::new(AuctionListScraper::new(params)),
    }
}

fn selector(input: &str) -> Result<Selector, ScrapeError> {
    Selector::parse(input).map_err(|e| ScrapeError::Message(e.to_string()))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn first_text(scope: ElementRef<'_>, sel: &Selector) -> Option<String> {
    scope
        .select(sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn first_attr(scope: ElementRef<'_>, sel: &Selector, attr: &str) -> Option<String> {
    scope
        .select(sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string()))
}

/// Strip currency symbols and thousands separators, then parse.
pub fn parse_currency(value: &str) -> Option<f64> {
    let cleaned: String = value
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse().ok()
}

const DATE_FORMATS: [&str; 7] = [
    "%Y-%m-%d",
    "%m/%d/%Y",
    "%m/%d/%y",
    "%m-%d-%Y",
    "%B %d, %Y",
    "%b %d, %Y",
    "%B %d %Y",
];

/// Parse common US date spellings into `YYYY-MM-DD`.
pub fn parse_date(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return Some(date.format("%Y-%m-%d").to_string());
        }
    }
    None
}

const ADDRESS_ABBREVIATIONS: [(&str, &str); 13] = [
    (" STREET", " ST"),
    (" AVENUE", " AVE"),
    (" BOULEVARD", " BLVD"),
    (" DRIVE", " DR"),
    (" ROAD", " RD"),
    (" LANE", " LN"),
    (" COURT", " CT"),
    (" CIRCLE", " CIR"),
    (" PLACE", " PL"),
    (" NORTH", " N"),
    (" SOUTH", " S"),
    (" EAST", " E"),
    (" WEST", " W"),
];

/// Uppercase and collapse street designators to their standard
/// abbreviations so the same property always hashes the same way.
pub fn normalize_address(address: &str) -> String {
    let mut address = address.trim().to_uppercase();
    for (full, abbr) in ADDRESS_ABBREVIATIONS {
        address = address.replace(full, abbr);
    }
    address
}

/// Split a `"ST 12345"` tail into state code and zip.
pub fn split_state_zip(value: &str) -> (Option<String>, Option<String>) {
    let mut tokens = value.split_whitespace();
    let state = tokens
        .next()
        .filter(|t| t.len() == 2 && t.chars().all(|c| c.is_ascii_alphabetic()))
        .map(|t| t.to_ascii_uppercase());
    let zip = tokens
        .next()
        .filter(|t| t.len() == 5 && t.chars().all(|c| c.is_ascii_digit()))
        .map(|t| t.to_string());
    (state, zip)
}

/// Nationwide auction aggregator listings: one `.property-card` element
/// per sale, owner names rarely published (skip tracing fills them in
/// downstream).
pub struct AuctionListScraper {
    params: ScraperParams,
}

impl AuctionListScraper {
    const SEARCH_URL: &'static str = "https://www.auction.com/residential/foreclosure";
    const FALLBACK_OWNER: &'static str = "Property Owner";

    pub fn new(params: ScraperParams) -> Self {
        Self { params }
    }

    fn listing_url(&self) -> String {
        if let Some(url) = &self.params.listing_url {
            return url.clone();
        }
        match &self.params.state_abbr {
            Some(state) => format!("{}?state={state}", Self::SEARCH_URL),
            None => Self::SEARCH_URL.to_string(),
        }
    }

    /// Parse every listing card out of a full results page.
    pub fn parse_document(&self, html: &str) -> Result<Vec<NormalizedLead>, ScrapeError> {
        let document = Html::parse_document(html);
        let card_sel = selector(".property-card")?;
        let mut leads = Vec::new();
        for card in document.select(&card_sel) {
            if let Some(lead) = self.card_to_lead(card) {
                leads.push(lead);
            }
        }
        Ok(leads)
    }

    fn card_to_lead(&self, card: ElementRef<'_>) -> Option<NormalizedLead> {
        let address_sel = selector(".property-address").ok()?;
        let price_sel = selector(".property-price, .auction-price, .bid-amount").ok()?;
        let date_sel = selector(".auction-date, .sale-date").ok()?;
        let link_sel = selector("a[href*='/property/']").ok()?;
        let owner_sel = selector(".owner-name").ok()?;

        let full_address = first_text(card, &address_sel)?;

        // "123 Main St, City, ST 12345"
        let mut parts = full_address.split(',').map(str::trim);
        let street = parts.next().unwrap_or_default();
        if street.is_empty() {
            return None;
        }
        let city = parts.next().and_then(|c| text_or_none(c.to_string()));
        let (parsed_state, zip_code) = parts
            .next()
            .map(split_state_zip)
            .unwrap_or((None, None));
        let state_abbr = parsed_state
            .or_else(|| self.params.state_abbr.clone())
            .unwrap_or_default();

        let sale_amount = first_text(card, &price_sel).and_then(|t| parse_currency(&t));
        let sale_date = first_text(card, &date_sel).and_then(|t| parse_date(&t));
        let source_url = first_attr(card, &link_sel, "href");
        let owner_name = first_text(card, &owner_sel)
            .unwrap_or_else(|| Self::FALLBACK_OWNER.to_string());

        Some(NormalizedLead {
            source: self.name().to_string(),
            source_type: self.source_type(),
            batch_id: self.params.batch_id.clone(),
            property_address: normalize_address(street),
            city,
            state_abbr,
            zip_code,
            parcel_id: None,
            county: self.params.county_name.clone(),
            owner_name,
            owner_address: None,
            case_number: None,
            sale_date,
            sale_amount,
            opening_bid: None,
            overage_amount: None,
            lender_name: None,
            trustee_name: None,
            foreclosure_type: None,
            source_url,
            scraped_at: Utc::now(),
        })
    }
}

#[async_trait]
impl LeadScraper for AuctionListScraper {
    fn name(&self) -> &'static str {
        "auction-list"
    }

    fn source_type(&self) -> SourceType {
        SourceType::Aggregator
    }

    async fn scrape(&self, http: &PageFetcher) -> Result<ScrapeOutcome, ScrapeError> {
        let started = Instant::now();
        let url = self.listing_url();
        let page = http.fetch(self.name(), &url).await?;
        let body = page.text();
        let leads = self.parse_document(&body)?;
        Ok(ScrapeOutcome {
            leads,
            pages_scraped: 1,
            duration_seconds: started.elapsed().as_secs_f64(),
            source_url: Some(url),
        })
    }

    fn parse_listing(&self, fragment: &str) -> Option<NormalizedLead> {
        let document = Html::parse_fragment(fragment);
        let card_sel = selector(".property-card").ok()?;
        let card = document
            .select(&card_sel)
            .next()
            .unwrap_or_else(|| document.root_element());
        self.card_to_lead(card)
    }
}

/// County excess-funds lists: positional table rows of
/// owner / address / case number / overage / sale date.
pub struct CountySurplusScraper {
    params: ScraperParams,
}

impl CountySurplusScraper {
    pub fn new(params: ScraperParams) -> Self {
        Self { params }
    }

    pub fn parse_document(&self, html: &str) -> Result<Vec<NormalizedLead>, ScrapeError> {
        let document = Html::parse_document(html);
        let row_sel = selector("table tr")?;
        let mut leads = Vec::new();
        for row in document.select(&row_sel) {
            if let Some(lead) = self.row_to_lead(row) {
                leads.push(lead);
            }
        }
        Ok(leads)
    }

    fn row_to_lead(&self, row: ElementRef<'_>) -> Option<NormalizedLead> {
        let cell_sel = selector("td").ok()?;
        // Keep empty cells so column positions stay aligned; header rows
        // have th cells and produce no td entries at all.
        let cells: Vec<String> = row
            .select(&cell_sel)
            .map(|c| c.text().collect::<String>().trim().to_string())
            .collect();
        if cells.len() < 2 {
            return None;
        }

        let owner_name = text_or_none(cells[0].clone())?;
        let property_address = normalize_address(&cells[1]);
        if property_address.is_empty() {
            return None;
        }
        let case_number = cells.get(2).and_then(|c| text_or_none(c.clone()));
        let overage_amount = cells.get(3).and_then(|c| parse_currency(c));
        let sale_date = cells.get(4).and_then(|c| parse_date(c));

        Some(NormalizedLead {
            source: self.name().to_string(),
            source_type: self.source_type(),
            batch_id: self.params.batch_id.clone(),
            property_address,
            city: None,
            state_abbr: self.params.state_abbr.clone().unwrap_or_default(),
            zip_code: None,
            parcel_id: None,
            county: self.params.county_name.clone(),
            owner_name,
            owner_address: None,
            case_number,
            sale_date,
            sale_amount: None,
            opening_bid: None,
            overage_amount,
            lender_name: None,
            trustee_name: None,
            foreclosure_type: None,
            source_url: self.params.listing_url.clone(),
            scraped_at: Utc::now(),
        })
    }
}

#[async_trait]
impl LeadScraper for CountySurplusScraper {
    fn name(&self) -> &'static str {
        "county-surplus"
    }

    fn source_type(&self) -> SourceType {
        SourceType::CountySurplus
    }

    async fn scrape(&self, http: &PageFetcher) -> Result<ScrapeOutcome, ScrapeError> {
        let started = Instant::now();
        let url = self.params.listing_url.clone().ok_or_else(|| {
            ScrapeError::Message("county surplus scrape requires a listing url".to_string())
        })?;
        let page = http.fetch(self.name(), &url).await?;
        let body = page.text();
        let leads = self.parse_document(&body)?;
        Ok(ScrapeOutcome {
            leads,
            pages_scraped: 1,
            duration_seconds: started.elapsed().as_secs_f64(),
            source_url: Some(url),
        })
    }

    fn parse_listing(&self, fragment: &str) -> Option<NormalizedLead> {
        let document = Html::parse_fragment(fragment);
        let row_sel = selector("tr").ok()?;
        let row = document
            .select(&row_sel)
            .next()
            .unwrap_or_else(|| document.root_element());
        self.row_to_lead(row)
    }
}
