//! Staging-to-production lead promotion: validation, quality scoring,
//! duplicate gating, schema mapping.
//!
//! Every staging row processed in a run lands in exactly one bucket:
//! rejected by validation, skipped as duplicate, imported, or left
//! pending after a store error (the only bucket a later run retries).

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use fslp_core::{is_valid_state_code, ForeclosureLead, StagedLead, StagingPatch};
use fslp_store::RecordStore;

pub const CRATE_NAME: &str = "fslp-import";

/// Import gate: leads scoring below this are recorded and skipped.
pub const MIN_QUALITY_SCORE: i32 = 30;
pub const MIN_ADDRESS_LENGTH: usize = 5;
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Owner names that scrapes emit when the real name is unknown.
const OWNER_PLACEHOLDERS: [&str; 5] = ["unknown", "n/a", "na", "none", "null"];

fn present(value: &Option<String>) -> bool {
    value.as_deref().map_or(false, |v| !v.trim().is_empty())
}

pub fn is_valid_owner_name(owner_name: Option<&str>) -> bool {
    let Some(owner) = owner_name else {
        return false;
    };
    let owner = owner.trim().to_lowercase();
    !owner.is_empty() && !OWNER_PLACEHOLDERS.contains(&owner.as_str())
}

pub fn is_valid_address(address: Option<&str>) -> bool {
    address.map_or(false, |a| a.trim().len() >= MIN_ADDRESS_LENGTH)
}

/// Additive quality score over independent signals, with one itemized
/// reason per contributing signal. Structured official-record signals
/// (case number, overage) outweigh location completeness.
pub fn quality_score(lead: &StagedLead) -> (i32, Vec<String>) {
    let mut score = 0;
    let mut reasons = Vec::new();

    if let Some(overage) = lead.overage_amount.filter(|v| *v > 0.0) {
        score += 20;
        reasons.push(format!("+20 has overage amount (${overage:.2})"));
    }

    if present(&lead.case_number) {
        score += 20;
        reasons.push("+20 has case number".to_string());
    }

    let has_phone = present(&lead.primary_phone);
    let has_email = present(&lead.primary_email);
    if has_phone || has_email {
        score += 15;
        let mut kinds = Vec::new();
        if has_phone {
            kinds.push("phone");
        }
        if has_email {
            kinds.push("email");
        }
        reasons.push(format!("+15 has contact info ({})", kinds.join(", ")));
    }

    if present(&lead.city) && present(&lead.zip_code) {
        score += 15;
        reasons.push("+15 has complete location".to_string());
    }

    if present(&lead.sale_date) {
        score += 10;
        reasons.push("+10 has sale date".to_string());
    }

    if present(&lead.county) {
        score += 10;
        reasons.push("+10 has county".to_string());
    }

    if let Some(source_type) = lead.source_type.filter(|t| t.is_high_value()) {
        score += 10;
        reasons.push(format!("+10 high-quality source ({})", source_type.as_str()));
    }

    (score, reasons)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Validation {
    pub is_valid: bool,
    pub notes: String,
    pub score: i32,
    pub reasons: Vec<String>,
}

impl Validation {
    fn reject(notes: &str) -> Self {
        Self {
            is_valid: false,
            notes: notes.to_string(),
            score: 0,
            reasons: Vec::new(),
        }
    }
}

/// Structural gates first (unconditional rejects, score forced to 0),
/// then the score threshold.
pub fn validate(lead: &StagedLead) -> Validation {
    if !is_valid_owner_name(lead.owner_name.as_deref()) {
        return Validation::reject("Invalid or missing owner name");
    }
    if !is_valid_address(lead.property_address.as_deref()) {
        return Validation::reject("Invalid or missing property address");
    }
    if !lead.state_abbr.as_deref().map_or(false, is_valid_state_code) {
        return Validation::reject("Invalid or missing state code");
    }

    let (score, reasons) = quality_score(lead);
    if score < MIN_QUALITY_SCORE {
        return Validation {
            is_valid: false,
            notes: format!("Quality score too low ({score} < {MIN_QUALITY_SCORE})"),
            score,
            reasons,
        };
    }

    Validation {
        is_valid: true,
        notes: format!("Valid lead with quality score {score}"),
        score,
        reasons,
    }
}

/// Map a staging row onto the production schema. Absent values are
/// omitted on the wire, never written as nulls.
pub fn map_lead_fields(lead: &StagedLead, now: DateTime<Utc>) -> ForeclosureLead {
    let overage = lead.overage_amount.filter(|v| *v > 0.0);
    let opening = lead.opening_bid.filter(|v| *v > 0.0);

    let sale_amount = lead.closing_bid.filter(|v| *v > 0.0).or_else(|| {
        if overage.is_some() || opening.is_some() {
            Some(overage.unwrap_or(0.0) + opening.unwrap_or(0.0))
        } else {
            None
        }
    });

    // Overage plus opening bid approximates what the property cleared
    // at sale; either alone is not enough to estimate market value.
    let estimated_market_value = match (overage, opening) {
        (Some(o), Some(b)) => Some(o + b),
        _ => None,
    };

    let foreclosure_type = lead
        .source_type
        .map(|t| t.foreclosure_type())
        .unwrap_or("other");

    ForeclosureLead {
        owner_name: lead.owner_name.clone(),
        property_address: lead.property_address.clone(),
        city: lead.city.clone(),
        state_abbr: lead.state_abbr.clone(),
        zip_code: lead.zip_code.clone(),
        county: lead.county.clone(),
        case_number: lead.case_number.clone(),
        sale_date: lead.sale_date.clone(),
        sale_amount,
        estimated_market_value,
        mortgage_amount: opening,
        trustee_name: lead.trustee_name.clone(),
        foreclosure_type: Some(foreclosure_type.to_string()),
        source: lead.source_url.clone(),
        source_type: lead.source_type,
        primary_phone: lead.primary_phone.clone(),
        primary_email: lead.primary_email.clone(),
        scraped_lead_id: Some(lead.id),
        scraped_at: lead.scraped_at,
        created_at: Some(now),
        ..Default::default()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ImportConfig {
    pub batch_size: usize,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportStats {
    pub total_processed: u64,
    pub validated: u64,
    pub imported: u64,
    pub skipped_duplicate: u64,
    pub rejected_validation: u64,
    pub rejected_quality: u64,
    pub errors: u64,
}

/// Drains the staging table in batches and promotes valid,
/// non-duplicate leads into production.
pub struct Importer {
    store: Arc<dyn RecordStore>,
    config: ImportConfig,
    dry_run: bool,
}

impl Importer {
    pub fn new(store: Arc<dyn RecordStore>, config: ImportConfig, dry_run: bool) -> Self {
        Self {
            store,
            config,
            dry_run,
        }
    }

    pub async fn run(&self) -> Result<ImportStats> {
        let mode = if self.dry_run { "dry run" } else { "production" };
        info!(mode, "starting lead import");

        let known_total = match self.store.count_unimported().await {
            Ok(total) => total,
            Err(err) => {
                warn!(error = %err, "counting unimported leads failed");
                0
            }
        };
        info!(known_total, "unimported leads in staging");

        let mut stats = ImportStats::default();
        let mut offset = 0usize;

        loop {
            let batch = self
                .store
                .fetch_unimported(self.config.batch_size, offset)
                .await
                .context("fetching staging batch")?;
            if batch.is_empty() {
                break;
            }

            for lead in &batch {
                self.import_lead(lead, &mut stats).await;
            }

            offset += self.config.batch_size;
            info!(
                processed = stats.total_processed,
                known_total, "batch complete"
            );

            // The unprocessed set should shrink as rows are marked; if
            // the store's filter semantics do not cooperate, stop rather
            // than loop forever.
            if offset as u64 > known_total + self.config.batch_size as u64 {
                warn!(offset, known_total, "safety cap reached; stopping batch loop");
                break;
            }
        }

        info!(
            processed = stats.total_processed,
            validated = stats.validated,
            imported = stats.imported,
            duplicates = stats.skipped_duplicate,
            rejected_validation = stats.rejected_validation,
            rejected_quality = stats.rejected_quality,
            errors = stats.errors,
            "import complete"
        );
        Ok(stats)
    }

    async fn import_lead(&self, lead: &StagedLead, stats: &mut ImportStats) {
        stats.total_processed += 1;
        let owner = lead.owner_name.as_deref().unwrap_or("<no owner>");

        let validation = validate(lead);
        if !validation.is_valid {
            if validation.score > 0 && validation.score < MIN_QUALITY_SCORE {
                stats.rejected_quality += 1;
                info!(owner, notes = %validation.notes, "rejected: low quality");
            } else {
                stats.rejected_validation += 1;
                warn!(owner, notes = %validation.notes, "rejected: validation");
            }
            self.write_back(
                lead,
                StagingPatch {
                    quality_score: Some(validation.score),
                    validation_notes: Some(validation.notes),
                    ..Default::default()
                },
            )
            .await;
            return;
        }

        stats.validated += 1;

        // Structural checks guarantee these are present.
        let address = lead.property_address.as_deref().unwrap_or_default();
        let state = lead.state_abbr.as_deref().unwrap_or_default();

        let duplicate = match self.store.production_exists(address, state).await {
            Ok(exists) => exists,
            Err(err) => {
                // On a failed probe, assume duplicate rather than risk
                // double-inserting.
                error!(error = %err, owner, "duplicate check failed");
                true
            }
        };
        if duplicate {
            stats.skipped_duplicate += 1;
            info!(owner, address, "skipped: duplicate");
            self.write_back(
                lead,
                StagingPatch {
                    quality_score: Some(validation.score),
                    validation_notes: Some(format!(
                        "{}; Duplicate - already in production",
                        validation.notes
                    )),
                    ..Default::default()
                },
            )
            .await;
            return;
        }

        let production = map_lead_fields(lead, Utc::now());
        info!(owner, address, score = validation.score, "importing lead");

        if self.dry_run {
            info!(reasons = ?validation.reasons, "dry run: skipping writes");
            stats.imported += 1;
            return;
        }

        match self.store.insert_production(&production).await {
            Ok(()) => {
                let marked = self
                    .store
                    .update_staging(
                        lead.id,
                        &StagingPatch {
                            quality_score: Some(validation.score),
                            validation_notes: Some(format!(
                                "{}; Imported successfully",
                                validation.notes
                            )),
                            imported: Some(true),
                            imported_at: Some(Utc::now()),
                        },
                    )
                    .await;
                match marked {
                    Ok(()) => {
                        stats.imported += 1;
                        info!(owner, "imported successfully");
                    }
                    Err(err) => {
                        stats.errors += 1;
                        error!(error = %err, lead_id = %lead.id, "marking staging row failed");
                    }
                }
            }
            Err(err) => {
                stats.errors += 1;
                error!(error = %err, lead_id = %lead.id, "importing lead failed");
                self.write_back(
                    lead,
                    StagingPatch {
                        quality_score: Some(validation.score),
                        validation_notes: Some(format!(
                            "{}; Import error: {err}",
                            validation.notes
                        )),
                        ..Default::default()
                    },
                )
                .await;
            }
        }
    }

    /// Best-effort staging write-back; a failure here is logged and the
    /// row is left for the next run.
    async fn write_back(&self, lead: &StagedLead, patch: StagingPatch) {
        if self.dry_run {
            return;
        }
        if let Err(err) = self.store.update_staging(lead.id, &patch).await {
            error!(error = %err, lead_id = %lead.id, "updating staging row failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fslp_core::SourceType;
    use fslp_store::MemoryStore;
    use uuid::Uuid;

    fn lead(owner: &str, address: &str, state: &str) -> StagedLead {
        StagedLead {
            id: Uuid::new_v4(),
            owner_name: Some(owner.to_string()),
            property_address: Some(address.to_string()),
            state_abbr: Some(state.to_string()),
            ..Default::default()
        }
    }

    fn scored_lead() -> StagedLead {
        // overage(+20) + case(+20) + city/zip(+15) = 55
        StagedLead {
            overage_amount: Some(15_000.0),
            case_number: Some("2024-CV-001".to_string()),
            city: Some("Houston".to_string()),
            zip_code: Some("77002".to_string()),
            ..lead("John Smith", "123 Main St", "TX")
        }
    }

    #[test]
    fn missing_owner_rejects_with_zero_score() {
        let mut lead = scored_lead();
        lead.owner_name = None;
        let v = validate(&lead);
        assert!(!v.is_valid);
        assert_eq!(v.score, 0);
        assert!(v.reasons.is_empty());
        assert_eq!(v.notes, "Invalid or missing owner name");
    }

    #[test]
    fn placeholder_owners_reject() {
        for placeholder in ["unknown", "N/A", "  none  ", "NULL", "na", ""] {
            let mut lead = scored_lead();
            lead.owner_name = Some(placeholder.to_string());
            let v = validate(&lead);
            assert!(!v.is_valid, "placeholder {placeholder:?} accepted");
            assert_eq!(v.score, 0);
        }
    }

    #[test]
    fn short_address_rejects() {
        let mut lead = scored_lead();
        lead.property_address = Some("123".to_string());
        let v = validate(&lead);
        assert!(!v.is_valid);
        assert_eq!(v.score, 0);
        assert_eq!(v.notes, "Invalid or missing property address");
    }

    #[test]
    fn bad_state_code_rejects() {
        let mut lead = scored_lead();
        lead.state_abbr = Some("ZZ".to_string());
        let v = validate(&lead);
        assert!(!v.is_valid);
        assert_eq!(v.score, 0);
        assert_eq!(v.notes, "Invalid or missing state code");
    }

    #[test]
    fn score_is_exact_sum_of_present_signals() {
        let v = validate(&scored_lead());
        assert!(v.is_valid);
        assert_eq!(v.score, 55);
        assert_eq!(v.reasons.len(), 3);
        assert!(v.reasons.iter().any(|r| r.contains("overage")));
        assert!(v.reasons.iter().any(|r| r.contains("case number")));
        assert!(v.reasons.iter().any(|r| r.contains("complete location")));
    }

    #[test]
    fn all_signals_reach_max_score() {
        let full = StagedLead {
            overage_amount: Some(1.0),
            case_number: Some("X".to_string()),
            primary_phone: Some("555-0100".to_string()),
            primary_email: Some("a@b.c".to_string()),
            city: Some("Houston".to_string()),
            zip_code: Some("77002".to_string()),
            sale_date: Some("2024-01-01".to_string()),
            county: Some("Harris".to_string()),
            source_type: Some(SourceType::CountySurplus),
            ..lead("John Smith", "123 Main St", "TX")
        };
        let (score, reasons) = quality_score(&full);
        assert_eq!(score, 100);
        assert_eq!(reasons.len(), 7);
    }

    #[test]
    fn below_threshold_scores_reject_but_keep_reasons() {
        let weak = StagedLead {
            county: Some("Harris".to_string()),
            ..lead("John Smith", "123 Main St", "TX")
        };
        let v = validate(&weak);
        assert!(!v.is_valid);
        assert_eq!(v.score, 10);
        assert_eq!(v.reasons, vec!["+10 has county".to_string()]);
        assert!(v.notes.contains("Quality score too low"));
    }

    #[test]
    fn empty_strings_do_not_score() {
        let hollow = StagedLead {
            case_number: Some("  ".to_string()),
            city: Some(String::new()),
            zip_code: Some("77002".to_string()),
            ..lead("John Smith", "123 Main St", "TX")
        };
        let (score, reasons) = quality_score(&hollow);
        assert_eq!(score, 0);
        assert!(reasons.is_empty());
    }

    #[test]
    fn sale_amount_prefers_closing_bid() {
        let mut staged = scored_lead();
        staged.closing_bid = Some(120_000.0);
        staged.opening_bid = Some(80_000.0);
        let row = map_lead_fields(&staged, Utc::now());
        assert_eq!(row.sale_amount, Some(120_000.0));
        assert_eq!(row.mortgage_amount, Some(80_000.0));
        assert_eq!(row.estimated_market_value, Some(95_000.0));
    }

    #[test]
    fn sale_amount_falls_back_to_overage_plus_opening() {
        let mut staged = scored_lead();
        staged.opening_bid = Some(80_000.0);
        let row = map_lead_fields(&staged, Utc::now());
        assert_eq!(row.sale_amount, Some(95_000.0));
        assert_eq!(row.estimated_market_value, Some(95_000.0));
    }

    #[test]
    fn unmapped_source_type_defaults_to_other() {
        let staged = scored_lead();
        let row = map_lead_fields(&staged, Utc::now());
        assert_eq!(row.foreclosure_type.as_deref(), Some("other"));
        assert_eq!(row.scraped_lead_id, Some(staged.id));
    }

    #[tokio::test]
    async fn end_to_end_scenario_imports_with_expected_fields() {
        let store = Arc::new(MemoryStore::new());
        store.push_staged(scored_lead()).await;

        let importer = Importer::new(store.clone(), ImportConfig::default(), false);
        let stats = importer.run().await.unwrap();

        assert_eq!(stats.total_processed, 1);
        assert_eq!(stats.validated, 1);
        assert_eq!(stats.imported, 1);
        assert_eq!(stats.errors, 0);

        let production = store.production().await;
        assert_eq!(production.len(), 1);
        let row = &production[0];
        assert_eq!(row.owner_name.as_deref(), Some("John Smith"));
        // Overage alone: sale amount derives, market value does not.
        assert_eq!(row.sale_amount, Some(15_000.0));
        assert_eq!(row.estimated_market_value, None);
        assert_eq!(row.foreclosure_type.as_deref(), Some("other"));

        let staged = store.staged().await;
        assert!(staged[0].imported);
        assert_eq!(staged[0].quality_score, Some(55));
        assert!(staged[0]
            .validation_notes
            .as_deref()
            .unwrap()
            .contains("Imported successfully"));
        assert!(staged[0].imported_at.is_some());
    }

    #[tokio::test]
    async fn duplicates_skip_regardless_of_order() {
        let store = Arc::new(MemoryStore::new());
        store
            .push_production(ForeclosureLead {
                property_address: Some("123 Main St".to_string()),
                state_abbr: Some("TX".to_string()),
                ..Default::default()
            })
            .await;
        store.push_staged(scored_lead()).await;
        store.push_staged(scored_lead()).await;

        let importer = Importer::new(store.clone(), ImportConfig::default(), false);
        let stats = importer.run().await.unwrap();

        assert_eq!(stats.skipped_duplicate, 2);
        assert_eq!(stats.imported, 0);
        assert_eq!(store.production().await.len(), 1);

        let staged = store.staged().await;
        for row in staged {
            assert!(!row.imported);
            assert!(row
                .validation_notes
                .as_deref()
                .unwrap()
                .contains("Duplicate"));
        }
    }

    #[tokio::test]
    async fn second_of_two_identical_rows_is_rejected_as_duplicate() {
        let store = Arc::new(MemoryStore::new());
        store.push_staged(scored_lead()).await;
        store.push_staged(scored_lead()).await;

        let importer = Importer::new(store.clone(), ImportConfig::default(), false);
        let stats = importer.run().await.unwrap();

        assert_eq!(stats.imported, 1);
        assert_eq!(stats.skipped_duplicate, 1);
        assert_eq!(store.production().await.len(), 1);
    }

    #[tokio::test]
    async fn invalid_rows_are_recorded_but_not_imported() {
        let store = Arc::new(MemoryStore::new());
        store.push_staged(lead("unknown", "123 Main St", "TX")).await;

        let importer = Importer::new(store.clone(), ImportConfig::default(), false);
        let stats = importer.run().await.unwrap();

        assert_eq!(stats.rejected_validation, 1);
        assert_eq!(stats.imported, 0);

        let staged = store.staged().await;
        assert!(!staged[0].imported);
        assert_eq!(staged[0].quality_score, Some(0));
        assert_eq!(
            staged[0].validation_notes.as_deref(),
            Some("Invalid or missing owner name")
        );
    }

    #[tokio::test]
    async fn low_quality_rows_count_separately_from_structural_rejects() {
        let store = Arc::new(MemoryStore::new());
        store
            .push_staged(StagedLead {
                county: Some("Harris".to_string()),
                ..lead("John Smith", "123 Main St", "TX")
            })
            .await;
        store.push_staged(lead("", "123 Main St", "TX")).await;

        let importer = Importer::new(store.clone(), ImportConfig::default(), false);
        let stats = importer.run().await.unwrap();

        assert_eq!(stats.rejected_quality, 1);
        assert_eq!(stats.rejected_validation, 1);
    }

    #[tokio::test]
    async fn insert_failure_leaves_row_pending_with_error_note() {
        let store = Arc::new(MemoryStore::new());
        store.push_staged(scored_lead()).await;
        store.set_fail_production_inserts(true).await;

        let importer = Importer::new(store.clone(), ImportConfig::default(), false);
        let stats = importer.run().await.unwrap();

        assert_eq!(stats.errors, 1);
        assert_eq!(stats.imported, 0);

        let staged = store.staged().await;
        assert!(!staged[0].imported);
        assert!(staged[0]
            .validation_notes
            .as_deref()
            .unwrap()
            .contains("Import error"));

        // The error class is the retryable one: clear the fault and the
        // next run imports the row.
        store.set_fail_production_inserts(false).await;
        let stats = importer.run().await.unwrap();
        assert_eq!(stats.imported, 1);
        assert!(store.staged().await[0].imported);
    }

    #[tokio::test]
    async fn rerun_revalidates_rejects_deterministically() {
        let store = Arc::new(MemoryStore::new());
        store.push_staged(lead("unknown", "123 Main St", "TX")).await;
        store.push_staged(scored_lead()).await;

        let importer = Importer::new(store.clone(), ImportConfig::default(), false);
        let first = importer.run().await.unwrap();
        assert_eq!(first.imported, 1);
        assert_eq!(first.rejected_validation, 1);

        let second = importer.run().await.unwrap();
        assert_eq!(second.imported, 0);
        assert_eq!(second.rejected_validation, 1);
        assert_eq!(second.total_processed, 1);
        assert_eq!(store.production().await.len(), 1);
    }

    #[tokio::test]
    async fn dry_run_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        store.push_staged(scored_lead()).await;
        store.push_staged(lead("unknown", "123 Main St", "TX")).await;

        let importer = Importer::new(store.clone(), ImportConfig::default(), true);
        let stats = importer.run().await.unwrap();

        assert_eq!(stats.imported, 1);
        assert_eq!(stats.rejected_validation, 1);
        assert!(store.production().await.is_empty());
        for row in store.staged().await {
            assert!(!row.imported);
            assert!(row.quality_score.is_none());
            assert!(row.validation_notes.is_none());
        }
    }
}
