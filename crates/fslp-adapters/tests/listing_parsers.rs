use fslp_adapters::{AuctionListScraper, CountySurplusScraper, LeadScraper, ScraperParams};
use fslp_core::SourceType;

const AUCTION_RESULTS_PAGE: &str = r#"
<html>
  <body>
    <div class="results">
      <div class="property-card">
        <div class="property-address">123 Main Street, Houston, TX 77002</div>
        <div class="property-price">$215,000</div>
        <div class="auction-date">03/05/2024</div>
        <a href="/property/123-main-st">View</a>
      </div>
      <div class="property-card">
        <div class="property-address">9 Oak Avenue, Dallas, TX 75201</div>
        <div class="bid-amount">$98,500</div>
        <div class="sale-date">April 2, 2024</div>
        <a href="https://example.com/property/9-oak-ave">View</a>
      </div>
      <div class="property-card">
        <div class="property-note">no address on this card</div>
      </div>
    </div>
  </body>
</html>
"#;

const SURPLUS_FUNDS_PAGE: &str = r#"
<html>
  <body>
    <table class="excess-funds">
      <tr><th>Owner</th><th>Property</th><th>Case</th><th>Surplus</th><th>Sale Date</th></tr>
      <tr>
        <td>SMITH, JOHN</td>
        <td>450 Pine Road</td>
        <td>2024-TX-0117</td>
        <td>$18,250.00</td>
        <td>02/15/2024</td>
      </tr>
      <tr>
        <td>DOE, JANE</td>
        <td>77 Elm Court</td>
        <td></td>
        <td>$4,100</td>
        <td>not scheduled</td>
      </tr>
    </table>
  </body>
</html>
"#;

fn auction_params() -> ScraperParams {
    ScraperParams {
        state_abbr: Some("TX".to_string()),
        batch_id: "20240301_120000".to_string(),
        ..Default::default()
    }
}

#[test]
fn auction_cards_parse_into_normalized_leads() {
    let scraper = AuctionListScraper::new(auction_params());
    let leads = scraper.parse_document(AUCTION_RESULTS_PAGE).unwrap();

    // The address-less card is dropped, not errored.
    assert_eq!(leads.len(), 2);

    let first = &leads[0];
    assert_eq!(first.property_address, "123 MAIN ST");
    assert_eq!(first.city.as_deref(), Some("Houston"));
    assert_eq!(first.state_abbr, "TX");
    assert_eq!(first.zip_code.as_deref(), Some("77002"));
    assert_eq!(first.sale_amount, Some(215_000.0));
    assert_eq!(first.sale_date.as_deref(), Some("2024-03-05"));
    assert_eq!(first.source_url.as_deref(), Some("/property/123-main-st"));
    assert_eq!(first.owner_name, "Property Owner");
    assert_eq!(first.source_type, SourceType::Aggregator);
    assert_eq!(first.batch_id, "20240301_120000");

    let second = &leads[1];
    assert_eq!(second.property_address, "9 OAK AVE");
    assert_eq!(second.sale_amount, Some(98_500.0));
    assert_eq!(second.sale_date.as_deref(), Some("2024-04-02"));
}

#[test]
fn auction_fragment_parses_single_listing() {
    let scraper = AuctionListScraper::new(auction_params());
    let fragment = r#"
      <div class="property-card">
        <div class="property-address">55 Cedar Lane, Austin, TX 78701</div>
        <div class="auction-price">$130,000</div>
      </div>
    "#;
    let lead = scraper.parse_listing(fragment).unwrap();
    assert_eq!(lead.property_address, "55 CEDAR LN");
    assert_eq!(lead.city.as_deref(), Some("Austin"));
    assert_eq!(lead.sale_amount, Some(130_000.0));
    assert!(lead.sale_date.is_none());
}

#[test]
fn surplus_table_rows_parse_with_county_context() {
    let scraper = CountySurplusScraper::new(ScraperParams {
        state_abbr: Some("TX".to_string()),
        county_name: Some("Harris".to_string()),
        listing_url: Some("https://county.example.gov/excess-funds".to_string()),
        batch_id: "20240301_120000".to_string(),
        ..Default::default()
    });
    let leads = scraper.parse_document(SURPLUS_FUNDS_PAGE).unwrap();

    // Header row yields no td cells and is skipped.
    assert_eq!(leads.len(), 2);

    let first = &leads[0];
    assert_eq!(first.owner_name, "SMITH, JOHN");
    assert_eq!(first.property_address, "450 PINE RD");
    assert_eq!(first.case_number.as_deref(), Some("2024-TX-0117"));
    assert_eq!(first.overage_amount, Some(18_250.0));
    assert_eq!(first.sale_date.as_deref(), Some("2024-02-15"));
    assert_eq!(first.county.as_deref(), Some("Harris"));
    assert_eq!(first.state_abbr, "TX");
    assert_eq!(first.source_type, SourceType::CountySurplus);
    assert_eq!(
        first.source_url.as_deref(),
        Some("https://county.example.gov/excess-funds")
    );

    let second = &leads[1];
    assert_eq!(second.overage_amount, Some(4_100.0));
    assert!(second.case_number.is_none());
    assert!(second.sale_date.is_none());
}

#[test]
fn surplus_fingerprints_are_stable_across_scrapes() {
    let scraper = CountySurplusScraper::new(ScraperParams {
        state_abbr: Some("TX".to_string()),
        batch_id: "20240301_120000".to_string(),
        ..Default::default()
    });
    let a = scraper.parse_document(SURPLUS_FUNDS_PAGE).unwrap();
    let b = scraper.parse_document(SURPLUS_FUNDS_PAGE).unwrap();
    assert_eq!(a[0].fingerprint(), b[0].fingerprint());
    assert_ne!(a[0].fingerprint(), a[1].fingerprint());
}
