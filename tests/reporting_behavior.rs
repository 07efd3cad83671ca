//! Behavior-driven tests for reports built on dispatch outcomes
//!
//! These tests verify HOW sales, health and sync summaries reflect partial
//! failures instead of hiding them.

use std::sync::Arc;
use std::time::Duration;

use crosslist_core::{
    DateRange, Dispatcher, ErrorKind, FeeSchedule, HealthReport, ItemCondition, Listing,
    ListingFilter, ListingStatus, OperationKind, ProviderError, ProviderId, ProviderSettings,
    RetryPolicy, Sale, SalesReport, SandboxMarketplace, SyncSummary, UtcDateTime,
};

fn id(value: &str) -> ProviderId {
    ProviderId::parse(value).expect("valid provider id")
}

fn days_ago(days: i64) -> UtcDateTime {
    UtcDateTime::now().offset_by_seconds(-days * 86_400)
}

fn sale(provider: &str, sale_id: &str, when: UtcDateTime, gross: f64) -> Sale {
    let fees = FeeSchedule::default().fees_for(gross);
    Sale::new(sale_id, "listing-1", id(provider), when, gross, fees).expect("valid sale")
}

fn no_retry() -> ProviderSettings {
    ProviderSettings::default().with_retry(RetryPolicy::no_retry())
}

// =============================================================================
// Reports: Sales
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_one_marketplace_is_down_the_sales_report_totals_the_rest() {
    // Given: Sales on eBay and Mercari while Etsy's sales API is failing
    let ebay = Arc::new(SandboxMarketplace::new(id("ebay")));
    let etsy = Arc::new(SandboxMarketplace::new(id("etsy")));
    let mercari = Arc::new(SandboxMarketplace::new(id("mercari")));
    ebay.add_sale(sale("ebay", "e-1", days_ago(2), 80.0));
    ebay.add_sale(sale("ebay", "e-2", days_ago(45), 500.0));
    mercari.add_sale(sale("mercari", "m-1", days_ago(10), 20.0));
    etsy.fail_always(
        OperationKind::FetchSales,
        ProviderError::status(503, "sales API unavailable"),
    );
    let dispatcher = Dispatcher::builder()
        .register(ebay, no_retry())
        .register(etsy, no_retry())
        .register(mercari, no_retry())
        .build()
        .expect("valid dispatcher");

    // When: A 30 day report is built
    let range = DateRange::last_days(30);
    let outcome = dispatcher.fetch_sales(range).await;
    let report = SalesReport::from_outcome(range, &outcome);

    // Then: Only in-range sales from responding marketplaces are counted
    assert!(outcome.partial_success);
    assert_eq!(report.total_sales, 2);
    assert_eq!(report.total_gross, 100.0);
    assert_eq!(report.total_fees, 12.9);
    assert_eq!(report.total_net, 87.1);
    assert_eq!(report.average_sale, 50.0);
    assert_eq!(report.profit_margin, 87.1);

    // And: The failing marketplace is named rather than silently dropped
    assert_eq!(report.failed_providers.len(), 1);
    assert!(report.failed_providers.contains(&id("etsy")));
    assert_eq!(report.by_provider[&id("etsy")].sales, 0);
    assert_eq!(report.by_provider[&id("ebay")].sales, 1);
    assert_eq!(report.by_provider[&id("mercari")].gross, 20.0);
}

// =============================================================================
// Reports: Health
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_every_marketplace_answers_the_system_is_healthy() {
    // Given: Two marketplaces with different response times
    let ebay = Arc::new(SandboxMarketplace::new(id("ebay")).with_latency(Duration::from_millis(80)));
    let etsy = Arc::new(SandboxMarketplace::new(id("etsy")).with_latency(Duration::from_millis(30)));
    let dispatcher = Dispatcher::builder()
        .register(ebay, no_retry())
        .register(etsy, no_retry())
        .build()
        .expect("valid dispatcher");

    // When: A health report is produced
    let report = HealthReport::from_outcome(&dispatcher.health_check().await);

    // Then: Overall health holds and response times are per provider
    assert!(report.overall_healthy);
    assert_eq!(report.providers[&id("ebay")].response_time_ms, 80);
    assert_eq!(report.providers[&id("etsy")].response_time_ms, 30);
    assert!(report.unhealthy_providers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn when_a_marketplace_is_unreachable_the_health_report_names_it() {
    // Given: eBay is healthy, Poshmark refuses connections
    let ebay = Arc::new(SandboxMarketplace::new(id("ebay")));
    let poshmark = Arc::new(SandboxMarketplace::new(id("poshmark")));
    poshmark.fail_always(
        OperationKind::HealthCheck,
        ProviderError::connect("connection refused"),
    );
    let dispatcher = Dispatcher::builder()
        .register(ebay, no_retry())
        .register(poshmark, no_retry())
        .build()
        .expect("valid dispatcher");

    // When: A health report is produced
    let report = HealthReport::from_outcome(&dispatcher.health_check().await);

    // Then: The system is unhealthy and the error is attached to Poshmark
    assert!(!report.overall_healthy);
    assert_eq!(report.unhealthy_providers(), vec![&id("poshmark")]);
    let poshmark = &report.providers[&id("poshmark")];
    assert_eq!(poshmark.error_kind, Some(ErrorKind::RetryExhausted));
    assert!(poshmark
        .error
        .as_deref()
        .is_some_and(|message| message.contains("connection refused")));
}

// =============================================================================
// Reports: Sync
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_listings_are_synced_counts_follow_the_filter() {
    // Given: Listings created everywhere, one of them later marked sold on eBay
    let ebay = Arc::new(SandboxMarketplace::new(id("ebay")));
    let etsy = Arc::new(SandboxMarketplace::new(id("etsy")));
    let dispatcher = Dispatcher::builder()
        .register(ebay.clone(), no_retry())
        .register(etsy.clone(), no_retry())
        .build()
        .expect("valid dispatcher");
    for (sku, title) in [("sku-1", "Leather boots"), ("sku-2", "Canvas tote")] {
        let listing = Listing::new(sku, title, "", 35.0, 1, ItemCondition::Good)
            .expect("valid listing");
        let outcome = dispatcher
            .create_listing(listing, dispatcher.registered_providers())
            .await;
        assert!(outcome.all_succeeded());
    }
    let mut sold = Listing::new("sku-3", "Silk scarf", "", 25.0, 1, ItemCondition::New)
        .expect("valid listing");
    sold.status = ListingStatus::Sold;
    ebay.seed_listing(sold);

    // When: Active listings are synced
    let summary = SyncSummary::from_outcome(&dispatcher.sync_listings(ListingFilter::active()).await);

    // Then: Sold items are excluded and totals add up
    assert_eq!(summary.listing_counts[&id("ebay")], 2);
    assert_eq!(summary.listing_counts[&id("etsy")], 2);
    assert_eq!(summary.total_listings, 4);
    assert!(summary.failed_providers.is_empty());

    // When: Everything is synced
    let summary = SyncSummary::from_outcome(&dispatcher.sync_listings(ListingFilter::default()).await);

    // Then: The sold listing is included
    assert_eq!(summary.listing_counts[&id("ebay")], 3);
    assert_eq!(summary.total_listings, 5);
}

#[tokio::test(start_paused = true)]
async fn when_a_report_is_serialized_it_keeps_provider_detail() {
    // Given: A health report with one failing marketplace
    let ebay = Arc::new(SandboxMarketplace::new(id("ebay")));
    ebay.set_healthy(false);
    let dispatcher = Dispatcher::builder()
        .register(ebay, no_retry())
        .build()
        .expect("valid dispatcher");

    // When: The report is rendered as JSON
    let report = HealthReport::from_outcome(&dispatcher.health_check().await);
    let json = serde_json::to_value(&report).expect("report serializes");

    // Then: The provider entry carries its error
    assert_eq!(json["overall_healthy"], false);
    assert_eq!(json["providers"]["ebay"]["healthy"], false);
    assert_eq!(
        json["providers"]["ebay"]["error"],
        "health check reported unhealthy"
    );
}
