//! Summaries derived from a [`DispatchOutcome`].
//!
//! Reports never call providers themselves. They only reshape what a dispatch
//! already returned, so failed providers appear in a report rather than
//! aborting it.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::dispatch::DispatchOutcome;
use crate::domain::round_cents;
use crate::marketplace::{ErrorKind, OperationValue};
use crate::{DateRange, ProviderId, UtcDateTime};

/// Per-provider sales totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProviderSales {
    pub sales: usize,
    pub gross: f64,
    pub fees: f64,
    pub net: f64,
}

/// Cross-marketplace sales totals for a date range.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SalesReport {
    pub period: DateRange,
    pub total_sales: usize,
    pub total_gross: f64,
    pub total_fees: f64,
    pub total_net: f64,
    pub average_sale: f64,
    /// Net over gross, in percent.
    pub profit_margin: f64,
    pub by_provider: BTreeMap<ProviderId, ProviderSales>,
    pub failed_providers: BTreeSet<ProviderId>,
}

impl SalesReport {
    pub fn from_outcome(period: DateRange, outcome: &DispatchOutcome) -> Self {
        let mut by_provider = BTreeMap::new();

        for (provider, result) in &outcome.results {
            let mut totals = ProviderSales::default();
            if let Some(OperationValue::Sales(sales)) = result.value() {
                for sale in sales.iter().filter(|sale| period.contains(sale.sale_date)) {
                    totals.sales += 1;
                    totals.gross += sale.gross_amount;
                    totals.fees += sale.fees;
                    totals.net += sale.net_amount;
                }
            }
            by_provider.insert(provider.clone(), totals);
        }

        let total_sales = by_provider.values().map(|row| row.sales).sum::<usize>();
        let total_gross = by_provider.values().map(|row| row.gross).sum::<f64>();
        let total_fees = by_provider.values().map(|row| row.fees).sum::<f64>();
        let total_net = by_provider.values().map(|row| row.net).sum::<f64>();

        let average_sale = if total_sales == 0 {
            0.0
        } else {
            total_gross / total_sales as f64
        };
        let profit_margin = if total_gross > 0.0 {
            total_net / total_gross * 100.0
        } else {
            0.0
        };

        for row in by_provider.values_mut() {
            row.gross = round_cents(row.gross);
            row.fees = round_cents(row.fees);
            row.net = round_cents(row.net);
        }

        Self {
            period,
            total_sales,
            total_gross: round_cents(total_gross),
            total_fees: round_cents(total_fees),
            total_net: round_cents(total_net),
            average_sale: round_cents(average_sale),
            profit_margin: round_cents(profit_margin),
            by_provider,
            failed_providers: outcome.failed_providers.clone(),
        }
    }
}

/// Health of a single provider as seen by one health-check dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderHealth {
    pub healthy: bool,
    pub response_time_ms: u64,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// Every targeted provider answered healthy.
    pub overall_healthy: bool,
    pub checked_at: UtcDateTime,
    pub providers: BTreeMap<ProviderId, ProviderHealth>,
}

impl HealthReport {
    pub fn from_outcome(outcome: &DispatchOutcome) -> Self {
        let providers = outcome
            .results
            .iter()
            .map(|(provider, result)| {
                let detail = result.failure_detail();
                let health = ProviderHealth {
                    healthy: matches!(result.value(), Some(OperationValue::Healthy)),
                    response_time_ms: result.elapsed_ms,
                    error_kind: detail.map(|detail| detail.kind),
                    error: detail.map(|detail| detail.message.clone()),
                };
                (provider.clone(), health)
            })
            .collect::<BTreeMap<_, _>>();

        Self {
            overall_healthy: !providers.is_empty() && providers.values().all(|p| p.healthy),
            checked_at: UtcDateTime::now(),
            providers,
        }
    }

    pub fn unhealthy_providers(&self) -> Vec<&ProviderId> {
        self.providers
            .iter()
            .filter(|(_, health)| !health.healthy)
            .map(|(provider, _)| provider)
            .collect()
    }
}

/// Listing counts from a listings sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub listing_counts: BTreeMap<ProviderId, usize>,
    pub total_listings: usize,
    pub failed_providers: BTreeSet<ProviderId>,
    pub synced_at: UtcDateTime,
}

impl SyncSummary {
    pub fn from_outcome(outcome: &DispatchOutcome) -> Self {
        let listing_counts = outcome
            .results
            .iter()
            .filter_map(|(provider, result)| match result.value() {
                Some(OperationValue::Listings(listings)) => Some((provider.clone(), listings.len())),
                _ => None,
            })
            .collect::<BTreeMap<_, _>>();

        Self {
            total_listings: listing_counts.values().sum(),
            listing_counts,
            failed_providers: outcome.failed_providers.clone(),
            synced_at: UtcDateTime::now(),
        }
    }
}
