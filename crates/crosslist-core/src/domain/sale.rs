use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{ProviderId, UtcDateTime, ValidationError};

const SECONDS_PER_DAY: i64 = 86_400;

/// Normalized sale record returned by sales fetches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sale {
    pub sale_id: String,
    pub listing_id: String,
    pub provider: ProviderId,
    pub sale_date: UtcDateTime,
    pub gross_amount: f64,
    pub fees: f64,
    pub net_amount: f64,
    pub buyer: BTreeMap<String, String>,
}

impl Sale {
    pub fn new(
        sale_id: impl Into<String>,
        listing_id: impl Into<String>,
        provider: ProviderId,
        sale_date: UtcDateTime,
        gross_amount: f64,
        fees: f64,
    ) -> Result<Self, ValidationError> {
        let sale = Self {
            sale_id: sale_id.into(),
            listing_id: listing_id.into(),
            provider,
            sale_date,
            gross_amount,
            fees,
            net_amount: round_cents(gross_amount - fees),
            buyer: BTreeMap::new(),
        };
        sale.validate()?;
        Ok(sale)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.sale_id.trim().is_empty() {
            return Err(ValidationError::EmptyField { field: "sale_id" });
        }
        if self.listing_id.trim().is_empty() {
            return Err(ValidationError::EmptyField { field: "listing_id" });
        }
        for (field, value) in [
            ("gross_amount", self.gross_amount),
            ("fees", self.fees),
            ("net_amount", self.net_amount),
        ] {
            if !value.is_finite() {
                return Err(ValidationError::NonFiniteValue { field });
            }
        }
        if self.gross_amount <= 0.0 {
            return Err(ValidationError::NonPositiveValue {
                field: "gross_amount",
            });
        }
        if self.fees < 0.0 {
            return Err(ValidationError::NegativeValue { field: "fees" });
        }
        if self.net_amount < 0.0 {
            return Err(ValidationError::NegativeValue { field: "net_amount" });
        }
        Ok(())
    }

    /// Net over gross as a percentage.
    pub fn profit_margin(&self) -> f64 {
        if self.gross_amount <= 0.0 {
            return 0.0;
        }
        self.net_amount / self.gross_amount * 100.0
    }
}

/// Inclusive time window for sales queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: UtcDateTime,
    pub end: UtcDateTime,
}

impl DateRange {
    pub fn new(start: UtcDateTime, end: UtcDateTime) -> Result<Self, ValidationError> {
        if start > end {
            return Err(ValidationError::InvertedDateRange);
        }
        Ok(Self { start, end })
    }

    /// Window ending now and reaching `days` back.
    pub fn last_days(days: u32) -> Self {
        let end = UtcDateTime::now();
        let start = end.offset_by_seconds(-(i64::from(days) * SECONDS_PER_DAY));
        Self { start, end }
    }

    pub fn contains(&self, instant: UtcDateTime) -> bool {
        self.start <= instant && instant <= self.end
    }
}

impl Default for DateRange {
    fn default() -> Self {
        Self::last_days(30)
    }
}

/// Percentage-plus-fixed fee structure a marketplace charges per sale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub platform_rate: f64,
    pub payment_rate: f64,
    pub fixed_fee: f64,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            platform_rate: 0.10,
            payment_rate: 0.029,
            fixed_fee: 0.0,
        }
    }
}

impl FeeSchedule {
    pub const fn free() -> Self {
        Self {
            platform_rate: 0.0,
            payment_rate: 0.0,
            fixed_fee: 0.0,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        for (field, value) in [
            ("platform_rate", self.platform_rate),
            ("payment_rate", self.payment_rate),
            ("fixed_fee", self.fixed_fee),
        ] {
            if !value.is_finite() {
                return Err(ValidationError::NonFiniteValue { field });
            }
            if value < 0.0 {
                return Err(ValidationError::NegativeValue { field });
            }
        }
        Ok(())
    }

    /// Total fees for a sale amount, rounded to cents.
    pub fn fees_for(&self, amount: f64) -> f64 {
        if amount <= 0.0 || !amount.is_finite() {
            return 0.0;
        }
        round_cents(amount * (self.platform_rate + self.payment_rate) + self.fixed_fee)
    }
}

pub(crate) fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> ProviderId {
        ProviderId::parse("mercari").expect("valid id")
    }

    #[test]
    fn sale_derives_net_amount() {
        let sale = Sale::new("s-1", "l-1", provider(), UtcDateTime::now(), 100.0, 12.9)
            .expect("valid sale");
        assert_eq!(sale.net_amount, 87.1);
        assert!((sale.profit_margin() - 87.1).abs() < 1e-9);
    }

    #[test]
    fn sale_rejects_fees_above_gross() {
        let err = Sale::new("s-1", "l-1", provider(), UtcDateTime::now(), 10.0, 12.0)
            .expect_err("must fail");
        assert_eq!(err, ValidationError::NegativeValue { field: "net_amount" });
    }

    #[test]
    fn date_range_rejects_inverted_bounds() {
        let start = UtcDateTime::parse("2024-02-01T00:00:00Z").expect("valid");
        let end = UtcDateTime::parse("2024-01-01T00:00:00Z").expect("valid");
        assert_eq!(
            DateRange::new(start, end),
            Err(ValidationError::InvertedDateRange)
        );
    }

    #[test]
    fn last_days_spans_requested_window() {
        let range = DateRange::last_days(30);
        assert_eq!(range.start.seconds_until(range.end), 30 * SECONDS_PER_DAY);
        assert!(range.contains(range.end.offset_by_seconds(-60)));
    }

    #[test]
    fn default_fee_schedule_matches_percentage_model() {
        let fees = FeeSchedule::default();
        assert_eq!(fees.fees_for(100.0), 12.9);
        assert_eq!(fees.fees_for(0.0), 0.0);
        assert_eq!(FeeSchedule::free().fees_for(100.0), 0.0);
    }
}
