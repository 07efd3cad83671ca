use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{UtcDateTime, ValidationError};

/// Normalized item condition shared by every marketplace.
///
/// Providers map these onto their own vocabularies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemCondition {
    New,
    #[serde(rename = "Like New")]
    LikeNew,
    Excellent,
    Good,
    Fair,
    Poor,
}

impl ItemCondition {
    pub const ALL: [Self; 6] = [
        Self::New,
        Self::LikeNew,
        Self::Excellent,
        Self::Good,
        Self::Fair,
        Self::Poor,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::New => "New",
            Self::LikeNew => "Like New",
            Self::Excellent => "Excellent",
            Self::Good => "Good",
            Self::Fair => "Fair",
            Self::Poor => "Poor",
        }
    }
}

impl Display for ItemCondition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemCondition {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        Self::ALL
            .into_iter()
            .find(|condition| condition.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| ValidationError::InvalidCondition {
                value: value.to_owned(),
            })
    }
}

/// Lifecycle status of a listing on a marketplace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    Active,
    Inactive,
    Sold,
    Deleted,
}

/// Normalized listing record used as the payload of create/update operations
/// and as the result type of listing fetches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub item_id: String,
    /// Listing id assigned by the marketplace, present on fetched listings.
    pub provider_listing_id: Option<String>,
    pub title: String,
    pub description: String,
    pub price: f64,
    pub quantity: u32,
    pub condition: ItemCondition,
    pub size: Option<String>,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub photos: Vec<String>,
    pub url: Option<String>,
    pub status: ListingStatus,
    pub created_at: UtcDateTime,
    pub updated_at: UtcDateTime,
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Listing {
    pub fn new(
        item_id: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
        price: f64,
        quantity: u32,
        condition: ItemCondition,
    ) -> Result<Self, ValidationError> {
        let now = UtcDateTime::now();
        let listing = Self {
            item_id: item_id.into(),
            provider_listing_id: None,
            title: title.into(),
            description: description.into(),
            price,
            quantity,
            condition,
            size: None,
            brand: None,
            category: None,
            photos: Vec::new(),
            url: None,
            status: ListingStatus::Active,
            created_at: now,
            updated_at: now,
            extra: BTreeMap::new(),
        };
        listing.validate()?;
        Ok(listing)
    }

    pub fn with_brand(mut self, brand: impl Into<String>) -> Self {
        self.brand = Some(brand.into());
        self
    }

    pub fn with_size(mut self, size: impl Into<String>) -> Self {
        self.size = Some(size.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_photos(mut self, photos: Vec<String>) -> Self {
        self.photos = photos;
        self
    }

    /// Checks the fields every marketplace requires.
    ///
    /// Listings deserialized from external input bypass [`Listing::new`], so
    /// the dispatcher re-runs this before fanning out.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.item_id.trim().is_empty() {
            return Err(ValidationError::EmptyField { field: "item_id" });
        }
        if self.title.trim().is_empty() {
            return Err(ValidationError::EmptyField { field: "title" });
        }
        if !self.price.is_finite() {
            return Err(ValidationError::NonFiniteValue { field: "price" });
        }
        if self.price <= 0.0 {
            return Err(ValidationError::NonPositiveValue { field: "price" });
        }
        if self.quantity == 0 {
            return Err(ValidationError::NonPositiveValue { field: "quantity" });
        }
        Ok(())
    }
}

/// Query filter for listing fetches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingFilter {
    pub status: Option<ListingStatus>,
    pub updated_since: Option<UtcDateTime>,
    pub limit: Option<usize>,
}

impl ListingFilter {
    pub fn active() -> Self {
        Self {
            status: Some(ListingStatus::Active),
            ..Self::default()
        }
    }

    pub fn matches(&self, listing: &Listing) -> bool {
        if let Some(status) = self.status {
            if listing.status != status {
                return false;
            }
        }
        if let Some(since) = self.updated_since {
            if listing.updated_at < since {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_condition_case_insensitively() {
        assert_eq!("like new".parse::<ItemCondition>(), Ok(ItemCondition::LikeNew));
        assert_eq!(" Good ".parse::<ItemCondition>(), Ok(ItemCondition::Good));
        assert!(matches!(
            "Mint".parse::<ItemCondition>(),
            Err(ValidationError::InvalidCondition { .. })
        ));
    }

    #[test]
    fn rejects_listing_without_title() {
        let err = Listing::new("item-1", "  ", "desc", 10.0, 1, ItemCondition::New)
            .expect_err("must fail");
        assert_eq!(err, ValidationError::EmptyField { field: "title" });
    }

    #[test]
    fn rejects_non_positive_price_and_quantity() {
        let err = Listing::new("item-1", "Hoodie", "desc", 0.0, 1, ItemCondition::New)
            .expect_err("must fail");
        assert_eq!(err, ValidationError::NonPositiveValue { field: "price" });

        let err = Listing::new("item-1", "Hoodie", "desc", 10.0, 0, ItemCondition::New)
            .expect_err("must fail");
        assert_eq!(err, ValidationError::NonPositiveValue { field: "quantity" });

        let err = Listing::new("item-1", "Hoodie", "desc", f64::NAN, 1, ItemCondition::New)
            .expect_err("must fail");
        assert_eq!(err, ValidationError::NonFiniteValue { field: "price" });
    }

    #[test]
    fn condition_serializes_with_display_names() {
        let json = serde_json::to_string(&ItemCondition::LikeNew).expect("serializable");
        assert_eq!(json, "\"Like New\"");
    }

    #[test]
    fn filter_matches_status() {
        let mut listing =
            Listing::new("item-1", "Hoodie", "desc", 10.0, 1, ItemCondition::Good).expect("valid");
        assert!(ListingFilter::active().matches(&listing));

        listing.status = ListingStatus::Sold;
        assert!(!ListingFilter::active().matches(&listing));
        assert!(ListingFilter::default().matches(&listing));
    }
}
