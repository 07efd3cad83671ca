//! # Domain Models
//!
//! Normalized inventory types shared by every marketplace integration.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Listing`] | Item listing payload / fetched listing |
//! | [`ListingFilter`] | Listing query filter |
//! | [`ItemCondition`] | Normalized condition vocabulary |
//! | [`Sale`] | Completed sale with fee breakdown |
//! | [`DateRange`] | Inclusive sales query window |
//! | [`FeeSchedule`] | Per-marketplace fee model |
//! | [`UtcDateTime`] | UTC timestamp |

mod listing;
mod sale;
mod timestamp;

pub use listing::{ItemCondition, Listing, ListingFilter, ListingStatus};
pub(crate) use sale::round_cents;
pub use sale::{DateRange, FeeSchedule, Sale};
pub use timestamp::UtcDateTime;
