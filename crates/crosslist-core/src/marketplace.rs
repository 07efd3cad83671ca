//! Marketplace contract and operation types.
//!
//! This module defines the capability set every marketplace integration
//! implements (`Marketplace`), the logical operations the dispatcher fans out,
//! and the structured error taxonomy shared by the retry, breaker and
//! dispatch layers.
//!
//! # Operations
//!
//! | Operation | Payload | Success value |
//! |-----------|---------|---------------|
//! | Create | [`Listing`] | provider listing id |
//! | Update | [`Listing`] + provider listing id | [`UpdateAck`] |
//! | Delete | provider listing id | deletion confirmed |
//! | FetchListings | [`ListingFilter`] | listings |
//! | FetchSales | [`DateRange`] | sales |
//! | HealthCheck | - | provider healthy |

use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::http_client::HttpAuth;
use crate::{DateRange, Listing, ListingFilter, ProviderId, Sale, UtcDateTime};

/// Boxed future returned by marketplace calls.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

/// Operation class used for breaker keys, events and capability checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    FetchListings,
    FetchSales,
    HealthCheck,
}

impl OperationKind {
    pub const ALL: [Self; 6] = [
        Self::Create,
        Self::Update,
        Self::Delete,
        Self::FetchListings,
        Self::FetchSales,
        Self::HealthCheck,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::FetchListings => "fetch_listings",
            Self::FetchSales => "fetch_sales",
            Self::HealthCheck => "health_check",
        }
    }

    /// Whether the operation targets an existing provider listing id.
    pub const fn needs_listing_id(self) -> bool {
        matches!(self, Self::Update | Self::Delete)
    }
}

impl Display for OperationKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical operation and its payload. Immutable once issued.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Create(Listing),
    Update(Listing),
    Delete,
    FetchListings(ListingFilter),
    FetchSales(DateRange),
    HealthCheck,
}

impl Operation {
    pub const fn kind(&self) -> OperationKind {
        match self {
            Self::Create(_) => OperationKind::Create,
            Self::Update(_) => OperationKind::Update,
            Self::Delete => OperationKind::Delete,
            Self::FetchListings(_) => OperationKind::FetchListings,
            Self::FetchSales(_) => OperationKind::FetchSales,
            Self::HealthCheck => OperationKind::HealthCheck,
        }
    }

    /// Listing payload carried by create/update operations.
    pub fn listing(&self) -> Option<&Listing> {
        match self {
            Self::Create(listing) | Self::Update(listing) => Some(listing),
            _ => None,
        }
    }
}

/// Acknowledgement returned by a listing update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateAck {
    pub provider_listing_id: String,
    pub updated_at: UtcDateTime,
}

/// Successful result of one provider call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum OperationValue {
    ListingId(String),
    Updated(UpdateAck),
    Deleted,
    Listings(Vec<Listing>),
    Sales(Vec<Sale>),
    Healthy,
}

/// Error taxonomy shared by every layer of the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Rate limiting, 5xx, connect or timeout failures.
    Transient,
    /// Bad input, rejected auth, not found.
    Permanent,
    /// Breaker rejected the call without touching the network.
    CircuitOpen,
    /// Attempt budget consumed while the failure was still transient.
    RetryExhausted,
    /// Caller-imposed deadline expired.
    DeadlineExceeded,
    /// Dispatch target is not registered.
    UnknownProvider,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::CircuitOpen => "circuit_open",
            Self::RetryExhausted => "retry_exhausted",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::UnknownProvider => "unknown_provider",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Underlying condition that produced a provider failure.
///
/// Retry policies decide retryability from the cause, not the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "cause", content = "status", rename_all = "snake_case")]
pub enum FailureCause {
    Status(u16),
    Connect,
    Timeout,
    Other,
}

/// Structured provider error used by the retry executor and dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    kind: ErrorKind,
    cause: FailureCause,
    message: String,
}

impl ProviderError {
    /// Error for an HTTP response status. 429 and 5xx are transient.
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        let kind = if status == 429 || status >= 500 {
            ErrorKind::Transient
        } else {
            ErrorKind::Permanent
        };
        Self {
            kind,
            cause: FailureCause::Status(status),
            message: message.into(),
        }
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            cause: FailureCause::Connect,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            cause: FailureCause::Timeout,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Permanent,
            cause: FailureCause::Other,
            message: message.into(),
        }
    }

    /// Breaker rejection; `scope` names the guarded provider operation.
    pub fn circuit_open(scope: &str) -> Self {
        Self {
            kind: ErrorKind::CircuitOpen,
            cause: FailureCause::Other,
            message: format!("circuit breaker for {scope} is open; call rejected"),
        }
    }

    /// Wraps the last observed error once the attempt budget is spent.
    pub fn retry_exhausted(last: Self, attempts: u32) -> Self {
        Self {
            kind: ErrorKind::RetryExhausted,
            cause: last.cause,
            message: format!(
                "retry budget exhausted after {attempts} attempt(s): {}",
                last.message
            ),
        }
    }

    pub fn deadline_exceeded(deadline_ms: u64) -> Self {
        Self {
            kind: ErrorKind::DeadlineExceeded,
            cause: FailureCause::Other,
            message: format!("dispatch deadline of {deadline_ms}ms expired before completion"),
        }
    }

    pub fn unknown_provider(provider: &ProviderId) -> Self {
        Self {
            kind: ErrorKind::UnknownProvider,
            cause: FailureCause::Other,
            message: format!("provider '{provider}' is not registered"),
        }
    }

    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub const fn cause(&self) -> FailureCause {
        self.cause
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn status_code(&self) -> Option<u16> {
        match self.cause {
            FailureCause::Status(status) => Some(status),
            _ => None,
        }
    }

    /// Returns a copy whose message has been passed through `scrub`.
    pub fn map_message(self, scrub: impl FnOnce(&str) -> String) -> Self {
        Self {
            message: scrub(&self.message),
            ..self
        }
    }

    pub const fn code(&self) -> &'static str {
        match self.kind {
            ErrorKind::Transient => "provider.transient",
            ErrorKind::Permanent => "provider.permanent",
            ErrorKind::CircuitOpen => "provider.circuit_open",
            ErrorKind::RetryExhausted => "provider.retry_exhausted",
            ErrorKind::DeadlineExceeded => "provider.deadline_exceeded",
            ErrorKind::UnknownProvider => "provider.unknown",
        }
    }
}

impl Display for ProviderError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code())
    }
}

impl std::error::Error for ProviderError {}

/// Marketplace integration contract.
///
/// One implementation exists per marketplace; the dispatcher only ever holds
/// `Arc<dyn Marketplace>`. Implementations translate transport failures into
/// [`ProviderError`] so the retry executor can classify them, and receive the
/// credential to use for each call through `auth` (`HttpAuth::None` for
/// providers that authenticate with their own static keys).
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync` as they are shared across dispatch units.
pub trait Marketplace: Send + Sync {
    /// Returns the provider identifier this integration registers under.
    fn id(&self) -> &ProviderId;

    fn authenticate<'a>(&'a self, auth: &'a HttpAuth) -> ProviderFuture<'a, bool>;

    /// Creates a listing and returns the marketplace-assigned listing id.
    fn create_listing<'a>(
        &'a self,
        auth: &'a HttpAuth,
        listing: &'a Listing,
    ) -> ProviderFuture<'a, String>;

    fn update_listing<'a>(
        &'a self,
        auth: &'a HttpAuth,
        provider_listing_id: &'a str,
        listing: &'a Listing,
    ) -> ProviderFuture<'a, UpdateAck>;

    fn delete_listing<'a>(
        &'a self,
        auth: &'a HttpAuth,
        provider_listing_id: &'a str,
    ) -> ProviderFuture<'a, bool>;

    fn fetch_listings<'a>(
        &'a self,
        auth: &'a HttpAuth,
        filter: &'a ListingFilter,
    ) -> ProviderFuture<'a, Vec<Listing>>;

    fn fetch_sales<'a>(
        &'a self,
        auth: &'a HttpAuth,
        range: &'a DateRange,
    ) -> ProviderFuture<'a, Vec<Sale>>;

    /// Marketplace fees charged on a sale of `amount`.
    fn compute_fees(&self, amount: f64) -> f64;

    fn health_check<'a>(&'a self, auth: &'a HttpAuth) -> ProviderFuture<'a, bool>;
}

/// Runs one operation against a marketplace and normalizes the result.
///
/// `false` from delete or health check is reported as a permanent failure.
pub(crate) async fn perform(
    marketplace: &dyn Marketplace,
    auth: &HttpAuth,
    operation: &Operation,
    provider_listing_id: Option<&str>,
) -> Result<OperationValue, ProviderError> {
    let listing_id = || {
        provider_listing_id.ok_or_else(|| {
            ProviderError::permanent(format!(
                "no listing id recorded for provider '{}'",
                marketplace.id()
            ))
        })
    };

    match operation {
        Operation::Create(listing) => marketplace
            .create_listing(auth, listing)
            .await
            .map(OperationValue::ListingId),
        Operation::Update(listing) => marketplace
            .update_listing(auth, listing_id()?, listing)
            .await
            .map(OperationValue::Updated),
        Operation::Delete => {
            if marketplace.delete_listing(auth, listing_id()?).await? {
                Ok(OperationValue::Deleted)
            } else {
                Err(ProviderError::permanent("provider declined deletion"))
            }
        }
        Operation::FetchListings(filter) => marketplace
            .fetch_listings(auth, filter)
            .await
            .map(OperationValue::Listings),
        Operation::FetchSales(range) => marketplace
            .fetch_sales(auth, range)
            .await
            .map(OperationValue::Sales),
        Operation::HealthCheck => {
            if marketplace.health_check(auth).await? {
                Ok(OperationValue::Healthy)
            } else {
                Err(ProviderError::permanent("health check reported unhealthy"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_errors_classify_transient_and_permanent() {
        assert_eq!(ProviderError::status(429, "slow down").kind(), ErrorKind::Transient);
        assert_eq!(ProviderError::status(503, "busy").kind(), ErrorKind::Transient);
        assert_eq!(ProviderError::status(404, "missing").kind(), ErrorKind::Permanent);
        assert_eq!(ProviderError::status(401, "denied").status_code(), Some(401));
    }

    #[test]
    fn retry_exhausted_preserves_cause_and_message() {
        let last = ProviderError::status(500, "upstream exploded");
        let exhausted = ProviderError::retry_exhausted(last, 4);

        assert_eq!(exhausted.kind(), ErrorKind::RetryExhausted);
        assert_eq!(exhausted.status_code(), Some(500));
        assert!(exhausted.message().contains("upstream exploded"));
        assert!(exhausted.message().contains("4 attempt"));
        assert_eq!(exhausted.code(), "provider.retry_exhausted");
    }

    #[test]
    fn display_includes_code() {
        let provider = ProviderId::parse("vinted").expect("valid id");
        let error = ProviderError::unknown_provider(&provider);
        assert_eq!(
            error.to_string(),
            "provider 'vinted' is not registered (provider.unknown)"
        );
    }

    #[test]
    fn map_message_keeps_classification() {
        let error = ProviderError::timeout("token abc leaked").map_message(|m| m.replace("abc", "***"));
        assert_eq!(error.kind(), ErrorKind::Transient);
        assert_eq!(error.cause(), FailureCause::Timeout);
        assert_eq!(error.message(), "token *** leaked");
    }

    #[test]
    fn only_update_and_delete_need_listing_ids() {
        let needing = OperationKind::ALL
            .into_iter()
            .filter(|kind| kind.needs_listing_id())
            .collect::<Vec<_>>();
        assert_eq!(needing, vec![OperationKind::Update, OperationKind::Delete]);
    }
}
