//! # Crosslist Core
//!
//! Multi-marketplace fan-out and resilience core for the crosslist inventory
//! toolkit.
//!
//! ## Overview
//!
//! One logical operation ("list this item everywhere") becomes one
//! independent unit of work per marketplace. Every unit runs through:
//!
//! - **OAuth token lifecycle** for providers with expiring credentials
//! - **Retry executor** with exponential backoff and jitter
//! - **Circuit breaker** per (provider, operation) pair
//! - **Rate limiting** per provider
//!
//! The caller always receives a [`DispatchOutcome`] with exactly one result
//! per targeted provider.
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`adapters`] | Marketplace adapters (in-memory sandbox) |
//! | [`circuit_breaker`] | Circuit breaker and per-provider registry |
//! | [`config`] | Provider and dispatcher settings |
//! | [`dispatch`] | Concurrent dispatcher and aggregate outcome |
//! | [`domain`] | Domain models (Listing, Sale, DateRange) |
//! | [`error`] | Core error types |
//! | [`events`] | Observability events and redaction |
//! | [`http_client`] | HTTP client abstraction |
//! | [`marketplace`] | Marketplace trait, operations and provider errors |
//! | [`oauth`] | OAuth token manager |
//! | [`provider_id`] | Provider identifiers |
//! | [`reports`] | Sales, health and sync summaries |
//! | [`retry`] | Retry policy and executor |
//! | [`throttling`] | Rate limiting support |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use crosslist_core::{Dispatcher, ItemCondition, Listing, ProviderSettings, SandboxMarketplace};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let dispatcher = Dispatcher::builder()
//!         .register(Arc::new(SandboxMarketplace::named("ebay")?), ProviderSettings::default())
//!         .register(Arc::new(SandboxMarketplace::named("etsy")?), ProviderSettings::default())
//!         .build()?;
//!
//!     let listing = Listing::new("sku-1", "Denim jacket", "Size M", 40.0, 1, ItemCondition::Good)?;
//!     let outcome = dispatcher
//!         .create_listing(listing, dispatcher.registered_providers())
//!         .await;
//!
//!     for (provider, listing_id) in outcome.created_listing_ids() {
//!         println!("{provider}: {listing_id}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  Caller         │
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐     ┌──────────────────┐
//! │  Dispatcher     │────▶│ Event Sink       │
//! └────────┬────────┘     └──────────────────┘
//!          │ one unit per provider
//!          ▼
//! ┌─────────────────┐     ┌──────────────────┐
//! │ Token Manager   │────▶│ HTTP Client      │
//! └────────┬────────┘     └──────────────────┘
//!          │
//!          ▼
//! ┌─────────────────┐     ┌──────────────────┐
//! │ Retry Executor  │────▶│ Circuit Breaker  │
//! └────────┬────────┘     └──────────────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ Marketplace     │
//! │ (Adapter Trait) │
//! └─────────────────┘
//! ```
//!
//! ## Error Handling
//!
//! Provider failures never abort a dispatch. They are reported per provider
//! with a structured kind:
//!
//! ```rust
//! use crosslist_core::{ErrorKind, ProviderError};
//!
//! fn handle_error(error: &ProviderError) {
//!     match error.kind() {
//!         ErrorKind::CircuitOpen => {
//!             // Provider is cooling down
//!         }
//!         ErrorKind::RetryExhausted => {
//!             // Every attempt failed transiently
//!         }
//!         ErrorKind::Permanent => {
//!             // Report to user
//!         }
//!         _ => {}
//!     }
//! }
//! ```
//!
//! ## Security
//!
//! - OAuth client credentials are read from environment variables only
//! - Credentials are redacted from every error message and event

pub mod adapters;
pub mod circuit_breaker;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod events;
pub mod http_client;
pub mod marketplace;
pub mod oauth;
pub mod provider_id;
pub mod reports;
pub mod retry;
pub mod throttling;

// Adapter implementations
pub use adapters::SandboxMarketplace;

// Circuit breaker
pub use circuit_breaker::{
    BreakerRegistry, CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitState,
};

// Settings
pub use config::{DispatcherConfig, OAuthSettings, ProviderSettings, RateLimit};

// Dispatcher
pub use dispatch::{
    DispatchOutcome, DispatchRequest, Dispatcher, DispatcherBuilder, FailureDetail, Outcome,
    ProviderResult,
};

// Domain models
pub use domain::{
    DateRange, FeeSchedule, ItemCondition, Listing, ListingFilter, ListingStatus, Sale,
    UtcDateTime,
};

// Error types
pub use error::{CoreError, ValidationError};

// Observability
pub use events::{redact, AttemptEvent, DispatchEvent, EventSink, RecordingEventSink, TracingEventSink};

// HTTP client types
pub use http_client::{
    HttpAuth, HttpClient, HttpError, HttpMethod, HttpRequest, HttpResponse, ReqwestHttpClient,
    ScriptedHttpClient,
};

// Marketplace contract
pub use marketplace::{
    ErrorKind, FailureCause, Marketplace, Operation, OperationKind, OperationValue, ProviderError,
    ProviderFuture, UpdateAck,
};

// OAuth
pub use oauth::{
    BearerToken, OAuthClientConfig, TokenError, TokenInfo, TokenManager, TokenPhase,
};

// Provider identifiers
pub use provider_id::ProviderId;

// Reports
pub use reports::{HealthReport, ProviderHealth, ProviderSales, SalesReport, SyncSummary};

// Retry logic
pub use retry::{AttemptObserver, AttemptReport, Backoff, RetryExecutor, RetryPolicy, RetryState};

// Throttling
pub use throttling::RequestThrottle;
