//! Concurrent multi-marketplace dispatcher.
//!
//! A dispatch runs one unit of work per target provider. Each unit obtains a
//! credential, then drives the provider call through the retry executor and
//! that provider's circuit breaker. Units share a bounded worker pool and the
//! dispatcher waits for every unit before aggregating, so the returned
//! [`DispatchOutcome`] always holds exactly one [`ProviderResult`] per target.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use uuid::Uuid;

use crate::circuit_breaker::{BreakerRegistry, CircuitState};
use crate::config::{DispatcherConfig, ProviderSettings};
use crate::events::{redact, AttemptEvent, DispatchEvent, EventSink, TracingEventSink};
use crate::http_client::HttpAuth;
use crate::marketplace::{
    perform, ErrorKind, Marketplace, Operation, OperationKind, OperationValue, ProviderError,
};
use crate::oauth::TokenManager;
use crate::retry::{AttemptObserver, AttemptReport, RetryExecutor};
use crate::throttling::RequestThrottle;
use crate::{CoreError, DateRange, Listing, ListingFilter, ProviderId, ValidationError};

/// One logical operation aimed at a set of providers.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub operation: Operation,
    pub targets: Vec<ProviderId>,
    /// Marketplace listing ids for update/delete, keyed by provider.
    pub listing_ids: BTreeMap<ProviderId, String>,
    /// Overall time budget; falls back to the dispatcher default.
    pub deadline: Option<Duration>,
}

impl DispatchRequest {
    pub fn new(operation: Operation, targets: impl IntoIterator<Item = ProviderId>) -> Self {
        Self {
            operation,
            targets: targets.into_iter().collect(),
            listing_ids: BTreeMap::new(),
            deadline: None,
        }
    }

    pub fn with_listing_id(mut self, provider: ProviderId, listing_id: impl Into<String>) -> Self {
        self.listing_ids.insert(provider, listing_id.into());
        self
    }

    pub fn with_listing_ids(mut self, listing_ids: BTreeMap<ProviderId, String>) -> Self {
        self.listing_ids.extend(listing_ids);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Failure recorded for one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureDetail {
    pub kind: ErrorKind,
    pub code: String,
    /// Provider error text with credentials masked.
    pub message: String,
    pub status: Option<u16>,
}

impl FailureDetail {
    fn from_error(error: &ProviderError, secrets: &[&str]) -> Self {
        Self {
            kind: error.kind(),
            code: error.code().to_owned(),
            message: redact(error.message(), secrets),
            status: error.status_code(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum Outcome {
    Success(OperationValue),
    Failure(FailureDetail),
}

/// Terminal result of one (operation, provider) unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderResult {
    pub provider: ProviderId,
    pub operation: OperationKind,
    pub outcome: Outcome,
    pub elapsed_ms: u64,
    /// Provider calls made, 0 when the unit failed before reaching the network.
    pub attempts: u32,
}

impl ProviderResult {
    fn failure(
        provider: ProviderId,
        operation: OperationKind,
        error: &ProviderError,
        elapsed_ms: u64,
        attempts: u32,
    ) -> Self {
        Self {
            provider,
            operation,
            outcome: Outcome::Failure(FailureDetail::from_error(error, &[])),
            elapsed_ms,
            attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success(_))
    }

    pub fn value(&self) -> Option<&OperationValue> {
        match &self.outcome {
            Outcome::Success(value) => Some(value),
            Outcome::Failure(_) => None,
        }
    }

    pub fn failure_detail(&self) -> Option<&FailureDetail> {
        match &self.outcome {
            Outcome::Success(_) => None,
            Outcome::Failure(detail) => Some(detail),
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.failure_detail().map(|detail| detail.kind)
    }
}

/// Aggregate account of one dispatch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchOutcome {
    pub dispatch_id: Uuid,
    pub operation: OperationKind,
    pub successful_providers: BTreeSet<ProviderId>,
    pub failed_providers: BTreeSet<ProviderId>,
    pub results: BTreeMap<ProviderId, ProviderResult>,
    /// At least one provider succeeded.
    pub overall_success: bool,
    /// At least one provider succeeded and at least one failed.
    pub partial_success: bool,
    pub total_elapsed_ms: u64,
    /// Set when the dispatch could not address any provider.
    pub error: Option<String>,
}

impl DispatchOutcome {
    fn from_results(
        dispatch_id: Uuid,
        operation: OperationKind,
        results: BTreeMap<ProviderId, ProviderResult>,
        total_elapsed_ms: u64,
    ) -> Self {
        let (successful, failed): (Vec<_>, Vec<_>) =
            results.values().partition(|result| result.is_success());
        let successful_providers = successful
            .into_iter()
            .map(|result| result.provider.clone())
            .collect::<BTreeSet<_>>();
        let failed_providers = failed
            .into_iter()
            .map(|result| result.provider.clone())
            .collect::<BTreeSet<_>>();

        let overall_success = !successful_providers.is_empty();
        Self {
            dispatch_id,
            operation,
            partial_success: overall_success && !failed_providers.is_empty(),
            overall_success,
            successful_providers,
            failed_providers,
            results,
            total_elapsed_ms,
            error: None,
        }
    }

    pub fn result(&self, provider: &ProviderId) -> Option<&ProviderResult> {
        self.results.get(provider)
    }

    /// True when every targeted provider succeeded.
    pub fn all_succeeded(&self) -> bool {
        self.overall_success && self.failed_providers.is_empty()
    }

    /// Marketplace listing ids returned by a create dispatch.
    pub fn created_listing_ids(&self) -> BTreeMap<ProviderId, String> {
        self.results
            .iter()
            .filter_map(|(provider, result)| match result.value() {
                Some(OperationValue::ListingId(listing_id)) => {
                    Some((provider.clone(), listing_id.clone()))
                }
                _ => None,
            })
            .collect()
    }

    pub fn to_event(&self) -> DispatchEvent {
        DispatchEvent {
            dispatch_id: self.dispatch_id,
            operation: self.operation,
            successful_providers: self.successful_providers.iter().cloned().collect(),
            failed_providers: self.failed_providers.iter().cloned().collect(),
            overall_success: self.overall_success,
            partial_success: self.partial_success,
            total_elapsed_ms: self.total_elapsed_ms,
            error: self.error.clone(),
        }
    }
}

struct ProviderEntry {
    marketplace: Arc<dyn Marketplace>,
    settings: ProviderSettings,
    tokens: Option<Arc<TokenManager>>,
    static_auth: HttpAuth,
    throttle: Option<RequestThrottle>,
}

struct Shared {
    config: DispatcherConfig,
    providers: HashMap<ProviderId, ProviderEntry>,
    breakers: BreakerRegistry,
    pool: Arc<Semaphore>,
    sink: Arc<dyn EventSink>,
}

/// Builder for a [`Dispatcher`].
pub struct DispatcherBuilder {
    config: DispatcherConfig,
    registrations: Vec<(Arc<dyn Marketplace>, ProviderSettings)>,
    token_managers: HashMap<ProviderId, TokenManager>,
    static_auth: HashMap<ProviderId, HttpAuth>,
    sink: Arc<dyn EventSink>,
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self {
            config: DispatcherConfig::default(),
            registrations: Vec::new(),
            token_managers: HashMap::new(),
            static_auth: HashMap::new(),
            sink: Arc::new(TracingEventSink),
        }
    }
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.config.max_concurrency = max_concurrency;
        self
    }

    pub fn with_default_deadline(mut self, deadline: Duration) -> Self {
        self.config.default_deadline = Some(deadline);
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Adds a marketplace. Disabled settings leave it unregistered.
    pub fn register(mut self, marketplace: Arc<dyn Marketplace>, settings: ProviderSettings) -> Self {
        self.registrations.push((marketplace, settings));
        self
    }

    /// Supplies OAuth credentials for the token manager's provider.
    pub fn with_token_manager(mut self, token_manager: TokenManager) -> Self {
        self.token_managers
            .insert(token_manager.provider().clone(), token_manager);
        self
    }

    /// Fixed credential for providers that do not use OAuth.
    pub fn with_static_auth(mut self, provider: ProviderId, auth: HttpAuth) -> Self {
        self.static_auth.insert(provider, auth);
        self
    }

    pub fn build(mut self) -> Result<Dispatcher, CoreError> {
        self.config.validate()?;

        let mut providers = HashMap::new();
        let mut breakers = BreakerRegistry::new();

        for (marketplace, settings) in self.registrations {
            let provider = marketplace.id().clone();
            settings.validate()?;
            if providers.contains_key(&provider) {
                return Err(ValidationError::InvalidSetting {
                    field: "providers",
                    reason: format!("provider '{provider}' registered twice"),
                }
                .into());
            }
            if !settings.enabled {
                tracing::info!(provider = %provider, "provider disabled; not registered");
                self.token_managers.remove(&provider);
                continue;
            }

            let tokens = self.token_managers.remove(&provider).map(|manager| {
                let manager = match settings.oauth {
                    Some(oauth) => manager.with_settings(oauth),
                    None => manager,
                };
                Arc::new(manager)
            });

            breakers.configure(provider.clone(), settings.circuit_breaker);
            let entry = ProviderEntry {
                static_auth: self.static_auth.remove(&provider).unwrap_or(HttpAuth::None),
                throttle: settings.rate_limit.map(RequestThrottle::new),
                marketplace,
                settings,
                tokens,
            };
            tracing::info!(provider = %provider, oauth = entry.tokens.is_some(), "provider registered");
            providers.insert(provider, entry);
        }

        if let Some(orphan) = self.token_managers.keys().next() {
            return Err(ValidationError::InvalidSetting {
                field: "token_managers",
                reason: format!("no marketplace registered for provider '{orphan}'"),
            }
            .into());
        }

        Ok(Dispatcher {
            shared: Arc::new(Shared {
                pool: Arc::new(Semaphore::new(self.config.max_concurrency)),
                config: self.config,
                providers,
                breakers,
                sink: self.sink,
            }),
        })
    }
}

/// Fans logical operations out to registered marketplaces.
///
/// Cloning is cheap; clones share providers, breakers, token state and the
/// worker pool.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    pub fn config(&self) -> DispatcherConfig {
        self.shared.config
    }

    pub fn registered_providers(&self) -> Vec<ProviderId> {
        let mut providers = self.shared.providers.keys().cloned().collect::<Vec<_>>();
        providers.sort();
        providers
    }

    pub fn token_manager(&self, provider: &ProviderId) -> Option<Arc<TokenManager>> {
        self.shared
            .providers
            .get(provider)
            .and_then(|entry| entry.tokens.clone())
    }

    pub fn breaker_state(&self, provider: &ProviderId, operation: OperationKind) -> CircuitState {
        self.shared.breakers.state(provider, operation)
    }

    /// Fees `provider` would charge on a sale of `amount`.
    pub fn compute_fees(&self, provider: &ProviderId, amount: f64) -> Option<f64> {
        self.shared
            .providers
            .get(provider)
            .map(|entry| entry.marketplace.compute_fees(amount))
    }

    /// Runs `request` against every target and waits for all of them.
    ///
    /// Never fails as a whole: unknown providers, invalid payloads, breaker
    /// rejections and deadline expiry all become per-provider failures.
    pub async fn dispatch(&self, request: DispatchRequest) -> DispatchOutcome {
        let started = Instant::now();
        let dispatch_id = Uuid::new_v4();
        let operation_kind = request.operation.kind();
        let targets = dedupe_targets(&request.targets);

        if targets.is_empty() {
            let mut outcome =
                DispatchOutcome::from_results(dispatch_id, operation_kind, BTreeMap::new(), 0);
            outcome.error = Some(String::from("no target providers supplied"));
            self.shared.sink.on_dispatch(&outcome.to_event());
            return outcome;
        }

        let deadline_budget = request.deadline.or(self.shared.config.default_deadline);
        let deadline = deadline_budget.map(|budget| started + budget);
        let payload_error = request.operation.listing().and_then(|listing| {
            listing
                .validate()
                .err()
                .map(|error| ProviderError::permanent(format!("invalid listing: {error}")))
        });
        let operation = Arc::new(request.operation);

        let mut results = BTreeMap::new();
        let mut units = JoinSet::new();

        for provider in &targets {
            let early_failure = if !self.shared.providers.contains_key(provider) {
                Some(ProviderError::unknown_provider(provider))
            } else if let Some(error) = &payload_error {
                Some(error.clone())
            } else if operation_kind.needs_listing_id() && !request.listing_ids.contains_key(provider)
            {
                Some(ProviderError::permanent(format!(
                    "no listing id recorded for provider '{provider}'"
                )))
            } else {
                None
            };

            if let Some(error) = early_failure {
                let result = ProviderResult::failure(provider.clone(), operation_kind, &error, 0, 0);
                results.insert(provider.clone(), result);
                continue;
            }

            let unit = DispatchUnit {
                shared: Arc::clone(&self.shared),
                dispatch_id,
                provider: provider.clone(),
                operation: Arc::clone(&operation),
                listing_id: request.listing_ids.get(provider).cloned(),
                deadline,
                deadline_ms: deadline_budget.map(duration_ms).unwrap_or_default(),
            };
            units.spawn(unit.run());
        }

        while let Some(joined) = units.join_next().await {
            match joined {
                Ok(result) => {
                    results.insert(result.provider.clone(), result);
                }
                Err(error) => {
                    tracing::error!(%dispatch_id, error = %error, "dispatch unit aborted");
                }
            }
        }

        for provider in &targets {
            if !results.contains_key(provider) {
                let error = ProviderError::permanent("dispatch unit terminated unexpectedly");
                let result = ProviderResult::failure(
                    provider.clone(),
                    operation_kind,
                    &error,
                    elapsed_ms(started),
                    0,
                );
                results.insert(provider.clone(), result);
            }
        }

        let mut outcome =
            DispatchOutcome::from_results(dispatch_id, operation_kind, results, elapsed_ms(started));
        let none_registered = outcome
            .results
            .values()
            .all(|result| result.error_kind() == Some(ErrorKind::UnknownProvider));
        if none_registered {
            outcome.error = Some(String::from("none of the target providers is registered"));
        }
        self.shared.sink.on_dispatch(&outcome.to_event());
        outcome
    }

    pub async fn create_listing(
        &self,
        listing: Listing,
        targets: impl IntoIterator<Item = ProviderId>,
    ) -> DispatchOutcome {
        self.dispatch(DispatchRequest::new(Operation::Create(listing), targets))
            .await
    }

    /// Updates the listing on every provider present in `listing_ids`.
    pub async fn update_listing(
        &self,
        listing: Listing,
        listing_ids: BTreeMap<ProviderId, String>,
    ) -> DispatchOutcome {
        let targets = listing_ids.keys().cloned().collect::<Vec<_>>();
        self.dispatch(
            DispatchRequest::new(Operation::Update(listing), targets).with_listing_ids(listing_ids),
        )
        .await
    }

    /// Deletes the listing on every provider present in `listing_ids`.
    pub async fn delete_listing(&self, listing_ids: BTreeMap<ProviderId, String>) -> DispatchOutcome {
        let targets = listing_ids.keys().cloned().collect::<Vec<_>>();
        self.dispatch(DispatchRequest::new(Operation::Delete, targets).with_listing_ids(listing_ids))
            .await
    }

    /// Fetches listings from every registered provider.
    pub async fn sync_listings(&self, filter: ListingFilter) -> DispatchOutcome {
        self.dispatch(DispatchRequest::new(
            Operation::FetchListings(filter),
            self.registered_providers(),
        ))
        .await
    }

    /// Fetches sales in `range` from every registered provider.
    pub async fn fetch_sales(&self, range: DateRange) -> DispatchOutcome {
        self.dispatch(DispatchRequest::new(
            Operation::FetchSales(range),
            self.registered_providers(),
        ))
        .await
    }

    pub async fn health_check(&self) -> DispatchOutcome {
        self.dispatch(DispatchRequest::new(
            Operation::HealthCheck,
            self.registered_providers(),
        ))
        .await
    }

    /// Asks every registered provider whether its credential is accepted.
    pub async fn authenticate_all(&self) -> BTreeMap<ProviderId, Result<bool, ProviderError>> {
        let mut checks = JoinSet::new();
        for provider in self.registered_providers() {
            let shared = Arc::clone(&self.shared);
            checks.spawn(async move {
                let result = match shared.providers.get(&provider) {
                    Some(entry) => match resolve_auth(entry).await {
                        Ok(auth) => entry.marketplace.authenticate(&auth).await,
                        Err(error) => Err(error),
                    },
                    None => Err(ProviderError::unknown_provider(&provider)),
                };
                (provider, result)
            });
        }

        let mut results = BTreeMap::new();
        while let Some(joined) = checks.join_next().await {
            match joined {
                Ok((provider, result)) => {
                    results.insert(provider, result);
                }
                Err(error) => tracing::error!(error = %error, "authentication check aborted"),
            }
        }
        results
    }
}

/// Work for one provider within one dispatch.
struct DispatchUnit {
    shared: Arc<Shared>,
    dispatch_id: Uuid,
    provider: ProviderId,
    operation: Arc<Operation>,
    listing_id: Option<String>,
    deadline: Option<Instant>,
    deadline_ms: u64,
}

impl DispatchUnit {
    async fn run(self) -> ProviderResult {
        let started = Instant::now();
        let attempts = AtomicU32::new(0);
        let secrets = std::sync::Mutex::new(Vec::<String>::new());

        let work = self.execute(&attempts, &secrets);
        let result = match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, work)
                .await
                .unwrap_or_else(|_| Err(ProviderError::deadline_exceeded(self.deadline_ms))),
            None => work.await,
        };

        let secrets = secrets
            .into_inner()
            .expect("dispatch unit secret list is not poisoned");
        let secrets = secrets.iter().map(String::as_str).collect::<Vec<_>>();
        let outcome = match result {
            Ok(value) => Outcome::Success(value),
            Err(error) => Outcome::Failure(FailureDetail::from_error(&error, &secrets)),
        };

        ProviderResult {
            provider: self.provider,
            operation: self.operation.kind(),
            outcome,
            elapsed_ms: elapsed_ms(started),
            attempts: attempts.load(Ordering::SeqCst),
        }
    }

    async fn execute(
        &self,
        attempts: &AtomicU32,
        secrets: &std::sync::Mutex<Vec<String>>,
    ) -> Result<OperationValue, ProviderError> {
        let entry = self
            .shared
            .providers
            .get(&self.provider)
            .ok_or_else(|| ProviderError::unknown_provider(&self.provider))?;

        let _slot = Arc::clone(&self.shared.pool)
            .acquire_owned()
            .await
            .map_err(|_| ProviderError::permanent("dispatcher worker pool is closed"))?;

        let auth = resolve_auth(entry).await?;
        secrets
            .lock()
            .expect("dispatch unit secret list is not poisoned")
            .extend(auth.secrets().into_iter().map(str::to_owned));

        let operation_kind = self.operation.kind();
        let breaker = self.shared.breakers.breaker(&self.provider, operation_kind);
        let observer = UnitObserver {
            unit: self,
            operation: operation_kind,
            secrets: auth.secrets(),
        };

        RetryExecutor::new(&entry.settings.retry)
            .with_breaker(&breaker)
            .with_observer(&observer)
            .execute(|_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                let auth = &auth;
                async move {
                    if let Some(throttle) = &entry.throttle {
                        throttle.ready().await;
                    }
                    perform(
                        entry.marketplace.as_ref(),
                        auth,
                        &self.operation,
                        self.listing_id.as_deref(),
                    )
                    .await
                }
            })
            .await
    }
}

/// Turns retry attempt reports into observability events.
struct UnitObserver<'a> {
    unit: &'a DispatchUnit,
    operation: OperationKind,
    secrets: Vec<&'a str>,
}

impl AttemptObserver for UnitObserver<'_> {
    fn on_attempt(&self, report: &AttemptReport) {
        let event = AttemptEvent {
            dispatch_id: self.unit.dispatch_id,
            provider: self.unit.provider.clone(),
            operation: self.operation,
            attempt: report.attempt_index + 1,
            elapsed_ms: duration_ms(report.elapsed),
            success: report.succeeded(),
            status: report.error.as_ref().and_then(ProviderError::status_code),
            error_kind: report.error.as_ref().map(ProviderError::kind),
            error: report
                .error
                .as_ref()
                .map(|error| redact(error.message(), &self.secrets)),
            next_backoff_ms: report.next_backoff.map(duration_ms),
        };
        self.unit.shared.sink.on_attempt(&event);
    }
}

async fn resolve_auth(entry: &ProviderEntry) -> Result<HttpAuth, ProviderError> {
    match &entry.tokens {
        Some(tokens) => Ok(tokens.authorization_header().await?),
        None => Ok(entry.static_auth.clone()),
    }
}

fn dedupe_targets(targets: &[ProviderId]) -> Vec<ProviderId> {
    let mut seen = HashSet::new();
    let mut output = Vec::with_capacity(targets.len());

    for provider in targets {
        if seen.insert(provider) {
            output.push(provider.clone());
        }
    }

    output
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn elapsed_ms(started: Instant) -> u64 {
    duration_ms(started.elapsed())
}
