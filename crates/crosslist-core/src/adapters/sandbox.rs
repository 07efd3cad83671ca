use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::http_client::HttpAuth;
use crate::marketplace::{
    Marketplace, OperationKind, ProviderError, ProviderFuture, UpdateAck,
};
use crate::{
    DateRange, FeeSchedule, Listing, ListingFilter, ListingStatus, ProviderId, Sale, UtcDateTime,
    ValidationError,
};

/// Deterministic in-memory marketplace.
///
/// Listings live in a local map, sales are seeded by the caller, and failures
/// are scripted per operation. Every call that gets past authentication
/// counts as one network call in [`SandboxMarketplace::calls`].
#[derive(Debug)]
pub struct SandboxMarketplace {
    id: ProviderId,
    fees: FeeSchedule,
    latency: Duration,
    required_token: Option<String>,
    inner: Mutex<SandboxInner>,
}

#[derive(Debug, Default)]
struct SandboxInner {
    listings: BTreeMap<String, Listing>,
    sales: Vec<Sale>,
    next_listing: u64,
    healthy: bool,
    scripted: HashMap<OperationKind, VecDeque<ProviderError>>,
    persistent: HashMap<OperationKind, ProviderError>,
    calls: HashMap<OperationKind, u32>,
    auth_seen: Vec<HttpAuth>,
}

impl SandboxMarketplace {
    pub fn new(id: ProviderId) -> Self {
        Self {
            id,
            fees: FeeSchedule::default(),
            latency: Duration::ZERO,
            required_token: None,
            inner: Mutex::new(SandboxInner {
                healthy: true,
                ..SandboxInner::default()
            }),
        }
    }

    pub fn named(id: &str) -> Result<Self, ValidationError> {
        ProviderId::parse(id).map(Self::new)
    }

    pub fn with_fees(mut self, fees: FeeSchedule) -> Self {
        self.fees = fees;
        self
    }

    /// Simulated round-trip time of every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Rejects calls whose credential differs from `token` with a 401.
    pub fn with_required_token(mut self, token: impl Into<String>) -> Self {
        self.required_token = Some(token.into());
        self
    }

    /// Fails the next `times` calls of `kind` with `error`.
    pub fn fail_next(&self, kind: OperationKind, error: ProviderError, times: u32) {
        let mut inner = self.lock();
        let queue = inner.scripted.entry(kind).or_default();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    /// Fails every call of `kind` with `error` until cleared.
    pub fn fail_always(&self, kind: OperationKind, error: ProviderError) {
        self.lock().persistent.insert(kind, error);
    }

    pub fn clear_failures(&self, kind: OperationKind) {
        let mut inner = self.lock();
        inner.scripted.remove(&kind);
        inner.persistent.remove(&kind);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.lock().healthy = healthy;
    }

    pub fn add_sale(&self, sale: Sale) {
        self.lock().sales.push(sale);
    }

    /// Stores a listing directly and returns its marketplace id.
    pub fn seed_listing(&self, listing: Listing) -> String {
        let mut inner = self.lock();
        self.insert_listing(&mut inner, listing)
    }

    pub fn listing(&self, provider_listing_id: &str) -> Option<Listing> {
        self.lock().listings.get(provider_listing_id).cloned()
    }

    pub fn listing_count(&self) -> usize {
        self.lock().listings.len()
    }

    /// Number of calls of `kind` that reached the marketplace.
    pub fn calls(&self, kind: OperationKind) -> u32 {
        self.lock().calls.get(&kind).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.lock().calls.values().sum()
    }

    pub fn auth_seen(&self) -> Vec<HttpAuth> {
        self.lock().auth_seen.clone()
    }

    fn lock(&self) -> MutexGuard<'_, SandboxInner> {
        self.inner
            .lock()
            .expect("sandbox marketplace lock is not poisoned")
    }

    fn insert_listing(&self, inner: &mut SandboxInner, mut listing: Listing) -> String {
        inner.next_listing += 1;
        let listing_id = format!("{}-{:06}", self.id, inner.next_listing);
        listing.provider_listing_id = Some(listing_id.clone());
        listing.url = Some(format!(
            "https://sandbox.{}.example/listings/{listing_id}",
            self.id
        ));
        inner.listings.insert(listing_id.clone(), listing);
        listing_id
    }

    /// Simulates the network round trip and applies scripted failures.
    async fn round_trip(&self, kind: OperationKind, auth: &HttpAuth) -> Result<(), ProviderError> {
        {
            let mut inner = self.lock();
            *inner.calls.entry(kind).or_insert(0) += 1;
            inner.auth_seen.push(auth.clone());
        }

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if let Some(required) = &self.required_token {
            if !auth.secrets().contains(&required.as_str()) {
                return Err(ProviderError::status(
                    401,
                    format!("{} rejected credentials", self.id),
                ));
            }
        }

        let mut inner = self.lock();
        if let Some(error) = inner.scripted.get_mut(&kind).and_then(VecDeque::pop_front) {
            return Err(error);
        }
        if let Some(error) = inner.persistent.get(&kind) {
            return Err(error.clone());
        }
        Ok(())
    }
}

impl Marketplace for SandboxMarketplace {
    fn id(&self) -> &ProviderId {
        &self.id
    }

    fn authenticate<'a>(&'a self, auth: &'a HttpAuth) -> ProviderFuture<'a, bool> {
        Box::pin(async move {
            Ok(match &self.required_token {
                Some(required) => auth.secrets().contains(&required.as_str()),
                None => true,
            })
        })
    }

    fn create_listing<'a>(
        &'a self,
        auth: &'a HttpAuth,
        listing: &'a Listing,
    ) -> ProviderFuture<'a, String> {
        Box::pin(async move {
            self.round_trip(OperationKind::Create, auth).await?;
            listing
                .validate()
                .map_err(|error| ProviderError::status(422, error.to_string()))?;

            let mut inner = self.lock();
            Ok(self.insert_listing(&mut inner, listing.clone()))
        })
    }

    fn update_listing<'a>(
        &'a self,
        auth: &'a HttpAuth,
        provider_listing_id: &'a str,
        listing: &'a Listing,
    ) -> ProviderFuture<'a, UpdateAck> {
        Box::pin(async move {
            self.round_trip(OperationKind::Update, auth).await?;

            let mut inner = self.lock();
            let stored = inner.listings.get_mut(provider_listing_id).ok_or_else(|| {
                ProviderError::status(404, format!("listing {provider_listing_id} not found"))
            })?;

            let created_at = stored.created_at;
            let url = stored.url.take();
            *stored = listing.clone();
            stored.provider_listing_id = Some(provider_listing_id.to_owned());
            stored.url = url;
            stored.created_at = created_at;
            stored.updated_at = UtcDateTime::now();

            Ok(UpdateAck {
                provider_listing_id: provider_listing_id.to_owned(),
                updated_at: stored.updated_at,
            })
        })
    }

    fn delete_listing<'a>(
        &'a self,
        auth: &'a HttpAuth,
        provider_listing_id: &'a str,
    ) -> ProviderFuture<'a, bool> {
        Box::pin(async move {
            self.round_trip(OperationKind::Delete, auth).await?;
            Ok(self.lock().listings.remove(provider_listing_id).is_some())
        })
    }

    fn fetch_listings<'a>(
        &'a self,
        auth: &'a HttpAuth,
        filter: &'a ListingFilter,
    ) -> ProviderFuture<'a, Vec<Listing>> {
        Box::pin(async move {
            self.round_trip(OperationKind::FetchListings, auth).await?;

            let inner = self.lock();
            let matching = inner
                .listings
                .values()
                .filter(|listing| listing.status != ListingStatus::Deleted)
                .filter(|listing| filter.matches(listing))
                .take(filter.limit.unwrap_or(usize::MAX))
                .cloned()
                .collect();
            Ok(matching)
        })
    }

    fn fetch_sales<'a>(
        &'a self,
        auth: &'a HttpAuth,
        range: &'a DateRange,
    ) -> ProviderFuture<'a, Vec<Sale>> {
        Box::pin(async move {
            self.round_trip(OperationKind::FetchSales, auth).await?;

            let inner = self.lock();
            Ok(inner
                .sales
                .iter()
                .filter(|sale| range.contains(sale.sale_date))
                .cloned()
                .collect())
        })
    }

    fn compute_fees(&self, amount: f64) -> f64 {
        self.fees.fees_for(amount)
    }

    fn health_check<'a>(&'a self, auth: &'a HttpAuth) -> ProviderFuture<'a, bool> {
        Box::pin(async move {
            self.round_trip(OperationKind::HealthCheck, auth).await?;
            Ok(self.lock().healthy)
        })
    }
}
