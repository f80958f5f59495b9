//! Exchange-rate providers: rate table, cache, and refresh coordination.
//!
//! A provider composes two pieces:
//! - a [`RateFetcher`] that pulls a fresh [`RateTable`] from an upstream
//!   source (see [`cbr`] for the concrete one), and
//! - a [`CacheEntry`] guarding how often that fetch actually happens.
//!
//! [`RateService`] ties them together behind an async mutex: the first
//! caller to find the cache stale performs the fetch while holding the
//! lock, so concurrent callers block and then reuse the freshly stored
//! table. At most one upstream fetch is ever in flight.
//!
//! Consumers see only the [`ExchangeRate`] capability trait plus the free
//! function [`convert`] built on top of it.

pub mod cbr;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::ServiceError;

/// Rates keyed by reference currency, then by quoted currency code.
///
/// A stored rate `v` under `(ref, code)` is the price of 1 unit of `code`
/// expressed in `ref` units. Codes are lower-cased. The table is
/// single-level: conversions never chain through a third currency.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateTable {
    rates: HashMap<String, HashMap<String, Decimal>>,
}

impl RateTable {
    /// An empty table; every lookup fails as unsupported.
    pub fn new() -> Self {
        RateTable::default()
    }

    /// A table holding one reference currency and its quoted rates.
    pub fn single(reference: &str, rates: HashMap<String, Decimal>) -> Self {
        let mut table = HashMap::new();
        table.insert(reference.to_lowercase(), rates);
        RateTable { rates: table }
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }

    /// Number of quoted rates across all reference currencies.
    pub fn len(&self) -> usize {
        self.rates.values().map(|inner| inner.len()).sum()
    }

    /// Resolve the rate multiplier for converting `base` into `target`.
    ///
    /// With `base` as the reference currency the stored price of `target`
    /// is inverted (1 ref unit buys `1/v` target units); with `target` as
    /// the reference the stored price of `base` applies directly. Any other
    /// pairing is unsupported.
    pub fn rate(&self, base: &str, target: &str) -> Result<Decimal, ServiceError> {
        if let Some(quoted) = self.rates.get(base) {
            let stored = quoted
                .get(target)
                .ok_or_else(|| ServiceError::CurrencyNotSupported(target.to_string()))?;
            // Fetchers only store positive rates; a zero simply never
            // resolves rather than dividing by zero.
            return Decimal::ONE
                .checked_div(*stored)
                .ok_or_else(|| ServiceError::CurrencyNotSupported(target.to_string()));
        }

        if let Some(quoted) = self.rates.get(target) {
            if let Some(stored) = quoted.get(base) {
                return Ok(*stored);
            }
        }

        Err(ServiceError::CurrencyNotSupported(base.to_string()))
    }
}

/// The cached table plus its expiry instant.
///
/// Replaced wholesale on every successful refresh, never partially mutated.
/// An unset expiry means the entry is permanently stale and every call
/// refreshes.
#[derive(Debug)]
struct CacheEntry {
    table: Arc<RateTable>,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn empty() -> Self {
        CacheEntry {
            table: Arc::new(RateTable::new()),
            expires_at: None,
        }
    }

    /// Fresh iff the current instant is strictly before the expiry.
    fn is_fresh(&self) -> bool {
        self.expires_at.is_some_and(|expiry| Instant::now() < expiry)
    }

    fn replace(&mut self, table: RateTable, lifetime: Duration) {
        self.table = Arc::new(table);
        self.expires_at = if lifetime.is_zero() {
            None
        } else {
            Some(Instant::now() + lifetime)
        };
    }
}

/// Source of fresh rate tables, one per upstream service.
#[async_trait]
pub trait RateFetcher: Send + Sync {
    async fn fetch(&self) -> Result<RateTable, ServiceError>;
}

/// Capability exposed to the router: look up a conversion rate.
#[async_trait]
pub trait ExchangeRate: Send + Sync {
    /// Current multiplier for converting `base` amounts into `target`.
    async fn rate(&self, base: &str, target: &str) -> Result<Decimal, ServiceError>;
}

/// Convert `amount` (a decimal literal) from `base` into `target`.
///
/// Built once over the [`ExchangeRate`] capability rather than on each
/// provider. The result carries exactly two fractional digits, rounded
/// half-to-even.
pub async fn convert<P>(
    provider: &P,
    base: &str,
    target: &str,
    amount: &str,
) -> Result<Decimal, ServiceError>
where
    P: ExchangeRate + ?Sized,
{
    let rate = provider.rate(base, target).await?;
    let amount: Decimal = amount.parse().map_err(|_| ServiceError::AmountNotValid)?;

    // checked_mul keeps absurdly large amounts from panicking the handler.
    let mut result = amount
        .checked_mul(rate)
        .ok_or(ServiceError::AmountNotValid)?
        .round_dp(2);
    result.rescale(2);
    Ok(result)
}

/// A caching provider wrapping a [`RateFetcher`].
///
/// The mutex serializes refreshes: the critical section covers the
/// freshness check, the fetch, and the wholesale replacement, and is
/// released before any rate arithmetic. A failed fetch propagates the
/// error and leaves the previous entry untouched; the next caller simply
/// retries.
pub struct RateService<F> {
    service: &'static str,
    fetcher: F,
    cache_lifetime: Duration,
    cache: Mutex<CacheEntry>,
}

impl<F: RateFetcher> RateService<F> {
    /// A provider with an empty, stale cache.
    ///
    /// `cache_lifetime` of zero disables caching entirely: every call
    /// performs a fetch.
    pub fn new(service: &'static str, fetcher: F, cache_lifetime: Duration) -> Self {
        RateService {
            service,
            fetcher,
            cache_lifetime,
            cache: Mutex::new(CacheEntry::empty()),
        }
    }

    /// Return the current table, refreshing it under the lock if stale.
    async fn fresh_table(&self) -> Result<Arc<RateTable>, ServiceError> {
        let mut cache = self.cache.lock().await;
        if !cache.is_fresh() {
            debug!(service = self.service, "Cache miss");
            let table = self.fetcher.fetch().await?;
            info!(
                service = self.service,
                rates = table.len(),
                "Rate table refreshed"
            );
            cache.replace(table, self.cache_lifetime);
        } else {
            debug!(service = self.service, "Cache hit");
        }
        Ok(Arc::clone(&cache.table))
    }
}

#[async_trait]
impl<F: RateFetcher> ExchangeRate for RateService<F> {
    async fn rate(&self, base: &str, target: &str) -> Result<Decimal, ServiceError> {
        // The lock is dropped inside fresh_table; lookup runs unlocked on
        // the shared snapshot.
        let table = self.fresh_table().await?;
        table.rate(base, target)
    }
}
