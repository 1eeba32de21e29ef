use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use et_domain::{MarketKey, OrderBook, OrderBookSource};
use metrics::counter;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::warn;

/// A stored order book plus the moment it entered the cache.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub book: OrderBook,
    pub cached_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staleness {
    Fresh,
    StaleAcceptable,
    StaleReject,
}

#[derive(Debug, Clone, Copy)]
pub struct StalenessPolicy {
    pub fresh_max_age: Duration,
    pub stale_max_age: Duration,
}

impl StalenessPolicy {
    pub fn classify(&self, age: TimeDelta) -> Staleness {
        let age = age.to_std().unwrap_or(Duration::ZERO);
        if age <= self.fresh_max_age {
            Staleness::Fresh
        } else if age <= self.stale_max_age {
            Staleness::StaleAcceptable
        } else {
            Staleness::StaleReject
        }
    }
}

/// Key-value backend with per-entry TTL. Every write is a full replacement,
/// so no invalidation API is needed.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: MarketKey) -> anyhow::Result<Option<CacheEntry>>;
    async fn put(&self, key: MarketKey, entry: CacheEntry, ttl: Duration) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryCacheStore {
    entries: RwLock<HashMap<MarketKey, (CacheEntry, DateTime<Utc>)>>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: MarketKey) -> anyhow::Result<Option<CacheEntry>> {
        let guard = self.entries.read().await;
        Ok(guard
            .get(&key)
            .filter(|(_, expires_at)| *expires_at > Utc::now())
            .map(|(entry, _)| entry.clone()))
    }

    async fn put(&self, key: MarketKey, entry: CacheEntry, ttl: Duration) -> anyhow::Result<()> {
        let expires_at = Utc::now() + TimeDelta::from_std(ttl)?;
        self.entries.write().await.insert(key, (entry, expires_at));
        Ok(())
    }
}

/// What a cache lookup tells the worker to do next.
#[derive(Debug, Clone)]
pub enum Lookup {
    Fresh(OrderBook),
    /// Usable now, but a background refresh is warranted.
    StaleAcceptable(OrderBook),
    Miss,
}

/// Cache-aside wrapper over a [`CacheStore`]. Backend failures never reach
/// the caller: a failing `get` is a miss, a failing `put` a no-op.
pub struct MarketCache {
    store: Arc<dyn CacheStore>,
    policy: StalenessPolicy,
    ttl: Duration,
}

impl MarketCache {
    pub fn new(store: Arc<dyn CacheStore>, policy: StalenessPolicy, ttl: Duration) -> Self {
        MarketCache { store, policy, ttl }
    }

    pub async fn get(&self, key: MarketKey) -> Lookup {
        let entry = match self.store.get(key).await {
            Ok(entry) => entry,
            Err(error) => {
                warn!(key = %key, %error, "cache backend failed on get, proceeding without cache");
                counter!("market_cache_errors_total", "op" => "get").increment(1);
                None
            }
        };

        let Some(entry) = entry else {
            counter!("market_cache_lookups_total", "outcome" => "miss").increment(1);
            return Lookup::Miss;
        };

        let age = Utc::now() - entry.book.fetched_at;
        match self.policy.classify(age) {
            Staleness::Fresh => {
                counter!("market_cache_lookups_total", "outcome" => "hit").increment(1);
                Lookup::Fresh(entry.book.with_source(OrderBookSource::Cached))
            }
            Staleness::StaleAcceptable => {
                counter!("market_cache_lookups_total", "outcome" => "stale").increment(1);
                Lookup::StaleAcceptable(entry.book.with_source(OrderBookSource::Cached))
            }
            Staleness::StaleReject => {
                counter!("market_cache_lookups_total", "outcome" => "miss").increment(1);
                Lookup::Miss
            }
        }
    }

    pub async fn put(&self, key: MarketKey, book: &OrderBook) {
        // only fully drained books are cached
        if book.source == OrderBookSource::Partial {
            return;
        }
        let entry = CacheEntry {
            book: book.clone(),
            cached_at: Utc::now(),
        };
        if let Err(error) = self.store.put(key, entry, self.ttl).await {
            warn!(key = %key, %error, "cache backend failed on put, result not cached");
            counter!("market_cache_errors_total", "op" => "put").increment(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use et_domain::{LocationId, Order, OrderId, RegionId, TypeId};

    const KEY: MarketKey = MarketKey {
        region_id: RegionId(10000002),
        type_id: TypeId(34),
    };

    fn policy() -> StalenessPolicy {
        StalenessPolicy {
            fresh_max_age: Duration::from_secs(300),
            stale_max_age: Duration::from_secs(1_800),
        }
    }

    fn book_fetched_at(fetched_at: DateTime<Utc>, ask_price: f64) -> OrderBook {
        let order = Order {
            order_id: OrderId(1),
            is_buy: false,
            price: ask_price,
            volume_remaining: 100,
            min_volume: 1,
            location_id: LocationId(60003760),
            issued_at: fetched_at,
            duration_days: 90,
        };
        OrderBook::from_orders(KEY, vec![order], fetched_at, OrderBookSource::Live)
    }

    fn cache_with_store(store: Arc<dyn CacheStore>) -> MarketCache {
        MarketCache::new(store, policy(), Duration::from_secs(3_600))
    }

    #[tokio::test]
    async fn classifies_fresh_stale_and_rejected_entries() {
        let cache = cache_with_store(Arc::new(InMemoryCacheStore::new()));

        cache.put(KEY, &book_fetched_at(Utc::now(), 5.0)).await;
        assert!(matches!(cache.get(KEY).await, Lookup::Fresh(_)));

        cache.put(KEY, &book_fetched_at(Utc::now() - TimeDelta::seconds(600), 5.0)).await;
        assert!(matches!(cache.get(KEY).await, Lookup::StaleAcceptable(_)));

        cache.put(KEY, &book_fetched_at(Utc::now() - TimeDelta::seconds(7_200), 5.0)).await;
        assert!(matches!(cache.get(KEY).await, Lookup::Miss));
    }

    #[tokio::test]
    async fn read_after_write_sees_the_new_entry() {
        let cache = cache_with_store(Arc::new(InMemoryCacheStore::new()));

        cache.put(KEY, &book_fetched_at(Utc::now(), 5.0)).await;
        cache.put(KEY, &book_fetched_at(Utc::now(), 9.0)).await;

        let Lookup::Fresh(book) = cache.get(KEY).await else {
            panic!("expected a fresh hit");
        };
        assert_eq!(book.best_ask().unwrap().price, 9.0);
        assert_eq!(book.source, OrderBookSource::Cached);
    }

    #[tokio::test]
    async fn backend_get_failure_degrades_to_a_miss() {
        let mut store = MockCacheStore::new();
        store.expect_get().returning(|_| Err(anyhow!("backend down")));

        let cache = cache_with_store(Arc::new(store));
        assert!(matches!(cache.get(KEY).await, Lookup::Miss));
    }

    #[tokio::test]
    async fn backend_put_failure_is_swallowed() {
        let mut store = MockCacheStore::new();
        store.expect_put().returning(|_, _, _| Err(anyhow!("backend down")));

        let cache = cache_with_store(Arc::new(store));
        cache.put(KEY, &book_fetched_at(Utc::now(), 5.0)).await;
    }

    #[tokio::test]
    async fn expired_ttl_entries_are_gone() {
        let store = Arc::new(InMemoryCacheStore::new());
        let cache = MarketCache::new(store, policy(), Duration::ZERO);

        cache.put(KEY, &book_fetched_at(Utc::now(), 5.0)).await;
        assert!(matches!(cache.get(KEY).await, Lookup::Miss));
    }

    #[tokio::test]
    async fn partial_books_are_not_cached() {
        let cache = cache_with_store(Arc::new(InMemoryCacheStore::new()));

        let partial = book_fetched_at(Utc::now(), 5.0).with_source(OrderBookSource::Partial);
        cache.put(KEY, &partial).await;

        assert!(matches!(cache.get(KEY).await, Lookup::Miss));
    }
}
