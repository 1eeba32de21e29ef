//! Hand-built fixtures for exercising the engine without a real upstream.

use crate::errors::FetchError;
use crate::esi_client::MarketGateway;
use crate::market_cache::{InMemoryCacheStore, MarketCache, StalenessPolicy};
use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use et_domain::{
    ActorModifiers, LocationId, MarketKey, Order, OrderBook, OrderBookSource, OrderId, RegionId, TopologyLookup, TypeId, TypeInfo,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};

pub const REGION: RegionId = RegionId(10000002);
pub const JITA: LocationId = LocationId(60003760);
pub const AMARR: LocationId = LocationId(60008494);

pub fn market_key(type_id: i32) -> MarketKey {
    MarketKey::new(REGION, TypeId(type_id))
}

/// A book with a comfortable spread: ask at Jita, bid at Amarr.
pub fn profitable_book(key: MarketKey) -> OrderBook {
    backdated_book(key, Duration::ZERO)
}

pub fn backdated_book(key: MarketKey, age: Duration) -> OrderBook {
    let fetched_at = Utc::now() - TimeDelta::from_std(age).unwrap_or(TimeDelta::zero());
    let base_id = key.type_id.0 as i64 * 10;
    let ask = Order {
        order_id: OrderId(base_id + 1),
        is_buy: false,
        price: 100.0,
        volume_remaining: 100,
        min_volume: 1,
        location_id: JITA,
        issued_at: fetched_at,
        duration_days: 90,
    };
    let bid = Order {
        order_id: OrderId(base_id + 2),
        is_buy: true,
        price: 150.0,
        volume_remaining: 100,
        min_volume: 1,
        location_id: AMARR,
        issued_at: fetched_at,
        duration_days: 90,
    };
    OrderBook::from_orders(key, vec![ask, bid], fetched_at, OrderBookSource::Live)
}

pub fn empty_cache() -> Arc<MarketCache> {
    Arc::new(MarketCache::new(
        Arc::new(InMemoryCacheStore::new()),
        StalenessPolicy {
            fresh_max_age: Duration::from_secs(300),
            stale_max_age: Duration::from_secs(1_800),
        },
        Duration::from_secs(3_600),
    ))
}

pub fn test_modifiers() -> ActorModifiers {
    ActorModifiers {
        cargo_capacity_m3: 10_000.0,
        cargo_bonus_multiplier: 1.0,
        navigation_level: 3,
        accounting_level: 4,
        broker_relations_level: 2,
    }
}

/// Jita and Amarr, half an hour apart, every item 0.01 m3.
pub struct TwoStationTopology;

impl TopologyLookup for TwoStationTopology {
    fn travel_time(&self, from: LocationId, to: LocationId) -> Option<Duration> {
        if from == to {
            return Some(Duration::ZERO);
        }
        let known = [JITA, AMARR];
        (known.contains(&from) && known.contains(&to)).then_some(Duration::from_secs(1_800))
    }

    fn type_info(&self, type_id: TypeId) -> Option<TypeInfo> {
        Some(TypeInfo {
            name: format!("Type {}", type_id.0),
            volume_m3: 0.01,
        })
    }
}

#[derive(Debug, Clone)]
pub enum GatewayScript {
    /// Resolve immediately with a profitable book.
    Respond,
    /// Resolve with a profitable book after the delay, or time out against
    /// the task deadline, whichever comes first.
    RespondAfter(Duration),
    Fail(FetchError),
}

/// Scripted [`MarketGateway`] that counts calls and tracks concurrency.
pub struct ScriptedGateway {
    default_script: GatewayScript,
    scripts: HashMap<MarketKey, GatewayScript>,
    calls: AtomicUsize,
    calls_per_key: Mutex<HashMap<MarketKey, usize>>,
    concurrent: AtomicUsize,
    max_concurrent: AtomicUsize,
}

impl ScriptedGateway {
    pub fn new(default_script: GatewayScript) -> Self {
        ScriptedGateway {
            default_script,
            scripts: HashMap::new(),
            calls: AtomicUsize::new(0),
            calls_per_key: Mutex::new(HashMap::new()),
            concurrent: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
        }
    }

    pub fn with_script(mut self, key: MarketKey, script: GatewayScript) -> Self {
        self.scripts.insert(key, script);
        self
    }

    pub fn total_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, key: MarketKey) -> usize {
        self.calls_per_key.lock().unwrap().get(&key).copied().unwrap_or(0)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MarketGateway for ScriptedGateway {
    async fn fetch_order_book(&self, key: MarketKey, deadline: Instant) -> Result<OrderBook, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.calls_per_key.lock().unwrap().entry(key).or_default() += 1;
        let running = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(running, Ordering::SeqCst);

        let script = self.scripts.get(&key).cloned().unwrap_or_else(|| self.default_script.clone());
        let result = match script {
            GatewayScript::Respond => Ok(profitable_book(key)),
            GatewayScript::RespondAfter(delay) => {
                if Instant::now() + delay > deadline {
                    sleep_until(deadline).await;
                    Err(FetchError::DeadlineExceeded)
                } else {
                    sleep(delay).await;
                    Ok(profitable_book(key))
                }
            }
            GatewayScript::Fail(error) => Err(error),
        };

        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
