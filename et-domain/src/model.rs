use chrono::{DateTime, Utc};
use mockall::automock;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use strum::Display;

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct RegionId(pub i32);

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct TypeId(pub i32);

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct LocationId(pub i64);

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct OrderId(pub i64);

/// The unit of fetching and caching: one order book per (region, item).
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct MarketKey {
    pub region_id: RegionId,
    pub type_id: TypeId,
}

impl MarketKey {
    pub fn new(region_id: RegionId, type_id: TypeId) -> Self {
        MarketKey { region_id, type_id }
    }
}

impl fmt::Display for MarketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.region_id.0, self.type_id.0)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Order {
    pub order_id: OrderId,
    pub is_buy: bool,
    pub price: f64,
    pub volume_remaining: u32,
    pub min_volume: u32,
    pub location_id: LocationId,
    pub issued_at: DateTime<Utc>,
    pub duration_days: u32,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum OrderBookSource {
    Live,
    Cached,
    Partial,
}

/// Immutable snapshot of all outstanding orders for one (region, item).
/// A later fetch produces a wholly new book, never a patch.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct OrderBook {
    pub key: MarketKey,
    buy_orders: Vec<Order>,
    sell_orders: Vec<Order>,
    pub fetched_at: DateTime<Utc>,
    pub source: OrderBookSource,
}

impl OrderBook {
    /// Splits the raw orders into sides and establishes the book invariant:
    /// buy prices non-increasing, sell prices non-decreasing.
    pub fn from_orders(key: MarketKey, orders: Vec<Order>, fetched_at: DateTime<Utc>, source: OrderBookSource) -> Self {
        let (mut buy_orders, mut sell_orders): (Vec<Order>, Vec<Order>) = orders.into_iter().partition(|o| o.is_buy);
        buy_orders.sort_by_key(|o| std::cmp::Reverse(OrderedFloat(o.price)));
        sell_orders.sort_by_key(|o| OrderedFloat(o.price));

        OrderBook {
            key,
            buy_orders,
            sell_orders,
            fetched_at,
            source,
        }
    }

    pub fn buy_orders(&self) -> &[Order] {
        &self.buy_orders
    }

    pub fn sell_orders(&self) -> &[Order] {
        &self.sell_orders
    }

    /// Highest bid of the book, if any order with volume is left.
    pub fn best_bid(&self) -> Option<&Order> {
        self.buy_orders.iter().find(|o| o.volume_remaining > 0)
    }

    /// Lowest ask of the book, if any order with volume is left.
    pub fn best_ask(&self) -> Option<&Order> {
        self.sell_orders.iter().find(|o| o.volume_remaining > 0)
    }

    pub fn is_empty(&self) -> bool {
        self.buy_orders.is_empty() && self.sell_orders.is_empty()
    }

    pub fn order_count(&self) -> usize {
        self.buy_orders.len() + self.sell_orders.len()
    }

    pub fn with_source(mut self, source: OrderBookSource) -> Self {
        self.source = source;
        self
    }
}

/// Static metadata of a tradable item, supplied by the reference-data collaborator.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct TypeInfo {
    pub name: String,
    pub volume_m3: f64,
}

/// Read-only lookup into map topology and item metadata. Assumed fast and
/// always available; the gateway and cache layers never touch it.
#[automock]
pub trait TopologyLookup: Send + Sync {
    fn travel_time(&self, from: LocationId, to: LocationId) -> Option<Duration>;
    fn type_info(&self, type_id: TypeId) -> Option<TypeInfo>;
}

/// Per-actor skill and fitting input to scoring. Read-only; the engine never
/// persists or mutates these.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ActorModifiers {
    pub cargo_capacity_m3: f64,
    pub cargo_bonus_multiplier: f64,
    pub navigation_level: u8,
    pub accounting_level: u8,
    pub broker_relations_level: u8,
}

impl ActorModifiers {
    pub fn effective_cargo_m3(&self) -> f64 {
        self.cargo_capacity_m3 * self.cargo_bonus_multiplier
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Display, Default)]
pub enum RankMetric {
    #[default]
    IskPerHour,
    NetProfit,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Completeness {
    Full,
    Partial,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteCandidate {
    pub type_id: TypeId,
    pub type_name: String,
    pub buy_location: LocationId,
    pub sell_location: LocationId,
    pub quantity: u32,
    pub buy_price: f64,
    pub sell_price: f64,
    pub spread_percent: f64,
    pub travel_time: Duration,
    pub cargo_used_m3: f64,
    pub fees: f64,
    pub net_profit: f64,
    pub isk_per_hour: f64,
}

#[derive(Debug, Clone)]
pub struct CalculationScope {
    pub region_id: RegionId,
    pub type_ids: Vec<TypeId>,
    pub investment_ceiling: Option<f64>,
    pub rank_metric: RankMetric,
}

#[derive(Debug, Clone)]
pub struct CalculationResult {
    pub candidates: Vec<RouteCandidate>,
    pub completeness: Completeness,
    pub missing_keys: Vec<MarketKey>,
}
