use crate::model::{
    ActorModifiers, LocationId, MarketKey, Order, OrderBook, RankMetric, RouteCandidate, TopologyLookup, TypeId, TypeInfo,
};
use itertools::Itertools;
use ordered_float::OrderedFloat;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

const NAVIGATION_SPEED_BONUS_PER_LEVEL: f64 = 0.05;
const MAX_TRAINED_LEVEL: u8 = 5;

/// Fee rates before skills are applied. Reductions are per trained level,
/// clamped at level V, which is the documented minimum of the skill system.
#[derive(Debug, Clone, PartialEq)]
pub struct FeeSchedule {
    pub sales_tax_base: f64,
    pub sales_tax_reduction_per_level: f64,
    pub broker_fee_base: f64,
    pub broker_fee_reduction_per_level: f64,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        FeeSchedule {
            sales_tax_base: 0.08,
            sales_tax_reduction_per_level: 0.11,
            broker_fee_base: 0.03,
            broker_fee_reduction_per_level: 0.003,
        }
    }
}

impl FeeSchedule {
    pub fn sales_tax_rate(&self, accounting_level: u8) -> f64 {
        let level = accounting_level.min(MAX_TRAINED_LEVEL) as f64;
        self.sales_tax_base * (1.0 - self.sales_tax_reduction_per_level * level)
    }

    pub fn broker_fee_rate(&self, broker_relations_level: u8) -> f64 {
        let level = broker_relations_level.min(MAX_TRAINED_LEVEL) as f64;
        self.broker_fee_base - self.broker_fee_reduction_per_level * level
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScoringOptions {
    pub fee_schedule: FeeSchedule,
    pub investment_ceiling: Option<f64>,
    pub rank_metric: RankMetric,
}

/// Scores every buy/sell station pair of one order book. Pure: identical
/// inputs produce identical output regardless of how the book arrived.
pub fn score_order_book(
    book: &OrderBook,
    topology: &dyn TopologyLookup,
    modifiers: &ActorModifiers,
    opts: &ScoringOptions,
) -> Vec<RouteCandidate> {
    let Some(info) = topology.type_info(book.key.type_id) else {
        debug!(type_id = book.key.type_id.0, "no type info, skipping item");
        return Vec::new();
    };
    if info.volume_m3 <= 0.0 {
        debug!(type_id = book.key.type_id.0, "non-positive item volume, skipping item");
        return Vec::new();
    }

    // Sides are price-sorted, so the first live order per location is that
    // location's best one.
    let mut best_asks: HashMap<LocationId, &Order> = HashMap::new();
    for order in book.sell_orders().iter().filter(|o| o.volume_remaining > 0) {
        best_asks.entry(order.location_id).or_insert(order);
    }
    let mut best_bids: HashMap<LocationId, &Order> = HashMap::new();
    for order in book.buy_orders().iter().filter(|o| o.volume_remaining > 0) {
        best_bids.entry(order.location_id).or_insert(order);
    }

    let asks = best_asks.into_iter().sorted_by_key(|(location, _)| *location).collect_vec();
    let bids = best_bids.into_iter().sorted_by_key(|(location, _)| *location).collect_vec();

    let mut candidates = Vec::new();
    for (ask_location, ask) in asks.iter().copied() {
        for (bid_location, bid) in bids.iter().copied() {
            if ask_location == bid_location || bid.price <= ask.price {
                continue;
            }
            if let Some(candidate) = build_candidate(book.key.type_id, &info, ask, bid, topology, modifiers, opts) {
                candidates.push(candidate);
            }
        }
    }
    candidates
}

/// Scores all collected books and returns the ranked candidate list.
pub fn score_routes(
    order_books: &HashMap<MarketKey, OrderBook>,
    topology: &dyn TopologyLookup,
    modifiers: &ActorModifiers,
    opts: &ScoringOptions,
) -> Vec<RouteCandidate> {
    let mut candidates = order_books
        .keys()
        .sorted()
        .flat_map(|key| score_order_book(&order_books[key], topology, modifiers, opts))
        .collect_vec();
    rank_candidates(&mut candidates, opts.rank_metric);
    candidates
}

fn build_candidate(
    type_id: TypeId,
    info: &TypeInfo,
    ask: &Order,
    bid: &Order,
    topology: &dyn TopologyLookup,
    modifiers: &ActorModifiers,
    opts: &ScoringOptions,
) -> Option<RouteCandidate> {
    let Some(one_way) = topology.travel_time(ask.location_id, bid.location_id) else {
        debug!(
            from = ask.location_id.0,
            to = bid.location_id.0,
            "no travel time between locations, skipping pair"
        );
        return None;
    };

    let matched_volume = ask.volume_remaining.min(bid.volume_remaining);
    let cargo_units = (modifiers.effective_cargo_m3() / info.volume_m3).floor();
    if cargo_units < 1.0 {
        return None;
    }
    let mut quantity = matched_volume.min(cargo_units.min(u32::MAX as f64) as u32);
    if let Some(ceiling) = opts.investment_ceiling {
        let affordable = (ceiling / ask.price).floor().clamp(0.0, u32::MAX as f64);
        quantity = quantity.min(affordable as u32);
    }
    if quantity == 0 || quantity < bid.min_volume {
        return None;
    }

    let travel_time = adjust_for_navigation(one_way, modifiers.navigation_level);
    let investment = ask.price * quantity as f64;
    let revenue = bid.price * quantity as f64;
    let gross_profit = revenue - investment;
    let sales_tax = revenue * opts.fee_schedule.sales_tax_rate(modifiers.accounting_level);
    let broker_fee = revenue * opts.fee_schedule.broker_fee_rate(modifiers.broker_relations_level);
    let fees = sales_tax + broker_fee;
    let net_profit = gross_profit - fees;
    if net_profit <= 0.0 {
        return None;
    }

    let round_trip_hours = ((travel_time * 2).as_secs_f64() / 3600.0).max(1.0 / 3600.0);

    Some(RouteCandidate {
        type_id,
        type_name: info.name.clone(),
        buy_location: ask.location_id,
        sell_location: bid.location_id,
        quantity,
        buy_price: ask.price,
        sell_price: bid.price,
        spread_percent: (bid.price - ask.price) / ask.price * 100.0,
        travel_time,
        cargo_used_m3: quantity as f64 * info.volume_m3,
        fees,
        net_profit,
        isk_per_hour: net_profit / round_trip_hours,
    })
}

fn adjust_for_navigation(base: Duration, navigation_level: u8) -> Duration {
    let level = navigation_level.min(MAX_TRAINED_LEVEL) as f64;
    Duration::from_secs_f64(base.as_secs_f64() / (1.0 + NAVIGATION_SPEED_BONUS_PER_LEVEL * level))
}

/// Total order: ranking metric descending, then net profit descending, then
/// travel time ascending, then type and location ids.
pub fn rank_candidates(candidates: &mut [RouteCandidate], metric: RankMetric) {
    candidates.sort_by(|a, b| {
        OrderedFloat(metric_value(b, metric))
            .cmp(&OrderedFloat(metric_value(a, metric)))
            .then_with(|| OrderedFloat(b.net_profit).cmp(&OrderedFloat(a.net_profit)))
            .then_with(|| a.travel_time.cmp(&b.travel_time))
            .then_with(|| a.type_id.cmp(&b.type_id))
            .then_with(|| a.buy_location.cmp(&b.buy_location))
            .then_with(|| a.sell_location.cmp(&b.sell_location))
    });
}

fn metric_value(candidate: &RouteCandidate, metric: RankMetric) -> f64 {
    match metric {
        RankMetric::IskPerHour => candidate.isk_per_hour,
        RankMetric::NetProfit => candidate.net_profit,
    }
}
