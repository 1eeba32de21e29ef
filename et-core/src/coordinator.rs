use crate::configuration::EngineConfig;
use crate::errors::{CalculationError, FetchError};
use crate::esi_client::MarketGateway;
use crate::market_cache::MarketCache;
use crate::worker_pool::{FetchTask, FetchWorkerPool};
use et_domain::{
    rank_candidates, score_order_book, ActorModifiers, CalculationResult, CalculationScope, Completeness, MarketKey, OrderBook,
    ScoringOptions, TopologyLookup,
};
use futures::stream::{FuturesUnordered, StreamExt};
use itertools::Itertools;
use metrics::histogram;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant as StdInstant;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Top-level orchestrator of one calculation: builds the fetch task set,
/// drives the worker pool under nested deadlines and scores whatever
/// arrived. Always produces a result object unless the scope itself is
/// unusable or the gateway is fully exhausted.
pub struct CalculationCoordinator {
    gateway: Arc<dyn MarketGateway>,
    cache: Arc<MarketCache>,
    topology: Arc<dyn TopologyLookup>,
    config: EngineConfig,
}

impl CalculationCoordinator {
    pub fn new(
        gateway: Arc<dyn MarketGateway>,
        cache: Arc<MarketCache>,
        topology: Arc<dyn TopologyLookup>,
        config: EngineConfig,
    ) -> Self {
        CalculationCoordinator {
            gateway,
            cache,
            topology,
            config,
        }
    }

    pub async fn calculate(&self, scope: CalculationScope, modifiers: ActorModifiers) -> Result<CalculationResult, CalculationError> {
        validate_scope(&scope)?;
        validate_modifiers(&modifiers)?;

        let started = StdInstant::now();
        let now = Instant::now();
        let overall_deadline = now + self.config.overall_timeout();
        let fetch_deadline = (now + self.config.fetch_timeout()).min(overall_deadline);

        let keys: Vec<MarketKey> = scope
            .type_ids
            .iter()
            .map(|type_id| MarketKey::new(scope.region_id, *type_id))
            .sorted()
            .dedup()
            .collect();
        info!(region_id = scope.region_id.0, items = keys.len(), "starting calculation");

        let pool = FetchWorkerPool::spawn(
            self.config.worker_count,
            self.config.queue_depth,
            self.config.task_timeout(),
            self.gateway.clone(),
            self.cache.clone(),
        );

        // one slot per requested key, written exactly once by whichever
        // path resolves it
        let mut slots: Vec<Option<OrderBook>> = vec![None; keys.len()];
        let mut failures: Vec<Option<FetchError>> = vec![None; keys.len()];

        let mut pending = FuturesUnordered::new();
        for (index, key) in keys.iter().enumerate() {
            let task = FetchTask {
                key: *key,
                deadline: (Instant::now() + self.config.task_timeout()).min(fetch_deadline),
            };
            match pool.submit(task).await {
                Ok(shared) => pending.push(async move { (index, shared.await) }),
                Err(error) => failures[index] = Some(error),
            }
        }

        loop {
            tokio::select! {
                resolved = pending.next() => match resolved {
                    Some((index, Ok(book))) => slots[index] = Some(book),
                    Some((index, Err(error))) => {
                        debug!(key = %keys[index], %error, "order book unresolved");
                        failures[index] = Some(error);
                    }
                    None => break,
                },
                _ = sleep_until(fetch_deadline) => {
                    debug!("fetch phase deadline reached");
                    break;
                }
            }
        }
        pool.shutdown(self.config.shutdown_grace()).await;

        let missing_keys: Vec<MarketKey> = keys
            .iter()
            .zip(slots.iter())
            .filter(|(_, slot)| slot.is_none())
            .map(|(key, _)| *key)
            .collect();
        let circuit_was_open = failures.iter().flatten().any(|error| matches!(error, FetchError::CircuitOpen));

        let order_books: HashMap<MarketKey, OrderBook> = keys
            .iter()
            .zip(slots)
            .filter_map(|(key, slot)| slot.map(|book| (*key, book)))
            .collect();
        if order_books.is_empty() && circuit_was_open {
            return Err(CalculationError::GatewayExhausted);
        }

        let opts = ScoringOptions {
            fee_schedule: Default::default(),
            investment_ceiling: scope.investment_ceiling,
            rank_metric: scope.rank_metric,
        };
        let route_budget = self.config.route_compute_timeout();
        let mut candidates = Vec::new();
        let mut scoring_truncated = false;
        for key in order_books.keys().sorted().copied().collect_vec() {
            if Instant::now() >= overall_deadline {
                debug!("overall deadline reached during scoring, returning the best subset so far");
                scoring_truncated = true;
                break;
            }
            let item_started = StdInstant::now();
            candidates.extend(score_order_book(&order_books[&key], self.topology.as_ref(), &modifiers, &opts));
            if item_started.elapsed() > route_budget {
                warn!(key = %key, elapsed_ms = item_started.elapsed().as_millis() as u64, "route computation exceeded its budget");
            }
        }
        rank_candidates(&mut candidates, scope.rank_metric);

        let completeness = if missing_keys.is_empty() && !scoring_truncated {
            Completeness::Full
        } else {
            Completeness::Partial
        };
        histogram!("calculation_duration_seconds").record(started.elapsed().as_secs_f64());
        info!(
            candidates = candidates.len(),
            missing = missing_keys.len(),
            %completeness,
            "calculation finished"
        );

        Ok(CalculationResult {
            candidates,
            completeness,
            missing_keys,
        })
    }
}

fn validate_scope(scope: &CalculationScope) -> Result<(), CalculationError> {
    if scope.type_ids.is_empty() {
        return Err(CalculationError::InvalidScope("no item types requested".into()));
    }
    if let Some(ceiling) = scope.investment_ceiling {
        if !ceiling.is_finite() || ceiling <= 0.0 {
            return Err(CalculationError::InvalidScope(format!(
                "investment ceiling must be positive, got {ceiling}"
            )));
        }
    }
    Ok(())
}

fn validate_modifiers(modifiers: &ActorModifiers) -> Result<(), CalculationError> {
    if !modifiers.cargo_capacity_m3.is_finite() || modifiers.cargo_capacity_m3 < 0.0 {
        return Err(CalculationError::InvalidModifiers(format!(
            "cargo capacity must be non-negative, got {}",
            modifiers.cargo_capacity_m3
        )));
    }
    if !modifiers.cargo_bonus_multiplier.is_finite() || modifiers.cargo_bonus_multiplier <= 0.0 {
        return Err(CalculationError::InvalidModifiers(format!(
            "cargo bonus multiplier must be positive, got {}",
            modifiers.cargo_bonus_multiplier
        )));
    }
    Ok(())
}
