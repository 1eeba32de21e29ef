use crate::configuration::EngineConfig;
use crate::errors::FetchError;
use crate::pagination::{drain_pages, Page, PageRequest};
use crate::reqwest_helpers::create_client;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use et_domain::{LocationId, MarketKey, Order, OrderBook, OrderBookSource, OrderId};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use metrics::counter;
use reqwest::StatusCode;
use reqwest_middleware::ClientWithMiddleware;
use reqwest_retry::{policies::ExponentialBackoff, RetryDecision, RetryPolicy};
use serde::Deserialize;
use std::num::NonZeroU32;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant as StdInstant, SystemTime};
use tokio::time::{sleep, sleep_until, timeout_at, Instant};
use tracing::debug;

/// The one seam to the external market API. Production uses [`EsiClient`];
/// tests script the trait directly.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketGateway: Send + Sync {
    async fn fetch_order_book(&self, key: MarketKey, deadline: Instant) -> Result<OrderBook, FetchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Consecutive-failure breaker. Owned by whoever constructs the gateway so
/// its lifecycle matches the process or a test fixture, never ambient state.
#[derive(Debug)]
pub struct CircuitBreaker {
    error_threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

#[derive(Debug, Default)]
struct BreakerInner {
    consecutive_failures: u32,
    opened_at: Option<StdInstant>,
}

impl CircuitBreaker {
    pub fn new(error_threshold: u32, cooldown: Duration) -> Self {
        CircuitBreaker {
            error_threshold,
            cooldown,
            inner: Mutex::new(BreakerInner::default()),
        }
    }

    pub fn state(&self) -> CircuitState {
        let inner = self.inner.lock().unwrap();
        match inner.opened_at {
            Some(opened_at) if opened_at.elapsed() < self.cooldown => CircuitState::Open,
            Some(_) => CircuitState::HalfOpen,
            None => CircuitState::Closed,
        }
    }

    /// Fails fast while the cooldown is running. After the cooldown a probe
    /// call is let through; its outcome decides whether the circuit closes.
    pub fn check(&self) -> Result<(), FetchError> {
        let inner = self.inner.lock().unwrap();
        match inner.opened_at {
            Some(opened_at) if opened_at.elapsed() < self.cooldown => Err(FetchError::CircuitOpen),
            _ => Ok(()),
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_failures += 1;
        if inner.consecutive_failures >= self.error_threshold {
            inner.opened_at = Some(StdInstant::now());
        }
    }
}

/// Wire shape of one ESI market order.
#[derive(Debug, Clone, Deserialize)]
pub struct EsiOrder {
    pub order_id: i64,
    pub is_buy_order: bool,
    pub price: f64,
    pub volume_remain: u32,
    pub min_volume: u32,
    pub location_id: i64,
    pub issued: DateTime<Utc>,
    pub duration: u32,
}

impl From<EsiOrder> for Order {
    fn from(esi: EsiOrder) -> Self {
        Order {
            order_id: OrderId(esi.order_id),
            is_buy: esi.is_buy_order,
            price: esi.price,
            volume_remaining: esi.volume_remain,
            min_volume: esi.min_volume.max(1),
            location_id: LocationId(esi.location_id),
            issued_at: esi.issued,
            duration_days: esi.duration,
        }
    }
}

#[derive(Debug)]
enum AttemptFailure {
    Transient { message: String, backoff_floor: Option<Duration> },
    RateLimited { backoff_floor: Option<Duration> },
    Fatal(FetchError),
}

impl AttemptFailure {
    fn backoff_floor(&self) -> Option<Duration> {
        match self {
            AttemptFailure::Transient { backoff_floor, .. } | AttemptFailure::RateLimited { backoff_floor } => *backoff_floor,
            AttemptFailure::Fatal(_) => None,
        }
    }

    fn into_fetch_error(self) -> FetchError {
        match self {
            AttemptFailure::Transient { message, .. } => FetchError::Transient { message },
            AttemptFailure::RateLimited { backoff_floor } => FetchError::RateLimited { retry_after: backoff_floor },
            AttemptFailure::Fatal(error) => error,
        }
    }
}

#[derive(Clone)]
pub struct EsiClient {
    client: ClientWithMiddleware,
    base_url: String,
    limiter: Arc<DefaultDirectRateLimiter>,
    breaker: Arc<CircuitBreaker>,
    retry_policy: ExponentialBackoff,
}

impl EsiClient {
    pub fn new(
        client: ClientWithMiddleware,
        base_url: impl Into<String>,
        limiter: Arc<DefaultDirectRateLimiter>,
        breaker: Arc<CircuitBreaker>,
        retry_policy: ExponentialBackoff,
    ) -> Self {
        EsiClient {
            client,
            base_url: base_url.into(),
            limiter,
            breaker,
            retry_policy,
        }
    }

    pub fn from_config(cfg: &EngineConfig) -> Self {
        let limiter = RateLimiter::direct(Quota::per_second(NonZeroU32::new(cfg.requests_per_second.max(1)).unwrap()));
        let (min_backoff, max_backoff) = cfg.retry_bounds();
        let retry_policy = ExponentialBackoff::builder()
            .retry_bounds(min_backoff, max_backoff)
            .build_with_max_retries(cfg.max_retries);

        Self::new(
            create_client(&cfg.user_agent),
            cfg.esi_base_url.clone(),
            Arc::new(limiter),
            Arc::new(CircuitBreaker::new(cfg.error_threshold, cfg.circuit_cooldown())),
            retry_policy,
        )
    }

    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        self.breaker.clone()
    }

    async fn acquire_permit(&self, deadline: Instant) -> Result<(), FetchError> {
        tokio::select! {
            _ = self.limiter.until_ready() => Ok(()),
            _ = sleep_until(deadline) => {
                counter!("esi_requests_total", "class" => "timeout").increment(1);
                Err(FetchError::DeadlineExceeded)
            }
        }
    }

    /// One page with the full retry/backoff/breaker treatment.
    async fn fetch_orders_page(&self, key: MarketKey, request: PageRequest, deadline: Instant) -> Result<Page<Order>, FetchError> {
        let request_started = SystemTime::now();
        let mut past_retries: u32 = 0;

        loop {
            self.breaker.check()?;
            self.acquire_permit(deadline).await?;

            let failure = match timeout_at(deadline, self.request_page(key, request.page)).await {
                Ok(Ok(page)) => {
                    self.breaker.record_success();
                    return Ok(page);
                }
                Ok(Err(AttemptFailure::Fatal(error))) => {
                    self.breaker.record_failure();
                    return Err(error);
                }
                Ok(Err(failure)) => {
                    self.breaker.record_failure();
                    failure
                }
                Err(_) => {
                    counter!("esi_requests_total", "class" => "timeout").increment(1);
                    return Err(FetchError::DeadlineExceeded);
                }
            };

            let mut wait = match self.retry_policy.should_retry(request_started, past_retries) {
                RetryDecision::Retry { execute_after } => execute_after.duration_since(SystemTime::now()).unwrap_or_default(),
                RetryDecision::DoNotRetry => return Err(failure.into_fetch_error()),
            };
            // a Retry-After hint or an exhausted upstream error budget floors the wait
            if let Some(floor) = failure.backoff_floor() {
                wait = wait.max(floor);
            }
            past_retries += 1;

            if Instant::now() + wait >= deadline {
                counter!("esi_requests_total", "class" => "timeout").increment(1);
                return Err(FetchError::DeadlineExceeded);
            }
            debug!(key = %key, attempt = past_retries, wait_ms = wait.as_millis() as u64, "retrying upstream call");
            sleep(wait).await;
        }
    }

    async fn request_page(&self, key: MarketKey, page: u32) -> Result<Page<Order>, AttemptFailure> {
        let url = format!("{}/markets/{}/orders/", self.base_url, key.region_id.0);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("order_type", "all".to_string()),
                ("type_id", key.type_id.0.to_string()),
                ("page", page.to_string()),
            ])
            .send()
            .await
            .map_err(|e| AttemptFailure::Transient {
                message: e.to_string(),
                backoff_floor: None,
            })?;

        let status = response.status();
        let total_pages = header(&response, "x-pages").unwrap_or(1);
        let retry_after = header::<u64>(&response, "retry-after").map(Duration::from_secs);
        let error_limit_remain: Option<u32> = header(&response, "x-esi-error-limit-remain");
        let error_limit_reset = header::<u64>(&response, "x-esi-error-limit-reset").map(Duration::from_secs);

        // the error budget is shared across all clients of this API key;
        // once it is spent, every further error risks a temporary ban
        let budget_floor = match (error_limit_remain, error_limit_reset) {
            (Some(0), reset) => reset,
            _ => None,
        };

        if status.is_success() {
            let body = response.text().await.map_err(|e| AttemptFailure::Transient {
                message: format!("failed to read response body: {e}"),
                backoff_floor: None,
            })?;
            let orders: Vec<EsiOrder> = serde_json::from_str(&body).map_err(|e| {
                AttemptFailure::Fatal(FetchError::InvalidResponse(format!(
                    "error decoding response: '{e:?}', body was: '{body}'"
                )))
            })?;
            return Ok(Page {
                items: orders.into_iter().map(Order::from).collect(),
                total_pages,
            });
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            counter!("esi_rate_limit_errors_total").increment(1);
            let floor = match (retry_after, budget_floor) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };
            return Err(AttemptFailure::RateLimited { backoff_floor: floor });
        }
        if status.is_server_error() {
            return Err(AttemptFailure::Transient {
                message: format!("upstream returned {status}"),
                backoff_floor: budget_floor,
            });
        }
        Err(AttemptFailure::Fatal(FetchError::InvalidResponse(format!(
            "upstream returned {status}"
        ))))
    }
}

#[async_trait]
impl MarketGateway for EsiClient {
    async fn fetch_order_book(&self, key: MarketKey, deadline: Instant) -> Result<OrderBook, FetchError> {
        let drain = drain_pages(deadline, |page| self.fetch_orders_page(key, page, deadline)).await?;

        if drain.items.is_empty() && !drain.complete {
            return Err(FetchError::DeadlineExceeded);
        }
        let source = if drain.complete {
            OrderBookSource::Live
        } else {
            debug!(key = %key, orders = drain.items.len(), "deadline cut the drain short, returning partial book");
            OrderBookSource::Partial
        };
        Ok(OrderBook::from_orders(key, drain.items, Utc::now(), source))
    }
}

fn header<T: FromStr>(response: &reqwest::Response, name: &str) -> Option<T> {
    response.headers().get(name)?.to_str().ok()?.parse().ok()
}
