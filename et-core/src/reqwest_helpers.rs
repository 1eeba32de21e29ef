use axum::http::Extensions;
use metrics::{counter, describe_histogram, histogram, Unit};
use reqwest::{Client, Request, Response, StatusCode};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, Middleware, Next};
use std::time::Instant;
use tracing::{debug, error};

/// Builds the shared HTTP client: request metrics innermost, error logging on
/// top. Rate limiting, retries and the circuit breaker live in the gateway,
/// which needs deadline-aware control over both.
pub fn create_client(user_agent: &str) -> ClientWithMiddleware {
    let reqwest_client = Client::builder().user_agent(user_agent).build().unwrap();

    ClientBuilder::new(reqwest_client)
        .with(ErrorLoggingMiddleware)
        .with(RequestMetricsMiddleware)
        .build()
}

fn status_class(status: StatusCode) -> &'static str {
    if status.is_success() {
        "2xx"
    } else if status.is_client_error() {
        "4xx"
    } else if status.is_server_error() {
        "5xx"
    } else {
        "other"
    }
}

pub struct RequestMetricsMiddleware;

#[async_trait::async_trait]
impl Middleware for RequestMetricsMiddleware {
    async fn handle(&self, req: Request, extensions: &mut Extensions, next: Next<'_>) -> reqwest_middleware::Result<Response> {
        let start = Instant::now();
        let method = req.method().to_string();

        let result = next.run(req, extensions).await;

        let duration = start.elapsed();
        let class = match &result {
            Ok(resp) => status_class(resp.status()),
            Err(_) => "error",
        };

        counter!("esi_requests_total", "class" => class, "method" => method.clone()).increment(1);

        let histogram = histogram!("esi_request_duration_milliseconds", "class" => class, "method" => method);
        describe_histogram!(
            "esi_request_duration_milliseconds",
            Unit::Milliseconds,
            "Upstream request duration in milliseconds"
        );
        histogram.record(duration.as_millis() as f64);

        result
    }
}

pub struct ErrorLoggingMiddleware;

#[async_trait::async_trait]
impl Middleware for ErrorLoggingMiddleware {
    async fn handle(&self, req: Request, extensions: &mut Extensions, next: Next<'_>) -> reqwest_middleware::Result<Response> {
        let start = Instant::now();
        let method = req.method().clone();
        let url = req.url().clone();

        let result = next.run(req, extensions).await;

        let duration = start.elapsed();

        match &result {
            Ok(resp) if !resp.status().is_success() => {
                let status = resp.status();

                // 429s are expected under load and handled by the gateway's backoff
                if status == StatusCode::TOO_MANY_REQUESTS {
                    debug!(
                        "Request failed due to rate-limit {} {} - Status: {}, Duration: {:?}",
                        method, url, status, duration
                    );
                } else {
                    error!("Request failed: {} {} - Status: {}, Duration: {:?}", method, url, status, duration);
                }
            }
            Err(e) => {
                error!("Request error: {} {} - Error: {}, Duration: {:?}", method, url, e, duration);
            }
            _ => {
                debug!("Request succeeded: {} {} - Duration: {:?}", method, url, duration);
            }
        }

        result
    }
}
