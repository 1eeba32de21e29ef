use crate::errors::FetchError;
use std::future::Future;
use tokio::time::{timeout_at, Instant};
use tracing::{event, trace_span, Instrument, Level};

#[derive(Debug, Clone, Copy)]
pub struct PageRequest {
    pub page: u32,
}

/// One page of an upstream listing plus the total page count announced by
/// the `x-pages` response header.
#[derive(Debug)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total_pages: u32,
}

/// Result of draining all pages of one listing. `complete == false` means
/// the deadline cut the drain short and `items` holds what arrived so far.
#[derive(Debug)]
pub struct PageDrain<T> {
    pub items: Vec<T>,
    pub complete: bool,
}

pub async fn drain_pages<T, F, Fut>(deadline: Instant, mut fetch_page: F) -> Result<PageDrain<T>, FetchError>
where
    F: FnMut(PageRequest) -> Fut,
    Fut: Future<Output = Result<Page<T>, FetchError>>,
{
    let span = trace_span!("pagination");

    async move {
        let mut items = Vec::new();
        let mut current_page = 1;
        let mut total_pages = 1;

        while current_page <= total_pages {
            let page = match timeout_at(deadline, fetch_page(PageRequest { page: current_page })).await {
                Ok(Ok(page)) => page,
                Ok(Err(FetchError::DeadlineExceeded)) | Err(_) => {
                    event!(Level::TRACE, "Deadline hit after {} of {} pages", current_page - 1, total_pages);
                    return Ok(PageDrain { items, complete: false });
                }
                Ok(Err(other)) => return Err(other),
            };

            total_pages = page.total_pages.max(1);
            event!(Level::TRACE, "Downloaded page {} of {}", current_page, total_pages);

            items.extend(page.items);
            current_page += 1;
        }

        event!(Level::TRACE, "Done downloading all {} pages", total_pages);
        Ok(PageDrain { items, complete: true })
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn drains_every_page_before_completing() {
        let deadline = Instant::now() + Duration::from_secs(5);

        let drain = drain_pages(deadline, |req| async move {
            Ok(Page {
                items: vec![req.page * 10, req.page * 10 + 1],
                total_pages: 3,
            })
        })
        .await
        .unwrap();

        assert!(drain.complete);
        assert_eq!(drain.items, vec![10, 11, 20, 21, 30, 31]);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_mid_drain_returns_partial_items() {
        let deadline = Instant::now() + Duration::from_millis(100);

        let drain = drain_pages(deadline, |req| async move {
            if req.page > 1 {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Ok(Page {
                items: vec![req.page],
                total_pages: 3,
            })
        })
        .await
        .unwrap();

        assert!(!drain.complete);
        assert_eq!(drain.items, vec![1]);
    }

    #[tokio::test]
    async fn upstream_failure_propagates() {
        let deadline = Instant::now() + Duration::from_secs(5);

        let result: Result<PageDrain<u32>, FetchError> =
            drain_pages(deadline, |_| async move { Err(FetchError::transient("boom")) }).await;

        assert!(matches!(result, Err(FetchError::Transient { .. })));
    }
}
