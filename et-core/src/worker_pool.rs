use crate::errors::FetchError;
use crate::esi_client::MarketGateway;
use crate::market_cache::{Lookup, MarketCache};
use et_domain::{MarketKey, OrderBook};
use futures::future::{BoxFuture, FutureExt, Shared};
use metrics::{counter, gauge};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub type TaskOutcome = Result<OrderBook, FetchError>;

/// The coalesced result of one in-flight fetch; cheap to clone, every
/// submitter of the same key awaits the same one.
pub type SharedFetch = Shared<BoxFuture<'static, TaskOutcome>>;

/// One unit of fetch work. Consumed exactly once by exactly one worker.
#[derive(Debug, Clone, Copy)]
pub struct FetchTask {
    pub key: MarketKey,
    pub deadline: Instant,
}

enum WorkKind {
    Foreground,
    Refresh,
}

struct WorkItem {
    task: FetchTask,
    kind: WorkKind,
    completion: Option<oneshot::Sender<TaskOutcome>>,
}

struct WorkerContext {
    gateway: Arc<dyn MarketGateway>,
    cache: Arc<MarketCache>,
    refresh_queue: mpsc::Sender<WorkItem>,
    refresh_budget: Duration,
    hard_cancel: CancellationToken,
    queue_depth: Arc<AtomicI64>,
}

/// Fixed set of workers draining a bounded queue. Lives for one calculation.
pub struct FetchWorkerPool {
    queue: mpsc::Sender<WorkItem>,
    in_flight: Arc<Mutex<HashMap<MarketKey, SharedFetch>>>,
    dispatch_cancel: CancellationToken,
    hard_cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
    queue_depth: Arc<AtomicI64>,
}

impl FetchWorkerPool {
    pub fn spawn(
        worker_count: usize,
        queue_capacity: usize,
        refresh_budget: Duration,
        gateway: Arc<dyn MarketGateway>,
        cache: Arc<MarketCache>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(queue_capacity.max(1));
        let queue_rx = Arc::new(Mutex::new(queue_rx));
        let dispatch_cancel = CancellationToken::new();
        let hard_cancel = CancellationToken::new();
        let queue_depth = Arc::new(AtomicI64::new(0));

        let workers = (0..worker_count.max(1))
            .map(|worker_id| {
                let context = WorkerContext {
                    gateway: gateway.clone(),
                    cache: cache.clone(),
                    refresh_queue: queue_tx.clone(),
                    refresh_budget,
                    hard_cancel: hard_cancel.clone(),
                    queue_depth: queue_depth.clone(),
                };
                tokio::spawn(worker_loop(worker_id, queue_rx.clone(), dispatch_cancel.clone(), context))
            })
            .collect();

        FetchWorkerPool {
            queue: queue_tx,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            dispatch_cancel,
            hard_cancel,
            workers,
            queue_depth,
        }
    }

    /// Coalesces duplicate keys: the first submission enqueues work, later
    /// ones get the already in-flight (or resolved) shared future. Blocks
    /// for a queue slot up to the task's deadline.
    pub async fn submit(&self, task: FetchTask) -> Result<SharedFetch, FetchError> {
        let mut in_flight = self.in_flight.lock().await;
        if let Some(existing) = in_flight.get(&task.key) {
            return Ok(existing.clone());
        }

        let (completion_tx, completion_rx) = oneshot::channel();
        let shared: SharedFetch = completion_rx
            .map(|received| match received {
                Ok(outcome) => outcome,
                // the worker was cancelled before resolving this key
                Err(_) => Err(FetchError::DeadlineExceeded),
            })
            .boxed()
            .shared();
        in_flight.insert(task.key, shared.clone());
        drop(in_flight);

        let item = WorkItem {
            task,
            kind: WorkKind::Foreground,
            completion: Some(completion_tx),
        };
        tokio::select! {
            sent = self.queue.send(item) => {
                if sent.is_err() {
                    self.in_flight.lock().await.remove(&task.key);
                    return Err(FetchError::transient("fetch queue closed"));
                }
            }
            _ = sleep_until(task.deadline) => {
                self.in_flight.lock().await.remove(&task.key);
                return Err(FetchError::DeadlineExceeded);
            }
        }

        let depth = self.queue_depth.fetch_add(1, Ordering::SeqCst) + 1;
        gauge!("fetch_queue_depth").set(depth as f64);
        Ok(shared)
    }

    /// Stops dispatch, lets in-flight tasks drain up to `grace`, then
    /// hard-cancels whatever is still running. Queued tasks that never ran
    /// resolve as `DeadlineExceeded` for their submitters.
    pub async fn shutdown(mut self, grace: Duration) {
        self.dispatch_cancel.cancel();
        let deadline = Instant::now() + grace;

        let mut unfinished = Vec::new();
        for mut worker in self.workers.drain(..) {
            match timeout_at(deadline, &mut worker).await {
                Ok(_) => {}
                Err(_) => unfinished.push(worker),
            }
        }
        if !unfinished.is_empty() {
            debug!(workers = unfinished.len(), "grace period elapsed, hard-cancelling in-flight fetches");
            self.hard_cancel.cancel();
            for worker in unfinished {
                let _ = worker.await;
            }
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    queue: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    dispatch_cancel: CancellationToken,
    context: WorkerContext,
) {
    loop {
        let item = tokio::select! {
            _ = dispatch_cancel.cancelled() => break,
            received = async { queue.lock().await.recv().await } => match received {
                Some(item) => item,
                None => break,
            },
        };
        let depth = context.queue_depth.fetch_sub(1, Ordering::SeqCst) - 1;
        gauge!("fetch_queue_depth").set(depth as f64);

        match item.kind {
            WorkKind::Foreground => {
                let outcome = resolve_task(&item.task, &context).await;
                if let Some(completion) = item.completion {
                    let _ = completion.send(outcome);
                }
            }
            WorkKind::Refresh => refresh_task(&item.task, &context).await,
        }
    }
    debug!(worker_id, "worker stopped");
}

async fn resolve_task(task: &FetchTask, context: &WorkerContext) -> TaskOutcome {
    match context.cache.get(task.key).await {
        Lookup::Fresh(book) => Ok(book),
        Lookup::StaleAcceptable(book) => {
            schedule_refresh(task.key, context);
            Ok(book)
        }
        Lookup::Miss => {
            let fetched = tokio::select! {
                result = context.gateway.fetch_order_book(task.key, task.deadline) => result?,
                // a hard cancel discards partial work instead of merging it
                _ = context.hard_cancel.cancelled() => return Err(FetchError::DeadlineExceeded),
            };
            context.cache.put(task.key, &fetched).await;
            Ok(fetched)
        }
    }
}

async fn refresh_task(task: &FetchTask, context: &WorkerContext) {
    let result = tokio::select! {
        result = context.gateway.fetch_order_book(task.key, task.deadline) => result,
        _ = context.hard_cancel.cancelled() => return,
    };
    match result {
        Ok(book) => context.cache.put(task.key, &book).await,
        Err(error) => debug!(key = %task.key, %error, "background refresh failed"),
    }
}

/// Best effort: a full queue drops the refresh instead of blocking a worker.
fn schedule_refresh(key: MarketKey, context: &WorkerContext) {
    let item = WorkItem {
        task: FetchTask {
            key,
            deadline: Instant::now() + context.refresh_budget,
        },
        kind: WorkKind::Refresh,
        completion: None,
    };
    match context.refresh_queue.try_send(item) {
        Ok(()) => {
            let depth = context.queue_depth.fetch_add(1, Ordering::SeqCst) + 1;
            gauge!("fetch_queue_depth").set(depth as f64);
            counter!("fetch_refreshes_scheduled_total").increment(1);
        }
        Err(mpsc::error::TrySendError::Full(_)) => {
            counter!("fetch_refreshes_dropped_total").increment(1);
            debug!(key = %key, "fetch queue full, dropping background refresh");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}
