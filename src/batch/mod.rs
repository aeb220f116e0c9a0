//! Request coalescing.
//!
//! [`BatchProcessor`] gathers individual requests into batches and hands each
//! batch to a [`BatchHandler`] in a single call. A batch is dispatched as soon
//! as `max_size` items are queued, or once the debounce timer armed by the
//! first queued item fires.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::errors::{SdkError, SdkResult};

/// What happens to a batch when the handler itself fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchFailureMode {
    /// Every item in the batch is rejected with the handler's error.
    #[default]
    FailBatch,
    /// Each item is re-submitted on its own so it succeeds or fails independently.
    Isolate,
}

/// Batch processor configuration.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum items per batch. Reaching it dispatches immediately.
    pub max_size: usize,
    /// Debounce delay before a partial batch is dispatched.
    pub wait: Duration,
    /// Behaviour when the handler fails.
    pub failure_mode: BatchFailureMode,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            wait: Duration::from_millis(50),
            failure_mode: BatchFailureMode::FailBatch,
        }
    }
}

impl BatchConfig {
    /// Creates a configuration with the given size and debounce delay.
    pub fn new(max_size: usize, wait: Duration) -> Self {
        Self {
            max_size: max_size.max(1),
            wait,
            ..Default::default()
        }
    }

    /// Sets the failure mode.
    pub fn failure_mode(mut self, mode: BatchFailureMode) -> Self {
        self.failure_mode = mode;
        self
    }
}

/// Processes one batch of requests.
///
/// The returned vector must be index-aligned with `requests` and of the same
/// length. A `None` entry rejects only the item at that index.
#[async_trait]
pub trait BatchHandler<Req, Res>: Send + Sync {
    /// Processes the batch.
    async fn process(&self, requests: Vec<Req>) -> SdkResult<Vec<Option<Res>>>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<Req, Res, F, Fut> BatchHandler<Req, Res> for FnHandler<F>
where
    Req: Send + 'static,
    Res: Send + 'static,
    F: Fn(Vec<Req>) -> Fut + Send + Sync,
    Fut: Future<Output = SdkResult<Vec<Option<Res>>>> + Send,
{
    async fn process(&self, requests: Vec<Req>) -> SdkResult<Vec<Option<Res>>> {
        (self.0)(requests).await
    }
}

struct BatchItem<Req, Res> {
    request: Req,
    reply: oneshot::Sender<SdkResult<Res>>,
}

struct BatchState<Req, Res> {
    queue: VecDeque<BatchItem<Req, Res>>,
    /// Id of the armed debounce timer. A timer whose id no longer matches is stale.
    timer: Option<u64>,
    next_timer_id: u64,
}

struct Inner<Req, Res> {
    config: BatchConfig,
    handler: Arc<dyn BatchHandler<Req, Res>>,
    state: Mutex<BatchState<Req, Res>>,
}

/// Coalesces individual requests into batches.
pub struct BatchProcessor<Req, Res> {
    inner: Arc<Inner<Req, Res>>,
}

impl<Req, Res> Clone for BatchProcessor<Req, Res> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Req, Res> std::fmt::Debug for BatchProcessor<Req, Res> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchProcessor")
            .field("config", &self.inner.config)
            .field("pending", &self.inner.state.lock().queue.len())
            .finish()
    }
}

impl<Req, Res> BatchProcessor<Req, Res>
where
    Req: Clone + Send + 'static,
    Res: Send + 'static,
{
    /// Creates a processor around a handler.
    pub fn new(config: BatchConfig, handler: Arc<dyn BatchHandler<Req, Res>>) -> Self {
        let config = BatchConfig {
            max_size: config.max_size.max(1),
            ..config
        };
        Self {
            inner: Arc::new(Inner {
                config,
                handler,
                state: Mutex::new(BatchState {
                    queue: VecDeque::new(),
                    timer: None,
                    next_timer_id: 0,
                }),
            }),
        }
    }

    /// Creates a processor around an async closure.
    pub fn from_fn<F, Fut>(config: BatchConfig, f: F) -> Self
    where
        F: Fn(Vec<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SdkResult<Vec<Option<Res>>>> + Send + 'static,
    {
        Self::new(config, Arc::new(FnHandler(f)))
    }

    /// Returns the configuration.
    pub fn config(&self) -> &BatchConfig {
        &self.inner.config
    }

    /// Returns the number of queued items.
    pub fn pending(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Queues a request and waits for its individual result.
    pub async fn add(&self, request: Req) -> SdkResult<Res> {
        let (reply, rx) = oneshot::channel();

        let dispatch_now = {
            let mut state = self.inner.state.lock();
            state.queue.push_back(BatchItem { request, reply });
            if state.queue.len() >= self.inner.config.max_size {
                true
            } else {
                if state.timer.is_none() {
                    self.arm_timer(&mut state);
                }
                false
            }
        };

        if dispatch_now {
            let processor = self.clone();
            tokio::spawn(async move { processor.execute().await });
        }

        rx.await.map_err(|_| SdkError::Cancelled)?
    }

    /// Dispatches up to `max_size` items from the front of the queue.
    pub async fn execute(&self) {
        let items: Vec<BatchItem<Req, Res>> = {
            let mut state = self.inner.state.lock();
            state.timer = None;
            let take = state.queue.len().min(self.inner.config.max_size);
            let items = state.queue.drain(..take).collect();
            if !state.queue.is_empty() {
                self.arm_timer(&mut state);
            }
            items
        };

        if items.is_empty() {
            return;
        }

        self.dispatch(items).await;
    }

    /// Drains the whole queue, one batch at a time.
    pub async fn flush(&self) {
        while self.pending() > 0 {
            self.execute().await;
        }
    }

    fn arm_timer(&self, state: &mut BatchState<Req, Res>) {
        let id = state.next_timer_id;
        state.next_timer_id = state.next_timer_id.wrapping_add(1);

        let processor = self.clone();
        let wait = self.inner.config.wait;
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            {
                let mut state = processor.inner.state.lock();
                if state.timer != Some(id) {
                    return;
                }
                state.timer = None;
            }
            processor.execute().await;
        });
        state.timer = Some(id);
    }

    async fn dispatch(&self, items: Vec<BatchItem<Req, Res>>) {
        let expected = items.len();
        let (requests, replies): (Vec<Req>, Vec<_>) =
            items.into_iter().map(|i| (i.request, i.reply)).unzip();
        let retained = (self.inner.config.failure_mode == BatchFailureMode::Isolate
            && expected > 1)
            .then(|| requests.clone());

        debug!(size = expected, "Dispatching batch");

        match self.inner.handler.process(requests).await {
            Ok(responses) if responses.len() == expected => {
                for (index, (reply, response)) in replies.into_iter().zip(responses).enumerate() {
                    let result = response.ok_or_else(|| {
                        SdkError::batch(format!("No response for batch item {index}"))
                    });
                    let _ = reply.send(result);
                }
            }
            Ok(responses) => {
                warn!(
                    expected,
                    actual = responses.len(),
                    "Batch response count does not match request count"
                );
                for reply in replies {
                    let _ = reply.send(Err(SdkError::BatchMismatch {
                        expected,
                        actual: responses.len(),
                    }));
                }
            }
            Err(error) => match retained {
                Some(requests) => {
                    warn!(error = %error, "Batch failed, re-running items individually");
                    for (request, reply) in requests.into_iter().zip(replies) {
                        let _ = reply.send(self.process_single(request).await);
                    }
                }
                None => {
                    warn!(error = %error, size = expected, "Batch failed");
                    for reply in replies {
                        let _ = reply.send(Err(error.clone()));
                    }
                }
            },
        }
    }

    async fn process_single(&self, request: Req) -> SdkResult<Res> {
        let mut responses = self.inner.handler.process(vec![request]).await?;
        if responses.len() != 1 {
            return Err(SdkError::BatchMismatch {
                expected: 1,
                actual: responses.len(),
            });
        }
        responses
            .pop()
            .flatten()
            .ok_or_else(|| SdkError::batch("No response for batch item 0"))
    }
}
