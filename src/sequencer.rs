//! Per-conversation FIFO serialization of generation requests.
//!
//! Each context key gets a lazily spawned worker task that processes its
//! queue one request at a time. Keys run independently. A worker with an
//! empty queue for `idle_timeout` removes itself.

use crate::config::RuntimeSettings;
use crate::error::{QueueError, SaturationReason};
use crate::{ContextKey, GenerationRequest};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Work performed for each dequeued request.
#[async_trait]
pub trait RequestProcessor: Send + Sync + 'static {
    type Output: Send + Sync + 'static;

    /// Produce the result. May suspend on network I/O.
    async fn process(&self, request: &GenerationRequest) -> crate::Result<Self::Output>;

    /// Commit the result (send the reply, update state). Skipped when the
    /// key was cancelled while `process` ran.
    async fn apply(&self, _request: &GenerationRequest, _output: &Self::Output) -> crate::Result<()> {
        Ok(())
    }
}

/// How a sequenced request ended.
#[derive(Debug)]
pub enum SequencedOutcome<O> {
    /// Processed and applied, or failed.
    Completed(crate::Result<O>),
    /// Dropped from the queue before dispatch.
    Cancelled,
    /// Processed, but the key was cancelled meanwhile; nothing was applied.
    Discarded,
}

impl<O> SequencedOutcome<O> {
    pub fn is_completed(&self) -> bool {
        matches!(self, SequencedOutcome::Completed(_))
    }
}

/// Handle to the eventual outcome of an enqueued request.
#[derive(Debug)]
pub struct Ticket<O> {
    key: ContextKey,
    sequence: u64,
    receiver: oneshot::Receiver<SequencedOutcome<O>>,
}

impl<O> Ticket<O> {
    pub fn key(&self) -> &ContextKey {
        &self.key
    }

    /// Process-wide enqueue sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub async fn wait(self) -> SequencedOutcome<O> {
        // A worker that went away without answering never applied anything.
        self.receiver.await.unwrap_or(SequencedOutcome::Cancelled)
    }
}

/// Admission and pacing limits.
#[derive(Debug, Clone, PartialEq)]
pub struct SequencerConfig {
    /// Waiting requests per key, not counting the one being processed.
    pub max_depth: usize,
    pub max_pending_per_author: usize,
    pub duplicate_window: Duration,
    /// Minimum gap between finishing one request and starting the next.
    pub dispatch_delay: Duration,
    pub idle_timeout: Duration,
}

impl SequencerConfig {
    pub fn from_settings(settings: &RuntimeSettings) -> Self {
        Self {
            max_depth: settings.queue_max_depth,
            max_pending_per_author: settings.queue_max_pending_per_author,
            duplicate_window: Duration::from_millis(settings.queue_duplicate_window_ms),
            dispatch_delay: Duration::from_millis(settings.queue_dispatch_delay_ms),
            idle_timeout: Duration::from_secs(settings.queue_idle_timeout_secs),
        }
    }
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self::from_settings(&RuntimeSettings::default())
    }
}

struct Queued<O> {
    sequence: u64,
    epoch: u64,
    request: GenerationRequest,
    reply: oneshot::Sender<SequencedOutcome<O>>,
}

struct Pending {
    sequence: u64,
    author_id: u64,
    text: String,
    enqueued_at: Instant,
}

struct KeyQueue<O> {
    sender: mpsc::UnboundedSender<Queued<O>>,
    pending: VecDeque<Pending>,
    /// Bumped on cancel. Requests from an older epoch are never applied.
    epoch: u64,
    worker_id: u64,
    processing: bool,
}

type QueueMap<O> = Arc<Mutex<HashMap<ContextKey, KeyQueue<O>>>>;

pub struct InboundEventSequencer<P: RequestProcessor> {
    processor: Arc<P>,
    config: Arc<ArcSwap<SequencerConfig>>,
    queues: QueueMap<P::Output>,
    next_sequence: AtomicU64,
    next_worker: AtomicU64,
}

impl<P: RequestProcessor> InboundEventSequencer<P> {
    pub fn new(processor: Arc<P>, config: SequencerConfig) -> Self {
        Self {
            processor,
            config: Arc::new(ArcSwap::from_pointee(config)),
            queues: Arc::new(Mutex::new(HashMap::new())),
            next_sequence: AtomicU64::new(1),
            next_worker: AtomicU64::new(1),
        }
    }

    /// Replace admission limits. Applies to the next enqueue and the next
    /// idle check.
    pub fn set_config(&self, config: SequencerConfig) {
        if **self.config.load() != config {
            self.config.store(Arc::new(config));
        }
    }

    /// Queue `request` behind everything already waiting on `key`.
    ///
    /// Never blocks. Rejects when the key's queue is full, the author has
    /// too many requests waiting, or the same author sent the same text
    /// moments ago.
    pub fn enqueue(
        &self,
        key: ContextKey,
        mut request: GenerationRequest,
    ) -> Result<Ticket<P::Output>, QueueError> {
        request.key = key.clone();
        let config = self.config.load_full();
        let now = Instant::now();
        let text = request.dedupe_text().to_string();
        let author_id = request.author_id;

        let mut queues = self.queues.lock();
        if let Some(queue) = queues.get(&key) {
            let reject = |reason| QueueError::Saturated {
                key: key.clone(),
                reason,
            };
            if queue.pending.len() >= config.max_depth {
                return Err(reject(SaturationReason::QueueFull));
            }
            let from_author = queue
                .pending
                .iter()
                .filter(|pending| pending.author_id == author_id);
            if from_author.clone().count() >= config.max_pending_per_author {
                return Err(reject(SaturationReason::AuthorLimit));
            }
            let duplicate = !text.is_empty()
                && from_author.clone().any(|pending| {
                    pending.text == text
                        && now.duration_since(pending.enqueued_at) < config.duplicate_window
                });
            if duplicate {
                return Err(reject(SaturationReason::Duplicate));
            }
        } else if config.max_depth == 0 {
            return Err(QueueError::Saturated {
                key,
                reason: SaturationReason::QueueFull,
            });
        }

        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let (reply, receiver) = oneshot::channel();

        let queue = queues
            .entry(key.clone())
            .or_insert_with(|| self.spawn_worker(key.clone()));
        let mut queued = Queued {
            sequence,
            epoch: queue.epoch,
            request,
            reply,
        };
        if let Err(mpsc::error::SendError(returned)) = queue.sender.send(queued) {
            // The worker died without cleaning up. Start a fresh one.
            tracing::warn!(%key, "sequencer worker gone, respawning");
            let mut fresh = self.spawn_worker(key.clone());
            queued = returned;
            queued.epoch = fresh.epoch;
            if fresh.sender.send(queued).is_err() {
                return Err(QueueError::Saturated {
                    key,
                    reason: SaturationReason::Closed,
                });
            }
            // Requests sent to the dead worker resolve as cancelled.
            *queue = fresh;
        }
        queue.pending.push_back(Pending {
            sequence,
            author_id,
            text,
            enqueued_at: now,
        });
        let depth = queue.pending.len();
        drop(queues);

        tracing::debug!(%key, sequence, depth, "request enqueued");
        Ok(Ticket {
            key,
            sequence,
            receiver,
        })
    }

    fn spawn_worker(&self, key: ContextKey) -> KeyQueue<P::Output> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker_id = self.next_worker.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(run_worker(
            key.clone(),
            worker_id,
            self.processor.clone(),
            self.queues.clone(),
            self.config.clone(),
            receiver,
        ));
        tracing::debug!(%key, worker_id, "sequencer worker started");
        KeyQueue {
            sender,
            pending: VecDeque::new(),
            epoch: 0,
            worker_id,
            processing: false,
        }
    }

    /// Discard every request still waiting on `key` and mark any request in
    /// progress so its result is not applied. Returns how many waiting
    /// requests were discarded.
    pub fn cancel(&self, key: &ContextKey) -> usize {
        let mut queues = self.queues.lock();
        let Some(queue) = queues.get_mut(key) else {
            return 0;
        };
        queue.epoch += 1;
        let discarded = queue.pending.len();
        queue.pending.clear();
        if discarded > 0 || queue.processing {
            tracing::info!(%key, discarded, in_progress = queue.processing, "sequencer queue cancelled");
        }
        discarded
    }

    /// Keys with a live worker.
    pub fn active_keys(&self) -> Vec<ContextKey> {
        let mut keys: Vec<_> = self.queues.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Requests waiting on `key`, not counting one being processed.
    pub fn queue_depth(&self, key: &ContextKey) -> usize {
        self.queues
            .lock()
            .get(key)
            .map_or(0, |queue| queue.pending.len())
    }
}

async fn run_worker<P: RequestProcessor>(
    key: ContextKey,
    worker_id: u64,
    processor: Arc<P>,
    queues: QueueMap<P::Output>,
    config: Arc<ArcSwap<SequencerConfig>>,
    mut receiver: mpsc::UnboundedReceiver<Queued<P::Output>>,
) {
    let mut last_finished: Option<Instant> = None;

    loop {
        let idle_timeout = config.load().idle_timeout;
        let queued = match tokio::time::timeout(idle_timeout, receiver.recv()).await {
            Ok(Some(queued)) => queued,
            Ok(None) => break,
            Err(_) => {
                // Enqueue holds the map lock while sending, so an empty
                // channel under the lock means nothing is in transit.
                let mut queues = queues.lock();
                match receiver.try_recv() {
                    Ok(queued) => queued,
                    Err(_) => {
                        if queues
                            .get(&key)
                            .is_some_and(|queue| queue.worker_id == worker_id)
                        {
                            queues.remove(&key);
                        }
                        tracing::debug!(%key, worker_id, "sequencer worker idle, retiring");
                        break;
                    }
                }
            }
        };

        let dispatch_delay = config.load().dispatch_delay;
        if let Some(finished) = last_finished {
            let since = finished.elapsed();
            if since < dispatch_delay {
                tokio::time::sleep(dispatch_delay - since).await;
            }
        }

        let live = {
            let mut queues = queues.lock();
            match queues.get_mut(&key) {
                Some(queue) => {
                    queue.pending.retain(|pending| pending.sequence != queued.sequence);
                    let live = queue.epoch == queued.epoch;
                    queue.processing = live;
                    live
                }
                None => false,
            }
        };
        if !live {
            tracing::debug!(%key, sequence = queued.sequence, "dropping cancelled request");
            let _ = queued.reply.send(SequencedOutcome::Cancelled);
            continue;
        }

        let Queued {
            sequence,
            epoch,
            request,
            reply,
        } = queued;

        let outcome = match processor.process(&request).await {
            Err(error) => SequencedOutcome::Completed(Err(error)),
            Ok(output) => {
                let still_live = queues
                    .lock()
                    .get(&key)
                    .is_some_and(|queue| queue.epoch == epoch);
                if still_live {
                    match processor.apply(&request, &output).await {
                        Ok(()) => SequencedOutcome::Completed(Ok(output)),
                        Err(error) => SequencedOutcome::Completed(Err(error)),
                    }
                } else {
                    tracing::info!(%key, sequence, "discarding result of cancelled request");
                    SequencedOutcome::Discarded
                }
            }
        };

        if let Some(queue) = queues.lock().get_mut(&key) {
            queue.processing = false;
        }
        last_finished = Some(Instant::now());
        let _ = reply.send(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AuthorKind, MessagePayload, PromptMessage, TriggerKind};

    use tokio::sync::Notify;

    fn request(author_id: u64, text: &str) -> GenerationRequest {
        GenerationRequest {
            key: ContextKey::channel(0),
            trigger_message_id: 0,
            author_id,
            author_kind: AuthorKind::Human,
            trigger: TriggerKind::Direct,
            payload: MessagePayload::new(vec![PromptMessage::user(text)]),
            tier_override: None,
            enqueued_at: chrono::Utc::now(),
        }
    }

    fn config() -> SequencerConfig {
        SequencerConfig {
            max_depth: 10,
            max_pending_per_author: 10,
            duplicate_window: Duration::from_secs(3),
            dispatch_delay: Duration::ZERO,
            idle_timeout: Duration::from_secs(300),
        }
    }

    /// Sleeps a per-request duration parsed from the text, records apply order.
    #[derive(Default)]
    struct Recorder {
        applied: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RequestProcessor for Recorder {
        type Output = String;

        async fn process(&self, request: &GenerationRequest) -> crate::Result<String> {
            let text = request.dedupe_text().to_string();
            let millis: u64 = text.split(':').nth(1).and_then(|ms| ms.parse().ok()).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok(text)
        }

        async fn apply(&self, _request: &GenerationRequest, output: &String) -> crate::Result<()> {
            self.applied.lock().push(output.clone());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn same_key_completes_in_enqueue_order() {
        let recorder = Arc::new(Recorder::default());
        let sequencer = InboundEventSequencer::new(recorder.clone(), config());
        let key = ContextKey::channel(1);

        let latencies = [500, 10, 300, 0, 120];
        let tickets: Vec<_> = latencies
            .iter()
            .enumerate()
            .map(|(index, ms)| {
                sequencer
                    .enqueue(key.clone(), request(index as u64, &format!("r{index}:{ms}")))
                    .unwrap()
            })
            .collect();

        for ticket in tickets {
            assert!(ticket.wait().await.is_completed());
        }
        let applied = recorder.applied.lock().clone();
        assert_eq!(applied, ["r0:500", "r1:10", "r2:300", "r3:0", "r4:120"]);
    }

    #[tokio::test(start_paused = true)]
    async fn different_keys_run_concurrently() {
        let recorder = Arc::new(Recorder::default());
        let sequencer = InboundEventSequencer::new(recorder.clone(), config());

        let slow = sequencer
            .enqueue(ContextKey::channel(1), request(1, "slow:1000"))
            .unwrap();
        let fast = sequencer
            .enqueue(ContextKey::channel(2), request(1, "fast:10"))
            .unwrap();

        let started = Instant::now();
        fast.wait().await;
        assert!(started.elapsed() < Duration::from_millis(1000));
        slow.wait().await;
        assert_eq!(*recorder.applied.lock(), ["fast:10", "slow:1000"]);
    }

    /// Blocks the first request until released.
    struct Gate {
        release: Notify,
        started: Notify,
        applied: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RequestProcessor for Gate {
        type Output = String;

        async fn process(&self, request: &GenerationRequest) -> crate::Result<String> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(request.dedupe_text().to_string())
        }

        async fn apply(&self, _request: &GenerationRequest, output: &String) -> crate::Result<()> {
            self.applied.lock().push(output.clone());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_drops_waiting_and_discards_in_flight() {
        let gate = Arc::new(Gate {
            release: Notify::new(),
            started: Notify::new(),
            applied: Mutex::new(Vec::new()),
        });
        let sequencer = InboundEventSequencer::new(gate.clone(), config());
        let key = ContextKey::channel(5);
        let other = ContextKey::channel(6);

        let first = sequencer.enqueue(key.clone(), request(1, "a")).unwrap();
        gate.started.notified().await;
        let second = sequencer.enqueue(key.clone(), request(2, "b")).unwrap();
        let third = sequencer.enqueue(key.clone(), request(3, "c")).unwrap();
        assert_eq!(sequencer.queue_depth(&key), 2);

        assert_eq!(sequencer.cancel(&key), 2);
        assert_eq!(sequencer.cancel(&other), 0);
        gate.release.notify_one();

        assert!(matches!(first.wait().await, SequencedOutcome::Discarded));
        assert!(matches!(second.wait().await, SequencedOutcome::Cancelled));
        assert!(matches!(third.wait().await, SequencedOutcome::Cancelled));
        assert!(gate.applied.lock().is_empty());

        // The key keeps working after a cancel.
        let next = sequencer.enqueue(key.clone(), request(1, "d")).unwrap();
        gate.started.notified().await;
        gate.release.notify_one();
        assert!(next.wait().await.is_completed());
        assert_eq!(*gate.applied.lock(), ["d"]);
    }

    #[tokio::test(start_paused = true)]
    async fn saturation_rejects_without_blocking() {
        let gate = Arc::new(Gate {
            release: Notify::new(),
            started: Notify::new(),
            applied: Mutex::new(Vec::new()),
        });
        let sequencer = InboundEventSequencer::new(
            gate.clone(),
            SequencerConfig {
                max_depth: 2,
                max_pending_per_author: 2,
                ..config()
            },
        );
        let key = ContextKey::channel(9);

        let _running = sequencer.enqueue(key.clone(), request(1, "running")).unwrap();
        gate.started.notified().await;

        let _a = sequencer.enqueue(key.clone(), request(1, "one")).unwrap();
        let duplicate = sequencer.enqueue(key.clone(), request(1, "one")).unwrap_err();
        assert_eq!(duplicate.reason(), SaturationReason::Duplicate);

        let _b = sequencer.enqueue(key.clone(), request(1, "two")).unwrap();
        let author = sequencer.enqueue(key.clone(), request(1, "three")).unwrap_err();
        assert_eq!(author.reason(), SaturationReason::QueueFull);

        sequencer.set_config(SequencerConfig {
            max_depth: 5,
            max_pending_per_author: 2,
            ..config()
        });
        let author = sequencer.enqueue(key.clone(), request(1, "three")).unwrap_err();
        assert_eq!(author.reason(), SaturationReason::AuthorLimit);
        assert!(sequencer.enqueue(key.clone(), request(2, "three")).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn duplicates_outside_the_window_are_accepted() {
        let gate = Arc::new(Gate {
            release: Notify::new(),
            started: Notify::new(),
            applied: Mutex::new(Vec::new()),
        });
        let sequencer = InboundEventSequencer::new(gate.clone(), config());
        let key = ContextKey::channel(3);

        let _running = sequencer.enqueue(key.clone(), request(1, "busy")).unwrap();
        gate.started.notified().await;
        let _first = sequencer.enqueue(key.clone(), request(1, "hello")).unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(sequencer.enqueue(key.clone(), request(1, "hello")).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_workers_retire() {
        let recorder = Arc::new(Recorder::default());
        let sequencer = InboundEventSequencer::new(
            recorder.clone(),
            SequencerConfig {
                idle_timeout: Duration::from_secs(30),
                ..config()
            },
        );
        let key = ContextKey::channel(4);
        sequencer.enqueue(key.clone(), request(1, "x")).unwrap().wait().await;
        assert_eq!(sequencer.active_keys(), [key.clone()]);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(sequencer.active_keys().is_empty());

        // A fresh worker is created on demand.
        let ticket = sequencer.enqueue(key.clone(), request(1, "y")).unwrap();
        assert!(ticket.wait().await.is_completed());
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_delay_spaces_requests() {
        let recorder = Arc::new(Recorder::default());
        let sequencer = InboundEventSequencer::new(
            recorder.clone(),
            SequencerConfig {
                dispatch_delay: Duration::from_millis(500),
                ..config()
            },
        );
        let key = ContextKey::channel(2);
        let started = Instant::now();
        let first = sequencer.enqueue(key.clone(), request(1, "a")).unwrap();
        let second = sequencer.enqueue(key.clone(), request(2, "b")).unwrap();
        first.wait().await;
        assert!(started.elapsed() < Duration::from_millis(500));
        second.wait().await;
        assert!(started.elapsed() >= Duration::from_millis(500));
    }

    struct Failing;

    #[async_trait]
    impl RequestProcessor for Failing {
        type Output = ();

        async fn process(&self, _request: &GenerationRequest) -> crate::Result<()> {
            Err(anyhow::anyhow!("boom").into())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failures_complete_with_error_and_queue_continues() {
        let sequencer = InboundEventSequencer::new(Arc::new(Failing), config());
        let key = ContextKey::channel(1);
        let first = sequencer.enqueue(key.clone(), request(1, "a")).unwrap();
        let second = sequencer.enqueue(key.clone(), request(2, "b")).unwrap();
        assert!(matches!(first.wait().await, SequencedOutcome::Completed(Err(_))));
        assert!(matches!(second.wait().await, SequencedOutcome::Completed(Err(_))));
    }
}
