use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use super::handler::{Decoding, StoredEventHandler};
use super::{CursorLease, DeadLetter, EventHandler, SubscriptionStore};
use crate::event_sourcing::core::{DomainEvent, Position, StoredEvent};
use crate::event_sourcing::StoreError;
use crate::metrics::Metrics;
use crate::utils::{retry_with_backoff, RetryConfig, RetryResult};

// ============================================================================
// Subscription Dispatcher
// ============================================================================
//
// Polls the event log and feeds each registered subscription its events in
// commit order. One pass over one subscription:
//
// 1. Lease the cursor (exclusive, held until step 5)
// 2. Read the watermark: the oldest commit token still in flight
// 3. Fetch events with (token, id) > cursor AND token < watermark,
//    ordered by (token, id), at most `batch_size`
// 4. Hand them to the handler one by one, retrying failures with backoff
// 5. Move the cursor to the last handled position and release the lease
//
// Row ids are handed out at insert time, so an earlier transaction can
// commit a smaller id after larger ones are visible. Ordering by commit
// token and stopping at the watermark keeps the delivered sequence gap-free.
//
// ============================================================================

/// What to do with an event whose handler still fails after all retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoisonPolicy {
    /// Park it as a dead letter and move on
    #[default]
    DeadLetter,
    /// Never move the cursor past it; the subscription stalls until it succeeds
    Block,
}

impl FromStr for PoisonPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dead_letter" | "dead-letter" | "deadletter" => Ok(PoisonPolicy::DeadLetter),
            "block" => Ok(PoisonPolicy::Block),
            other => Err(format!("unknown poison policy: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Delay between the end of one pass and the start of the next
    pub poll_interval: Duration,
    pub initial_delay: Duration,
    pub batch_size: usize,
    /// Handler retries, per event
    pub retry: RetryConfig,
    pub poison_policy: PoisonPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            initial_delay: Duration::from_millis(1000),
            batch_size: 500,
            retry: RetryConfig::default(),
            poison_policy: PoisonPolicy::DeadLetter,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Subscription {0} is already registered")]
    DuplicateSubscription(String),

    #[error("Unknown subscription: {0}")]
    UnknownSubscription(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Result of one pass over one subscription
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub subscription: String,
    /// Events fetched in this pass
    pub fetched: usize,
    /// Events the handler accepted
    pub delivered: usize,
    pub dead_lettered: usize,
    /// First event that failed under `PoisonPolicy::Block`
    pub blocked_at: Option<Position>,
    /// Cursor after the pass
    pub cursor: Option<Position>,
    /// The previous pass was still running, nothing was done
    pub skipped: bool,
}

#[derive(Debug)]
pub struct SubscriptionReport {
    pub subscription: String,
    pub result: Result<BatchOutcome, DispatchError>,
}

struct Subscription {
    name: String,
    aggregate_type: String,
    handler: Box<dyn StoredEventHandler>,
    busy: Mutex<()>,
}

pub struct SubscriptionDispatcher {
    store: Arc<dyn SubscriptionStore>,
    config: DispatcherConfig,
    subscriptions: Vec<Subscription>,
    metrics: Option<Arc<Metrics>>,
}

impl SubscriptionDispatcher {
    pub fn new(store: Arc<dyn SubscriptionStore>, config: DispatcherConfig) -> Self {
        Self {
            store,
            config,
            subscriptions: Vec::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn subscription_names(&self) -> Vec<&str> {
        self.subscriptions.iter().map(|s| s.name.as_str()).collect()
    }

    /// Subscribe `handler` to every event of `aggregate_type`.
    ///
    /// The name keys the durable cursor, so it must be unique and stable
    /// across restarts.
    pub fn register_handler<E, H>(
        &mut self,
        subscription_name: &str,
        aggregate_type: &str,
        handler: H,
    ) -> Result<(), DispatchError>
    where
        E: DomainEvent,
        H: EventHandler<E> + 'static,
    {
        if self.subscriptions.iter().any(|s| s.name == subscription_name) {
            return Err(DispatchError::DuplicateSubscription(subscription_name.to_string()));
        }

        self.subscriptions.push(Subscription {
            name: subscription_name.to_string(),
            aggregate_type: aggregate_type.to_string(),
            handler: Box::new(Decoding::<E, H>::new(handler)),
            busy: Mutex::new(()),
        });

        tracing::info!(
            subscription = %subscription_name,
            aggregate_type = %aggregate_type,
            "Registered subscription handler"
        );
        Ok(())
    }

    /// Run one pass for a single subscription
    pub async fn dispatch(&self, subscription_name: &str) -> Result<BatchOutcome, DispatchError> {
        let subscription = self
            .subscriptions
            .iter()
            .find(|s| s.name == subscription_name)
            .ok_or_else(|| DispatchError::UnknownSubscription(subscription_name.to_string()))?;

        self.run(subscription).await
    }

    /// Run one pass for every subscription, concurrently. A failing
    /// subscription does not affect the others.
    pub async fn poll_once(&self) -> Vec<SubscriptionReport> {
        join_all(self.subscriptions.iter().map(|subscription| async move {
            let result = self.run(subscription).await;
            if let Err(e) = &result {
                tracing::error!(
                    subscription = %subscription.name,
                    error = %e,
                    "Dispatch pass failed, will retry on next poll"
                );
            }
            SubscriptionReport {
                subscription: subscription.name.clone(),
                result,
            }
        }))
        .await
    }

    /// Run the polling loop on the tokio runtime until the handle is stopped
    /// or dropped.
    pub fn spawn(self) -> DispatcherHandle {
        let dispatcher = Arc::new(self);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let config = dispatcher.config.clone();
            tracing::info!(
                subscriptions = dispatcher.subscriptions.len(),
                poll_interval_ms = config.poll_interval.as_millis(),
                "🚀 Starting subscription dispatcher"
            );

            tokio::select! {
                _ = &mut stop_rx => return,
                _ = tokio::time::sleep(config.initial_delay) => {}
            }

            loop {
                dispatcher.poll_once().await;

                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = tokio::time::sleep(config.poll_interval) => {}
                }
            }

            tracing::info!("Subscription dispatcher stopped");
        });

        DispatcherHandle {
            stop: Some(stop_tx),
            task,
        }
    }

    async fn run(&self, subscription: &Subscription) -> Result<BatchOutcome, DispatchError> {
        let mut outcome = BatchOutcome {
            subscription: subscription.name.clone(),
            ..BatchOutcome::default()
        };

        let Ok(_busy) = subscription.busy.try_lock() else {
            tracing::debug!(subscription = %subscription.name, "Previous pass still running, skipping");
            outcome.skipped = true;
            return Ok(outcome);
        };

        let started = Instant::now();
        let mut lease = self.store.lease(&subscription.name).await?;
        let watermark = lease.watermark().await?;
        let batch = lease
            .fetch_batch(&subscription.aggregate_type, watermark, self.config.batch_size)
            .await?;
        outcome.fetched = batch.len();

        let mut handled: Option<Position> = None;
        for event in &batch {
            match self.deliver(subscription, event).await {
                Ok(()) => {
                    outcome.delivered += 1;
                    if outcome.blocked_at.is_none() {
                        handled = Some(event.position());
                    }
                }
                Err((error, attempts)) => {
                    self.on_poison(subscription, lease.as_mut(), event, error, attempts, &mut outcome)
                        .await?;
                    if outcome.blocked_at.is_none() {
                        handled = Some(event.position());
                    }
                }
            }
        }

        lease.commit(handled).await?;
        outcome.cursor = lease.cursor().position();

        if outcome.fetched > 0 {
            tracing::info!(
                subscription = %subscription.name,
                watermark = %watermark,
                fetched = outcome.fetched,
                delivered = outcome.delivered,
                dead_lettered = outcome.dead_lettered,
                cursor = ?outcome.cursor,
                "Dispatched batch"
            );
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_batch(&subscription.name, outcome.delivered, started.elapsed().as_secs_f64());
        }

        Ok(outcome)
    }

    /// Hand one event to the handler, retrying with backoff
    async fn deliver(&self, subscription: &Subscription, event: &StoredEvent) -> Result<(), (anyhow::Error, u32)> {
        let handler = subscription.handler.as_ref();
        let metrics = self.metrics.as_deref();
        let name = subscription.name.as_str();
        let mut last_attempt = 0;

        let result = retry_with_backoff(self.config.retry.clone(), |attempt| {
            last_attempt = attempt;
            async move {
                if attempt > 1 {
                    if let Some(metrics) = metrics {
                        metrics.record_retry_attempt(name, attempt);
                    }
                }
                let outcome = handler.handle_stored(event).await;
                if outcome.is_err() {
                    if let Some(metrics) = metrics {
                        metrics.record_handler_failure(name, &event.event_kind);
                    }
                }
                outcome
            }
        })
        .await;

        let retried = last_attempt > 1;
        match result {
            RetryResult::Success(()) => {
                if retried {
                    if let Some(metrics) = metrics {
                        metrics.record_retry_outcome(name, true);
                    }
                }
                Ok(())
            }
            RetryResult::Failed { error, attempts } | RetryResult::PermanentFailure { error, attempts } => {
                if let Some(metrics) = metrics {
                    metrics.record_retry_outcome(name, false);
                }
                Err((error, attempts))
            }
        }
    }

    async fn on_poison(
        &self,
        subscription: &Subscription,
        lease: &mut dyn CursorLease,
        event: &StoredEvent,
        error: anyhow::Error,
        attempts: u32,
        outcome: &mut BatchOutcome,
    ) -> Result<(), DispatchError> {
        match self.config.poison_policy {
            PoisonPolicy::DeadLetter => {
                tracing::error!(
                    subscription = %subscription.name,
                    event_id = event.id,
                    aggregate_id = %event.aggregate_id,
                    event_kind = %event.event_kind,
                    attempts = attempts,
                    error = %error,
                    "☠️ Handler kept failing, parking event as dead letter"
                );
                lease
                    .dead_letter(DeadLetter::from_event(&subscription.name, event, format!("{error:#}"), attempts))
                    .await?;
                outcome.dead_lettered += 1;
                if let Some(metrics) = &self.metrics {
                    metrics.record_dead_letter(&subscription.name);
                }
            }
            PoisonPolicy::Block => {
                tracing::error!(
                    subscription = %subscription.name,
                    event_id = event.id,
                    aggregate_id = %event.aggregate_id,
                    event_kind = %event.event_kind,
                    attempts = attempts,
                    error = %error,
                    "Handler kept failing, cursor held before this event"
                );
                if outcome.blocked_at.is_none() {
                    outcome.blocked_at = Some(event.position());
                }
            }
        }
        Ok(())
    }
}

/// Handle to a spawned dispatcher loop. Dropping it also stops the loop.
pub struct DispatcherHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl DispatcherHandle {
    /// Stop after the pass in progress (if any) and wait for the loop to exit
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.task).await {
            tracing::error!(error = %e, "Dispatcher task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sourcing::core::CommitToken;
    use crate::event_sourcing::store::{EventRepository, InMemoryEventLog};
    use crate::event_sourcing::EncodedEvent;
    use serde::Serialize;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use uuid::Uuid;

    #[derive(Serialize, serde::Deserialize, Clone, Debug, PartialEq)]
    #[serde(tag = "kind", content = "data")]
    enum PingEvent {
        Ping(i64),
    }

    impl DomainEvent for PingEvent {
        const KINDS: &'static [&'static str] = &["Ping"];

        fn kind(&self) -> &'static str {
            "Ping"
        }
    }

    /// Records every delivered ping; fails on the values in `poison`
    #[derive(Default)]
    struct Recorder {
        seen: StdMutex<Vec<i64>>,
        poison: Vec<i64>,
    }

    impl Recorder {
        fn failing_on(poison: &[i64]) -> Self {
            Self { seen: StdMutex::new(Vec::new()), poison: poison.to_vec() }
        }

        fn seen(&self) -> Vec<i64> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl EventHandler<PingEvent> for Recorder {
        async fn handle(&self, event: PingEvent, _stored: &StoredEvent) -> anyhow::Result<()> {
            let PingEvent::Ping(n) = event;
            if self.poison.contains(&n) {
                anyhow::bail!("cannot handle ping {n}");
            }
            self.seen.lock().unwrap().push(n);
            Ok(())
        }
    }

    fn ping(n: i64) -> Vec<EncodedEvent> {
        vec![EncodedEvent { kind: "Ping".to_string(), payload: json!({ "kind": "Ping", "data": n }) }]
    }

    fn config(policy: PoisonPolicy) -> DispatcherConfig {
        DispatcherConfig {
            poll_interval: Duration::from_millis(10),
            initial_delay: Duration::ZERO,
            batch_size: 100,
            retry: RetryConfig::immediate(2),
            poison_policy: policy,
        }
    }

    fn dispatcher_with(
        log: &Arc<InMemoryEventLog>,
        policy: PoisonPolicy,
        recorder: Arc<Recorder>,
    ) -> SubscriptionDispatcher {
        let mut dispatcher = SubscriptionDispatcher::new(log.clone(), config(policy));
        dispatcher
            .register_handler::<PingEvent, _>("pings", "Pinger", recorder)
            .unwrap();
        dispatcher
    }

    #[tokio::test]
    async fn test_first_poll_creates_cursor_and_delivers() {
        let log = Arc::new(InMemoryEventLog::new());
        log.append(Uuid::new_v4(), "Pinger", 0, ping(1)).await.unwrap();
        let recorder = Arc::new(Recorder::default());
        let dispatcher = dispatcher_with(&log, PoisonPolicy::DeadLetter, recorder.clone());

        let outcome = dispatcher.dispatch("pings").await.unwrap();

        assert_eq!(outcome.delivered, 1);
        assert_eq!(recorder.seen(), vec![1]);
        assert!(log.cursor("pings").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_open_transaction_holds_back_later_commits() {
        let log = Arc::new(InMemoryEventLog::new());
        let recorder = Arc::new(Recorder::default());
        let dispatcher = dispatcher_with(&log, PoisonPolicy::DeadLetter, recorder.clone());

        let mut slow = log.begin();
        slow.append(Uuid::new_v4(), "Pinger", 0, ping(1)).unwrap();
        log.append(Uuid::new_v4(), "Pinger", 0, ping(2)).await.unwrap();

        dispatcher.dispatch("pings").await.unwrap();
        assert!(recorder.seen().is_empty());

        slow.commit();
        dispatcher.dispatch("pings").await.unwrap();
        assert_eq!(recorder.seen(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_dead_letter_policy_parks_and_continues() {
        let log = Arc::new(InMemoryEventLog::new());
        for n in 1..=3 {
            log.append(Uuid::new_v4(), "Pinger", 0, ping(n)).await.unwrap();
        }
        let recorder = Arc::new(Recorder::failing_on(&[2]));
        let dispatcher = dispatcher_with(&log, PoisonPolicy::DeadLetter, recorder.clone());

        let outcome = dispatcher.dispatch("pings").await.unwrap();

        assert_eq!(outcome.dead_lettered, 1);
        assert_eq!(recorder.seen(), vec![1, 3]);
        let letters = log.dead_letters("pings").await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].attempts, 2);
        assert!(letters[0].error.contains("cannot handle ping 2"));

        let again = dispatcher.dispatch("pings").await.unwrap();
        assert_eq!(again.fetched, 0);
    }

    #[tokio::test]
    async fn test_block_policy_holds_cursor_before_failure() {
        let log = Arc::new(InMemoryEventLog::new());
        for n in 1..=3 {
            log.append(Uuid::new_v4(), "Pinger", 0, ping(n)).await.unwrap();
        }
        let recorder = Arc::new(Recorder::failing_on(&[2]));
        let dispatcher = dispatcher_with(&log, PoisonPolicy::Block, recorder.clone());

        let outcome = dispatcher.dispatch("pings").await.unwrap();
        let first = log.committed_events()[0].position();

        assert_eq!(outcome.cursor, Some(first));
        assert!(outcome.blocked_at.is_some());

        let again = dispatcher.dispatch("pings").await.unwrap();
        assert_eq!(again.fetched, 2);
        assert_eq!(again.cursor, Some(first));
        assert!(log.dead_letters("pings").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_subscription_rejected() {
        let log = Arc::new(InMemoryEventLog::new());
        let recorder = Arc::new(Recorder::default());
        let mut dispatcher = dispatcher_with(&log, PoisonPolicy::DeadLetter, recorder.clone());

        let err = dispatcher
            .register_handler::<PingEvent, _>("pings", "Pinger", recorder)
            .unwrap_err();

        assert!(matches!(err, DispatchError::DuplicateSubscription(name) if name == "pings"));
    }

    #[tokio::test]
    async fn test_only_matching_aggregate_type_is_delivered() {
        let log = Arc::new(InMemoryEventLog::new());
        log.append(Uuid::new_v4(), "Other", 0, ping(9)).await.unwrap();
        log.append(Uuid::new_v4(), "Pinger", 0, ping(1)).await.unwrap();
        let recorder = Arc::new(Recorder::default());
        let dispatcher = dispatcher_with(&log, PoisonPolicy::DeadLetter, recorder.clone());

        dispatcher.poll_once().await;

        assert_eq!(recorder.seen(), vec![1]);
    }

    #[tokio::test]
    async fn test_spawned_loop_delivers_until_stopped() {
        let log = Arc::new(InMemoryEventLog::new());
        let recorder = Arc::new(Recorder::default());
        let handle = dispatcher_with(&log, PoisonPolicy::DeadLetter, recorder.clone()).spawn();

        log.append(Uuid::new_v4(), "Pinger", 0, ping(1)).await.unwrap();
        for _ in 0..100 {
            if !recorder.seen().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.stop().await;

        assert_eq!(recorder.seen(), vec![1]);
        assert!(log.watermark() > CommitToken(1));
    }

    #[test]
    fn test_poison_policy_parsing() {
        assert_eq!("dead_letter".parse::<PoisonPolicy>(), Ok(PoisonPolicy::DeadLetter));
        assert_eq!("BLOCK".parse::<PoisonPolicy>(), Ok(PoisonPolicy::Block));
        assert!("skip".parse::<PoisonPolicy>().is_err());
    }
}
