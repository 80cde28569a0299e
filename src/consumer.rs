//! Consumer loop with bounded concurrency, explicit acknowledgment and
//! retry.
//!
//! A [`Consumer`] subscribes to one queue in manual-ack mode and:
//!
//! - Keeps at most `prefetch` deliveries in flight, one task each
//! - Rejects undecodable (poison) deliveries without calling the processor
//! - ACKs on success, requeues with an incremented retry counter on failure,
//!   and dead-letters once the retry ceiling is reached
//! - Exposes lifecycle hooks and counters
//!
//! The loop runs until:
//! - A [`CancellationToken`] is triggered (graceful drain)
//! - The subscription fails or is ended by the broker
//!
//! Delivery is at-least-once. Anything not acknowledged when the loop stops
//! is redelivered by the broker.

use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::FutureExt;
use tokio::{sync::watch, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;

use crate::{
    Envelope,
    envelope::DecodeError,
    retry::{RetryDecision, RetryPolicy},
    transport::{BrokerError, Delivery, DeliveryTag, Subscribe},
};

pub mod process;
pub mod recovery;
mod stats;

pub use process::{Process, ProcessingError};
pub use recovery::{RecoveryError, RecoveryErrorKind, Supervisor, run_with_recovery};
pub use stats::{ConsumerStats, ConsumerStatsSnapshot};

const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Not subscribed.
    Idle,
    Listening,
    /// Cancelled or disconnected; in-flight deliveries are draining.
    ShuttingDown,
    Stopped,
}

/// Final wire action taken for a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Acked,
    NackedRequeue,
    NackedDropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The body could not be decoded.
    Poison,
    /// Permanent failure or retry ceiling reached.
    DeadLetter,
}

/// What the hook gets to know about a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryInfo {
    pub tag: DeliveryTag,
    pub redelivered: bool,
    pub retry_count: u32,
    pub message_id: Option<String>,
}

impl DeliveryInfo {
    fn of(delivery: &Delivery) -> Self {
        Self {
            tag: delivery.tag(),
            redelivered: delivery.redelivered(),
            retry_count: delivery.retry_count(),
            message_id: delivery.properties().message_id.clone(),
        }
    }
}

/// Subscription parameters of a [`Consumer`].
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    queue: String,
    prefetch: u16,
    consumer_tag: String,
    retry: RetryPolicy,
    drain_timeout: Duration,
    dead_letter: bool,
}

impl ConsumerOptions {
    /// Consume `queue` with at most `prefetch` unresolved deliveries.
    pub fn new(queue: impl Into<String>, prefetch: u16) -> Self {
        Self {
            queue: queue.into(),
            prefetch,
            consumer_tag: format!("mailbag-{}", uuid::Uuid::new_v4()),
            retry: RetryPolicy::default(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            dead_letter: false,
        }
    }

    /// Replace the generated `mailbag-<uuid>` consumer tag.
    pub fn with_consumer_tag(mut self, consumer_tag: impl Into<String>) -> Self {
        self.consumer_tag = consumer_tag.into();
        self
    }

    /// Retry ceiling and backoff for failed deliveries.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// How long in-flight deliveries may run after cancellation.
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Whether rejected deliveries of this queue reach a dead-letter
    /// exchange. Only affects reporting: without one a rejection is a loss.
    pub fn with_dead_letter(mut self, dead_letter: bool) -> Self {
        self.dead_letter = dead_letter;
        self
    }

    /// Queue consumed by this consumer.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Maximum number of unresolved deliveries.
    pub fn prefetch(&self) -> u16 {
        self.prefetch
    }

    /// Tag the subscription is registered under.
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Policy applied to failed deliveries.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Grace period for in-flight deliveries on shutdown.
    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    fn validate(&self) -> Result<(), ConsumerRunError> {
        if self.prefetch == 0 {
            return Err(ConsumerRunError::invalid("prefetch must be at least 1"));
        }
        if self.queue.is_empty() {
            return Err(ConsumerRunError::invalid("queue name is empty"));
        }
        Ok(())
    }
}

/// Queue consumer.
///
/// Generic parameters:
/// - `B`: Broker handle providing subscriptions
/// - `P`: Processing logic
/// - `HK`: Hook implementation for lifecycle events
pub struct Consumer<B, P, HK = DefaultConsumerHook> {
    broker: B,
    options: ConsumerOptions,
    processor: Arc<P>,
    hook: Arc<HK>,
    stats: Arc<ConsumerStats>,
    state: Arc<watch::Sender<ConsumerState>>,
}

impl<B, P> Consumer<B, P, DefaultConsumerHook>
where
    P: Process,
{
    /// Create a consumer with the default hook implementation.
    pub fn new(broker: B, options: ConsumerOptions, processor: P) -> Self {
        Self::from_parts(
            broker,
            options,
            Arc::new(processor),
            Arc::new(DefaultConsumerHook),
            ConsumerStats::new(),
            Arc::new(watch::Sender::new(ConsumerState::Idle)),
        )
    }
}

impl<B, P, HK> Consumer<B, P, HK> {
    pub(crate) fn from_parts(
        broker: B,
        options: ConsumerOptions,
        processor: Arc<P>,
        hook: Arc<HK>,
        stats: Arc<ConsumerStats>,
        state: Arc<watch::Sender<ConsumerState>>,
    ) -> Self {
        Self {
            broker,
            options,
            processor,
            hook,
            stats,
            state,
        }
    }

    /// Replace the consumer hook while keeping all other generics unchanged.
    pub fn with_hook<HK2: ConsumerHook>(self, hook: HK2) -> Consumer<B, P, HK2> {
        Consumer {
            broker: self.broker,
            options: self.options,
            processor: self.processor,
            hook: Arc::new(hook),
            stats: self.stats,
            state: self.state,
        }
    }

    /// Record into an existing set of counters.
    /// Share counters with another consumer or a supervisor.
    pub fn with_stats(mut self, stats: Arc<ConsumerStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Live counters, readable while the loop runs.
    pub fn stats(&self) -> Arc<ConsumerStats> {
        Arc::clone(&self.stats)
    }

    /// Watch the lifecycle state.
    pub fn state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Run the consumer loop.
    ///
    /// Returns `Ok(())` after a cancellation-triggered shutdown, and a
    /// [`ConsumerRunErrorKind::Connection`] error when the subscription is
    /// lost. Either way the subscription is closed and every delivery that
    /// was not resolved goes back to the broker.
    #[tracing::instrument(skip_all, fields(queue = %self.options.queue, consumer_tag = %self.options.consumer_tag))]
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ConsumerRunError>
    where
        B: Subscribe + Send + Sync,
        P: Process + 'static,
        HK: ConsumerHook + 'static,
    {
        self.options.validate()?;
        self.hook.on_startup(&self.options.queue);

        let mut subscription = match self
            .broker
            .subscribe(
                &self.options.queue,
                self.options.prefetch,
                &self.options.consumer_tag,
            )
            .await
        {
            Ok(subscription) => subscription,
            Err(err) => {
                self.state.send_replace(ConsumerState::Stopped);
                return Err(ConsumerRunError::subscribe(err));
            }
        };

        self.state.send_replace(ConsumerState::Listening);
        self.hook.on_listening(&self.options.queue);

        let worker = Worker {
            processor: Arc::clone(&self.processor),
            hook: Arc::clone(&self.hook),
            stats: Arc::clone(&self.stats),
            retry: self.options.retry,
            dead_letter: self.options.dead_letter,
        };
        let limit = usize::from(self.options.prefetch);
        let mut in_flight = JoinSet::new();

        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(err) = joined {
                        tracing::error!(error = %err, "Delivery task failed");
                    }
                }
                next = subscription.next(), if in_flight.len() < limit => match next {
                    Some(Ok(delivery)) => {
                        in_flight.spawn(worker.clone().handle(delivery, cancel.clone()));
                    }
                    Some(Err(err)) => {
                        self.hook.on_subscription_lost(&err);
                        break Err(ConsumerRunError::connection(err));
                    }
                    None => {
                        let err = BrokerError::connection("subscription ended by the broker");
                        self.hook.on_subscription_lost(&err);
                        break Err(ConsumerRunError::connection(err));
                    }
                },
            }
        };

        self.state.send_replace(ConsumerState::ShuttingDown);

        let drain = async {
            while let Some(joined) = in_flight.join_next().await {
                if let Err(err) = joined {
                    tracing::error!(error = %err, "Delivery task failed");
                }
            }
        };
        if tokio::time::timeout(self.options.drain_timeout, drain)
            .await
            .is_err()
        {
            self.hook.on_drain_timeout(in_flight.len());
            in_flight.shutdown().await;
        }

        if let Err(err) = subscription.close().await {
            tracing::warn!(error = %err, "Failed to close subscription");
        }

        self.state.send_replace(ConsumerState::Stopped);
        self.hook.on_shutdown(&self.options.queue);

        outcome
    }
}

/// Per-delivery half of the loop, cloned into every task.
struct Worker<P, HK> {
    processor: Arc<P>,
    hook: Arc<HK>,
    stats: Arc<ConsumerStats>,
    retry: RetryPolicy,
    dead_letter: bool,
}

impl<P, HK> Clone for Worker<P, HK> {
    fn clone(&self) -> Self {
        Self {
            processor: Arc::clone(&self.processor),
            hook: Arc::clone(&self.hook),
            stats: Arc::clone(&self.stats),
            retry: self.retry,
            dead_letter: self.dead_letter,
        }
    }
}

impl<P, HK> Worker<P, HK>
where
    P: Process,
    HK: ConsumerHook,
{
    async fn handle(self, delivery: Delivery, cancel: CancellationToken) {
        let _in_flight = self.stats.begin();
        let info = DeliveryInfo::of(&delivery);

        self.stats.record_received(info.redelivered);
        self.hook.on_delivery(&info);

        let envelope = match Envelope::decode(
            delivery.body(),
            delivery.properties().content_type.as_deref(),
        ) {
            Ok(envelope) => envelope,
            Err(err) => {
                self.hook.on_poison(&info, &err);
                let result = delivery.reject().await;
                self.finish(&info, Resolution::NackedDropped(DropReason::Poison), result);
                return;
            }
        };

        let outcome = AssertUnwindSafe(self.processor.process(envelope))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(ProcessingError::transient(panic_message(&*panic))));
        let err = match outcome {
            Ok(()) => {
                let result = delivery.ack().await;
                self.finish(&info, Resolution::Acked, result);
                return;
            }
            Err(err) => err,
        };

        let decision = if err.is_permanent() {
            RetryDecision::DeadLetter
        } else {
            self.retry.decide(info.retry_count)
        };

        match decision {
            RetryDecision::Requeue { retry_count } => {
                let delay = self.retry.delay_for(decision);
                self.hook.on_requeue(&info, &err, retry_count, delay);
                if !delay.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {}
                    }
                }
                let result = delivery.requeue(retry_count).await;
                self.finish(&info, Resolution::NackedRequeue, result);
            }
            RetryDecision::DeadLetter => {
                self.hook.on_dead_letter(&info, &err, self.dead_letter);
                let result = delivery.reject().await;
                self.finish(
                    &info,
                    Resolution::NackedDropped(DropReason::DeadLetter),
                    result,
                );
            }
        }
    }

    fn finish(&self, info: &DeliveryInfo, resolution: Resolution, result: Result<(), BrokerError>) {
        match result {
            Ok(()) => {
                self.stats.record_resolution(resolution);
                self.hook.on_resolved(info, resolution);
            }
            Err(err) => {
                self.stats.record_resolve_error();
                self.hook.on_resolve_error(info, resolution, &err);
            }
        }
    }
}

/// A panicking processor counts as a transient failure.
fn panic_message(panic: &(dyn Any + Send)) -> String {
    let message = panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic payload");
    format!("processor panicked: {message}")
}

/// Error returned when the consumer loop fails.
#[derive(Debug)]
pub struct ConsumerRunError {
    context: SpanTrace,
    kind: ConsumerRunErrorKind,
}

/// Classification of consumer runtime errors.
#[derive(Debug)]
pub enum ConsumerRunErrorKind {
    /// Options rejected before subscribing.
    InvalidOptions(String),
    /// The broker refused the subscription.
    Subscribe(BrokerError),
    /// The broker connection or the subscription was lost.
    Connection(BrokerError),
}

impl ConsumerRunError {
    fn invalid(reason: impl Into<String>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ConsumerRunErrorKind::InvalidOptions(reason.into()),
        }
    }

    fn subscribe(err: BrokerError) -> Self {
        if err.is_connection() {
            return Self::connection(err);
        }
        Self {
            context: SpanTrace::capture(),
            kind: ConsumerRunErrorKind::Subscribe(err),
        }
    }

    fn connection(err: BrokerError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ConsumerRunErrorKind::Connection(err),
        }
    }

    /// Returns the kind of the error.
    pub fn kind(&self) -> &ConsumerRunErrorKind {
        &self.kind
    }

    /// Whether reconnecting could help.
    pub fn is_connection(&self) -> bool {
        matches!(self.kind, ConsumerRunErrorKind::Connection(_))
    }
}

impl std::fmt::Display for ConsumerRunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ConsumerRunErrorKind::InvalidOptions(reason) => {
                writeln!(f, "Invalid consumer options: {reason}")
            }
            ConsumerRunErrorKind::Subscribe(err) => writeln!(f, "Subscribe error: {err}"),
            ConsumerRunErrorKind::Connection(err) => writeln!(f, "Connection lost: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ConsumerRunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ConsumerRunErrorKind::InvalidOptions(_) => None,
            ConsumerRunErrorKind::Subscribe(err) | ConsumerRunErrorKind::Connection(err) => {
                Some(err)
            }
        }
    }
}

/// Hook trait for observing consumer lifecycle events.
///
/// Hooks are invoked synchronously from the loop and from delivery tasks and
/// should avoid heavy or blocking work.
pub trait ConsumerHook: Send + Sync {
    fn on_startup(&self, queue: &str);
    fn on_listening(&self, queue: &str);
    fn on_delivery(&self, info: &DeliveryInfo);
    fn on_poison(&self, info: &DeliveryInfo, error: &DecodeError);
    fn on_requeue(
        &self,
        info: &DeliveryInfo,
        error: &ProcessingError,
        retry_count: u32,
        delay: Duration,
    );
    /// `dead_letter` is false when the queue has no dead-letter exchange and
    /// the broker will discard the message.
    fn on_dead_letter(&self, info: &DeliveryInfo, error: &ProcessingError, dead_letter: bool);
    fn on_resolved(&self, info: &DeliveryInfo, resolution: Resolution);
    fn on_resolve_error(&self, info: &DeliveryInfo, resolution: Resolution, error: &BrokerError);
    fn on_subscription_lost(&self, error: &BrokerError);
    fn on_drain_timeout(&self, abandoned: usize);
    fn on_shutdown(&self, queue: &str);
}

/// Default consumer hook implementation.
///
/// Logs lifecycle events using `tracing`.
pub struct DefaultConsumerHook;

impl ConsumerHook for DefaultConsumerHook {
    fn on_startup(&self, queue: &str) {
        tracing::info!(queue, "Consumer is starting up");
    }

    fn on_listening(&self, queue: &str) {
        tracing::info!(queue, "Consumer is listening");
    }

    fn on_delivery(&self, info: &DeliveryInfo) {
        tracing::debug!(
            tag = %info.tag,
            redelivered = info.redelivered,
            retry_count = info.retry_count,
            message_id = info.message_id.as_deref(),
            "Delivery received"
        );
    }

    fn on_poison(&self, info: &DeliveryInfo, error: &DecodeError) {
        tracing::warn!(tag = %info.tag, %error, "Rejecting undecodable delivery");
    }

    fn on_requeue(
        &self,
        info: &DeliveryInfo,
        error: &ProcessingError,
        retry_count: u32,
        delay: Duration,
    ) {
        tracing::warn!(
            tag = %info.tag,
            message_id = info.message_id.as_deref(),
            retry_count,
            ?delay,
            %error,
            "Processing failed, requeueing"
        );
    }

    fn on_dead_letter(&self, info: &DeliveryInfo, error: &ProcessingError, dead_letter: bool) {
        if dead_letter {
            tracing::warn!(
                tag = %info.tag,
                message_id = info.message_id.as_deref(),
                retry_count = info.retry_count,
                %error,
                "Processing failed, dead-lettering"
            );
        } else {
            tracing::warn!(
                tag = %info.tag,
                message_id = info.message_id.as_deref(),
                retry_count = info.retry_count,
                %error,
                "Processing failed and no dead-letter exchange is configured, message is lost"
            );
        }
    }

    fn on_resolved(&self, info: &DeliveryInfo, resolution: Resolution) {
        tracing::debug!(tag = %info.tag, ?resolution, "Delivery resolved");
    }

    fn on_resolve_error(&self, info: &DeliveryInfo, resolution: Resolution, error: &BrokerError) {
        tracing::error!(tag = %info.tag, ?resolution, %error, "Failed to resolve delivery");
    }

    fn on_subscription_lost(&self, error: &BrokerError) {
        tracing::error!(%error, "Subscription lost");
    }

    fn on_drain_timeout(&self, abandoned: usize) {
        tracing::warn!(abandoned, "Drain timeout reached, abandoning in-flight deliveries");
    }

    fn on_shutdown(&self, queue: &str) {
        tracing::info!(queue, "Consumer stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::{
        Publisher,
        retry::Backoff,
        topology::{DeadLetter, Topology, ensure_topology},
        transport::{InMemoryBroker, Inspect, MessageProperties, Outgoing, Sender},
    };

    fn topology() -> Topology {
        Topology::new("notifications", ["sms_queue", "email_queue"], ["sms", "email"]).unwrap()
    }

    async fn broker(topology: &Topology) -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        ensure_topology(&broker, topology).await.unwrap();
        broker
    }

    async fn publish_sms(broker: &InMemoryBroker, count: usize) {
        let publisher = Publisher::new(broker.clone());
        for i in 0..count {
            publisher
                .publish("notifications", "sms", &Envelope::sms("+1", format!("m{i}")))
                .await
                .unwrap();
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn depth(broker: &InMemoryBroker, queue: &str) -> u64 {
        broker.inspect_queue(queue).await.unwrap().depth
    }

    #[tokio::test]
    async fn successful_processing_acks_once() {
        let broker = broker(&topology()).await;
        publish_sms(&broker, 1).await;

        let before = broker.inspect_queue("sms_queue").await.unwrap();
        assert_eq!((before.depth, before.consumer_count), (1, 0));

        let consumer = Consumer::new(
            broker.clone(),
            ConsumerOptions::new("sms_queue", 1),
            |_envelope: Envelope| async { Ok(()) },
        );
        let stats = consumer.stats();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(consumer.run(cancel.clone()));

        wait_until(|| stats.snapshot().acked == 1).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(depth(&broker, "sms_queue").await, 0);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.received, 1);
        assert_eq!(snapshot.nacked_requeue() + snapshot.nacked_dropped(), 0);
        assert_eq!(snapshot.in_flight, 0);
    }

    #[tokio::test]
    async fn panicking_processor_does_not_stall_the_queue() {
        let broker = broker(&topology()).await;
        let publisher = Publisher::new(broker.clone());
        for text in ["boom", "hello"] {
            publisher
                .publish("notifications", "sms", &Envelope::sms("+1", text))
                .await
                .unwrap();
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let consumer = Consumer::new(
            broker.clone(),
            ConsumerOptions::new("sms_queue", 1).with_retry_policy(RetryPolicy::new(1)),
            move |envelope: Envelope| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if let crate::envelope::Notification::Sms(sms) = envelope.notification() {
                        if sms.text == "boom" {
                            panic!("gateway client bug");
                        }
                    }
                    Ok(())
                }
            },
        );
        let stats = consumer.stats();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(consumer.run(cancel.clone()));

        wait_until(|| {
            let snapshot = stats.snapshot();
            snapshot.acked == 1 && snapshot.nacked_dropped() == 1
        })
        .await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        let snapshot = stats.snapshot();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(snapshot.requeued, 1);
        assert_eq!(snapshot.dead_lettered, 1);
        assert_eq!(snapshot.in_flight, 0);
        assert_eq!(depth(&broker, "sms_queue").await, 0);
    }

    #[tokio::test]
    async fn always_failing_processor_hits_the_retry_ceiling() {
        let broker = broker(&topology()).await;
        publish_sms(&broker, 1).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let consumer = Consumer::new(
            broker.clone(),
            ConsumerOptions::new("sms_queue", 1).with_retry_policy(RetryPolicy::new(3)),
            move |_envelope: Envelope| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(ProcessingError::transient("smtp down")) }
            },
        );
        let stats = consumer.stats();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(consumer.run(cancel.clone()));

        wait_until(|| stats.snapshot().dead_lettered == 1).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        let snapshot = stats.snapshot();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(snapshot.received, 4);
        assert_eq!(snapshot.redelivered, 3);
        assert_eq!(snapshot.nacked_requeue(), 3);
        assert_eq!(snapshot.nacked_dropped(), 1);
        assert_eq!(depth(&broker, "sms_queue").await, 0);
    }

    #[tokio::test]
    async fn permanent_failure_skips_retries() {
        let broker = broker(&topology()).await;
        publish_sms(&broker, 1).await;

        let consumer = Consumer::new(
            broker.clone(),
            ConsumerOptions::new("sms_queue", 1),
            |_envelope: Envelope| async { Err(ProcessingError::permanent("invalid phone")) },
        );
        let stats = consumer.stats();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(consumer.run(cancel.clone()));

        wait_until(|| stats.snapshot().dead_lettered == 1).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(stats.snapshot().requeued, 0);
        assert_eq!(stats.snapshot().received, 1);
    }

    #[tokio::test]
    async fn poison_messages_are_rejected_without_processing() {
        let topology = topology()
            .with_dead_letter(DeadLetter::new("notifications.dlx", "dead_letters", "dead"))
            .unwrap();
        let mut raw = broker(&topology).await;
        raw.send(Outgoing {
            exchange: "notifications".into(),
            routing_key: "sms".into(),
            mandatory: false,
            properties: MessageProperties {
                content_type: Some("application/json".into()),
                persistent: true,
                ..Default::default()
            },
            body: b"{not json".to_vec(),
        })
        .await
        .unwrap();
        publish_sms(&raw, 1).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let consumer = Consumer::new(
            raw.clone(),
            ConsumerOptions::new("sms_queue", 2).with_dead_letter(true),
            move |_envelope: Envelope| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
        );
        let stats = consumer.stats();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(consumer.run(cancel.clone()));

        wait_until(|| {
            let s = stats.snapshot();
            s.poisoned == 1 && s.acked == 1
        })
        .await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(stats.snapshot().requeued, 0);
        assert_eq!(depth(&raw, "dead_letters").await, 1);
        assert_eq!(raw.peek("dead_letters")[0].1, b"{not json".to_vec());
    }

    #[tokio::test]
    async fn exhausted_messages_land_in_the_dead_letter_queue() {
        let topology = topology()
            .with_dead_letter(DeadLetter::new("notifications.dlx", "dead_letters", "dead"))
            .unwrap();
        let broker = broker(&topology).await;
        publish_sms(&broker, 2).await;

        let consumer = Consumer::new(
            broker.clone(),
            ConsumerOptions::new("sms_queue", 1)
                .with_retry_policy(RetryPolicy::new(1))
                .with_dead_letter(true),
            |_envelope: Envelope| async { Err(ProcessingError::transient("gateway timeout")) },
        );
        let stats = consumer.stats();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(consumer.run(cancel.clone()));

        wait_until(|| stats.snapshot().dead_lettered == 2).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(depth(&broker, "sms_queue").await, 0);
        let dead = broker.peek("dead_letters");
        assert_eq!(dead.len(), 2);
        for (properties, body) in dead {
            assert_eq!(properties.retry_count, Some(1));
            Envelope::decode(&body, properties.content_type.as_deref()).unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn prefetch_bounds_every_competing_consumer() {
        let broker = broker(&topology()).await;
        publish_sms(&broker, 40).await;

        let prefetch = 3;
        let cancel = CancellationToken::new();
        let mut workers = Vec::new();
        for i in 0..4 {
            let tag = format!("worker-{i}");
            let consumer = Consumer::new(
                broker.clone(),
                ConsumerOptions::new("sms_queue", prefetch).with_consumer_tag(&tag),
                |_envelope: Envelope| async {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok(())
                },
            );
            let stats = consumer.stats();
            workers.push((tag, stats, tokio::spawn(consumer.run(cancel.clone()))));
        }

        wait_until(|| workers.iter().map(|(_, s, _)| s.snapshot().acked).sum::<u64>() == 40)
            .await;
        for (tag, _, _) in &workers {
            let peak = broker.peak_unacked(tag).unwrap();
            assert!(peak <= usize::from(prefetch), "{tag} held {peak} deliveries");
        }
        cancel.cancel();

        for (tag, stats, handle) in workers {
            handle.await.unwrap().unwrap();
            assert_eq!(broker.peak_unacked(&tag), None);
            assert!(stats.snapshot().max_in_flight <= u64::from(prefetch));
        }
        assert_eq!(depth(&broker, "sms_queue").await, 0);
    }

    #[tokio::test]
    async fn cancelled_consumer_leaves_unacked_work_for_the_next_one() {
        let broker = broker(&topology()).await;
        publish_sms(&broker, 1).await;

        let started = Arc::new(tokio::sync::Notify::new());
        let notify = Arc::clone(&started);
        let first = Consumer::new(
            broker.clone(),
            ConsumerOptions::new("sms_queue", 1).with_drain_timeout(Duration::ZERO),
            move |_envelope: Envelope| {
                notify.notify_one();
                async {
                    std::future::pending::<()>().await;
                    Ok(())
                }
            },
        );
        let first_stats = first.stats();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(first.run(cancel.clone()));

        started.notified().await;
        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(first_stats.snapshot().acked, 0);
        assert_eq!(first_stats.snapshot().in_flight, 0);
        assert_eq!(depth(&broker, "sms_queue").await, 1);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        let second = Consumer::new(
            broker.clone(),
            ConsumerOptions::new("sms_queue", 1),
            move |envelope: Envelope| {
                record.lock().unwrap().push(envelope.id().to_owned());
                async { Ok(()) }
            },
        );
        let second_stats = second.stats();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(second.run(cancel.clone()));

        wait_until(|| second_stats.snapshot().acked == 1).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(second_stats.snapshot().redelivered, 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(depth(&broker, "sms_queue").await, 0);
    }

    #[tokio::test]
    async fn dropped_consumer_is_redelivered() {
        let broker = broker(&topology()).await;
        publish_sms(&broker, 1).await;

        let started = Arc::new(tokio::sync::Notify::new());
        let notify = Arc::clone(&started);
        let consumer = Consumer::new(
            broker.clone(),
            ConsumerOptions::new("sms_queue", 1),
            move |_envelope: Envelope| {
                notify.notify_one();
                async {
                    std::future::pending::<()>().await;
                    Ok(())
                }
            },
        );
        let handle = tokio::spawn(consumer.run(CancellationToken::new()));

        started.notified().await;
        handle.abort();
        let _ = handle.await;

        wait_until(|| broker.peek("sms_queue").len() == 1).await;
        let (properties, _) = &broker.peek("sms_queue")[0];
        assert_eq!(properties.retry_count, None);
    }

    #[tokio::test]
    async fn backoff_is_cut_short_by_cancellation() {
        let broker = broker(&topology()).await;
        publish_sms(&broker, 1).await;

        let consumer = Consumer::new(
            broker.clone(),
            ConsumerOptions::new("sms_queue", 1).with_retry_policy(
                RetryPolicy::new(3).with_backoff(Backoff::Fixed {
                    delay: Duration::from_secs(3600),
                }),
            ),
            |_envelope: Envelope| async { Err(ProcessingError::transient("busy")) },
        );
        let stats = consumer.stats();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(consumer.run(cancel.clone()));

        wait_until(|| stats.snapshot().received == 1).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(stats.snapshot().requeued, 1);
        let ready = broker.peek("sms_queue");
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].0.retry_count, Some(1));
    }

    #[tokio::test]
    async fn state_follows_the_lifecycle() {
        let broker = broker(&topology()).await;
        let consumer = Consumer::new(
            broker.clone(),
            ConsumerOptions::new("email_queue", 1),
            |_envelope: Envelope| async { Ok(()) },
        );
        let mut state = consumer.state();
        assert_eq!(*state.borrow(), ConsumerState::Idle);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(consumer.run(cancel.clone()));

        state
            .wait_for(|s| *s == ConsumerState::Listening)
            .await
            .unwrap();
        assert_eq!(broker.inspect_queue("email_queue").await.unwrap().consumer_count, 1);

        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(*state.borrow(), ConsumerState::Stopped);
        assert_eq!(broker.inspect_queue("email_queue").await.unwrap().consumer_count, 0);
    }

    #[tokio::test]
    async fn zero_prefetch_is_rejected() {
        let broker = broker(&topology()).await;
        let consumer = Consumer::new(
            broker,
            ConsumerOptions::new("sms_queue", 0),
            |_envelope: Envelope| async { Ok(()) },
        );

        let err = consumer.run(CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err.kind(), ConsumerRunErrorKind::InvalidOptions(_)));
    }

    #[tokio::test]
    async fn lost_subscription_is_a_connection_error() {
        let broker = broker(&topology()).await;
        let consumer = Consumer::new(
            broker.clone(),
            ConsumerOptions::new("sms_queue", 1),
            |_envelope: Envelope| async { Ok(()) },
        );
        let mut state = consumer.state();
        let handle = tokio::spawn(consumer.run(CancellationToken::new()));

        state
            .wait_for(|s| *s == ConsumerState::Listening)
            .await
            .unwrap();
        broker.disconnect();

        let err = handle.await.unwrap().unwrap_err();
        assert!(err.is_connection());
        assert_eq!(*state.borrow(), ConsumerState::Stopped);
    }

    #[tokio::test]
    async fn unknown_queue_fails_to_subscribe() {
        let broker = broker(&topology()).await;
        let consumer = Consumer::new(
            broker,
            ConsumerOptions::new("fax_queue", 1),
            |_envelope: Envelope| async { Ok(()) },
        );

        let err = consumer.run(CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err.kind(), ConsumerRunErrorKind::Subscribe(_)));
    }
}
