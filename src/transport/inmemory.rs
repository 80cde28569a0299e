use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll},
};

use async_trait::async_trait;
use futures_core::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    stats::QueueStats,
    transport::{
        Acknowledge, BindingSpec, BrokerError, BrokerErrorKind, CloseSubscription, Connect,
        Declare, Delivery, DeliveryTag, Entity, ExchangeSpec, Inspect, MessageProperties,
        Outgoing, QueueSpec, Sender, SettleRequest, Settlement, Subscribe, Subscription,
    },
};

/// In-process broker for tests and local pipelines.
///
/// `InMemoryBroker` follows the AMQP 0-9-1 semantics the delivery engine
/// relies on:
///
/// - direct exchanges route by exact routing-key match; the default exchange
///   (`""`) routes to the queue named by the routing key
/// - declarations are idempotent and fail on incompatible redeclaration
/// - subscriptions never hold more than `prefetch` unresolved deliveries and
///   competing subscriptions are served round-robin
/// - requeued and rejected deliveries follow the queue's dead-letter
///   configuration
/// - closing or dropping a subscription returns its unresolved deliveries to
///   the head of the queue, marked as redelivered
///
/// The broker can also simulate outages ([`disconnect`](Self::disconnect))
/// and restarts ([`restart`](Self::restart)), after which only durable
/// entities and persistent messages survive.
///
/// Handles are cheap to clone and share the same broker state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    offline: bool,
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueState>,
    bindings: BTreeSet<BindingSpec>,
    subscribers: HashMap<u64, Subscriber>,
    next_subscriber: u64,
    discarded: u64,
}

struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<Stored>,
    subscribers: Vec<u64>,
    cursor: usize,
}

#[derive(Clone)]
struct Stored {
    properties: MessageProperties,
    body: Vec<u8>,
    redelivered: bool,
}

struct Subscriber {
    queue: String,
    consumer_tag: String,
    prefetch: usize,
    next_tag: u64,
    unacked: BTreeMap<u64, Stored>,
    peak_unacked: usize,
    sender: mpsc::UnboundedSender<Result<Delivery, BrokerError>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Simulate a lost connection.
    ///
    /// Every open subscription receives a connection error and is released;
    /// all operations fail with [`BrokerErrorKind::Connection`] until
    /// [`reconnect`](Self::reconnect).
    pub fn disconnect(&self) {
        let mut state = self.state();
        state.offline = true;
        state.drop_all_subscribers();
        tracing::info!("In-memory broker went offline");
    }

    /// End a simulated outage.
    pub fn reconnect(&self) {
        self.state().offline = false;
        tracing::info!("In-memory broker is back online");
    }

    /// Simulate a broker restart.
    ///
    /// Open subscriptions are dropped, non-durable exchanges and queues are
    /// forgotten, and non-persistent messages are lost.
    pub fn restart(&self) {
        let mut state = self.state();
        state.drop_all_subscribers();

        state.exchanges.retain(|_, exchange| exchange.durable);
        state.queues.retain(|_, queue| queue.spec.durable);
        for queue in state.queues.values_mut() {
            queue.ready.retain(|message| message.properties.persistent);
        }

        let State {
            exchanges,
            queues,
            bindings,
            ..
        } = &mut *state;
        bindings.retain(|b| exchanges.contains_key(&b.exchange) && queues.contains_key(&b.queue));
        tracing::info!("In-memory broker restarted");
    }

    /// Every binding currently declared.
    pub fn bindings(&self) -> Vec<BindingSpec> {
        self.state().bindings.iter().cloned().collect()
    }

    /// Ready messages of a queue, oldest first, without consuming them.
    pub fn peek(&self, queue: &str) -> Vec<(MessageProperties, Vec<u8>)> {
        self.state()
            .queues
            .get(queue)
            .map(|q| {
                q.ready
                    .iter()
                    .map(|m| (m.properties.clone(), m.body.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Highest number of unresolved deliveries held by the live
    /// subscription registered as `consumer_tag`.
    pub fn peak_unacked(&self, consumer_tag: &str) -> Option<usize> {
        self.state()
            .subscribers
            .values()
            .find(|sub| sub.consumer_tag == consumer_tag)
            .map(|sub| sub.peak_unacked)
    }

    /// Messages the broker dropped: unroutable publishes and rejections on
    /// queues without a dead-letter exchange.
    pub fn discarded(&self) -> u64 {
        self.state().discarded
    }

    fn release(&self, subscriber: u64) {
        self.state().release(subscriber);
    }

    fn settle_request(&self, subscriber: u64, request: SettleRequest) -> Result<(), BrokerError> {
        let mut state = self.state();
        state.online()?;

        let sub = state
            .subscribers
            .get_mut(&subscriber)
            .ok_or_else(|| BrokerError::new(BrokerErrorKind::UnknownDeliveryTag(request.tag)))?;
        let mut message = sub
            .unacked
            .remove(&request.tag.0)
            .ok_or_else(|| BrokerError::new(BrokerErrorKind::UnknownDeliveryTag(request.tag)))?;
        let queue_name = sub.queue.clone();

        match request.settlement {
            Settlement::Ack => {}
            Settlement::Requeue { retry_count } => {
                message.properties.retry_count = Some(retry_count);
                message.redelivered = true;
                if let Some(queue) = state.queues.get_mut(&queue_name) {
                    queue.ready.push_front(message);
                }
            }
            Settlement::Reject => {
                for target in state.dead_letter(&queue_name, message) {
                    state.dispatch(self, &target);
                }
            }
        }

        state.dispatch(self, &queue_name);
        Ok(())
    }
}

impl State {
    fn online(&self) -> Result<(), BrokerError> {
        if self.offline {
            Err(BrokerError::connection("in-memory broker is offline"))
        } else {
            Ok(())
        }
    }

    /// Route a message to every queue bound under `routing_key`.
    ///
    /// Returns the touched queues.
    fn route(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: Stored,
    ) -> Result<Vec<String>, BrokerError> {
        let targets: Vec<String> = if exchange.is_empty() {
            self.queues
                .contains_key(routing_key)
                .then(|| routing_key.to_owned())
                .into_iter()
                .collect()
        } else {
            if !self.exchanges.contains_key(exchange) {
                return Err(BrokerError::not_found(Entity::Exchange, exchange));
            }
            self.bindings
                .iter()
                .filter(|b| b.exchange == exchange && b.routing_key == routing_key)
                .map(|b| b.queue.clone())
                .collect()
        };

        for target in &targets {
            if let Some(queue) = self.queues.get_mut(target) {
                queue.ready.push_back(message.clone());
            }
        }
        Ok(targets)
    }

    /// Returns the dead-letter queues that received the message.
    fn dead_letter(&mut self, queue_name: &str, mut message: Stored) -> Vec<String> {
        let target = self
            .queues
            .get(queue_name)
            .and_then(|q| q.spec.dead_letter.clone());

        let Some(target) = target else {
            self.discarded += 1;
            tracing::debug!(queue = queue_name, "Rejected message discarded");
            return Vec::new();
        };

        message.redelivered = false;
        match self.route(&target.exchange, &target.routing_key, message) {
            Ok(queues) if !queues.is_empty() => {
                tracing::debug!(queue = queue_name, ?queues, "Message dead-lettered");
                queues
            }
            _ => {
                self.discarded += 1;
                tracing::debug!(queue = queue_name, "Dead-letter target unroutable");
                Vec::new()
            }
        }
    }

    /// Push ready messages to subscribers with spare prefetch capacity.
    fn dispatch(&mut self, broker: &InMemoryBroker, queue_name: &str) {
        loop {
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            if queue.ready.is_empty() || queue.subscribers.is_empty() {
                return;
            }

            let count = queue.subscribers.len();
            let chosen = (0..count)
                .map(|offset| (queue.cursor + offset) % count)
                .find(|idx| {
                    self.subscribers
                        .get(&queue.subscribers[*idx])
                        .is_some_and(|s| s.unacked.len() < s.prefetch)
                });
            let Some(idx) = chosen else {
                return;
            };
            queue.cursor = (idx + 1) % count;
            let subscriber_id = queue.subscribers[idx];

            let Some(message) = queue.ready.pop_front() else {
                return;
            };
            let Some(sub) = self.subscribers.get_mut(&subscriber_id) else {
                return;
            };

            sub.next_tag += 1;
            let tag = sub.next_tag;
            sub.unacked.insert(tag, message.clone());

            sub.peak_unacked = sub.peak_unacked.max(sub.unacked.len());

            let delivery = Delivery::new(
                DeliveryTag(tag),
                message.redelivered,
                message.properties,
                message.body,
                InMemoryAcker {
                    broker: broker.clone(),
                    subscriber: subscriber_id,
                },
            );

            if sub.sender.send(Ok(delivery)).is_err() {
                tracing::debug!(subscriber_id, "Subscriber gone, releasing it");
                self.release(subscriber_id);
            }
        }
    }

    /// Remove a subscriber and requeue its unresolved deliveries in order.
    fn release(&mut self, subscriber: u64) {
        let Some(sub) = self.subscribers.remove(&subscriber) else {
            return;
        };

        if let Some(queue) = self.queues.get_mut(&sub.queue) {
            queue.subscribers.retain(|id| *id != subscriber);
            queue.cursor = 0;
            for (_, mut message) in sub.unacked.into_iter().rev() {
                message.redelivered = true;
                queue.ready.push_front(message);
            }
        }
    }

    fn drop_all_subscribers(&mut self) {
        let ids: Vec<u64> = self.subscribers.keys().copied().collect();
        for id in ids {
            if let Some(sub) = self.subscribers.get(&id) {
                let _ = sub
                    .sender
                    .send(Err(BrokerError::connection("in-memory broker connection lost")));
            }
            self.release(id);
        }
    }
}

#[async_trait]
impl Declare for InMemoryBroker {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), BrokerError> {
        let mut state = self.state();
        state.online()?;

        match state.exchanges.get(&exchange.name) {
            Some(existing) if existing != exchange => Err(BrokerError::conflict(
                Entity::Exchange,
                &exchange.name,
                format!(
                    "declared durable={}, exists durable={}",
                    exchange.durable, existing.durable
                ),
            )),
            Some(_) => Ok(()),
            None => {
                state
                    .exchanges
                    .insert(exchange.name.clone(), exchange.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), BrokerError> {
        let mut state = self.state();
        state.online()?;

        match state.queues.get(&queue.name) {
            Some(existing) if existing.spec != *queue => Err(BrokerError::conflict(
                Entity::Queue,
                &queue.name,
                format!("declared {queue:?}, exists {:?}", existing.spec),
            )),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    queue.name.clone(),
                    QueueState {
                        spec: queue.clone(),
                        ready: VecDeque::new(),
                        subscribers: Vec::new(),
                        cursor: 0,
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &BindingSpec) -> Result<(), BrokerError> {
        let mut state = self.state();
        state.online()?;

        if !state.exchanges.contains_key(&binding.exchange) {
            return Err(BrokerError::not_found(Entity::Exchange, &binding.exchange));
        }
        if !state.queues.contains_key(&binding.queue) {
            return Err(BrokerError::not_found(Entity::Queue, &binding.queue));
        }
        state.bindings.insert(binding.clone());
        Ok(())
    }
}

#[async_trait]
impl Sender for InMemoryBroker {
    type Error = BrokerError;

    #[tracing::instrument(skip_all, fields(exchange = %message.exchange, routing_key = %message.routing_key))]
    async fn send(&mut self, message: Outgoing) -> Result<(), Self::Error> {
        let mut state = self.state();
        state.online()?;

        let Outgoing {
            exchange,
            routing_key,
            mandatory,
            properties,
            body,
        } = message;

        let stored = Stored {
            properties,
            body,
            redelivered: false,
        };
        let queues = state.route(&exchange, &routing_key, stored)?;

        if queues.is_empty() {
            if mandatory {
                return Err(BrokerError::new(BrokerErrorKind::Unroutable {
                    exchange,
                    routing_key,
                }));
            }
            state.discarded += 1;
            tracing::debug!("Message matched no binding and was dropped");
            return Ok(());
        }

        for queue in &queues {
            state.dispatch(self, queue);
        }
        Ok(())
    }
}

#[async_trait]
impl Subscribe for InMemoryBroker {
    async fn subscribe(
        &self,
        queue: &str,
        prefetch: u16,
        consumer_tag: &str,
    ) -> Result<Subscription, BrokerError> {
        let mut state = self.state();
        state.online()?;

        if !state.queues.contains_key(queue) {
            return Err(BrokerError::not_found(Entity::Queue, queue));
        }

        state.next_subscriber += 1;
        let id = state.next_subscriber;
        let (sender, receiver) = mpsc::unbounded_channel();

        state.subscribers.insert(
            id,
            Subscriber {
                queue: queue.to_owned(),
                consumer_tag: consumer_tag.to_owned(),
                prefetch: usize::from(prefetch.max(1)),
                next_tag: 0,
                unacked: BTreeMap::new(),
                peak_unacked: 0,
                sender,
            },
        );
        if let Some(q) = state.queues.get_mut(queue) {
            q.subscribers.push(id);
        }
        state.dispatch(self, queue);

        let deliveries = InMemoryDeliveries {
            receiver: UnboundedReceiverStream::new(receiver),
            _release: ReleaseOnDrop {
                broker: self.clone(),
                subscriber: id,
            },
        };

        Ok(Subscription::new(
            Box::pin(deliveries),
            InMemoryCloser {
                broker: self.clone(),
                subscriber: id,
            },
        ))
    }
}

#[async_trait]
impl Inspect for InMemoryBroker {
    async fn inspect_queue(&self, queue: &str) -> Result<QueueStats, BrokerError> {
        let state = self.state();
        state.online()?;

        let q = state
            .queues
            .get(queue)
            .ok_or_else(|| BrokerError::not_found(Entity::Queue, queue))?;

        Ok(QueueStats {
            queue: queue.to_owned(),
            depth: q.ready.len() as u64,
            consumer_count: q.subscribers.len() as u32,
        })
    }
}

#[async_trait]
impl Connect for InMemoryBroker {
    type Broker = InMemoryBroker;

    async fn connect(&self) -> Result<Self::Broker, BrokerError> {
        self.state().online()?;
        Ok(self.clone())
    }
}

struct InMemoryAcker {
    broker: InMemoryBroker,
    subscriber: u64,
}

#[async_trait]
impl Acknowledge for InMemoryAcker {
    async fn settle(self: Box<Self>, request: SettleRequest) -> Result<(), BrokerError> {
        self.broker.settle_request(self.subscriber, request)
    }
}

struct InMemoryCloser {
    broker: InMemoryBroker,
    subscriber: u64,
}

#[async_trait]
impl CloseSubscription for InMemoryCloser {
    async fn close(self: Box<Self>) -> Result<(), BrokerError> {
        self.broker.release(self.subscriber);
        Ok(())
    }
}

/// Releases the subscriber when the delivery stream goes away, so a consumer
/// that disappears without closing still gets its deliveries requeued.
struct ReleaseOnDrop {
    broker: InMemoryBroker,
    subscriber: u64,
}

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        self.broker.release(self.subscriber);
    }
}

struct InMemoryDeliveries {
    receiver: UnboundedReceiverStream<Result<Delivery, BrokerError>>,
    _release: ReleaseOnDrop,
}

impl Stream for InMemoryDeliveries {
    type Item = Result<Delivery, BrokerError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.receiver).poll_next(cx)
    }
}
