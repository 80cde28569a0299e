//! Broker abstractions and backends.
//!
//! This module defines the seams between the delivery engine and a concrete
//! message broker. The engine never talks to a broker library directly; it
//! goes through a handful of small traits:
//!
//! - [`Declare`]: idempotent exchange/queue/binding declaration
//! - [`Sender`]: publish an [`Outgoing`] message (wrapped by [`Transport`])
//! - [`Subscribe`]: open a manual-ack [`Subscription`] bounded by prefetch
//! - [`Inspect`]: passive queue statistics
//! - [`Connect`]: obtain a connected broker handle, used on recovery
//!
//! Publishing is built around Tower's `Service` abstraction so middleware
//! (timeouts, rate limits, tracing) can be layered on the publish path while
//! backends stay broker-specific.
//!
//! Backends:
//! - [`InMemoryBroker`]: in-process broker with AMQP-like semantics
//! - [`rabbitmq`]: RabbitMQ through `lapin` (feature `rabbitmq`)

pub mod inmemory;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use chrono::{DateTime, Utc};
use futures_core::stream::BoxStream;
use tokio_stream::StreamExt as _;
use tower::Service;
use tracing_error::SpanTrace;

use crate::stats::QueueStats;

pub use inmemory::InMemoryBroker;

/// Header carrying the number of times a message was requeued.
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";

/// Generic Tower-compatible publish path.
///
/// `Transport` wraps an underlying Tower `Service` and:
///
/// - Normalizes errors into [`TransportError`]
/// - Supports Tower middleware via layers
/// - Provides a convenience [`send`](Transport::send) API
///
/// Typically constructed from a concrete [`Sender`] implementation.
#[derive(Clone)]
pub struct Transport<S> {
    service: S,
}

impl<D> Transport<SenderService<D>> {
    /// Create a new transport from a concrete sender backend.
    pub fn new(driver: D) -> Self {
        Self {
            service: SenderService::new(driver),
        }
    }
}

impl<S> Transport<S> {
    /// Apply a Tower layer to the transport.
    pub fn layer<L>(self, layer: L) -> Transport<L::Service>
    where
        L: tower::Layer<S>,
    {
        Transport {
            service: layer.layer(self.service),
        }
    }

    /// Send an [`Outgoing`] message through the transport.
    pub async fn send(&mut self, message: Outgoing) -> Result<(), TransportError>
    where
        S: Service<Outgoing> + Clone + Send + 'static,
        S::Future: Send + 'static,
        S::Error: Into<tower::BoxError>,
    {
        let mut service = self.service.clone();
        std::future::poll_fn(|cx| service.poll_ready(cx))
            .await
            .map_err(|e| TransportError::new(e.into()))?;
        service
            .call(message)
            .await
            .map_err(|e| TransportError::new(e.into()))?;
        Ok(())
    }
}

impl<R, S> Service<R> for Transport<S>
where
    S: Service<R> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<tower::BoxError>,
    R: Send + 'static,
{
    type Response = ();
    type Error = TransportError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service
            .poll_ready(cx)
            .map_err(|e| TransportError::new(e.into()))
    }

    fn call(&mut self, req: R) -> Self::Future {
        let mut service = self.service.clone();

        Box::pin(async move {
            service
                .call(req)
                .await
                .map_err(|e| TransportError::new(e.into()))?;
            Ok(())
        })
    }
}

/// Error returned by the publish path.
///
/// Captures the underlying error together with a tracing span backtrace.
#[derive(Debug)]
pub struct TransportError {
    context: SpanTrace,
    source: tower::BoxError,
}

impl TransportError {
    fn new(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            source: err,
        }
    }

    /// The broker error behind this failure, if the sender produced one.
    pub fn broker_error(&self) -> Option<&BrokerError> {
        self.source.downcast_ref::<BrokerError>()
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Sender error: {}", self.source)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// Tower service adapter for a [`Sender`] backend.
#[derive(Clone)]
pub struct SenderService<D> {
    sender: D,
}

impl<D> SenderService<D> {
    /// Create a new sender service from a backend.
    pub fn new(sender: D) -> Self {
        Self { sender }
    }
}

impl<D> Service<Outgoing> for SenderService<D>
where
    D: Sender + Clone + Send + 'static,
{
    type Response = ();
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Outgoing) -> Self::Future {
        let mut sender = self.sender.clone();
        Box::pin(async move {
            sender.send(req).await.map_err(Into::into)?;
            Ok(())
        })
    }
}

/// Trait implemented by broker backends able to publish.
///
/// `send` returns once the broker accepted the message. It never waits for
/// consumers.
#[async_trait::async_trait]
pub trait Sender {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;

    /// Hand one message to the broker.
    async fn send(&mut self, message: Outgoing) -> Result<(), Self::Error>;
}

/// A message ready to be handed to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub exchange: String,
    pub routing_key: String,
    /// Ask the broker to refuse the message when no queue matches.
    pub mandatory: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

/// Backend-neutral message metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    /// Delivery mode 2: the broker writes the message to disk.
    pub persistent: bool,
    pub message_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    /// Value of the [`RETRY_COUNT_HEADER`] header.
    pub retry_count: Option<u32>,
}

/// Exchange declaration. Exchanges always route by exact routing-key match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub durable: bool,
}

/// Queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    /// Where rejected messages go, if anywhere.
    pub dead_letter: Option<DeadLetterTarget>,
}

/// Dead-letter routing attached to a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterTarget {
    pub exchange: String,
    pub routing_key: String,
}

/// Binding of a queue to an exchange under a routing key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BindingSpec {
    pub exchange: String,
    pub routing_key: String,
    pub queue: String,
}

/// Idempotent topology declaration.
///
/// Declaring an entity that already exists with identical properties is a
/// no-op. Declaring it with different properties fails with
/// [`BrokerErrorKind::Conflict`].
#[async_trait::async_trait]
pub trait Declare {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), BrokerError>;
    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), BrokerError>;
    async fn bind_queue(&self, binding: &BindingSpec) -> Result<(), BrokerError>;
}

/// Manual-acknowledgment subscription.
#[async_trait::async_trait]
pub trait Subscribe {
    /// Subscribe to `queue`. The broker keeps at most `prefetch` deliveries
    /// unresolved for this subscription.
    async fn subscribe(
        &self,
        queue: &str,
        prefetch: u16,
        consumer_tag: &str,
    ) -> Result<Subscription, BrokerError>;
}

/// Passive, non-mutating queue inspection.
#[async_trait::async_trait]
pub trait Inspect {
    async fn inspect_queue(&self, queue: &str) -> Result<QueueStats, BrokerError>;
}

/// Factory for connected broker handles.
#[async_trait::async_trait]
pub trait Connect {
    type Broker;

    async fn connect(&self) -> Result<Self::Broker, BrokerError>;
}

/// Broker-scoped delivery tag, unique per subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(pub u64);

impl std::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// How a delivery is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Done: remove the message.
    Ack,
    /// Not done: put it back with the retry counter set to `retry_count`.
    Requeue { retry_count: u32 },
    /// Not done, never will be: dead-letter or drop.
    Reject,
}

/// Everything a backend needs to resolve a delivery.
#[derive(Debug)]
pub struct SettleRequest {
    pub tag: DeliveryTag,
    pub settlement: Settlement,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

/// Backend half of a [`Delivery`], consumed on resolution.
#[async_trait::async_trait]
pub trait Acknowledge: Send {
    async fn settle(self: Box<Self>, request: SettleRequest) -> Result<(), BrokerError>;
}

/// A message handed to a consumer by the broker.
///
/// Resolving the delivery consumes it, so a tag can only be resolved once.
/// A delivery dropped without resolution stays unacknowledged until the
/// subscription closes, at which point the broker redelivers it.
pub struct Delivery {
    tag: DeliveryTag,
    redelivered: bool,
    properties: MessageProperties,
    body: Vec<u8>,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    /// Wrap a broker delivery together with the handle that resolves it.
    pub fn new(
        tag: DeliveryTag,
        redelivered: bool,
        properties: MessageProperties,
        body: Vec<u8>,
        acker: impl Acknowledge + 'static,
    ) -> Self {
        Self {
            tag,
            redelivered,
            properties,
            body,
            acker: Box::new(acker),
        }
    }

    /// Broker-assigned tag, unique within the subscription.
    pub fn tag(&self) -> DeliveryTag {
        self.tag
    }

    /// Set by the broker when the message was delivered before.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Message metadata as published.
    pub fn properties(&self) -> &MessageProperties {
        &self.properties
    }

    /// Raw message body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Value of the retry header, `0` when absent.
    pub fn retry_count(&self) -> u32 {
        self.properties.retry_count.unwrap_or(0)
    }

    /// Acknowledge: the broker forgets the message.
    pub async fn ack(self) -> Result<(), BrokerError> {
        self.settle(Settlement::Ack).await
    }

    /// Put the message back on its queue with `retry_count` in the retry
    /// header.
    pub async fn requeue(self, retry_count: u32) -> Result<(), BrokerError> {
        self.settle(Settlement::Requeue { retry_count }).await
    }

    /// Reject without requeue. The message is dead-lettered when the queue
    /// has a dead-letter exchange, and dropped otherwise.
    pub async fn reject(self) -> Result<(), BrokerError> {
        self.settle(Settlement::Reject).await
    }

    /// Resolve the delivery with an arbitrary [`Settlement`].
    pub async fn settle(self, settlement: Settlement) -> Result<(), BrokerError> {
        let Delivery {
            tag,
            properties,
            body,
            acker,
            ..
        } = self;

        acker
            .settle(SettleRequest {
                tag,
                settlement,
                properties,
                body,
            })
            .await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("tag", &self.tag)
            .field("redelivered", &self.redelivered)
            .field("properties", &self.properties)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// Releases a subscription on the broker side.
#[async_trait::async_trait]
pub trait CloseSubscription: Send {
    async fn close(self: Box<Self>) -> Result<(), BrokerError>;
}

/// An open subscription: a stream of deliveries plus a way to release it.
///
/// Closing (or dropping) the subscription returns every unresolved delivery
/// to the queue.
pub struct Subscription {
    deliveries: BoxStream<'static, Result<Delivery, BrokerError>>,
    closer: Box<dyn CloseSubscription>,
}

impl Subscription {
    /// Combine a delivery stream with the handle that cancels it.
    pub fn new(
        deliveries: BoxStream<'static, Result<Delivery, BrokerError>>,
        closer: impl CloseSubscription + 'static,
    ) -> Self {
        Self {
            deliveries,
            closer: Box::new(closer),
        }
    }

    /// Next delivery. `None` means the broker ended the subscription.
    pub async fn next(&mut self) -> Option<Result<Delivery, BrokerError>> {
        self.deliveries.next().await
    }

    /// Cancel the subscription. Unresolved deliveries go back to the queue.
    #[tracing::instrument(skip_all)]
    pub async fn close(self) -> Result<(), BrokerError> {
        let Subscription { deliveries, closer } = self;
        let result = closer.close().await;
        drop(deliveries);
        result
    }
}

/// Broker entity named in a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Exchange,
    Queue,
    Binding,
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Entity::Exchange => f.write_str("exchange"),
            Entity::Queue => f.write_str("queue"),
            Entity::Binding => f.write_str("binding"),
        }
    }
}

/// Error returned by broker operations.
#[derive(Debug)]
pub struct BrokerError {
    context: SpanTrace,
    kind: BrokerErrorKind,
}

/// Broker errors kind.
#[derive(Debug)]
pub enum BrokerErrorKind {
    /// The broker is unreachable or the connection/channel was lost.
    Connection(tower::BoxError),
    /// An entity exists with incompatible properties.
    Conflict {
        entity: Entity,
        name: String,
        reason: String,
    },
    /// An entity referenced by the operation does not exist.
    NotFound { entity: Entity, name: String },
    /// The delivery tag is unknown or already resolved.
    UnknownDeliveryTag(DeliveryTag),
    /// A mandatory publish matched no queue.
    Unroutable { exchange: String, routing_key: String },
    /// The broker refused to take responsibility for a publish.
    Nacked,
    /// Any other backend failure.
    Other(tower::BoxError),
}

impl BrokerError {
    pub fn new(kind: BrokerErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn connection(err: impl Into<tower::BoxError>) -> Self {
        Self::new(BrokerErrorKind::Connection(err.into()))
    }

    pub fn conflict(entity: Entity, name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(BrokerErrorKind::Conflict {
            entity,
            name: name.into(),
            reason: reason.into(),
        })
    }

    pub fn not_found(entity: Entity, name: impl Into<String>) -> Self {
        Self::new(BrokerErrorKind::NotFound {
            entity,
            name: name.into(),
        })
    }

    pub fn other(err: impl Into<tower::BoxError>) -> Self {
        Self::new(BrokerErrorKind::Other(err.into()))
    }

    /// Returns the kind of the error.
    pub fn kind(&self) -> &BrokerErrorKind {
        &self.kind
    }

    /// Whether the broker was unreachable or the connection dropped.
    pub fn is_connection(&self) -> bool {
        matches!(self.kind, BrokerErrorKind::Connection(_))
    }

    /// Whether an entity exists with incompatible settings.
    pub fn is_conflict(&self) -> bool {
        matches!(self.kind, BrokerErrorKind::Conflict { .. })
    }
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            BrokerErrorKind::Connection(err) => writeln!(f, "Connection error: {err}"),
            BrokerErrorKind::Conflict {
                entity,
                name,
                reason,
            } => writeln!(f, "Conflicting {entity} '{name}': {reason}"),
            BrokerErrorKind::NotFound { entity, name } => {
                writeln!(f, "No such {entity} '{name}'")
            }
            BrokerErrorKind::UnknownDeliveryTag(tag) => {
                writeln!(f, "Unknown delivery tag {tag}")
            }
            BrokerErrorKind::Unroutable {
                exchange,
                routing_key,
            } => writeln!(
                f,
                "Unroutable message: exchange '{exchange}', routing key '{routing_key}'"
            ),
            BrokerErrorKind::Nacked => writeln!(f, "Broker refused the publish"),
            BrokerErrorKind::Other(err) => writeln!(f, "Broker error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for BrokerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            BrokerErrorKind::Connection(err) | BrokerErrorKind::Other(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}
