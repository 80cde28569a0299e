//! Publish side of the delivery engine.
//!
//! The [`Publisher`] turns an [`Envelope`] into a persistent AMQP-style
//! message and hands it to a [`transport::Transport`].
//!
//! Publishing is fire-and-forget from the producer's point of view: a
//! successful publish means the broker accepted the message, not that a
//! consumer processed it.

use serde::{Deserialize, Serialize};
use tower::Service;
use tracing_error::SpanTrace;

use crate::{
    Envelope,
    envelope::CONTENT_TYPE_JSON,
    transport::{self, BrokerErrorKind, MessageProperties, Outgoing, SenderService, TransportError},
};

/// What to do with a publish whose routing key matches no binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnroutablePolicy {
    /// Let the broker drop the message silently.
    #[default]
    Accept,
    /// Publish as mandatory and fail when the broker returns the message.
    Reject,
}

/// Outcome of an accepted publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishResult {
    pub message_id: String,
    pub exchange: String,
    pub routing_key: String,
}

/// Envelope publisher.
///
/// Every message is published with:
///
/// - `delivery_mode = 2` (persistent)
/// - `content_type = application/json`
/// - `message_id` = the envelope id
/// - `timestamp` = the envelope creation time
///
/// Persistence is not configurable.
#[derive(Clone)]
pub struct Publisher<S> {
    transport: transport::Transport<S>,
    unroutable: UnroutablePolicy,
}

impl<D> Publisher<SenderService<D>> {
    /// Create a publisher directly on top of a sender backend.
    pub fn new(sender: D) -> Self {
        Self::from_transport(transport::Transport::new(sender))
    }
}

impl<S> Publisher<S> {
    /// Create a publisher from a (possibly layered) transport.
    pub fn from_transport(transport: transport::Transport<S>) -> Self {
        Self {
            transport,
            unroutable: UnroutablePolicy::default(),
        }
    }

    pub fn with_unroutable_policy(mut self, policy: UnroutablePolicy) -> Self {
        self.unroutable = policy;
        self
    }

    /// Publish `envelope` to `exchange` under `routing_key`.
    ///
    /// On error nothing was queued.
    #[tracing::instrument(skip(self, envelope), fields(message_id = envelope.id(), kind = %envelope.kind()))]
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<PublishResult, PublishError>
    where
        S: Service<Outgoing> + Clone + Send + 'static,
        S::Future: Send + 'static,
        S::Error: Into<tower::BoxError>,
    {
        let body = envelope.encode().map_err(PublishError::encode)?;

        let message = Outgoing {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            mandatory: self.unroutable == UnroutablePolicy::Reject,
            properties: MessageProperties {
                content_type: Some(CONTENT_TYPE_JSON.to_owned()),
                persistent: true,
                message_id: Some(envelope.id().to_owned()),
                timestamp: Some(envelope.created_at()),
                retry_count: None,
            },
            body,
        };

        let mut transport = self.transport.clone();
        transport
            .send(message)
            .await
            .map_err(PublishError::transport)?;

        tracing::debug!("Envelope published");

        Ok(PublishResult {
            message_id: envelope.id().to_owned(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        })
    }
}

/// Error returned when a publish is refused.
#[derive(Debug)]
pub struct PublishError {
    context: SpanTrace,
    kind: PublishErrorKind,
}

/// Classification of publish errors.
#[derive(Debug)]
pub enum PublishErrorKind {
    /// The envelope could not be serialized.
    Encode(serde_json::Error),
    /// The broker is unreachable.
    Connection(TransportError),
    /// Mandatory publish matched no queue.
    Unroutable(TransportError),
    /// Any other transport failure.
    Transport(TransportError),
}

impl PublishError {
    fn encode(err: serde_json::Error) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: PublishErrorKind::Encode(err),
        }
    }

    fn transport(err: TransportError) -> Self {
        let kind = match err.broker_error().map(|e| e.kind()) {
            Some(BrokerErrorKind::Connection(_)) => PublishErrorKind::Connection(err),
            Some(BrokerErrorKind::Unroutable { .. }) => PublishErrorKind::Unroutable(err),
            _ => PublishErrorKind::Transport(err),
        };
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &PublishErrorKind {
        &self.kind
    }

    /// The broker is temporarily unavailable; a producer-facing API should
    /// answer with a 5xx-equivalent.
    pub fn is_connection(&self) -> bool {
        matches!(self.kind, PublishErrorKind::Connection(_))
    }

    pub fn is_unroutable(&self) -> bool {
        matches!(self.kind, PublishErrorKind::Unroutable(_))
    }
}

impl std::fmt::Display for PublishError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            PublishErrorKind::Encode(err) => writeln!(f, "Encode error: {err}"),
            PublishErrorKind::Connection(err) => writeln!(f, "Broker unavailable: {err}"),
            PublishErrorKind::Unroutable(err) => writeln!(f, "Unroutable message: {err}"),
            PublishErrorKind::Transport(err) => writeln!(f, "Transport error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for PublishError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            PublishErrorKind::Encode(err) => Some(err),
            PublishErrorKind::Connection(err)
            | PublishErrorKind::Unroutable(err)
            | PublishErrorKind::Transport(err) => Some(err),
        }
    }
}
