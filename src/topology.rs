//! Exchange, queue and binding declaration.
//!
//! Topology is declared, not owned: every process declares the same
//! [`Topology`] at startup (and again after reconnecting), and the broker's
//! idempotent declare semantics make concurrent declarations converge.
//!
//! A declaration that clashes with an existing entity (for example a
//! non-durable queue with the same name) is a [`TopologyError`] that must
//! abort startup. It is never retried.

use std::collections::HashSet;

use tracing::instrument;
use tracing_error::SpanTrace;

use crate::{
    retry::DeadLetterLossPolicy,
    transport::{BindingSpec, BrokerError, DeadLetterTarget, Declare, ExchangeSpec, QueueSpec},
};

/// Routing of one routing key to one queue on the main exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub queue: String,
    pub routing_key: String,
}

/// Dead-letter destination shared by every queue of a topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

impl DeadLetter {
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            routing_key: routing_key.into(),
        }
    }
}

/// One durable direct exchange, its bound queues and an optional dead-letter
/// destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    exchange: String,
    bindings: Vec<Binding>,
    dead_letter: Option<DeadLetter>,
}

impl Topology {
    /// Pair `routing_keys[i]` with `queues[i]` on `exchange`.
    pub fn new<Q, K>(
        exchange: impl Into<String>,
        queues: impl IntoIterator<Item = Q>,
        routing_keys: impl IntoIterator<Item = K>,
    ) -> Result<Self, TopologyError>
    where
        Q: Into<String>,
        K: Into<String>,
    {
        let queues: Vec<String> = queues.into_iter().map(Into::into).collect();
        let routing_keys: Vec<String> = routing_keys.into_iter().map(Into::into).collect();

        if queues.len() != routing_keys.len() {
            return Err(TopologyError::invalid(format!(
                "{} queues but {} routing keys",
                queues.len(),
                routing_keys.len()
            )));
        }

        let topology = Self {
            exchange: exchange.into(),
            bindings: queues
                .into_iter()
                .zip(routing_keys)
                .map(|(queue, routing_key)| Binding { queue, routing_key })
                .collect(),
            dead_letter: None,
        };
        topology.validate()?;
        Ok(topology)
    }

    /// Route rejected messages of every queue to `dead_letter`.
    pub fn with_dead_letter(mut self, dead_letter: DeadLetter) -> Result<Self, TopologyError> {
        self.dead_letter = Some(dead_letter);
        self.validate()?;
        Ok(self)
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    pub fn dead_letter(&self) -> Option<&DeadLetter> {
        self.dead_letter.as_ref()
    }

    /// Queue bound under `routing_key`, if any.
    pub fn queue_for(&self, routing_key: &str) -> Option<&str> {
        self.bindings
            .iter()
            .find(|b| b.routing_key == routing_key)
            .map(|b| b.queue.as_str())
    }

    /// Refuse a topology without dead-lettering when the loss policy demands
    /// one.
    pub fn check_loss_policy(&self, policy: DeadLetterLossPolicy) -> Result<(), TopologyError> {
        match (policy, &self.dead_letter) {
            (DeadLetterLossPolicy::Require, None) => Err(TopologyError::invalid(
                "dead-letter loss policy requires a dead-letter destination",
            )),
            _ => Ok(()),
        }
    }

    fn validate(&self) -> Result<(), TopologyError> {
        if self.exchange.is_empty() {
            return Err(TopologyError::invalid("exchange name is empty"));
        }
        if self.bindings.is_empty() {
            return Err(TopologyError::invalid("topology has no queues"));
        }

        let mut seen = HashSet::new();
        for binding in &self.bindings {
            if binding.queue.is_empty() || binding.routing_key.is_empty() {
                return Err(TopologyError::invalid("queue names and routing keys must not be empty"));
            }
            if !seen.insert(binding.queue.as_str()) {
                return Err(TopologyError::invalid(format!(
                    "queue '{}' is bound twice",
                    binding.queue
                )));
            }
        }

        if let Some(dl) = &self.dead_letter {
            if dl.exchange.is_empty() || dl.queue.is_empty() || dl.routing_key.is_empty() {
                return Err(TopologyError::invalid("dead-letter names must not be empty"));
            }
            if dl.exchange == self.exchange {
                return Err(TopologyError::invalid(
                    "dead-letter exchange must differ from the main exchange",
                ));
            }
            if seen.contains(dl.queue.as_str()) {
                return Err(TopologyError::invalid(format!(
                    "dead-letter queue '{}' is also a work queue",
                    dl.queue
                )));
            }
        }
        Ok(())
    }

    fn exchange_specs(&self) -> Vec<ExchangeSpec> {
        std::iter::once(&self.exchange)
            .chain(self.dead_letter.as_ref().map(|dl| &dl.exchange))
            .map(|name| ExchangeSpec {
                name: name.clone(),
                durable: true,
            })
            .collect()
    }

    fn queue_specs(&self) -> Vec<QueueSpec> {
        let target = self.dead_letter.as_ref().map(|dl| DeadLetterTarget {
            exchange: dl.exchange.clone(),
            routing_key: dl.routing_key.clone(),
        });

        let mut specs: Vec<QueueSpec> = self
            .bindings
            .iter()
            .map(|b| QueueSpec {
                name: b.queue.clone(),
                durable: true,
                dead_letter: target.clone(),
            })
            .collect();

        if let Some(dl) = &self.dead_letter {
            specs.push(QueueSpec {
                name: dl.queue.clone(),
                durable: true,
                dead_letter: None,
            });
        }
        specs
    }

    fn binding_specs(&self) -> Vec<BindingSpec> {
        let mut specs: Vec<BindingSpec> = self
            .bindings
            .iter()
            .map(|b| BindingSpec {
                exchange: self.exchange.clone(),
                routing_key: b.routing_key.clone(),
                queue: b.queue.clone(),
            })
            .collect();

        if let Some(dl) = &self.dead_letter {
            specs.push(BindingSpec {
                exchange: dl.exchange.clone(),
                routing_key: dl.routing_key.clone(),
                queue: dl.queue.clone(),
            });
        }
        specs
    }
}

/// Declare every entity of `topology`.
///
/// Safe to call repeatedly and concurrently from independent processes with
/// identical arguments.
#[instrument(skip_all, fields(exchange = topology.exchange()))]
pub async fn ensure_topology<B>(broker: &B, topology: &Topology) -> Result<(), TopologyError>
where
    B: Declare + Sync,
{
    topology.validate()?;

    for exchange in topology.exchange_specs() {
        broker.declare_exchange(&exchange).await?;
    }
    for queue in topology.queue_specs() {
        broker.declare_queue(&queue).await?;
    }
    for binding in topology.binding_specs() {
        broker.bind_queue(&binding).await?;
    }

    tracing::info!(
        queues = topology.bindings.len(),
        dead_letter = topology.dead_letter.is_some(),
        "Topology declared"
    );
    Ok(())
}

/// Error returned when a topology cannot be declared.
#[derive(Debug)]
pub struct TopologyError {
    context: SpanTrace,
    kind: TopologyErrorKind,
}

/// Topology errors kind.
#[derive(Debug)]
pub enum TopologyErrorKind {
    /// The topology itself is malformed.
    Invalid(String),
    /// An entity exists with incompatible properties.
    Conflict(BrokerError),
    /// The broker could not be reached while declaring.
    Connection(BrokerError),
    /// Any other broker failure.
    Broker(BrokerError),
}

impl TopologyError {
    fn invalid(reason: impl Into<String>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TopologyErrorKind::Invalid(reason.into()),
        }
    }

    pub fn kind(&self) -> &TopologyErrorKind {
        &self.kind
    }

    /// Conflicts and invalid topologies must abort startup; only connection
    /// failures may be retried.
    pub fn is_fatal(&self) -> bool {
        !matches!(self.kind, TopologyErrorKind::Connection(_))
    }
}

impl From<BrokerError> for TopologyError {
    fn from(err: BrokerError) -> Self {
        let kind = if err.is_conflict() {
            TopologyErrorKind::Conflict(err)
        } else if err.is_connection() {
            TopologyErrorKind::Connection(err)
        } else {
            TopologyErrorKind::Broker(err)
        };
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }
}

impl std::fmt::Display for TopologyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            TopologyErrorKind::Invalid(reason) => writeln!(f, "Invalid topology: {reason}"),
            TopologyErrorKind::Conflict(err) => writeln!(f, "Topology conflict: {err}"),
            TopologyErrorKind::Connection(err) => writeln!(f, "Topology connection error: {err}"),
            TopologyErrorKind::Broker(err) => writeln!(f, "Topology broker error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for TopologyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            TopologyErrorKind::Invalid(_) => None,
            TopologyErrorKind::Conflict(err)
            | TopologyErrorKind::Connection(err)
            | TopologyErrorKind::Broker(err) => Some(err),
        }
    }
}
