//! Reconnecting supervisor around the consumer loop.
//!
//! Each attempt connects, declares the topology and runs a [`Consumer`]
//! until it stops. Connection failures wait a fixed interval and try again;
//! topology conflicts and invalid options stop the supervisor.

use std::{sync::Arc, time::Duration};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;

use crate::{
    consumer::{
        Consumer, ConsumerHook, ConsumerOptions, ConsumerRunError, ConsumerState, ConsumerStats,
        DefaultConsumerHook, Process,
    },
    topology::{Topology, TopologyError, ensure_topology},
    transport::{Connect, Declare, Subscribe},
};

const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Keeps one consumer running across broker outages.
///
/// Counters and state are shared by every attempt.
pub struct Supervisor<C, P, HK = DefaultConsumerHook> {
    connector: C,
    topology: Topology,
    options: ConsumerOptions,
    processor: Arc<P>,
    hook: Arc<HK>,
    stats: Arc<ConsumerStats>,
    state: Arc<watch::Sender<ConsumerState>>,
    reconnect_interval: Duration,
}

impl<C, P> Supervisor<C, P, DefaultConsumerHook>
where
    P: Process,
{
    pub fn new(connector: C, topology: Topology, options: ConsumerOptions, processor: P) -> Self {
        Self {
            connector,
            topology,
            options,
            processor: Arc::new(processor),
            hook: Arc::new(DefaultConsumerHook),
            stats: ConsumerStats::new(),
            state: Arc::new(watch::Sender::new(ConsumerState::Idle)),
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
        }
    }
}

impl<C, P, HK> Supervisor<C, P, HK> {
    pub fn with_hook<HK2: ConsumerHook>(self, hook: HK2) -> Supervisor<C, P, HK2> {
        Supervisor {
            connector: self.connector,
            topology: self.topology,
            options: self.options,
            processor: self.processor,
            hook: Arc::new(hook),
            stats: self.stats,
            state: self.state,
            reconnect_interval: self.reconnect_interval,
        }
    }

    pub fn with_stats(mut self, stats: Arc<ConsumerStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        Arc::clone(&self.stats)
    }

    pub fn state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Run until cancelled or until a fatal error.
    #[tracing::instrument(skip_all, fields(queue = %self.options.queue()))]
    pub async fn run(self, cancel: CancellationToken) -> Result<(), RecoveryError>
    where
        C: Connect + Send + Sync,
        C::Broker: Declare + Subscribe + Send + Sync,
        P: Process + 'static,
        HK: ConsumerHook + 'static,
    {
        let mut first = true;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            if !first {
                self.stats.record_reconnect();
            }
            first = false;

            match self.attempt(&cancel).await {
                Ok(()) => return Ok(()),
                Err(Attempt::Fatal(err)) => {
                    self.state.send_replace(ConsumerState::Stopped);
                    return Err(err);
                }
                Err(Attempt::Retry(err)) => {
                    self.state.send_replace(ConsumerState::Idle);
                    tracing::warn!(
                        error = %err,
                        interval = ?self.reconnect_interval,
                        "Broker unavailable, reconnecting"
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_interval) => {}
                _ = cancel.cancelled() => {
                    self.state.send_replace(ConsumerState::Stopped);
                    return Ok(());
                }
            }
        }
    }

    async fn attempt(&self, cancel: &CancellationToken) -> Result<(), Attempt>
    where
        C: Connect + Send + Sync,
        C::Broker: Declare + Subscribe + Send + Sync,
        P: Process + 'static,
        HK: ConsumerHook + 'static,
    {
        let broker = self
            .connector
            .connect()
            .await
            .map_err(|e| Attempt::Retry(e.into()))?;

        ensure_topology(&broker, &self.topology)
            .await
            .map_err(|e| {
                if e.is_fatal() {
                    Attempt::Fatal(RecoveryError::topology(e))
                } else {
                    Attempt::Retry(e.into())
                }
            })?;

        Consumer::from_parts(
            broker,
            self.options.clone(),
            Arc::clone(&self.processor),
            Arc::clone(&self.hook),
            Arc::clone(&self.stats),
            Arc::clone(&self.state),
        )
        .run(cancel.clone())
        .await
        .map_err(|e| {
            if e.is_connection() {
                Attempt::Retry(e.into())
            } else {
                Attempt::Fatal(RecoveryError::consumer(e))
            }
        })
    }
}

/// Run a [`Supervisor`] with the default hook.
pub async fn run_with_recovery<C, P>(
    connector: C,
    topology: Topology,
    options: ConsumerOptions,
    processor: P,
    reconnect_interval: Duration,
    cancel: CancellationToken,
) -> Result<(), RecoveryError>
where
    C: Connect + Send + Sync,
    C::Broker: Declare + Subscribe + Send + Sync,
    P: Process + 'static,
{
    Supervisor::new(connector, topology, options, processor)
        .with_reconnect_interval(reconnect_interval)
        .run(cancel)
        .await
}

enum Attempt {
    Retry(tower::BoxError),
    Fatal(RecoveryError),
}

/// Error that stops the supervisor.
#[derive(Debug)]
pub struct RecoveryError {
    context: SpanTrace,
    kind: RecoveryErrorKind,
}

#[derive(Debug)]
pub enum RecoveryErrorKind {
    /// Conflicting or invalid topology.
    Topology(TopologyError),
    /// The consumer refused to start for a reason other than connectivity.
    Consumer(ConsumerRunError),
}

impl RecoveryError {
    fn topology(err: TopologyError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: RecoveryErrorKind::Topology(err),
        }
    }

    fn consumer(err: ConsumerRunError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: RecoveryErrorKind::Consumer(err),
        }
    }

    pub fn kind(&self) -> &RecoveryErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for RecoveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            RecoveryErrorKind::Topology(err) => writeln!(f, "Topology error: {err}"),
            RecoveryErrorKind::Consumer(err) => writeln!(f, "Consumer error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for RecoveryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            RecoveryErrorKind::Topology(err) => Some(err),
            RecoveryErrorKind::Consumer(err) => Some(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Envelope, Publisher,
        consumer::ProcessingError,
        topology::TopologyErrorKind,
        transport::{InMemoryBroker, Inspect, QueueSpec},
    };

    fn topology() -> Topology {
        Topology::new("notifications", ["sms_queue", "email_queue"], ["sms", "email"]).unwrap()
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

    async fn ok(_envelope: Envelope) -> Result<(), ProcessingError> {
        Ok(())
    }

    async fn consumers(broker: &InMemoryBroker) -> u32 {
        match broker.inspect_queue("sms_queue").await {
            Ok(stats) => stats.consumer_count,
            Err(_) => 0,
        }
    }

    #[tokio::test]
    async fn resumes_after_an_outage() {
        let broker = InMemoryBroker::new();
        let supervisor = Supervisor::new(
            broker.clone(),
            topology(),
            ConsumerOptions::new("sms_queue", 1),
            ok,
        )
        .with_reconnect_interval(Duration::from_millis(10));
        let stats = supervisor.stats();
        let mut state = supervisor.state();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(supervisor.run(cancel.clone()));

        // Topology is declared by the supervisor itself.
        state
            .wait_for(|s| *s == ConsumerState::Listening)
            .await
            .unwrap();
        let publisher = Publisher::new(broker.clone());
        publisher
            .publish("notifications", "sms", &Envelope::sms("+1", "before"))
            .await
            .unwrap();
        wait_until(|| stats.snapshot().acked == 1).await;

        broker.disconnect();
        wait_until(|| stats.snapshot().reconnects >= 2).await;
        broker.reconnect();

        let mut attached = 0;
        for _ in 0..500 {
            attached = consumers(&broker).await;
            if attached == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(attached, 1);

        publisher
            .publish("notifications", "sms", &Envelope::sms("+1", "after"))
            .await
            .unwrap();
        wait_until(|| stats.snapshot().acked == 2).await;

        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(*state.borrow(), ConsumerState::Stopped);
    }

    #[tokio::test]
    async fn topology_conflict_is_fatal() {
        let broker = InMemoryBroker::new();
        crate::transport::Declare::declare_queue(
            &broker,
            &QueueSpec {
                name: "sms_queue".into(),
                durable: false,
                dead_letter: None,
            },
        )
        .await
        .unwrap();

        let err = Supervisor::new(
            broker,
            topology(),
            ConsumerOptions::new("sms_queue", 1),
            ok,
        )
        .with_reconnect_interval(Duration::from_millis(10))
        .run(CancellationToken::new())
        .await
        .unwrap_err();

        match err.kind() {
            RecoveryErrorKind::Topology(err) => {
                assert!(matches!(err.kind(), TopologyErrorKind::Conflict(_)))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_while_offline_returns_ok() {
        let broker = InMemoryBroker::new();
        broker.disconnect();

        let supervisor = Supervisor::new(
            broker.clone(),
            topology(),
            ConsumerOptions::new("sms_queue", 1),
            ok,
        )
        .with_reconnect_interval(Duration::from_millis(10));
        let stats = supervisor.stats();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(supervisor.run(cancel.clone()));

        wait_until(|| stats.snapshot().reconnects >= 1).await;
        cancel.cancel();

        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn zero_prefetch_stops_the_supervisor() {
        let broker = InMemoryBroker::new();

        let err = run_with_recovery(
            broker,
            topology(),
            ConsumerOptions::new("sms_queue", 0),
            ok,
            Duration::from_millis(10),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err.kind(), RecoveryErrorKind::Consumer(_)));
    }
}
