//! Read-only queue statistics.
//!
//! Statistics are obtained through a passive declaration: the broker
//! reports the queue's ready-message count and attached consumers without
//! creating or altering anything. Consumer-side counters live in
//! [`crate::consumer::ConsumerStats`].

use serde::Serialize;

use crate::transport::{BrokerError, Inspect};

/// Snapshot of a queue as seen by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queue: String,
    /// Messages ready for delivery. Unacknowledged deliveries are not counted.
    pub depth: u64,
    /// Subscriptions currently attached.
    pub consumer_count: u32,
}

/// Query every queue in `queues`, in order.
///
/// Fails on the first queue the broker does not know.
#[tracing::instrument(skip_all)]
pub async fn queue_stats<B, I, Q>(broker: &B, queues: I) -> Result<Vec<QueueStats>, BrokerError>
where
    B: Inspect + Sync,
    I: IntoIterator<Item = Q>,
    Q: AsRef<str>,
{
    let mut stats = Vec::new();
    for queue in queues {
        stats.push(broker.inspect_queue(queue.as_ref()).await?);
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{
        BrokerErrorKind, Declare, InMemoryBroker, MessageProperties, Outgoing, QueueSpec, Sender,
    };

    #[tokio::test]
    async fn reports_depth_and_consumers_without_side_effects() {
        let mut broker = InMemoryBroker::new();
        for name in ["sms_queue", "email_queue"] {
            broker
                .declare_queue(&QueueSpec {
                    name: name.into(),
                    durable: true,
                    dead_letter: None,
                })
                .await
                .unwrap();
        }
        broker
            .send(Outgoing {
                exchange: String::new(),
                routing_key: "sms_queue".into(),
                mandatory: false,
                properties: MessageProperties::default(),
                body: b"{}".to_vec(),
            })
            .await
            .unwrap();

        let stats = queue_stats(&broker, ["sms_queue", "email_queue"]).await.unwrap();
        let again = queue_stats(&broker, ["sms_queue", "email_queue"]).await.unwrap();

        assert_eq!(
            stats,
            vec![
                QueueStats {
                    queue: "sms_queue".into(),
                    depth: 1,
                    consumer_count: 0,
                },
                QueueStats {
                    queue: "email_queue".into(),
                    depth: 0,
                    consumer_count: 0,
                },
            ]
        );
        assert_eq!(stats, again);
    }

    #[tokio::test]
    async fn unknown_queue_is_not_found() {
        let broker = InMemoryBroker::new();

        let err = queue_stats(&broker, ["missing"]).await.unwrap_err();

        assert!(matches!(err.kind(), BrokerErrorKind::NotFound { .. }));
    }
}
