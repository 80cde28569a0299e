use std::time::Duration;

use mailbag::{
    Config, Envelope, Publisher,
    consumer::{ProcessingError, Supervisor},
    envelope::Notification,
    stats,
    transport::rabbitmq::{RabbitMq, RabbitMqConnector},
};
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

async fn deliver(envelope: Envelope) -> Result<(), ProcessingError> {
    match envelope.notification() {
        Notification::Sms(sms) if sms.text.contains("fail") => {
            Err(ProcessingError::transient("sms gateway rejected the message"))
        }
        Notification::Sms(sms) => {
            tracing::info!(id = envelope.id(), phone = %sms.phone, "SMS sent");
            Ok(())
        }
        Notification::Email(email) => {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tracing::info!(id = envelope.id(), recipient = %email.recipient, "Email sent");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .init();

    let config = Config::load().expect("Failed to load configuration");
    let topology = config.topology().expect("Invalid topology");
    tracing::info!(url = %config.amqp_url_masked(), "Starting worker");

    let cancel = CancellationToken::new();
    let cancel_signal = cancel.clone();
    let cancel_handle = tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        cancel_signal.cancel();
    });

    let mut consumers = Vec::new();
    for binding in topology.bindings() {
        let supervisor = Supervisor::new(
            RabbitMqConnector::new(&config.amqp_url),
            topology.clone(),
            config.consumer_options(&binding.queue),
            deliver,
        )
        .with_reconnect_interval(config.reconnect_interval());
        let cancel = cancel.clone();
        consumers.push(tokio::spawn(async move {
            supervisor.run(cancel).await.expect("Consumer stopped");
        }));
    }

    let broker = RabbitMq::connect(&config.amqp_url)
        .await
        .expect("Failed to connect to RabbitMQ");
    let publisher = Publisher::new(broker.clone()).with_unroutable_policy(config.unroutable);
    let exchange = topology.exchange().to_owned();
    let queues: Vec<String> = topology.bindings().iter().map(|b| b.queue.clone()).collect();
    let cancel_producer = cancel.clone();
    let producer_handle = tokio::spawn(async move {
        let mut n = 0;
        while !cancel_producer.is_cancelled() {
            let envelope = if n % 2 == 0 {
                let text = if n % 10 == 0 { "please fail" } else { "Hello" };
                Envelope::sms("+3900000000", text)
            } else {
                Envelope::email("demo@example.com", "Hello", "Hi there").with_campaign("demo")
            };
            match publisher
                .publish(&exchange, envelope.kind().routing_key(), &envelope)
                .await
            {
                Ok(result) => tracing::debug!(id = %result.message_id, "Published"),
                Err(err) => tracing::error!(%err, "Publish failed"),
            }
            if n % 20 == 0 {
                match stats::queue_stats(&broker, &queues).await {
                    Ok(stats) => tracing::info!(?stats, "Queue statistics"),
                    Err(err) => tracing::warn!(%err, "Failed to read queue statistics"),
                }
            }
            n += 1;
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    });

    cancel_handle.await.unwrap();
    producer_handle.await.unwrap();
    for consumer in consumers {
        consumer.await.unwrap();
    }
}
