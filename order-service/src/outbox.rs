use anyhow::Result;
use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, FutureRecord};
use shared::store::Ledger;
use shared::OutboxEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const BATCH_SIZE: i64 = 100;

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, payload: &str) -> Result<()>;
}

pub struct KafkaPublisher {
    producer: FutureProducer,
}

impl KafkaPublisher {
    pub fn new(producer: FutureProducer) -> Self {
        Self { producer }
    }
}

#[async_trait]
impl EventPublisher for KafkaPublisher {
    async fn publish(&self, topic: &str, key: &str, payload: &str) -> Result<()> {
        let record = FutureRecord::to(topic).payload(payload).key(key);

        self.producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| anyhow::anyhow!("Failed to publish event: {}", e))?;

        Ok(())
    }
}

pub struct OutboxProcessor {
    ledger: Arc<dyn Ledger>,
    publisher: Arc<dyn EventPublisher>,
    order_topic: String,
    interval: Duration,
}

impl OutboxProcessor {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        publisher: Arc<dyn EventPublisher>,
        order_topic: String,
        interval: Duration,
    ) -> Self {
        Self {
            ledger,
            publisher,
            order_topic,
            interval,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = time::interval(self.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = interval.tick() => {}
            }

            if let Err(e) = self.process_outbox_events().await {
                error!("Error processing outbox events: {}", e);
            }
        }
    }

    /// Publishes one batch in creation order and returns how many went out. Events that
    /// fail stay unprocessed for the next round.
    pub async fn process_outbox_events(&self) -> Result<usize> {
        let unprocessed_events = self.ledger.unprocessed_outbox_events(BATCH_SIZE).await?;
        let mut published = 0;

        for event in unprocessed_events {
            if let Err(e) = self.publish_event(&event).await {
                error!("Failed to publish event {}: {}", event.id, e);
                continue;
            }

            self.ledger.mark_outbox_processed(event.id).await?;
            published += 1;

            info!(event_id = %event.id, event_type = %event.event_type, "Published outbox event");
        }

        Ok(published)
    }

    fn topic_for<'a>(&'a self, event_type: &str) -> &'a str {
        match event_type {
            "OrderCreated" | "OrderPaid" | "OrderCompleted" | "OrderCancelled" => self.order_topic.as_str(),
            "ReservationsReleased" => "inventory-events",
            "ReconciliationRequired" => "reconciliation-events",
            _ => "domain-events",
        }
    }

    async fn publish_event(&self, event: &OutboxEvent) -> Result<()> {
        let payload = serde_json::json!({
            "event_id": event.id,
            "event_type": event.event_type,
            "aggregate_id": event.aggregate_id,
            "occurred_at": event.created_at,
            "data": event.event_data,
        });
        let json = serde_json::to_string(&payload)?;
        let key = event.aggregate_id.to_string();

        self.publisher
            .publish(self.topic_for(&event.event_type), &key, &json)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use shared::store::MemoryLedger;
    use shared::EventType;
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<(String, String)>>,
        fail_topic: Option<&'static str>,
    }

    #[async_trait]
    impl EventPublisher for Recording {
        async fn publish(&self, topic: &str, key: &str, _payload: &str) -> Result<()> {
            if self.fail_topic == Some(topic) {
                anyhow::bail!("broker unavailable");
            }
            self.sent
                .lock()
                .unwrap()
                .push((topic.to_string(), key.to_string()));
            Ok(())
        }
    }

    async fn seed(ledger: &MemoryLedger, event_type: EventType) -> Uuid {
        let aggregate = Uuid::new_v4();
        let mut tx = ledger.begin().await.unwrap();
        tx.append_outbox(&OutboxEvent::new(
            aggregate,
            event_type,
            serde_json::json!({}),
            Utc::now(),
        ))
        .await
        .unwrap();
        tx.commit().await.unwrap();
        aggregate
    }

    #[tokio::test]
    async fn publishes_and_marks_processed() {
        let ledger = Arc::new(MemoryLedger::new());
        let paid = seed(&ledger, EventType::OrderPaid).await;
        seed(&ledger, EventType::ReservationsReleased).await;
        let publisher = Arc::new(Recording::default());
        let processor = OutboxProcessor::new(
            ledger.clone(),
            publisher.clone(),
            "order-events".into(),
            Duration::from_secs(5),
        );

        assert_eq!(processor.process_outbox_events().await.unwrap(), 2);
        assert_eq!(processor.process_outbox_events().await.unwrap(), 0);

        let sent = publisher.sent.lock().unwrap().clone();
        assert_eq!(sent[0], ("order-events".to_string(), paid.to_string()));
        assert_eq!(sent[1].0, "inventory-events");
    }

    #[tokio::test]
    async fn failed_events_stay_queued() {
        let ledger = Arc::new(MemoryLedger::new());
        seed(&ledger, EventType::ReconciliationRequired).await;
        let publisher = Arc::new(Recording {
            fail_topic: Some("reconciliation-events"),
            ..Recording::default()
        });
        let processor = OutboxProcessor::new(
            ledger.clone(),
            publisher,
            "order-events".into(),
            Duration::from_secs(5),
        );

        assert_eq!(processor.process_outbox_events().await.unwrap(), 0);
        assert_eq!(ledger.unprocessed_outbox_events(10).await.unwrap().len(), 1);
    }
}
