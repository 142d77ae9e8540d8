//! Central consumer loop for every pipeline stage.
//!
//! Stages implement [`MessageHandler`] and never touch acknowledgements. The
//! loop pulls deliveries, calls the handler, and settles each delivery from
//! the outcome: success acks, errors settle per [`PipelineError::disposition`].

use async_trait::async_trait;
use std::ops::AddAssign;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::broker::{Connection, Consumer, Delivery, Message};
use crate::error::{BrokerError, PipelineError};

/// How a delivery is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Done (successfully or permanently dropped)
    Ack,
    /// Permanent failure: nack without requeue
    Reject,
    /// Transient failure: nack with requeue for redelivery
    Requeue,
}

/// One stage's per-message logic.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Stage name for logs.
    fn stage(&self) -> &'static str;

    async fn handle(&self, message: &Message) -> Result<(), PipelineError>;
}

/// Settlement counters for one consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageStats {
    /// Handled successfully
    pub succeeded: usize,
    /// Failed and acked (dropped)
    pub dropped: usize,
    /// Failed and nacked without requeue
    pub rejected: usize,
    /// Failed and nacked with requeue
    pub requeued: usize,
}

impl StageStats {
    pub fn total(&self) -> usize {
        self.succeeded + self.dropped + self.rejected + self.requeued
    }
}

impl AddAssign for StageStats {
    fn add_assign(&mut self, other: Self) {
        self.succeeded += other.succeeded;
        self.dropped += other.dropped;
        self.rejected += other.rejected;
        self.requeued += other.requeued;
    }
}

/// Consume until the queue is deleted or the connection closes.
pub async fn run(mut consumer: Consumer, handler: Arc<dyn MessageHandler>) -> StageStats {
    let mut stats = StageStats::default();
    let stage = handler.stage();
    tracing::debug!("{} consumer started on {}", stage, consumer.queue_name());

    while let Some(delivery) = consumer.next().await {
        if delivery.redelivered() {
            tracing::debug!("{}: redelivered message", stage);
        }
        let outcome = handler.handle(delivery.message()).await;
        settle(stage, delivery, outcome, &mut stats);
    }

    tracing::debug!("{} consumer stopped: {:?}", stage, stats);
    stats
}

fn settle(
    stage: &str,
    delivery: Delivery,
    outcome: Result<(), PipelineError>,
    stats: &mut StageStats,
) {
    let error = match outcome {
        Ok(()) => {
            stats.succeeded += 1;
            delivery.ack();
            return;
        }
        Err(e) => e,
    };

    match error.disposition() {
        Disposition::Ack => {
            tracing::warn!("{}: dropping message: {}", stage, error);
            stats.dropped += 1;
            delivery.ack();
        }
        Disposition::Reject => {
            tracing::error!("{}: rejecting message: {}", stage, error);
            stats.rejected += 1;
            delivery.nack(false);
        }
        Disposition::Requeue => {
            tracing::warn!("{}: requeueing message: {}", stage, error);
            stats.requeued += 1;
            delivery.nack(true);
        }
    }
}

/// A fixed set of consumers for one stage.
pub struct StagePool {
    stage: &'static str,
    handles: Vec<JoinHandle<StageStats>>,
}

impl StagePool {
    /// Start `count` consumers on `queue`, each on its own channel with
    /// `prefetch` unsettled deliveries at most.
    pub fn spawn(
        connection: &Connection,
        queue: &str,
        count: usize,
        prefetch: u16,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self, BrokerError> {
        let stage = handler.stage();
        let mut handles = Vec::with_capacity(count.max(1));
        for _ in 0..count.max(1) {
            let mut channel = connection.channel()?;
            channel.basic_qos(prefetch);
            let consumer = channel.basic_consume(queue)?;
            handles.push(tokio::spawn(run(consumer, Arc::clone(&handler))));
        }
        tracing::info!("Started {} {} consumer(s) on {}", handles.len(), stage, queue);
        Ok(Self { stage, handles })
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every consumer to stop and sum their counters.
    pub async fn join(self) -> StageStats {
        let mut total = StageStats::default();
        for handle in self.handles {
            match handle.await {
                Ok(stats) => total += stats,
                Err(e) => tracing::error!("{} consumer task failed: {}", self.stage, e),
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, Destination, Publisher, QueueOptions};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    /// Fails according to the first body byte.
    struct Scripted {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for Scripted {
        fn stage(&self) -> &'static str {
            "scripted"
        }

        async fn handle(&self, message: &Message) -> Result<(), PipelineError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            match message.body.first() {
                Some(b'f') => Err(PipelineError::Fetch {
                    image_id: Uuid::nil(),
                    message: "gone".to_string(),
                }),
                Some(b'd') => Err(PipelineError::Decode {
                    image_id: Uuid::nil(),
                    message: "corrupt".to_string(),
                }),
                // Transient once, then fine.
                Some(b's') if call < 4 => Err(PipelineError::Store(
                    crate::error::StoreError::NotFound("flaky".to_string()),
                )),
                _ => Ok(()),
            }
        }
    }

    async fn wait_drained(broker: &Broker, queue: &str) {
        for _ in 0..200 {
            if broker.queue_depth(queue) == Some((0, 0)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("queue {queue} not drained");
    }

    #[tokio::test]
    async fn test_dispositions() {
        let broker = Broker::new();
        let connection = broker.connect();
        let channel = connection.channel().unwrap();
        channel.queue_declare("work", QueueOptions::DURABLE).unwrap();
        for body in ["ok", "fetch", "decode", "store"] {
            channel
                .publish(&Destination::queue("work"), Message::new(body.into()))
                .await
                .unwrap();
        }

        let handler = Arc::new(Scripted {
            calls: AtomicUsize::new(0),
        });
        let pool = StagePool::spawn(&connection, "work", 1, 1, handler.clone()).unwrap();
        assert_eq!(pool.stage(), "scripted");
        wait_drained(&broker, "work").await;
        connection.close();

        let stats = pool.join().await;
        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.requeued, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_pool_spreads_over_consumers() {
        let broker = Broker::new();
        let connection = broker.connect();
        let channel = connection.channel().unwrap();
        channel.queue_declare("work", QueueOptions::DURABLE).unwrap();
        for _ in 0..20 {
            channel
                .publish(&Destination::queue("work"), Message::new(b"ok".to_vec()))
                .await
                .unwrap();
        }
        let handler = Arc::new(Scripted {
            calls: AtomicUsize::new(0),
        });
        let pool = StagePool::spawn(&connection, "work", 3, 2, handler).unwrap();
        assert_eq!(pool.len(), 3);
        wait_drained(&broker, "work").await;
        connection.close();
        assert_eq!(pool.join().await.succeeded, 20);
    }

    #[test]
    fn test_stats_add() {
        let mut a = StageStats {
            succeeded: 1,
            dropped: 2,
            rejected: 3,
            requeued: 4,
        };
        a += a;
        assert_eq!(a.total(), 20);
    }
}
