//! Notifier seam and the bounded delivery queue in front of it.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::digest::{Audience, Digest};
use crate::registry::{Recipient, SubscriptionDirectory};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, recipient: Recipient, text: &str) -> Result<()>;

    async fn send_with_image(
        &self,
        recipient: Recipient,
        text: &str,
        image: &[u8],
        caption: &str,
    ) -> Result<()>;
}

/// Writes every outbound message to the log instead of a chat transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, recipient: Recipient, text: &str) -> Result<()> {
        info!(recipient, lines = text.lines().count(), "notify\n{text}");
        Ok(())
    }

    async fn send_with_image(
        &self,
        recipient: Recipient,
        text: &str,
        image: &[u8],
        caption: &str,
    ) -> Result<()> {
        info!(recipient, image_bytes = image.len(), caption, "notify with image\n{text}");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub digest: Digest,
    /// Segment subscribers; ignored for broadcast digests.
    pub subscribers: Vec<Recipient>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("delivery queue is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub deliveries: usize,
    pub sent: usize,
    pub failed: usize,
}

/// Producer side of the queue; `enqueue` waits while the queue is full.
#[derive(Debug, Clone)]
pub struct DeliveryHandle {
    tx: mpsc::Sender<Delivery>,
}

impl DeliveryHandle {
    pub async fn enqueue(&self, delivery: Delivery) -> Result<(), QueueError> {
        self.tx.send(delivery).await.map_err(|_| QueueError::Closed)
    }
}

/// Bounded queue with a single consumer task that fans digests out to recipients.
#[derive(Debug)]
pub struct DeliveryQueue {
    handle: DeliveryHandle,
    close: oneshot::Sender<()>,
    worker: JoinHandle<DeliveryStats>,
}

impl DeliveryQueue {
    pub fn start(
        capacity: usize,
        notifier: Arc<dyn Notifier>,
        directory: Arc<SubscriptionDirectory>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (close, close_rx) = oneshot::channel();
        let worker = tokio::spawn(consume(rx, close_rx, notifier, directory));
        Self {
            handle: DeliveryHandle { tx },
            close,
            worker,
        }
    }

    pub fn handle(&self) -> DeliveryHandle {
        self.handle.clone()
    }

    /// Stops accepting deliveries and waits until everything already queued is sent.
    pub async fn shutdown(self) -> Result<DeliveryStats> {
        let _ = self.close.send(());
        drop(self.handle);
        let stats = self.worker.await?;
        info!(?stats, "delivery queue drained");
        Ok(stats)
    }
}

async fn consume(
    mut rx: mpsc::Receiver<Delivery>,
    mut close: oneshot::Receiver<()>,
    notifier: Arc<dyn Notifier>,
    directory: Arc<SubscriptionDirectory>,
) -> DeliveryStats {
    let mut stats = DeliveryStats::default();
    let mut closing = false;
    loop {
        let next = if closing {
            rx.recv().await
        } else {
            tokio::select! {
                biased;
                item = rx.recv() => item,
                _ = &mut close => {
                    closing = true;
                    rx.close();
                    continue;
                }
            }
        };
        let Some(delivery) = next else {
            break;
        };
        deliver(notifier.as_ref(), &directory, delivery, &mut stats).await;
    }
    stats
}

async fn deliver(
    notifier: &dyn Notifier,
    directory: &SubscriptionDirectory,
    delivery: Delivery,
    stats: &mut DeliveryStats,
) {
    stats.deliveries += 1;
    let recipients = match delivery.digest.audience {
        Audience::Subscribers => delivery.subscribers,
        Audience::Broadcast => directory.all_recipients(),
    };
    debug!(
        segment = %delivery.digest.segment,
        kind = ?delivery.digest.kind,
        recipients = recipients.len(),
        "delivering digest"
    );
    for recipient in recipients {
        match notifier.send(recipient, &delivery.digest.text).await {
            Ok(()) => stats.sent += 1,
            Err(err) => {
                stats.failed += 1;
                warn!(recipient, segment = %delivery.digest.segment, "delivery failed: {err:#}");
            }
        }
    }
}
