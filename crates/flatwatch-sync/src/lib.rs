//! Polling pipeline orchestration: configuration, registries, reconciliation, digests,
//! delivery and the scheduler that ties them together.

pub mod config;
pub mod delivery;
pub mod digest;
pub mod pool;
pub mod reconcile;
pub mod registry;
pub mod scheduler;
pub mod views;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::{Context, Result};
use flatwatch_adapters::{FilterApiSource, ListingSource};
use flatwatch_storage::{HttpFetcher, SnapshotStore};
use tracing::info;

pub use config::{EnvType, WatchConfig};
pub use delivery::{
    Delivery, DeliveryHandle, DeliveryQueue, DeliveryStats, LogNotifier, Notifier, QueueError,
};
pub use digest::{digests_for, Audience, Digest, DigestKind};
pub use pool::WorkerPool;
pub use reconcile::{Classification, ReconcileOutcome, ReconcileReport, Reconciler, Thresholds};
pub use registry::{
    load_registry, parse_registry, Recipient, SegmentCatalog, SegmentInfo, Subscription,
    SubscriptionDirectory,
};
pub use scheduler::{PassSummary, Scheduler, SegmentJob, SegmentOutcome, SegmentPipeline};
pub use views::{dump_text, listing_info, recent_listings, ListingInfo};

pub const CRATE_NAME: &str = "flatwatch-sync";

/// Process-wide cancellation signal.
pub mod shutdown {
    use tokio::sync::watch;

    pub fn channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    pub fn request(tx: &watch::Sender<bool>) {
        let _ = tx.send(true);
    }

    /// Resolves once shutdown is requested; never resolves if every sender is gone first.
    pub async fn requested(rx: &mut watch::Receiver<bool>) {
        if rx.wait_for(|stop| *stop).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Everything built once at startup from a [`WatchConfig`].
pub struct WatchService {
    pub config: WatchConfig,
    pub catalog: Arc<SegmentCatalog>,
    pub directory: Arc<SubscriptionDirectory>,
    pub store: SnapshotStore,
    pub source: Arc<dyn ListingSource>,
}

impl WatchService {
    pub fn from_config(config: WatchConfig) -> Result<Self> {
        config.validate().context("validating configuration")?;
        let (catalog, directory) = load_registry(&config.registry_path, config.env)?;
        let http = HttpFetcher::new(config.http_client_config()).context("building http client")?;
        let source = FilterApiSource::new(Arc::new(http), config.api_base_url.clone());
        let store = SnapshotStore::new(&config.storage_dir, config.env.as_str());

        info!(
            env = %config.env,
            segments = catalog.len(),
            recipients = directory.all_recipients().len(),
            storage = %config.storage_dir.display(),
            "watch service configured"
        );

        Ok(Self {
            config,
            catalog: Arc::new(catalog),
            directory: Arc::new(directory),
            store,
            source: Arc::new(source),
        })
    }

    pub fn start_delivery(&self, notifier: Arc<dyn Notifier>) -> DeliveryQueue {
        DeliveryQueue::start(
            self.config.delivery_queue_capacity,
            notifier,
            self.directory.clone(),
        )
    }

    pub fn scheduler(&self, delivery: DeliveryHandle) -> Scheduler {
        let pipeline = SegmentPipeline::new(
            self.source.clone(),
            self.store.clone(),
            Reconciler::new(self.config.thresholds()),
            delivery,
        );
        Scheduler::new(
            Arc::new(pipeline),
            self.catalog.clone(),
            self.directory.clone(),
            self.config.max_concurrent_segments,
            self.config.poll_interval,
        )
    }

    /// One pass over every segment, then drains the delivery queue.
    pub async fn sync_once(&self, notifier: Arc<dyn Notifier>) -> Result<(PassSummary, DeliveryStats)> {
        let queue = self.start_delivery(notifier);
        let scheduler = self.scheduler(queue.handle());
        let (_tx, rx) = shutdown::channel();
        let summary = scheduler.run_pass(&rx).await;
        drop(scheduler);
        let delivered = queue.shutdown().await.context("draining delivery queue")?;
        Ok((summary, delivered))
    }
}

pub async fn run_sync_once_from_env() -> Result<(PassSummary, DeliveryStats)> {
    let config = WatchConfig::from_env()?;
    let service = WatchService::from_config(config)?;
    service.sync_once(Arc::new(LogNotifier)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn shutdown_signal_resolves_waiters() {
        let (tx, mut rx) = shutdown::channel();
        let waiter = tokio::spawn(async move { shutdown::requested(&mut rx).await });
        shutdown::request(&tx);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn service_wires_registry_and_store() {
        let dir = tempdir().unwrap();
        let registry = dir.path().join("segments.yaml");
        std::fs::write(
            &registry,
            "segments:\n  - id: 42\n    slug: 2ngt\n    name: Second Nagatinsky\nsubscriptions:\n  test:\n    - chat_id: 7\n      segment: 2ngt\n",
        )
        .unwrap();

        let config = WatchConfig {
            storage_dir: dir.path().join("data"),
            env: EnvType::Test,
            registry_path: registry,
            ..WatchConfig::default()
        };
        let service = WatchService::from_config(config).unwrap();
        assert_eq!(service.catalog.id_for("2ngt"), Some(42));
        assert_eq!(service.directory.list_subscribers("2ngt"), vec![7]);
        assert!(service.store.path_for("2ngt").ends_with("2ngt_test.json"));
        assert_eq!(service.source.source_id(), "filter-api");

        let plan = service.scheduler(service.start_delivery(Arc::new(LogNotifier)).handle()).plan_pass();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].subscribers, vec![7]);
    }

    #[test]
    fn invalid_config_is_rejected_before_loading() {
        let config = WatchConfig {
            price_drop_percent: 30,
            ..WatchConfig::default()
        };
        let err = WatchService::from_config(config).err().unwrap();
        assert!(format!("{err:#}").contains("exceeds extreme"));
    }
}
