use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use flatwatch_adapters::{FetchStats, FetchedBatch, ListingSource, SegmentRef, SourceError};
use flatwatch_storage::SnapshotStore;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::delivery::{Delivery, DeliveryHandle};
use crate::digest::{digests_for, Audience};
use crate::pool::WorkerPool;
use crate::reconcile::Reconciler;
use crate::registry::{Recipient, SegmentCatalog, SubscriptionDirectory};
use crate::shutdown;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentJob {
    pub segment: SegmentRef,
    pub subscribers: Vec<Recipient>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SegmentOutcome {
    pub stats: FetchStats,
    pub prior_count: usize,
    pub overlap_with_prior: usize,
    pub new_listings: usize,
    pub price_drops: usize,
    pub extreme: usize,
    pub absent: usize,
    pub digests_enqueued: usize,
}

/// Fetch, reconcile, persist and enqueue digests for one segment.
pub struct SegmentPipeline {
    source: Arc<dyn ListingSource>,
    store: SnapshotStore,
    reconciler: Reconciler,
    delivery: DeliveryHandle,
}

impl SegmentPipeline {
    pub fn new(
        source: Arc<dyn ListingSource>,
        store: SnapshotStore,
        reconciler: Reconciler,
        delivery: DeliveryHandle,
    ) -> Self {
        Self {
            source,
            store,
            reconciler,
            delivery,
        }
    }

    pub async fn process(&self, job: &SegmentJob) -> Result<SegmentOutcome> {
        self.process_at(job, Utc::now()).await
    }

    async fn process_at(&self, job: &SegmentJob, now: DateTime<Utc>) -> Result<SegmentOutcome> {
        let slug = job.segment.slug.clone();
        let batch = match self.source.fetch_segment(&job.segment).await {
            Ok(batch) => batch,
            Err(err) => {
                if matches!(err.root(), SourceError::ZeroResults { .. }) {
                    let file = self.store.file_state(&slug).await;
                    warn!(
                        segment = %slug,
                        path = %file.path.display(),
                        exists = file.exists,
                        stored_listings = ?file.listings,
                        "segment returned zero listings: {err}"
                    );
                }
                return Err(anyhow::Error::new(err))
                    .with_context(|| format!("fetching segment {slug}"));
            }
        };

        let FetchedBatch {
            listings,
            last_page,
            stats,
            ..
        } = batch;
        let reconciler = self.reconciler;
        let (mut report, prior_count, overlap_with_prior) = self
            .store
            .update(&slug, move |prior| {
                let prior_count = prior.flats.len();
                let prior_ids = prior.ids();
                let overlap = listings
                    .iter()
                    .filter(|listing| prior_ids.contains(&listing.id))
                    .count();
                let outcome = reconciler.reconcile(prior, listings, last_page, now);
                (outcome.snapshot, (outcome.report, prior_count, overlap))
            })
            .await
            .with_context(|| format!("persisting segment {slug}"))?;
        report.segment = slug.clone();

        info!(
            segment = %slug,
            pages = stats.pages_fetched,
            last_page = stats.last_page,
            reported = ?stats.reported_count,
            downloaded = stats.downloaded,
            unique = stats.unique_ids,
            prior = prior_count,
            overlap = overlap_with_prior,
            new = report.new_listings.len(),
            drops = report.price_drops.len(),
            extreme = report.extreme.len(),
            absent = report.absent,
            "segment reconciled"
        );

        let mut digests_enqueued = 0;
        for digest in digests_for(&report, now) {
            if digest.audience == Audience::Subscribers && job.subscribers.is_empty() {
                debug!(segment = %slug, kind = ?digest.kind, "no subscribers, digest skipped");
                continue;
            }
            self.delivery
                .enqueue(Delivery {
                    digest,
                    subscribers: job.subscribers.clone(),
                })
                .await
                .context("enqueueing digest")?;
            digests_enqueued += 1;
        }

        Ok(SegmentOutcome {
            stats,
            prior_count,
            overlap_with_prior,
            new_listings: report.new_listings.len(),
            price_drops: report.price_drops.len(),
            extreme: report.extreme.len(),
            absent: report.absent,
            digests_enqueued,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PassSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub planned: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub digests_enqueued: usize,
    pub cancelled: bool,
}

pub struct Scheduler {
    pipeline: Arc<SegmentPipeline>,
    catalog: Arc<SegmentCatalog>,
    directory: Arc<SubscriptionDirectory>,
    max_concurrency: usize,
    poll_interval: Duration,
}

impl Scheduler {
    pub fn new(
        pipeline: Arc<SegmentPipeline>,
        catalog: Arc<SegmentCatalog>,
        directory: Arc<SubscriptionDirectory>,
        max_concurrency: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            pipeline,
            catalog,
            directory,
            max_concurrency: max_concurrency.max(1),
            poll_interval,
        }
    }

    /// Subscribed segments first, then every other catalog segment with no recipients.
    pub fn plan_pass(&self) -> Vec<SegmentJob> {
        let mut jobs = Vec::with_capacity(self.catalog.len());
        let mut planned = HashSet::new();

        for (slug, recipients) in self.directory.subscribed_segments() {
            let Some(info) = self.catalog.get(slug) else {
                warn!(segment = slug, "subscribed segment missing from catalog");
                continue;
            };
            planned.insert(info.slug.clone());
            jobs.push(SegmentJob {
                segment: info.segment_ref(),
                subscribers: recipients.to_vec(),
            });
        }

        for info in self.catalog.all_known_segments() {
            if planned.insert(info.slug.clone()) {
                jobs.push(SegmentJob {
                    segment: info.segment_ref(),
                    subscribers: Vec::new(),
                });
            }
        }
        jobs
    }

    /// One full pass; returns once every dispatched job finished.
    pub async fn run_pass(&self, shutdown: &watch::Receiver<bool>) -> PassSummary {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_pass", %run_id);
        self.run_pass_inner(run_id, shutdown).instrument(span).await
    }

    async fn run_pass_inner(&self, run_id: Uuid, shutdown: &watch::Receiver<bool>) -> PassSummary {
        let jobs = self.plan_pass();
        let mut summary = PassSummary {
            run_id,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            planned: jobs.len(),
            succeeded: 0,
            failed: 0,
            digests_enqueued: 0,
            cancelled: false,
        };

        let mut pool = WorkerPool::new(self.max_concurrency);
        for job in jobs {
            if *shutdown.borrow() {
                summary.cancelled = true;
                break;
            }
            let pipeline = self.pipeline.clone();
            let span = info_span!("segment", segment = %job.segment.slug);
            pool.spawn(
                async move {
                    let outcome = pipeline.process(&job).await;
                    (job.segment.slug, outcome)
                }
                .instrument(span),
            )
            .await;
        }

        for joined in pool.join_all().await {
            match joined {
                Ok((_, Ok(outcome))) => {
                    summary.succeeded += 1;
                    summary.digests_enqueued += outcome.digests_enqueued;
                }
                Ok((slug, Err(err))) => {
                    summary.failed += 1;
                    warn!(segment = %slug, "segment cycle failed: {err:#}");
                }
                Err(err) => {
                    summary.failed += 1;
                    error!("segment task aborted: {err}");
                }
            }
        }

        summary.finished_at = Utc::now();
        info!(
            planned = summary.planned,
            succeeded = summary.succeeded,
            failed = summary.failed,
            digests = summary.digests_enqueued,
            cancelled = summary.cancelled,
            elapsed_ms = (summary.finished_at - summary.started_at).num_milliseconds(),
            "sync pass finished"
        );
        summary
    }

    /// Runs a pass every poll interval until shutdown is requested; ticks missed during a pass are skipped.
    pub async fn run_forever(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            every_secs = self.poll_interval.as_secs_f64(),
            segments = self.catalog.len(),
            workers = self.max_concurrency,
            "scheduler started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown::requested(&mut shutdown) => break,
            }
            if *shutdown.borrow() {
                break;
            }
            let summary = self.run_pass(&shutdown).await;
            if summary.cancelled {
                break;
            }
        }
        info!("scheduler stopped");
    }
}
