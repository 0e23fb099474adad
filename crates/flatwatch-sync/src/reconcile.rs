use std::collections::hash_map::Entry;
use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use flatwatch_core::{dedup_by_id, price_drop_reaches, Listing, PriceEntry, Snapshot};

/// Placeholder age for prior listings persisted without a `created` stamp.
const UNKNOWN_CREATED_AGE_DAYS: i64 = 3650;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub standard: u8,
    pub extreme: u8,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            standard: 15,
            extreme: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    New,
    ExtremeBelowAverage,
    PriceDrop,
    ExtremePriceDrop,
    Unchanged,
}

/// Classified listings of one reconciliation; every listing carries its reconciled fields.
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub segment: String,
    pub new_listings: Vec<Listing>,
    pub price_drops: Vec<Listing>,
    pub extreme: Vec<Listing>,
    pub unchanged: usize,
    pub absent: usize,
}

impl ReconcileReport {
    pub fn is_quiet(&self) -> bool {
        self.new_listings.is_empty() && self.price_drops.is_empty() && self.extreme.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub snapshot: Snapshot,
    pub report: ReconcileReport,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Reconciler {
    thresholds: Thresholds,
}

impl Reconciler {
    pub fn new(thresholds: Thresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    pub fn classify(&self, prior: Option<&Listing>, fetched: &Listing) -> Classification {
        let Some(prior) = prior else {
            return if fetched.below_average_percent() <= -f64::from(self.thresholds.extreme) {
                Classification::ExtremeBelowAverage
            } else {
                Classification::New
            };
        };

        if price_drop_reaches(prior.price, fetched.price, self.thresholds.extreme) {
            Classification::ExtremePriceDrop
        } else if price_drop_reaches(prior.price, fetched.price, self.thresholds.standard) {
            Classification::PriceDrop
        } else {
            Classification::Unchanged
        }
    }

    /// Classifies `batch` against `prior` and merges it into the next snapshot.
    ///
    /// Prior listings missing from the batch are carried forward untouched, so their stale
    /// `updated` keeps them out of current views and a later reappearance is not new. Known
    /// listings keep `created` and history, new ones start a one-entry history; all fetched
    /// listings are stamped `updated = now`.
    pub fn reconcile(
        &self,
        prior: Snapshot,
        batch: Vec<Listing>,
        last_page: u32,
        now: DateTime<Utc>,
    ) -> ReconcileOutcome {
        let batch = dedup_by_id(batch);
        let mut prior_order = Vec::with_capacity(prior.flats.len());
        let mut prior_by_id: HashMap<i64, Listing> = HashMap::with_capacity(prior.flats.len());
        for listing in prior.flats {
            if let Entry::Vacant(slot) = prior_by_id.entry(listing.id) {
                prior_order.push(listing.id);
                slot.insert(listing);
            }
        }

        let mut report = ReconcileReport {
            segment: batch
                .first()
                .map(|listing| listing.block_slug.clone())
                .unwrap_or_default(),
            ..ReconcileReport::default()
        };
        let mut merged = Vec::with_capacity(batch.len() + prior_by_id.len());

        for mut listing in batch {
            let previous = prior_by_id.remove(&listing.id);
            let class = self.classify(previous.as_ref(), &listing);

            match previous {
                Some(previous) => {
                    listing.created = Some(
                        previous
                            .created
                            .unwrap_or_else(|| now - Duration::days(UNKNOWN_CREATED_AGE_DAYS)),
                    );
                    listing.old_price = previous.price;
                    listing.price_history = previous.price_history;
                    let entry = current_entry(&listing, now);
                    match listing.price_history.last_mut() {
                        Some(last) if last.price == entry.price => last.status = entry.status,
                        _ => listing.price_history.push(entry),
                    }
                }
                None => {
                    listing.created = Some(now);
                    listing.old_price = 0;
                    listing.price_history = vec![current_entry(&listing, now)];
                }
            }
            listing.updated = Some(now);

            match class {
                Classification::New => report.new_listings.push(listing.clone()),
                Classification::ExtremeBelowAverage | Classification::ExtremePriceDrop => {
                    report.extreme.push(listing.clone())
                }
                Classification::PriceDrop => report.price_drops.push(listing.clone()),
                Classification::Unchanged => report.unchanged += 1,
            }
            merged.push(listing);
        }
        report.absent = prior_by_id.len();
        merged.extend(prior_order.into_iter().filter_map(|id| prior_by_id.remove(&id)));

        ReconcileOutcome {
            snapshot: Snapshot {
                flats: merged,
                last_page,
            },
            report,
        }
    }
}

fn current_entry(listing: &Listing, now: DateTime<Utc>) -> PriceEntry {
    PriceEntry {
        date: now,
        price: listing.price,
        status: Some(listing.status),
    }
}
