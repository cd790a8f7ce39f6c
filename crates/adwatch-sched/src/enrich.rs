//! Enrichment loop: pick the most urgent batch, fetch each detail page, and
//! apply the verdict (update, delete, or defer).

use adwatch_core::{EnrichmentUpdate, Listing};
use adwatch_source::extract::{extract_detail, Strategy};
use adwatch_source::DetailFetch;
use adwatch_store::{ListingStore, StoreError};
use chrono::Utc;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{AppConfig, Pacing, Shutdown};

/// Selection tiers in priority order; a cycle serves the first non-empty one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Favorites,
    NeverEnriched,
    Rotation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Source no longer serves the listing (404 or off-pattern redirect).
    DeletedGone,
    /// Detail page resolved but the listing is closed or removed.
    DeletedClosed,
    Updated(Strategy),
    /// Transient failure or no extraction verdict; check timestamp advanced so
    /// the same row is not re-selected immediately.
    Deferred,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BatchStats {
    pub tier: Option<Tier>,
    pub selected: usize,
    pub updated: usize,
    pub deleted: usize,
    pub deferred: usize,
}

pub struct EnrichmentScheduler<D> {
    detail: D,
    store: ListingStore,
    batch_size: i64,
    favorite_refresh: chrono::Duration,
    item_pacing: Pacing,
    batch_pacing: Pacing,
    idle: std::time::Duration,
}

impl<D: DetailFetch> EnrichmentScheduler<D> {
    pub fn new(detail: D, store: ListingStore, config: &AppConfig) -> Self {
        Self {
            detail,
            store,
            batch_size: config.enrich_batch_size.max(1),
            favorite_refresh: chrono::Duration::minutes(config.favorite_refresh_mins.max(0)),
            item_pacing: config.enrich_item_pacing(),
            batch_pacing: config.enrich_batch_pacing(),
            idle: std::time::Duration::from_secs(config.enrich_idle_secs),
        }
    }

    /// The next batch by tier priority: favorites past their refresh interval,
    /// then listings never enriched, then the rotation sweep. `None` when the
    /// store offers nothing at all.
    pub async fn select_batch(&self) -> Result<Option<(Tier, Vec<Listing>)>, StoreError> {
        let threshold = Utc::now() - self.favorite_refresh;

        let favorites = self.store.favorites_due(threshold, self.batch_size).await?;
        if !favorites.is_empty() {
            return Ok(Some((Tier::Favorites, favorites)));
        }

        let fresh = self.store.never_enriched(self.batch_size).await?;
        if !fresh.is_empty() {
            return Ok(Some((Tier::NeverEnriched, fresh)));
        }

        let rotation = self.store.rotation(self.batch_size).await?;
        if rotation.is_empty() {
            return Ok(None);
        }
        Ok(Some((Tier::Rotation, rotation)))
    }

    /// Fetch and resolve one listing. Store errors propagate; fetch and
    /// extraction problems resolve to an outcome instead.
    pub async fn process(&self, listing: &Listing) -> Result<ItemOutcome, StoreError> {
        let now = Utc::now();
        let Some(url) = listing.ad_url.as_deref() else {
            warn!(id = %listing.id, "listing has no detail url");
            self.store.touch_check(&listing.id, now).await?;
            return Ok(ItemOutcome::Deferred);
        };

        let document = match self.detail.fetch_detail(url).await {
            Ok(document) => document,
            Err(err) if err.is_gone() => {
                info!(id = %listing.id, error = %err, "listing gone at source, deleting");
                self.store.delete(&listing.id).await?;
                return Ok(ItemOutcome::DeletedGone);
            }
            Err(err) => {
                warn!(id = %listing.id, error = %err, "detail fetch failed, deferring");
                self.store.touch_check(&listing.id, now).await?;
                return Ok(ItemOutcome::Deferred);
            }
        };

        match extract_detail(&document.html) {
            None => {
                warn!(id = %listing.id, "no extraction verdict, deferring");
                self.store.touch_check(&listing.id, now).await?;
                Ok(ItemOutcome::Deferred)
            }
            Some(extraction) if !extraction.is_active => {
                info!(id = %listing.id, "listing closed, deleting");
                self.store.delete(&listing.id).await?;
                Ok(ItemOutcome::DeletedClosed)
            }
            Some(extraction) => {
                let update = EnrichmentUpdate {
                    description: extraction.description,
                    full_description: extraction.full_description,
                    seller_name: extraction.seller_name,
                    params: extraction.params,
                    all_photos: extraction.photos,
                    checked_at: now,
                };
                self.store.update_enrichment(&listing.id, &update).await?;
                Ok(ItemOutcome::Updated(extraction.strategy))
            }
        }
    }

    /// One batch. Pauses between items and honors shutdown between them; the
    /// in-flight item always completes.
    pub async fn cycle(&self, shutdown: &mut Shutdown) -> Result<BatchStats, StoreError> {
        let run_id = Uuid::new_v4();
        self.cycle_inner(shutdown)
            .instrument(info_span!("enrich_cycle", run_id = %run_id))
            .await
    }

    async fn cycle_inner(&self, shutdown: &mut Shutdown) -> Result<BatchStats, StoreError> {
        let mut stats = BatchStats::default();
        let Some((tier, batch)) = self.select_batch().await? else {
            return Ok(stats);
        };
        stats.tier = Some(tier);
        stats.selected = batch.len();

        for (index, listing) in batch.iter().enumerate() {
            match self.process(listing).await? {
                ItemOutcome::Updated(_) => stats.updated += 1,
                ItemOutcome::DeletedGone | ItemOutcome::DeletedClosed => stats.deleted += 1,
                ItemOutcome::Deferred => stats.deferred += 1,
            }
            let last = index + 1 == batch.len();
            if !last && shutdown.sleep(self.item_pacing.pick()).await {
                break;
            }
        }
        Ok(stats)
    }

    pub async fn run(self, mut shutdown: Shutdown) {
        loop {
            if shutdown.is_triggered() {
                break;
            }
            let pause = match self.cycle(&mut shutdown).await {
                Ok(stats) if stats.selected == 0 => self.idle,
                Ok(stats) => {
                    info!(
                        tier = ?stats.tier,
                        selected = stats.selected,
                        updated = stats.updated,
                        deleted = stats.deleted,
                        deferred = stats.deferred,
                        "enrichment batch finished"
                    );
                    self.batch_pacing.pick()
                }
                Err(err) => {
                    tracing::error!(error = %err, "enrichment cycle failed");
                    self.batch_pacing.pick()
                }
            };
            if shutdown.sleep(pause).await {
                break;
            }
        }
        info!("enrichment loop stopped");
    }
}
