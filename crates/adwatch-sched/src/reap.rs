//! Staleness reaper: anything older than the retention window is deleted
//! wholesale, active or not. Freshness is defined by `created_at` alone.

use adwatch_store::{ListingStore, StoreError};
use chrono::Utc;
use tracing::info;

use crate::{AppConfig, Pacing, Shutdown};

pub struct Reaper {
    store: ListingStore,
    retention: chrono::Duration,
    pacing: Pacing,
}

impl Reaper {
    pub fn new(store: ListingStore, config: &AppConfig) -> Self {
        Self {
            store,
            retention: config.retention(),
            pacing: config.reap_pacing(),
        }
    }

    /// One sweep; returns the number of rows removed.
    pub async fn cycle(&self) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - self.retention;
        self.store.purge_created_before(cutoff).await
    }

    pub async fn run(self, mut shutdown: Shutdown) {
        loop {
            if shutdown.is_triggered() {
                break;
            }
            match self.cycle().await {
                Ok(removed) => info!(removed, "retention sweep finished"),
                Err(err) => tracing::error!(error = %err, "retention sweep failed"),
            }
            if shutdown.sleep(self.pacing.pick()).await {
                break;
            }
        }
        info!("reaper loop stopped");
    }
}
