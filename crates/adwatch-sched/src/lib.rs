//! Long-running loops that keep the snapshot current: acquisition, enrichment,
//! and the staleness reaper, plus the shared config, pacing, and shutdown
//! plumbing they run on.

pub mod acquire;
pub mod enrich;
pub mod reap;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use adwatch_source::{FeedQuery, Identity, SourceConfig};
use anyhow::Context;
use rand::Rng;
use serde::Deserialize;
use tokio::sync::watch;

pub use acquire::{AcquisitionScheduler, CycleStats, OfferFilters, Rejection};
pub use enrich::{BatchStats, EnrichmentScheduler, ItemOutcome, Tier};
pub use reap::Reaper;

pub const CRATE_NAME: &str = "adwatch-sched";

/// Process-wide configuration. Defaults run the watcher against the public
/// feed with no filters beyond the photo requirement; `ADWATCH_CONFIG` may
/// point at a YAML file overriding any subset of fields.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub feed_url: String,
    pub detail_path_marker: String,
    pub referer: String,
    pub http_timeout_secs: u64,

    pub category_id: Option<i64>,
    pub search: Option<String>,
    pub stop_words: Vec<String>,
    pub min_price_uah: Option<i64>,
    pub max_price_uah: Option<i64>,
    /// `YYYY-MM-DD`; offers whose source creation date is earlier are dropped.
    pub min_created_date: Option<String>,
    pub location_keywords: Vec<String>,
    /// Fixed conversion rates to UAH, keyed by currency code.
    pub conversion_rates: BTreeMap<String, f64>,

    pub feed_offsets: Vec<u32>,
    pub acquire_pause_secs: (u64, u64),

    pub enrich_batch_size: i64,
    pub favorite_refresh_mins: i64,
    pub enrich_item_pause_secs: (u64, u64),
    pub enrich_batch_pause_secs: (u64, u64),
    pub enrich_idle_secs: u64,

    pub retention_hours: i64,
    pub reap_pause_secs: (u64, u64),

    pub listen_port: u16,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("listings.db"),
            feed_url: "https://www.olx.ua/api/v1/offers".to_string(),
            detail_path_marker: "obyavlenie".to_string(),
            referer: "https://www.olx.ua/".to_string(),
            http_timeout_secs: 15,
            category_id: None,
            search: None,
            stop_words: Vec::new(),
            min_price_uah: None,
            max_price_uah: None,
            min_created_date: None,
            location_keywords: Vec::new(),
            conversion_rates: BTreeMap::new(),
            feed_offsets: vec![0, 50, 100],
            acquire_pause_secs: (8 * 60, 12 * 60),
            enrich_batch_size: 5,
            favorite_refresh_mins: 15,
            enrich_item_pause_secs: (4, 12),
            enrich_batch_pause_secs: (15, 45),
            enrich_idle_secs: 120,
            retention_hours: 48,
            reap_pause_secs: (30 * 60, 60 * 60),
            listen_port: 8000,
        }
    }
}

impl AppConfig {
    /// Load the YAML file named by `ADWATCH_CONFIG` (defaults when unset),
    /// then apply the `ADWATCH_DB` override.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = match std::env::var("ADWATCH_CONFIG") {
            Ok(path) => Self::from_yaml_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        if let Ok(db) = std::env::var("ADWATCH_DB") {
            config.db_path = PathBuf::from(db);
        }
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn source_config(&self) -> SourceConfig {
        SourceConfig {
            feed_url: self.feed_url.clone(),
            detail_path_marker: self.detail_path_marker.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            identities: Identity::default_pool(&self.referer),
        }
    }

    /// Server-side feed filters. Price bounds are pushed to the source too,
    /// but the local chain re-checks them against the canonical UAH price.
    pub fn feed_query(&self) -> FeedQuery {
        FeedQuery {
            category_id: self.category_id,
            price_from: self.min_price_uah,
            price_to: self.max_price_uah,
            search: self.search.clone(),
            ..FeedQuery::default()
        }
    }

    pub fn acquire_pacing(&self) -> Pacing {
        Pacing::from_secs(self.acquire_pause_secs)
    }

    pub fn enrich_item_pacing(&self) -> Pacing {
        Pacing::from_secs(self.enrich_item_pause_secs)
    }

    pub fn enrich_batch_pacing(&self) -> Pacing {
        Pacing::from_secs(self.enrich_batch_pause_secs)
    }

    pub fn reap_pacing(&self) -> Pacing {
        Pacing::from_secs(self.reap_pause_secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.retention_hours.max(0))
    }
}

/// Uniform jitter window for pauses between cycles, batches, and items, so the
/// request cadence never settles into a fixed rhythm.
#[derive(Debug, Clone, Copy)]
pub struct Pacing {
    min: Duration,
    max: Duration,
}

impl Pacing {
    pub fn new(min: Duration, max: Duration) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    pub fn from_secs((min, max): (u64, u64)) -> Self {
        Self::new(Duration::from_secs(min), Duration::from_secs(max))
    }

    pub fn pick(&self) -> Duration {
        let min = self.min.as_millis() as u64;
        let max = self.max.as_millis() as u64;
        if min == max {
            return self.min;
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

/// Cooperative shutdown signal. Loops check it between pages/items and inside
/// pacing sleeps; an in-flight item always runs to completion first.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

#[derive(Debug)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

pub fn shutdown_channel() -> (ShutdownHandle, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, Shutdown { rx })
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Sleep for `duration`, returning `true` if shutdown fired first. A
    /// dropped handle counts as a trigger.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        if self.is_triggered() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.rx.changed() => true,
        }
    }
}
