//! HTTP client for the remote marketplace: feed pages, detail pages, and
//! request-identity rotation.

pub mod extract;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use reqwest::header;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "adwatch-source";

/// One browser-shaped header set. A request picks one uniformly at random so
/// consecutive fetches do not share a fingerprint.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_agent: String,
    pub accept_language: String,
    pub referer: String,
}

impl Identity {
    pub fn default_pool(referer: &str) -> Vec<Identity> {
        const USER_AGENTS: [&str; 4] = [
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:109.0) Gecko/20100101 Firefox/115.0",
            "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/118.0.0.0 Safari/537.36",
        ];
        USER_AGENTS
            .iter()
            .map(|ua| Identity {
                user_agent: ua.to_string(),
                accept_language: "uk-UA,uk;q=0.9,en-US;q=0.8,en;q=0.7".to_string(),
                referer: referer.to_string(),
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Paginated feed endpoint returning offer records as JSON.
    pub feed_url: String,
    /// Substring every canonical detail URL contains. A redirect whose final
    /// URL lacks it means the listing is gone.
    pub detail_path_marker: String,
    pub timeout: Duration,
    pub identities: Vec<Identity>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            feed_url: "https://www.olx.ua/api/v1/offers".to_string(),
            detail_path_marker: "obyavlenie".to_string(),
            timeout: Duration::from_secs(15),
            identities: Identity::default_pool("https://www.olx.ua/"),
        }
    }
}

/// Server-side feed filters sent as query parameters.
#[derive(Debug, Clone)]
pub struct FeedQuery {
    pub limit: u32,
    pub category_id: Option<i64>,
    pub price_from: Option<i64>,
    pub price_to: Option<i64>,
    pub search: Option<String>,
    pub sort_by: String,
}

impl Default for FeedQuery {
    fn default() -> Self {
        Self {
            limit: 50,
            category_id: None,
            price_from: None,
            price_to: None,
            search: None,
            sort_by: "created_at:desc".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed rate limited (HTTP {status})")]
    RateLimited { status: u16 },
    #[error("feed returned HTTP {status}")]
    Status { status: u16 },
    #[error("feed request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("feed payload malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum DetailError {
    #[error("detail page not found")]
    NotFound,
    #[error("detail request redirected off-pattern to {final_url}")]
    Redirected { final_url: String },
    #[error("detail page returned HTTP {status}")]
    Status { status: u16 },
    #[error("detail request failed: {0}")]
    Network(#[from] reqwest::Error),
}

impl DetailError {
    /// Whether the source authoritatively no longer serves this listing.
    pub fn is_gone(&self) -> bool {
        matches!(self, DetailError::NotFound | DetailError::Redirected { .. })
    }
}

#[derive(Debug, Clone, Deserialize)]
struct FeedPage {
    #[serde(default)]
    data: Vec<RawOffer>,
}

/// One offer record as the feed serves it; every field beyond the id is
/// optional so a sparse record deserializes instead of failing the page.
#[derive(Debug, Clone, Deserialize)]
pub struct RawOffer {
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub category: Option<RawCategory>,
    #[serde(default)]
    pub price: Option<RawPrice>,
    #[serde(default)]
    pub params: Vec<RawParam>,
    #[serde(default)]
    pub photos: Vec<RawPhoto>,
    #[serde(default)]
    pub location: Option<RawLocation>,
    #[serde(default)]
    pub created_time: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawCategory {
    #[serde(default)]
    pub id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPrice {
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub converted_value: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawParam {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub value: JsonValue,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawPhoto {
    #[serde(default)]
    pub link: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawLocation {
    #[serde(default)]
    pub label: Option<String>,
}

impl RawOffer {
    /// The price object, wherever the feed hid it: the top-level field, or a
    /// params entry keyed `price`.
    pub fn price(&self) -> Option<RawPrice> {
        if let Some(price) = &self.price {
            return Some(price.clone());
        }
        self.params
            .iter()
            .find(|p| p.key.as_deref() == Some("price"))
            .and_then(|p| serde_json::from_value(p.value.clone()).ok())
    }

    pub fn first_photo(&self) -> Option<&str> {
        self.photos.iter().find_map(|p| p.link.as_deref())
    }

    pub fn location_label(&self) -> Option<&str> {
        self.location.as_ref().and_then(|l| l.label.as_deref())
    }
}

fn id_from_string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(i64),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(text) => text,
        Raw::Number(number) => number.to_string(),
    })
}

/// Rewrite the feed's `{width}`/`{height}` placeholder tokens in a photo URL.
pub fn resolve_photo_url(link: &str, width: u32, height: u32) -> String {
    link.replace("{width}", &width.to_string())
        .replace("{height}", &height.to_string())
}

#[derive(Debug, Clone)]
pub struct DetailDocument {
    pub requested_url: String,
    pub final_url: String,
    pub html: String,
}

/// Feed-page fetching seam, implemented by [`SourceClient`] and by test stubs.
#[async_trait]
pub trait FeedFetch: Send + Sync {
    async fn fetch_listing_page(
        &self,
        offset: u32,
        query: &FeedQuery,
    ) -> Result<Vec<RawOffer>, FeedError>;
}

/// Detail-page fetching seam.
#[async_trait]
pub trait DetailFetch: Send + Sync {
    async fn fetch_detail(&self, url: &str) -> Result<DetailDocument, DetailError>;
}

#[derive(Debug)]
pub struct SourceClient {
    client: reqwest::Client,
    config: SourceConfig,
}

impl SourceClient {
    pub fn new(config: SourceConfig) -> Result<Self, FeedError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()?;
        Ok(Self { client, config })
    }

    fn identity(&self) -> Identity {
        self.config
            .identities
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_else(|| Identity {
                user_agent: "Mozilla/5.0".to_string(),
                accept_language: "uk-UA,uk;q=0.9".to_string(),
                referer: String::new(),
            })
    }
}

#[async_trait]
impl FeedFetch for SourceClient {
    async fn fetch_listing_page(
        &self,
        offset: u32,
        query: &FeedQuery,
    ) -> Result<Vec<RawOffer>, FeedError> {
        let mut params: Vec<(&str, String)> = vec![
            ("offset", offset.to_string()),
            ("limit", query.limit.to_string()),
            ("sort_by", query.sort_by.clone()),
        ];
        if let Some(category_id) = query.category_id {
            params.push(("category_id", category_id.to_string()));
        }
        if let Some(from) = query.price_from {
            params.push(("filter_float_price:from", from.to_string()));
        }
        if let Some(to) = query.price_to {
            params.push(("filter_float_price:to", to.to_string()));
        }
        if let Some(search) = query.search.as_deref().filter(|s| !s.is_empty()) {
            params.push(("q", search.to_string()));
        }

        let identity = self.identity();
        let response = self
            .client
            .get(&self.config.feed_url)
            .query(&params)
            .header(header::USER_AGENT, &identity.user_agent)
            .header(header::ACCEPT, "application/json")
            .header(header::ACCEPT_LANGUAGE, &identity.accept_language)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(FeedError::RateLimited {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(FeedError::Status {
                status: status.as_u16(),
            });
        }

        let body = response.text().await?;
        let page: FeedPage = serde_json::from_str(&body)?;
        debug!(offset, offers = page.data.len(), "feed page fetched");
        Ok(page.data)
    }
}

#[async_trait]
impl DetailFetch for SourceClient {
    async fn fetch_detail(&self, url: &str) -> Result<DetailDocument, DetailError> {
        let identity = self.identity();
        let response = self
            .client
            .get(url)
            .header(header::USER_AGENT, &identity.user_agent)
            .header(
                header::ACCEPT,
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            )
            .header(header::ACCEPT_LANGUAGE, &identity.accept_language)
            .header(header::REFERER, &identity.referer)
            .send()
            .await?;

        let status = response.status();
        let final_url = response.url().to_string();

        if status.as_u16() == 404 {
            return Err(DetailError::NotFound);
        }
        if is_off_pattern_redirect(url, &final_url, &self.config.detail_path_marker) {
            return Err(DetailError::Redirected { final_url });
        }
        if !status.is_success() {
            return Err(DetailError::Status {
                status: status.as_u16(),
            });
        }

        let html = response.text().await?;
        Ok(DetailDocument {
            requested_url: url.to_string(),
            final_url,
            html,
        })
    }
}

/// A detail fetch that landed somewhere other than a canonical detail URL is
/// the source's way of saying the listing is gone.
pub fn is_off_pattern_redirect(requested: &str, final_url: &str, marker: &str) -> bool {
    final_url != requested && !final_url.contains(marker)
}
