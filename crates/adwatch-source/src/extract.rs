//! Dual-strategy field extraction from a listing detail document.
//!
//! The primary strategy decodes the application-state block the page embeds
//! for hydration; the fallback scrapes the rendered HTML and is only consulted
//! when the block is absent or undecodable.

use std::collections::BTreeMap;

use scraper::{Html, Selector};
use serde_json::Value as JsonValue;

use crate::resolve_photo_url;

/// Marker prefixes of the embedded state block, with and without a space
/// before the assignment.
const STATE_MARKERS: [&str; 2] = [
    "window.__PRERENDERED_STATE__=",
    "window.__PRERENDERED_STATE__ =",
];

/// Literal markers the fallback searches for. Status fragments first, then the
/// human-visible "no longer available" phrases.
const ACTIVE_MARKER: &str = r#""status":"active""#;
const CLOSED_MARKERS: [&str; 2] = [r#""status":"closed""#, r#""status":"removed""#];
const UNAVAILABLE_PHRASES: [&str; 2] = [
    "Це оголошення більше не доступне",
    "Оголошення неактивне",
];

const DESCRIPTION_LIMIT: usize = 500;
const PHOTO_WIDTH: u32 = 1000;
const PHOTO_HEIGHT: u32 = 750;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Structured,
    Fallback,
}

/// Fields recovered from a detail document. `None` means the strategy could
/// not see that field, not that the field is empty; callers patch the store
/// with only the `Some` values.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub is_active: bool,
    pub description: Option<String>,
    pub full_description: Option<String>,
    pub seller_name: Option<String>,
    pub params: Option<BTreeMap<String, String>>,
    pub photos: Option<Vec<String>>,
    pub strategy: Strategy,
}

/// Run both strategies in rank order. `None` means neither produced a verdict
/// and the document should be retried later without touching stored content.
pub fn extract_detail(html: &str) -> Option<Extraction> {
    structured(html).or_else(|| fallback(html))
}

/// Locate the state block's exact extent: scan forward from the marker to the
/// first `{`, then track brace nesting depth until it returns to zero.
pub fn state_block(html: &str) -> Option<&str> {
    let marker_at = STATE_MARKERS
        .iter()
        .find_map(|marker| html.find(marker).map(|at| at + marker.len()))?;
    let rest = &html[marker_at..];
    let open = rest.find('{')?;

    let mut depth = 0usize;
    for (offset, ch) in rest[open..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(&rest[open..open + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

fn structured(html: &str) -> Option<Extraction> {
    let block = state_block(html)?;
    let state: JsonValue = serde_json::from_str(block).ok()?;
    let ad = state.get("ad")?.get("ad")?;
    if !ad.is_object() || ad.as_object().is_some_and(|o| o.is_empty()) {
        return None;
    }

    let full_description = ad
        .get("description")
        .and_then(JsonValue::as_str)
        .unwrap_or_default()
        .to_string();
    let is_active = ad.get("status").and_then(JsonValue::as_str) == Some("active");
    let seller_name = ad
        .get("user")
        .and_then(|u| u.get("name"))
        .and_then(JsonValue::as_str)
        .unwrap_or("Unknown")
        .to_string();

    let mut params = BTreeMap::new();
    if let Some(entries) = ad.get("params").and_then(JsonValue::as_array) {
        for entry in entries {
            let name = entry
                .get("name")
                .and_then(JsonValue::as_str)
                .or_else(|| entry.get("key").and_then(JsonValue::as_str));
            let value = entry
                .get("value")
                .and_then(|v| v.get("label"))
                .and_then(JsonValue::as_str);
            if let (Some(name), Some(value)) = (name, value) {
                params.insert(name.to_string(), value.to_string());
            }
        }
    }

    let photos = ad
        .get("photos")
        .and_then(JsonValue::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|p| p.get("link").and_then(JsonValue::as_str))
                .map(|link| resolve_photo_url(link, PHOTO_WIDTH, PHOTO_HEIGHT))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    Some(Extraction {
        is_active,
        description: Some(truncate(&full_description)),
        full_description: Some(full_description),
        seller_name: Some(seller_name),
        params: Some(params),
        photos: Some(photos),
        strategy: Strategy::Structured,
    })
}

/// Literal-marker fallback. Yields a verdict only when the document carries
/// some status signal. Seller defaults to "Unknown" and the photo list to
/// empty; params stay `None` so a degraded pass does not erase attributes a
/// structured pass captured earlier.
fn fallback(html: &str) -> Option<Extraction> {
    let is_active = if html.contains(ACTIVE_MARKER) {
        true
    } else if CLOSED_MARKERS.iter().any(|m| html.contains(m))
        || UNAVAILABLE_PHRASES.iter().any(|p| html.contains(p))
    {
        false
    } else {
        return None;
    };

    let full_description = fallback_description(html);
    Some(Extraction {
        is_active,
        description: full_description.as_deref().map(truncate),
        full_description,
        seller_name: Some("Unknown".to_string()),
        params: None,
        photos: Some(Vec::new()),
        strategy: Strategy::Fallback,
    })
}

/// Tolerant match against the known description container, markup stripped.
fn fallback_description(html: &str) -> Option<String> {
    let selector = Selector::parse(r#"[data-cy="ad_description"]"#).ok()?;
    let document = Html::parse_document(html);
    let container = document.select(&selector).next()?;
    let text = container
        .text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= DESCRIPTION_LIMIT {
        text.to_string()
    } else {
        let mut short: String = text.chars().take(DESCRIPTION_LIMIT).collect();
        short.push_str("...");
        short
    }
}
