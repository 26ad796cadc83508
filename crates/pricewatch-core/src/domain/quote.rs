//! Competitor quotes extracted from the site's `price_items` payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// Raw price as the API sent it. Text prices may carry thousands separators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QuotePrice {
    Number(f64),
    Text(String),
}

impl QuotePrice {
    /// Whitespace-insensitive numeric coercion; `None` when not a finite number.
    pub fn coerce(&self) -> Option<f64> {
        let value = match self {
            QuotePrice::Number(n) => *n,
            QuotePrice::Text(s) => {
                let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
                if compact.is_empty() {
                    return None;
                }
                compact.parse::<f64>().ok()?
            }
        };
        value.is_finite().then_some(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompetitorQuote {
    pub competitor_id: String,
    pub price: QuotePrice,
}

impl CompetitorQuote {
    pub fn new(competitor_id: impl Into<String>, price: f64) -> Self {
        Self {
            competitor_id: competitor_id.into(),
            price: QuotePrice::Number(price),
        }
    }
}

/// Which `price_items` entries count as competitor listings.
#[derive(Debug, Clone)]
pub struct ListingFilter {
    /// Required `art_type_id`.
    pub listing_type: i64,
    /// Entries whose `sys_info.search_comment` mentions this (case-insensitive) are dropped.
    pub excluded_region: String,
}

impl ListingFilter {
    fn is_listing(&self, item: &Value) -> bool {
        let Some(kind) = item.get("art_type_id") else {
            return false;
        };
        let n = match kind {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        n == Some(self.listing_type as f64)
    }

    fn is_allowed_region(&self, item: &Value) -> bool {
        let comment = match item.pointer("/sys_info/search_comment") {
            None | Some(Value::Null) => return true,
            Some(Value::String(s)) => s.to_lowercase(),
            Some(other) => other.to_string().to_lowercase(),
        };
        !comment.contains(&self.excluded_region.to_lowercase())
    }
}

/// Filters `price_items` down to usable competitor quotes, preserving input order.
pub fn extract_quotes(items: &[Value], filter: &ListingFilter) -> Vec<CompetitorQuote> {
    items
        .iter()
        .filter(|item| filter.is_listing(item))
        .filter(|item| filter.is_allowed_region(item))
        .filter_map(|item| {
            let id = first_present(item, &["price_id", "id"]).and_then(stringify_id)?;
            let price = match first_present(item, &["cost", "price"])? {
                Value::Number(n) => QuotePrice::Number(n.as_f64()?),
                Value::String(s) => QuotePrice::Text(s.clone()),
                _ => return None,
            };
            Some(CompetitorQuote {
                competitor_id: id,
                price,
            })
        })
        .collect()
}

/// First `sys_info.goods_img_url` among all items, resolved against `base`.
pub fn find_image_url(items: &[Value], base: &Url) -> Option<Url> {
    items
        .iter()
        .filter_map(|item| item.pointer("/sys_info/goods_img_url"))
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|s| !s.is_empty())
        .and_then(|raw| base.join(raw).ok())
}

fn first_present<'a>(item: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| item.get(*k))
        .find(|v| !v.is_null())
}

fn stringify_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => match (n.as_i64(), n.as_u64()) {
            (Some(i), _) => Some(i.to_string()),
            (_, Some(u)) => Some(u.to_string()),
            _ => n.as_f64().map(|f| {
                if f.fract() == 0.0 && f.abs() < 1e15 {
                    format!("{}", f as i64)
                } else {
                    f.to_string()
                }
            }),
        },
        _ => None,
    }
}
