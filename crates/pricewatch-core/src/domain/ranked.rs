//! RankedRow - 永続化される 1 行（part, brand ごと）
//!
//! 価格列と順位列は数値か業務向けのラベル（sentinel）のどちらかを持つ。
//! そのためストレージ側のカラムも数値・テキストの両方を受け付ける必要がある。

use serde::{Deserialize, Serialize};
use std::fmt;

/// Our id is absent from the quotes, or there are no usable quotes.
pub const NO_LISTING: &str = "no listing";
/// We hold rank 1; written to the over columns.
pub const WE_LEAD: &str = "we lead";
/// We hold the last rank; written to the under columns.
pub const WE_ARE_LAST: &str = "we are last";

/// A numeric-or-label cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Field {
    Number(f64),
    Text(String),
}

impl Field {
    pub fn text(s: &str) -> Self {
        Field::Text(s.to_string())
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Field::Number(n) => Some(*n),
            Field::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Field::Number(_) => None,
            Field::Text(s) => Some(s),
        }
    }
}

impl From<f64> for Field {
    fn from(n: f64) -> Self {
        Field::Number(n)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Number(n) => write!(f, "{n}"),
            Field::Text(s) => f.write_str(s),
        }
    }
}

/// Summary of our position among all competitor quotes for one (part, brand).
///
/// Codes are competitor ids or sentinel labels, so they are plain strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedRow {
    pub part_number: String,
    pub brand_name: String,
    pub rank_pos: Option<Field>,
    pub our_price: Option<Field>,
    pub leader_code: Option<String>,
    pub leader_price: Option<Field>,
    pub over_code: Option<String>,
    pub over_price: Option<Field>,
    pub under_code: Option<String>,
    pub under_price: Option<Field>,
}

impl RankedRow {
    /// Row with every value column empty.
    pub fn empty(part_number: impl Into<String>, brand_name: impl Into<String>) -> Self {
        Self {
            part_number: part_number.into(),
            brand_name: brand_name.into(),
            rank_pos: None,
            our_price: None,
            leader_code: None,
            leader_price: None,
            over_code: None,
            over_price: None,
            under_code: None,
            under_price: None,
        }
    }

    /// Row with every value column set to [`NO_LISTING`].
    pub fn no_listing(part_number: impl Into<String>, brand_name: impl Into<String>) -> Self {
        let label = Some(Field::text(NO_LISTING));
        let code = Some(NO_LISTING.to_string());
        Self {
            rank_pos: label.clone(),
            our_price: label.clone(),
            leader_code: code.clone(),
            leader_price: label.clone(),
            over_code: code.clone(),
            over_price: label.clone(),
            under_code: code,
            under_price: label,
            ..Self::empty(part_number, brand_name)
        }
    }

    pub fn is_no_listing(&self) -> bool {
        matches!(&self.rank_pos, Some(Field::Text(s)) if s == NO_LISTING)
    }
}
