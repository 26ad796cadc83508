//! Ranking - 自社価格の順位付け（純粋関数）
//!
//! # アルゴリズム
//! 1. 価格を数値に正規化（空白を除去して parse、非有限値は捨てる）
//! 2. 価格の昇順で安定ソートし、1..N の順位を振る
//! 3. 自社 id の位置から leader / over（一つ上）/ under（一つ下）を決める
//!
//! 同値の場合は入力順を保つ（`sort_by` は安定ソート）。

use super::quote::CompetitorQuote;
use super::ranked::{Field, RankedRow, WE_ARE_LAST, WE_LEAD};

/// Ranks `our_id` against `quotes` and builds the summary row.
///
/// Returns [`RankedRow::no_listing`] when no quote survives coercion or when
/// our id is not among them; never a partial row.
pub fn rank(
    quotes: &[CompetitorQuote],
    our_id: &str,
    part_number: &str,
    brand_name: &str,
) -> RankedRow {
    let mut ranked: Vec<(&str, f64)> = quotes
        .iter()
        .filter_map(|q| q.price.coerce().map(|p| (q.competitor_id.as_str(), p)))
        .collect();
    ranked.sort_by(|a, b| a.1.total_cmp(&b.1));

    let Some(our_idx) = ranked.iter().position(|(id, _)| *id == our_id) else {
        return RankedRow::no_listing(part_number, brand_name);
    };

    let (_, our_price) = ranked[our_idx];
    let last_idx = ranked.len() - 1;
    let mut row = RankedRow::empty(part_number, brand_name);
    row.rank_pos = Some(Field::Number((our_idx + 1) as f64));
    row.our_price = Some(Field::Number(our_price));

    let (leader_id, leader_price) = ranked[0];
    row.leader_code = Some(leader_id.to_string());
    row.leader_price = Some(Field::Number(leader_price));

    if our_idx == 0 {
        row.over_code = Some(WE_LEAD.to_string());
        row.over_price = Some(Field::text(WE_LEAD));
    } else {
        let (id, price) = ranked[our_idx - 1];
        row.over_code = Some(id.to_string());
        row.over_price = Some(Field::Number(price));
    }

    if our_idx == last_idx {
        row.under_code = Some(WE_ARE_LAST.to_string());
        row.under_price = Some(Field::text(WE_ARE_LAST));
    } else {
        let (id, price) = ranked[our_idx + 1];
        row.under_code = Some(id.to_string());
        row.under_price = Some(Field::Number(price));
    }

    row
}
