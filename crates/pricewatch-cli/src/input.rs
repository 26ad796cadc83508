//! CSV input adapter.
//!
//! ヘッダー行は先頭 10 行から、ローカライズされた列名で探す。見つからなければ
//! 1 列目 = 品番、2 列目 = ブランドとみなし、1 行目はヘッダーとして読み飛ばす。

use std::path::Path;

use anyhow::{Context, Result};
use csv::{ReaderBuilder, StringRecord, Trim};
use pricewatch_core::domain::InputRow;
use tracing::info;

pub const PART_HEADERS: [&str; 9] = [
    "артикул",
    "арт",
    "part",
    "part number",
    "номер детали",
    "код товара",
    "pn",
    "sku",
    "код",
];

pub const BRAND_HEADERS: [&str; 6] = ["бренд", "брэнд", "brand", "марка", "производитель", "oem"];

const HEADER_SCAN_ROWS: usize = 10;

/// Where the data starts and which columns hold part and brand (0-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub header_row: usize,
    pub part_col: usize,
    pub brand_col: usize,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            header_row: 0,
            part_col: 0,
            brand_col: 1,
        }
    }
}

pub fn read_rows(path: &Path) -> Result<Vec<InputRow>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading input {}", path.display()))?;
    parse_rows(&raw).with_context(|| format!("parsing input {}", path.display()))
}

pub fn parse_rows(raw: &str) -> Result<Vec<InputRow>> {
    let raw = raw.trim_start_matches('\u{feff}');
    let delimiter = sniff_delimiter(raw.lines().next().unwrap_or(""));
    let records = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .delimiter(delimiter)
        .from_reader(raw.as_bytes())
        .into_records()
        .collect::<Result<Vec<StringRecord>, _>>()?;

    let layout = detect_layout(&records);
    info!(
        header_row = layout.header_row + 1,
        part_col = layout.part_col + 1,
        brand_col = layout.brand_col + 1,
        "input layout"
    );

    let rows: Vec<InputRow> = records
        .iter()
        .skip(layout.header_row + 1)
        .filter_map(|record| {
            let part = record.get(layout.part_col).unwrap_or("");
            let brand = record.get(layout.brand_col).unwrap_or("");
            InputRow::new(part, brand).normalized()
        })
        .collect();
    info!(rows = rows.len(), "input parsed");
    Ok(rows)
}

/// First row among the leading rows naming both a part and a brand column.
pub fn detect_layout(records: &[StringRecord]) -> Layout {
    records
        .iter()
        .take(HEADER_SCAN_ROWS)
        .enumerate()
        .find_map(|(row, record)| {
            let cells: Vec<String> = record.iter().map(normalize_header).collect();
            let part_col = cells.iter().position(|c| PART_HEADERS.contains(&c.as_str()))?;
            let brand_col = cells.iter().position(|c| BRAND_HEADERS.contains(&c.as_str()))?;
            Some(Layout {
                header_row: row,
                part_col,
                brand_col,
            })
        })
        .unwrap_or_default()
}

fn normalize_header(cell: &str) -> String {
    cell.trim().to_lowercase()
}

/// Spreadsheet exports in ru locales use `;`.
fn sniff_delimiter(first_line: &str) -> u8 {
    let semicolons = first_line.matches(';').count();
    let commas = first_line.matches(',').count();
    if semicolons > commas { b';' } else { b',' }
}
