//! CSV report parsing for portals that only offer downloads.
//!
//! Portals export in whatever encoding their backend happens to use, so the
//! decoder tries UTF-8, UTF-8 with BOM, then Shift-JIS.

use std::path::Path;

use chrono::NaiveDate;
use tracing::debug;

use crate::error::EngineError;
use crate::parse::{parse_amount, parse_date, parse_period};
use crate::types::{Record, TargetTable, TemporalKey};

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Read a downloaded CSV and produce records. Column names are matched by
/// whitespace-stripped substring; when a named column is missing, the first
/// column is assumed to be the date and the last the amount.
pub fn read_csv_records(
    path: &Path,
    date_column: &str,
    amount_column: &str,
    target: TargetTable,
    today: NaiveDate,
) -> Result<Vec<Record>, EngineError> {
    let bytes = std::fs::read(path)
        .map_err(|e| EngineError::ActionFatal(format!("read {}: {e}", path.display())))?;
    let text = decode_bytes(&bytes);
    Ok(parse_csv_text(&text, date_column, amount_column, target, today))
}

/// Decode raw CSV bytes: UTF-8 (with or without BOM) first, Shift-JIS as
/// the fallback.
pub fn decode_bytes(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            let (decoded, _, _) = encoding_rs::SHIFT_JIS.decode(bytes);
            decoded.into_owned()
        }
    }
}

pub fn parse_csv_text(
    text: &str,
    date_column: &str,
    amount_column: &str,
    target: TargetTable,
    today: NaiveDate,
) -> Vec<Record> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = match reader.headers() {
        Ok(h) => h.iter().map(|s| s.to_string()).collect(),
        Err(_) => return Vec::new(),
    };
    let date_idx = find_column(&headers, date_column).unwrap_or(0);
    let amount_idx =
        find_column(&headers, amount_column).unwrap_or(headers.len().saturating_sub(1));
    debug!(?headers, date_idx, amount_idx, "csv columns resolved");

    let mut records = Vec::new();
    for row in reader.records() {
        let Ok(row) = row else { continue };
        let Some(date_cell) = row.get(date_idx) else { continue };
        if date_cell.contains("合計") {
            continue;
        }
        let key = match target {
            TargetTable::Daily => parse_date(date_cell, today).map(TemporalKey::Day),
            TargetTable::Monthly => {
                parse_period(date_cell, today).map(|(year, month)| TemporalKey::Month { year, month })
            }
        };
        let Some(key) = key else { continue };
        let amount = row.get(amount_idx).map(parse_amount).unwrap_or(0);
        records.push(Record { key, amount });
    }
    records
}

fn find_column(headers: &[String], wanted: &str) -> Option<usize> {
    let wanted: String = wanted.chars().filter(|c| !c.is_whitespace()).collect();
    if wanted.is_empty() {
        return None;
    }
    headers.iter().position(|h| {
        let h: String = h.chars().filter(|c| !c.is_whitespace()).collect();
        h.contains(&wanted)
    })
}
