//! Rendered-table extraction.
//!
//! Report tables come back from the browser as HTML fragments. The cell
//! parser here is deliberately naive string slicing tailored to portal
//! markup; the interesting part is the amount-column detection, which has to
//! work across dozens of portals that agree on neither header wording nor
//! column order.

use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use tracing::debug;

use crate::parse::{is_weekday_token, parse_amount, parse_date, parse_month_number, parse_period};
use crate::types::{Record, TargetTable, TemporalKey};

/// Header phrases that reliably mark the reward column when nothing better
/// is known. Checked by substring against whitespace-stripped header text.
const KNOWN_AMOUNT_HEADERS: &[&str] = &[
    "確定報酬額",
    "報酬金額合計",
    "報酬合計",
    "発生報酬",
    "確定報酬",
    "承認報酬",
];

/// How many data rows the value-magnitude heuristic samples.
const MAGNITUDE_SAMPLE_ROWS: usize = 5;

/// Extract records from candidate tables, in document order. The first
/// table that yields at least one valid record wins; later candidates are
/// never merged in.
pub fn extract_from_tables(
    tables_html: &[String],
    target: TargetTable,
    amount_hint: Option<&str>,
    horizontal: bool,
    today: NaiveDate,
) -> Vec<Record> {
    for (idx, html) in tables_html.iter().enumerate() {
        let rows = parse_table_cells(html);
        if rows.is_empty() {
            continue;
        }
        let records = if horizontal {
            extract_horizontal(&rows, today)
        } else {
            extract_vertical(&rows, target, amount_hint, today)
        };
        if !records.is_empty() {
            debug!(table = idx, rows = records.len(), "table yielded records");
            return records;
        }
    }
    Vec::new()
}

/// Split a table fragment into rows of trimmed cell text. Nested markup is
/// stripped; `td` and `th` cells are kept in document order.
pub fn parse_table_cells(html: &str) -> Vec<Vec<String>> {
    let lc = ascii_lowercase(html);
    let mut rows = Vec::new();
    let mut pos = 0;

    while let Some((inner_start, inner_end)) = next_block(&lc, "<tr", "</tr", pos) {
        let row_html = &html[inner_start..inner_end];
        let row_lc = &lc[inner_start..inner_end];
        let mut cells = Vec::new();
        let mut cpos = 0;
        loop {
            let td = next_block(row_lc, "<td", "</td", cpos);
            let th = next_block(row_lc, "<th", "</th", cpos);
            let (start, end) = match (td, th) {
                (Some(a), Some(b)) => {
                    if a.0 <= b.0 {
                        a
                    } else {
                        b
                    }
                }
                (Some(a), None) => a,
                (None, Some(b)) => b,
                (None, None) => break,
            };
            cells.push(cell_text(&row_html[start..end]));
            cpos = end;
        }
        if !cells.is_empty() {
            rows.push(cells);
        }
        pos = inner_end;
    }
    rows
}

/// Find the next `open`..`close` block at or after `from` and return the
/// byte range of its inner content.
fn next_block(lc: &str, open: &str, close: &str, from: usize) -> Option<(usize, usize)> {
    let start = lc.get(from..)?.find(open)? + from;
    let inner_start = lc[start..].find('>')? + start + 1;
    let inner_end = lc[inner_start..].find(close)? + inner_start;
    Some((inner_start, inner_end))
}

fn ascii_lowercase(s: &str) -> String {
    s.chars().map(|c| c.to_ascii_lowercase()).collect()
}

fn cell_text(inner: &str) -> String {
    let mut out = String::with_capacity(inner.len());
    let mut in_tag = false;
    for ch in inner.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    let out = out
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&yen;", "¥");
    normalize_ws(&out)
}

fn normalize_ws(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_space = false;
    for ch in s.chars() {
        if ch.is_whitespace() {
            if !prev_space {
                out.push(' ');
            }
            prev_space = true;
        } else {
            out.push(ch);
            prev_space = false;
        }
    }
    out.trim().to_string()
}

/// Header text normalization for matching: all whitespace stripped,
/// including full-width spaces.
fn normalize_header(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

fn parse_key(cell: &str, target: TargetTable, today: NaiveDate) -> Option<TemporalKey> {
    match target {
        TargetTable::Daily => parse_date(cell, today).map(TemporalKey::Day),
        TargetTable::Monthly => {
            parse_period(cell, today).map(|(year, month)| TemporalKey::Month { year, month })
        }
    }
}

/// Date cell of one row: the detected date column, or, when that column
/// holds only a weekday marker, the first date-bearing column after it
/// (weekday + date two-column layouts).
fn row_key(
    row: &[String],
    date_col: usize,
    target: TargetTable,
    today: NaiveDate,
) -> Option<TemporalKey> {
    let cell = row.get(date_col)?;
    if let Some(key) = parse_key(cell, target, today) {
        return Some(key);
    }
    if is_weekday_token(cell) {
        return row[date_col + 1..]
            .iter()
            .find_map(|c| parse_key(c, target, today));
    }
    None
}

fn extract_vertical(
    rows: &[Vec<String>],
    target: TargetTable,
    amount_hint: Option<&str>,
    today: NaiveDate,
) -> Vec<Record> {
    // First row carrying a parseable date/period is the first data row;
    // everything above it is header.
    let located = rows.iter().enumerate().find_map(|(i, row)| {
        row.iter()
            .position(|cell| {
                parse_key(cell, target, today).is_some()
                    || (is_weekday_token(cell)
                        && row.iter().any(|c| parse_key(c, target, today).is_some()))
            })
            .map(|col| (i, col))
    });
    let Some((first_data_row, date_col)) = located else {
        return Vec::new();
    };

    let header_rows = &rows[..first_data_row];
    let data_rows = &rows[first_data_row..];
    let Some(amount_col) = detect_amount_column(header_rows, data_rows, date_col, target, amount_hint)
    else {
        return Vec::new();
    };

    let mut records = Vec::new();
    for row in data_rows {
        let Some(key) = row_key(row, date_col, target, today) else {
            // Sub-header noise, device breakdown rows, totals.
            continue;
        };
        let amount = row.get(amount_col).map(|c| parse_amount(c)).unwrap_or(0);
        records.push(Record { key, amount });
    }
    records
}

/// Pick the amount column. Priority: explicit header hint, then (daily
/// only) the column with the largest sampled numeric sum, then known header
/// phrases.
fn detect_amount_column(
    header_rows: &[Vec<String>],
    data_rows: &[Vec<String>],
    date_col: usize,
    target: TargetTable,
    amount_hint: Option<&str>,
) -> Option<usize> {
    if let Some(hint) = amount_hint {
        let hint = normalize_header(hint);
        if !hint.is_empty() {
            if let Some(col) = find_header_column(header_rows, |h| h.contains(&hint)) {
                return Some(col);
            }
        }
    }

    if target == TargetTable::Daily {
        if let Some(col) = largest_numeric_column(data_rows, date_col) {
            return Some(col);
        }
    }

    find_header_column(header_rows, |h| {
        KNOWN_AMOUNT_HEADERS.iter().any(|phrase| h.contains(phrase))
    })
}

fn find_header_column(header_rows: &[Vec<String>], pred: impl Fn(&str) -> bool) -> Option<usize> {
    for row in header_rows {
        for (i, cell) in row.iter().enumerate() {
            if pred(&normalize_header(cell)) {
                return Some(i);
            }
        }
    }
    None
}

/// The reward-total column is reliably the largest numeric column even when
/// header text varies by portal: sum the first few data rows per column and
/// take the maximum.
fn largest_numeric_column(data_rows: &[Vec<String>], date_col: usize) -> Option<usize> {
    let width = data_rows.iter().map(Vec::len).max().unwrap_or(0);
    let mut best: Option<(usize, i64)> = None;
    for col in 0..width {
        if col == date_col {
            continue;
        }
        let sum: i64 = data_rows
            .iter()
            .take(MAGNITUDE_SAMPLE_ROWS)
            .filter_map(|row| row.get(col))
            .map(|cell| parse_amount(cell))
            .sum();
        if sum > 0 && best.map(|(_, s)| sum > s).unwrap_or(true) {
            best = Some((col, sum));
        }
    }
    best.map(|(col, _)| col)
}

static YEAR_MARKER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{4})\s*年$").unwrap());

/// Horizontal layout: a row holding a year marker, followed by a month row
/// and an amount row, read column by column.
fn extract_horizontal(rows: &[Vec<String>], today: NaiveDate) -> Vec<Record> {
    for (i, row) in rows.iter().enumerate() {
        let Some(year) = row
            .iter()
            .find_map(|c| YEAR_MARKER.captures(c.trim()))
            .and_then(|c| c[1].parse::<i32>().ok())
        else {
            continue;
        };
        let (Some(months), Some(amounts)) = (rows.get(i + 1), rows.get(i + 2)) else {
            continue;
        };

        let mut records = Vec::new();
        for (col, cell) in months.iter().enumerate() {
            let month = parse_month_number(cell)
                .or_else(|| parse_period(cell, today).map(|(_, m)| m));
            let (Some(month), Some(amount_cell)) = (month, amounts.get(col)) else {
                continue;
            };
            records.push(Record {
                key: TemporalKey::Month { year, month },
                amount: parse_amount(amount_cell),
            });
        }
        if !records.is_empty() {
            return records;
        }
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 11, 30).unwrap()
    }

    fn day(y: i32, m: u32, d: u32) -> TemporalKey {
        TemporalKey::Day(NaiveDate::from_ymd_opt(y, m, d).unwrap())
    }

    fn table(rows: &[&[&str]]) -> String {
        let mut html = String::from("<table><tbody>");
        for row in rows {
            html.push_str("<tr>");
            for cell in *row {
                html.push_str(&format!("<td>{cell}</td>"));
            }
            html.push_str("</tr>");
        }
        html.push_str("</tbody></table>");
        html
    }

    #[test]
    fn cell_parser_handles_th_nesting_and_entities() {
        let html = "<table><thead><tr><th>日付</th><th><span>発生&nbsp;報酬</span></th></tr></thead>\
                    <tbody><tr><td><b>2025/11/01</b></td><td>&yen;1,200</td></tr></tbody></table>";
        let rows = parse_table_cells(html);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], vec!["日付", "発生 報酬"]);
        assert_eq!(rows[1], vec!["2025/11/01", "¥1,200"]);
    }

    #[test]
    fn daily_table_with_known_headers_extracts_records() {
        let html = table(&[
            &["日付", "発生報酬"],
            &["2025/11/01", "¥1,200"],
            &["2025/11/02", "2,300円"],
        ]);
        let records =
            extract_from_tables(&[html], TargetTable::Daily, None, false, today());
        assert_eq!(
            records,
            vec![
                Record { key: day(2025, 11, 1), amount: 1200 },
                Record { key: day(2025, 11, 2), amount: 2300 },
            ]
        );
    }

    #[test]
    fn magnitude_heuristic_picks_largest_column_regardless_of_headers() {
        // Clicks are column 1, reward is column 2; headers are unhelpful.
        let html = table(&[
            &["日付", "A", "B"],
            &["2025/11/01", "31", "1,500"],
            &["2025/11/02", "44", "900"],
            &["2025/11/03", "12", "2,100"],
            &["2025/11/04", "55", "300"],
            &["2025/11/05", "29", "1,000"],
        ]);
        let records =
            extract_from_tables(&[html], TargetTable::Daily, None, false, today());
        assert_eq!(records[0].amount, 1500);
        assert_eq!(records[3].amount, 300);
        assert_eq!(records.len(), 5);
    }

    #[test]
    fn explicit_hint_beats_magnitude() {
        // The click column sums larger, but the hint names the small one.
        let html = table(&[
            &["日付", "クリック数", "確定報酬額　(税抜)"],
            &["2025/11/01", "9,999", "100"],
            &["2025/11/02", "9,999", "200"],
        ]);
        let records = extract_from_tables(
            &[html],
            TargetTable::Daily,
            Some("確定報酬額"),
            false,
            today(),
        );
        assert_eq!(records[0].amount, 100);
        assert_eq!(records[1].amount, 200);
    }

    #[test]
    fn weekday_date_two_column_layout_is_supported() {
        let html = table(&[
            &["曜日", "日付", "発生報酬"],
            &["(火)", "2025/11/25", "¥500"],
            &["(水)", "2025/11/26", "¥700"],
        ]);
        let records =
            extract_from_tables(&[html], TargetTable::Daily, None, false, today());
        assert_eq!(
            records,
            vec![
                Record { key: day(2025, 11, 25), amount: 500 },
                Record { key: day(2025, 11, 26), amount: 700 },
            ]
        );
    }

    #[test]
    fn totals_and_device_rows_are_dropped() {
        let html = table(&[
            &["日付", "発生報酬"],
            &["2025/11/01", "¥1,200"],
            &["PC", "¥800"],
            &["合計", "¥2,000"],
        ]);
        let records =
            extract_from_tables(&[html], TargetTable::Daily, None, false, today());
        assert_eq!(records, vec![Record { key: day(2025, 11, 1), amount: 1200 }]);
    }

    #[test]
    fn first_table_with_records_wins() {
        let filter_table = table(&[&["検索条件", "期間"]]);
        let data = table(&[&["日付", "報酬合計"], &["2025/11/01", "¥100"]]);
        let later = table(&[&["日付", "報酬合計"], &["2025/11/02", "¥999"]]);
        let records = extract_from_tables(
            &[filter_table, data, later],
            TargetTable::Daily,
            None,
            false,
            today(),
        );
        assert_eq!(records, vec![Record { key: day(2025, 11, 1), amount: 100 }]);
    }

    #[test]
    fn monthly_table_parses_periods() {
        let html = table(&[
            &["年月", "確定報酬額"],
            &["2025/01", "¥10,000"],
            &["2025/02", "¥12,000"],
        ]);
        let records =
            extract_from_tables(&[html], TargetTable::Monthly, None, false, today());
        assert_eq!(
            records,
            vec![
                Record { key: TemporalKey::Month { year: 2025, month: 1 }, amount: 10_000 },
                Record { key: TemporalKey::Month { year: 2025, month: 2 }, amount: 12_000 },
            ]
        );
    }

    #[test]
    fn horizontal_layout_reads_column_wise() {
        let html = table(&[
            &["2025年"],
            &["01月", "02月"],
            &["¥100", "¥200"],
        ]);
        let records =
            extract_from_tables(&[html], TargetTable::Monthly, None, true, today());
        assert_eq!(
            records,
            vec![
                Record { key: TemporalKey::Month { year: 2025, month: 1 }, amount: 100 },
                Record { key: TemporalKey::Month { year: 2025, month: 2 }, amount: 200 },
            ]
        );
    }

    #[test]
    fn no_parseable_rows_yields_empty_not_error() {
        let html = table(&[&["お知らせ", "内容"], &["メンテナンス", "実施中"]]);
        let records =
            extract_from_tables(&[html], TargetTable::Daily, None, false, today());
        assert!(records.is_empty());
    }
}
