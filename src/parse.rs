//! Date, period and amount parsing for portal report tables.
//!
//! Portals disagree on everything: ISO dates, slash dates, kanji dates, era
//! dates, weekday suffixes, yen signs, full-width yen signs, thousands
//! separators. Everything here is total: bad amounts become 0, bad dates
//! become `None`, never a panic.

use std::sync::LazyLock;

use chrono::{Datelike, NaiveDate};
use regex::Regex;

static WEEKDAY_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[（(][月火水木金土日][)）]").unwrap());
static DATE_YMD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{4})[-/](\d{1,2})[-/](\d{1,2})$").unwrap());
static DATE_KANJI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{4})年(\d{1,2})月(\d{1,2})日?$").unwrap());
static DATE_ERA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^令和(\d{1,2})年(\d{1,2})月(\d{1,2})日?$").unwrap());
static DATE_MD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{1,2})/(\d{1,2})$").unwrap());
static DATE_MD_KANJI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,2})月(\d{1,2})日?$").unwrap());

static PERIOD_YM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{4})[-/](\d{1,2})$").unwrap());
static PERIOD_KANJI: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{4})年(\d{1,2})月$").unwrap());
static PERIOD_BARE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{4})(\d{2})$").unwrap());
static PERIOD_MONTH_ONLY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{1,2})月$").unwrap());

static WEEKDAY_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[（(]?[月火水木金土日][)）]?(曜日?)?$").unwrap());

/// First year of the Reiwa era minus one, so 令和N年 = 2018 + N.
const REIWA_BASE_YEAR: i32 = 2018;

/// Parse an amount cell to integer yen. Strips currency glyphs, thousands
/// separators and whitespace, truncates fractions. Malformed input yields 0.
pub fn parse_amount(text: &str) -> i64 {
    let cleaned: String = text
        .chars()
        .filter(|c| !matches!(c, '¥' | '￥' | '$' | '円' | ',' | '\\') && !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return 0;
    }
    match cleaned.parse::<f64>() {
        Ok(v) if v.is_finite() => v.trunc() as i64,
        _ => 0,
    }
}

/// Parse a date cell. `today` supplies the year when the cell carries only
/// month and day. Unsupported formats yield `None`, never a wrong date.
pub fn parse_date(text: &str, today: NaiveDate) -> Option<NaiveDate> {
    let text = WEEKDAY_SUFFIX.replace_all(text.trim(), "");
    let text = text.trim();

    if let Some(c) = DATE_YMD.captures(text).or_else(|| DATE_KANJI.captures(text)) {
        return ymd(&c[1], &c[2], &c[3]);
    }
    if let Some(c) = DATE_ERA.captures(text) {
        let year = REIWA_BASE_YEAR + c[1].parse::<i32>().ok()?;
        return NaiveDate::from_ymd_opt(year, c[2].parse().ok()?, c[3].parse().ok()?);
    }
    if let Some(c) = DATE_MD.captures(text).or_else(|| DATE_MD_KANJI.captures(text)) {
        return NaiveDate::from_ymd_opt(today.year(), c[1].parse().ok()?, c[2].parse().ok()?);
    }
    None
}

/// Parse a monthly period cell to `(year, month)`. Month-only cells infer
/// the year from `today`; a year for such cells usually comes from a header
/// row and is applied by the table layer instead.
pub fn parse_period(text: &str, today: NaiveDate) -> Option<(i32, u32)> {
    let text = text.trim();
    if let Some(c) = PERIOD_YM
        .captures(text)
        .or_else(|| PERIOD_KANJI.captures(text))
        .or_else(|| PERIOD_BARE.captures(text))
    {
        let year: i32 = c[1].parse().ok()?;
        let month: u32 = c[2].parse().ok()?;
        return (1..=12).contains(&month).then_some((year, month));
    }
    if let Some(c) = PERIOD_MONTH_ONLY.captures(text) {
        let month: u32 = c[1].parse().ok()?;
        return (1..=12).contains(&month).then_some((today.year(), month));
    }
    None
}

/// Parse a month cell (`01月`, `1月`) to a month number.
pub fn parse_month_number(text: &str) -> Option<u32> {
    let c = PERIOD_MONTH_ONLY.captures(text.trim())?;
    let month: u32 = c[1].parse().ok()?;
    (1..=12).contains(&month).then_some(month)
}

/// A cell that holds only a weekday marker, e.g. `火` or `(火)`. These show
/// up as sub-header noise in date columns.
pub fn is_weekday_token(text: &str) -> bool {
    WEEKDAY_TOKEN.is_match(text.trim())
}

/// Last calendar day of the given month.
pub fn month_end(year: i32, month: u32) -> NaiveDate {
    let next = if month >= 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    };
    // Both the successor month's first day and its predecessor always exist
    // for any in-range (year, month).
    next.and_then(|d| d.pred_opt())
        .unwrap_or(NaiveDate::MIN)
}

fn ymd(y: &str, m: &str, d: &str) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(y.parse().ok()?, m.parse().ok()?, d.parse().ok()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 11, 30).unwrap()
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn parses_supported_date_formats_to_canonical_form() {
        for (input, expected) in [
            ("2025-11-01", d(2025, 11, 1)),
            ("2025/11/01", d(2025, 11, 1)),
            ("2025/1/5", d(2025, 1, 5)),
            ("2025年11月01日", d(2025, 11, 1)),
            ("2025年11月1日", d(2025, 11, 1)),
            ("令和7年11月25日", d(2025, 11, 25)),
            ("2025/11/25(火)", d(2025, 11, 25)),
            ("2025-11-25（火）", d(2025, 11, 25)),
            ("11/25", d(2025, 11, 25)),
            ("11月25日", d(2025, 11, 25)),
        ] {
            assert_eq!(parse_date(input, today()), Some(expected), "input {input}");
        }
    }

    #[test]
    fn rejects_unsupported_dates_instead_of_guessing() {
        for input in ["", "合計", "火", "(火)", "2025-13-01", "2025/11/32", "25th Nov"] {
            assert_eq!(parse_date(input, today()), None, "input {input:?}");
        }
    }

    #[test]
    fn parses_supported_period_formats() {
        for (input, expected) in [
            ("2025-01", (2025, 1)),
            ("2025/01", (2025, 1)),
            ("2025年1月", (2025, 1)),
            ("202501", (2025, 1)),
            ("01月", (2025, 1)),
        ] {
            assert_eq!(parse_period(input, today()), Some(expected), "input {input}");
        }
        assert_eq!(parse_period("2025-13", today()), None);
        assert_eq!(parse_period("2025", today()), None);
    }

    #[test]
    fn amount_strips_glyphs_and_separators() {
        assert_eq!(parse_amount("¥1,200"), 1200);
        assert_eq!(parse_amount("￥1,200"), 1200);
        assert_eq!(parse_amount("2,300円"), 2300);
        assert_eq!(parse_amount("$967.00"), 967);
        assert_eq!(parse_amount(" 1 234 "), 1234);
        assert_eq!(parse_amount("\\12,000"), 12000);
        assert_eq!(parse_amount("1200"), 1200);
    }

    #[test]
    fn amount_malformed_yields_zero_not_error() {
        assert_eq!(parse_amount(""), 0);
        assert_eq!(parse_amount("-"), 0);
        assert_eq!(parse_amount("合計"), 0);
        assert_eq!(parse_amount("¥"), 0);
    }

    #[test]
    fn weekday_tokens_are_recognized() {
        for t in ["月", "(火)", "（水）", "木曜日", "金曜"] {
            assert!(is_weekday_token(t), "token {t}");
        }
        assert!(!is_weekday_token("11/25"));
        assert!(!is_weekday_token("月別"));
    }

    #[test]
    fn month_end_handles_december_and_leap_years() {
        assert_eq!(month_end(2025, 1), d(2025, 1, 31));
        assert_eq!(month_end(2025, 12), d(2025, 12, 31));
        assert_eq!(month_end(2024, 2), d(2024, 2, 29));
        assert_eq!(month_end(2025, 2), d(2025, 2, 28));
    }
}
