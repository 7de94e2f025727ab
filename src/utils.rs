use crate::error::{CopilotError, Result};
use crate::schema::Month;
use chrono::{Datelike, NaiveDate};

pub fn next_month_start(date: NaiveDate) -> NaiveDate {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };

    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(date)
}

pub fn prev_month_start(date: NaiveDate) -> NaiveDate {
    let (year, month) = if date.month() == 1 {
        (date.year() - 1, 12)
    } else {
        (date.year(), date.month() - 1)
    };

    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(date)
}

pub fn months_between(start: Month, end: Month) -> i32 {
    let year_diff = end.year() - start.year();
    let month_diff = end.month() as i32 - start.month() as i32;
    year_diff * 12 + month_diff
}

/// Parses a month cell.
///
/// Accepts `YYYY-MM`, `YYYY/MM`, `YYYY.MM`, single-digit months, and full
/// dates such as `2025-06-30` or `2025-06-01 00:00:00` (spreadsheet exports),
/// which are reduced to their month.
pub fn parse_month(raw: &str) -> Result<Month> {
    let value = raw.trim();
    let invalid = || CopilotError::InvalidMonth(raw.to_string());

    if let Some(prefix) = value.get(..10) {
        for format in ["%Y-%m-%d", "%Y/%m/%d"] {
            if let Ok(date) = NaiveDate::parse_from_str(prefix, format) {
                return Ok(Month::from_date(date));
            }
        }
    }

    let mut parts = value.split(|c| c == '-' || c == '/' || c == '.');
    let year = parts.next().ok_or_else(invalid)?;
    let month = parts.next().ok_or_else(invalid)?;
    if parts.next().is_some() || year.len() != 4 || month.is_empty() || month.len() > 2 {
        return Err(invalid());
    }

    let year: i32 = year.parse().map_err(|_| invalid())?;
    let month: u32 = month.parse().map_err(|_| invalid())?;
    Month::new(year, month).ok_or_else(invalid)
}

/// Parses a money or rate cell: tolerates `$`, thousands separators,
/// surrounding whitespace and accounting-style `(1,000)` negatives.
pub fn parse_amount(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    let (negative, body) = match trimmed.strip_prefix('(').and_then(|s| s.strip_suffix(')')) {
        Some(inner) => (true, inner),
        None => (false, trimmed),
    };

    let cleaned: String = body
        .chars()
        .filter(|c| !matches!(c, '$' | ',' | ' ' | '_'))
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    let value: f64 = cleaned.parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some(if negative { -value } else { value })
}

/// Formats a USD amount rounded to whole dollars, e.g. `$1,200,000`.
pub fn format_usd(value: f64) -> String {
    let rounded = value.round();
    let digits = format!("{:.0}", rounded.abs());

    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    if rounded < 0.0 {
        format!("-${}", grouped)
    } else {
        format!("${}", grouped)
    }
}

pub fn entity_matches(row_entity: &str, filter: Option<&str>) -> bool {
    match filter {
        Some(wanted) => row_entity.trim().eq_ignore_ascii_case(wanted.trim()),
        None => true,
    }
}

/// " for Acme" or "" when no entity filter is set.
pub fn entity_suffix(entity: Option<&str>) -> String {
    entity.map(|e| format!(" for {}", e)).unwrap_or_default()
}
