use crate::error::{CopilotError, Result};
use crate::schema::{FxRow, LedgerRow, Month};
use log::warn;
use std::collections::{BTreeMap, HashMap};

pub const BASE_CURRENCY: &str = "USD";

/// FX rates indexed by (month, currency).
#[derive(Debug, Clone, Default)]
pub struct FxTable {
    rates: HashMap<(Month, String), f64>,
}

impl FxTable {
    pub fn from_rows(rows: &[FxRow]) -> Self {
        let mut rates = HashMap::with_capacity(rows.len());
        for row in rows {
            let key = (row.month, row.currency.to_ascii_uppercase());
            if let Some(previous) = rates.insert(key, row.rate_to_usd) {
                warn!(
                    "Duplicate FX rate for {} in {} ({} replaced by {})",
                    row.currency, row.month, previous, row.rate_to_usd
                );
            }
        }
        Self { rates }
    }

    pub fn rate(&self, month: Month, currency: &str) -> Option<f64> {
        self.rates
            .get(&(month, currency.trim().to_ascii_uppercase()))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }
}

pub fn is_base_currency(currency: &str) -> bool {
    currency.trim().eq_ignore_ascii_case(BASE_CURRENCY)
}

/// Converts `amount` in `currency` to USD at the rate for `month`.
pub fn to_usd(amount: f64, currency: &str, month: Month, fx: &FxTable) -> Result<f64> {
    if is_base_currency(currency) {
        return Ok(amount);
    }
    fx.rate(month, currency)
        .map(|rate| amount * rate)
        .ok_or_else(|| CopilotError::MissingFxRate {
            month: month.to_string(),
            currency: currency.trim().to_ascii_uppercase(),
        })
}

/// A ledger row after conversion.
#[derive(Debug, Clone, Copy)]
pub struct UsdRow<'a> {
    pub row: &'a LedgerRow,
    pub amount_usd: f64,
}

#[derive(Debug, Clone, Default)]
pub struct Converted<'a> {
    pub rows: Vec<UsdRow<'a>>,
    /// Rows left out per (month, currency) with no rate.
    pub skipped: BTreeMap<(Month, String), usize>,
}

impl<'a> Converted<'a> {
    pub fn total(&self) -> f64 {
        self.rows.iter().map(|r| r.amount_usd).sum()
    }
}

pub fn missing_rate_warning(source: &str, month: Month, currency: &str, rows: usize) -> String {
    format!(
        "Missing FX rate for {} in {}: {} {} row(s) excluded from USD totals",
        currency, month, rows, source
    )
}

/// Converts each row to USD. Rows without a rate are excluded and counted
/// in `skipped` instead of failing the batch.
pub fn convert_rows<'a, I>(rows: I, fx: &FxTable) -> Converted<'a>
where
    I: IntoIterator<Item = &'a LedgerRow>,
{
    let mut converted = Converted::default();
    for row in rows {
        match to_usd(row.amount, &row.currency, row.month, fx) {
            Ok(amount_usd) => converted.rows.push(UsdRow { row, amount_usd }),
            Err(_) => {
                *converted
                    .skipped
                    .entry((row.month, row.currency.to_ascii_uppercase()))
                    .or_insert(0) += 1;
            }
        }
    }
    converted
}
