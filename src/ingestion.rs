//! Workbook ingestion.
//!
//! A [`Workbook`] is a loose set of named sheets of string cells (a folder of
//! CSV exports, or tables handed over in memory). [`load`] validates each of
//! the four known sheets against its schema and produces a typed [`Dataset`].
//! Absent sheets are not an error here; a metric that needs one reports it.

use crate::error::{CopilotError, Result};
use crate::schema::{CashRow, Dataset, FxRow, LedgerRow, Month, TableKind};
use crate::utils::{parse_amount, parse_month};
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Read;
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct Sheet {
    pub name: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct Workbook {
    sheets: BTreeMap<String, Sheet>,
}

impl Workbook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sheet(
        &mut self,
        name: &str,
        headers: Vec<String>,
        rows: Vec<Vec<String>>,
    ) -> &mut Self {
        self.sheets.insert(
            name.trim().to_lowercase(),
            Sheet {
                name: name.trim().to_string(),
                headers,
                rows,
            },
        );
        self
    }

    pub fn add_csv_sheet<R: Read>(&mut self, name: &str, reader: R) -> Result<&mut Self> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            rows.push(record.iter().map(str::to_string).collect());
        }

        Ok(self.add_sheet(name, headers, rows))
    }

    /// Reads every `*.csv` in `dir` as a sheet named after the file stem.
    pub fn from_csv_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut workbook = Workbook::new();

        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let is_csv = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case("csv"))
                .unwrap_or(false);
            if !is_csv {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            debug!("Reading sheet '{}' from {}", stem, path.display());
            workbook.add_csv_sheet(stem, File::open(&path)?)?;
        }

        info!(
            "Loaded {} sheet(s) from {}",
            workbook.sheets.len(),
            dir.display()
        );
        Ok(workbook)
    }

    pub fn sheet_names(&self) -> Vec<&str> {
        self.sheets.values().map(|s| s.name.as_str()).collect()
    }

    pub fn sheet(&self, name: &str) -> Option<&Sheet> {
        self.sheets.get(&name.trim().to_lowercase())
    }

    /// The sheet holding `kind`, matched by its name or a common alias.
    pub fn table(&self, kind: TableKind) -> Option<&Sheet> {
        self.sheets
            .iter()
            .find(|(key, _)| table_for_sheet(key) == Some(kind))
            .map(|(_, sheet)| sheet)
    }
}

fn table_for_sheet(name: &str) -> Option<TableKind> {
    match normalize_header(name).as_str() {
        "actuals" | "actual" | "gl_actuals" => Some(TableKind::Actuals),
        "budget" | "budgets" | "plan" => Some(TableKind::Budget),
        "fx" | "fx_rates" | "fxrates" | "rates" | "exchange_rates" => Some(TableKind::Fx),
        "cash" | "cash_balances" | "cash_balance" => Some(TableKind::Cash),
        _ => None,
    }
}

/// Lower-case, trimmed, with runs of spaces or hyphens folded to `_`.
pub fn normalize_header(name: &str) -> String {
    let name = name.trim().trim_start_matches('\u{feff}').to_lowercase();
    let mut out = String::with_capacity(name.len());
    let mut pending_sep = false;
    for ch in name.chars() {
        if ch.is_whitespace() || ch == '-' || ch == '_' {
            pending_sep = true;
            continue;
        }
        if pending_sep && !out.is_empty() {
            out.push('_');
        }
        pending_sep = false;
        out.push(ch);
    }
    out
}

struct Columns<'a> {
    sheet: &'a str,
    index: HashMap<String, usize>,
}

impl<'a> Columns<'a> {
    fn new(sheet: &'a Sheet) -> Result<Self> {
        if sheet.headers.iter().all(|h| h.trim().is_empty()) {
            return Err(CopilotError::EmptySheet(sheet.name.clone()));
        }
        let mut index = HashMap::new();
        for (i, header) in sheet.headers.iter().enumerate() {
            index.entry(normalize_header(header)).or_insert(i);
        }
        Ok(Self {
            sheet: &sheet.name,
            index,
        })
    }

    fn optional(&self, canonical: &str, aliases: &[&str]) -> Option<usize> {
        std::iter::once(canonical)
            .chain(aliases.iter().copied())
            .find_map(|name| self.index.get(name).copied())
    }

    fn required(&self, canonical: &str, aliases: &[&str]) -> Result<usize> {
        self.optional(canonical, aliases)
            .ok_or_else(|| CopilotError::MissingColumn {
                sheet: self.sheet.to_string(),
                column: canonical.to_string(),
            })
    }
}

struct Cells<'a> {
    sheet: &'a str,
    line: usize,
    row: &'a [String],
}

impl<'a> Cells<'a> {
    fn text(&self, idx: usize) -> &'a str {
        self.row.get(idx).map(|s| s.trim()).unwrap_or("")
    }

    fn malformed(&self, column: &str, value: &str) -> CopilotError {
        CopilotError::MalformedValue {
            sheet: self.sheet.to_string(),
            line: self.line,
            column: column.to_string(),
            value: value.to_string(),
        }
    }

    fn month(&self, idx: usize) -> Result<Month> {
        let raw = self.text(idx);
        parse_month(raw).map_err(|_| self.malformed("month", raw))
    }

    fn amount(&self, idx: usize, column: &str) -> Result<f64> {
        let raw = self.text(idx);
        parse_amount(raw).ok_or_else(|| self.malformed(column, raw))
    }

    fn currency(&self, idx: Option<usize>) -> Result<String> {
        let raw = idx.map(|i| self.text(i)).unwrap_or("");
        if raw.is_empty() {
            return Ok("USD".to_string());
        }
        if raw.len() != 3 || !raw.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(self.malformed("currency", raw));
        }
        Ok(raw.to_ascii_uppercase())
    }
}

/// Data rows of a sheet with their 1-based file line numbers; blank rows skipped.
fn data_rows(sheet: &Sheet) -> impl Iterator<Item = Cells<'_>> {
    sheet
        .rows
        .iter()
        .enumerate()
        .filter(|(_, row)| row.iter().any(|c| !c.trim().is_empty()))
        .map(move |(idx, row)| Cells {
            sheet: &sheet.name,
            line: idx + 2,
            row,
        })
}

pub fn parse_ledger_sheet(sheet: &Sheet) -> Result<Vec<LedgerRow>> {
    let columns = Columns::new(sheet)?;
    let month_col = columns.required("month", &["date", "period"])?;
    let entity_col = columns.required("entity", &["company", "business_unit"])?;
    let category_col = columns.required("account_category", &["account", "category"])?;
    let amount_col = columns.required("amount", &["value", "amount_local"])?;
    let currency_col = columns.optional("currency", &["ccy", "currency_code"]);

    if currency_col.is_none() {
        debug!("Sheet '{}' has no currency column; assuming USD", sheet.name);
    }

    data_rows(sheet)
        .map(|cells| -> Result<LedgerRow> {
            Ok(LedgerRow {
                month: cells.month(month_col)?,
                entity: cells.text(entity_col).to_string(),
                account_category: cells.text(category_col).to_string(),
                amount: cells.amount(amount_col, "amount")?,
                currency: cells.currency(currency_col)?,
            })
        })
        .collect()
}

pub fn parse_fx_sheet(sheet: &Sheet) -> Result<Vec<FxRow>> {
    let columns = Columns::new(sheet)?;
    let month_col = columns.required("month", &["date", "period"])?;
    let currency_col = columns.required("currency", &["ccy", "currency_code"])?;
    let rate_col = columns.required("rate_to_usd", &["rate", "fx_rate", "usd_rate"])?;

    data_rows(sheet)
        .map(|cells| -> Result<FxRow> {
            let rate = cells.amount(rate_col, "rate_to_usd")?;
            if rate <= 0.0 {
                return Err(cells.malformed("rate_to_usd", cells.text(rate_col)));
            }
            Ok(FxRow {
                month: cells.month(month_col)?,
                currency: cells.currency(Some(currency_col))?,
                rate_to_usd: rate,
            })
        })
        .collect()
}

pub fn parse_cash_sheet(sheet: &Sheet) -> Result<Vec<CashRow>> {
    let columns = Columns::new(sheet)?;
    let month_col = columns.required("month", &["date", "period"])?;
    let entity_col = columns.required("entity", &["company", "business_unit"])?;
    let cash_col = columns.required("cash_usd", &["cash", "amount", "balance"])?;

    let mut rows: Vec<CashRow> = Vec::new();
    let mut seen: HashMap<(Month, String), usize> = HashMap::new();

    for cells in data_rows(sheet) {
        let row = CashRow {
            month: cells.month(month_col)?,
            entity: cells.text(entity_col).to_string(),
            cash_usd: cells.amount(cash_col, "cash_usd")?,
        };

        let key = (row.month, row.entity.to_lowercase());
        match seen.get(&key) {
            Some(&pos) => {
                warn!(
                    "Sheet '{}', line {}: duplicate cash balance for {} / {}; keeping the later row",
                    sheet.name, cells.line, row.entity, row.month
                );
                rows[pos] = row;
            }
            None => {
                seen.insert(key, rows.len());
                rows.push(row);
            }
        }
    }

    Ok(rows)
}

/// Validates the known sheets of `workbook` into typed tables.
pub fn load(workbook: &Workbook) -> Result<Dataset> {
    let mut dataset = Dataset::default();

    for kind in TableKind::ALL {
        let Some(sheet) = workbook.table(kind) else {
            info!("Sheet '{}' not present; metrics needing it will report it", kind.sheet_name());
            continue;
        };

        match kind {
            TableKind::Actuals => dataset.actuals = Some(parse_ledger_sheet(sheet)?),
            TableKind::Budget => dataset.budget = Some(parse_ledger_sheet(sheet)?),
            TableKind::Fx => dataset.fx = Some(parse_fx_sheet(sheet)?),
            TableKind::Cash => dataset.cash = Some(parse_cash_sheet(sheet)?),
        }
    }

    info!(
        "Dataset loaded: {} actuals, {} budget, {} fx, {} cash rows",
        dataset.actuals.as_ref().map_or(0, Vec::len),
        dataset.budget.as_ref().map_or(0, Vec::len),
        dataset.fx.as_ref().map_or(0, Vec::len),
        dataset.cash.as_ref().map_or(0, Vec::len),
    );

    Ok(dataset)
}

pub fn load_csv_dir(dir: impl AsRef<Path>) -> Result<Dataset> {
    load(&Workbook::from_csv_dir(dir)?)
}
