//! Metric library.
//!
//! Every function here is a pure computation over [`Tables`]: the same tables
//! and parameters always give the same [`MetricResult`]. A table the metric
//! cannot run without is reported as `Err(MissingTable)`; everything else
//! (missing FX rates, empty filters, zero denominators) is folded into the
//! result as warnings and undefined figures.

use crate::accounts::{opex_category, AccountClass};
use crate::currency::{convert_rows, is_base_currency, missing_rate_warning, Converted, FxTable};
use crate::error::Result;
use crate::schema::{
    Aggregate, AggregateOp, AggregateTarget, CashRow, ChartKind, Dataset, Figure, LedgerRow,
    MetricId, MetricResult, Month, SeriesPoint, TableKind,
};
use crate::utils::{entity_matches, entity_suffix, format_usd, months_between};
use log::debug;
use std::collections::{BTreeMap, BTreeSet};

/// A loaded dataset together with its FX index.
#[derive(Debug, Clone, Default)]
pub struct Tables {
    pub dataset: Dataset,
    pub fx: FxTable,
}

impl Tables {
    pub fn new(dataset: Dataset) -> Self {
        let fx = FxTable::from_rows(dataset.fx_or_empty());
        Self { dataset, fx }
    }
}

impl From<Dataset> for Tables {
    fn from(dataset: Dataset) -> Self {
        Tables::new(dataset)
    }
}

// =========================
// Shared helpers
// =========================

struct Period {
    month: Month,
    defaulted: bool,
}

impl Period {
    fn resolve(requested: Option<Month>, available: impl Iterator<Item = Month>) -> Option<Self> {
        match requested {
            Some(month) => Some(Period {
                month,
                defaulted: false,
            }),
            None => available.max().map(|month| Period {
                month,
                defaulted: true,
            }),
        }
    }

    fn describe(&self, entity: Option<&str>, table: &str) -> String {
        let note = if self.defaulted {
            format!(" (latest month in {})", table)
        } else {
            String::new()
        };
        format!("{}{}{}", self.month, note, entity_suffix(entity))
    }
}

/// Collects warnings while a metric runs. Missing-rate counts are merged per
/// (sheet, month, currency) so a currency gap is reported once.
#[derive(Default)]
struct Notes {
    warnings: Vec<String>,
    missing_rates: BTreeMap<(&'static str, Month, String), usize>,
}

impl Notes {
    fn push(&mut self, warning: impl Into<String>) {
        let warning = warning.into();
        if !self.warnings.contains(&warning) {
            self.warnings.push(warning);
        }
    }

    fn absorb(&mut self, source: &'static str, converted: &Converted<'_>) {
        for ((month, currency), count) in &converted.skipped {
            *self
                .missing_rates
                .entry((source, *month, currency.clone()))
                .or_insert(0) += count;
        }
    }

    fn require_rows(&mut self, converted: &Converted<'_>, what: &str, source: &str, scope: &str) {
        if converted.rows.is_empty() && converted.skipped.is_empty() {
            self.push(format!("No {} rows in {} for {}", what, source, scope));
        }
    }

    fn finish(self, result: MetricResult) -> MetricResult {
        let skipped: usize = self.missing_rates.values().sum();
        let fx_warnings: Vec<String> = self
            .missing_rates
            .iter()
            .map(|((source, month, currency), count)| {
                missing_rate_warning(source, *month, currency, *count)
            })
            .collect();

        result
            .with_warnings(self.warnings)
            .with_warnings(fx_warnings)
            .with_fx_skipped(skipped)
    }
}

fn select<'a>(
    rows: &'a [LedgerRow],
    month: Month,
    entity: Option<&str>,
    class: AccountClass,
) -> Vec<&'a LedgerRow> {
    rows.iter()
        .filter(|r| {
            r.month == month
                && entity_matches(&r.entity, entity)
                && AccountClass::of(&r.account_category) == class
        })
        .collect()
}

fn class_total<'a>(
    rows: &'a [LedgerRow],
    fx: &FxTable,
    month: Month,
    entity: Option<&str>,
    class: AccountClass,
) -> Converted<'a> {
    convert_rows(select(rows, month, entity, class), fx)
}

fn ledger_table(tables: &Tables, kind: TableKind) -> Result<&[LedgerRow]> {
    match kind {
        TableKind::Budget => tables.dataset.budget(),
        _ => tables.dataset.actuals(),
    }
}

fn point(label: impl Into<String>, value: f64) -> SeriesPoint {
    SeriesPoint {
        label: label.into(),
        value,
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn empty_table_result(metric: MetricId, table: &str) -> MetricResult {
    MetricResult::new(
        Some(metric),
        format!(
            "{} could not be computed: the {} sheet has no rows.",
            metric.title(),
            table
        ),
    )
    .with_headline(metric.title(), Figure::undefined("no data"))
    .with_warnings([format!("The {} sheet has no rows", table)])
}

/// Per-month cash summed over matching entities, up to and including `until`.
fn cash_history(rows: &[CashRow], until: Option<Month>, entity: Option<&str>) -> BTreeMap<Month, f64> {
    let mut history = BTreeMap::new();
    for row in rows
        .iter()
        .filter(|r| entity_matches(&r.entity, entity) && until.map_or(true, |m| r.month <= m))
    {
        *history.entry(row.month).or_insert(0.0) += row.cash_usd;
    }
    history
}

/// Why a cash history came back empty. A requested month before the first
/// balance is named together with the first month on file.
fn no_cash_note(rows: &[CashRow], requested: Option<Month>, entity: Option<&str>) -> String {
    let earliest = rows
        .iter()
        .filter(|r| entity_matches(&r.entity, entity))
        .map(|r| r.month)
        .min();
    match (requested, earliest) {
        (Some(requested), Some(first)) => format!(
            "No cash balance at or before {}{}; data starts {}",
            requested,
            entity_suffix(entity),
            first
        ),
        _ => format!("No cash balances{}", entity_suffix(entity)),
    }
}

fn history_series(history: &BTreeMap<Month, f64>) -> Vec<SeriesPoint> {
    history.iter().map(|(m, v)| point(m.to_string(), *v)).collect()
}

// =========================
// Core metrics
// =========================

pub fn revenue_vs_budget(
    tables: &Tables,
    month: Option<Month>,
    entity: Option<&str>,
) -> Result<MetricResult> {
    let actuals = tables.dataset.actuals()?;
    let budget = tables.dataset.budget()?;
    let mut notes = Notes::default();

    // An unqualified question is about the latest closed month, so the budget's
    // forward months never pick the default.
    let resolved = Period::resolve(month, actuals.iter().map(|r| r.month))
        .map(|p| (p, "actuals"))
        .or_else(|| Period::resolve(None, budget.iter().map(|r| r.month)).map(|p| (p, "budget")));
    let Some((period, source)) = resolved else {
        notes.push("The actuals and budget sheets have no rows");
        return Ok(notes.finish(variance_result(0.0, 0.0, "(no data)")));
    };
    let scope = period.describe(entity, source);

    let actual = class_total(actuals, &tables.fx, period.month, entity, AccountClass::Revenue);
    let plan = class_total(budget, &tables.fx, period.month, entity, AccountClass::Revenue);
    notes.require_rows(&actual, "revenue", "actuals", &scope);
    notes.require_rows(&plan, "revenue", "budget", &scope);
    notes.absorb("actuals", &actual);
    notes.absorb("budget", &plan);

    debug!(
        "revenue_vs_budget {}: {} actual rows, {} budget rows",
        scope,
        actual.rows.len(),
        plan.rows.len()
    );

    Ok(notes.finish(variance_result(actual.total(), plan.total(), &scope)))
}

fn variance_result(actual: f64, budget: f64, scope: &str) -> MetricResult {
    let variance = actual - budget;
    let percent = if budget != 0.0 {
        Figure::Percent(variance * 100.0 / budget)
    } else {
        Figure::undefined("budget is zero")
    };

    let percent_text = match &percent {
        Figure::Percent(p) => format!("{:+.1}%", p),
        _ => "variance % undefined because budget is zero".to_string(),
    };

    MetricResult::new(
        Some(MetricId::RevenueVsBudget),
        format!(
            "Revenue {}: actual {} vs budget {}, variance {} ({}).",
            scope,
            format_usd(actual),
            format_usd(budget),
            format_usd(variance),
            percent_text
        ),
    )
    .with_headline("Actual", Figure::Usd(actual))
    .with_headline("Budget", Figure::Usd(budget))
    .with_headline("Variance", Figure::Usd(variance))
    .with_headline("Variance %", percent)
    .with_series(
        ChartKind::Bar,
        vec![point("Actual", actual), point("Budget", budget)],
    )
}

pub fn gross_margin_trend(
    tables: &Tables,
    lookback_months: u32,
    month: Option<Month>,
    entity: Option<&str>,
) -> Result<MetricResult> {
    let actuals = tables.dataset.actuals()?;
    let metric = MetricId::GrossMarginTrend;
    let lookback = lookback_months.max(1) as usize;
    let mut notes = Notes::default();

    let anchor = Period::resolve(month, actuals.iter().map(|r| r.month)).map(|p| p.month);
    let months: BTreeSet<Month> = actuals
        .iter()
        .filter(|r| entity_matches(&r.entity, entity) && anchor.map_or(true, |a| r.month <= a))
        .map(|r| r.month)
        .collect();
    let window: Vec<Month> = months
        .iter()
        .skip(months.len().saturating_sub(lookback))
        .copied()
        .collect();

    let Some(&last_month) = window.last() else {
        notes.push(format!("No actuals rows{} to compute gross margin", entity_suffix(entity)));
        let result = MetricResult::new(
            Some(metric),
            format!("Gross margin{} could not be computed: no actuals data.", entity_suffix(entity)),
        )
        .with_headline("Latest margin", Figure::undefined("no data"))
        .with_headline("Average margin", Figure::undefined("no data"))
        .with_series(ChartKind::Line, Vec::new());
        return Ok(notes.finish(result));
    };

    if window.len() < lookback {
        notes.push(format!(
            "Only {} month(s) of actuals available; {} requested",
            window.len(),
            lookback
        ));
    }

    let mut series = Vec::with_capacity(window.len());
    for m in &window {
        let revenue = class_total(actuals, &tables.fx, *m, entity, AccountClass::Revenue);
        let cogs = class_total(actuals, &tables.fx, *m, entity, AccountClass::CostOfSales);
        notes.absorb("actuals", &revenue);
        notes.absorb("actuals", &cogs);

        let revenue_usd = revenue.total();
        if revenue_usd == 0.0 {
            notes.push(format!("Gross margin undefined for {}: revenue is zero", m));
            continue;
        }
        let margin = (revenue_usd - cogs.total()) / revenue_usd * 100.0;
        series.push(point(m.to_string(), round2(margin)));
    }

    let last_label = last_month.to_string();
    let latest = match series.last() {
        Some(p) if p.label == last_label => Figure::Percent(p.value),
        _ => Figure::undefined(format!("revenue is zero in {}", last_month)),
    };
    let average = if series.is_empty() {
        Figure::undefined("no month with revenue")
    } else {
        Figure::Percent(round2(
            series.iter().map(|p| p.value).sum::<f64>() / series.len() as f64,
        ))
    };

    let answer = match &latest {
        Figure::Percent(p) => format!(
            "Gross margin over the last {} month(s){}: {:.1}% in {} (average {}).",
            window.len(),
            entity_suffix(entity),
            p,
            last_month,
            average
        ),
        _ => format!(
            "Gross margin over the last {} month(s){}: undefined in {} because revenue is zero (average {}).",
            window.len(),
            entity_suffix(entity),
            last_month,
            average
        ),
    };

    let result = MetricResult::new(Some(metric), answer)
        .with_headline("Latest margin", latest)
        .with_headline("Average margin", average)
        .with_series(ChartKind::Line, series);
    Ok(notes.finish(result))
}

pub fn opex_by_category(
    tables: &Tables,
    month: Option<Month>,
    entity: Option<&str>,
) -> Result<MetricResult> {
    let actuals = tables.dataset.actuals()?;
    let metric = MetricId::OpexByCategory;
    let mut notes = Notes::default();

    let Some(period) = Period::resolve(month, actuals.iter().map(|r| r.month)) else {
        return Ok(empty_table_result(metric, "actuals"));
    };
    let scope = period.describe(entity, "actuals");

    let opex = class_total(actuals, &tables.fx, period.month, entity, AccountClass::OperatingExpense);
    notes.require_rows(&opex, "operating expense", "actuals", &scope);
    notes.absorb("actuals", &opex);

    // Keyed case-insensitively; the first spelling seen is displayed.
    let mut by_category: BTreeMap<String, (String, f64)> = BTreeMap::new();
    for usd in &opex.rows {
        let name = opex_category(&usd.row.account_category);
        by_category
            .entry(name.to_lowercase())
            .or_insert_with(|| (name, 0.0))
            .1 += usd.amount_usd;
    }

    let mut categories: Vec<(String, f64)> = by_category.into_values().collect();
    categories.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let total = opex.total();
    let (top, answer) = match categories.first() {
        Some((name, amount)) => (
            Figure::Text(name.clone()),
            format!(
                "Opex {}: total {}; largest category is {} at {}.",
                scope,
                format_usd(total),
                name,
                format_usd(*amount)
            ),
        ),
        None => (
            Figure::undefined("no operating expenses"),
            format!("Opex {}: no operating expense rows, total {}.", scope, format_usd(total)),
        ),
    };

    let result = MetricResult::new(Some(metric), answer)
        .with_headline("Total opex", Figure::Usd(total))
        .with_headline("Top category", top)
        .with_series(
            ChartKind::Pie,
            categories
                .into_iter()
                .map(|(name, amount)| point(name, amount))
                .collect(),
        );
    Ok(notes.finish(result))
}

pub fn cash_runway(
    tables: &Tables,
    month: Option<Month>,
    entity: Option<&str>,
    burn_window: usize,
) -> Result<MetricResult> {
    let cash = tables.dataset.cash()?;
    let metric = MetricId::CashRunway;
    let burn_window = burn_window.max(1);
    let mut notes = Notes::default();

    let history = cash_history(cash, month, entity);
    let Some((&current_month, &current_cash)) = history.iter().next_back() else {
        let reason = no_cash_note(cash, month, entity);
        let result = MetricResult::new(
            Some(metric),
            format!("Cash runway could not be computed: {}.", reason),
        )
        .with_headline("Current cash", Figure::undefined("no data"))
        .with_headline("Average burn", Figure::undefined("no data"))
        .with_headline("Runway", Figure::undefined("no data"));
        notes.push(reason);
        return Ok(notes.finish(result));
    };

    if let Some(requested) = month {
        if requested != current_month {
            notes.push(format!(
                "No cash balance for {}; using {} instead",
                requested, current_month
            ));
        }
    }

    let recent: Vec<(Month, f64)> = history
        .iter()
        .skip(history.len().saturating_sub(burn_window + 1))
        .map(|(m, v)| (*m, *v))
        .collect();

    let mut burns = Vec::with_capacity(burn_window);
    for pair in recent.windows(2) {
        let (prev_month, prev_cash) = pair[0];
        let (next_month, next_cash) = pair[1];
        if prev_month.is_followed_by(next_month) {
            burns.push(prev_cash - next_cash);
        } else {
            notes.push(format!(
                "Cash data gap between {} and {} ({} month(s) missing); that interval is left out of the burn average",
                prev_month,
                next_month,
                months_between(prev_month, next_month) - 1
            ));
        }
    }

    let who = entity_suffix(entity);
    let (burn, runway, answer) = if burns.is_empty() {
        notes.push("Not enough consecutive months of cash data to compute burn");
        (
            Figure::undefined("no consecutive months"),
            Figure::undefined("burn rate unknown"),
            format!(
                "Cash{} is {} as of {}; runway cannot be computed without consecutive monthly balances.",
                who,
                format_usd(current_cash),
                current_month
            ),
        )
    } else {
        let average_burn = burns.iter().sum::<f64>() / burns.len() as f64;
        if average_burn > 0.0 {
            let months = (current_cash / average_burn).max(0.0);
            (
                Figure::Usd(average_burn),
                Figure::Months(months),
                format!(
                    "Cash runway{}: {:.1} months ({} cash as of {}, average monthly burn {} over {} month(s)).",
                    who,
                    months,
                    format_usd(current_cash),
                    current_month,
                    format_usd(average_burn),
                    burns.len()
                ),
            )
        } else {
            (
                Figure::Usd(average_burn),
                Figure::Unbounded,
                format!(
                    "Cash runway{}: runway is effectively infinite; cash is not decreasing ({} as of {}).",
                    who,
                    format_usd(current_cash),
                    current_month
                ),
            )
        }
    };

    let result = MetricResult::new(Some(metric), answer)
        .with_headline("Current cash", Figure::Usd(current_cash))
        .with_headline("Average burn", burn)
        .with_headline("Runway", runway)
        .with_series(ChartKind::Line, history_series(&history));
    Ok(notes.finish(result))
}

// =========================
// Single-figure getters
// =========================

fn class_figure(
    tables: &Tables,
    kind: TableKind,
    metric: MetricId,
    class: AccountClass,
    what: &str,
    month: Option<Month>,
    entity: Option<&str>,
) -> Result<MetricResult> {
    let rows = ledger_table(tables, kind)?;
    let source = kind.sheet_name();
    let mut notes = Notes::default();

    let Some(period) = Period::resolve(month, rows.iter().map(|r| r.month)) else {
        return Ok(empty_table_result(metric, source));
    };
    let scope = period.describe(entity, source);

    let converted = class_total(rows, &tables.fx, period.month, entity, class);
    notes.require_rows(&converted, what, source, &scope);
    notes.absorb(source, &converted);

    let total = converted.total();
    let result = MetricResult::new(
        Some(metric),
        format!("{} {}: {}.", metric.title(), scope, format_usd(total)),
    )
    .with_headline(metric.title(), Figure::Usd(total));
    Ok(notes.finish(result))
}

pub fn revenue(tables: &Tables, month: Option<Month>, entity: Option<&str>) -> Result<MetricResult> {
    class_figure(
        tables,
        TableKind::Actuals,
        MetricId::Revenue,
        AccountClass::Revenue,
        "revenue",
        month,
        entity,
    )
}

pub fn cogs(tables: &Tables, month: Option<Month>, entity: Option<&str>) -> Result<MetricResult> {
    class_figure(
        tables,
        TableKind::Actuals,
        MetricId::Cogs,
        AccountClass::CostOfSales,
        "COGS",
        month,
        entity,
    )
}

pub fn opex_total(tables: &Tables, month: Option<Month>, entity: Option<&str>) -> Result<MetricResult> {
    class_figure(
        tables,
        TableKind::Actuals,
        MetricId::OpexTotal,
        AccountClass::OperatingExpense,
        "operating expense",
        month,
        entity,
    )
}

/// Planned revenue from the budget sheet.
pub fn budget_revenue(tables: &Tables, month: Option<Month>, entity: Option<&str>) -> Result<MetricResult> {
    class_figure(
        tables,
        TableKind::Budget,
        MetricId::BudgetRevenue,
        AccountClass::Revenue,
        "revenue",
        month,
        entity,
    )
}

/// EBITDA proxy: revenue - COGS - opex.
pub fn ebitda(tables: &Tables, month: Option<Month>, entity: Option<&str>) -> Result<MetricResult> {
    let actuals = tables.dataset.actuals()?;
    let metric = MetricId::Ebitda;
    let mut notes = Notes::default();

    let Some(period) = Period::resolve(month, actuals.iter().map(|r| r.month)) else {
        return Ok(empty_table_result(metric, "actuals"));
    };
    let scope = period.describe(entity, "actuals");

    let revenue = class_total(actuals, &tables.fx, period.month, entity, AccountClass::Revenue);
    let cogs = class_total(actuals, &tables.fx, period.month, entity, AccountClass::CostOfSales);
    let opex = class_total(actuals, &tables.fx, period.month, entity, AccountClass::OperatingExpense);
    notes.require_rows(&revenue, "revenue", "actuals", &scope);
    for part in [&revenue, &cogs, &opex] {
        notes.absorb("actuals", part);
    }

    let (rev, cost, op) = (revenue.total(), cogs.total(), opex.total());
    let value = rev - cost - op;

    let result = MetricResult::new(
        Some(metric),
        format!(
            "EBITDA {}: {} (revenue {} - COGS {} - opex {}).",
            scope,
            format_usd(value),
            format_usd(rev),
            format_usd(cost),
            format_usd(op)
        ),
    )
    .with_headline("Revenue", Figure::Usd(rev))
    .with_headline("COGS", Figure::Usd(cost))
    .with_headline("Opex", Figure::Usd(op))
    .with_headline("EBITDA", Figure::Usd(value))
    .with_series(
        ChartKind::Bar,
        vec![
            point("Revenue", rev),
            point("COGS", cost),
            point("Opex", op),
            point("EBITDA", value),
        ],
    );
    Ok(notes.finish(result))
}

pub fn cash_balance(tables: &Tables, month: Option<Month>, entity: Option<&str>) -> Result<MetricResult> {
    let cash = tables.dataset.cash()?;
    let metric = MetricId::CashBalance;
    let mut notes = Notes::default();

    let history = cash_history(cash, month, entity);
    let Some((&latest_month, &balance)) = history.iter().next_back() else {
        let reason = no_cash_note(cash, month, entity);
        let result = MetricResult::new(Some(metric), format!("{}.", reason))
            .with_headline("Cash", Figure::undefined("no data"));
        notes.push(reason);
        return Ok(notes.finish(result));
    };

    if let Some(requested) = month {
        if requested != latest_month {
            notes.push(format!(
                "No cash balance for {}; using {} instead",
                requested, latest_month
            ));
        }
    }

    let result = MetricResult::new(
        Some(metric),
        format!(
            "Cash{} as of {}: {}.",
            entity_suffix(entity),
            latest_month,
            format_usd(balance)
        ),
    )
    .with_headline("Cash", Figure::Usd(balance))
    .with_series(ChartKind::Line, history_series(&history));
    Ok(notes.finish(result))
}

pub fn fx_rate(tables: &Tables, month: Option<Month>, currency: Option<&str>) -> Result<MetricResult> {
    let fx_rows = tables.dataset.fx()?;
    let metric = MetricId::FxRate;

    let Some(code) = currency
        .map(|c| c.trim().to_ascii_uppercase())
        .filter(|c| !c.is_empty())
    else {
        return Ok(MetricResult::new(
            Some(metric),
            "Which currency? Try \"EUR to USD rate for 2025-06\".",
        )
        .with_headline("Rate to USD", Figure::undefined("no currency given"))
        .with_warnings(["No currency code found in the question"]));
    };

    if is_base_currency(&code) {
        return Ok(MetricResult::new(Some(metric), "USD is the reporting currency: 1 USD = 1 USD.")
            .with_headline("Rate to USD", Figure::Rate(1.0)));
    }

    let period = Period::resolve(
        month,
        fx_rows.iter().filter(|r| r.currency == code).map(|r| r.month),
    );
    let found = period
        .as_ref()
        .and_then(|p| tables.fx.rate(p.month, &code).map(|rate| (p, rate)));

    let result = match found {
        Some((p, rate)) => MetricResult::new(
            Some(metric),
            format!("1 {} = {:.4} USD in {}.", code, rate, p.describe(None, "fx")),
        )
        .with_headline("Rate to USD", Figure::Rate(rate)),
        None => {
            let when = period
                .as_ref()
                .map(|p| p.month.to_string())
                .unwrap_or_else(|| "any month".to_string());
            MetricResult::new(
                Some(metric),
                format!("No {} to USD rate found for {}.", code, when),
            )
            .with_headline("Rate to USD", Figure::undefined("rate not in fx sheet"))
            .with_warnings([format!("Missing FX rate for {} in {}", code, when)])
        }
    };
    Ok(result)
}

// =========================
// Series and aggregates
// =========================

/// One month of `target` in USD. Ledger targets with no rows count as zero
/// (with a warning); a month with no cash balance has no value.
fn monthly_value(
    tables: &Tables,
    target: AggregateTarget,
    month: Month,
    entity: Option<&str>,
    notes: &mut Notes,
) -> Result<Option<f64>> {
    let scope = format!("{}{}", month, entity_suffix(entity));

    let (kind, class, what) = match target {
        AggregateTarget::Revenue => (TableKind::Actuals, AccountClass::Revenue, "revenue"),
        AggregateTarget::Cogs => (TableKind::Actuals, AccountClass::CostOfSales, "COGS"),
        AggregateTarget::Opex => (TableKind::Actuals, AccountClass::OperatingExpense, "operating expense"),
        AggregateTarget::BudgetRevenue => (TableKind::Budget, AccountClass::Revenue, "revenue"),
        AggregateTarget::Ebitda => {
            let actuals = tables.dataset.actuals()?;
            let [revenue, cogs, opex] = [
                AccountClass::Revenue,
                AccountClass::CostOfSales,
                AccountClass::OperatingExpense,
            ]
            .map(|class| class_total(actuals, &tables.fx, month, entity, class));
            notes.require_rows(&revenue, "revenue", "actuals", &scope);
            for part in [&revenue, &cogs, &opex] {
                notes.absorb("actuals", part);
            }
            return Ok(Some(revenue.total() - cogs.total() - opex.total()));
        }
        AggregateTarget::Cash => {
            let balances: Vec<f64> = tables
                .dataset
                .cash()?
                .iter()
                .filter(|r| r.month == month && entity_matches(&r.entity, entity))
                .map(|r| r.cash_usd)
                .collect();
            if balances.is_empty() {
                notes.push(format!("No cash balance for {}", scope));
                return Ok(None);
            }
            return Ok(Some(balances.iter().sum()));
        }
    };

    let rows = ledger_table(tables, kind)?;
    let converted = class_total(rows, &tables.fx, month, entity, class);
    notes.require_rows(&converted, what, kind.sheet_name(), &scope);
    notes.absorb(kind.sheet_name(), &converted);
    Ok(Some(converted.total()))
}

fn series_over(
    tables: &Tables,
    target: AggregateTarget,
    months: &[Month],
    entity: Option<&str>,
    notes: &mut Notes,
) -> Result<Vec<SeriesPoint>> {
    let mut series = Vec::with_capacity(months.len());
    for m in months {
        if let Some(value) = monthly_value(tables, target, *m, entity, notes)? {
            series.push(point(m.to_string(), round2(value)));
        }
    }
    Ok(series)
}

/// Months of the target's sheet that have rows for `entity`.
fn target_months(tables: &Tables, target: AggregateTarget, entity: Option<&str>) -> Result<BTreeSet<Month>> {
    let months: BTreeSet<Month> = match target.table() {
        TableKind::Cash => tables
            .dataset
            .cash()?
            .iter()
            .filter(|r| entity_matches(&r.entity, entity))
            .map(|r| r.month)
            .collect(),
        kind => ledger_table(tables, kind)?
            .iter()
            .filter(|r| entity_matches(&r.entity, entity))
            .map(|r| r.month)
            .collect(),
    };
    Ok(months)
}

/// Month-by-month values of `target` for every calendar month in
/// `from..=to` (either order).
pub fn metric_series(
    tables: &Tables,
    target: AggregateTarget,
    from: Month,
    to: Month,
    entity: Option<&str>,
) -> Result<MetricResult> {
    let (first, last) = if from <= to { (from, to) } else { (to, from) };
    let mut months = Vec::new();
    let mut m = first;
    loop {
        months.push(m);
        if m >= last {
            break;
        }
        m = m.succ();
    }

    let mut notes = Notes::default();
    let series = series_over(tables, target, &months, entity, &mut notes)?;
    let total: f64 = series.iter().map(|p| p.value).sum();

    let result = MetricResult::new(
        Some(MetricId::MetricAggregate),
        format!(
            "Monthly {}{} from {} to {}: {} month(s) with data.",
            target.label(),
            entity_suffix(entity),
            first,
            last,
            series.len()
        ),
    )
    .with_headline("Total", Figure::Usd(round2(total)))
    .with_series(ChartKind::Line, series);
    Ok(notes.finish(result))
}

fn fold_values(op: AggregateOp, values: &[f64]) -> Figure {
    let (Some(&first), Some(&last)) = (values.first(), values.last()) else {
        return Figure::undefined("no months in window");
    };
    let sum: f64 = values.iter().sum();

    match op {
        AggregateOp::Sum => Figure::Usd(round2(sum)),
        AggregateOp::Avg => Figure::Usd(round2(sum / values.len() as f64)),
        AggregateOp::Min => Figure::Usd(values.iter().copied().fold(f64::INFINITY, f64::min)),
        AggregateOp::Max => Figure::Usd(values.iter().copied().fold(f64::NEG_INFINITY, f64::max)),
        AggregateOp::Diff | AggregateOp::PctChange if values.len() < 2 => {
            Figure::undefined("needs at least two months")
        }
        AggregateOp::Diff => Figure::Usd(round2(last - first)),
        AggregateOp::PctChange if first == 0.0 => Figure::undefined("first month is zero"),
        // Measured against |first| so a shrinking loss reads as an improvement.
        AggregateOp::PctChange => Figure::Percent(round2((last - first) / first.abs() * 100.0)),
    }
}

/// Folds the last `lookback_months` months of `target` (months with data,
/// ending at `month` or the latest month on file) into one figure.
pub fn metric_aggregate(
    tables: &Tables,
    aggregate: Aggregate,
    lookback_months: u32,
    month: Option<Month>,
    entity: Option<&str>,
) -> Result<MetricResult> {
    let metric = MetricId::MetricAggregate;
    let Aggregate { op, target } = aggregate;
    let lookback = lookback_months.max(1) as usize;
    let source = target.table().sheet_name();
    let mut notes = Notes::default();

    let available = target_months(tables, target, entity)?;
    let anchor = Period::resolve(month, available.iter().copied()).map(|p| p.month);
    let in_range: Vec<Month> = available
        .into_iter()
        .filter(|m| anchor.map_or(true, |a| *m <= a))
        .collect();
    let window = &in_range[in_range.len().saturating_sub(lookback)..];

    let (Some(first), Some(last)) = (window.first(), window.last()) else {
        notes.push(format!("No {} rows{}", source, entity_suffix(entity)));
        let result = MetricResult::new(
            Some(metric),
            format!(
                "{} of {}{} could not be computed: no {} data.",
                op.label(),
                target.label(),
                entity_suffix(entity),
                source
            ),
        )
        .with_headline(op.label(), Figure::undefined("no data"))
        .with_series(ChartKind::Line, Vec::new());
        return Ok(notes.finish(result));
    };

    if window.len() < lookback {
        notes.push(format!(
            "Only {} month(s) of {} available; {} requested",
            window.len(),
            source,
            lookback
        ));
    }

    let series = series_over(tables, target, window, entity, &mut notes)?;
    let values: Vec<f64> = series.iter().map(|p| p.value).collect();
    let figure = fold_values(op, &values);

    debug!(
        "metric_aggregate {:?} of {:?} over {}..{}: {}",
        op, target, first, last, figure
    );

    let result = MetricResult::new(
        Some(metric),
        format!(
            "{} of {}{} over {} to {} ({} month(s)): {}.",
            op.label(),
            target.label(),
            entity_suffix(entity),
            first,
            last,
            window.len(),
            figure
        ),
    )
    .with_headline(op.label(), figure)
    .with_series(ChartKind::Line, series);
    Ok(notes.finish(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FxRow;

    fn m(s: &str) -> Month {
        s.parse().unwrap()
    }

    fn ledger(month: &str, entity: &str, category: &str, amount: f64, currency: &str) -> LedgerRow {
        LedgerRow {
            month: m(month),
            entity: entity.to_string(),
            account_category: category.to_string(),
            amount,
            currency: currency.to_string(),
        }
    }

    fn cash_row(month: &str, entity: &str, cash_usd: f64) -> CashRow {
        CashRow {
            month: m(month),
            entity: entity.to_string(),
            cash_usd,
        }
    }

    fn tables(actuals: Vec<LedgerRow>, budget: Vec<LedgerRow>, fx: Vec<FxRow>, cash: Vec<CashRow>) -> Tables {
        Tables::new(Dataset {
            actuals: Some(actuals),
            budget: Some(budget),
            fx: Some(fx),
            cash: Some(cash),
        })
    }

    #[test]
    fn test_revenue_vs_budget_scenario() {
        let t = tables(
            vec![
                ledger("2025-06", "Acme", "Revenue", 700_000.0, "USD"),
                ledger("2025-06", "Acme", "revenue", 500_000.0, "USD"),
                ledger("2025-06", "Other Co", "Revenue", 999.0, "USD"),
                ledger("2025-06", "Acme", "COGS", 300_000.0, "USD"),
            ],
            vec![ledger("2025-06", "Acme", "Revenue", 1_000_000.0, "USD")],
            vec![],
            vec![],
        );

        let result = revenue_vs_budget(&t, Some(m("2025-06")), Some("Acme")).unwrap();
        assert_eq!(result.value("Actual"), Some(1_200_000.0));
        assert_eq!(result.value("Budget"), Some(1_000_000.0));
        assert_eq!(result.value("Variance"), Some(200_000.0));
        let pct = result.value("Variance %").unwrap();
        assert!((pct - 20.0).abs() < 1e-9);
        assert_eq!(result.chart, ChartKind::Bar);
        assert_eq!(result.series.len(), 2);
        assert!(result.warnings.is_empty(), "{:?}", result.warnings);
    }

    #[test]
    fn test_revenue_vs_budget_empty_month_is_zero_with_warning() {
        let t = tables(
            vec![ledger("2025-06", "Acme", "Revenue", 10.0, "USD")],
            vec![ledger("2025-06", "Acme", "Revenue", 8.0, "USD")],
            vec![],
            vec![],
        );

        let result = revenue_vs_budget(&t, Some(m("2024-01")), None).unwrap();
        assert_eq!(result.value("Actual"), Some(0.0));
        assert_eq!(result.value("Budget"), Some(0.0));
        assert_eq!(result.value("Variance"), Some(0.0));
        assert!(!result.figure("Variance %").unwrap().is_defined());
        assert!(result.warnings.iter().any(|w| w.contains("No revenue rows in actuals")));
    }

    #[test]
    fn test_revenue_vs_budget_missing_fx_rate_excludes_row() {
        let t = tables(
            vec![
                ledger("2025-06", "Acme", "Revenue", 100.0, "USD"),
                ledger("2025-06", "Acme", "Revenue", 50.0, "EUR"),
            ],
            vec![ledger("2025-06", "Acme", "Revenue", 100.0, "USD")],
            vec![FxRow {
                month: m("2025-05"),
                currency: "EUR".to_string(),
                rate_to_usd: 1.1,
            }],
            vec![],
        );

        let result = revenue_vs_budget(&t, Some(m("2025-06")), None).unwrap();
        assert_eq!(result.value("Actual"), Some(100.0));
        assert_eq!(result.fx_skipped_rows, 1);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("Missing FX rate") && w.contains("EUR") && w.contains("2025-06")));
    }

    #[test]
    fn test_revenue_vs_budget_defaults_to_latest_month() {
        let t = tables(
            vec![
                ledger("2025-05", "Acme", "Revenue", 10.0, "USD"),
                ledger("2025-06", "Acme", "Revenue", 20.0, "USD"),
            ],
            vec![ledger("2025-06", "Acme", "Revenue", 25.0, "USD")],
            vec![],
            vec![],
        );

        let result = revenue_vs_budget(&t, None, None).unwrap();
        assert_eq!(result.value("Actual"), Some(20.0));
        assert!(result.answer_text.contains("2025-06 (latest month in actuals)"));
    }

    #[test]
    fn test_revenue_vs_budget_default_ignores_forward_budget_months() {
        let t = tables(
            vec![ledger("2025-06", "Acme", "Revenue", 1_200.0, "USD")],
            vec![
                ledger("2025-06", "Acme", "Revenue", 1_000.0, "USD"),
                ledger("2025-12", "Acme", "Revenue", 1_000.0, "USD"),
            ],
            vec![],
            vec![],
        );

        let result = revenue_vs_budget(&t, None, None).unwrap();
        assert_eq!(result.value("Actual"), Some(1_200.0));
        assert_eq!(result.value("Budget"), Some(1_000.0));
        assert!(result.answer_text.contains("2025-06 (latest month in actuals)"));
        assert!(result.warnings.is_empty(), "{:?}", result.warnings);

        let plan_only = tables(
            vec![],
            vec![ledger("2025-12", "Acme", "Revenue", 1_000.0, "USD")],
            vec![],
            vec![],
        );
        let result = revenue_vs_budget(&plan_only, None, None).unwrap();
        assert_eq!(result.value("Budget"), Some(1_000.0));
        assert!(result.answer_text.contains("2025-12 (latest month in budget)"));
    }

    #[test]
    fn test_gross_margin_flags_zero_revenue_month() {
        let t = tables(
            vec![
                ledger("2025-04", "Acme", "Revenue", 100.0, "USD"),
                ledger("2025-04", "Acme", "COGS", 60.0, "USD"),
                ledger("2025-05", "Acme", "COGS", 10.0, "USD"),
                ledger("2025-06", "Acme", "Revenue", 200.0, "USD"),
                ledger("2025-06", "Acme", "Cost of Goods Sold", 50.0, "USD"),
            ],
            vec![],
            vec![],
            vec![],
        );

        let result = gross_margin_trend(&t, 6, None, None).unwrap();
        let labels: Vec<&str> = result.series.iter().map(|p| p.label.as_str()).collect();
        assert_eq!(labels, vec!["2025-04", "2025-06"]);
        assert_eq!(result.series[0].value, 40.0);
        assert_eq!(result.series[1].value, 75.0);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("2025-05") && w.contains("revenue is zero")));
        assert_eq!(result.figure("Latest margin"), Some(&Figure::Percent(75.0)));
    }

    #[test]
    fn test_gross_margin_lookback_window() {
        let mut rows = Vec::new();
        for month in ["2025-01", "2025-02", "2025-03", "2025-04"] {
            rows.push(ledger(month, "Acme", "Revenue", 100.0, "USD"));
            rows.push(ledger(month, "Acme", "COGS", 50.0, "USD"));
        }
        let t = tables(rows, vec![], vec![], vec![]);

        let result = gross_margin_trend(&t, 2, None, None).unwrap();
        let labels: Vec<&str> = result.series.iter().map(|p| p.label.as_str()).collect();
        assert_eq!(labels, vec!["2025-03", "2025-04"]);

        let anchored = gross_margin_trend(&t, 2, Some(m("2025-02")), None).unwrap();
        let labels: Vec<&str> = anchored.series.iter().map(|p| p.label.as_str()).collect();
        assert_eq!(labels, vec!["2025-01", "2025-02"]);
    }

    #[test]
    fn test_opex_by_category_sorted_descending() {
        let t = tables(
            vec![
                ledger("2025-06", "Acme", "Opex: Marketing", 300.0, "USD"),
                ledger("2025-06", "Acme", "Opex: R&D", 500.0, "USD"),
                ledger("2025-06", "Acme", "opex: marketing", 250.0, "USD"),
                ledger("2025-06", "Acme", "Rent", 100.0, "USD"),
                ledger("2025-06", "Acme", "Revenue", 9_000.0, "USD"),
            ],
            vec![],
            vec![],
            vec![],
        );

        let result = opex_by_category(&t, Some(m("2025-06")), None).unwrap();
        assert_eq!(result.value("Total opex"), Some(1_150.0));
        assert_eq!(
            result.figure("Top category"),
            Some(&Figure::Text("Marketing".to_string()))
        );
        let series: Vec<(&str, f64)> = result
            .series
            .iter()
            .map(|p| (p.label.as_str(), p.value))
            .collect();
        assert_eq!(series, vec![("Marketing", 550.0), ("R&D", 500.0), ("Rent", 100.0)]);
        assert_eq!(result.chart, ChartKind::Pie);
    }

    #[test]
    fn test_opex_by_category_counts_plural_expense_label() {
        let t = tables(
            vec![ledger("2025-06", "Acme", "Operating Expenses", 500.0, "USD")],
            vec![],
            vec![],
            vec![],
        );

        let result = opex_by_category(&t, None, None).unwrap();
        assert_eq!(result.value("Total opex"), Some(500.0));
        assert_eq!(
            result.figure("Top category"),
            Some(&Figure::Text("Operating Expenses".to_string()))
        );
        assert_eq!(opex_total(&t, None, None).unwrap().value("Total Opex"), Some(500.0));
    }

    #[test]
    fn test_cash_runway_scenario() {
        let t = tables(
            vec![],
            vec![],
            vec![],
            vec![
                cash_row("2025-03", "Acme", 100.0),
                cash_row("2025-04", "Acme", 90.0),
                cash_row("2025-05", "Acme", 75.0),
                cash_row("2025-06", "Acme", 60.0),
            ],
        );

        let result = cash_runway(&t, None, None, 3).unwrap();
        let burn = result.value("Average burn").unwrap();
        assert!((burn - 40.0 / 3.0).abs() < 1e-9);
        let runway = result.value("Runway").unwrap();
        assert!((runway - 4.5).abs() < 1e-9);
        assert_eq!(result.value("Current cash"), Some(60.0));
        assert_eq!(result.series.len(), 4);
    }

    #[test]
    fn test_cash_runway_uses_only_burn_window() {
        let t = tables(
            vec![],
            vec![],
            vec![],
            vec![
                cash_row("2025-01", "Acme", 1_000.0),
                cash_row("2025-02", "Acme", 100.0),
                cash_row("2025-03", "Acme", 90.0),
                cash_row("2025-04", "Acme", 80.0),
                cash_row("2025-05", "Acme", 70.0),
            ],
        );

        let result = cash_runway(&t, None, None, 3).unwrap();
        assert_eq!(result.value("Average burn"), Some(10.0));
        assert_eq!(result.value("Runway"), Some(7.0));
    }

    #[test]
    fn test_cash_runway_gap_skips_interval_only() {
        let t = tables(
            vec![],
            vec![],
            vec![],
            vec![
                cash_row("2025-01", "Acme", 100.0),
                cash_row("2025-02", "Acme", 80.0),
                cash_row("2025-04", "Acme", 70.0),
                cash_row("2025-05", "Acme", 60.0),
            ],
        );

        let result = cash_runway(&t, None, None, 3).unwrap();
        // 2025-01 -> 02 burns 20, 02 -> 04 is a gap, 04 -> 05 burns 10
        assert_eq!(result.value("Average burn"), Some(15.0));
        assert_eq!(result.value("Runway"), Some(4.0));
        assert!(result.warnings.iter().any(|w| w.contains("gap between 2025-02 and 2025-04")));
    }

    #[test]
    fn test_cash_runway_non_positive_burn_is_unbounded() {
        let t = tables(
            vec![],
            vec![],
            vec![],
            vec![
                cash_row("2025-04", "Acme", 50.0),
                cash_row("2025-05", "Acme", 60.0),
                cash_row("2025-06", "Acme", 60.0),
            ],
        );

        let result = cash_runway(&t, None, None, 3).unwrap();
        assert_eq!(result.figure("Runway"), Some(&Figure::Unbounded));
        assert!(result.answer_text.contains("effectively infinite"));
    }

    #[test]
    fn test_cash_runway_sums_entities() {
        let t = tables(
            vec![],
            vec![],
            vec![],
            vec![
                cash_row("2025-05", "Acme", 100.0),
                cash_row("2025-05", "EMEA", 50.0),
                cash_row("2025-06", "Acme", 80.0),
                cash_row("2025-06", "EMEA", 40.0),
            ],
        );

        let all = cash_runway(&t, None, None, 3).unwrap();
        assert_eq!(all.value("Current cash"), Some(120.0));
        assert_eq!(all.value("Average burn"), Some(30.0));

        let emea = cash_runway(&t, None, Some("emea"), 3).unwrap();
        assert_eq!(emea.value("Current cash"), Some(40.0));
        assert_eq!(emea.value("Runway"), Some(4.0));
    }

    #[test]
    fn test_missing_table_is_an_error() {
        let t = Tables::new(Dataset {
            actuals: Some(vec![]),
            ..Default::default()
        });
        assert!(revenue_vs_budget(&t, None, None).is_err());
        assert!(cash_runway(&t, None, None, 3).is_err());
        assert!(fx_rate(&t, None, Some("EUR")).is_err());
    }

    #[test]
    fn test_empty_actuals_gives_undefined_answer() {
        let t = tables(vec![], vec![], vec![], vec![]);
        let result = opex_by_category(&t, None, None).unwrap();
        assert!(!result.warnings.is_empty());
        assert!(!result.headline[0].figure.is_defined());
    }

    #[test]
    fn test_ebitda_and_single_figures() {
        let t = tables(
            vec![
                ledger("2025-06", "Acme", "Revenue", 1_000.0, "USD"),
                ledger("2025-06", "Acme", "COGS", 400.0, "USD"),
                ledger("2025-06", "Acme", "Opex: Rent", 100.0, "EUR"),
            ],
            vec![],
            vec![FxRow {
                month: m("2025-06"),
                currency: "EUR".to_string(),
                rate_to_usd: 2.0,
            }],
            vec![],
        );

        let result = ebitda(&t, None, None).unwrap();
        assert_eq!(result.value("EBITDA"), Some(400.0));
        assert_eq!(revenue(&t, None, None).unwrap().value("Revenue"), Some(1_000.0));
        assert_eq!(cogs(&t, None, None).unwrap().value("COGS"), Some(400.0));
        assert_eq!(opex_total(&t, None, None).unwrap().value("Total Opex"), Some(200.0));
    }

    #[test]
    fn test_cash_balance_falls_back_to_latest_available() {
        let t = tables(
            vec![],
            vec![],
            vec![],
            vec![cash_row("2025-05", "Acme", 75.0), cash_row("2025-06", "Acme", 60.0)],
        );

        let result = cash_balance(&t, Some(m("2025-07")), None).unwrap();
        assert_eq!(result.value("Cash"), Some(60.0));
        assert!(result.warnings.iter().any(|w| w.contains("2025-07")));
    }

    #[test]
    fn test_cash_before_first_balance_names_requested_month() {
        let t = tables(
            vec![],
            vec![],
            vec![],
            vec![cash_row("2025-03", "Acme", 100.0), cash_row("2025-04", "Acme", 90.0)],
        );

        let balance = cash_balance(&t, Some(m("2025-01")), Some("Acme")).unwrap();
        assert!(!balance.figure("Cash").unwrap().is_defined());
        assert!(balance.answer_text.contains("No cash balance at or before 2025-01"));
        assert!(balance
            .warnings
            .iter()
            .any(|w| w.contains("2025-01") && w.contains("data starts 2025-03")));

        let runway = cash_runway(&t, Some(m("2025-01")), None, 3).unwrap();
        assert!(!runway.figure("Runway").unwrap().is_defined());
        assert!(runway.answer_text.contains("at or before 2025-01"));
        assert!(runway.warnings.iter().any(|w| w.contains("data starts 2025-03")));

        let empty = tables(vec![], vec![], vec![], vec![]);
        let none = cash_balance(&empty, None, None).unwrap();
        assert_eq!(none.warnings, vec!["No cash balances".to_string()]);
    }

    #[test]
    fn test_fx_rate_lookup() {
        let t = tables(
            vec![],
            vec![],
            vec![
                FxRow {
                    month: m("2025-05"),
                    currency: "EUR".to_string(),
                    rate_to_usd: 1.08,
                },
                FxRow {
                    month: m("2025-06"),
                    currency: "EUR".to_string(),
                    rate_to_usd: 1.1,
                },
            ],
            vec![],
        );

        assert_eq!(fx_rate(&t, None, Some("eur")).unwrap().value("Rate to USD"), Some(1.1));
        assert_eq!(
            fx_rate(&t, Some(m("2025-05")), Some("EUR")).unwrap().value("Rate to USD"),
            Some(1.08)
        );
        assert_eq!(fx_rate(&t, None, Some("USD")).unwrap().value("Rate to USD"), Some(1.0));

        let missing = fx_rate(&t, Some(m("2025-04")), Some("EUR")).unwrap();
        assert!(!missing.figure("Rate to USD").unwrap().is_defined());
        assert!(!missing.warnings.is_empty());
    }

    fn aggregate(op: AggregateOp, target: AggregateTarget) -> Aggregate {
        Aggregate { op, target }
    }

    fn quarter_of_actuals() -> Tables {
        let mut actuals = Vec::new();
        for (month, revenue) in [("2025-03", 100.0), ("2025-04", 120.0), ("2025-05", 90.0), ("2025-06", 150.0)] {
            actuals.push(ledger(month, "Acme", "Revenue", revenue, "USD"));
            actuals.push(ledger(month, "Acme", "COGS", 40.0, "USD"));
            actuals.push(ledger(month, "Acme", "Opex: Rent", 10.0, "USD"));
        }
        tables(
            actuals,
            vec![
                ledger("2025-05", "Acme", "Revenue", 80.0, "USD"),
                ledger("2025-06", "Acme", "Revenue", 100.0, "USD"),
            ],
            vec![],
            vec![
                cash_row("2025-05", "Acme", 500.0),
                cash_row("2025-06", "Acme", 450.0),
                cash_row("2025-06", "EMEA", 50.0),
            ],
        )
    }

    #[test]
    fn test_metric_aggregate_folds_last_months() {
        let t = quarter_of_actuals();
        let revenue = |op| metric_aggregate(&t, aggregate(op, AggregateTarget::Revenue), 3, None, None).unwrap();

        let sum = revenue(AggregateOp::Sum);
        assert_eq!(sum.value("Sum"), Some(360.0));
        let labels: Vec<&str> = sum.series.iter().map(|p| p.label.as_str()).collect();
        assert_eq!(labels, vec!["2025-04", "2025-05", "2025-06"]);
        assert_eq!(sum.chart, ChartKind::Line);
        assert!(sum.answer_text.contains("2025-04 to 2025-06"));

        assert_eq!(revenue(AggregateOp::Avg).value("Average"), Some(120.0));
        assert_eq!(revenue(AggregateOp::Min).value("Minimum"), Some(90.0));
        assert_eq!(revenue(AggregateOp::Max).value("Maximum"), Some(150.0));
        assert_eq!(revenue(AggregateOp::Diff).value("Change"), Some(30.0));
        assert_eq!(revenue(AggregateOp::PctChange).value("% Change"), Some(25.0));
    }

    #[test]
    fn test_metric_aggregate_targets() {
        let t = quarter_of_actuals();
        let sum = |target| metric_aggregate(&t, aggregate(AggregateOp::Sum, target), 2, None, None).unwrap();

        assert_eq!(sum(AggregateTarget::Cogs).value("Sum"), Some(80.0));
        assert_eq!(sum(AggregateTarget::Opex).value("Sum"), Some(20.0));
        // (90 - 40 - 10) + (150 - 40 - 10)
        assert_eq!(sum(AggregateTarget::Ebitda).value("Sum"), Some(140.0));
        assert_eq!(sum(AggregateTarget::BudgetRevenue).value("Sum"), Some(180.0));
        assert_eq!(sum(AggregateTarget::Cash).value("Sum"), Some(1_000.0));

        let acme_cash = metric_aggregate(
            &t,
            aggregate(AggregateOp::Diff, AggregateTarget::Cash),
            2,
            None,
            Some("acme"),
        )
        .unwrap();
        assert_eq!(acme_cash.value("Change"), Some(-50.0));
    }

    #[test]
    fn test_metric_aggregate_anchor_and_short_window() {
        let t = quarter_of_actuals();

        let anchored = metric_aggregate(
            &t,
            aggregate(AggregateOp::Sum, AggregateTarget::Revenue),
            2,
            Some(m("2025-04")),
            None,
        )
        .unwrap();
        assert_eq!(anchored.value("Sum"), Some(220.0));

        let long = metric_aggregate(
            &t,
            aggregate(AggregateOp::Avg, AggregateTarget::BudgetRevenue),
            6,
            None,
            None,
        )
        .unwrap();
        assert_eq!(long.value("Average"), Some(90.0));
        assert!(long
            .warnings
            .iter()
            .any(|w| w.contains("Only 2 month(s) of budget available; 6 requested")));
    }

    #[test]
    fn test_metric_aggregate_undefined_cases() {
        let t = tables(
            vec![
                ledger("2025-05", "Acme", "COGS", 10.0, "USD"),
                ledger("2025-06", "Acme", "Revenue", 50.0, "USD"),
            ],
            vec![],
            vec![],
            vec![],
        );

        let pct = metric_aggregate(
            &t,
            aggregate(AggregateOp::PctChange, AggregateTarget::Revenue),
            2,
            None,
            None,
        )
        .unwrap();
        assert!(!pct.figure("% Change").unwrap().is_defined());
        assert!(pct.warnings.iter().any(|w| w.contains("No revenue rows in actuals for 2025-05")));

        let single = metric_aggregate(
            &t,
            aggregate(AggregateOp::Diff, AggregateTarget::Revenue),
            1,
            None,
            None,
        )
        .unwrap();
        assert!(!single.figure("Change").unwrap().is_defined());

        let empty = metric_aggregate(
            &t,
            aggregate(AggregateOp::Sum, AggregateTarget::Cash),
            3,
            None,
            None,
        )
        .unwrap();
        assert!(!empty.figure("Sum").unwrap().is_defined());
        assert!(empty.series.is_empty());
    }

    #[test]
    fn test_metric_aggregate_missing_sheet_is_an_error() {
        let t = Tables::new(Dataset {
            actuals: Some(vec![ledger("2025-06", "Acme", "Revenue", 1.0, "USD")]),
            ..Default::default()
        });
        let cash = aggregate(AggregateOp::Sum, AggregateTarget::Cash);
        assert!(metric_aggregate(&t, cash, 3, None, None).is_err());
        assert!(budget_revenue(&t, None, None).is_err());
    }

    #[test]
    fn test_metric_series_covers_calendar_range() {
        let t = quarter_of_actuals();

        let result = metric_series(&t, AggregateTarget::Revenue, m("2025-06"), m("2025-02"), None).unwrap();
        let series: Vec<(&str, f64)> = result
            .series
            .iter()
            .map(|p| (p.label.as_str(), p.value))
            .collect();
        assert_eq!(
            series,
            vec![
                ("2025-02", 0.0),
                ("2025-03", 100.0),
                ("2025-04", 120.0),
                ("2025-05", 90.0),
                ("2025-06", 150.0),
            ]
        );
        assert_eq!(result.value("Total"), Some(460.0));
        assert!(result.warnings.iter().any(|w| w.contains("2025-02")));

        let cash = metric_series(&t, AggregateTarget::Cash, m("2025-04"), m("2025-06"), None).unwrap();
        assert_eq!(cash.series.len(), 2);
        assert!(cash.warnings.iter().any(|w| w.contains("No cash balance for 2025-04")));
    }

    #[test]
    fn test_budget_revenue() {
        let t = quarter_of_actuals();

        let latest = budget_revenue(&t, None, Some("Acme")).unwrap();
        assert_eq!(latest.metric, Some(MetricId::BudgetRevenue));
        assert_eq!(latest.value("Budget Revenue"), Some(100.0));
        assert!(latest.answer_text.contains("latest month in budget"));

        let may = budget_revenue(&t, Some(m("2025-05")), None).unwrap();
        assert_eq!(may.value("Budget Revenue"), Some(80.0));
    }
}
