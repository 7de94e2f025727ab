use crate::error::{CopilotError, Result};
use crate::utils::{format_usd, next_month_start, parse_month, prev_month_start};
use chrono::{Datelike, NaiveDate};
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// A calendar month. Always stored as the first day of the month and
/// rendered as canonical `YYYY-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Month(NaiveDate);

impl Month {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, 1).map(Month)
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Month(date.with_day(1).unwrap_or(date))
    }

    pub fn year(&self) -> i32 {
        self.0.year()
    }

    pub fn month(&self) -> u32 {
        self.0.month()
    }

    pub fn first_day(&self) -> NaiveDate {
        self.0
    }

    pub fn succ(&self) -> Self {
        Month(next_month_start(self.0))
    }

    pub fn pred(&self) -> Self {
        Month(prev_month_start(self.0))
    }

    /// Whether `next` is the calendar month directly after `self`.
    pub fn is_followed_by(&self, next: Month) -> bool {
        self.succ() == next
    }
}

impl fmt::Display for Month {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year(), self.month())
    }
}

impl FromStr for Month {
    type Err = CopilotError;

    fn from_str(s: &str) -> Result<Self> {
        parse_month(s)
    }
}

impl Serialize for Month {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Month {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_month(&raw).map_err(serde::de::Error::custom)
    }
}

impl JsonSchema for Month {
    fn schema_name() -> String {
        "Month".to_string()
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        String::json_schema(gen)
    }
}

/// One row of the actuals or budget sheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRow {
    pub month: Month,
    pub entity: String,
    pub account_category: String,
    pub amount: f64,
    /// ISO 4217 code, upper-cased at load.
    pub currency: String,
}

pub type ActualsRow = LedgerRow;
pub type BudgetRow = LedgerRow;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FxRow {
    pub month: Month,
    pub currency: String,
    pub rate_to_usd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CashRow {
    pub month: Month,
    pub entity: String,
    pub cash_usd: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    Actuals,
    Budget,
    Fx,
    Cash,
}

impl TableKind {
    pub const ALL: [TableKind; 4] = [
        TableKind::Actuals,
        TableKind::Budget,
        TableKind::Fx,
        TableKind::Cash,
    ];

    pub fn sheet_name(&self) -> &'static str {
        match self {
            TableKind::Actuals => "actuals",
            TableKind::Budget => "budget",
            TableKind::Fx => "fx",
            TableKind::Cash => "cash",
        }
    }
}

/// The validated tables of one workbook. A `None` table was absent from the
/// source; metrics that need it report [`CopilotError::MissingTable`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dataset {
    pub actuals: Option<Vec<ActualsRow>>,
    pub budget: Option<Vec<BudgetRow>>,
    pub fx: Option<Vec<FxRow>>,
    pub cash: Option<Vec<CashRow>>,
}

impl Dataset {
    pub fn actuals(&self) -> Result<&[ActualsRow]> {
        self.actuals.as_deref().ok_or_else(|| missing(TableKind::Actuals))
    }

    pub fn budget(&self) -> Result<&[BudgetRow]> {
        self.budget.as_deref().ok_or_else(|| missing(TableKind::Budget))
    }

    pub fn fx(&self) -> Result<&[FxRow]> {
        self.fx.as_deref().ok_or_else(|| missing(TableKind::Fx))
    }

    pub fn cash(&self) -> Result<&[CashRow]> {
        self.cash.as_deref().ok_or_else(|| missing(TableKind::Cash))
    }

    /// FX rows, or an empty slice when the sheet is absent. Ledgers that are
    /// entirely in USD never need the sheet, so its absence only shows up as
    /// per-row missing-rate warnings.
    pub fn fx_or_empty(&self) -> &[FxRow] {
        self.fx.as_deref().unwrap_or(&[])
    }

    pub fn has_table(&self, kind: TableKind) -> bool {
        match kind {
            TableKind::Actuals => self.actuals.is_some(),
            TableKind::Budget => self.budget.is_some(),
            TableKind::Fx => self.fx.is_some(),
            TableKind::Cash => self.cash.is_some(),
        }
    }

    /// Distinct entity names across actuals, budget and cash, sorted.
    pub fn entities(&self) -> Vec<String> {
        let mut names = BTreeSet::new();
        for row in self.actuals.iter().flatten().chain(self.budget.iter().flatten()) {
            names.insert(row.entity.clone());
        }
        for row in self.cash.iter().flatten() {
            names.insert(row.entity.clone());
        }
        names.into_iter().filter(|n| !n.is_empty()).collect()
    }

    /// Distinct currency codes in the FX sheet.
    pub fn currencies(&self) -> Vec<String> {
        let codes: BTreeSet<String> = self.fx_or_empty().iter().map(|r| r.currency.clone()).collect();
        codes.into_iter().collect()
    }
}

fn missing(kind: TableKind) -> CopilotError {
    CopilotError::MissingTable(kind.sheet_name().to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MetricId {
    RevenueVsBudget,
    GrossMarginTrend,
    OpexByCategory,
    CashRunway,
    Revenue,
    Cogs,
    OpexTotal,
    Ebitda,
    CashBalance,
    FxRate,
    BudgetRevenue,
    MetricAggregate,
}

impl MetricId {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricId::RevenueVsBudget => "revenue_vs_budget",
            MetricId::GrossMarginTrend => "gross_margin_trend",
            MetricId::OpexByCategory => "opex_by_category",
            MetricId::CashRunway => "cash_runway",
            MetricId::Revenue => "revenue",
            MetricId::Cogs => "cogs",
            MetricId::OpexTotal => "opex_total",
            MetricId::Ebitda => "ebitda",
            MetricId::CashBalance => "cash_balance",
            MetricId::FxRate => "fx_rate",
            MetricId::BudgetRevenue => "budget_revenue",
            MetricId::MetricAggregate => "metric_aggregate",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            MetricId::RevenueVsBudget => "Revenue vs Budget",
            MetricId::GrossMarginTrend => "Gross Margin % Trend",
            MetricId::OpexByCategory => "Opex by Category",
            MetricId::CashRunway => "Cash Runway",
            MetricId::Revenue => "Revenue",
            MetricId::Cogs => "COGS",
            MetricId::OpexTotal => "Total Opex",
            MetricId::Ebitda => "EBITDA",
            MetricId::CashBalance => "Cash Balance",
            MetricId::FxRate => "FX Rate",
            MetricId::BudgetRevenue => "Budget Revenue",
            MetricId::MetricAggregate => "Metric Aggregate",
        }
    }

    pub fn needs_lookback(&self) -> bool {
        matches!(self, MetricId::GrossMarginTrend | MetricId::MetricAggregate)
    }
}

impl fmt::Display for MetricId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a monthly series is folded into one figure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AggregateOp {
    Sum,
    Avg,
    Min,
    Max,
    /// Last month minus first month.
    Diff,
    /// Last month against first month, in percent.
    PctChange,
}

impl AggregateOp {
    pub fn label(&self) -> &'static str {
        match self {
            AggregateOp::Sum => "Sum",
            AggregateOp::Avg => "Average",
            AggregateOp::Min => "Minimum",
            AggregateOp::Max => "Maximum",
            AggregateOp::Diff => "Change",
            AggregateOp::PctChange => "% Change",
        }
    }
}

/// The monthly figure an aggregate runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AggregateTarget {
    Revenue,
    Cogs,
    Opex,
    Ebitda,
    Cash,
    BudgetRevenue,
}

impl AggregateTarget {
    pub fn label(&self) -> &'static str {
        match self {
            AggregateTarget::Revenue => "revenue",
            AggregateTarget::Cogs => "COGS",
            AggregateTarget::Opex => "opex",
            AggregateTarget::Ebitda => "EBITDA",
            AggregateTarget::Cash => "cash",
            AggregateTarget::BudgetRevenue => "budget revenue",
        }
    }

    /// The sheet whose months anchor the window.
    pub fn table(&self) -> TableKind {
        match self {
            AggregateTarget::Cash => TableKind::Cash,
            AggregateTarget::BudgetRevenue => TableKind::Budget,
            _ => TableKind::Actuals,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Aggregate {
    pub op: AggregateOp,
    pub target: AggregateTarget,
}

/// A classified question: which metric to compute and with what parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Intent {
    pub metric: MetricId,
    pub month: Option<Month>,
    pub lookback_months: Option<u32>,
    /// Unset means all entities combined.
    pub entity: Option<String>,
    pub currency: Option<String>,
    /// Set only for [`MetricId::MetricAggregate`].
    #[serde(default)]
    pub aggregate: Option<Aggregate>,
}

impl Intent {
    pub fn new(metric: MetricId) -> Self {
        Self {
            metric,
            month: None,
            lookback_months: None,
            entity: None,
            currency: None,
            aggregate: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Classification {
    Recognized(Intent),
    Unrecognized { question: String },
}

impl Classification {
    pub fn intent(&self) -> Option<&Intent> {
        match self {
            Classification::Recognized(intent) => Some(intent),
            Classification::Unrecognized { .. } => None,
        }
    }

    pub fn metric(&self) -> Option<MetricId> {
        self.intent().map(|i| i.metric)
    }
}

/// A headline number. `Undefined` and `Unbounded` stand in for values that
/// would otherwise be NaN or infinite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Figure {
    Usd(f64),
    Percent(f64),
    Months(f64),
    Rate(f64),
    Text(String),
    Undefined { reason: String },
    Unbounded,
}

impl Figure {
    pub fn undefined(reason: impl Into<String>) -> Self {
        Figure::Undefined {
            reason: reason.into(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Figure::Usd(v) | Figure::Percent(v) | Figure::Months(v) | Figure::Rate(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_defined(&self) -> bool {
        !matches!(self, Figure::Undefined { .. })
    }
}

impl fmt::Display for Figure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Figure::Usd(v) => f.write_str(&format_usd(*v)),
            Figure::Percent(v) => write!(f, "{:.1}%", v),
            Figure::Months(v) => write!(f, "{:.1} months", v),
            Figure::Rate(v) => write!(f, "{:.4}", v),
            Figure::Text(s) => f.write_str(s),
            Figure::Undefined { reason } => write!(f, "n/a ({})", reason),
            Figure::Unbounded => f.write_str("effectively infinite"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Headline {
    pub label: String,
    pub figure: Figure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SeriesPoint {
    pub label: String,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ChartKind {
    Bar,
    Line,
    Pie,
    None,
}

/// The answer to one question, ready for a presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MetricResult {
    #[schemars(description = "The metric that produced this result; absent when the question was not recognized")]
    pub metric: Option<MetricId>,

    #[schemars(description = "Human-readable answer")]
    pub answer_text: String,

    #[schemars(description = "Headline numbers in display order")]
    pub headline: Vec<Headline>,

    #[schemars(description = "Chart-ready (label, value) pairs in display order")]
    pub series: Vec<SeriesPoint>,

    #[schemars(description = "Suggested chart type for the series")]
    pub chart: ChartKind,

    #[schemars(description = "Missing or partial data notes; empty when the answer is complete")]
    pub warnings: Vec<String>,

    #[schemars(description = "Rows left out of USD totals because no FX rate existed for their month")]
    #[serde(default)]
    pub fx_skipped_rows: usize,
}

impl MetricResult {
    pub fn new(metric: Option<MetricId>, answer_text: impl Into<String>) -> Self {
        Self {
            metric,
            answer_text: answer_text.into(),
            headline: Vec::new(),
            series: Vec::new(),
            chart: ChartKind::None,
            warnings: Vec::new(),
            fx_skipped_rows: 0,
        }
    }

    pub fn with_headline(mut self, label: impl Into<String>, figure: Figure) -> Self {
        self.headline.push(Headline {
            label: label.into(),
            figure,
        });
        self
    }

    pub fn with_series(mut self, chart: ChartKind, series: Vec<SeriesPoint>) -> Self {
        self.chart = chart;
        self.series = series;
        self
    }

    pub fn with_warnings<I, S>(mut self, warnings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.warnings.extend(warnings.into_iter().map(Into::into));
        self
    }

    pub fn with_fx_skipped(mut self, rows: usize) -> Self {
        self.fx_skipped_rows += rows;
        self
    }

    pub fn figure(&self, label: &str) -> Option<&Figure> {
        self.headline
            .iter()
            .find(|h| h.label.eq_ignore_ascii_case(label))
            .map(|h| &h.figure)
    }

    pub fn value(&self, label: &str) -> Option<f64> {
        self.figure(label).and_then(Figure::as_f64)
    }

    pub fn is_complete(&self) -> bool {
        self.warnings.is_empty()
    }

    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(MetricResult)
    }

    pub fn schema_as_json() -> std::result::Result<String, serde_json::Error> {
        let schema = Self::generate_json_schema();
        serde_json::to_string_pretty(&schema)
    }
}
