use crate::config::CopilotConfig;
use crate::error::{CopilotError, Result};
use crate::metrics::{self, Tables};
use crate::schema::{Classification, Figure, Intent, MetricId, MetricResult};
use log::{debug, warn};

/// Shown when a question matches no rule.
pub const EXAMPLE_QUESTIONS: &[&str] = &[
    "What was June 2025 revenue vs budget in USD?",
    "Show Gross Margin % trend for the last 3 months.",
    "Break down Opex by category for June 2025.",
    "What is our cash runway right now?",
    "EBITDA for Acme in 2025-06",
    "EUR to USD exchange rate for 2025-06",
    "Average of revenue for the last 3 months",
];

type Handler = fn(&Tables, &Intent, &CopilotConfig) -> Result<MetricResult>;

fn handler(metric: MetricId) -> Handler {
    match metric {
        MetricId::RevenueVsBudget => |t, i, _| metrics::revenue_vs_budget(t, i.month, i.entity.as_deref()),
        MetricId::GrossMarginTrend => |t, i, c| {
            let lookback = i.lookback_months.unwrap_or(c.default_lookback_months);
            metrics::gross_margin_trend(t, lookback, i.month, i.entity.as_deref())
        },
        MetricId::OpexByCategory => |t, i, _| metrics::opex_by_category(t, i.month, i.entity.as_deref()),
        MetricId::CashRunway => {
            |t, i, c| metrics::cash_runway(t, i.month, i.entity.as_deref(), c.burn_window_months)
        }
        MetricId::Revenue => |t, i, _| metrics::revenue(t, i.month, i.entity.as_deref()),
        MetricId::Cogs => |t, i, _| metrics::cogs(t, i.month, i.entity.as_deref()),
        MetricId::OpexTotal => |t, i, _| metrics::opex_total(t, i.month, i.entity.as_deref()),
        MetricId::Ebitda => |t, i, _| metrics::ebitda(t, i.month, i.entity.as_deref()),
        MetricId::CashBalance => |t, i, _| metrics::cash_balance(t, i.month, i.entity.as_deref()),
        MetricId::FxRate => |t, i, _| metrics::fx_rate(t, i.month, i.currency.as_deref()),
        MetricId::BudgetRevenue => |t, i, _| metrics::budget_revenue(t, i.month, i.entity.as_deref()),
        MetricId::MetricAggregate => |t, i, c| match i.aggregate {
            Some(aggregate) => {
                let lookback = i.lookback_months.unwrap_or(c.default_lookback_months);
                metrics::metric_aggregate(t, aggregate, lookback, i.month, i.entity.as_deref())
            }
            None => Ok(MetricResult::new(
                Some(MetricId::MetricAggregate),
                "Name an operation and a metric, for example \"sum of revenue\".",
            )
            .with_headline(MetricId::MetricAggregate.title(), Figure::undefined("no aggregate given"))
            .with_warnings(["No aggregate operation in the question".to_string()])),
        },
    }
}

/// Dispatches classified questions to the metric library. Every outcome,
/// including failures, comes back as a [`MetricResult`].
pub struct Router<'a> {
    tables: &'a Tables,
    config: &'a CopilotConfig,
}

impl<'a> Router<'a> {
    pub fn new(tables: &'a Tables, config: &'a CopilotConfig) -> Self {
        Self { tables, config }
    }

    pub fn route(&self, classification: &Classification) -> MetricResult {
        match classification {
            Classification::Unrecognized { question } => unrecognized_result(question),
            Classification::Recognized(intent) => self.dispatch(intent),
        }
    }

    fn dispatch(&self, intent: &Intent) -> MetricResult {
        debug!("Routing {} with {:?}", intent.metric, intent);

        match handler(intent.metric)(self.tables, intent, self.config) {
            Ok(result) => self.flag_partial(result),
            Err(err) => {
                warn!("{} failed: {}", intent.metric, err);
                failure_result(intent.metric, &err)
            }
        }
    }

    fn flag_partial(&self, result: MetricResult) -> MetricResult {
        let skipped = result.fx_skipped_rows;
        if skipped > self.config.fx_warning_threshold {
            result.with_warnings([format!(
                "Partial answer: {} row(s) had no FX rate and were left out of the USD totals",
                skipped
            )])
        } else {
            result
        }
    }
}

fn unrecognized_result(question: &str) -> MetricResult {
    let mut text = format!(
        "Sorry, no metric matched \"{}\". Try asking one of these:",
        question.trim()
    );
    for example in EXAMPLE_QUESTIONS {
        text.push_str("\n- ");
        text.push_str(example);
    }
    MetricResult::new(None, text)
}

fn failure_result(metric: MetricId, err: &CopilotError) -> MetricResult {
    let answer = match err {
        CopilotError::MissingTable(sheet) => format!(
            "{} needs the {} sheet, which is not in the loaded workbook.",
            metric.title(),
            sheet
        ),
        other if other.is_data_error() => format!(
            "{} could not be computed from the loaded data: {}",
            metric.title(),
            other
        ),
        other => format!("{} could not be computed: {}", metric.title(), other),
    };
    MetricResult::new(Some(metric), answer)
        .with_headline(metric.title(), Figure::undefined("data unavailable"))
        .with_warnings([err.to_string()])
}
