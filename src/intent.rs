//! Intent classifier.
//!
//! Maps a free-text question to a [`MetricId`] plus parameters using an
//! ordered keyword rule table. The first rule whose phrase groups all match
//! wins, so more specific rules sit above broader ones. Aggregate questions
//! ("avg of revenue last 3 months") are recognized before any rule runs.

use crate::config::CopilotConfig;
use crate::schema::{
    Aggregate, AggregateOp, AggregateTarget, Classification, Dataset, Intent, MetricId, Month,
};
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;

struct Rule {
    metric: MetricId,
    /// Every group must match; a group matches if any of its phrases does.
    all_of: &'static [&'static [&'static str]],
    none_of: &'static [&'static str],
}

const OPEX_WORDS: &[&str] = &["opex", "expense", "operating expense", "spend"];

const RULES: &[Rule] = &[
    Rule {
        metric: MetricId::CashRunway,
        all_of: &[&["runway", "burn"]],
        none_of: &[],
    },
    Rule {
        metric: MetricId::Ebitda,
        all_of: &[&["ebitda"]],
        none_of: &[],
    },
    Rule {
        metric: MetricId::GrossMarginTrend,
        all_of: &[&["margin", "gm", "gm%", "gross profit"]],
        none_of: &["operating margin", "net margin"],
    },
    Rule {
        metric: MetricId::OpexByCategory,
        all_of: &[
            OPEX_WORDS,
            &["category", "categories", "subcategory", "subcategories", "breakdown", "break down", "split"],
        ],
        none_of: &[],
    },
    Rule {
        metric: MetricId::OpexTotal,
        all_of: &[&["opex", "expense", "operating expense"]],
        none_of: &[],
    },
    Rule {
        metric: MetricId::BudgetRevenue,
        all_of: &[&["budget revenue", "budgeted revenue", "revenue budget", "planned revenue"]],
        none_of: &["vs", "versus", "variance", "against", "actual", "compare", "compared"],
    },
    Rule {
        metric: MetricId::RevenueVsBudget,
        all_of: &[&["revenue", "sales"], &["budget", "plan", "variance", "forecast"]],
        none_of: &[],
    },
    Rule {
        metric: MetricId::Cogs,
        all_of: &[&["cogs", "cost of goods sold", "cost of sales"]],
        none_of: &[],
    },
    Rule {
        metric: MetricId::Revenue,
        all_of: &[&["revenue", "sales"]],
        none_of: &[],
    },
    Rule {
        metric: MetricId::CashBalance,
        all_of: &[&["cash"]],
        none_of: &["cash flow"],
    },
    Rule {
        metric: MetricId::FxRate,
        all_of: &[&["fx", "exchange rate", "conversion rate", "rate"]],
        none_of: &[],
    },
];

impl Rule {
    fn matches(&self, tokens: &[String]) -> bool {
        self.all_of
            .iter()
            .all(|group| group.iter().any(|phrase| contains_phrase(tokens, phrase)))
            && !self.none_of.iter().any(|phrase| contains_phrase(tokens, phrase))
    }
}

/// Currencies recognized in fx questions even when the fx sheet lacks them.
pub const COMMON_CURRENCIES: &[&str] = &["USD", "EUR", "GBP", "INR", "CAD", "AUD", "JPY", "CHF", "CNY"];

const MONTH_NAMES: &[(&str, u32)] = &[
    ("jan", 1),
    ("feb", 2),
    ("mar", 3),
    ("apr", 4),
    ("may", 5),
    ("jun", 6),
    ("jul", 7),
    ("aug", 8),
    ("sep", 9),
    ("oct", 10),
    ("nov", 11),
    ("dec", 12),
];

static NUMERIC_MONTH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(20\d{2})[-/.](0?[1-9]|1[0-2])\b").expect("numeric month pattern"));

static NAMED_MONTH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(january|jan|february|feb|march|mar|april|apr|may|june|jun|july|jul|august|aug|september|sept|sep|october|oct|november|nov|december|dec)\.?,?\s+(20\d{2})\b",
    )
    .expect("named month pattern")
});

static LOOKBACK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:last|past|trailing)\s+(\d{1,4})\s+months?\b").expect("lookback pattern")
});

static AGGREGATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(%\s*change|\bpct\s*change|\bpercent(?:age)?\s+change|\b(?:sum|total|avg|average|mean|min|minimum|max|maximum|diff|difference|change))\s+(?:of|in)\s+(budget(?:ed)?[\s_]*revenue|revenue\s+budget|revenue|sales|cogs|opex|operating\s+expenses?|ebitda|cash)\b",
    )
    .expect("aggregate pattern")
});

static FOR_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bFOR\s+([A-Z]{3})\b").expect("for-code pattern"));
static TO_USD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bTO\s+USD\b").expect("to-usd pattern"));
static IN_TO_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:IN|TO)\s+([A-Z]{3})\b").expect("in/to-code pattern"));
static CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b([A-Z]{3})\b").expect("code pattern"));

/// Lower-cased words; anything but letters, digits, `%` and `&` separates.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '%' || c == '&'))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn token_matches(token: &str, word: &str) -> bool {
    token == word || token.strip_suffix('s') == Some(word)
}

/// Whether `phrase` appears as a consecutive run of tokens. Each token may
/// carry a trailing plural `s`.
fn contains_phrase(tokens: &[String], phrase: &str) -> bool {
    let words = tokenize(phrase);
    if words.is_empty() || words.len() > tokens.len() {
        return false;
    }
    tokens
        .windows(words.len())
        .any(|run| run.iter().zip(&words).all(|(t, w)| token_matches(t, w)))
}

pub fn parse_question_month(text: &str) -> Option<Month> {
    let lowered = text.to_lowercase();

    if let Some(caps) = NUMERIC_MONTH.captures(&lowered) {
        let year = caps[1].parse().ok()?;
        let month = caps[2].parse().ok()?;
        return Month::new(year, month);
    }

    let caps = NAMED_MONTH.captures(&lowered)?;
    let prefix = caps[1].get(..3)?;
    let month = MONTH_NAMES
        .iter()
        .find(|(name, _)| *name == prefix)
        .map(|(_, number)| *number)?;
    let year = caps[2].parse().ok()?;
    Month::new(year, month)
}

pub fn parse_lookback(text: &str) -> Option<u32> {
    let lowered = text.to_lowercase();
    LOOKBACK
        .captures(&lowered)
        .and_then(|caps| caps[1].parse::<u32>().ok())
        .filter(|n| *n > 0)
}

/// An "<op> of <metric>" phrase, e.g. `pct change of ebitda`.
pub fn parse_aggregate(text: &str) -> Option<Aggregate> {
    let lowered = text.to_lowercase();
    let caps = AGGREGATE.captures(&lowered)?;
    let op_text = caps[1].split_whitespace().collect::<Vec<_>>().join(" ");
    let target_text = &caps[2];

    let op = match op_text.as_str() {
        "sum" | "total" => AggregateOp::Sum,
        "avg" | "average" | "mean" => AggregateOp::Avg,
        "min" | "minimum" => AggregateOp::Min,
        "max" | "maximum" => AggregateOp::Max,
        "diff" | "difference" | "change" => AggregateOp::Diff,
        _ => AggregateOp::PctChange,
    };
    let target = if target_text.contains("budget") {
        AggregateTarget::BudgetRevenue
    } else {
        match target_text.split_whitespace().next()? {
            "revenue" | "sales" => AggregateTarget::Revenue,
            "cogs" => AggregateTarget::Cogs,
            "opex" | "operating" => AggregateTarget::Opex,
            "ebitda" => AggregateTarget::Ebitda,
            "cash" => AggregateTarget::Cash,
            _ => return None,
        }
    };
    Some(Aggregate { op, target })
}

pub struct IntentClassifier {
    /// Known entities with their tokens, longest first.
    entities: Vec<(String, Vec<String>)>,
    currencies: BTreeSet<String>,
    default_lookback: u32,
}

impl IntentClassifier {
    pub fn new<I, S>(known_entities: I, default_lookback: u32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut entities: Vec<(String, Vec<String>)> = known_entities
            .into_iter()
            .map(|name| {
                let name: String = name.into();
                let tokens = tokenize(&name);
                (name, tokens)
            })
            .filter(|(_, tokens)| !tokens.is_empty())
            .collect();
        entities.sort_by(|a, b| {
            b.1.len()
                .cmp(&a.1.len())
                .then_with(|| b.0.len().cmp(&a.0.len()))
                .then_with(|| a.0.cmp(&b.0))
        });

        Self {
            entities,
            currencies: COMMON_CURRENCIES.iter().map(|c| c.to_string()).collect(),
            default_lookback: default_lookback.max(1),
        }
    }

    /// Adds currency codes (e.g. those in the fx sheet) to the recognized set.
    pub fn with_currencies<I, S>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for code in codes {
            let code = code.as_ref().trim().to_ascii_uppercase();
            if code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic()) {
                self.currencies.insert(code);
            }
        }
        self
    }

    pub fn for_dataset(dataset: &Dataset, config: &CopilotConfig) -> Self {
        Self::new(dataset.entities(), config.default_lookback_months).with_currencies(dataset.currencies())
    }

    pub fn classify(&self, question: &str) -> Classification {
        let tokens = tokenize(question);
        let unrecognized = || Classification::Unrecognized {
            question: question.to_string(),
        };

        if tokens.is_empty() {
            return unrecognized();
        }

        let aggregate = parse_aggregate(question);
        let metric = match (aggregate, RULES.iter().find(|rule| rule.matches(&tokens))) {
            (Some(_), _) => MetricId::MetricAggregate,
            (None, Some(rule)) => rule.metric,
            (None, None) => {
                debug!("No rule matched question {:?}", question);
                return unrecognized();
            }
        };

        let mut intent = Intent::new(metric);
        intent.aggregate = aggregate;
        intent.month = parse_question_month(question);
        intent.entity = self.find_entity(&tokens);
        if metric.needs_lookback() {
            intent.lookback_months = Some(parse_lookback(question).unwrap_or(self.default_lookback));
        }
        if metric == MetricId::FxRate {
            intent.currency = self.find_currency(question);
        }

        debug!("Classified {:?} as {:?}", question, intent);
        Classification::Recognized(intent)
    }

    /// The longest known entity whose tokens appear as a consecutive run.
    fn find_entity(&self, tokens: &[String]) -> Option<String> {
        self.entities
            .iter()
            .find(|(_, words)| {
                words.len() <= tokens.len() && tokens.windows(words.len()).any(|run| run == words.as_slice())
            })
            .map(|(name, _)| name.clone())
    }

    fn find_currency(&self, question: &str) -> Option<String> {
        let upper = question.to_uppercase();
        let known = |caps: regex::Captures<'_>| {
            let code = caps[1].to_string();
            self.currencies.contains(&code).then_some(code)
        };

        if let Some(code) = FOR_CODE.captures_iter(&upper).find_map(known) {
            return Some(code);
        }

        let codes: Vec<String> = CODE.captures_iter(&upper).filter_map(known).collect();
        if TO_USD.is_match(&upper) {
            if let Some(code) = codes.iter().find(|c| c.as_str() != "USD") {
                return Some(code.clone());
            }
        }

        if let Some(code) = IN_TO_CODE.captures_iter(&upper).find_map(known) {
            return Some(code);
        }

        codes
            .iter()
            .find(|c| c.as_str() != "USD")
            .or_else(|| codes.first())
            .cloned()
    }
}
