use crate::schema::Dataset;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum AccountClass {
    Revenue,
    CostOfSales,
    OperatingExpense,
    Other,
}

const OPEX_PREFIX: &str = "opex";

const REVENUE_LABELS: &[&str] = &[
    "revenue",
    "revenues",
    "sales",
    "net sales",
    "sales revenue",
    "income",
    "operating revenue",
];

const COGS_LABELS: &[&str] = &[
    "cogs",
    "cost of goods sold",
    "cost of sales",
    "cost of revenue",
];

const OPEX_LABELS: &[&str] = &[
    "operating expense",
    "sales & marketing",
    "sales and marketing",
    "marketing",
    "r&d",
    "research",
    "g&a",
    "general & administrative",
    "general and administrative",
    "admin",
    "salaries",
    "payroll",
    "rent",
    "facilities",
    "travel",
    "software",
    "professional fees",
    "utilities",
    "insurance",
];

impl AccountClass {
    /// Classifies an `account_category` label. Matching is case-insensitive;
    /// see the label lists above for the vocabulary.
    pub fn of(label: &str) -> Self {
        let label = label.trim().to_lowercase();

        if label.starts_with(OPEX_PREFIX) {
            return AccountClass::OperatingExpense;
        }
        if COGS_LABELS
            .iter()
            .any(|l| label == *l || label.starts_with(l))
        {
            return AccountClass::CostOfSales;
        }
        if REVENUE_LABELS.contains(&label.as_str()) || label.starts_with("revenue") {
            return AccountClass::Revenue;
        }
        if OPEX_LABELS.iter().any(|l| contains_phrase(&label, l)) {
            return AccountClass::OperatingExpense;
        }
        AccountClass::Other
    }
}

fn words(text: &str) -> Vec<&str> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '&'))
        .filter(|w| !w.is_empty())
        .collect()
}

/// A label word matches a vocabulary word exactly or as its plural.
fn word_matches(word: &str, vocab: &str) -> bool {
    word == vocab || word.strip_suffix('s') == Some(vocab)
}

/// Whole-word match, so `rent` does not match `current`.
fn contains_phrase(label: &str, phrase: &str) -> bool {
    let label = words(label);
    let phrase = words(phrase);
    !phrase.is_empty()
        && label
            .windows(phrase.len())
            .any(|w| w.iter().zip(&phrase).all(|(word, vocab)| word_matches(word, vocab)))
}

/// The opex sub-category for a label: the text after an `Opex` prefix and its
/// separator (`Opex: Marketing` -> `Marketing`), otherwise the label itself.
/// A bare `Opex` label is reported as `Uncategorized`.
pub fn opex_category(label: &str) -> String {
    let trimmed = label.trim();
    let rest = if trimmed.to_lowercase().starts_with(OPEX_PREFIX) {
        trimmed
            .get(OPEX_PREFIX.len()..)
            .unwrap_or("")
            .trim_start_matches(|c: char| c == ':' || c == '-' || c == '/' || c.is_whitespace())
    } else {
        trimmed
    };

    if rest.is_empty() {
        "Uncategorized".to_string()
    } else {
        rest.to_string()
    }
}

/// The category labels found in a dataset, grouped by how the metrics
/// treat them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChartOfAccounts {
    pub revenue: Vec<String>,
    pub cost_of_sales: Vec<String>,
    pub operating_expenses: Vec<String>,
    pub other: Vec<String>,
}

impl ChartOfAccounts {
    pub fn from_dataset(dataset: &Dataset) -> Self {
        let labels: BTreeSet<&str> = dataset
            .actuals
            .iter()
            .flatten()
            .chain(dataset.budget.iter().flatten())
            .map(|r| r.account_category.as_str())
            .collect();

        let mut chart = ChartOfAccounts::default();
        for label in labels {
            let bucket = match AccountClass::of(label) {
                AccountClass::Revenue => &mut chart.revenue,
                AccountClass::CostOfSales => &mut chart.cost_of_sales,
                AccountClass::OperatingExpense => &mut chart.operating_expenses,
                AccountClass::Other => &mut chart.other,
            };
            bucket.push(label.to_string());
        }
        chart
    }

    pub fn total_accounts(&self) -> usize {
        self.revenue.len() + self.cost_of_sales.len() + self.operating_expenses.len() + self.other.len()
    }

    pub fn to_markdown(&self) -> String {
        let mut output = String::new();
        output.push_str("# Chart of Accounts\n\n");

        for (title, accounts) in [
            ("Revenue", &self.revenue),
            ("Cost of Sales", &self.cost_of_sales),
            ("Operating Expenses", &self.operating_expenses),
            ("Unclassified", &self.other),
        ] {
            output.push_str(&format!("## {}\n\n", title));
            for account in accounts {
                output.push_str(&format!("- {}\n", account));
            }
            output.push('\n');
        }

        output
    }
}
