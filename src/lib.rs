//! # FP&A Copilot
//!
//! Answers natural-language finance questions ("What was June 2025 revenue vs
//! budget?", "What is our cash runway?") by classifying them into a fixed set
//! of metrics and computing those metrics deterministically over four tables:
//! actuals, budget, fx rates and cash balances.
//!
//! ## Core Concepts
//!
//! - **Workbook**: named sheets of raw strings (CSV files or in-memory rows)
//! - **Dataset**: the validated, strongly typed tables loaded from a workbook
//! - **Intent**: a metric id plus the month, lookback, entity, currency and aggregate found in the question
//! - **MetricResult**: answer text, headline figures, a chart-ready series and warnings
//!
//! All amounts are reported in USD. Rows whose currency has no fx rate for
//! their month are left out of totals and reported as warnings.
//!
//! ## Example
//!
//! ```rust,no_run
//! use fpna_copilot::{CopilotConfig, FinanceCopilot};
//!
//! let copilot = FinanceCopilot::from_csv_dir("fixtures", CopilotConfig::default())?;
//! let answer = copilot.ask("What was June 2025 revenue vs budget for Acme?");
//! println!("{}", answer.answer_text);
//! for warning in &answer.warnings {
//!     println!("warning: {}", warning);
//! }
//! # Ok::<(), fpna_copilot::CopilotError>(())
//! ```

pub mod accounts;
pub mod config;
pub mod currency;
pub mod error;
pub mod ingestion;
pub mod intent;
pub mod metrics;
pub mod router;
pub mod schema;
pub mod utils;

pub use accounts::{opex_category, AccountClass, ChartOfAccounts};
pub use config::{validate_config, CopilotConfig};
pub use currency::{convert_rows, to_usd, FxTable, BASE_CURRENCY};
pub use error::{CopilotError, Result};
pub use ingestion::{load, load_csv_dir, Sheet, Workbook};
pub use intent::IntentClassifier;
pub use metrics::Tables;
pub use router::{Router, EXAMPLE_QUESTIONS};
pub use schema::*;

use log::{debug, info};
use std::path::Path;

/// A loaded dataset ready to answer questions.
pub struct FinanceCopilot {
    tables: Tables,
    config: CopilotConfig,
    classifier: IntentClassifier,
}

impl FinanceCopilot {
    pub fn new(dataset: Dataset, config: CopilotConfig) -> Result<Self> {
        validate_config(&config)?;

        let classifier = IntentClassifier::for_dataset(&dataset, &config);
        let tables = Tables::new(dataset);

        info!(
            "Copilot ready: {} entities, {} fx rates",
            tables.dataset.entities().len(),
            tables.fx.len()
        );

        Ok(Self {
            tables,
            config,
            classifier,
        })
    }

    pub fn from_workbook(workbook: &Workbook, config: CopilotConfig) -> Result<Self> {
        Self::new(load(workbook)?, config)
    }

    pub fn from_csv_dir(dir: impl AsRef<Path>, config: CopilotConfig) -> Result<Self> {
        Self::new(load_csv_dir(dir)?, config)
    }

    /// Classifies and answers one question. Never fails: unrecognized
    /// questions and missing data come back as answers with warnings.
    pub fn ask(&self, question: &str) -> MetricResult {
        let classification = self.classify(question);
        debug!("Question {:?} -> {:?}", question, classification.metric());
        self.route(&classification)
    }

    pub fn classify(&self, question: &str) -> Classification {
        self.classifier.classify(question)
    }

    pub fn route(&self, classification: &Classification) -> MetricResult {
        Router::new(&self.tables, &self.config).route(classification)
    }

    pub fn dataset(&self) -> &Dataset {
        &self.tables.dataset
    }

    pub fn config(&self) -> &CopilotConfig {
        &self.config
    }

    pub fn chart_of_accounts(&self) -> ChartOfAccounts {
        ChartOfAccounts::from_dataset(&self.tables.dataset)
    }
}
