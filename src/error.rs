use thiserror::Error;

#[derive(Error, Debug)]
pub enum CopilotError {
    #[error("Sheet '{0}' is not present in the workbook")]
    MissingTable(String),

    #[error("Sheet '{sheet}' is missing required column '{column}'")]
    MissingColumn { sheet: String, column: String },

    #[error("Sheet '{0}' has no header row")]
    EmptySheet(String),

    #[error("Sheet '{sheet}', line {line}: cannot read {column} value '{value}'")]
    MalformedValue {
        sheet: String,
        line: usize,
        column: String,
        value: String,
    },

    #[error("No FX rate for {currency} in {month}")]
    MissingFxRate { month: String, currency: String },

    #[error("Invalid month '{0}': expected YYYY-MM")]
    InvalidMonth(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl CopilotError {
    /// True for errors that mean the dataset cannot serve the request,
    /// as opposed to a bad question or bad configuration.
    pub fn is_data_error(&self) -> bool {
        matches!(
            self,
            CopilotError::MissingTable(_)
                | CopilotError::MissingColumn { .. }
                | CopilotError::EmptySheet(_)
                | CopilotError::MalformedValue { .. }
                | CopilotError::MissingFxRate { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CopilotError>;
