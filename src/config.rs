use crate::error::{CopilotError, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_LOOKBACK_MONTHS: u32 = 6;
pub const DEFAULT_BURN_WINDOW_MONTHS: usize = 3;
pub const DEFAULT_FX_WARNING_THRESHOLD: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct CopilotConfig {
    #[schemars(description = "Months in a trend window when the question does not say 'last N months'")]
    pub default_lookback_months: u32,

    #[schemars(description = "Number of month-over-month cash decreases averaged into the burn rate")]
    pub burn_window_months: usize,

    #[schemars(
        description = "Once more than this many rows are skipped for missing FX rates, the answer is flagged as partial"
    )]
    pub fx_warning_threshold: usize,
}

impl Default for CopilotConfig {
    fn default() -> Self {
        Self {
            default_lookback_months: DEFAULT_LOOKBACK_MONTHS,
            burn_window_months: DEFAULT_BURN_WINDOW_MONTHS,
            fx_warning_threshold: DEFAULT_FX_WARNING_THRESHOLD,
        }
    }
}

impl CopilotConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: CopilotConfig = serde_json::from_str(json)?;
        validate_config(&config)?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn schema_as_json() -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&schemars::schema_for!(CopilotConfig))
    }
}

pub fn validate_config(config: &CopilotConfig) -> Result<()> {
    if config.default_lookback_months == 0 {
        return Err(CopilotError::InvalidConfig(
            "default_lookback_months must be at least 1".to_string(),
        ));
    }
    if config.burn_window_months == 0 {
        return Err(CopilotError::InvalidConfig(
            "burn_window_months must be at least 1".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CopilotConfig::default();
        assert_eq!(config.default_lookback_months, 6);
        assert_eq!(config.burn_window_months, 3);
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = CopilotConfig::from_json_str(r#"{ "default_lookback_months": 12 }"#).unwrap();
        assert_eq!(config.default_lookback_months, 12);
        assert_eq!(config.burn_window_months, DEFAULT_BURN_WINDOW_MONTHS);
    }

    #[test]
    fn test_zero_windows_rejected() {
        let err = CopilotConfig::from_json_str(r#"{ "burn_window_months": 0 }"#).unwrap_err();
        assert!(matches!(err, CopilotError::InvalidConfig(_)));

        let err = CopilotConfig::from_json_str(r#"{ "default_lookback_months": 0 }"#).unwrap_err();
        assert!(matches!(err, CopilotError::InvalidConfig(_)));
    }

    #[test]
    fn test_malformed_json() {
        let err = CopilotConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, CopilotError::SerializationError(_)));
    }
}
