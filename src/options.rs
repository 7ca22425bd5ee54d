//! Validated server options.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::Display;
use validator::{Validate, ValidationError};

use crate::protocol::FIELD_NAME_LEN;

/// Statistics that can be enabled.
#[derive(
    Clone, Copy, Debug, Deserialize, Display, Eq, Hash, PartialEq, Serialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum Operation {
    Mean,
    Variance,
    Skewness,
    Kurtosis,
    MinMax,
    Threshold,
    Quantile,
    Sobol,
}

/// Algorithm used to estimate Sobol' indices.
#[derive(Clone, Copy, Debug, Default, Deserialize, Display, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SobolMethod {
    #[default]
    Martinez,
}

/// Options governing one server run. Read-only once validated.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, Validate)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = "validate_options"))]
pub struct Options {
    #[validate(range(min = 1, message = "nb_time_steps must be greater than 0"))]
    pub nb_time_steps: usize,
    pub nb_parameters: usize,
    /// Number of design points. The run ends when this many groups have finished.
    #[validate(range(min = 1, message = "sampling_size must be greater than 0"))]
    pub sampling_size: usize,
    #[validate(length(min = 1, message = "at least one operation must be enabled"))]
    pub operations: Vec<Operation>,
    #[serde(default)]
    pub thresholds: Vec<f64>,
    #[serde(default)]
    #[validate(custom = "validate_quantiles")]
    pub quantiles: Vec<f64>,
    #[serde(default)]
    pub sobol_method: SobolMethod,
    /// 1 for first order indices only, 2 to also track total order convergence.
    #[validate(range(min = 1, max = 2, message = "sobol_max_order must be 1 or 2"))]
    pub sobol_max_order: u8,
    #[validate(
        length(min = 1, message = "at least one field must be configured"),
        custom = "validate_fields"
    )]
    pub fields: Vec<String>,
    /// Seconds between checkpoints.
    #[validate(range(min = 1, message = "checkpoint_interval must be greater than 0"))]
    pub checkpoint_interval: u64,
    /// Seconds of silence after which a running group is reset.
    #[validate(range(min = 1, message = "timeout_simu must be greater than 0"))]
    pub timeout_simu: u64,
    /// Seconds of launcher silence before a warning and checkpoint.
    #[validate(range(min = 1, message = "launcher_timeout must be greater than 0"))]
    pub launcher_timeout: u64,
    pub restart_dir: PathBuf,
    #[serde(default)]
    pub restart: bool,
    #[serde(default)]
    pub learning_mode: bool,
    #[serde(default)]
    pub verbosity: i32,
    #[serde(default)]
    pub convergence_tolerance: Option<f64>,
}

impl Options {
    pub fn has(&self, operation: Operation) -> bool {
        self.operations.contains(&operation)
    }

    pub fn sobol_enabled(&self) -> bool {
        self.has(Operation::Sobol)
    }

    /// Highest moment order needed: 0 (none), 1 (mean), 2 (variance) or 4 (skewness/kurtosis).
    pub fn moment_order(&self) -> u8 {
        if self.has(Operation::Skewness) || self.has(Operation::Kurtosis) {
            4
        } else if self.has(Operation::Variance) {
            2
        } else if self.has(Operation::Mean) {
            1
        } else {
            0
        }
    }

    /// Vectors carried by each data message.
    pub fn vectors_per_message(&self) -> usize {
        if self.sobol_enabled() {
            self.nb_parameters + 2
        } else {
            1
        }
    }

    /// Position of a field in the configured list.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|field| field == name)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval)
    }

    pub fn timeout_simu(&self) -> Duration {
        Duration::from_secs(self.timeout_simu)
    }

    pub fn launcher_timeout(&self) -> Duration {
        Duration::from_secs(self.launcher_timeout)
    }
}

/// Validate that quantile orders lie in (0, 1)
fn validate_quantiles(quantiles: &[f64]) -> Result<(), ValidationError> {
    if let Some(order) = quantiles.iter().find(|q| q.is_nan() || **q <= 0.0 || **q >= 1.0) {
        let mut error = ValidationError::new("quantile orders must lie in (0, 1)");
        error.add_param("order".into(), order);
        return Err(error);
    }
    Ok(())
}

/// Validate field names fit on the wire and are unique
fn validate_fields(fields: &[String]) -> Result<(), ValidationError> {
    for (i, field) in fields.iter().enumerate() {
        if field.is_empty() || field.len() > FIELD_NAME_LEN || field.contains('\0') {
            let mut error = ValidationError::new(
                "field names must be non-empty, NUL-free and at most 128 bytes",
            );
            error.add_param("field".into(), field);
            return Err(error);
        }
        if fields[..i].contains(field) {
            let mut error = ValidationError::new("field names must be unique");
            error.add_param("field".into(), field);
            return Err(error);
        }
    }
    Ok(())
}

/// Validate combinations of options
fn validate_options(options: &Options) -> Result<(), ValidationError> {
    if options.has(Operation::Threshold) && options.thresholds.is_empty() {
        return Err(ValidationError::new(
            "threshold operation requires at least one threshold",
        ));
    }
    if options.has(Operation::Quantile) && options.quantiles.is_empty() {
        return Err(ValidationError::new(
            "quantile operation requires at least one quantile order",
        ));
    }
    if options.sobol_enabled() && options.nb_parameters == 0 {
        return Err(ValidationError::new(
            "sobol operation requires nb_parameters greater than 0",
        ));
    }
    if let Some(tolerance) = options.convergence_tolerance {
        if tolerance.is_nan() || tolerance <= 0.0 {
            let mut error = ValidationError::new("convergence_tolerance must be positive");
            error.add_param("tolerance".into(), &tolerance);
            return Err(error);
        }
        if !options.sobol_enabled() {
            return Err(ValidationError::new(
                "convergence_tolerance requires the sobol operation",
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;
    use serde_test::{assert_tokens, Token};

    #[test]
    fn test_options_valid() {
        test_utils::get_test_options().validate().unwrap();
        test_utils::get_test_sobol_options().validate().unwrap();
    }

    #[test]
    fn test_operation_tokens() {
        assert_tokens(
            &Operation::MinMax,
            &[Token::UnitVariant {
                name: "Operation",
                variant: "min_max",
            }],
        );
        assert_eq!("min_max", Operation::MinMax.to_string());
    }

    #[test]
    fn test_json_round_trip() {
        let options = test_utils::get_test_sobol_options();
        let json = serde_json::to_string(&options).unwrap();
        assert_eq!(options, serde_json::from_str::<Options>(&json).unwrap());
    }

    #[test]
    fn test_unknown_option_rejected() {
        let mut value = serde_json::to_value(test_utils::get_test_options()).unwrap();
        value["colour"] = "blue".into();
        assert!(serde_json::from_value::<Options>(value).is_err());
    }

    #[test]
    fn test_derived_values() {
        let options = test_utils::get_test_options();
        assert_eq!(2, options.moment_order());
        assert_eq!(1, options.vectors_per_message());
        let sobol = test_utils::get_test_sobol_options();
        assert_eq!(sobol.nb_parameters + 2, sobol.vectors_per_message());
        assert_eq!(Some(1), sobol.field_index("pressure"));
    }

    #[test]
    #[should_panic(expected = "sampling_size must be greater than 0")]
    fn test_invalid_sampling_size() {
        let mut options = test_utils::get_test_options();
        options.sampling_size = 0;
        options.validate().unwrap()
    }

    #[test]
    #[should_panic(expected = "sobol_max_order must be 1 or 2")]
    fn test_invalid_sobol_order() {
        let mut options = test_utils::get_test_sobol_options();
        options.sobol_max_order = 3;
        options.validate().unwrap()
    }

    #[test]
    #[should_panic(expected = "quantile orders must lie in (0, 1)")]
    fn test_invalid_quantile() {
        let mut options = test_utils::get_test_options();
        options.quantiles = vec![0.5, 1.0];
        options.validate().unwrap()
    }

    #[test]
    #[should_panic(expected = "field names must be unique")]
    fn test_duplicate_field() {
        let mut options = test_utils::get_test_options();
        options.fields = vec!["u".into(), "u".into()];
        options.validate().unwrap()
    }

    #[test]
    #[should_panic(expected = "threshold operation requires at least one threshold")]
    fn test_threshold_without_values() {
        let mut options = test_utils::get_test_options();
        options.operations.push(Operation::Threshold);
        options.thresholds.clear();
        options.validate().unwrap()
    }

    #[test]
    #[should_panic(expected = "sobol operation requires nb_parameters greater than 0")]
    fn test_sobol_without_parameters() {
        let mut options = test_utils::get_test_sobol_options();
        options.nb_parameters = 0;
        options.validate().unwrap()
    }
}
