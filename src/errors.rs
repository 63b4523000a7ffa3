use thiserror::Error;

/// Errors raised while validating parameters; these are always reported at construction time.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be within [{min}, {max}], got {value}")]
    OutOfRange {
        name: &'static str,
        value: f64,
        min: f64,
        max: f64
    },
    #[error("{name} must be non-negative, got {value}")]
    Negative {
        name: &'static str,
        value: f64
    },
    #[error("{0}")]
    Invalid(String)
}

/// Checks that `value` is inside the closed interval `[min, max]`.
pub(crate) fn check_range(name: &'static str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    //NaN fails both comparisons so it ends up here as well
    if value >= min && value <= max {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange { name, value, min, max })
    }
}

/// Checks that `value` is zero or larger.
pub(crate) fn check_non_negative(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Negative { name, value })
    }
}
