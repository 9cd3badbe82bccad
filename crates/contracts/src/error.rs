use thiserror::Error;

/// Errors raised while constructing contract values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractError {
    /// Currency code is not a three-letter ISO 4217 code.
    #[error("Invalid currency code: {0:?}")]
    InvalidCurrency(String),
}
