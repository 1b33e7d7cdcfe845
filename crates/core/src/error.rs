//! Error types for the Quill core crate.

use thiserror::Error;

/// Errors produced by the core utilities.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A name table ran out of symbol slots.
    #[error("Symbol table full: cannot intern '{name}', limit is {limit}")]
    SymbolTableFull { name: String, limit: usize },

    /// A code point cannot be encoded as UTF-8.
    #[error("Invalid code point: {value:#x} cannot be encoded")]
    InvalidCodePoint { value: u32 },
}

impl CoreError {
    /// Create a new symbol-table-full error.
    pub fn symbol_table_full<S: Into<String>>(name: S, limit: usize) -> Self {
        Self::SymbolTableFull {
            name: name.into(),
            limit,
        }
    }

    /// Create a new invalid-code-point error.
    pub fn invalid_code_point(value: u32) -> Self {
        Self::InvalidCodePoint { value }
    }
}

/// Result type for core operations.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = CoreError::symbol_table_full("foo(_)", 65535);
        assert_eq!(
            error.to_string(),
            "Symbol table full: cannot intern 'foo(_)', limit is 65535"
        );

        let error = CoreError::invalid_code_point(0x11_0000);
        assert!(error.to_string().contains("110000"));
    }
}
