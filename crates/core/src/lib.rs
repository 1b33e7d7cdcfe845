//! # Quill Core
//!
//! Foundational utilities shared across the Quill runtime crates.
//!
//! This crate deliberately knows nothing about the VM object graph. It
//! provides the tuning constants for the heap and the fiber stacks, the
//! interned-name table used for method signatures and module variables,
//! UTF-8 encoding/decoding for the string type, and the core error type.

/// Runtime tuning constants (heap thresholds, growth factors, limits)
pub mod constants;
/// Core error types
pub mod error;
/// Interned-name tables for method signatures and module variables
pub mod symbol_table;
/// UTF-8 encoding and decoding for script strings
pub mod utf8;

pub use error::{CoreError, CoreResult};
pub use symbol_table::SymbolTable;
