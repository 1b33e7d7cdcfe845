//! Interned-name tables.
//!
//! A [`SymbolTable`] maps names to dense integer symbols. The VM keeps one
//! table for method signatures (shared VM-wide, so a signature resolves to
//! the same symbol in every class) and one per module for variable names.
//! Symbols are stable for the lifetime of the table; names are never
//! removed, only their paired values elsewhere are.

use hashbrown::HashMap;

use crate::error::{CoreError, CoreResult};

/// A growable table of interned names with dense integer symbols.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    /// Names in symbol order; `names[i]` is the name of symbol `i`
    names: Vec<String>,

    /// Reverse index from name to symbol
    index: HashMap<String, usize>,

    /// Upper bound on the number of symbols
    limit: usize,
}

impl SymbolTable {
    /// Creates an empty table bounded by `limit` symbols.
    pub fn new(limit: usize) -> Self {
        Self {
            names: Vec::new(),
            index: HashMap::new(),
            limit,
        }
    }

    /// Adds `name` to the table and returns its new symbol, or an error if
    /// the table is full. Does not check for duplicates.
    pub fn add(&mut self, name: &str) -> CoreResult<usize> {
        if self.names.len() >= self.limit {
            return Err(CoreError::symbol_table_full(name, self.limit));
        }

        let symbol = self.names.len();
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), symbol);
        Ok(symbol)
    }

    /// Returns the symbol for `name`, interning it if not yet present.
    pub fn ensure(&mut self, name: &str) -> CoreResult<usize> {
        if let Some(&symbol) = self.index.get(name) {
            return Ok(symbol);
        }
        self.add(name)
    }

    /// Looks up `name`, returning its symbol if present.
    pub fn find(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Returns the name for `symbol`, if in range.
    pub fn name(&self, symbol: usize) -> Option<&str> {
        self.names.get(symbol).map(String::as_str)
    }

    /// Returns the number of interned names.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Returns true if no names have been interned.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Iterates over the names in symbol order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_is_idempotent() {
        let mut table = SymbolTable::new(16);

        let a = table.ensure("count").expect("ensure should succeed");
        let b = table.ensure("add(_)").expect("ensure should succeed");
        let a2 = table.ensure("count").expect("ensure should succeed");

        assert_eq!(a, a2);
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_find_and_name_round_trip() {
        let mut table = SymbolTable::new(16);
        let symbol = table.ensure("call(_,_)").expect("ensure should succeed");

        assert_eq!(table.find("call(_,_)"), Some(symbol));
        assert_eq!(table.name(symbol), Some("call(_,_)"));
        assert_eq!(table.find("missing"), None);
        assert_eq!(table.name(99), None);
    }

    #[test]
    fn test_limit_is_enforced() {
        let mut table = SymbolTable::new(2);
        table.ensure("a").expect("ensure should succeed");
        table.ensure("b").expect("ensure should succeed");

        let err = table.ensure("c").expect_err("table should be full");
        assert!(matches!(err, CoreError::SymbolTableFull { .. }));

        // Existing names still resolve.
        assert!(table.ensure("a").is_ok());
    }
}
