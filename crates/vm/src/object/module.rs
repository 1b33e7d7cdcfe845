//! Module objects.
//!
//! A module pairs a name table with a parallel value array:
//! `variable_names[i]` names the value in `variables[i]`. The variable
//! cell in the defining module is the single source of truth; importers
//! read through it rather than copying it.

use quill_core::constants::MAX_MODULE_VARS;
use quill_core::SymbolTable;

use crate::heap::Handle;
use crate::value::Value;

/// Outcome of defining a module-level variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefineOutcome {
    /// Newly defined at this symbol.
    Defined(usize),
    /// A variable with this name already exists.
    AlreadyDefined,
    /// The module is out of variable slots.
    TooManyVariables,
}

/// A module.
pub struct ModuleObj {
    /// Variable names; parallel to `variables`.
    pub variable_names: SymbolTable,
    /// Variable values; parallel to `variable_names`.
    pub variables: Vec<Value>,
    /// The module name, or `None` for the core module.
    pub name: Option<Handle>,
    /// The source string the module was compiled from, if any.
    pub source: Option<Handle>,
    /// The compiled module body.
    pub entry: Option<Handle>,
}

impl Default for ModuleObj {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleObj {
    /// Creates an empty module.
    pub fn new() -> Self {
        Self {
            variable_names: SymbolTable::new(MAX_MODULE_VARS),
            variables: Vec::new(),
            name: None,
            source: None,
            entry: None,
        }
    }

    /// Number of variables.
    pub fn len(&self) -> usize {
        self.variables.len()
    }

    /// Returns true if the module has no variables.
    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// Looks up a variable symbol by name.
    pub fn find_symbol(&self, name: &str) -> Option<usize> {
        self.variable_names.find(name)
    }

    /// Reads the variable named `name`.
    pub fn find_variable(&self, name: &str) -> Option<Value> {
        self.find_symbol(name).map(|symbol| self.variables[symbol])
    }

    /// Declares an implicitly referenced variable with a null placeholder.
    /// Returns its symbol, or `None` if the module is full.
    pub fn declare(&mut self, name: &str) -> Option<usize> {
        let symbol = self.variable_names.add(name).ok()?;
        self.variables.push(Value::Null);
        Some(symbol)
    }

    /// Defines a new variable with `value`.
    pub fn define(&mut self, name: &str, value: Value) -> DefineOutcome {
        if self.find_symbol(name).is_some() {
            return DefineOutcome::AlreadyDefined;
        }
        match self.variable_names.add(name) {
            Ok(symbol) => {
                self.variables.push(value);
                DefineOutcome::Defined(symbol)
            }
            Err(_) => DefineOutcome::TooManyVariables,
        }
    }

    /// Overwrites the variable named `name`, defining it if absent.
    pub fn set(&mut self, name: &str, value: Value) -> DefineOutcome {
        if let Some(symbol) = self.find_symbol(name) {
            self.variables[symbol] = value;
            return DefineOutcome::Defined(symbol);
        }
        self.define(name, value)
    }

    /// Clears the variable named `name` to null, keeping the symbol.
    ///
    /// Symbols are never removed because compiled code may hold their
    /// indexes.
    pub fn remove_variable(&mut self, name: &str) -> bool {
        match self.find_symbol(name) {
            Some(symbol) => {
                self.variables[symbol] = Value::Null;
                true
            }
            None => false,
        }
    }

    /// Approximate heap footprint of the variable storage, in bytes.
    pub fn storage_bytes(&self) -> usize {
        self.variables.capacity() * std::mem::size_of::<Value>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_define_and_find() {
        let mut module = ModuleObj::new();

        let outcome = module.define("x", Value::Num(1.0));
        assert_eq!(outcome, DefineOutcome::Defined(0));
        assert_eq!(module.find_variable("x").and_then(|v| v.as_num()), Some(1.0));

        assert_eq!(module.define("x", Value::Num(2.0)), DefineOutcome::AlreadyDefined);
        assert_eq!(module.find_variable("x").and_then(|v| v.as_num()), Some(1.0));
    }

    #[test]
    fn test_declare_then_define_pairs_names_with_values() {
        let mut module = ModuleObj::new();
        module.declare("forward").expect("declare should succeed");
        module.define("y", Value::True);

        assert_eq!(module.find_symbol("forward"), Some(0));
        assert_eq!(module.find_symbol("y"), Some(1));
        assert!(module.find_variable("forward").expect("declared").is_null());
    }

    #[test]
    fn test_remove_keeps_symbol() {
        let mut module = ModuleObj::new();
        module.define("z", Value::True);

        assert!(module.remove_variable("z"));
        assert_eq!(module.find_symbol("z"), Some(0));
        assert!(module.find_variable("z").expect("still present").is_null());
        assert!(!module.remove_variable("missing"));
    }
}
