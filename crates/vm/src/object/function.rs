//! Function, closure and upvalue objects.
//!
//! A function is immutable once built: bytecode, constants and debug
//! record are shared behind `Rc` so call frames and per-subclass method
//! copies can hold them without borrowing the heap. A closure pairs a
//! function with captured upvalues. An upvalue is either open, aliasing a
//! live stack slot of its fiber by index, or closed, owning the captured
//! value.

use std::rc::Rc;

use quill_core::SymbolTable;

use crate::heap::Handle;
use crate::value::Value;

/// Debug record carried by every function.
///
/// `source_lines` parallels the bytecode: `source_lines[pc]` is the source
/// line that produced the byte at `pc`.
pub struct FnDebug {
    /// Path of the source file, if known.
    pub source_path: Option<String>,
    /// Human-readable name (method signature or "script body").
    pub name: String,
    /// Bytecode-index to source-line map, same length as the bytecode.
    pub source_lines: Vec<u32>,
    /// Names of the function's local slots.
    pub locals: SymbolTable,
    /// Per-line symbol table used by the debugger front-end.
    pub lines: SymbolTable,
}

impl FnDebug {
    /// Creates a debug record with no symbol information.
    pub fn bare<S: Into<String>>(name: S, source_lines: Vec<u32>) -> Self {
        Self {
            source_path: None,
            name: name.into(),
            source_lines,
            locals: SymbolTable::default(),
            lines: SymbolTable::default(),
        }
    }

    /// The source line that produced the byte at `pc`, if mapped.
    pub fn line_at(&self, pc: usize) -> Option<u32> {
        self.source_lines.get(pc).copied()
    }
}

/// A compiled function.
pub struct FnObj {
    /// The bytecode. Ends with a Return followed by End.
    pub bytecode: Rc<[u8]>,
    /// The constant pool.
    pub constants: Rc<[Value]>,
    /// Number of upvalues a closure over this function captures.
    pub num_upvalues: usize,
    /// Number of declared parameters.
    pub arity: usize,
    /// The module this function was compiled in.
    pub module: Handle,
    /// Debug record.
    pub debug: Rc<FnDebug>,
}

impl FnObj {
    /// Approximate heap footprint of the code and constants, in bytes.
    pub fn storage_bytes(&self) -> usize {
        self.bytecode.len()
            + self.constants.len() * std::mem::size_of::<Value>()
            + self.debug.source_lines.len() * std::mem::size_of::<u32>()
            + self.debug.name.len()
    }
}

/// A closure: a function plus its captured upvalues.
pub struct ClosureObj {
    /// The wrapped function.
    pub func: Handle,
    /// One upvalue handle per prototype upvalue slot.
    pub upvalues: Vec<Handle>,
}

/// The state of a captured variable.
#[derive(Clone, Copy, Debug)]
pub enum UpvalueState {
    /// Aliases the stack slot at this index in the owning fiber.
    Open(usize),
    /// Owns the captured value; the stack slot is gone.
    Closed(Value),
}

/// A captured variable.
pub struct UpvalueObj {
    /// Open or closed state.
    pub state: UpvalueState,
}

impl UpvalueObj {
    /// Creates an open upvalue aliasing `slot`.
    pub fn open(slot: usize) -> Self {
        Self {
            state: UpvalueState::Open(slot),
        }
    }

    /// The aliased stack slot, if still open.
    pub fn open_slot(&self) -> Option<usize> {
        match self.state {
            UpvalueState::Open(slot) => Some(slot),
            UpvalueState::Closed(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_line_lookup() {
        let debug = FnDebug::bare("body", vec![1, 1, 2, 3]);
        assert_eq!(debug.line_at(0), Some(1));
        assert_eq!(debug.line_at(3), Some(3));
        assert_eq!(debug.line_at(9), None);
    }

    #[test]
    fn test_upvalue_states() {
        let mut upvalue = UpvalueObj::open(4);
        assert_eq!(upvalue.open_slot(), Some(4));

        upvalue.state = UpvalueState::Closed(Value::Num(7.0));
        assert_eq!(upvalue.open_slot(), None);
    }
}
