//! Programmatic bytecode construction.
//!
//! [`CodeBuilder`] assembles the bytecode, constant pool and line table of
//! one function. The VM uses it to build method-call stubs for the
//! embedder; tests use it to stand in for the external compiler.

use quill_core::constants::MAX_CALL_ARGS;

use crate::error::{VmError, VmResult};
use crate::heap::Handle;
use crate::object::{FnDebug, FnObj};
use crate::op_code::OpCode;
use crate::value::Value;
use crate::vm::Vm;

/// Builds one function's code.
pub struct CodeBuilder {
    code: Vec<u8>,
    constants: Vec<Value>,
    source_lines: Vec<u32>,
    line: u32,
    arity: usize,
    num_upvalues: usize,
    name: String,
}

impl CodeBuilder {
    /// Creates a builder for a function named `name`.
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            code: Vec::new(),
            constants: Vec::new(),
            source_lines: Vec::new(),
            line: 1,
            arity: 0,
            num_upvalues: 0,
            name: name.into(),
        }
    }

    /// Sets the declared parameter count.
    pub fn arity(&mut self, arity: usize) -> &mut Self {
        self.arity = arity;
        self
    }

    /// Sets the number of upvalues a closure over this function captures.
    pub fn num_upvalues(&mut self, count: usize) -> &mut Self {
        self.num_upvalues = count;
        self
    }

    /// Sets the source line attributed to subsequently emitted bytes.
    pub fn line(&mut self, line: u32) -> &mut Self {
        self.line = line;
        self
    }

    /// Adds a constant and returns its pool index.
    pub fn constant(&mut self, value: Value) -> u16 {
        self.constants.push(value);
        (self.constants.len() - 1) as u16
    }

    /// Emits a bare opcode.
    pub fn op(&mut self, op: OpCode) -> &mut Self {
        self.byte(op as u8)
    }

    /// Emits a raw byte.
    pub fn byte(&mut self, byte: u8) -> &mut Self {
        self.code.push(byte);
        self.source_lines.push(self.line);
        self
    }

    /// Emits a big-endian u16.
    pub fn u16(&mut self, value: u16) -> &mut Self {
        self.byte((value >> 8) as u8).byte((value & 0xff) as u8)
    }

    /// Emits an opcode with a u16 operand.
    pub fn op_u16(&mut self, op: OpCode, operand: u16) -> &mut Self {
        self.op(op).u16(operand)
    }

    /// Pushes a constant: adds it to the pool and emits the load.
    pub fn load_constant(&mut self, value: Value) -> &mut Self {
        let index = self.constant(value);
        self.op_u16(OpCode::Constant, index)
    }

    /// Pushes a number.
    pub fn number(&mut self, value: f64) -> &mut Self {
        self.load_constant(Value::Num(value))
    }

    /// Pushes a local, using the single-byte forms for slots 0..=8.
    pub fn load_local(&mut self, slot: usize) -> &mut Self {
        if slot <= 8 {
            let op = OpCode::from_byte(OpCode::LoadLocal0 as u8 + slot as u8)
                .expect("fast local range");
            self.op(op)
        } else {
            self.op(OpCode::LoadLocal).byte(slot as u8)
        }
    }

    /// Stores the top of the stack into a local (keeping the value).
    pub fn store_local(&mut self, slot: usize) -> &mut Self {
        self.op(OpCode::StoreLocal).byte(slot as u8)
    }

    /// Emits a call passing `args` values including the receiver.
    pub fn call(&mut self, args: usize, symbol: u16) -> &mut Self {
        debug_assert!(args <= MAX_CALL_ARGS);
        self.op_u16(OpCode::call(args), symbol)
    }

    /// Emits a super call. `super_list` indexes a constant holding the
    /// super-index list.
    pub fn super_call(&mut self, args: usize, symbol: u16, super_list: u16) -> &mut Self {
        self.op_u16(OpCode::super_call(args), symbol).u16(super_list)
    }

    /// Emits a closure allocation over the prototype at `constant`, with
    /// one (is_local, index) pair per captured upvalue.
    pub fn closure(&mut self, constant: u16, captures: &[(bool, u8)]) -> &mut Self {
        self.op_u16(OpCode::Closure, constant);
        for &(is_local, index) in captures {
            self.byte(u8::from(is_local)).byte(index);
        }
        self
    }

    /// Emits a forward jump, returning the operand position for
    /// [`Self::patch_jump`].
    pub fn jump(&mut self, op: OpCode) -> usize {
        self.op(op);
        let at = self.code.len();
        self.u16(0xffff);
        at
    }

    /// Points the jump operand at `at` to the current position.
    pub fn patch_jump(&mut self, at: usize) {
        let offset = self.code.len() - (at + 2);
        crate::op_code::write_u16(&mut self.code, at, offset as u16);
    }

    /// Emits a backward jump to `target` (a position at or before the
    /// current end of code).
    pub fn loop_to(&mut self, target: usize) -> &mut Self {
        self.op(OpCode::Loop);
        let offset = self.code.len() + 2 - target;
        self.u16(offset as u16)
    }

    /// Emits the class-construction instruction.
    pub fn class(&mut self, num_fields: u8, super_slots: u16) -> &mut Self {
        self.op(OpCode::Class).byte(num_fields).u16(super_slots)
    }

    /// Current code position.
    pub fn position(&self) -> usize {
        self.code.len()
    }

    /// Emits the standard function epilogue: return followed by the end
    /// marker.
    pub fn finish(&mut self) -> &mut Self {
        self.op(OpCode::Return).op(OpCode::End)
    }

    /// Builds the function object in `module`.
    ///
    /// Collection is paused while the function takes ownership of the
    /// constant pool, standing in for the compiler's private roots. Heap
    /// values placed in the pool must be kept reachable by the caller up
    /// to this point.
    pub fn into_fn(self, vm: &mut Vm, module: Handle) -> VmResult<Handle> {
        if self.constants.len() > u16::MAX as usize {
            return Err(VmError::fatal("constant pool overflow"));
        }
        let debug = FnDebug::bare(self.name, self.source_lines);

        vm.enable_gc(false);
        let func = vm.new_function(FnObj {
            bytecode: self.code.into(),
            constants: self.constants.into(),
            num_upvalues: self.num_upvalues,
            arity: self.arity,
            module,
            debug: std::rc::Rc::new(debug),
        });
        vm.enable_gc(true);
        Ok(func)
    }
}
