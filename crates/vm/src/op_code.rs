//! OpCode definitions for the Quill VM.
//!
//! Every instruction is a one-byte opcode followed by zero or more inline
//! operands. Operand widths are fixed per operand kind (see the
//! `*_OPERAND_BYTES` constants); multi-byte operands are big-endian.

/// Width of a constant-index operand.
pub const CONSTANT_OPERAND_BYTES: usize = 2;
/// Width of a method-symbol operand.
pub const METHOD_OPERAND_BYTES: usize = 2;
/// Width of a module-variable-index operand.
pub const MODULE_VAR_OPERAND_BYTES: usize = 2;
/// Width of a jump-offset operand.
pub const OFFSET_OPERAND_BYTES: usize = 2;
/// Width of a local-slot operand.
pub const LOCAL_OPERAND_BYTES: usize = 1;
/// Width of a field-index operand.
pub const FIELD_OPERAND_BYTES: usize = 1;
/// Width of an upvalue-index operand.
pub const UPVALUE_OPERAND_BYTES: usize = 1;

/// The instruction set of the VM.
///
/// `Call0..Call16` and `Super0..Super16` encode the argument count
/// (including the receiver) in the opcode itself; both carry a
/// method-symbol operand, and the super forms add a constant index naming
/// the super-index list that walks the receiver's superclass tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Push null.
    Null = 0,
    /// Push true.
    True,
    /// Push false.
    False,
    /// Discard the top of the stack.
    Pop,
    /// Duplicate the top of the stack.
    Dup,
    /// Push a constant from the function's constant pool.
    Constant,

    // Single-byte fast paths for the first nine local slots.
    /// Push local slot 0.
    LoadLocal0,
    /// Push local slot 1.
    LoadLocal1,
    /// Push local slot 2.
    LoadLocal2,
    /// Push local slot 3.
    LoadLocal3,
    /// Push local slot 4.
    LoadLocal4,
    /// Push local slot 5.
    LoadLocal5,
    /// Push local slot 6.
    LoadLocal6,
    /// Push local slot 7.
    LoadLocal7,
    /// Push local slot 8.
    LoadLocal8,
    /// Push the local slot named by the operand.
    LoadLocal,
    /// Store the top of the stack into a local slot. Leaves the value.
    StoreLocal,

    /// Push an upvalue of the executing closure.
    LoadUpvalue,
    /// Store the top of the stack into an upvalue. Leaves the value.
    StoreUpvalue,

    /// Push a module-level variable.
    LoadModuleVar,
    /// Store the top of the stack into a module-level variable.
    StoreModuleVar,

    /// Push a field of the receiver (local slot 0).
    LoadFieldThis,
    /// Store into a field of the receiver. Leaves the value.
    StoreFieldThis,
    /// Pop an instance and push one of its fields.
    LoadField,
    /// Pop an instance and store the (new) top of stack into its field.
    StoreField,

    /// Jump forward by the operand.
    Jump,
    /// Jump backward by the operand (loop back-edge).
    Loop,
    /// Pop the condition; jump forward if it is false or null.
    JumpIf,
    /// Short-circuit and: if the top is falsey jump past the right-hand
    /// side keeping it, otherwise pop it and continue.
    And,
    /// Short-circuit or: if the top is truthy jump past the right-hand
    /// side keeping it, otherwise pop it and continue.
    Or,

    /// Pop a class and a value, push whether the value is an instance of
    /// the class (walking the superclass tree).
    Is,
    /// Close the topmost open upvalue and discard its stack slot.
    CloseUpvalue,
    /// Return from the current function with the top of the stack.
    Return,
    /// Allocate a closure for a function constant, capturing upvalues
    /// described by the inline (is_local, index) pairs that follow.
    Closure,

    /// Construct a class from a name and superclasses on the stack.
    ///
    /// Operands: field count of the new class, then the number of
    /// superclass stack slots consumed (including the primary slot, which
    /// may hold null for an implicit Object superclass).
    Class,
    /// Bind the method value below the class on the stack as an instance
    /// method for the symbol operand.
    MethodInstance,
    /// Bind the method value below the class on the stack as a static
    /// method (on the metaclass) for the symbol operand.
    MethodStatic,

    /// Import a module by the name in the constant operand, running its
    /// body in a new fiber on first import.
    LoadModule,
    /// Push the current value of a variable from a loaded module.
    /// Operands: module-name constant, variable-name constant.
    ImportVariable,
    /// Resolve the module object on the top of the stack.
    Module,

    /// Invoke a method with 0..16 arguments plus the receiver. The operand
    /// is the method symbol.
    Call0,
    Call1,
    Call2,
    Call3,
    Call4,
    Call5,
    Call6,
    Call7,
    Call8,
    Call9,
    Call10,
    Call11,
    Call12,
    Call13,
    Call14,
    Call15,
    Call16,

    /// Invoke a method on a superclass. Operands: method symbol, then a
    /// constant index naming the super-index list.
    Super0,
    Super1,
    Super2,
    Super3,
    Super4,
    Super5,
    Super6,
    Super7,
    Super8,
    Super9,
    Super10,
    Super11,
    Super12,
    Super13,
    Super14,
    Super15,
    Super16,

    /// Debugger suspension point.
    Break,
    /// Marks the end of a function's bytecode. Never executed.
    End,
}

impl OpCode {
    /// Decodes a raw byte, returning `None` for bytes outside the
    /// instruction set.
    pub fn from_byte(byte: u8) -> Option<OpCode> {
        match byte {
            0 => Some(OpCode::Null),
            1 => Some(OpCode::True),
            2 => Some(OpCode::False),
            3 => Some(OpCode::Pop),
            4 => Some(OpCode::Dup),
            5 => Some(OpCode::Constant),
            6 => Some(OpCode::LoadLocal0),
            7 => Some(OpCode::LoadLocal1),
            8 => Some(OpCode::LoadLocal2),
            9 => Some(OpCode::LoadLocal3),
            10 => Some(OpCode::LoadLocal4),
            11 => Some(OpCode::LoadLocal5),
            12 => Some(OpCode::LoadLocal6),
            13 => Some(OpCode::LoadLocal7),
            14 => Some(OpCode::LoadLocal8),
            15 => Some(OpCode::LoadLocal),
            16 => Some(OpCode::StoreLocal),
            17 => Some(OpCode::LoadUpvalue),
            18 => Some(OpCode::StoreUpvalue),
            19 => Some(OpCode::LoadModuleVar),
            20 => Some(OpCode::StoreModuleVar),
            21 => Some(OpCode::LoadFieldThis),
            22 => Some(OpCode::StoreFieldThis),
            23 => Some(OpCode::LoadField),
            24 => Some(OpCode::StoreField),
            25 => Some(OpCode::Jump),
            26 => Some(OpCode::Loop),
            27 => Some(OpCode::JumpIf),
            28 => Some(OpCode::And),
            29 => Some(OpCode::Or),
            30 => Some(OpCode::Is),
            31 => Some(OpCode::CloseUpvalue),
            32 => Some(OpCode::Return),
            33 => Some(OpCode::Closure),
            34 => Some(OpCode::Class),
            35 => Some(OpCode::MethodInstance),
            36 => Some(OpCode::MethodStatic),
            37 => Some(OpCode::LoadModule),
            38 => Some(OpCode::ImportVariable),
            39 => Some(OpCode::Module),
            40 => Some(OpCode::Call0),
            41 => Some(OpCode::Call1),
            42 => Some(OpCode::Call2),
            43 => Some(OpCode::Call3),
            44 => Some(OpCode::Call4),
            45 => Some(OpCode::Call5),
            46 => Some(OpCode::Call6),
            47 => Some(OpCode::Call7),
            48 => Some(OpCode::Call8),
            49 => Some(OpCode::Call9),
            50 => Some(OpCode::Call10),
            51 => Some(OpCode::Call11),
            52 => Some(OpCode::Call12),
            53 => Some(OpCode::Call13),
            54 => Some(OpCode::Call14),
            55 => Some(OpCode::Call15),
            56 => Some(OpCode::Call16),
            57 => Some(OpCode::Super0),
            58 => Some(OpCode::Super1),
            59 => Some(OpCode::Super2),
            60 => Some(OpCode::Super3),
            61 => Some(OpCode::Super4),
            62 => Some(OpCode::Super5),
            63 => Some(OpCode::Super6),
            64 => Some(OpCode::Super7),
            65 => Some(OpCode::Super8),
            66 => Some(OpCode::Super9),
            67 => Some(OpCode::Super10),
            68 => Some(OpCode::Super11),
            69 => Some(OpCode::Super12),
            70 => Some(OpCode::Super13),
            71 => Some(OpCode::Super14),
            72 => Some(OpCode::Super15),
            73 => Some(OpCode::Super16),
            74 => Some(OpCode::Break),
            75 => Some(OpCode::End),
            _ => None,
        }
    }

    /// Returns the call opcode passing `args` arguments including the
    /// receiver (1..=17).
    pub fn call(args: usize) -> OpCode {
        debug_assert!((1..=17).contains(&args));
        OpCode::from_byte(OpCode::Call0 as u8 + (args as u8 - 1)).expect("call range")
    }

    /// Returns the super-call opcode passing `args` arguments including
    /// the receiver (1..=17).
    pub fn super_call(args: usize) -> OpCode {
        debug_assert!((1..=17).contains(&args));
        OpCode::from_byte(OpCode::Super0 as u8 + (args as u8 - 1)).expect("super range")
    }

    /// For a call or super opcode, the number of arguments including the
    /// receiver.
    pub fn call_args(self) -> Option<usize> {
        let byte = self as u8;
        if (OpCode::Call0 as u8..=OpCode::Call16 as u8).contains(&byte) {
            Some((byte - OpCode::Call0 as u8) as usize + 1)
        } else if (OpCode::Super0 as u8..=OpCode::Super16 as u8).contains(&byte) {
            Some((byte - OpCode::Super0 as u8) as usize + 1)
        } else {
            None
        }
    }

    /// Returns true for the super-call opcodes.
    pub fn is_super(self) -> bool {
        let byte = self as u8;
        (OpCode::Super0 as u8..=OpCode::Super16 as u8).contains(&byte)
    }

    /// Number of inline operand bytes following the opcode.
    ///
    /// For `Closure` this covers only the constant operand; the
    /// (is_local, index) pairs that follow depend on the prototype and
    /// must be walked with knowledge of the constant pool.
    pub fn operand_bytes(self) -> usize {
        use OpCode::*;
        match self {
            Constant => CONSTANT_OPERAND_BYTES,
            LoadLocal | StoreLocal => LOCAL_OPERAND_BYTES,
            LoadUpvalue | StoreUpvalue => UPVALUE_OPERAND_BYTES,
            LoadModuleVar | StoreModuleVar => MODULE_VAR_OPERAND_BYTES,
            LoadFieldThis | StoreFieldThis | LoadField | StoreField => FIELD_OPERAND_BYTES,
            Jump | Loop | JumpIf | And | Or => OFFSET_OPERAND_BYTES,
            Closure => CONSTANT_OPERAND_BYTES,
            Class => FIELD_OPERAND_BYTES + CONSTANT_OPERAND_BYTES,
            MethodInstance | MethodStatic => METHOD_OPERAND_BYTES,
            LoadModule => CONSTANT_OPERAND_BYTES,
            ImportVariable => 2 * CONSTANT_OPERAND_BYTES,
            _ if self.call_args().is_some() => {
                if self.is_super() {
                    METHOD_OPERAND_BYTES + CONSTANT_OPERAND_BYTES
                } else {
                    METHOD_OPERAND_BYTES
                }
            }
            _ => 0,
        }
    }
}

/// Reads a big-endian u16 operand at `pc`.
pub fn read_u16(code: &[u8], pc: usize) -> u16 {
    (u16::from(code[pc]) << 8) | u16::from(code[pc + 1])
}

/// Writes a big-endian u16 operand at `pc`.
pub fn write_u16(code: &mut [u8], pc: usize, value: u16) {
    code[pc] = (value >> 8) as u8;
    code[pc + 1] = (value & 0xff) as u8;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_u16() {
        let mut code = vec![0u8; 4];
        write_u16(&mut code, 1, 0xbeef);
        assert_eq!(code, vec![0, 0xbe, 0xef, 0]);
        assert_eq!(read_u16(&code, 1), 0xbeef);
    }

    #[test]
    fn test_from_byte_round_trip() {
        for byte in 0..=OpCode::End as u8 {
            let op = OpCode::from_byte(byte).expect("in-range byte should decode");
            assert_eq!(op as u8, byte);
        }
        assert_eq!(OpCode::from_byte(OpCode::End as u8 + 1), None);
        assert_eq!(OpCode::from_byte(0xff), None);
    }

    #[test]
    fn test_call_encoding() {
        assert_eq!(OpCode::call(1), OpCode::Call0);
        assert_eq!(OpCode::call(17), OpCode::Call16);
        assert_eq!(OpCode::Call0.call_args(), Some(1));
        assert_eq!(OpCode::Call16.call_args(), Some(17));
        assert_eq!(OpCode::Super2.call_args(), Some(3));
        assert_eq!(OpCode::Pop.call_args(), None);
        assert!(OpCode::Super0.is_super());
        assert!(!OpCode::Call3.is_super());
    }

    #[test]
    fn test_operand_widths() {
        assert_eq!(OpCode::Constant.operand_bytes(), 2);
        assert_eq!(OpCode::LoadLocal.operand_bytes(), 1);
        assert_eq!(OpCode::Jump.operand_bytes(), 2);
        assert_eq!(OpCode::Call4.operand_bytes(), 2);
        assert_eq!(OpCode::Super4.operand_bytes(), 4);
        assert_eq!(OpCode::Class.operand_bytes(), 3);
        assert_eq!(OpCode::ImportVariable.operand_bytes(), 4);
        assert_eq!(OpCode::Return.operand_bytes(), 0);
    }
}
