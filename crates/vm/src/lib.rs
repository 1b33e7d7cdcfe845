//! # Quill Virtual Machine
//!
//! The runtime core of the Quill scripting language: a single-threaded,
//! stack-based bytecode virtual machine with classes (including multiple
//! superclasses), closures, cooperative fibers, modules with import,
//! exceptions with stack traces and a mark-and-sweep garbage collector.
//!
//! ## Architecture
//!
//! - **[`vm::Vm`]**: owns the heap, the module registry, the interned
//!   method-name table and the running fiber; every collector root hangs
//!   off it.
//! - **[`heap::Heap`]**: slot-based object heap with stop-the-world
//!   mark-and-sweep collection and a bounded temporary-root pin stack.
//! - **[`value::Value`]**: tagged immediates plus heap references.
//! - **[`object`]**: the heap object kinds (strings, lists, maps, ranges,
//!   functions, closures, upvalues, fibers, classes, instances, modules).
//! - **[`interpreter`]**: the dispatch loop over the bytecode stream.
//! - **[`class_binding`]**: multiple-inheritance binding with per-subclass
//!   rewritten method copies.
//! - **[`code_builder::CodeBuilder`]**: programmatic bytecode assembly,
//!   standing in for the external compiler.
//! - **[`interop`]**: the embedder surface — host handles, foreign
//!   methods, reusable method invocation.
//!
//! ## Example
//!
//! ```rust
//! use quill_vm::{CodeBuilder, Value, Vm, VmConfig};
//!
//! # fn main() -> quill_vm::VmResult<()> {
//! let mut vm = Vm::new(VmConfig::default());
//!
//! // Build `3 + 4` by hand, the way a compiler would.
//! let module = vm.core_module();
//! let plus = vm.ensure_method_symbol("+(_)")?;
//! let mut body = CodeBuilder::new("body");
//! body.number(3.0).number(4.0).call(2, plus as u16).finish();
//! let func = body.into_fn(&mut vm, module)?;
//!
//! let fiber = vm.new_fiber(func);
//! vm.set_fiber(Some(fiber));
//! vm.run_interpreter()?;
//!
//! let result = vm.heap().fiber(fiber).stack[1];
//! assert!(matches!(result, Value::Num(n) if n == 7.0));
//! # Ok(())
//! # }
//! ```

/// Multiple-inheritance class binding
pub mod class_binding;
/// Programmatic bytecode construction
pub mod code_builder;
/// VM configuration
pub mod config;
/// The core class library
pub mod core_lib;
/// Stack traces and debug reporting
pub mod debug;
/// Error types and results
pub mod error;
/// The object heap and garbage collector
pub mod heap;
/// The embedder API
pub mod interop;
/// The bytecode dispatch loop
pub mod interpreter;
/// Heap object kinds
pub mod object;
/// OpCode definitions and operand widths
pub mod op_code;
/// Value representation
pub mod value;
/// The virtual machine
pub mod vm;

pub use code_builder::CodeBuilder;
pub use config::VmConfig;
pub use error::{LangResult, VmError, VmResult};
pub use heap::{GcStats, Handle, Heap};
pub use interop::HostHandle;
pub use op_code::OpCode;
pub use value::Value;
pub use vm::Vm;
