//! Stack traces and debug reporting.
//!
//! Each function carries a line table parallel to its bytecode, so a
//! frame's program counter decodes straight back to a source line. Traces
//! are frozen into strings at raise time; nothing here keeps the fiber
//! alive.

use crate::heap::Handle;
use crate::object::ObjKind;
use crate::vm::Vm;

/// Builds the stack trace for `fiber`, innermost frame first.
pub fn stack_trace(vm: &Vm, fiber: Handle) -> String {
    let mut trace = String::new();

    let frames = &vm.heap().fiber(fiber).frames;
    for frame in frames.iter().rev() {
        let func = match vm.heap().kind(frame.func) {
            ObjKind::Closure(closure) => closure.func,
            _ => frame.func,
        };
        let f = vm.heap().function(func);

        // The pc sits just past the executing instruction.
        let pc = frame.pc.saturating_sub(1);
        let line = f.debug.line_at(pc).unwrap_or(0);
        let module = vm.module_display_name(f.module);

        trace.push_str(&format!("[{} line {}] in {}\n", module, line, f.debug.name));
    }

    trace
}

/// Reports an uncaught error: the message, then the trace, through the
/// configured print sink.
pub fn report_runtime_error(vm: &Vm, fiber: Handle, message: &str) {
    vm.print(&format!("{message}\n"));
    vm.print(&stack_trace(vm, fiber));
}

/// Reads the message out of an exception instance, falling back to a
/// plain rendering for other error values.
pub fn error_message(vm: &Vm, error: Handle) -> String {
    if let ObjKind::Instance(instance) = vm.heap().kind(error) {
        if let Some(first) = instance.fields.first() {
            return vm.value_to_display(*first);
        }
    }
    vm.value_to_display(crate::value::Value::Obj(error))
}
