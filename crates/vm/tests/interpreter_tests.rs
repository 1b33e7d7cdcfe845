//! Interpreter tests: stack discipline, arithmetic dispatch, branches,
//! short-circuits, lists and printing.

mod common;

use common::{run, sym, var, vm_with_output};
use quill_vm::{CodeBuilder, OpCode, Value};

#[test]
fn test_arithmetic_through_method_dispatch() {
    let mut test = vm_with_output();
    let vm = &mut test.vm;
    let module = vm.core_module();

    // (3 + 4) * 2
    let plus = sym(vm, "+(_)");
    let times = sym(vm, "*(_)");
    let mut body = CodeBuilder::new("body");
    body.number(3.0)
        .number(4.0)
        .call(2, plus)
        .number(2.0)
        .call(2, times)
        .finish();
    let func = body.into_fn(vm, module).expect("build");

    run(vm, func).expect("run should succeed");

    let fiber = vm.fiber().expect("fiber");
    let result = vm.heap().fiber(fiber).stack[1];
    assert!(matches!(result, Value::Num(n) if n == 14.0));
}

#[test]
fn test_locals_and_stores() {
    let mut test = vm_with_output();
    let vm = &mut test.vm;
    let module = vm.core_module();

    let plus = sym(vm, "+(_)");
    let mut body = CodeBuilder::new("body");
    // slot 0 = 10; slot 1 = 32; return slot0 + slot1
    body.number(10.0)
        .number(32.0)
        .load_local(0)
        .load_local(1)
        .call(2, plus)
        .finish();
    let func = body.into_fn(vm, module).expect("build");

    run(vm, func).expect("run should succeed");

    let fiber = vm.fiber().expect("fiber");
    assert!(matches!(vm.heap().fiber(fiber).stack[1], Value::Num(n) if n == 42.0));
}

#[test]
fn test_jump_if_branches() {
    let mut test = vm_with_output();
    let vm = &mut test.vm;
    let module = vm.core_module();

    // if false { 1 } else { 2 }
    let mut body = CodeBuilder::new("body");
    body.op(OpCode::False);
    let to_else = body.jump(OpCode::JumpIf);
    body.number(1.0);
    let to_end = body.jump(OpCode::Jump);
    body.patch_jump(to_else);
    body.number(2.0);
    body.patch_jump(to_end);
    body.finish();
    let func = body.into_fn(vm, module).expect("build");

    run(vm, func).expect("run should succeed");

    let fiber = vm.fiber().expect("fiber");
    assert!(matches!(vm.heap().fiber(fiber).stack[1], Value::Num(n) if n == 2.0));
}

#[test]
fn test_and_or_short_circuits() {
    let mut test = vm_with_output();
    let vm = &mut test.vm;
    let module = vm.core_module();

    // null && 1 -> null; the left value is kept.
    let mut body = CodeBuilder::new("body");
    body.op(OpCode::Null);
    let skip = body.jump(OpCode::And);
    body.number(1.0);
    body.patch_jump(skip);
    body.finish();
    let func = body.into_fn(vm, module).expect("build");
    run(vm, func).expect("run should succeed");
    let fiber = vm.fiber().expect("fiber");
    assert!(vm.heap().fiber(fiber).stack[1].is_null());

    // false || 7 -> 7; the left value is replaced.
    let mut body = CodeBuilder::new("body");
    body.op(OpCode::False);
    let skip = body.jump(OpCode::Or);
    body.number(7.0);
    body.patch_jump(skip);
    body.finish();
    let func = body.into_fn(vm, module).expect("build");
    run(vm, func).expect("run should succeed");
    let fiber = vm.fiber().expect("fiber");
    assert!(matches!(vm.heap().fiber(fiber).stack[1], Value::Num(n) if n == 7.0));
}

#[test]
fn test_loop_counts_down() {
    let mut test = vm_with_output();
    let vm = &mut test.vm;
    let module = vm.core_module();

    let minus = sym(vm, "-(_)");
    let greater = sym(vm, ">(_)");

    // slot 0 = 5; while slot0 > 0 { slot0 = slot0 - 1 }; return slot0
    let mut body = CodeBuilder::new("body");
    body.number(5.0);
    let top = body.position();
    body.load_local(0).number(0.0).call(2, greater);
    let exit = body.jump(OpCode::JumpIf);
    body.load_local(0)
        .number(1.0)
        .call(2, minus)
        .store_local(0)
        .op(OpCode::Pop);
    body.loop_to(top);
    body.patch_jump(exit);
    body.load_local(0);
    body.finish();
    let func = body.into_fn(vm, module).expect("build");

    run(vm, func).expect("run should succeed");

    let fiber = vm.fiber().expect("fiber");
    assert!(matches!(vm.heap().fiber(fiber).stack[1], Value::Num(n) if n == 0.0));
}

#[test]
fn test_list_add_and_count_prints_four() {
    let mut test = vm_with_output();
    let vm = &mut test.vm;
    let module = vm.core_module();

    let new_sym = sym(vm, "new()");
    let add = sym(vm, "add(_)");
    let count = sym(vm, "count");
    let print = sym(vm, "print(_)");
    let list_var = var(vm, module, "List");
    let system_var = var(vm, module, "System");

    // var xs = [1, 2, 3]; xs.add(4); System.print(xs.count)
    let mut body = CodeBuilder::new("body");
    body.op_u16(OpCode::LoadModuleVar, system_var);
    body.op_u16(OpCode::LoadModuleVar, list_var).call(1, new_sym);
    for n in [1.0, 2.0, 3.0] {
        // add(_) returns its argument, so drop it and keep the list.
        body.op(OpCode::Dup).number(n).call(2, add).op(OpCode::Pop);
    }
    body.op(OpCode::Dup).number(4.0).call(2, add).op(OpCode::Pop);
    body.call(1, count);
    body.call(2, print);
    body.finish();
    let func = body.into_fn(vm, module).expect("build");

    run(vm, func).expect("run should succeed");

    assert_eq!(test.output.borrow().as_str(), "4\n");
}

#[test]
fn test_string_concat_and_print() {
    let mut test = vm_with_output();
    let vm = &mut test.vm;
    let module = vm.core_module();

    let plus = sym(vm, "+(_)");
    let print = sym(vm, "print(_)");
    let system_var = var(vm, module, "System");

    let hello = vm.new_string_value("Hello, ");
    let world = vm.new_string_value("world!");

    let mut body = CodeBuilder::new("body");
    body.op_u16(OpCode::LoadModuleVar, system_var);
    body.load_constant(hello).load_constant(world).call(2, plus);
    body.call(2, print);
    body.finish();
    let func = body.into_fn(vm, module).expect("build");

    run(vm, func).expect("run should succeed");

    assert_eq!(test.output.borrow().as_str(), "Hello, world!\n");
}

#[test]
fn test_method_not_found_reports_signature() {
    let mut test = vm_with_output();
    let vm = &mut test.vm;
    let module = vm.core_module();

    let missing = sym(vm, "definitelyMissing()");
    let mut body = CodeBuilder::new("body");
    body.number(1.0).call(1, missing).finish();
    let func = body.into_fn(vm, module).expect("build");

    let result = run(vm, func);
    assert!(result.is_err());
    assert!(test.output.borrow().contains("definitelyMissing()"));
    assert!(test.output.borrow().contains("Num"));
}

#[test]
fn test_range_construction_and_accessors() {
    let mut test = vm_with_output();
    let vm = &mut test.vm;
    let module = vm.core_module();

    let dots = sym(vm, "..(_)");
    let from = sym(vm, "from");
    let mut body = CodeBuilder::new("body");
    body.number(2.0).number(9.0).call(2, dots).call(1, from);
    body.finish();
    let func = body.into_fn(vm, module).expect("build");

    run(vm, func).expect("run should succeed");

    let fiber = vm.fiber().expect("fiber");
    assert!(matches!(vm.heap().fiber(fiber).stack[1], Value::Num(n) if n == 2.0));
}
