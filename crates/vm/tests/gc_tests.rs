//! Collector tests: soundness under stress, temporary-root protection,
//! host-handle rooting, destructor dispatch at sweep time and threshold
//! recomputation.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::{run, sym, var, vm_with_config, vm_with_output};
use quill_vm::{CodeBuilder, OpCode, Value, VmConfig};

#[test]
fn test_programs_survive_gc_stress() {
    // Collect before every allocation; any missing root dies loudly.
    let mut test = vm_with_config(VmConfig::new().with_gc_stress());
    let vm = &mut test.vm;
    let module = vm.core_module();

    let new_sym = sym(vm, "new()");
    let add = sym(vm, "add(_)");
    let count = sym(vm, "count");
    let plus = sym(vm, "+(_)");
    let print = sym(vm, "print(_)");
    let list_var = var(vm, module, "List");
    let system_var = var(vm, module, "System");

    // Constants are held only by the builder until the function exists,
    // so pin them across the intervening allocations.
    let left = vm.new_string("con");
    vm.push_root(left).expect("pin");
    let right = vm.new_string("cat");
    vm.push_root(right).expect("pin");

    let mut body = CodeBuilder::new("body");
    body.op_u16(OpCode::LoadModuleVar, system_var);
    // Build a list, append a freshly concatenated string, print count.
    body.op_u16(OpCode::LoadModuleVar, list_var).call(1, new_sym);
    body.op(OpCode::Dup);
    body.load_constant(Value::Obj(left))
        .load_constant(Value::Obj(right))
        .call(2, plus);
    body.call(2, add).op(OpCode::Pop);
    body.call(1, count);
    body.call(2, print);
    body.finish();
    let func = body.into_fn(vm, module).expect("build body");
    vm.pop_root();
    vm.pop_root();

    run(vm, func).expect("run should succeed");
    assert_eq!(test.output.borrow().as_str(), "1\n");
}

#[test]
fn test_unreachable_objects_are_collected() {
    let mut test = vm_with_output();
    let vm = &mut test.vm;

    let before = vm.gc_stats().active;
    for index in 0..100 {
        vm.new_string(&format!("garbage {index}"));
    }
    assert!(vm.gc_stats().active >= before + 100);

    vm.collect_garbage();
    // All hundred strings were unreachable.
    assert!(vm.gc_stats().active < before + 100);
    assert!(vm.gc_stats().destroyed >= 100);
}

#[test]
fn test_temp_roots_protect_construction() {
    let mut test = vm_with_output();
    let vm = &mut test.vm;

    let pinned = vm.new_string("keep me");
    vm.push_root(pinned).expect("pin");

    // Allocation pressure plus explicit collections.
    for _ in 0..3 {
        for index in 0..50 {
            vm.new_string(&format!("churn {index}"));
        }
        vm.collect_garbage();
    }

    assert!(vm.heap().is_live(pinned));
    assert_eq!(vm.heap().string(pinned).to_text(), "keep me");
    vm.pop_root();
}

#[test]
fn test_host_handles_root_their_values() {
    let mut test = vm_with_output();
    let vm = &mut test.vm;

    let handle = vm.create_string("held by the host").expect("create");
    for index in 0..50 {
        vm.new_string(&format!("churn {index}"));
    }
    vm.collect_garbage();

    assert_eq!(
        vm.read_string(handle).expect("read"),
        "held by the host"
    );

    // Releasing makes the value collectable and recycles the key.
    vm.release(handle).expect("release");
    let next = vm.create_number(5.0).expect("create");
    assert_eq!(vm.read_number(next).expect("read"), 5.0);
}

#[test]
fn test_destructor_runs_once_at_sweep() {
    let mut test = vm_with_output();
    let vm = &mut test.vm;

    let drops = Rc::new(RefCell::new(0usize));
    let observed = drops.clone();

    vm.define_class(None, "Resource", 8, None).expect("define class");
    vm.define_destructor(
        None,
        "Resource",
        Rc::new(move |payload: &mut [u8]| {
            assert_eq!(payload.len(), 8);
            *observed.borrow_mut() += 1;
        }),
    )
    .expect("define destructor");

    let class = vm
        .find_variable("Resource")
        .and_then(|value| value.as_obj())
        .expect("class variable");

    // An unreachable instance dies at the next collection.
    vm.new_instance(class);
    vm.collect_garbage();
    assert_eq!(*drops.borrow(), 1);

    // A pinned instance survives and its destructor does not run.
    let kept = vm.new_instance(class);
    vm.push_root(kept).expect("pin");
    vm.collect_garbage();
    assert_eq!(*drops.borrow(), 1);

    vm.pop_root();
    vm.collect_garbage();
    assert_eq!(*drops.borrow(), 2);
}

#[test]
fn test_module_variables_are_roots() {
    let mut test = vm_with_output();
    let vm = &mut test.vm;
    let module = vm.core_module();

    let value = vm.new_string_value("bound");
    vm.define_variable(module, "Bound", value).expect("define");

    for index in 0..50 {
        vm.new_string(&format!("churn {index}"));
    }
    vm.collect_garbage();

    let bound = common::var_text(vm, module, "Bound");
    assert_eq!(bound, "bound");
}

#[test]
fn test_current_fiber_stack_is_a_root() {
    let mut test = vm_with_config(VmConfig::new().with_gc_stress());
    let vm = &mut test.vm;
    let module = vm.core_module();

    let plus = sym(vm, "+(_)");
    let to_string = sym(vm, "toString");

    // Push intermediate strings and keep them live across further
    // allocating calls.
    let a = vm.new_string("a");
    vm.push_root(a).expect("pin");
    let b = vm.new_string("b");
    vm.push_root(b).expect("pin");
    let mut body = CodeBuilder::new("body");
    body.load_constant(Value::Obj(a))
        .load_constant(Value::Obj(b))
        .call(2, plus)
        .call(1, to_string)
        .finish();
    let func = body.into_fn(vm, module).expect("build body");
    vm.pop_root();
    vm.pop_root();

    run(vm, func).expect("run should succeed");

    let fiber = vm.fiber().expect("fiber");
    let result = vm.heap().fiber(fiber).stack[1].as_obj().expect("string");
    assert_eq!(vm.heap().string(result).to_text(), "ab");
}

#[test]
fn test_gc_stats_threshold_floor() {
    let mut test = vm_with_config(VmConfig::new().with_heap(1024, 4096, 50));
    let vm = &mut test.vm;

    vm.collect_garbage();
    // Live bytes after a collection sit far below the floor.
    assert_eq!(vm.gc_stats().next_gc, 4096);
}
