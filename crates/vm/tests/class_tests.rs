//! Class machinery tests: construction, method binding, single and
//! multiple inheritance, field layout of inherited methods, super
//! dispatch and sealed built-in types.

mod common;

use common::{run, sym, var, var_text, vm_with_output};
use quill_vm::{CodeBuilder, OpCode, Value, VmError};

#[test]
fn test_subclass_method_calls_inherited_method() {
    let mut test = vm_with_output();
    let vm = &mut test.vm;
    let module = vm.core_module();

    vm.define_variable(module, "A", Value::Null).expect("define A");
    vm.define_variable(module, "B", Value::Null).expect("define B");

    let f = sym(vm, "f()");
    let g = sym(vm, "g()");
    let plus = sym(vm, "+(_)");
    let new_sym = sym(vm, "new()");
    let print = sym(vm, "print(_)");
    let a_var = var(vm, module, "A");
    let b_var = var(vm, module, "B");
    let system_var = var(vm, module, "System");

    // class A { f() { return 1 } }
    let mut f_body = CodeBuilder::new("f()");
    f_body.number(1.0).finish();
    let f_fn = f_body.into_fn(vm, module).expect("build f");

    // class B is A { g() { return this.f() + 2 } }
    let mut g_body = CodeBuilder::new("g()");
    g_body.load_local(0).call(1, f).number(2.0).call(2, plus).finish();
    let g_fn = g_body.into_fn(vm, module).expect("build g");

    let a_name = vm.new_string_value("A");
    let b_name = vm.new_string_value("B");

    let mut body = CodeBuilder::new("body");
    // Build A with the implicit Object superclass and bind f.
    body.op(OpCode::Null).load_constant(a_name).class(0, 1);
    body.op_u16(OpCode::StoreModuleVar, a_var);
    body.load_constant(Value::Obj(f_fn));
    body.op_u16(OpCode::LoadModuleVar, a_var);
    body.op_u16(OpCode::MethodInstance, f);
    body.op(OpCode::Pop);

    body.op_u16(OpCode::LoadModuleVar, a_var);
    body.load_constant(b_name).class(0, 1);
    body.op_u16(OpCode::StoreModuleVar, b_var);
    body.load_constant(Value::Obj(g_fn));
    body.op_u16(OpCode::LoadModuleVar, b_var);
    body.op_u16(OpCode::MethodInstance, g);
    body.op(OpCode::Pop);

    body.op_u16(OpCode::LoadModuleVar, system_var);
    body.op_u16(OpCode::LoadModuleVar, b_var);
    body.call(1, new_sym);
    body.call(1, g);
    body.call(2, print);
    body.finish();
    let func = body.into_fn(vm, module).expect("build body");

    run(vm, func).expect("run should succeed");

    assert_eq!(test.output.borrow().as_str(), "3\n");
}

/// Builds a class with `fields` fields and the given instance methods,
/// each constructed by a callback, then stores it in a module variable.
fn emit_class(
    body: &mut CodeBuilder,
    name: Value,
    fields: u8,
    super_vars: &[u16],
    class_var: u16,
    methods: &[(u16, Value)],
) {
    // Superclass slots sit under the name, primary on top.
    for &super_var in super_vars.iter().rev() {
        body.op_u16(OpCode::LoadModuleVar, super_var);
    }
    if super_vars.is_empty() {
        body.op(OpCode::Null);
    }
    body.load_constant(name);
    body.class(fields, super_vars.len().max(1) as u16);
    body.op_u16(OpCode::StoreModuleVar, class_var);

    for &(symbol, method_fn) in methods {
        body.load_constant(method_fn);
        body.op_u16(OpCode::LoadModuleVar, class_var);
        body.op_u16(OpCode::MethodInstance, symbol);
    }
    body.op(OpCode::Pop);
}

#[test]
fn test_multiple_inheritance_field_layout() {
    let mut test = vm_with_output();
    let vm = &mut test.vm;
    let module = vm.core_module();

    for name in ["S1", "S2", "C", "Probe"] {
        vm.define_variable(module, name, Value::Null).expect("define");
    }

    let set_s1 = sym(vm, "setS1(_)");
    let set_s2 = sym(vm, "setS2(_)");
    let who = sym(vm, "who()");
    let new_sym = sym(vm, "new()");
    let s1_var = var(vm, module, "S1");
    let s2_var = var(vm, module, "S2");
    let c_var = var(vm, module, "C");
    let probe_var = var(vm, module, "Probe");

    // S1 has three fields; setS1 writes its first field.
    let mut set_s1_body = CodeBuilder::new("setS1(_)");
    set_s1_body
        .load_local(1)
        .op(OpCode::StoreFieldThis)
        .byte(0)
        .finish();
    let set_s1_fn = set_s1_body.into_fn(vm, module).expect("build");

    // S2 has two fields; setS2 writes its second field.
    let mut set_s2_body = CodeBuilder::new("setS2(_)");
    set_s2_body
        .load_local(1)
        .op(OpCode::StoreFieldThis)
        .byte(1)
        .finish();
    let set_s2_fn = set_s2_body.into_fn(vm, module).expect("build");

    let s1_who = {
        let text = vm.new_string_value("s1");
        let mut b = CodeBuilder::new("who()");
        b.load_constant(text).finish();
        b.into_fn(vm, module).expect("build")
    };
    let s2_who = {
        let text = vm.new_string_value("s2");
        let mut b = CodeBuilder::new("who()");
        b.load_constant(text).finish();
        b.into_fn(vm, module).expect("build")
    };

    let s1_name = vm.new_string_value("S1");
    let s2_name = vm.new_string_value("S2");
    let c_name = vm.new_string_value("C");

    let mut body = CodeBuilder::new("body");
    emit_class(
        &mut body,
        s1_name,
        3,
        &[],
        s1_var,
        &[(set_s1, Value::Obj(set_s1_fn)), (who, Value::Obj(s1_who))],
    );
    emit_class(
        &mut body,
        s2_name,
        2,
        &[],
        s2_var,
        &[(set_s2, Value::Obj(set_s2_fn)), (who, Value::Obj(s2_who))],
    );
    // class C is S1, S2 with two fields of its own.
    emit_class(&mut body, c_name, 2, &[s1_var, s2_var], c_var, &[]);

    // Probe = C.new(); Probe.setS1(7); Probe.setS2(9)
    body.op_u16(OpCode::LoadModuleVar, c_var).call(1, new_sym);
    body.op_u16(OpCode::StoreModuleVar, probe_var).op(OpCode::Pop);
    body.op_u16(OpCode::LoadModuleVar, probe_var)
        .number(7.0)
        .call(2, set_s1)
        .op(OpCode::Pop);
    body.op_u16(OpCode::LoadModuleVar, probe_var)
        .number(9.0)
        .call(2, set_s2)
        .op(OpCode::Pop);
    body.op(OpCode::Null);
    body.finish();

    let func = body.into_fn(vm, module).expect("build body");
    run(vm, func).expect("run should succeed");

    // Layout: [C's 2 fields][S1's 3][S2's 2]. S1's field 0 lands at
    // index 2; S2's field 1 lands at 2 + 3 + 1 = 6.
    let instance = common::var_value(vm, module, "Probe")
        .as_obj()
        .expect("instance");
    let c_class = common::var_value(vm, module, "C").as_obj().expect("class");
    assert_eq!(vm.heap().class(c_class).num_fields, 7);

    let fields = &vm.heap().instance(instance).fields;
    assert_eq!(fields.len(), 7);
    assert!(matches!(fields[2], Value::Num(n) if n == 7.0));
    assert!(matches!(fields[6], Value::Num(n) if n == 9.0));
    assert!(fields[0].is_null());
}

#[test]
fn test_duplicate_method_resolves_to_first_superclass() {
    let mut test = vm_with_output();
    let vm = &mut test.vm;
    let module = vm.core_module();

    for name in ["S1", "S2", "C", "R0", "R1"] {
        vm.define_variable(module, name, Value::Null).expect("define");
    }

    let who = sym(vm, "who()");
    let new_sym = sym(vm, "new()");
    let s1_var = var(vm, module, "S1");
    let s2_var = var(vm, module, "S2");
    let c_var = var(vm, module, "C");
    let r0_var = var(vm, module, "R0");
    let r1_var = var(vm, module, "R1");

    let s1_who = {
        let text = vm.new_string_value("s1");
        let mut b = CodeBuilder::new("who()");
        b.load_constant(text).finish();
        b.into_fn(vm, module).expect("build")
    };
    let s2_who = {
        let text = vm.new_string_value("s2");
        let mut b = CodeBuilder::new("who()");
        b.load_constant(text).finish();
        b.into_fn(vm, module).expect("build")
    };

    let s1_name = vm.new_string_value("S1");
    let s2_name = vm.new_string_value("S2");
    let c_name = vm.new_string_value("C");

    let mut body = CodeBuilder::new("body");
    emit_class(&mut body, s1_name, 0, &[], s1_var, &[(who, Value::Obj(s1_who))]);
    emit_class(&mut body, s2_name, 0, &[], s2_var, &[(who, Value::Obj(s2_who))]);
    emit_class(&mut body, c_name, 0, &[s1_var, s2_var], c_var, &[]);

    // R0 = C.new().who(): plain dispatch prefers the first parent.
    body.op_u16(OpCode::LoadModuleVar, c_var).call(1, new_sym);
    body.call(1, who);
    body.op_u16(OpCode::StoreModuleVar, r0_var).op(OpCode::Pop);

    // R1 = super-dispatch through index 1 reaches the second parent.
    let s2_list = {
        let list = vm.new_list_from(vec![Value::Num(1.0)]);
        body.constant(Value::Obj(list))
    };
    body.op_u16(OpCode::LoadModuleVar, c_var).call(1, new_sym);
    body.super_call(1, who, s2_list);
    body.op_u16(OpCode::StoreModuleVar, r1_var).op(OpCode::Pop);

    body.op(OpCode::Null);
    body.finish();
    let func = body.into_fn(vm, module).expect("build body");

    run(vm, func).expect("run should succeed");

    assert_eq!(var_text(vm, module, "R0"), "s1");
    assert_eq!(var_text(vm, module, "R1"), "s2");
}

#[test]
fn test_is_walks_the_superclass_tree() {
    let mut test = vm_with_output();
    let vm = &mut test.vm;
    let module = vm.core_module();

    for name in ["A", "B", "R0", "R1"] {
        vm.define_variable(module, name, Value::Null).expect("define");
    }

    let new_sym = sym(vm, "new()");
    let a_var = var(vm, module, "A");
    let b_var = var(vm, module, "B");
    let r0_var = var(vm, module, "R0");
    let r1_var = var(vm, module, "R1");
    let num_var = var(vm, module, "Num");

    let a_name = vm.new_string_value("A");
    let b_name = vm.new_string_value("B");

    let mut body = CodeBuilder::new("body");
    emit_class(&mut body, a_name, 0, &[], a_var, &[]);
    body.op_u16(OpCode::LoadModuleVar, a_var);
    body.load_constant(b_name).class(0, 1);
    body.op_u16(OpCode::StoreModuleVar, b_var).op(OpCode::Pop);

    // R0 = B.new() is A
    body.op_u16(OpCode::LoadModuleVar, b_var).call(1, new_sym);
    body.op_u16(OpCode::LoadModuleVar, a_var);
    body.op(OpCode::Is);
    body.op_u16(OpCode::StoreModuleVar, r0_var).op(OpCode::Pop);

    // R1 = B.new() is Num
    body.op_u16(OpCode::LoadModuleVar, b_var).call(1, new_sym);
    body.op_u16(OpCode::LoadModuleVar, num_var);
    body.op(OpCode::Is);
    body.op_u16(OpCode::StoreModuleVar, r1_var).op(OpCode::Pop);

    body.op(OpCode::Null);
    body.finish();
    let func = body.into_fn(vm, module).expect("build body");

    run(vm, func).expect("run should succeed");

    assert!(matches!(common::var_value(vm, module, "R0"), Value::True));
    assert!(matches!(common::var_value(vm, module, "R1"), Value::False));
}

#[test]
fn test_sealed_builtins_reject_inheritance() {
    let mut test = vm_with_output();
    let vm = &mut test.vm;
    let module = vm.core_module();

    let string_var = var(vm, module, "String");
    let name = vm.new_string_value("Sub");

    let mut body = CodeBuilder::new("body");
    body.op_u16(OpCode::LoadModuleVar, string_var);
    body.load_constant(name).class(0, 1);
    body.op(OpCode::Pop);
    body.op(OpCode::Null);
    body.finish();
    let func = body.into_fn(vm, module).expect("build body");

    let result = run(vm, func);
    assert!(matches!(result, Err(VmError::Runtime { .. })));
    assert!(test.output.borrow().contains("cannot inherit from String"));
}

#[test]
fn test_inherited_methods_survive_field_probe() {
    // A one-parent sanity check on the rewritten copies: the inherited
    // setter writes past the subclass's own fields.
    let mut test = vm_with_output();
    let vm = &mut test.vm;
    let module = vm.core_module();

    for name in ["P", "D", "Probe"] {
        vm.define_variable(module, name, Value::Null).expect("define");
    }

    let set = sym(vm, "set(_)");
    let new_sym = sym(vm, "new()");
    let p_var = var(vm, module, "P");
    let d_var = var(vm, module, "D");
    let probe_var = var(vm, module, "Probe");

    let set_fn = {
        let mut b = CodeBuilder::new("set(_)");
        b.load_local(1).op(OpCode::StoreFieldThis).byte(0).finish();
        b.into_fn(vm, module).expect("build")
    };

    let p_name = vm.new_string_value("P");
    let d_name = vm.new_string_value("D");

    let mut body = CodeBuilder::new("body");
    emit_class(&mut body, p_name, 1, &[], p_var, &[(set, Value::Obj(set_fn))]);

    body.op_u16(OpCode::LoadModuleVar, p_var);
    body.load_constant(d_name).class(2, 1);
    body.op_u16(OpCode::StoreModuleVar, d_var).op(OpCode::Pop);

    body.op_u16(OpCode::LoadModuleVar, d_var).call(1, new_sym);
    body.op_u16(OpCode::StoreModuleVar, probe_var).op(OpCode::Pop);
    body.op_u16(OpCode::LoadModuleVar, probe_var)
        .number(5.0)
        .call(2, set)
        .op(OpCode::Pop);
    body.op(OpCode::Null);
    body.finish();
    let func = body.into_fn(vm, module).expect("build body");

    run(vm, func).expect("run should succeed");

    let instance = common::var_value(vm, module, "Probe")
        .as_obj()
        .expect("instance");
    let fields = &vm.heap().instance(instance).fields;
    assert_eq!(fields.len(), 3);
    // D's own two fields first, then P's field.
    assert!(fields[0].is_null());
    assert!(fields[1].is_null());
    assert!(matches!(fields[2], Value::Num(n) if n == 5.0));
}
