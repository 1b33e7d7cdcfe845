//! The core class library.
//!
//! Installs the built-in classes as core-module variables and binds their
//! primitive methods. Primitives follow the dispatch contract: they read
//! the argument window in place (index 0 is the receiver) and answer with
//! a [`PrimResult`] telling the interpreter how to continue.

use crate::class_binding;
use crate::heap::Handle;
use crate::object::{ObjKind, PrimResult, PrimitiveFn};
use crate::object::Method;
use crate::value::{format_num, Value};
use crate::vm::Vm;

/// Reads argument `index` of the active window.
fn arg(vm: &Vm, fiber: Handle, base: usize, index: usize) -> Value {
    vm.heap().fiber(fiber).stack[base + index]
}

/// Builds an error result carrying `message`.
fn error(vm: &mut Vm, message: &str) -> PrimResult {
    PrimResult::Error(vm.new_string_value(message))
}

fn as_fiber(vm: &Vm, value: Value) -> Option<Handle> {
    let handle = value.as_obj()?;
    matches!(vm.heap().kind(handle), ObjKind::Fiber(_)).then_some(handle)
}

fn as_function(vm: &Vm, value: Value) -> Option<Handle> {
    let handle = value.as_obj()?;
    matches!(
        vm.heap().kind(handle),
        ObjKind::Fn(_) | ObjKind::Closure(_)
    )
    .then_some(handle)
}

fn as_class(vm: &Vm, value: Value) -> Option<Handle> {
    let handle = value.as_obj()?;
    matches!(vm.heap().kind(handle), ObjKind::Class(_)).then_some(handle)
}

fn as_string(vm: &Vm, value: Value) -> Option<Handle> {
    let handle = value.as_obj()?;
    matches!(vm.heap().kind(handle), ObjKind::Str(_)).then_some(handle)
}

fn as_list(vm: &Vm, value: Value) -> Option<Handle> {
    let handle = value.as_obj()?;
    matches!(vm.heap().kind(handle), ObjKind::List(_)).then_some(handle)
}

fn as_map(vm: &Vm, value: Value) -> Option<Handle> {
    let handle = value.as_obj()?;
    matches!(vm.heap().kind(handle), ObjKind::Map(_)).then_some(handle)
}

fn as_instance(vm: &Vm, value: Value) -> Option<Handle> {
    let handle = value.as_obj()?;
    matches!(vm.heap().kind(handle), ObjKind::Instance(_)).then_some(handle)
}

fn as_range(vm: &Vm, value: Value) -> Option<crate::object::RangeObj> {
    let handle = value.as_obj()?;
    match vm.heap().kind(handle) {
        ObjKind::Range(range) => Some(*range),
        _ => None,
    }
}

/// Normalizes a possibly negative index against `count`.
fn list_index(value: Value, count: usize) -> Option<usize> {
    let number = value.as_num()?;
    if number.fract() != 0.0 {
        return None;
    }
    let index = if number < 0.0 {
        let back = (-number) as usize;
        if back > count {
            return None;
        }
        count - back
    } else {
        number as usize
    };
    (index < count).then_some(index)
}

// === Object ===

fn object_eq(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    let equal = vm
        .heap()
        .values_equal(arg(vm, fiber, base, 0), arg(vm, fiber, base, 1));
    PrimResult::Value(Value::from_bool(equal))
}

fn object_neq(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    let equal = vm
        .heap()
        .values_equal(arg(vm, fiber, base, 0), arg(vm, fiber, base, 1));
    PrimResult::Value(Value::from_bool(!equal))
}

fn object_is(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    let Some(expected) = as_class(vm, arg(vm, fiber, base, 1)) else {
        return error(vm, "Right operand must be a class.");
    };
    let actual = vm.class_of_value(arg(vm, fiber, base, 0));
    let result = class_binding::is_subclass(vm.heap(), actual, expected);
    PrimResult::Value(Value::from_bool(result))
}

fn object_to_string(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    let text = vm.value_to_display(arg(vm, fiber, base, 0));
    PrimResult::Value(vm.new_string_value(&text))
}

fn object_type(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    let class = vm.class_of_value(arg(vm, fiber, base, 0));
    PrimResult::Value(Value::Obj(class))
}

// === Class ===

fn class_name(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    let Some(class) = as_class(vm, arg(vm, fiber, base, 0)) else {
        return error(vm, "Receiver must be a class.");
    };
    let name = vm.heap().class(class).name;
    PrimResult::Value(Value::Obj(name))
}

fn class_new(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    let Some(class) = as_class(vm, arg(vm, fiber, base, 0)) else {
        return error(vm, "Receiver must be a class.");
    };
    let instance = vm.new_instance(class);
    PrimResult::Value(Value::Obj(instance))
}

// === Bool and Null ===

fn bool_not(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    PrimResult::Value(Value::from_bool(arg(vm, fiber, base, 0).is_falsey()))
}

fn bool_to_string(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    let text = if matches!(arg(vm, fiber, base, 0), Value::True) {
        "true"
    } else {
        "false"
    };
    PrimResult::Value(vm.new_string_value(text))
}

fn null_to_string(vm: &mut Vm, _fiber: Handle, _base: usize, _argc: usize) -> PrimResult {
    PrimResult::Value(vm.new_string_value("null"))
}

// === Num ===

macro_rules! num_binary {
    ($name:ident, $op:tt) => {
        fn $name(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
            let lhs = arg(vm, fiber, base, 0).as_num();
            let rhs = arg(vm, fiber, base, 1).as_num();
            match (lhs, rhs) {
                (Some(lhs), Some(rhs)) => PrimResult::Value(Value::Num(lhs $op rhs)),
                _ => error(vm, "Right operand must be a number."),
            }
        }
    };
}

macro_rules! num_compare {
    ($name:ident, $op:tt) => {
        fn $name(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
            let lhs = arg(vm, fiber, base, 0).as_num();
            let rhs = arg(vm, fiber, base, 1).as_num();
            match (lhs, rhs) {
                (Some(lhs), Some(rhs)) => PrimResult::Value(Value::from_bool(lhs $op rhs)),
                _ => error(vm, "Right operand must be a number."),
            }
        }
    };
}

num_binary!(num_add, +);
num_binary!(num_sub, -);
num_binary!(num_mul, *);
num_binary!(num_div, /);
num_compare!(num_lt, <);
num_compare!(num_gt, >);
num_compare!(num_le, <=);
num_compare!(num_ge, >=);

fn num_mod(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    let lhs = arg(vm, fiber, base, 0).as_num();
    let rhs = arg(vm, fiber, base, 1).as_num();
    match (lhs, rhs) {
        (Some(lhs), Some(rhs)) => PrimResult::Value(Value::Num(lhs % rhs)),
        _ => error(vm, "Right operand must be a number."),
    }
}

fn num_negate(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    match arg(vm, fiber, base, 0).as_num() {
        Some(n) => PrimResult::Value(Value::Num(-n)),
        None => error(vm, "Receiver must be a number."),
    }
}

fn num_eq(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    let lhs = arg(vm, fiber, base, 0).as_num();
    let rhs = arg(vm, fiber, base, 1).as_num();
    PrimResult::Value(Value::from_bool(match (lhs, rhs) {
        (Some(lhs), Some(rhs)) => lhs == rhs,
        _ => false,
    }))
}

fn num_neq(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    match num_eq(vm, fiber, base, _argc) {
        PrimResult::Value(value) => PrimResult::Value(Value::from_bool(value.is_falsey())),
        other => other,
    }
}

fn num_abs(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    match arg(vm, fiber, base, 0).as_num() {
        Some(n) => PrimResult::Value(Value::Num(n.abs())),
        None => error(vm, "Receiver must be a number."),
    }
}

fn num_floor(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    match arg(vm, fiber, base, 0).as_num() {
        Some(n) => PrimResult::Value(Value::Num(n.floor())),
        None => error(vm, "Receiver must be a number."),
    }
}

fn num_to_string(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    match arg(vm, fiber, base, 0).as_num() {
        Some(n) => PrimResult::Value(vm.new_string_value(&format_num(n))),
        None => error(vm, "Receiver must be a number."),
    }
}

fn num_range(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize, inclusive: bool) -> PrimResult {
    let lhs = arg(vm, fiber, base, 0).as_num();
    let rhs = arg(vm, fiber, base, 1).as_num();
    match (lhs, rhs) {
        (Some(from), Some(to)) if from.is_finite() && to.is_finite() => {
            PrimResult::Value(vm.new_range(from, to, inclusive))
        }
        _ => error(vm, "Range endpoints must be finite numbers."),
    }
}

fn num_range_inclusive(vm: &mut Vm, fiber: Handle, base: usize, argc: usize) -> PrimResult {
    num_range(vm, fiber, base, argc, true)
}

fn num_range_exclusive(vm: &mut Vm, fiber: Handle, base: usize, argc: usize) -> PrimResult {
    num_range(vm, fiber, base, argc, false)
}

// === String ===

fn string_concat(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    let lhs = as_string(vm, arg(vm, fiber, base, 0));
    let rhs = as_string(vm, arg(vm, fiber, base, 1));
    let (Some(lhs), Some(rhs)) = (lhs, rhs) else {
        return error(vm, "Right operand must be a string.");
    };
    let mut bytes = vm.heap().string(lhs).as_bytes().to_vec();
    bytes.extend_from_slice(vm.heap().string(rhs).as_bytes());
    let joined = vm.new_string_from_bytes(bytes);
    PrimResult::Value(Value::Obj(joined))
}

fn string_count(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    let Some(receiver) = as_string(vm, arg(vm, fiber, base, 0)) else {
        return error(vm, "Receiver must be a string.");
    };
    PrimResult::Value(Value::Num(vm.heap().string(receiver).len() as f64))
}

fn string_contains(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    let receiver = as_string(vm, arg(vm, fiber, base, 0));
    let needle = as_string(vm, arg(vm, fiber, base, 1));
    let (Some(receiver), Some(needle)) = (receiver, needle) else {
        return error(vm, "Argument must be a string.");
    };
    let found = {
        let heap = vm.heap();
        heap.string(receiver).find(heap.string(needle)).is_some()
    };
    PrimResult::Value(Value::from_bool(found))
}

fn string_index_of(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    let receiver = as_string(vm, arg(vm, fiber, base, 0));
    let needle = as_string(vm, arg(vm, fiber, base, 1));
    let (Some(receiver), Some(needle)) = (receiver, needle) else {
        return error(vm, "Argument must be a string.");
    };
    let found = {
        let heap = vm.heap();
        heap.string(receiver).find(heap.string(needle))
    };
    PrimResult::Value(Value::Num(found.map_or(-1.0, |index| index as f64)))
}

fn string_code_point_at(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    let Some(receiver) = as_string(vm, arg(vm, fiber, base, 0)) else {
        return error(vm, "Receiver must be a string.");
    };
    let Some(index) = arg(vm, fiber, base, 1)
        .as_num()
        .filter(|n| *n >= 0.0 && n.fract() == 0.0)
    else {
        return error(vm, "Index must be a non-negative integer.");
    };
    let index = index as usize;
    if index >= vm.heap().string(receiver).len() {
        return error(vm, "Subscript out of bounds.");
    }
    // Malformed sequences decode to -1.
    let decoded = vm
        .heap()
        .string(receiver)
        .code_point_at(index)
        .map_or(-1.0, f64::from);
    PrimResult::Value(Value::Num(decoded))
}

fn string_subscript(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    let Some(receiver) = as_string(vm, arg(vm, fiber, base, 0)) else {
        return error(vm, "Receiver must be a string.");
    };
    let count = vm.heap().string(receiver).len();
    let Some(index) = list_index(arg(vm, fiber, base, 1), count) else {
        return error(vm, "Subscript out of bounds.");
    };
    let byte = vm.heap().string(receiver).as_bytes()[index];
    let result = vm.new_string_from_bytes(vec![byte]);
    PrimResult::Value(Value::Obj(result))
}

fn string_to_string(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    PrimResult::Value(arg(vm, fiber, base, 0))
}

// === List ===

fn list_new(vm: &mut Vm, _fiber: Handle, _base: usize, _argc: usize) -> PrimResult {
    let list = vm.new_list();
    PrimResult::Value(Value::Obj(list))
}

fn list_add(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    let Some(list) = as_list(vm, arg(vm, fiber, base, 0)) else {
        return error(vm, "Receiver must be a list.");
    };
    let value = arg(vm, fiber, base, 1);
    vm.heap_mut().list_mut(list).add(value);
    PrimResult::Value(value)
}

fn list_count(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    let Some(list) = as_list(vm, arg(vm, fiber, base, 0)) else {
        return error(vm, "Receiver must be a list.");
    };
    PrimResult::Value(Value::Num(vm.heap().list(list).len() as f64))
}

fn list_subscript(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    let Some(list) = as_list(vm, arg(vm, fiber, base, 0)) else {
        return error(vm, "Receiver must be a list.");
    };
    let count = vm.heap().list(list).len();
    let Some(index) = list_index(arg(vm, fiber, base, 1), count) else {
        return error(vm, "Subscript out of bounds.");
    };
    let value = vm.heap().list(list).get(index).unwrap_or(Value::Null);
    PrimResult::Value(value)
}

fn list_subscript_set(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    let Some(list) = as_list(vm, arg(vm, fiber, base, 0)) else {
        return error(vm, "Receiver must be a list.");
    };
    let count = vm.heap().list(list).len();
    let Some(index) = list_index(arg(vm, fiber, base, 1), count) else {
        return error(vm, "Subscript out of bounds.");
    };
    let value = arg(vm, fiber, base, 2);
    vm.heap_mut().list_mut(list).set(index, value);
    PrimResult::Value(value)
}

fn list_insert(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    let Some(list) = as_list(vm, arg(vm, fiber, base, 0)) else {
        return error(vm, "Receiver must be a list.");
    };
    let count = vm.heap().list(list).len();
    // Inserting at the count appends.
    let index = match arg(vm, fiber, base, 1).as_num() {
        Some(n) if n >= 0.0 && n.fract() == 0.0 && (n as usize) <= count => n as usize,
        _ => return error(vm, "Subscript out of bounds."),
    };
    let value = arg(vm, fiber, base, 2);
    vm.heap_mut().list_mut(list).insert(index, value);
    PrimResult::Value(value)
}

fn list_remove_at(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    let Some(list) = as_list(vm, arg(vm, fiber, base, 0)) else {
        return error(vm, "Receiver must be a list.");
    };
    let count = vm.heap().list(list).len();
    let Some(index) = list_index(arg(vm, fiber, base, 1), count) else {
        return error(vm, "Subscript out of bounds.");
    };
    let removed = vm.heap_mut().list_mut(list).remove_at(index);
    PrimResult::Value(removed)
}

fn list_clear(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    let Some(list) = as_list(vm, arg(vm, fiber, base, 0)) else {
        return error(vm, "Receiver must be a list.");
    };
    vm.heap_mut().list_mut(list).clear();
    PrimResult::Value(Value::Null)
}

// === Map ===

fn map_new(vm: &mut Vm, _fiber: Handle, _base: usize, _argc: usize) -> PrimResult {
    let map = vm.new_map();
    PrimResult::Value(Value::Obj(map))
}

fn map_subscript(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    let Some(map) = as_map(vm, arg(vm, fiber, base, 0)) else {
        return error(vm, "Receiver must be a map.");
    };
    let key = arg(vm, fiber, base, 1);
    match vm.heap().map_get(map, key) {
        Ok(value) => PrimResult::Value(value.unwrap_or(Value::Null)),
        Err(raised) => error(vm, &raised.to_string()),
    }
}

fn map_subscript_set(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    let Some(map) = as_map(vm, arg(vm, fiber, base, 0)) else {
        return error(vm, "Receiver must be a map.");
    };
    let key = arg(vm, fiber, base, 1);
    let value = arg(vm, fiber, base, 2);
    match vm.heap_mut().map_set(map, key, value) {
        Ok(()) => PrimResult::Value(value),
        Err(raised) => error(vm, &raised.to_string()),
    }
}

fn map_remove(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    let Some(map) = as_map(vm, arg(vm, fiber, base, 0)) else {
        return error(vm, "Receiver must be a map.");
    };
    let key = arg(vm, fiber, base, 1);
    match vm.heap_mut().map_remove(map, key) {
        Ok(removed) => PrimResult::Value(removed.unwrap_or(Value::Null)),
        Err(raised) => error(vm, &raised.to_string()),
    }
}

fn map_count(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    let Some(map) = as_map(vm, arg(vm, fiber, base, 0)) else {
        return error(vm, "Receiver must be a map.");
    };
    PrimResult::Value(Value::Num(vm.heap().map(map).len() as f64))
}

fn map_contains_key(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    let Some(map) = as_map(vm, arg(vm, fiber, base, 0)) else {
        return error(vm, "Receiver must be a map.");
    };
    let key = arg(vm, fiber, base, 1);
    match vm.heap().map_contains(map, key) {
        Ok(found) => PrimResult::Value(Value::from_bool(found)),
        Err(raised) => error(vm, &raised.to_string()),
    }
}

// === Range ===

fn range_from(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    match as_range(vm, arg(vm, fiber, base, 0)) {
        Some(range) => PrimResult::Value(Value::Num(range.from)),
        None => error(vm, "Receiver must be a range."),
    }
}

fn range_to(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    match as_range(vm, arg(vm, fiber, base, 0)) {
        Some(range) => PrimResult::Value(Value::Num(range.to)),
        None => error(vm, "Receiver must be a range."),
    }
}

fn range_is_inclusive(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    match as_range(vm, arg(vm, fiber, base, 0)) {
        Some(range) => PrimResult::Value(Value::from_bool(range.is_inclusive)),
        None => error(vm, "Receiver must be a range."),
    }
}

fn range_iterate(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    let Some(range) = as_range(vm, arg(vm, fiber, base, 0)) else {
        return error(vm, "Receiver must be a range.");
    };
    let iterator = match arg(vm, fiber, base, 1) {
        Value::Null => None,
        value => match value.as_num() {
            Some(n) => Some(n),
            None => return error(vm, "Iterator must be a number."),
        },
    };
    PrimResult::Value(match range.iterate(iterator) {
        Some(next) => Value::Num(next),
        None => Value::False,
    })
}

fn range_iterator_value(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    PrimResult::Value(arg(vm, fiber, base, 1))
}

// === Fn ===

fn fn_new(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    match as_function(vm, arg(vm, fiber, base, 1)) {
        Some(_) => PrimResult::Value(arg(vm, fiber, base, 1)),
        None => error(vm, "Argument must be a function."),
    }
}

fn fn_arity(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    let Some(func) = as_function(vm, arg(vm, fiber, base, 0)) else {
        return error(vm, "Receiver must be a function.");
    };
    let arity = match vm.heap().kind(func) {
        ObjKind::Closure(closure) => vm.heap().function(closure.func).arity,
        _ => vm.heap().function(func).arity,
    };
    PrimResult::Value(Value::Num(arity as f64))
}

fn fn_call(vm: &mut Vm, fiber: Handle, base: usize, argc: usize) -> PrimResult {
    let Some(func) = as_function(vm, arg(vm, fiber, base, 0)) else {
        return error(vm, "Receiver must be a function.");
    };
    let arity = match vm.heap().kind(func) {
        ObjKind::Closure(closure) => vm.heap().function(closure.func).arity,
        _ => vm.heap().function(func).arity,
    };
    if argc - 1 < arity {
        return error(vm, "Function expects more arguments.");
    }
    PrimResult::Call { args: argc }
}

// === Fiber ===

fn fiber_new(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    let Some(body) = as_function(vm, arg(vm, fiber, base, 1)) else {
        return error(vm, "Argument must be a function.");
    };
    let created = vm.new_fiber(body);
    PrimResult::Value(Value::Obj(created))
}

fn run_fiber(vm: &mut Vm, fiber: Handle, base: usize, argc: usize, is_try: bool) -> PrimResult {
    let Some(target) = as_fiber(vm, arg(vm, fiber, base, 0)) else {
        return error(vm, "Receiver must be a fiber.");
    };

    if vm.heap().fiber(target).error.is_some() {
        return error(vm, "Cannot call an aborted fiber.");
    }
    if vm.heap().fiber(target).is_done() {
        return error(vm, "Cannot call a finished fiber.");
    }
    if vm.heap().fiber(target).caller.is_some() {
        return error(vm, "Fiber has already been called.");
    }

    let value = if argc >= 2 {
        arg(vm, fiber, base, 1)
    } else {
        Value::Null
    };

    // Keep exactly one slot of the window: the result lands there when
    // the target yields or returns.
    vm.heap_mut().fiber_mut(fiber).stack.truncate(base + 1);

    let fresh = vm.heap().fiber(target).is_fresh();
    {
        let t = vm.heap_mut().fiber_mut(target);
        t.caller = Some(fiber);
        t.caller_is_trying = is_try;
        if fresh {
            // First activation: the transferred value is the body's
            // receiver slot.
            t.push(value);
        } else {
            // Resume: the value becomes the result of the target's yield.
            match t.stack.last_mut() {
                Some(slot) => *slot = value,
                None => t.push(value),
            }
        }
    }

    PrimResult::RunFiber(Some(target))
}

fn fiber_call(vm: &mut Vm, fiber: Handle, base: usize, argc: usize) -> PrimResult {
    run_fiber(vm, fiber, base, argc, false)
}

fn fiber_try(vm: &mut Vm, fiber: Handle, base: usize, argc: usize) -> PrimResult {
    run_fiber(vm, fiber, base, argc, true)
}

fn fiber_yield(vm: &mut Vm, fiber: Handle, base: usize, argc: usize) -> PrimResult {
    let value = if argc >= 2 {
        arg(vm, fiber, base, 1)
    } else {
        Value::Null
    };

    let caller = vm.heap().fiber(fiber).caller;
    {
        let f = vm.heap_mut().fiber_mut(fiber);
        // Unhook from the caller; a later call re-attaches.
        f.caller = None;
        f.caller_is_trying = false;
        f.stack.truncate(base + 1);
        // This slot receives the value passed to the resuming call.
        f.stack[base] = Value::Null;
    }

    match caller {
        None => PrimResult::RunFiber(None),
        Some(caller) => {
            let c = vm.heap_mut().fiber_mut(caller);
            match c.stack.last_mut() {
                Some(slot) => *slot = value,
                None => c.push(value),
            }
            PrimResult::RunFiber(Some(caller))
        }
    }
}

fn fiber_abort(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    PrimResult::Error(arg(vm, fiber, base, 1))
}

fn fiber_current(_vm: &mut Vm, fiber: Handle, _base: usize, _argc: usize) -> PrimResult {
    PrimResult::Value(Value::Obj(fiber))
}

fn fiber_is_done(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    let Some(target) = as_fiber(vm, arg(vm, fiber, base, 0)) else {
        return error(vm, "Receiver must be a fiber.");
    };
    let target = vm.heap().fiber(target);
    PrimResult::Value(Value::from_bool(target.is_done() || target.error.is_some()))
}

fn fiber_error(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    let Some(target) = as_fiber(vm, arg(vm, fiber, base, 0)) else {
        return error(vm, "Receiver must be a fiber.");
    };
    PrimResult::Value(match vm.heap().fiber(target).error {
        Some(exception) => Value::Obj(exception),
        None => Value::Null,
    })
}

// === Exception ===

fn exception_new(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    let Some(class) = as_class(vm, arg(vm, fiber, base, 0)) else {
        return error(vm, "Receiver must be a class.");
    };
    let message = arg(vm, fiber, base, 1);
    let instance = vm.new_instance(class);
    let fields = &mut vm.heap_mut().instance_mut(instance).fields;
    if let Some(first) = fields.first_mut() {
        *first = message;
    }
    PrimResult::Value(Value::Obj(instance))
}

fn exception_message(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    let Some(instance) = as_instance(vm, arg(vm, fiber, base, 0)) else {
        return error(vm, "Receiver must be an exception.");
    };
    let message = vm
        .heap()
        .instance(instance)
        .fields
        .first()
        .copied()
        .unwrap_or(Value::Null);
    PrimResult::Value(message)
}

fn exception_stack_trace(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    let Some(instance) = as_instance(vm, arg(vm, fiber, base, 0)) else {
        return error(vm, "Receiver must be an exception.");
    };
    let trace = vm
        .heap()
        .instance(instance)
        .fields
        .get(1)
        .copied()
        .unwrap_or(Value::Null);
    PrimResult::Value(trace)
}

// === System ===

fn system_print(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    let value = arg(vm, fiber, base, 1);
    let text = vm.value_to_display(value);
    vm.print(&format!("{text}\n"));
    PrimResult::Value(value)
}

fn system_write(vm: &mut Vm, fiber: Handle, base: usize, _argc: usize) -> PrimResult {
    let value = arg(vm, fiber, base, 1);
    let text = vm.value_to_display(value);
    vm.print(&text);
    PrimResult::Value(value)
}

fn system_gc(vm: &mut Vm, _fiber: Handle, _base: usize, _argc: usize) -> PrimResult {
    vm.collect_garbage();
    PrimResult::Value(Value::Null)
}

// === Installation ===

fn primitive(vm: &mut Vm, class: Handle, signature: &str, function: PrimitiveFn) {
    let symbol = vm
        .ensure_method_symbol(signature)
        .expect("method name table full during bootstrap");
    vm.heap_mut()
        .class_mut(class)
        .bind_method(symbol, Method::Primitive(function));
}

fn static_primitive(vm: &mut Vm, class: Handle, signature: &str, function: PrimitiveFn) {
    let metaclass = vm
        .heap()
        .class_of(class)
        .expect("class without metaclass during bootstrap");
    primitive(vm, metaclass, signature, function);
}

/// Binds the core library into `core` (the core module).
pub fn install(vm: &mut Vm, core: Handle) {
    let mt = vm.metatable();
    let object = mt.object_class;
    let class = mt.class_class;
    let bool_class = mt.bool_class;
    let num = mt.num_class;
    let null_class = mt.null_class;
    let string = mt.string_class;
    let list = mt.list_class;
    let map = mt.map_class;
    let table = mt.table_class;
    let range = mt.range_class;
    let fn_class = mt.fn_class;
    let fiber = mt.fiber_class;
    let module = mt.module_class;

    // Object first: everything below re-inherits its methods.
    primitive(vm, object, "==(_)", object_eq);
    primitive(vm, object, "!=(_)", object_neq);
    primitive(vm, object, "is(_)", object_is);
    primitive(vm, object, "toString", object_to_string);
    primitive(vm, object, "type", object_type);

    primitive(vm, class, "name", class_name);
    primitive(vm, class, "new()", class_new);
    primitive(vm, class, "toString", class_name);
    class_binding::reinherit_methods(vm.heap_mut(), class, object);

    // The built-in classes were created before Object had any methods
    // bound, so their inherited slots are filled in now.
    for builtin in [
        bool_class, num, null_class, string, list, map, table, range, fn_class, fiber, module,
    ] {
        class_binding::reinherit_methods(vm.heap_mut(), builtin, object);
        let metaclass = vm
            .heap()
            .class_of(builtin)
            .expect("builtin class without metaclass");
        class_binding::reinherit_methods(vm.heap_mut(), metaclass, class);
    }

    primitive(vm, bool_class, "!", bool_not);
    primitive(vm, bool_class, "toString", bool_to_string);

    primitive(vm, null_class, "!", bool_not);
    primitive(vm, null_class, "toString", null_to_string);

    primitive(vm, num, "+(_)", num_add);
    primitive(vm, num, "-(_)", num_sub);
    primitive(vm, num, "*(_)", num_mul);
    primitive(vm, num, "/(_)", num_div);
    primitive(vm, num, "%(_)", num_mod);
    primitive(vm, num, "<(_)", num_lt);
    primitive(vm, num, ">(_)", num_gt);
    primitive(vm, num, "<=(_)", num_le);
    primitive(vm, num, ">=(_)", num_ge);
    primitive(vm, num, "==(_)", num_eq);
    primitive(vm, num, "!=(_)", num_neq);
    primitive(vm, num, "-", num_negate);
    primitive(vm, num, "abs", num_abs);
    primitive(vm, num, "floor", num_floor);
    primitive(vm, num, "toString", num_to_string);
    primitive(vm, num, "..(_)", num_range_inclusive);
    primitive(vm, num, "...(_)", num_range_exclusive);

    primitive(vm, string, "+(_)", string_concat);
    primitive(vm, string, "count", string_count);
    primitive(vm, string, "contains(_)", string_contains);
    primitive(vm, string, "indexOf(_)", string_index_of);
    primitive(vm, string, "codePointAt(_)", string_code_point_at);
    primitive(vm, string, "[_]", string_subscript);
    primitive(vm, string, "toString", string_to_string);

    static_primitive(vm, list, "new()", list_new);
    primitive(vm, list, "add(_)", list_add);
    primitive(vm, list, "count", list_count);
    primitive(vm, list, "[_]", list_subscript);
    primitive(vm, list, "[_]=(_)", list_subscript_set);
    primitive(vm, list, "insert(_,_)", list_insert);
    primitive(vm, list, "removeAt(_)", list_remove_at);
    primitive(vm, list, "clear()", list_clear);

    static_primitive(vm, map, "new()", map_new);
    primitive(vm, map, "[_]", map_subscript);
    primitive(vm, map, "[_]=(_)", map_subscript_set);
    primitive(vm, map, "remove(_)", map_remove);
    primitive(vm, map, "count", map_count);
    primitive(vm, map, "containsKey(_)", map_contains_key);

    primitive(vm, range, "from", range_from);
    primitive(vm, range, "to", range_to);
    primitive(vm, range, "isInclusive", range_is_inclusive);
    primitive(vm, range, "iterate(_)", range_iterate);
    primitive(vm, range, "iteratorValue(_)", range_iterator_value);

    static_primitive(vm, fn_class, "new(_)", fn_new);
    primitive(vm, fn_class, "arity", fn_arity);
    for args in 0..=16 {
        let signature = call_signature(args);
        primitive(vm, fn_class, &signature, fn_call);
    }

    static_primitive(vm, fiber, "new(_)", fiber_new);
    static_primitive(vm, fiber, "yield()", fiber_yield);
    static_primitive(vm, fiber, "yield(_)", fiber_yield);
    static_primitive(vm, fiber, "abort(_)", fiber_abort);
    static_primitive(vm, fiber, "current", fiber_current);
    primitive(vm, fiber, "call()", fiber_call);
    primitive(vm, fiber, "call(_)", fiber_call);
    primitive(vm, fiber, "try()", fiber_try);
    primitive(vm, fiber, "try(_)", fiber_try);
    primitive(vm, fiber, "isDone", fiber_is_done);
    primitive(vm, fiber, "error", fiber_error);

    // Exception and System are ordinary classes on top of Object.
    let exception_name = vm.new_string("Exception");
    let exception = class_binding::create_class(vm, exception_name, 2)
        .expect("Exception class bootstrap");
    class_binding::inherit(&mut vm.heap, exception, object);
    static_primitive(vm, exception, "new(_)", exception_new);
    primitive(vm, exception, "message", exception_message);
    primitive(vm, exception, "stackTrace", exception_stack_trace);

    let system_name = vm.new_string("System");
    let system = class_binding::create_class(vm, system_name, 0).expect("System class bootstrap");
    class_binding::inherit(&mut vm.heap, system, object);
    static_primitive(vm, system, "print(_)", system_print);
    static_primitive(vm, system, "write(_)", system_write);
    static_primitive(vm, system, "gc()", system_gc);

    // Publish everything as core-module variables. The runtime-only
    // table and module classes stay private.
    let variables: [(&str, Handle); 13] = [
        ("Object", object),
        ("Class", class),
        ("Bool", bool_class),
        ("Num", num),
        ("Null", null_class),
        ("String", string),
        ("List", list),
        ("Map", map),
        ("Range", range),
        ("Fn", fn_class),
        ("Fiber", fiber),
        ("Exception", exception),
        ("System", system),
    ];
    for (name, value) in variables {
        vm.heap_mut()
            .module_mut(core)
            .define(name, Value::Obj(value));
    }
}

/// Builds a `call` signature with `args` parameters.
fn call_signature(args: usize) -> String {
    if args == 0 {
        "call()".to_string()
    } else {
        let params = vec!["_"; args].join(",");
        format!("call({params})")
    }
}
