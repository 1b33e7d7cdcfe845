//! Class construction and multiple-inheritance binding.
//!
//! A class acquires each superclass as a private, rewritten copy: the
//! copy's method bodies have their receiver-field indexes shifted to the
//! region the superclass's fields occupy in the subclass's layout, and
//! their super-call index lists prefixed with the superclass's position in
//! the subclass's superclass list. Dispatch then needs no per-call
//! adjustment; a super-index walk from the receiver's class lands on the
//! right copy and the copied code indexes fields absolutely.
//!
//! The field layout of a class C with superclasses S1..Sn is
//! `[C's own fields][S1's full layout][S2's full layout]...`, so a method
//! inherited from Sk addresses its fields at their original index plus
//! the field counts of everything placed before Sk.

use hashbrown::HashSet;

use quill_core::constants::MAX_FIELDS;

use crate::error::{VmError, VmResult};
use crate::heap::{Handle, Heap};
use crate::object::{ClassObj, ClosureObj, FnObj, ListObj, Method, ObjKind};
use crate::op_code::{read_u16, OpCode, METHOD_OPERAND_BYTES};
use crate::value::Value;
use crate::vm::Vm;

/// Makes `superclass` a superclass of `subclass` without rewriting:
/// appends it to the superclass list, widens the field layout and copies
/// its bound methods into any still-empty slots.
///
/// Used for the bootstrap hierarchy and for attaching already rewritten
/// copies; user superclasses go through [`graft_superclass`].
pub fn inherit(heap: &mut Heap, subclass: Handle, superclass: Handle) {
    let (sup_fields, methods) = {
        let sup = heap.class(superclass);
        (sup.num_fields, sup.methods.clone())
    };

    let supers = heap.class(subclass).superclasses;
    heap.list_mut(supers).add(Value::Obj(superclass));

    let sub = heap.class_mut(subclass);
    sub.num_fields += sup_fields;
    sub.parent_field_offset += sup_fields;

    // Earlier bindings win: a method already present (from the class
    // itself or an earlier superclass) is kept.
    for (symbol, method) in methods.iter().enumerate() {
        if method.is_bound() && !sub.method(symbol).is_bound() {
            sub.bind_method(symbol, method.clone());
        }
    }
}

/// Copies `superclass`'s bound methods into `subclass`'s still-empty
/// slots without touching fields or the superclass list.
///
/// The bootstrap builds the built-in classes before Object has any
/// methods, so the core library re-runs the method-copy half of
/// inheritance once the primitives exist.
pub fn reinherit_methods(heap: &mut Heap, subclass: Handle, superclass: Handle) {
    let methods = heap.class(superclass).methods.clone();
    let sub = heap.class_mut(subclass);
    for (symbol, method) in methods.iter().enumerate() {
        if method.is_bound() && !sub.method(symbol).is_bound() {
            sub.bind_method(symbol, method.clone());
        }
    }
}

/// Creates a class and its metaclass. The metaclass inherits Class so
/// static methods (constructors included) dispatch like instance methods.
pub fn create_class(vm: &mut Vm, name: Handle, num_fields: usize) -> VmResult<Handle> {
    vm.push_root(name)?;

    let meta_name_text = format!("{} metaclass", vm.heap.string(name).to_text());
    let meta_name = vm.new_string(&meta_name_text);
    vm.push_root(meta_name)?;

    let class_class = vm.metatable().class_class;
    let metaclass = allocate_bare_class(vm, meta_name, 0, Some(class_class))?;
    vm.pop_root(); // meta_name
    vm.push_root(metaclass)?;
    inherit(&mut vm.heap, metaclass, class_class);

    let class = allocate_bare_class(vm, name, num_fields, Some(metaclass))?;
    vm.pop_root(); // metaclass
    vm.pop_root(); // name
    Ok(class)
}

/// Allocates a class object with an empty superclass list.
fn allocate_bare_class(
    vm: &mut Vm,
    name: Handle,
    num_fields: usize,
    metaclass: Option<Handle>,
) -> VmResult<Handle> {
    vm.push_root(name)?;
    let supers = vm.new_list();
    vm.push_root(supers)?;
    let class = vm.alloc(
        ObjKind::Class(ClassObj::bare(name, num_fields, supers)),
        metaclass,
    );
    vm.pop_root();
    vm.pop_root();
    Ok(class)
}

/// Checks that `value` may be inherited from: it must be a class and not
/// one of the sealed built-in types. Returns the error message for the
/// raise on failure.
pub fn validate_superclass(vm: &Vm, name: Handle, value: Value) -> Result<Handle, String> {
    let Some(handle) = value.as_obj() else {
        return Err("Must inherit from a class.".to_string());
    };
    if !matches!(vm.heap().kind(handle), ObjKind::Class(_)) {
        return Err("Must inherit from a class.".to_string());
    }

    // Primitive methods on the sealed types assume their receiver's
    // concrete representation and would misbehave on a plain instance.
    let metatable = vm.metatable();
    let sealed = [
        metatable.class_class,
        metatable.fiber_class,
        metatable.fn_class,
        metatable.list_class,
        metatable.map_class,
        metatable.range_class,
        metatable.string_class,
    ];
    if sealed.contains(&handle) {
        let class_name = vm.heap().class(handle).name;
        return Err(format!(
            "{} cannot inherit from {}.",
            vm.heap().string(name).to_text(),
            vm.heap().string(class_name).to_text()
        ));
    }

    Ok(handle)
}

/// Grafts `superclass` onto `subclass` at `position` in its superclass
/// list, installing a rewritten private copy.
pub fn graft_superclass(
    vm: &mut Vm,
    subclass: Handle,
    superclass: Handle,
    position: usize,
) -> VmResult<()> {
    let offset = vm.heap.class(subclass).num_fields;
    vm.push_root(subclass)?;
    let copy = make_rewritten_copy(vm, superclass, offset, position);
    let copy = match copy {
        Ok(copy) => copy,
        Err(error) => {
            vm.pop_root();
            return Err(error);
        }
    };
    vm.push_root(copy)?;
    inherit(&mut vm.heap, subclass, copy);
    vm.pop_root();
    vm.pop_root();
    Ok(())
}

/// Builds the rewritten copy of `superclass` whose field region starts at
/// `offset` and whose super-calls resolve through index `position` of the
/// adopting class.
fn make_rewritten_copy(
    vm: &mut Vm,
    superclass: Handle,
    offset: usize,
    position: usize,
) -> VmResult<Handle> {
    let (name, own_fields, grands, methods) = {
        let sup = vm.heap.class(superclass);
        let own = sup.num_fields - sup.parent_field_offset;
        let grands: Vec<Handle> = vm
            .heap
            .list(sup.superclasses)
            .elements()
            .iter()
            .filter_map(Value::as_obj)
            .collect();
        (sup.name, own, grands, sup.methods.clone())
    };

    let copy = create_class(vm, name, own_fields)?;
    vm.push_root(copy)?;

    let result = (|| {
        // Rebuild the superclass tree so nested super-index walks keep
        // resolving; each grand copy lands after everything already
        // placed.
        let mut running = offset + own_fields;
        for (index, grand) in grands.iter().enumerate() {
            let grand_copy = make_rewritten_copy(vm, *grand, running, index)?;
            vm.push_root(grand_copy)?;
            inherit(&mut vm.heap, copy, grand_copy);
            vm.pop_root();
            running += vm.heap.class(grand_copy).num_fields;
        }

        // The superclass's own method table is authoritative; it already
        // contains its inherited methods at their sup-relative indexes,
        // so a uniform shift by `offset` places everything absolutely.
        for (symbol, method) in methods.iter().enumerate() {
            let rebound = match method {
                Method::None => continue,
                Method::Primitive(_) | Method::Foreign(_) => method.clone(),
                Method::Block(body) => {
                    Method::Block(copy_method_block(vm, *body, offset, position)?)
                }
            };
            vm.heap.class_mut(copy).bind_method(symbol, rebound);
        }

        // Destructors and foreign sizing travel with the copy.
        let (destructor, foreign_size) = {
            let sup = vm.heap.class(superclass);
            (sup.destructor.clone(), sup.foreign_byte_size)
        };
        let copy_class = vm.heap.class_mut(copy);
        copy_class.destructor = destructor;
        copy_class.foreign_byte_size = foreign_size;
        Ok(copy)
    })();

    vm.pop_root();
    result
}

/// Copies a method body (function or closure), shifting its receiver
/// field accesses by `field_delta` and prefixing its super-call index
/// lists with `super_position`.
pub fn copy_method_block(
    vm: &mut Vm,
    body: Handle,
    field_delta: usize,
    super_position: usize,
) -> VmResult<Handle> {
    match vm.heap.kind(body) {
        ObjKind::Fn(_) => rewrite_fn(vm, body, field_delta, super_position),
        ObjKind::Closure(_) => {
            let (func, upvalues) = {
                let closure = vm.heap.closure(body);
                (closure.func, closure.upvalues.clone())
            };
            let rewritten = rewrite_fn(vm, func, field_delta, super_position)?;
            vm.push_root(rewritten)?;
            let fn_class = vm.metatable().fn_class;
            let copy = vm.alloc(
                ObjKind::Closure(ClosureObj {
                    func: rewritten,
                    upvalues,
                }),
                Some(fn_class),
            );
            vm.pop_root();
            Ok(copy)
        }
        kind => Err(VmError::fatal(format!(
            "method body must be a function, found {}",
            kind.type_name()
        ))),
    }
}

/// Produces the rewritten copy of one function.
fn rewrite_fn(
    vm: &mut Vm,
    func: Handle,
    field_delta: usize,
    super_position: usize,
) -> VmResult<Handle> {
    let (mut code, mut constants, num_upvalues, arity, module, debug) = {
        let f = vm.heap.function(func);
        (
            f.bytecode.to_vec(),
            f.constants.to_vec(),
            f.num_upvalues,
            f.arity,
            f.module,
            f.debug.clone(),
        )
    };

    // The lists built below are reachable only from the local constant
    // pool until the new function exists, so collections are paused
    // instead of pinning an unbounded number of intermediates.
    vm.enable_gc(false);

    let result = (|| {
        let mut rewritten_lists: HashSet<usize> = HashSet::new();
        let mut pc = 0;
        while pc < code.len() {
            let op = OpCode::from_byte(code[pc])
                .ok_or_else(|| VmError::fatal(format!("malformed bytecode at {pc}")))?;
            pc += 1;

            match op {
                OpCode::LoadFieldThis | OpCode::StoreFieldThis => {
                    let index = code[pc] as usize + field_delta;
                    if index > MAX_FIELDS {
                        return Err(VmError::runtime("too many fields, including inherited ones"));
                    }
                    code[pc] = index as u8;
                    pc += 1;
                }
                OpCode::Closure => {
                    // Skip over the prototype's capture pairs; nested
                    // functions never touch receiver fields directly.
                    let constant = read_u16(&code, pc) as usize;
                    pc += 2;
                    let proto = constants
                        .get(constant)
                        .and_then(Value::as_obj)
                        .ok_or_else(|| VmError::fatal("closure constant is not a function"))?;
                    pc += 2 * vm.heap.function(proto).num_upvalues;
                }
                op if op.is_super() => {
                    let constant = read_u16(&code, pc + METHOD_OPERAND_BYTES) as usize;
                    if rewritten_lists.insert(constant) {
                        let old = constants
                            .get(constant)
                            .and_then(Value::as_obj)
                            .ok_or_else(|| VmError::fatal("super list constant is not a list"))?;
                        let mut elements = vec![Value::Num(super_position as f64)];
                        elements.extend_from_slice(vm.heap.list(old).elements());
                        let list_class = vm.metatable().list_class;
                        let prefixed = vm.alloc(
                            ObjKind::List(ListObj::from_elements(elements)),
                            Some(list_class),
                        );
                        constants[constant] = Value::Obj(prefixed);
                    }
                    pc += op.operand_bytes();
                }
                op => pc += op.operand_bytes(),
            }
        }

        Ok(vm.new_function(FnObj {
            bytecode: code.into(),
            constants: constants.into(),
            num_upvalues,
            arity,
            module,
            debug,
        }))
    })();

    vm.enable_gc(true);
    result
}

/// Binds `method` on `class` for `symbol`; static methods land on the
/// metaclass so constructors dispatch like instance methods.
pub fn bind_method(vm: &mut Vm, class: Handle, symbol: usize, method: Method, is_static: bool) {
    let target = if is_static {
        vm.heap
            .class_of(class)
            .unwrap_or_else(|| panic!("class without metaclass"))
    } else {
        class
    };
    vm.heap.class_mut(target).bind_method(symbol, method);
}

/// Transitive subclass membership.
///
/// Grafted superclasses are private copies, so identity alone cannot see
/// through them; two classes also match when they carry the same name,
/// which is consistent with classes hashing by name.
pub fn is_subclass(heap: &Heap, actual: Handle, expected: Handle) -> bool {
    if actual == expected {
        return true;
    }
    if class_names_equal(heap, actual, expected) {
        return true;
    }
    let supers = heap.class(actual).superclasses;
    let elements: Vec<Handle> = heap
        .list(supers)
        .elements()
        .iter()
        .filter_map(Value::as_obj)
        .collect();
    elements
        .iter()
        .any(|superclass| is_subclass(heap, *superclass, expected))
}

fn class_names_equal(heap: &Heap, a: Handle, b: Handle) -> bool {
    let a_name = heap.class(a).name;
    let b_name = heap.class(b).name;
    let (ObjKind::Str(a_name), ObjKind::Str(b_name)) = (heap.kind(a_name), heap.kind(b_name))
    else {
        return false;
    };
    a_name.equals(b_name)
}
