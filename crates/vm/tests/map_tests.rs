//! Map correctness: randomized insert/remove sequences over every
//! hashable key type, checked against a reference model, with tombstones
//! exercised heavily.

mod common;

use std::collections::HashMap;

use common::vm_with_output;
use quill_vm::{Value, Vm};

/// A tiny deterministic linear congruential generator.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }
}

/// Reference keys mirror VM keys structurally.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
enum ModelKey {
    Null,
    Bool(bool),
    Num(u64),
    Str(String),
    Range(i32, i32, bool),
}

fn vm_key(vm: &mut Vm, key: &ModelKey) -> Value {
    match key {
        ModelKey::Null => Value::Null,
        ModelKey::Bool(b) => Value::from_bool(*b),
        ModelKey::Num(n) => Value::Num(*n as f64),
        // A fresh string object every time: equality must be by
        // contents, not identity.
        ModelKey::Str(text) => vm.new_string_value(text),
        ModelKey::Range(from, to, inclusive) => {
            vm.new_range(f64::from(*from), f64::from(*to), *inclusive)
        }
    }
}

fn random_key(rng: &mut Lcg) -> ModelKey {
    match rng.next() % 5 {
        0 => ModelKey::Null,
        1 => ModelKey::Bool(rng.next() % 2 == 0),
        2 => ModelKey::Num(rng.next() % 40),
        3 => ModelKey::Str(format!("key-{}", rng.next() % 30)),
        _ => ModelKey::Range(
            (rng.next() % 10) as i32,
            (rng.next() % 10) as i32,
            rng.next() % 2 == 0,
        ),
    }
}

#[test]
fn test_random_inserts_and_removes_match_reference_model() {
    let mut test = vm_with_output();
    let vm = &mut test.vm;
    let map = vm.new_map();
    vm.push_root(map).expect("pin map");

    let mut model: HashMap<ModelKey, f64> = HashMap::new();
    let mut rng = Lcg(0x5eed);

    for step in 0..4000 {
        let key = random_key(&mut rng);
        let vm_key_value = vm_key(vm, &key);

        if rng.next() % 3 == 0 {
            // Remove.
            let removed = vm
                .heap_mut()
                .map_remove(map, vm_key_value)
                .expect("remove should succeed");
            let expected = model.remove(&key);
            assert_eq!(
                removed.and_then(|value| value.as_num()),
                expected,
                "step {step}: removal mismatch for {key:?}"
            );
        } else {
            // Insert or overwrite.
            let value = step as f64;
            vm.heap_mut()
                .map_set(map, vm_key_value, Value::Num(value))
                .expect("set should succeed");
            model.insert(key, value);
        }
    }

    // Every key in the model reads back its last value; removed keys are
    // absent regardless of tombstone placement.
    assert_eq!(vm.heap().map(map).len(), model.len());
    for (key, expected) in &model {
        let vm_key_value = vm_key(vm, key);
        let found = vm
            .heap()
            .map_get(map, vm_key_value)
            .expect("get should succeed")
            .and_then(|value| value.as_num());
        assert_eq!(found, Some(*expected), "lookup mismatch for {key:?}");
    }

    vm.pop_root();
}

#[test]
fn test_probes_walk_past_tombstones() {
    let mut test = vm_with_output();
    let vm = &mut test.vm;
    let map = vm.new_map();
    vm.push_root(map).expect("pin map");

    // Fill enough numeric keys to force collisions, delete half, then
    // verify the survivors are all still reachable.
    for n in 0..64 {
        vm.heap_mut()
            .map_set(map, Value::Num(n as f64), Value::Num(n as f64))
            .expect("set");
    }
    for n in (0..64).step_by(2) {
        vm.heap_mut()
            .map_remove(map, Value::Num(n as f64))
            .expect("remove");
    }

    assert_eq!(vm.heap().map(map).len(), 32);
    for n in (1..64).step_by(2) {
        let found = vm
            .heap()
            .map_get(map, Value::Num(n as f64))
            .expect("get")
            .and_then(|value| value.as_num());
        assert_eq!(found, Some(n as f64));
    }
    for n in (0..64).step_by(2) {
        assert!(vm
            .heap()
            .map_get(map, Value::Num(n as f64))
            .expect("get")
            .is_none());
    }

    vm.pop_root();
}

#[test]
fn test_equal_strings_are_one_key() {
    let mut test = vm_with_output();
    let vm = &mut test.vm;
    let map = vm.new_map();
    vm.push_root(map).expect("pin map");

    let first = vm.new_string_value("shared");
    vm.heap_mut()
        .map_set(map, first, Value::Num(1.0))
        .expect("set");

    let second = vm.new_string_value("shared");
    vm.heap_mut()
        .map_set(map, second, Value::Num(2.0))
        .expect("set");

    assert_eq!(vm.heap().map(map).len(), 1);
    let third = vm.new_string_value("shared");
    let found = vm
        .heap()
        .map_get(map, third)
        .expect("get")
        .and_then(|value| value.as_num());
    assert_eq!(found, Some(2.0));

    vm.pop_root();
}

#[test]
fn test_unhashable_keys_error() {
    let mut test = vm_with_output();
    let vm = &mut test.vm;
    let map = vm.new_map();
    let list = vm.new_list();

    let result = vm
        .heap_mut()
        .map_set(map, Value::Obj(list), Value::Null);
    assert!(result.is_err());
}

#[test]
fn test_draining_releases_storage() {
    let mut test = vm_with_output();
    let vm = &mut test.vm;
    let map = vm.new_map();

    for n in 0..256 {
        vm.heap_mut()
            .map_set(map, Value::Num(n as f64), Value::True)
            .expect("set");
    }
    let grown = vm.heap().map(map).capacity();

    for n in 0..256 {
        vm.heap_mut()
            .map_remove(map, Value::Num(n as f64))
            .expect("remove");
    }

    assert_eq!(vm.heap().map(map).len(), 0);
    assert!(vm.heap().map(map).capacity() < grown);
}
