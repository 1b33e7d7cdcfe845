//! Shared helpers for the integration suites: a VM with a captured print
//! sink, and shortcuts for interning symbols and running module bodies.
#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use quill_vm::{Handle, Value, Vm, VmConfig, VmResult};

/// A VM whose print output is captured for assertions.
pub struct TestVm {
    pub vm: Vm,
    pub output: Rc<RefCell<String>>,
}

/// Builds a VM that captures output.
pub fn vm_with_output() -> TestVm {
    vm_with_config(VmConfig::new())
}

/// Builds an output-capturing VM on top of `config`.
pub fn vm_with_config(config: VmConfig) -> TestVm {
    let output = Rc::new(RefCell::new(String::new()));
    let sink = output.clone();
    let config = config.with_print(Rc::new(move |text| sink.borrow_mut().push_str(text)));
    TestVm {
        vm: Vm::new(config),
        output,
    }
}

/// Interns a method signature.
pub fn sym(vm: &mut Vm, signature: &str) -> u16 {
    vm.ensure_method_symbol(signature).expect("method symbol") as u16
}

/// Looks up a module variable's slot.
pub fn var(vm: &Vm, module: Handle, name: &str) -> u16 {
    vm.heap()
        .module(module)
        .find_symbol(name)
        .unwrap_or_else(|| panic!("module variable {name}")) as u16
}

/// Reads a module variable's value.
pub fn var_value(vm: &Vm, module: Handle, name: &str) -> Value {
    vm.heap()
        .module(module)
        .find_variable(name)
        .unwrap_or_else(|| panic!("module variable {name}"))
}

/// Runs `func` as a fresh fiber and returns the interpreter outcome.
pub fn run(vm: &mut Vm, func: Handle) -> VmResult<()> {
    vm.push_root(func).expect("pin function");
    let fiber = vm.new_fiber(func);
    vm.pop_root();
    vm.set_fiber(Some(fiber));
    vm.run_interpreter()
}

/// Reads a module variable as a number, panicking on anything else.
pub fn var_num(vm: &Vm, module: Handle, name: &str) -> f64 {
    var_value(vm, module, name)
        .as_num()
        .unwrap_or_else(|| panic!("{name} should be a number"))
}

/// Reads a module variable as string text.
pub fn var_text(vm: &Vm, module: Handle, name: &str) -> String {
    let value = var_value(vm, module, name);
    let handle = value.as_obj().unwrap_or_else(|| panic!("{name} should be a string"));
    vm.heap().string(handle).to_text()
}
