//! Interpreter benchmarks: a counting loop driven entirely through
//! method dispatch, and fiber creation/reset costs.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use quill_vm::{CodeBuilder, Handle, OpCode, Vm, VmConfig};

/// Builds `sum = 0; i = 0; while i < limit { sum = sum + i; i = i + 1 }`.
fn counting_loop(vm: &mut Vm, limit: f64) -> Handle {
    let module = vm.core_module();
    let plus = vm.ensure_method_symbol("+(_)").expect("symbol") as u16;
    let less = vm.ensure_method_symbol("<(_)").expect("symbol") as u16;

    let mut body = CodeBuilder::new("loop body");
    body.number(0.0); // slot 0: sum
    body.number(0.0); // slot 1: i
    let top = body.position();
    body.load_local(1).number(limit).call(2, less);
    let exit = body.jump(OpCode::JumpIf);
    body.load_local(0)
        .load_local(1)
        .call(2, plus)
        .store_local(0)
        .op(OpCode::Pop);
    body.load_local(1)
        .number(1.0)
        .call(2, plus)
        .store_local(1)
        .op(OpCode::Pop);
    body.loop_to(top);
    body.patch_jump(exit);
    body.load_local(0);
    body.finish();
    body.into_fn(vm, module).expect("build loop")
}

fn benchmark_dispatch_loop(c: &mut Criterion) {
    let mut vm = Vm::new(VmConfig::default());
    let func = counting_loop(&mut vm, 1000.0);
    vm.push_root(func).expect("pin");

    c.bench_function("interpreter_counting_loop_1000", |b| {
        b.iter(|| {
            let fiber = vm.new_fiber(func);
            vm.set_fiber(Some(fiber));
            vm.run_interpreter().expect("run");
            black_box(vm.heap().fiber(fiber).stack[1])
        })
    });
}

fn benchmark_fiber_reset(c: &mut Criterion) {
    let mut vm = Vm::new(VmConfig::default());
    let func = counting_loop(&mut vm, 10.0);
    vm.push_root(func).expect("pin");
    let fiber = vm.new_fiber(func);
    vm.push_root(fiber).expect("pin");

    c.bench_function("fiber_reset_and_run", |b| {
        b.iter(|| {
            vm.heap_mut().fiber_mut(fiber).reset(func);
            vm.set_fiber(Some(fiber));
            vm.run_interpreter().expect("run");
            black_box(vm.heap().fiber(fiber).stack[1])
        })
    });
}

criterion_group!(benches, benchmark_dispatch_loop, benchmark_fiber_reset);
criterion_main!(benches);
