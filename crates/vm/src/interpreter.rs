//! The bytecode interpreter.
//!
//! One dispatch loop executes the current fiber's topmost frame with the
//! frame's bytecode and constants cached in locals. Anything that changes
//! the frame stack or the active fiber (calls, returns, raises, fiber
//! transfers, imports) stores the program counter back into the frame and
//! reloads. The loop is only left when the program finishes, a raise goes
//! uncaught, or a fatal condition stops the VM.

use crate::class_binding;
use crate::debug;
use crate::error::{VmError, VmResult};
use crate::heap::Handle;
use crate::object::{ClosureObj, Method, ObjKind, PrimResult, UpvalueState};
use crate::object::fiber::CallFrame;
use crate::op_code::{read_u16, OpCode};
use crate::value::Value;
use crate::vm::Vm;

/// How the dispatch of one call continues.
enum Flow {
    /// Stay in the current frame.
    Next,
    /// The frame stack or active fiber changed; reload.
    Reload,
    /// The program finished.
    Done,
}

impl Vm {
    /// Runs the interpreter until the program completes or fails.
    ///
    /// On an uncaught raise the trace has already been reported through
    /// the print sink and the error is returned; fatal conditions (stack
    /// or call-depth overflow, malformed code) come back as fatal errors.
    pub fn run_interpreter(&mut self) -> VmResult<()> {
        'frames: loop {
            let Some(fiber) = self.fiber else {
                // Cancelled from a debug hook or foreign call.
                return Ok(());
            };

            let Some(frame) = self.heap.fiber(fiber).frames.last().copied() else {
                return Ok(());
            };

            let (fn_handle, closure) = match self.heap.kind(frame.func) {
                ObjKind::Fn(_) => (frame.func, None),
                ObjKind::Closure(c) => (c.func, Some(frame.func)),
                kind => {
                    return Err(VmError::fatal(format!(
                        "call frame holds a {}",
                        kind.type_name()
                    )))
                }
            };

            let (bytecode, constants, module) = {
                let f = self.heap.function(fn_handle);
                (f.bytecode.clone(), f.constants.clone(), f.module)
            };
            let base = frame.stack_base;
            let mut pc = frame.pc;

            loop {
                let op = OpCode::from_byte(bytecode[pc])
                    .ok_or_else(|| VmError::fatal(format!("bad opcode {:#04x}", bytecode[pc])))?;
                pc += 1;

                match op {
                    OpCode::Null => {
                        self.heap.fiber_mut(fiber).push(Value::Null);
                        self.check_stack_limit(fiber)?;
                    }
                    OpCode::True => {
                        self.heap.fiber_mut(fiber).push(Value::True);
                        self.check_stack_limit(fiber)?;
                    }
                    OpCode::False => {
                        self.heap.fiber_mut(fiber).push(Value::False);
                        self.check_stack_limit(fiber)?;
                    }
                    OpCode::Pop => {
                        self.heap.fiber_mut(fiber).pop();
                    }
                    OpCode::Dup => {
                        let top = self.heap.fiber(fiber).peek();
                        self.heap.fiber_mut(fiber).push(top);
                        self.check_stack_limit(fiber)?;
                    }
                    OpCode::Constant => {
                        let value = constants[read_u16(&bytecode, pc) as usize];
                        pc += 2;
                        self.heap.fiber_mut(fiber).push(value);
                        self.check_stack_limit(fiber)?;
                    }

                    OpCode::LoadLocal0
                    | OpCode::LoadLocal1
                    | OpCode::LoadLocal2
                    | OpCode::LoadLocal3
                    | OpCode::LoadLocal4
                    | OpCode::LoadLocal5
                    | OpCode::LoadLocal6
                    | OpCode::LoadLocal7
                    | OpCode::LoadLocal8 => {
                        let slot = op as usize - OpCode::LoadLocal0 as usize;
                        let value = self.heap.fiber(fiber).stack[base + slot];
                        self.heap.fiber_mut(fiber).push(value);
                        self.check_stack_limit(fiber)?;
                    }
                    OpCode::LoadLocal => {
                        let slot = bytecode[pc] as usize;
                        pc += 1;
                        let value = self.heap.fiber(fiber).stack[base + slot];
                        self.heap.fiber_mut(fiber).push(value);
                        self.check_stack_limit(fiber)?;
                    }
                    OpCode::StoreLocal => {
                        let slot = bytecode[pc] as usize;
                        pc += 1;
                        let f = self.heap.fiber_mut(fiber);
                        let top = f.peek();
                        f.stack[base + slot] = top;
                    }

                    OpCode::LoadUpvalue => {
                        let index = bytecode[pc] as usize;
                        pc += 1;
                        let closure = closure
                            .ok_or_else(|| VmError::fatal("upvalue access outside a closure"))?;
                        let upvalue = self.heap.closure(closure).upvalues[index];
                        let value = match self.heap.upvalue(upvalue).state {
                            UpvalueState::Open(slot) => self.heap.fiber(fiber).stack[slot],
                            UpvalueState::Closed(value) => value,
                        };
                        self.heap.fiber_mut(fiber).push(value);
                        self.check_stack_limit(fiber)?;
                    }
                    OpCode::StoreUpvalue => {
                        let index = bytecode[pc] as usize;
                        pc += 1;
                        let closure = closure
                            .ok_or_else(|| VmError::fatal("upvalue access outside a closure"))?;
                        let upvalue = self.heap.closure(closure).upvalues[index];
                        let value = self.heap.fiber(fiber).peek();
                        match self.heap.upvalue(upvalue).state {
                            UpvalueState::Open(slot) => {
                                self.heap.fiber_mut(fiber).stack[slot] = value;
                            }
                            UpvalueState::Closed(_) => {
                                self.heap.upvalue_mut(upvalue).state =
                                    UpvalueState::Closed(value);
                            }
                        }
                    }

                    OpCode::LoadModuleVar => {
                        let index = read_u16(&bytecode, pc) as usize;
                        pc += 2;
                        let value = self.heap.module(module).variables[index];
                        self.heap.fiber_mut(fiber).push(value);
                        self.check_stack_limit(fiber)?;
                    }
                    OpCode::StoreModuleVar => {
                        let index = read_u16(&bytecode, pc) as usize;
                        pc += 2;
                        let value = self.heap.fiber(fiber).peek();
                        self.heap.module_mut(module).variables[index] = value;
                    }

                    OpCode::LoadFieldThis | OpCode::StoreFieldThis => {
                        let field = bytecode[pc] as usize;
                        pc += 1;
                        let receiver = self.heap.fiber(fiber).stack[base];
                        let Some(instance) = self.as_instance(receiver) else {
                            self.store_pc(fiber, pc);
                            self.throw_text(fiber, "Receiver must be an instance.")?;
                            continue 'frames;
                        };
                        if op == OpCode::LoadFieldThis {
                            let value = self.heap.instance(instance).fields[field];
                            self.heap.fiber_mut(fiber).push(value);
                            self.check_stack_limit(fiber)?;
                        } else {
                            let value = self.heap.fiber(fiber).peek();
                            self.heap.instance_mut(instance).fields[field] = value;
                        }
                    }
                    OpCode::LoadField | OpCode::StoreField => {
                        let field = bytecode[pc] as usize;
                        pc += 1;
                        let receiver = self.heap.fiber_mut(fiber).pop();
                        let Some(instance) = self.as_instance(receiver) else {
                            self.store_pc(fiber, pc);
                            self.throw_text(fiber, "Receiver must be an instance.")?;
                            continue 'frames;
                        };
                        if op == OpCode::LoadField {
                            let value = self.heap.instance(instance).fields[field];
                            self.heap.fiber_mut(fiber).push(value);
                            self.check_stack_limit(fiber)?;
                        } else {
                            let value = self.heap.fiber(fiber).peek();
                            self.heap.instance_mut(instance).fields[field] = value;
                        }
                    }

                    OpCode::Jump => {
                        let offset = read_u16(&bytecode, pc) as usize;
                        pc += 2 + offset;
                    }
                    OpCode::Loop => {
                        let offset = read_u16(&bytecode, pc) as usize;
                        pc += 2;
                        pc -= offset;
                    }
                    OpCode::JumpIf => {
                        let offset = read_u16(&bytecode, pc) as usize;
                        pc += 2;
                        let condition = self.heap.fiber_mut(fiber).pop();
                        if condition.is_falsey() {
                            pc += offset;
                        }
                    }
                    OpCode::And => {
                        let offset = read_u16(&bytecode, pc) as usize;
                        pc += 2;
                        if self.heap.fiber(fiber).peek().is_falsey() {
                            // Short-circuit, keeping the left-hand value.
                            pc += offset;
                        } else {
                            self.heap.fiber_mut(fiber).pop();
                        }
                    }
                    OpCode::Or => {
                        let offset = read_u16(&bytecode, pc) as usize;
                        pc += 2;
                        if self.heap.fiber(fiber).peek().is_falsey() {
                            self.heap.fiber_mut(fiber).pop();
                        } else {
                            pc += offset;
                        }
                    }

                    OpCode::Is => {
                        let expected = self.heap.fiber_mut(fiber).pop();
                        let expected = match expected.as_obj() {
                            Some(handle)
                                if matches!(self.heap.kind(handle), ObjKind::Class(_)) =>
                            {
                                handle
                            }
                            _ => {
                                self.store_pc(fiber, pc);
                                self.throw_text(fiber, "Right operand must be a class.")?;
                                continue 'frames;
                            }
                        };
                        let value = self.heap.fiber_mut(fiber).pop();
                        let actual = self.class_of_value(value);
                        let result = class_binding::is_subclass(&self.heap, actual, expected);
                        self.heap.fiber_mut(fiber).push(Value::from_bool(result));
                        self.check_stack_limit(fiber)?;
                    }

                    OpCode::CloseUpvalue => {
                        let boundary = self.heap.fiber(fiber).stack_len() - 1;
                        self.close_upvalues_from(fiber, boundary);
                        self.heap.fiber_mut(fiber).pop();
                    }

                    OpCode::Return => {
                        let result = self.heap.fiber_mut(fiber).pop();
                        self.close_upvalues_from(fiber, base);
                        self.heap.fiber_mut(fiber).frames.pop();

                        if self.heap.fiber(fiber).frames.is_empty() {
                            let caller = self.heap.fiber_mut(fiber).caller.take();
                            match caller {
                                None => {
                                    // The program result lands in slot 1,
                                    // where the embedder reads it back.
                                    let f = self.heap.fiber_mut(fiber);
                                    while f.stack.len() < 2 {
                                        f.push(Value::Null);
                                    }
                                    f.stack[1] = result;
                                    return Ok(());
                                }
                                Some(caller) => {
                                    self.fiber = Some(caller);
                                    let c = self.heap.fiber_mut(caller);
                                    match c.stack.last_mut() {
                                        Some(slot) => *slot = result,
                                        None => c.push(result),
                                    }
                                    continue 'frames;
                                }
                            }
                        }

                        let f = self.heap.fiber_mut(fiber);
                        f.stack.truncate(base);
                        f.push(result);
                        f.maybe_shrink_stack();
                        continue 'frames;
                    }

                    OpCode::Closure => {
                        let constant = read_u16(&bytecode, pc) as usize;
                        pc += 2;
                        let proto = constants[constant]
                            .as_obj()
                            .ok_or_else(|| VmError::fatal("closure constant is not a function"))?;
                        let count = self.heap.function(proto).num_upvalues;

                        let mut upvalues = Vec::with_capacity(count);
                        for _ in 0..count {
                            let is_local = bytecode[pc] != 0;
                            let index = bytecode[pc + 1] as usize;
                            pc += 2;
                            let upvalue = if is_local {
                                self.capture_upvalue(fiber, base + index)
                            } else {
                                let enclosing = closure.ok_or_else(|| {
                                    VmError::fatal("upvalue capture outside a closure")
                                })?;
                                self.heap.closure(enclosing).upvalues[index]
                            };
                            upvalues.push(upvalue);
                        }

                        let fn_class = self.metatable.fn_class;
                        let new_closure = self.alloc(
                            ObjKind::Closure(ClosureObj {
                                func: proto,
                                upvalues,
                            }),
                            Some(fn_class),
                        );
                        self.heap.fiber_mut(fiber).push(Value::Obj(new_closure));
                        self.check_stack_limit(fiber)?;
                    }

                    OpCode::Class => {
                        let num_fields = bytecode[pc] as usize;
                        let super_slots = read_u16(&bytecode, pc + 1) as usize;
                        pc += 3;
                        self.store_pc(fiber, pc);
                        match self.build_class(fiber, num_fields, super_slots) {
                            Ok(()) => {
                                self.check_stack_limit(fiber)?;
                            }
                            Err(VmError::Runtime { message }) => {
                                self.throw_text(fiber, &message)?;
                                continue 'frames;
                            }
                            Err(error) => return Err(error),
                        }
                    }

                    OpCode::MethodInstance | OpCode::MethodStatic => {
                        let symbol = read_u16(&bytecode, pc) as usize;
                        pc += 2;
                        let class_value = self.heap.fiber(fiber).peek();
                        let body = self.heap.fiber(fiber).peek_at(1);
                        let Some(class) = class_value.as_obj() else {
                            return Err(VmError::fatal("method binding without a class"));
                        };
                        let Some(body) = body.as_obj() else {
                            return Err(VmError::fatal("method body is not a function"));
                        };
                        class_binding::bind_method(
                            self,
                            class,
                            symbol,
                            Method::Block(body),
                            op == OpCode::MethodStatic,
                        );
                        let f = self.heap.fiber_mut(fiber);
                        f.pop();
                        f.pop();
                    }

                    OpCode::LoadModule => {
                        let constant = read_u16(&bytecode, pc) as usize;
                        pc += 2;
                        self.store_pc(fiber, pc);
                        let name = constants[constant];
                        let outcome = self.import_module(name)?;
                        match outcome {
                            Value::Obj(handle)
                                if matches!(self.heap.kind(handle), ObjKind::Str(_)) =>
                            {
                                self.throw_value(fiber, outcome)?;
                                continue 'frames;
                            }
                            outcome => {
                                // Slot for the module body's result; the
                                // return path expects somewhere to put it.
                                self.heap.fiber_mut(fiber).push(Value::Null);
                                self.check_stack_limit(fiber)?;

                                if let Some(module_fiber) = outcome.as_obj() {
                                    if matches!(
                                        self.heap.kind(module_fiber),
                                        ObjKind::Fiber(_)
                                    ) {
                                        self.heap.fiber_mut(module_fiber).caller = Some(fiber);
                                        self.fiber = Some(module_fiber);
                                        continue 'frames;
                                    }
                                }
                            }
                        }
                    }

                    OpCode::ImportVariable => {
                        let module_constant = read_u16(&bytecode, pc) as usize;
                        let name_constant = read_u16(&bytecode, pc + 2) as usize;
                        pc += 4;
                        self.store_pc(fiber, pc);

                        let module_name = constants[module_constant];
                        let variable_name = constants[name_constant];
                        match self.import_variable(module_name, variable_name) {
                            Ok(value) => {
                                self.heap.fiber_mut(fiber).push(value);
                                self.check_stack_limit(fiber)?;
                            }
                            Err(VmError::Runtime { message }) => {
                                self.throw_text(fiber, &message)?;
                                continue 'frames;
                            }
                            Err(error) => return Err(error),
                        }
                    }

                    OpCode::Module => {
                        // Resolve the module object on the stack top.
                        let value = self.heap.fiber_mut(fiber).pop();
                        self.heap.fiber_mut(fiber).push(value);
                    }

                    op if op.call_args().is_some() => {
                        let num_args = op.call_args().unwrap_or(1);
                        let symbol = read_u16(&bytecode, pc) as usize;
                        pc += 2;

                        let receiver = self.heap.fiber(fiber).peek_at(num_args - 1);
                        let class = if op.is_super() {
                            let list_constant = read_u16(&bytecode, pc) as usize;
                            pc += 2;
                            self.store_pc(fiber, pc);
                            match self.resolve_super_target(receiver, constants[list_constant]) {
                                Ok(class) => class,
                                Err(VmError::Runtime { message }) => {
                                    self.throw_text(fiber, &message)?;
                                    continue 'frames;
                                }
                                Err(error) => return Err(error),
                            }
                        } else {
                            self.store_pc(fiber, pc);
                            self.class_of_value(receiver)
                        };

                        match self.dispatch_method(fiber, class, symbol, num_args)? {
                            Flow::Next => {}
                            Flow::Reload => continue 'frames,
                            Flow::Done => return Ok(()),
                        }
                    }

                    OpCode::Break => {
                        self.store_pc(fiber, pc);
                        if self.debug_mode {
                            if let Some(hook) = self.config.debug_hook.clone() {
                                (*hook)(self);
                            }
                        }
                        if self.fiber.is_none() {
                            return Ok(());
                        }
                        continue 'frames;
                    }

                    OpCode::End => {
                        // A Return always precedes End; reaching it means
                        // the compiler produced malformed code.
                        return Err(VmError::fatal("executed past the end of a function"));
                    }

                    _ => {
                        return Err(VmError::fatal(format!("unhandled opcode {op:?}")));
                    }
                }
            }
        }
    }

    // === Dispatch ===

    fn dispatch_method(
        &mut self,
        fiber: Handle,
        class: Handle,
        symbol: usize,
        num_args: usize,
    ) -> VmResult<Flow> {
        let window = self.heap.fiber(fiber).stack_len() - num_args;
        let method = self.heap.class(class).method(symbol).clone();

        match method {
            Method::None => {
                let message = self.method_not_found_message(class, symbol);
                self.throw_text(fiber, &message)?;
                Ok(Flow::Reload)
            }
            Method::Primitive(primitive) => match primitive(self, fiber, window, num_args) {
                PrimResult::Value(value) => {
                    let f = self.heap.fiber_mut(fiber);
                    f.stack.truncate(window);
                    f.push(value);
                    Ok(Flow::Next)
                }
                PrimResult::Error(error) => {
                    self.throw_value(fiber, error)?;
                    Ok(Flow::Reload)
                }
                PrimResult::Call { args } => {
                    let callee = self.heap.fiber(fiber).peek_at(args - 1);
                    let callee = callee
                        .as_obj()
                        .ok_or_else(|| VmError::fatal("call primitive without a function"))?;
                    self.call_function(fiber, callee, args)?;
                    Ok(Flow::Reload)
                }
                PrimResult::RunFiber(None) => Ok(Flow::Done),
                PrimResult::RunFiber(Some(target)) => {
                    self.fiber = Some(target);
                    Ok(Flow::Reload)
                }
                PrimResult::None => Ok(Flow::Next),
            },
            Method::Foreign(foreign) => {
                {
                    let f = self.heap.fiber_mut(fiber);
                    f.foreign_base = Some(window);
                    f.foreign_argc = num_args;
                }
                (*foreign)(self);
                let f = self.heap.fiber_mut(fiber);
                let unreturned = f.foreign_base.take().is_some();
                f.stack.truncate(window + 1);
                if unreturned {
                    f.stack[window] = Value::Null;
                }
                Ok(Flow::Next)
            }
            Method::Block(body) => {
                self.call_function(fiber, body, num_args)?;
                Ok(Flow::Reload)
            }
        }
    }

    /// Walks a super-index list from the receiver's class to the
    /// dispatch target.
    fn resolve_super_target(&self, receiver: Value, list: Value) -> VmResult<Handle> {
        let list = list
            .as_obj()
            .ok_or_else(|| VmError::fatal("super list constant is not a list"))?;

        let mut class = self.class_of_value(receiver);
        let steps: Vec<Option<f64>> = self
            .heap
            .list(list)
            .elements()
            .iter()
            .map(Value::as_num)
            .collect();

        for step in steps {
            let step = step
                .filter(|index| *index >= 0.0)
                .ok_or_else(|| VmError::runtime("Superclass lookup failed."))?;
            let supers = self.heap.class(class).superclasses;
            class = self
                .heap
                .list(supers)
                .get(step as usize)
                .and_then(|value| value.as_obj())
                .ok_or_else(|| VmError::runtime("Superclass lookup failed."))?;
        }
        Ok(class)
    }

    fn method_not_found_message(&self, class: Handle, symbol: usize) -> String {
        let class_name = {
            let name = self.heap.class(class).name;
            self.heap.string(name).to_text()
        };
        let signature = self.method_signature(symbol).unwrap_or("<unknown>");
        format!("{class_name} does not implement '{signature}'.")
    }

    // === Calls and frames ===

    /// Pushes a frame for `func` whose window of `num_args` values
    /// (receiver included) is already on the stack.
    pub(crate) fn call_function(
        &mut self,
        fiber: Handle,
        func: Handle,
        num_args: usize,
    ) -> VmResult<()> {
        let f = self.heap.fiber_mut(fiber);
        let stack_base = f.stack.len() - num_args;
        f.frames.push(CallFrame {
            func,
            pc: 0,
            stack_base,
        });

        if f.frames.len() > self.config.max_call_depth {
            return Err(self.crash(fiber, "call depth limit reached"));
        }
        Ok(())
    }

    fn store_pc(&mut self, fiber: Handle, pc: usize) {
        if let Some(frame) = self.heap.fiber_mut(fiber).frames.last_mut() {
            frame.pc = pc;
        }
    }

    fn check_stack_limit(&mut self, fiber: Handle) -> VmResult<()> {
        if self.heap.fiber(fiber).stack_len() > self.config.max_stack {
            return Err(self.crash(fiber, "stack size limit reached"));
        }
        Ok(())
    }

    /// Reports an unrecoverable condition: no caller can catch it.
    fn crash(&mut self, fiber: Handle, message: &str) -> VmError {
        if let Ok(exception) = self.exception_from_text(message) {
            self.heap.fiber_mut(fiber).error = Some(exception);
        }
        debug::report_runtime_error(self, fiber, message);
        VmError::fatal(message)
    }

    // === Raising ===

    /// Raises `error` on `fiber`: wraps it in an exception carrying a
    /// frozen stack trace, then transfers to a trying caller or reports
    /// the error and leaves the loop.
    pub(crate) fn throw_value(&mut self, fiber: Handle, error: Value) -> VmResult<()> {
        let exception = match error {
            Value::Obj(handle) if matches!(self.heap.kind(handle), ObjKind::Instance(_)) => handle,
            Value::Obj(handle) if matches!(self.heap.kind(handle), ObjKind::Str(_)) => {
                self.exception_with_message(handle)?
            }
            other => {
                let text = self.value_to_display(other);
                self.exception_from_text(&text)?
            }
        };

        // Freeze the trace into the exception's second field.
        self.push_root(exception)?;
        let trace = debug::stack_trace(self, fiber);
        let trace = self.new_string(&trace);
        self.pop_root();
        {
            let fields = &mut self.heap.instance_mut(exception).fields;
            if fields.len() >= 2 {
                fields[1] = Value::Obj(trace);
            }
        }

        self.heap.fiber_mut(fiber).error = Some(exception);

        let (trying, caller) = {
            let f = self.heap.fiber(fiber);
            (f.caller_is_trying, f.caller)
        };

        if trying {
            let caller = caller
                .ok_or_else(|| VmError::fatal("trying fiber has no caller"))?;
            let c = self.heap.fiber_mut(caller);
            match c.stack.last_mut() {
                Some(slot) => *slot = Value::Obj(exception),
                None => c.push(Value::Obj(exception)),
            }
            self.fiber = Some(caller);
            return Ok(());
        }

        let message = debug::error_message(self, exception);
        debug::report_runtime_error(self, fiber, &message);
        Err(VmError::runtime(message))
    }

    /// Raises a plain message.
    pub(crate) fn throw_text(&mut self, fiber: Handle, message: &str) -> VmResult<()> {
        let message = self.new_string_value(message);
        self.throw_value(fiber, message)
    }

    // === Upvalues ===

    /// Captures the stack slot at `slot` into an upvalue, reusing an
    /// existing open upvalue so closures over the same variable share it.
    fn capture_upvalue(&mut self, fiber: Handle, slot: usize) -> Handle {
        let existing = self
            .heap
            .fiber(fiber)
            .open_upvalues
            .iter()
            .copied()
            .find(|handle| self.heap.upvalue(*handle).open_slot() == Some(slot));
        if let Some(handle) = existing {
            return handle;
        }

        let upvalue = self.new_upvalue(slot);

        // Keep the list sorted by decreasing stack slot.
        let position = {
            let f = self.heap.fiber(fiber);
            f.open_upvalues
                .iter()
                .position(|handle| {
                    self.heap.upvalue(*handle).open_slot().unwrap_or(0) < slot
                })
                .unwrap_or(f.open_upvalues.len())
        };
        self.heap
            .fiber_mut(fiber)
            .open_upvalues
            .insert(position, upvalue);
        upvalue
    }

    /// Closes every open upvalue at or above `boundary`: the captured
    /// value moves into the upvalue and it leaves the open list.
    pub(crate) fn close_upvalues_from(&mut self, fiber: Handle, boundary: usize) {
        let open = self.heap.fiber(fiber).open_upvalues.clone();
        let mut remaining = Vec::with_capacity(open.len());

        for handle in open {
            match self.heap.upvalue(handle).open_slot() {
                Some(slot) if slot >= boundary => {
                    let value = self.heap.fiber(fiber).stack[slot];
                    self.heap.upvalue_mut(handle).state = UpvalueState::Closed(value);
                }
                _ => remaining.push(handle),
            }
        }

        self.heap.fiber_mut(fiber).open_upvalues = remaining;
    }

    // === Classes ===

    /// Executes the class-construction instruction: pops the name and
    /// superclass slots, builds the class and pushes it.
    fn build_class(
        &mut self,
        fiber: Handle,
        num_fields: usize,
        super_slots: usize,
    ) -> VmResult<()> {
        use quill_core::constants::MAX_FIELDS;

        let name_value = self.heap.fiber_mut(fiber).pop();
        let name = name_value
            .as_obj()
            .filter(|handle| matches!(self.heap.kind(*handle), ObjKind::Str(_)))
            .ok_or_else(|| VmError::fatal("class name is not a string"))?;
        self.push_root(name)?;

        let result = (|| {
            // The primary superclass slot; null means Object.
            let primary = self.heap.fiber(fiber).peek();
            let class = if primary.is_null() {
                let class = class_binding::create_class(self, name, num_fields)?;
                self.push_root(class)?;
                let object = self.metatable.object_class;
                class_binding::inherit(&mut self.heap, class, object);
                self.pop_root();
                class
            } else {
                let superclass = class_binding::validate_superclass(self, name, primary)
                    .map_err(VmError::runtime)?;
                let class = class_binding::create_class(self, name, num_fields)?;
                self.push_root(class)?;
                let grafted = class_binding::graft_superclass(self, class, superclass, 0);
                self.pop_root();
                grafted?;
                class
            };
            self.heap.fiber_mut(fiber).pop();

            self.push_root(class)?;
            let result = (|| {
                for position in 1..super_slots {
                    let slot = self.heap.fiber(fiber).peek();
                    if !slot.is_null() {
                        let superclass = class_binding::validate_superclass(self, name, slot)
                            .map_err(VmError::runtime)?;
                        class_binding::graft_superclass(self, class, superclass, position)?;
                    }
                    self.heap.fiber_mut(fiber).pop();
                }

                if self.heap.class(class).num_fields > MAX_FIELDS {
                    let class_name = self.heap.string(name).to_text();
                    return Err(VmError::runtime(format!(
                        "Class '{class_name}' may not have more than {MAX_FIELDS} fields, \
                         including inherited ones."
                    )));
                }
                Ok(())
            })();
            self.pop_root();
            result?;

            self.heap.fiber_mut(fiber).push(Value::Obj(class));
            Ok(())
        })();

        self.pop_root();
        result
    }

    fn as_instance(&self, value: Value) -> Option<Handle> {
        value
            .as_obj()
            .filter(|handle| matches!(self.heap.kind(*handle), ObjKind::Instance(_)))
    }

    // === Imports ===

    /// Imports the module named by `name`. Returns null when the module
    /// is already loaded, a fiber that must run the module body first, or
    /// an error-message string.
    pub(crate) fn import_module(&mut self, name: Value) -> VmResult<Value> {
        if self.lookup_module(name).is_some() {
            return Ok(Value::Null);
        }

        let name_text = match name.as_obj() {
            Some(handle) => match self.heap.kind(handle) {
                ObjKind::Str(s) => s.to_text(),
                _ => return Err(VmError::fatal("module name is not a string")),
            },
            None => return Err(VmError::fatal("module name is not a string")),
        };

        let Some(loader) = self.config.module_loader.clone() else {
            return Ok(self.new_string_value(format!("Could not find module '{name_text}'.").as_str()));
        };
        let Some(source) = (*loader)(&name_text) else {
            return Ok(self.new_string_value(format!("Could not find module '{name_text}'.").as_str()));
        };

        let Some(compiler) = self.config.compiler.clone() else {
            return Ok(self.new_string_value(format!("Could not compile module '{name_text}'.").as_str()));
        };

        if let Some(handle) = name.as_obj() {
            self.push_root(handle)?;
        }
        let result = (|| {
            let module = self.ready_new_module()?;
            self.push_root(module)?;
            let registered = self.save_module(module, name);
            self.pop_root();
            registered?;

            let Some(func) = (*compiler)(self, module, &name_text, &source) else {
                return Ok(
                    self.new_string_value(format!("Could not compile module '{name_text}'.").as_str())
                );
            };
            self.heap.module_mut(module).entry = Some(func);
            let source_handle = self.new_string(&source);
            self.heap.module_mut(module).source = Some(source_handle);

            let module_fiber = self.new_fiber(func);
            Ok(Value::Obj(module_fiber))
        })();
        if name.as_obj().is_some() {
            self.pop_root();
        }
        result
    }

    /// Reads the current value of a variable from an already loaded
    /// module.
    fn import_variable(&mut self, module_name: Value, variable_name: Value) -> VmResult<Value> {
        let module = self.lookup_module(module_name).ok_or_else(|| {
            let name = self.value_to_display(module_name);
            VmError::runtime(format!("Module '{name}' is not loaded."))
        })?;

        let variable = match variable_name.as_obj() {
            Some(handle) => match self.heap.kind(handle) {
                ObjKind::Str(s) => s.to_text(),
                _ => return Err(VmError::fatal("variable name is not a string")),
            },
            None => return Err(VmError::fatal("variable name is not a string")),
        };

        self.heap
            .module(module)
            .find_variable(&variable)
            .ok_or_else(|| {
                let module_name = self.value_to_display(module_name);
                VmError::runtime(format!(
                    "Could not find a variable named '{variable}' in module '{module_name}'."
                ))
            })
    }
}
