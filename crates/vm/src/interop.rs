//! The embedder API.
//!
//! Hosts never see raw heap handles. Every value a host holds is an
//! opaque integer key mapped through the host-object table, which is a GC
//! root, so host-held values survive collection and released keys recycle
//! through a freelist. Foreign methods read their arguments through a
//! per-fiber call window and return at most once; an unreturned call
//! yields null.
//!
//! Script methods are invoked from the host through a reusable
//! [`MethodHandle`]-style fiber: a stub function that performs a single
//! call, with the receiver parked at the bottom of the fiber's stack.

use crate::class_binding;
use crate::code_builder::CodeBuilder;
use crate::error::{LangResult, VmError, VmResult};
use crate::heap::Handle;
use crate::object::{ForeignFn, Method, ObjKind};
use crate::object::class::DestructorFn;
use crate::value::Value;
use crate::vm::Vm;

/// An opaque host-side reference to a VM value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostHandle {
    key: u32,
}

impl Vm {
    fn host_key_value(handle: HostHandle) -> Value {
        Value::Num(f64::from(handle.key))
    }

    // === Handle lifecycle ===

    /// Wraps `value` in a new host handle.
    pub fn host_new_value(&mut self, value: Value) -> VmResult<HostHandle> {
        let key = {
            let free = self.host.free_keys;
            let len = self.heap.list(free).len();
            if len > 0 {
                let recycled = self.heap.list_mut(free).remove_at(len - 1);
                recycled
                    .as_num()
                    .ok_or_else(|| VmError::fatal("host freelist holds a non-number"))?
                    as u32
            } else {
                let key = self.host.next_key;
                self.host.next_key += 1;
                key
            }
        };

        let handle = HostHandle { key };
        self.heap
            .table_set(self.host.table, Self::host_key_value(handle), value)?;
        Ok(handle)
    }

    /// Reads the value behind a handle.
    pub fn host_value(&self, handle: HostHandle) -> VmResult<Value> {
        self.heap
            .table_get(self.host.table, Self::host_key_value(handle))?
            .ok_or(VmError::InvalidHandle)
    }

    /// Releases a handle; its key goes back on the freelist.
    pub fn release(&mut self, handle: HostHandle) -> VmResult<()> {
        self.heap
            .table_remove(self.host.table, Self::host_key_value(handle))?
            .ok_or(VmError::InvalidHandle)?;
        let free = self.host.free_keys;
        self.heap
            .list_mut(free)
            .add(Value::Num(f64::from(handle.key)));
        Ok(())
    }

    /// Drops every host handle at once.
    pub fn flush_host_objects(&mut self) {
        let table = self.new_table();
        let free = self.new_list();
        self.host.table = table;
        self.host.free_keys = free;
        self.host.next_key = 0;
    }

    fn new_table(&mut self) -> Handle {
        let class = self.metatable.table_class;
        self.alloc(
            ObjKind::Table(crate::object::TableObj::new()),
            Some(class),
        )
    }

    // === Handle constructors ===

    /// Creates a number handle.
    pub fn create_number(&mut self, value: f64) -> VmResult<HostHandle> {
        self.host_new_value(Value::Num(value))
    }

    /// Creates a boolean handle.
    pub fn create_bool(&mut self, value: bool) -> VmResult<HostHandle> {
        self.host_new_value(Value::from_bool(value))
    }

    /// Creates a null handle.
    pub fn create_null(&mut self) -> VmResult<HostHandle> {
        self.host_new_value(Value::Null)
    }

    /// Creates a string handle; the text is copied into the VM heap.
    pub fn create_string(&mut self, text: &str) -> VmResult<HostHandle> {
        let value = self.new_string_value(text);
        self.host_new_value(value)
    }

    /// Creates an empty-list handle.
    pub fn create_list(&mut self) -> VmResult<HostHandle> {
        let list = self.new_list();
        self.host_new_value(Value::Obj(list))
    }

    /// Creates an empty-map handle.
    pub fn create_map(&mut self) -> VmResult<HostHandle> {
        let map = self.new_map();
        self.host_new_value(Value::Obj(map))
    }

    /// Appends an element to a held list.
    pub fn list_append(&mut self, list: HostHandle, element: HostHandle) -> VmResult<()> {
        let list_value = self.host_value(list)?;
        let element = self.host_value(element)?;
        let list = list_value
            .as_obj()
            .filter(|handle| matches!(self.heap.kind(*handle), ObjKind::List(_)))
            .ok_or_else(|| VmError::wrong_type("list", self.type_name_of(list_value)))?;
        self.heap.list_mut(list).add(element);
        Ok(())
    }

    /// Sets a key in a held map.
    pub fn map_insert(
        &mut self,
        map: HostHandle,
        key: HostHandle,
        value: HostHandle,
    ) -> VmResult<()> {
        let map_value = self.host_value(map)?;
        let key = self.host_value(key)?;
        let value = self.host_value(value)?;
        let map = map_value
            .as_obj()
            .filter(|handle| matches!(self.heap.kind(*handle), ObjKind::Map(_)))
            .ok_or_else(|| VmError::wrong_type("map", self.type_name_of(map_value)))?;
        self.heap.map_set(map, key, value)
    }

    // === Handle readers ===

    /// Reads a number out of a handle.
    pub fn read_number(&self, handle: HostHandle) -> VmResult<f64> {
        let value = self.host_value(handle)?;
        value
            .as_num()
            .ok_or_else(|| VmError::wrong_type("number", self.type_name_of(value)))
    }

    /// Reads a boolean out of a handle.
    pub fn read_bool(&self, handle: HostHandle) -> VmResult<bool> {
        let value = self.host_value(handle)?;
        value
            .as_bool()
            .ok_or_else(|| VmError::wrong_type("bool", self.type_name_of(value)))
    }

    /// Reads string text out of a handle.
    pub fn read_string(&self, handle: HostHandle) -> VmResult<String> {
        let value = self.host_value(handle)?;
        match value.as_obj().map(|handle| self.heap.kind(handle)) {
            Some(ObjKind::Str(s)) => Ok(s.to_text()),
            _ => Err(VmError::wrong_type(
                "string".to_string(),
                self.type_name_of(value),
            )),
        }
    }

    /// Borrows the foreign payload of a held instance.
    pub fn read_instance_payload(&mut self, handle: HostHandle) -> VmResult<&mut [u8]> {
        let value = self.host_value(handle)?;
        let instance = value
            .as_obj()
            .filter(|handle| matches!(self.heap.kind(*handle), ObjKind::Instance(_)))
            .ok_or_else(|| VmError::wrong_type("instance", self.type_name_of(value)))?;
        self.heap
            .instance_mut(instance)
            .foreign
            .as_deref_mut()
            .ok_or_else(|| VmError::wrong_type("foreign instance", "plain instance".to_string()))
    }

    // === Class and method registration ===

    /// Resolves a module by name, defaulting to the core module.
    fn resolve_module(&self, module: Option<&str>) -> Handle {
        match module.and_then(|name| self.lookup_module_named(name)) {
            Some(module) => module,
            None => self.core_module(),
        }
    }

    /// Defines a class in `module` with a foreign payload of
    /// `byte_size` bytes per instance, optionally under a parent class
    /// named in the same module. Does nothing if the name is taken.
    pub fn define_class(
        &mut self,
        module: Option<&str>,
        name: &str,
        byte_size: usize,
        parent: Option<&str>,
    ) -> VmResult<()> {
        let module_handle = self.resolve_module(module);
        if self.heap.module(module_handle).find_variable(name).is_some() {
            return Ok(());
        }

        let parent_class = match parent {
            None => None,
            Some(parent_name) => {
                let value = self
                    .heap
                    .module(module_handle)
                    .find_variable(parent_name)
                    .ok_or_else(|| {
                        VmError::unknown_variable(
                            self.module_display_name(module_handle),
                            parent_name.to_string(),
                        )
                    })?;
                Some(
                    value
                        .as_obj()
                        .filter(|handle| matches!(self.heap.kind(*handle), ObjKind::Class(_)))
                        .ok_or_else(|| {
                            VmError::wrong_type("class".to_string(), self.type_name_of(value))
                        })?,
                )
            }
        };

        let name_handle = self.new_string(name);
        let class = class_binding::create_class(self, name_handle, 0)?;
        self.push_root(class)?;

        let result = (|| {
            match parent_class {
                None => {
                    let object = self.metatable.object_class;
                    class_binding::inherit(&mut self.heap, class, object);
                }
                Some(parent) if parent == self.metatable.object_class => {
                    class_binding::inherit(&mut self.heap, class, parent);
                }
                Some(parent) => {
                    class_binding::graft_superclass(self, class, parent, 0)?;
                }
            }
            self.heap.class_mut(class).foreign_byte_size = byte_size;
            self.define_variable(module_handle, name, Value::Obj(class))?;
            Ok(())
        })();

        self.pop_root();
        result
    }

    /// Finds a class variable, creating the class if it is absent.
    fn find_or_create_class(&mut self, module: Handle, name: &str) -> VmResult<Handle> {
        if let Some(value) = self.heap.module(module).find_variable(name) {
            return value
                .as_obj()
                .filter(|handle| matches!(self.heap.kind(*handle), ObjKind::Class(_)))
                .ok_or_else(|| VmError::wrong_type("class".to_string(), self.type_name_of(value)));
        }

        let name_handle = self.new_string(name);
        let class = class_binding::create_class(self, name_handle, 0)?;
        self.push_root(class)?;
        let result = (|| {
            let object = self.metatable.object_class;
            class_binding::inherit(&mut self.heap, class, object);
            self.define_variable(module, name, Value::Obj(class))?;
            Ok(class)
        })();
        self.pop_root();
        result
    }

    /// Binds a foreign instance method on the named class, creating the
    /// class if needed. Replaces any method already bound for the
    /// signature.
    pub fn define_method(
        &mut self,
        module: Option<&str>,
        class_name: &str,
        signature: &str,
        function: ForeignFn,
    ) -> VmResult<()> {
        self.define_method_impl(module, class_name, signature, function, false)
    }

    /// Binds a foreign static method on the named class.
    pub fn define_static_method(
        &mut self,
        module: Option<&str>,
        class_name: &str,
        signature: &str,
        function: ForeignFn,
    ) -> VmResult<()> {
        self.define_method_impl(module, class_name, signature, function, true)
    }

    fn define_method_impl(
        &mut self,
        module: Option<&str>,
        class_name: &str,
        signature: &str,
        function: ForeignFn,
        is_static: bool,
    ) -> VmResult<()> {
        let module = self.resolve_module(module);
        let class = self.find_or_create_class(module, class_name)?;
        let symbol = self.ensure_method_symbol(signature)?;
        class_binding::bind_method(self, class, symbol, Method::Foreign(function), is_static);
        Ok(())
    }

    /// Registers a destructor for instances of the named class. It runs
    /// at sweep time against the raw foreign payload.
    pub fn define_destructor(
        &mut self,
        module: Option<&str>,
        class_name: &str,
        destructor: DestructorFn,
    ) -> VmResult<()> {
        let module = self.resolve_module(module);
        let class = self.find_or_create_class(module, class_name)?;
        self.heap.class_mut(class).destructor = Some(destructor);
        Ok(())
    }

    /// Clears a module-level variable to null.
    pub fn remove_variable(&mut self, module: Option<&str>, name: &str) -> VmResult<()> {
        let module = self.resolve_module(module);
        if self.heap.module_mut(module).remove_variable(name) {
            Ok(())
        } else {
            Err(VmError::unknown_variable(
                self.module_display_name(module),
                name.to_string(),
            ))
        }
    }

    /// Unbinds a method from the named class.
    pub fn remove_method(
        &mut self,
        module: Option<&str>,
        class_name: &str,
        signature: &str,
        is_static: bool,
    ) -> VmResult<()> {
        let module = self.resolve_module(module);
        let class = self.find_or_create_class(module, class_name)?;
        let Some(symbol) = self.find_method_symbol(signature) else {
            return Ok(());
        };
        let target = if is_static {
            self.heap
                .class_of(class)
                .ok_or_else(|| VmError::fatal("class without metaclass"))?
        } else {
            class
        };
        self.heap.class_mut(target).remove_method(symbol);
        Ok(())
    }

    // === Module management ===

    /// Creates (and registers) an empty module seeded with the core
    /// variables.
    pub fn create_module(&mut self, name: &str) -> VmResult<()> {
        if self.lookup_module_named(name).is_some() {
            return Ok(());
        }
        let name_value = self.new_string_value(name);
        if let Value::Obj(handle) = name_value {
            self.push_root(handle)?;
        }
        let result = (|| {
            let module = self.ready_new_module()?;
            self.save_module(module, name_value)
        })();
        if name_value.is_obj() {
            self.pop_root();
        }
        result
    }

    /// Removes a module from the registry.
    pub fn remove_module(&mut self, name: &str) -> VmResult<()> {
        let name_value = self.new_string_value(name);
        self.heap
            .map_remove(self.modules, name_value)?
            .map(|_| ())
            .ok_or_else(|| VmError::unknown_module(name))
    }

    /// Reads a module-level variable into a host handle.
    pub fn module_variable(&mut self, module: Option<&str>, name: &str) -> VmResult<HostHandle> {
        let module = self.resolve_module(module);
        let value = self
            .heap
            .module(module)
            .find_variable(name)
            .ok_or_else(|| {
                VmError::unknown_variable(self.module_display_name(module), name.to_string())
            })?;
        self.host_new_value(value)
    }

    // === Method invocation ===

    /// Looks up a method on a module-level variable, returning a
    /// reusable invocation handle.
    pub fn get_method(
        &mut self,
        module: Option<&str>,
        variable: &str,
        signature: &str,
    ) -> VmResult<HostHandle> {
        let module_handle = self.resolve_module(module);
        let receiver = self
            .heap
            .module(module_handle)
            .find_variable(variable)
            .ok_or_else(|| {
                VmError::unknown_variable(
                    self.module_display_name(module_handle),
                    variable.to_string(),
                )
            })?;
        self.build_method_handle(module_handle, receiver, signature)
    }

    /// Looks up a method on a host-held receiver.
    pub fn get_method_on(
        &mut self,
        module: Option<&str>,
        receiver: HostHandle,
        signature: &str,
    ) -> VmResult<HostHandle> {
        let module = self.resolve_module(module);
        let receiver = self.host_value(receiver)?;
        self.build_method_handle(module, receiver, signature)
    }

    /// Builds the stub function and pristine fiber that together make a
    /// method reusable from the host.
    fn build_method_handle(
        &mut self,
        module: Handle,
        receiver: Value,
        signature: &str,
    ) -> VmResult<HostHandle> {
        let stub = self.make_call_stub(module, signature)?;
        self.push_root(stub)?;
        let fiber = self.new_fiber(stub);
        self.pop_root();
        self.push_root(fiber)?;

        let result = (|| {
            let handle = self.host_new_value(Value::Obj(fiber))?;
            // The receiver parks at the stack bottom; each invocation
            // pushes arguments on top of it.
            self.heap.fiber_mut(fiber).push(receiver);
            Ok(handle)
        })();

        self.pop_root();
        result
    }

    /// Creates the one-call stub: a single call instruction for the
    /// signature followed by a return.
    fn make_call_stub(&mut self, module: Handle, signature: &str) -> VmResult<Handle> {
        let params = signature.chars().filter(|c| *c == '_').count();
        let symbol = self.ensure_method_symbol(signature)?;

        let mut builder = CodeBuilder::new(signature);
        builder.call(params + 1, symbol as u16).finish();
        builder.into_fn(self, module)
    }

    /// Invokes a method handle with the given arguments, returning the
    /// result as a new handle. The method's fiber is reset to its
    /// pristine state afterwards so the handle stays reusable.
    pub fn call_method(
        &mut self,
        method: HostHandle,
        args: &[HostHandle],
    ) -> VmResult<HostHandle> {
        let fiber_value = self.host_value(method)?;
        let fiber = fiber_value
            .as_obj()
            .filter(|handle| matches!(self.heap.kind(*handle), ObjKind::Fiber(_)))
            .ok_or_else(|| VmError::wrong_type("method handle", self.type_name_of(fiber_value)))?;

        let (receiver, stub) = {
            let f = self.heap.fiber(fiber);
            let receiver = f
                .stack
                .first()
                .copied()
                .ok_or_else(|| VmError::fatal("method fiber lost its receiver"))?;
            let stub = f
                .frames
                .first()
                .map(|frame| frame.func)
                .ok_or_else(|| VmError::fatal("method fiber lost its frame"))?;
            (receiver, stub)
        };

        for argument in args {
            let value = self.host_value(*argument)?;
            self.heap.fiber_mut(fiber).push(value);
        }

        let previous = self.fiber;
        self.fiber = Some(fiber);
        let run = self.run_interpreter();

        let result = self
            .heap
            .fiber(fiber)
            .stack
            .get(1)
            .copied()
            .unwrap_or(Value::Null);

        // Rewind for the next invocation.
        {
            let f = self.heap.fiber_mut(fiber);
            f.reset(stub);
            f.push(receiver);
        }
        self.fiber = previous;

        run?;
        self.host_new_value(result)
    }

    // === Compile and run ===

    /// Compiles `source` for the named module and returns a fiber handle
    /// that [`Vm::resume_fiber`] can run later.
    pub fn compile_to_fiber(&mut self, module: &str, source: &str) -> VmResult<HostHandle> {
        let fiber = self.load_module_fiber(module, source)?;
        self.host_new_value(Value::Obj(fiber))
    }

    /// Runs a fiber created by [`Vm::compile_to_fiber`].
    pub fn resume_fiber(&mut self, fiber: HostHandle) -> LangResult {
        let Ok(value) = self.host_value(fiber) else {
            return LangResult::CompileError;
        };
        let Some(handle) = value
            .as_obj()
            .filter(|handle| matches!(self.heap.kind(*handle), ObjKind::Fiber(_)))
        else {
            return LangResult::CompileError;
        };

        self.fiber = Some(handle);
        match self.run_interpreter() {
            Ok(()) => LangResult::Success,
            Err(_) => LangResult::RuntimeError,
        }
    }

    // === The foreign-call window ===

    fn foreign_window(&self) -> VmResult<(Handle, usize, usize)> {
        let fiber = self
            .fiber
            .ok_or_else(|| VmError::fatal("no foreign call in progress"))?;
        let f = self.heap.fiber(fiber);
        let base = f
            .foreign_base
            .ok_or_else(|| VmError::fatal("no foreign call in progress"))?;
        Ok((fiber, base, f.foreign_argc))
    }

    /// Number of arguments of the active foreign call, receiver included.
    pub fn argument_count(&self) -> VmResult<usize> {
        self.foreign_window().map(|(_, _, argc)| argc)
    }

    /// Reads argument `index` of the active foreign call (0 is the
    /// receiver).
    pub fn argument(&self, index: usize) -> VmResult<Value> {
        let (fiber, base, argc) = self.foreign_window()?;
        if index >= argc {
            return Err(VmError::runtime(format!(
                "argument index {index} out of range for {argc} arguments"
            )));
        }
        Ok(self.heap.fiber(fiber).stack[base + index])
    }

    /// Reads a numeric argument.
    pub fn argument_number(&self, index: usize) -> VmResult<f64> {
        let value = self.argument(index)?;
        value
            .as_num()
            .ok_or_else(|| VmError::wrong_type("number", self.type_name_of(value)))
    }

    /// Reads a boolean argument; non-booleans read as false.
    pub fn argument_bool(&self, index: usize) -> VmResult<bool> {
        Ok(self.argument(index)?.as_bool().unwrap_or(false))
    }

    /// Reads a string argument as text.
    pub fn argument_string(&self, index: usize) -> VmResult<String> {
        let value = self.argument(index)?;
        match value.as_obj().map(|handle| self.heap.kind(handle)) {
            Some(ObjKind::Str(s)) => Ok(s.to_text()),
            _ => Err(VmError::wrong_type(
                "string".to_string(),
                self.type_name_of(value),
            )),
        }
    }

    /// Returns `value` from the active foreign call. Only one return is
    /// allowed per call.
    pub fn return_value(&mut self, value: Value) -> VmResult<()> {
        let (fiber, base, _) = self.foreign_window()?;
        let f = self.heap.fiber_mut(fiber);
        f.stack[base] = value;
        f.foreign_base = None;
        Ok(())
    }

    /// Returns a number from the active foreign call.
    pub fn return_number(&mut self, value: f64) -> VmResult<()> {
        self.return_value(Value::Num(value))
    }

    /// Returns a boolean from the active foreign call.
    pub fn return_bool(&mut self, value: bool) -> VmResult<()> {
        self.return_value(Value::from_bool(value))
    }

    /// Returns null from the active foreign call.
    pub fn return_null(&mut self) -> VmResult<()> {
        self.return_value(Value::Null)
    }

    /// Returns a string from the active foreign call; the text is copied
    /// into the VM heap.
    pub fn return_string(&mut self, text: &str) -> VmResult<()> {
        let value = self.new_string_value(text);
        self.return_value(value)
    }
}
