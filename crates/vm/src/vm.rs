//! The virtual machine.
//!
//! [`Vm`] owns the heap, the metatable of built-in classes, the module
//! registry, the VM-wide method-name table, the host-object store and the
//! currently running fiber. Everything the collector treats as a root
//! hangs off this struct.

use quill_core::constants::MAX_METHOD_SYMBOLS;
use quill_core::SymbolTable;

use crate::config::VmConfig;
use crate::error::{LangResult, VmError, VmResult};
use crate::heap::{GcStats, Handle, Heap};
use crate::object::{
    ClassObj, FiberObj, FnObj, InstanceObj, ListObj, MapObj, ObjKind, RangeObj, StrObj, TableObj,
    UpvalueObj,
};
use crate::object::module::DefineOutcome;
use crate::object::ModuleObj;
use crate::value::{format_num, Value};

/// Handles of the built-in classes.
///
/// The module and table classes exist so every heap object has a
/// resolvable class, but neither surfaces as a first-class script type.
pub struct MetaTable {
    /// The root class.
    pub object_class: Handle,
    /// The class of classes (and, transitively, of metaclasses).
    pub class_class: Handle,
    /// Class of true and false.
    pub bool_class: Handle,
    /// Class of numbers.
    pub num_class: Handle,
    /// Class of null.
    pub null_class: Handle,
    /// Class of strings.
    pub string_class: Handle,
    /// Class of lists.
    pub list_class: Handle,
    /// Class of maps.
    pub map_class: Handle,
    /// Class of host-registry tables (runtime-only).
    pub table_class: Handle,
    /// Class of ranges.
    pub range_class: Handle,
    /// Class of functions and closures.
    pub fn_class: Handle,
    /// Class of fibers.
    pub fiber_class: Handle,
    /// Class of modules (runtime-only).
    pub module_class: Handle,
}

/// The host-object store: an integer-keyed table plus a freelist of
/// released keys.
pub struct HostStore {
    /// Table mapping numeric keys to values.
    pub table: Handle,
    /// List of released keys available for reuse.
    pub free_keys: Handle,
    /// Next never-used key.
    pub next_key: u32,
}

/// A Quill virtual machine.
pub struct Vm {
    pub(crate) heap: Heap,
    pub(crate) config: VmConfig,
    pub(crate) metatable: MetaTable,

    /// Map from module-name string (or null for the core module) to the
    /// module object.
    pub(crate) modules: Handle,

    /// VM-wide interned method signatures.
    pub(crate) method_names: SymbolTable,

    /// The fiber currently executing, if any.
    pub(crate) fiber: Option<Handle>,

    pub(crate) host: HostStore,

    /// Root directory string, kept alive for the embedder's loader.
    pub(crate) root_directory: Option<Handle>,

    pub(crate) debug_mode: bool,
}

impl Vm {
    /// Creates a VM from a configuration.
    pub fn new(config: VmConfig) -> Self {
        let mut heap = Heap::new(
            config.initial_heap_size,
            config.min_heap_size,
            config.heap_growth_percent,
        );

        // Collections are off until the roots below exist.
        heap.set_working(true);

        let metatable = Self::bootstrap_classes(&mut heap);

        let modules = heap.allocate(ObjKind::Map(MapObj::new()), Some(metatable.map_class));
        let host_table = heap.allocate(ObjKind::Table(TableObj::new()), Some(metatable.table_class));
        let host_free = heap.allocate(ObjKind::List(ListObj::new()), Some(metatable.list_class));

        let mut vm = Self {
            heap,
            metatable,
            modules,
            method_names: SymbolTable::new(MAX_METHOD_SYMBOLS),
            fiber: None,
            host: HostStore {
                table: host_table,
                free_keys: host_free,
                next_key: 0,
            },
            root_directory: None,
            debug_mode: false,
            config,
        };

        vm.install_core_module();
        vm.patch_bootstrap_classes();

        if let Some(path) = vm.config.root_directory.clone() {
            let path = vm.heap.allocate(
                ObjKind::Str(StrObj::new(&path)),
                Some(vm.metatable.string_class),
            );
            vm.root_directory = Some(path);
        }

        vm.heap.set_working(false);
        vm
    }

    /// Builds Object, Class and the built-in type classes.
    ///
    /// Object and Class are special: Object has no superclass, and Class
    /// is its own metaclass. Everything else goes through the ordinary
    /// class construction path once those two exist.
    fn bootstrap_classes(heap: &mut Heap) -> MetaTable {
        let raw_class = |heap: &mut Heap, name: &str| -> Handle {
            let name = heap.allocate(ObjKind::Str(StrObj::new(name)), None);
            let supers = heap.allocate(ObjKind::List(ListObj::new()), None);
            heap.allocate(ObjKind::Class(ClassObj::bare(name, 0, supers)), None)
        };

        let object_class = raw_class(heap, "Object");
        let class_class = raw_class(heap, "Class");

        heap.get_mut(object_class).class = Some(class_class);
        heap.get_mut(class_class).class = Some(class_class);
        crate::class_binding::inherit(heap, class_class, object_class);

        // The remaining built-ins get a metaclass and Object as their
        // superclass, exactly like user classes.
        let mut builtin = |heap: &mut Heap, name: &str| -> Handle {
            let meta_name = heap.allocate(
                ObjKind::Str(StrObj::new(&format!("{name} metaclass"))),
                None,
            );
            let meta_supers = heap.allocate(ObjKind::List(ListObj::new()), None);
            let metaclass = heap.allocate(
                ObjKind::Class(ClassObj::bare(meta_name, 0, meta_supers)),
                Some(class_class),
            );
            crate::class_binding::inherit(heap, metaclass, class_class);

            let class = raw_class(heap, name);
            heap.get_mut(class).class = Some(metaclass);
            crate::class_binding::inherit(heap, class, object_class);
            class
        };

        MetaTable {
            bool_class: builtin(heap, "Bool"),
            num_class: builtin(heap, "Num"),
            null_class: builtin(heap, "Null"),
            string_class: builtin(heap, "String"),
            list_class: builtin(heap, "List"),
            map_class: builtin(heap, "Map"),
            table_class: builtin(heap, "Table"),
            range_class: builtin(heap, "Range"),
            fn_class: builtin(heap, "Fn"),
            fiber_class: builtin(heap, "Fiber"),
            module_class: builtin(heap, "Module"),
            object_class,
            class_class,
        }
    }

    /// Creates the core module, publishes the built-in classes as its
    /// variables and binds their primitive methods.
    fn install_core_module(&mut self) {
        let core = self
            .heap
            .allocate(ObjKind::Module(ModuleObj::new()), Some(self.metatable.module_class));
        self.heap
            .map_set(self.modules, Value::Null, Value::Obj(core))
            .expect("core module registration");

        crate::core_lib::install(self, core);
    }

    /// Strings and lists allocated during bootstrap predate their
    /// classes; give every classless object its class now.
    fn patch_bootstrap_classes(&mut self) {
        let metatable = &self.metatable;
        let fixes: Vec<(Handle, Handle)> = self
            .heap
            .handles()
            .filter(|handle| self.heap.class_of(*handle).is_none())
            .map(|handle| {
                let class = match self.heap.kind(handle) {
                    ObjKind::Str(_) => metatable.string_class,
                    ObjKind::List(_) => metatable.list_class,
                    ObjKind::Map(_) => metatable.map_class,
                    ObjKind::Table(_) => metatable.table_class,
                    ObjKind::Range(_) => metatable.range_class,
                    ObjKind::Fn(_) | ObjKind::Closure(_) => metatable.fn_class,
                    ObjKind::Fiber(_) => metatable.fiber_class,
                    ObjKind::Module(_) => metatable.module_class,
                    ObjKind::Class(_) => metatable.class_class,
                    _ => metatable.object_class,
                };
                (handle, class)
            })
            .collect();

        for (handle, class) in fixes {
            self.heap.get_mut(handle).class = Some(class);
        }
    }

    // === Accessors ===

    /// The heap.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// The heap, mutable.
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// The built-in class handles.
    pub fn metatable(&self) -> &MetaTable {
        &self.metatable
    }

    /// The currently executing fiber.
    pub fn fiber(&self) -> Option<Handle> {
        self.fiber
    }

    /// Replaces the currently executing fiber. Setting `None` cancels
    /// execution at the interpreter's next check.
    pub fn set_fiber(&mut self, fiber: Option<Handle>) {
        self.fiber = fiber;
    }

    /// Turns debug mode on or off.
    pub fn set_debug_mode(&mut self, enabled: bool) {
        self.debug_mode = enabled;
    }

    /// Returns true while debug mode is on.
    pub fn debug_mode(&self) -> bool {
        self.debug_mode
    }

    /// Collector statistics.
    pub fn gc_stats(&self) -> GcStats {
        self.heap.stats()
    }

    /// Enables or disables the collector.
    pub fn enable_gc(&mut self, enabled: bool) {
        self.heap.set_working(!enabled);
    }

    /// Writes `text` to the configured print sink.
    pub fn print(&self, text: &str) {
        (*self.config.print)(text);
    }

    // === Garbage collection ===

    /// Runs a full collection over the VM's root set.
    pub fn collect_garbage(&mut self) {
        let mut roots: Vec<Handle> = vec![
            self.modules,
            self.host.table,
            self.host.free_keys,
            self.metatable.object_class,
            self.metatable.class_class,
            self.metatable.bool_class,
            self.metatable.num_class,
            self.metatable.null_class,
            self.metatable.string_class,
            self.metatable.list_class,
            self.metatable.map_class,
            self.metatable.table_class,
            self.metatable.range_class,
            self.metatable.fn_class,
            self.metatable.fiber_class,
            self.metatable.module_class,
        ];
        if let Some(directory) = self.root_directory {
            roots.push(directory);
        }
        if let Some(fiber) = self.fiber {
            roots.push(fiber);
        }
        self.heap.collect(&roots);
    }

    /// Allocates an object, collecting first when the threshold has been
    /// crossed (or on every allocation under GC stress).
    pub(crate) fn alloc(&mut self, kind: ObjKind, class: Option<Handle>) -> Handle {
        if self.config.gc_stress || self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.allocate(kind, class)
    }

    /// Pins a temporary GC root.
    pub fn push_root(&mut self, handle: Handle) -> VmResult<()> {
        self.heap.push_temp_root(handle)
    }

    /// Releases the most recent temporary root.
    pub fn pop_root(&mut self) {
        self.heap.pop_temp_root();
    }

    // === Allocation helpers ===

    /// Allocates a string object.
    pub fn new_string(&mut self, text: &str) -> Handle {
        let class = self.metatable.string_class;
        self.alloc(ObjKind::Str(StrObj::new(text)), Some(class))
    }

    /// Allocates a string object from raw bytes.
    pub fn new_string_from_bytes(&mut self, bytes: Vec<u8>) -> Handle {
        let class = self.metatable.string_class;
        self.alloc(ObjKind::Str(StrObj::from_bytes(bytes)), Some(class))
    }

    /// Allocates a string and returns it as a value.
    pub fn new_string_value(&mut self, text: &str) -> Value {
        Value::Obj(self.new_string(text))
    }

    /// Allocates an empty list.
    pub fn new_list(&mut self) -> Handle {
        let class = self.metatable.list_class;
        self.alloc(ObjKind::List(ListObj::new()), Some(class))
    }

    /// Allocates a list from elements.
    pub fn new_list_from(&mut self, elements: Vec<Value>) -> Handle {
        let class = self.metatable.list_class;
        self.alloc(ObjKind::List(ListObj::from_elements(elements)), Some(class))
    }

    /// Allocates an empty map.
    pub fn new_map(&mut self) -> Handle {
        let class = self.metatable.map_class;
        self.alloc(ObjKind::Map(MapObj::new()), Some(class))
    }

    /// Allocates a range.
    pub fn new_range(&mut self, from: f64, to: f64, is_inclusive: bool) -> Value {
        let class = self.metatable.range_class;
        Value::Obj(self.alloc(
            ObjKind::Range(RangeObj::new(from, to, is_inclusive)),
            Some(class),
        ))
    }

    /// Allocates a function object.
    pub fn new_function(&mut self, func: FnObj) -> Handle {
        let class = self.metatable.fn_class;
        self.alloc(ObjKind::Fn(func), Some(class))
    }

    /// Allocates an open upvalue over `slot`.
    pub fn new_upvalue(&mut self, slot: usize) -> Handle {
        let class = self.metatable.fn_class;
        self.alloc(ObjKind::Upvalue(UpvalueObj::open(slot)), Some(class))
    }

    /// Allocates a fiber ready to execute `func` (a function or closure).
    pub fn new_fiber(&mut self, func: Handle) -> Handle {
        let class = self.metatable.fiber_class;
        self.alloc(ObjKind::Fiber(FiberObj::new(func)), Some(class))
    }

    /// Allocates an instance of `class`, fields null and any foreign
    /// payload zeroed.
    pub fn new_instance(&mut self, class: Handle) -> Handle {
        let (num_fields, foreign_size) = {
            let c = self.heap.class(class);
            (c.num_fields, c.foreign_byte_size)
        };
        let instance = if foreign_size > 0 {
            InstanceObj::with_foreign(num_fields, foreign_size)
        } else {
            InstanceObj::new(num_fields)
        };
        self.alloc(ObjKind::Instance(instance), Some(class))
    }

    /// Allocates an empty module object.
    pub fn new_module(&mut self) -> Handle {
        let class = self.metatable.module_class;
        self.alloc(ObjKind::Module(ModuleObj::new()), Some(class))
    }

    // === Classes of values ===

    /// The class of `value`.
    pub fn class_of_value(&self, value: Value) -> Handle {
        match value {
            Value::Num(_) => self.metatable.num_class,
            Value::Null => self.metatable.null_class,
            Value::True | Value::False => self.metatable.bool_class,
            Value::Obj(handle) => self
                .heap
                .class_of(handle)
                .unwrap_or_else(|| panic!("object {handle:?} has no class")),
            Value::Undefined => panic!("took the class of the undefined sentinel"),
        }
    }

    /// The class name of `value`, for diagnostics.
    pub fn type_name_of(&self, value: Value) -> String {
        let class = self.class_of_value(value);
        let name = self.heap.class(class).name;
        self.heap.string(name).to_text()
    }

    // === Method symbols ===

    /// Interns a method signature, returning its VM-wide symbol.
    pub fn ensure_method_symbol(&mut self, signature: &str) -> VmResult<usize> {
        Ok(self.method_names.ensure(signature)?)
    }

    /// Looks up an already interned signature.
    pub fn find_method_symbol(&self, signature: &str) -> Option<usize> {
        self.method_names.find(signature)
    }

    /// The signature for `symbol`, if interned.
    pub fn method_signature(&self, symbol: usize) -> Option<&str> {
        self.method_names.name(symbol)
    }

    // === Modules ===

    /// The core module.
    pub fn core_module(&self) -> Handle {
        match self.heap.map_get(self.modules, Value::Null) {
            Ok(Some(Value::Obj(handle))) => handle,
            _ => panic!("core module missing from registry"),
        }
    }

    /// Looks up a loaded module by its name value (null for core).
    pub fn lookup_module(&self, name: Value) -> Option<Handle> {
        match self.heap.map_get(self.modules, name) {
            Ok(Some(Value::Obj(handle))) => Some(handle),
            _ => None,
        }
    }

    /// Looks up a loaded module by name.
    pub fn lookup_module_named(&self, name: &str) -> Option<Handle> {
        let target = StrObj::new(name);
        let modules = self.heap.map(self.modules);
        for entry in modules.iter() {
            let Value::Obj(key) = entry.key else { continue };
            if let ObjKind::Str(key) = self.heap.kind(key) {
                if key.equals(&target) {
                    if let Value::Obj(module) = entry.value {
                        return Some(module);
                    }
                }
            }
        }
        None
    }

    /// Registers `module` under `name`, replacing any existing entry.
    pub fn save_module(&mut self, module: Handle, name: Value) -> VmResult<()> {
        if let Value::Obj(name_handle) = name {
            self.heap.module_mut(module).name = Some(name_handle);
        }
        self.heap.map_set(self.modules, name, Value::Obj(module))
    }

    /// Creates a module pre-populated with the core module's variables,
    /// so every module implicitly sees the core.
    pub fn ready_new_module(&mut self) -> VmResult<Handle> {
        let module = self.new_module();
        self.push_root(module)?;

        let core = self.core_module();
        let count = self.heap.module(core).len();
        for index in 0..count {
            let (name, value) = {
                let core = self.heap.module(core);
                let name = core
                    .variable_names
                    .name(index)
                    .unwrap_or_default()
                    .to_string();
                (name, core.variables[index])
            };
            self.heap.module_mut(module).define(&name, value);
        }

        self.pop_root();
        Ok(module)
    }

    /// Reads the module-level variable `name` from the core module.
    pub fn find_variable(&self, name: &str) -> Option<Value> {
        self.heap.module(self.core_module()).find_variable(name)
    }

    /// Defines a module-level variable, surfacing duplicate and overflow
    /// outcomes as errors.
    pub fn define_variable(
        &mut self,
        module: Handle,
        name: &str,
        value: Value,
    ) -> VmResult<usize> {
        let module_name = self.module_display_name(module);
        match self.heap.module_mut(module).define(name, value) {
            DefineOutcome::Defined(symbol) => Ok(symbol),
            DefineOutcome::AlreadyDefined => Err(VmError::runtime(format!(
                "variable '{name}' is already defined in module '{module_name}'"
            ))),
            DefineOutcome::TooManyVariables => Err(VmError::TooManyVariables {
                module: module_name,
            }),
        }
    }

    /// The printable name of a module (core has none).
    pub fn module_display_name(&self, module: Handle) -> String {
        match self.heap.module(module).name {
            Some(name) => self.heap.string(name).to_text(),
            None => "core".to_string(),
        }
    }

    // === Running code ===

    /// Compiles and runs `source` as the body of the named module.
    pub fn interpret(&mut self, module_name: &str, source: &str) -> LangResult {
        let fiber = match self.load_module_fiber(module_name, source) {
            Ok(fiber) => fiber,
            Err(_) => return LangResult::CompileError,
        };

        self.fiber = Some(fiber);
        match self.run_interpreter() {
            Ok(()) => LangResult::Success,
            Err(_) => LangResult::RuntimeError,
        }
    }

    /// Compiles `source` into a module registered under `name` and
    /// returns a fiber ready to run its body.
    pub fn load_module_fiber(&mut self, name: &str, source: &str) -> VmResult<Handle> {
        let compiler = self
            .config
            .compiler
            .clone()
            .ok_or_else(|| VmError::compile(name, "no compiler configured"))?;

        let name_value = self.new_string_value(name);
        if let Value::Obj(handle) = name_value {
            self.push_root(handle)?;
        }

        let module = match self.lookup_module(name_value) {
            Some(module) => module,
            None => {
                let module = self.ready_new_module()?;
                self.push_root(module)?;
                self.save_module(module, name_value)?;
                self.pop_root();
                module
            }
        };

        let result = (|| {
            let func = (*compiler)(self, module, name, source)
                .ok_or_else(|| VmError::compile(name.to_string(), "compile failed".to_string()))?;
            self.heap.module_mut(module).entry = Some(func);
            let source_handle = self.new_string(source);
            self.heap.module_mut(module).source = Some(source_handle);
            Ok(self.new_fiber(func))
        })();

        if name_value.is_obj() {
            self.pop_root();
        }
        result
    }

    /// Formats a value for printing and traces.
    pub fn value_to_display(&self, value: Value) -> String {
        match value {
            Value::Null => "null".to_string(),
            Value::True => "true".to_string(),
            Value::False => "false".to_string(),
            Value::Undefined => "undefined".to_string(),
            Value::Num(n) => format_num(n),
            Value::Obj(handle) => match self.heap.kind(handle) {
                ObjKind::Str(s) => s.to_text(),
                ObjKind::Range(r) => format!(
                    "{}{}{}",
                    format_num(r.from),
                    if r.is_inclusive { ".." } else { "..." },
                    format_num(r.to)
                ),
                ObjKind::List(list) => {
                    let items: Vec<String> = list
                        .elements()
                        .iter()
                        .map(|element| self.value_to_display(*element))
                        .collect();
                    format!("[{}]", items.join(", "))
                }
                ObjKind::Map(_) => "[map]".to_string(),
                ObjKind::Table(_) => "[table]".to_string(),
                ObjKind::Fn(_) | ObjKind::Closure(_) => "[fn]".to_string(),
                ObjKind::Upvalue(_) => "[upvalue]".to_string(),
                ObjKind::Fiber(_) => "[fiber]".to_string(),
                ObjKind::Class(class) => self.heap.string(class.name).to_text(),
                ObjKind::Instance(_) => {
                    format!("instance of {}", self.type_name_of(value))
                }
                ObjKind::Module(_) => {
                    format!("[module {}]", self.module_display_name(handle))
                }
            },
        }
    }

    /// Creates an `Exception` instance carrying `message`. The trace
    /// field is filled in at raise time.
    pub fn exception_with_message(&mut self, message: Handle) -> VmResult<Handle> {
        let class = self
            .find_variable("Exception")
            .and_then(|value| value.as_obj())
            .filter(|handle| matches!(self.heap.kind(*handle), ObjKind::Class(_)))
            .ok_or_else(|| VmError::fatal("Exception class missing from core"))?;

        self.push_root(message)?;
        let instance = self.new_instance(class);
        self.pop_root();

        let fields = &mut self.heap.instance_mut(instance).fields;
        if let Some(first) = fields.first_mut() {
            *first = Value::Obj(message);
        }
        if let Some(second) = fields.get_mut(1) {
            *second = Value::Null;
        }
        Ok(instance)
    }

    /// Creates an `Exception` instance from message text.
    pub fn exception_from_text(&mut self, message: &str) -> VmResult<Handle> {
        let message = self.new_string(message);
        self.exception_with_message(message)
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new(VmConfig::default())
    }
}
