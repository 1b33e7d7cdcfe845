//! Heap and garbage collector for the Quill VM.
//!
//! The heap owns every object in a slot vector; a [`Handle`] is a stable
//! index into it. The slot vector doubles as the all-objects list the
//! sweep phase walks. Collection is non-moving, stop-the-world
//! mark-and-sweep: marking restarts the live-byte count from zero and
//! re-counts each reachable object, so freed objects never need their
//! sizes tracked. After a cycle the next threshold is
//! `max(live * scale / 100, min_next_gc)`.
//!
//! Temporary roots keep freshly built objects alive while a multi-step
//! constructor publishes children before the parent is reachable; they
//! are a bounded LIFO pin stack.

use bitflags::bitflags;

use quill_core::constants::MAX_TEMP_ROOTS;

use crate::error::{VmError, VmResult};
use crate::object::{Method, ObjKind, UpvalueState};
use crate::value::{hash_num, Value};

/// A stable reference to a heap object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Handle(u32);

impl Handle {
    /// Slot index of this handle.
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Builds a dangling handle for unit tests of object payloads.
    pub fn for_testing(index: u32) -> Handle {
        Handle(index)
    }
}

bitflags! {
    /// Per-object GC flags.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct GcFlags: u8 {
        /// Set during marking; cleared by the sweep for the next cycle.
        const MARKED = 0b0000_0001;
    }
}

/// A heap slot: the object payload plus its header.
pub struct ObjCell {
    /// The payload.
    pub kind: ObjKind,
    /// The object's class. `None` only during bootstrap, for the handful
    /// of objects created before their metaclasses exist.
    pub class: Option<Handle>,
    flags: GcFlags,
}

/// Collector statistics readable by the embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcStats {
    /// Live bytes as of the last mark phase, plus allocations since.
    pub bytes_allocated: usize,
    /// Byte total that triggers the next collection.
    pub next_gc: usize,
    /// Objects currently allocated.
    pub active: usize,
    /// Objects freed over the heap's lifetime.
    pub destroyed: usize,
    /// Temporary roots currently pinned.
    pub temp_roots: usize,
}

/// The object heap and its collector state.
pub struct Heap {
    slots: Vec<Option<ObjCell>>,
    free: Vec<u32>,

    bytes_allocated: usize,
    next_gc: usize,
    min_next_gc: usize,
    heap_scale_percent: usize,
    is_working: bool,

    temp_roots: Vec<Handle>,

    active: usize,
    destroyed: usize,
}

impl Heap {
    /// Creates a heap that first collects at `initial_heap` bytes.
    pub fn new(initial_heap: usize, min_heap: usize, heap_growth_percent: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            bytes_allocated: 0,
            next_gc: initial_heap,
            min_next_gc: min_heap,
            // The configuration gives the *additional* size relative to
            // in-use memory; the scale is the total relative to in-use.
            heap_scale_percent: 100 + heap_growth_percent,
            is_working: false,
            temp_roots: Vec::new(),
            active: 0,
            destroyed: 0,
        }
    }

    /// Allocates an object, returning its handle.
    pub fn allocate(&mut self, kind: ObjKind, class: Option<Handle>) -> Handle {
        self.bytes_allocated += Self::shallow_size(&kind);

        let cell = ObjCell {
            kind,
            class,
            flags: GcFlags::empty(),
        };

        self.active += 1;
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(cell);
                Handle(index)
            }
            None => {
                self.slots.push(Some(cell));
                Handle((self.slots.len() - 1) as u32)
            }
        }
    }

    /// Records buffer growth performed inside an existing object.
    pub fn add_bytes(&mut self, bytes: usize) {
        self.bytes_allocated += bytes;
    }

    /// Returns true once enough bytes have been allocated to warrant a
    /// collection. Never true while a collection is running.
    pub fn should_collect(&self) -> bool {
        !self.is_working && self.bytes_allocated > self.next_gc
    }

    /// Enables or disables the collector; used to guard re-entrancy.
    pub fn set_working(&mut self, working: bool) {
        self.is_working = working;
    }

    /// Returns true if the handle refers to a live object.
    pub fn is_live(&self, handle: Handle) -> bool {
        self.slots
            .get(handle.index())
            .is_some_and(Option::is_some)
    }

    /// The cell for `handle`. The handle must be live.
    pub fn get(&self, handle: Handle) -> &ObjCell {
        self.slots[handle.index()]
            .as_ref()
            .unwrap_or_else(|| panic!("dangling handle {:?}", handle))
    }

    /// The cell for `handle`, mutable. The handle must be live.
    pub fn get_mut(&mut self, handle: Handle) -> &mut ObjCell {
        self.slots[handle.index()]
            .as_mut()
            .unwrap_or_else(|| panic!("dangling handle {:?}", handle))
    }

    /// The payload kind for `handle`.
    pub fn kind(&self, handle: Handle) -> &ObjKind {
        &self.get(handle).kind
    }

    /// The class of the object behind `handle`, if set.
    pub fn class_of(&self, handle: Handle) -> Option<Handle> {
        self.get(handle).class
    }

    // === Temporary roots ===

    /// Pins `handle` as a GC root until the matching pop.
    pub fn push_temp_root(&mut self, handle: Handle) -> VmResult<()> {
        if self.temp_roots.len() >= MAX_TEMP_ROOTS {
            return Err(VmError::fatal("too many temporary roots"));
        }
        self.temp_roots.push(handle);
        Ok(())
    }

    /// Releases the most recently pinned root.
    pub fn pop_temp_root(&mut self) {
        debug_assert!(!self.temp_roots.is_empty(), "no temporary roots to release");
        self.temp_roots.pop();
    }

    // === Equality and hashing ===

    /// Deep equality: identity, or equal string contents, or equal range
    /// endpoints.
    pub fn values_equal(&self, a: Value, b: Value) -> bool {
        if Value::same(a, b) {
            return true;
        }
        let (Some(a), Some(b)) = (a.as_obj(), b.as_obj()) else {
            return false;
        };
        match (&self.get(a).kind, &self.get(b).kind) {
            (ObjKind::Str(x), ObjKind::Str(y)) => x.equals(y),
            (ObjKind::Range(x), ObjKind::Range(y)) => x.equals(y),
            _ => false,
        }
    }

    /// Hashes a value, or fails for the types that are not hashable.
    pub fn hash_value(&self, value: Value) -> VmResult<u32> {
        match value {
            Value::False => Ok(0),
            Value::Null => Ok(1),
            Value::True => Ok(2),
            Value::Num(n) => Ok(hash_num(n)),
            Value::Obj(handle) => match &self.get(handle).kind {
                ObjKind::Str(s) => Ok(s.hash()),
                ObjKind::Range(r) => Ok(hash_num(r.from) ^ hash_num(r.to)),
                // Classes hash as their name.
                ObjKind::Class(c) => match &self.get(c.name).kind {
                    ObjKind::Str(s) => Ok(s.hash()),
                    _ => Err(VmError::fatal("class name is not a string")),
                },
                kind => Err(VmError::runtime(format!(
                    "a {} is not hashable",
                    kind.type_name()
                ))),
            },
            Value::Undefined => Err(VmError::fatal("hashed the undefined sentinel")),
        }
    }

    // === Collection ===

    /// Runs a full mark-sweep cycle over the given roots. The pinned
    /// temporary roots are always included.
    pub fn collect(&mut self, roots: &[Handle]) {
        if self.is_working {
            return;
        }
        self.is_working = true;

        let before = self.bytes_allocated;

        // Marking re-counts live bytes, so freed objects never need their
        // sizes known.
        self.bytes_allocated = 0;

        let mut work: Vec<Handle> = Vec::with_capacity(roots.len() + self.temp_roots.len());
        work.extend_from_slice(roots);
        work.extend_from_slice(&self.temp_roots);

        while let Some(handle) = work.pop() {
            let Some(cell) = self.slots[handle.index()].as_mut() else {
                continue;
            };
            if cell.flags.contains(GcFlags::MARKED) {
                continue;
            }
            cell.flags.insert(GcFlags::MARKED);

            let cell = self.get(handle);
            let size = Self::shallow_size(&cell.kind);
            Self::push_children(cell, &mut work);
            self.bytes_allocated += size;
        }

        self.sweep();

        self.next_gc = std::cmp::max(
            self.bytes_allocated * self.heap_scale_percent / 100,
            self.min_next_gc,
        );
        self.is_working = false;

        log::debug!(
            "gc: {} bytes before, {} after, next at {}",
            before,
            self.bytes_allocated,
            self.next_gc
        );
    }

    fn sweep(&mut self) {
        let mut dead: Vec<u32> = Vec::new();
        for (index, slot) in self.slots.iter().enumerate() {
            if let Some(cell) = slot {
                if !cell.flags.contains(GcFlags::MARKED) {
                    dead.push(index as u32);
                }
            }
        }

        // Destructors run before anything is freed so a dying instance
        // still sees its class, even when the class dies in the same
        // cycle. They receive only the raw foreign payload.
        for &index in &dead {
            let handle = Handle(index);
            let destructor = {
                let cell = self.get(handle);
                if !matches!(cell.kind, ObjKind::Instance(_)) {
                    continue;
                }
                cell.class.and_then(|class| match &self.get(class).kind {
                    ObjKind::Class(c) => c.destructor.clone(),
                    _ => None,
                })
            };
            let Some(destructor) = destructor else {
                continue;
            };
            if let ObjKind::Instance(instance) = &mut self.get_mut(handle).kind {
                if let Some(payload) = instance.foreign.as_mut() {
                    (*destructor)(payload);
                }
            }
        }

        for &index in &dead {
            self.slots[index as usize] = None;
            self.free.push(index);
            self.active -= 1;
            self.destroyed += 1;
        }

        // Unmark survivors for the next cycle.
        for slot in self.slots.iter_mut().flatten() {
            slot.flags.remove(GcFlags::MARKED);
        }
    }

    fn push_children(cell: &ObjCell, work: &mut Vec<Handle>) {
        let mut push_value = |value: &Value, work: &mut Vec<Handle>| {
            if let Value::Obj(handle) = value {
                work.push(*handle);
            }
        };

        if let Some(class) = cell.class {
            work.push(class);
        }

        match &cell.kind {
            ObjKind::Str(_) | ObjKind::Range(_) => {}
            ObjKind::List(list) => {
                for value in list.elements() {
                    push_value(value, work);
                }
            }
            ObjKind::Map(map) => {
                for entry in map.iter() {
                    push_value(&entry.key, work);
                    push_value(&entry.value, work);
                }
            }
            ObjKind::Table(table) => {
                for entry in table.iter() {
                    push_value(&entry.key, work);
                    push_value(&entry.value, work);
                }
            }
            ObjKind::Fn(func) => {
                for constant in func.constants.iter() {
                    push_value(constant, work);
                }
                work.push(func.module);
            }
            ObjKind::Closure(closure) => {
                work.push(closure.func);
                work.extend_from_slice(&closure.upvalues);
            }
            ObjKind::Upvalue(upvalue) => {
                if let UpvalueState::Closed(value) = &upvalue.state {
                    push_value(value, work);
                }
            }
            ObjKind::Fiber(fiber) => {
                for frame in &fiber.frames {
                    work.push(frame.func);
                }
                for value in &fiber.stack {
                    push_value(value, work);
                }
                work.extend_from_slice(&fiber.open_upvalues);
                if let Some(caller) = fiber.caller {
                    work.push(caller);
                }
                if let Some(error) = fiber.error {
                    work.push(error);
                }
            }
            ObjKind::Class(class) => {
                work.push(class.name);
                work.push(class.superclasses);
                for method in &class.methods {
                    if let Method::Block(handle) = method {
                        work.push(*handle);
                    }
                }
            }
            ObjKind::Instance(instance) => {
                for value in instance.fields.iter() {
                    push_value(value, work);
                }
            }
            ObjKind::Module(module) => {
                for value in &module.variables {
                    push_value(value, work);
                }
                if let Some(name) = module.name {
                    work.push(name);
                }
                if let Some(source) = module.source {
                    work.push(source);
                }
                if let Some(entry) = module.entry {
                    work.push(entry);
                }
            }
        }
    }

    fn shallow_size(kind: &ObjKind) -> usize {
        let payload = match kind {
            ObjKind::Str(s) => s.len(),
            ObjKind::List(l) => l.storage_bytes(),
            ObjKind::Map(m) => m.storage_bytes(),
            ObjKind::Table(t) => t.storage_bytes(),
            ObjKind::Range(_) => 0,
            ObjKind::Fn(f) => f.storage_bytes(),
            ObjKind::Closure(c) => c.upvalues.capacity() * std::mem::size_of::<Handle>(),
            ObjKind::Upvalue(_) => 0,
            ObjKind::Fiber(f) => f.storage_bytes(),
            ObjKind::Class(c) => c.storage_bytes(),
            ObjKind::Instance(i) => i.storage_bytes(),
            ObjKind::Module(m) => m.storage_bytes(),
        };
        std::mem::size_of::<ObjCell>() + payload
    }

    /// Iterates over the handles of all live objects.
    pub fn handles(&self) -> impl Iterator<Item = Handle> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|_| Handle(index as u32)))
    }

    /// Current collector statistics.
    pub fn stats(&self) -> GcStats {
        GcStats {
            bytes_allocated: self.bytes_allocated,
            next_gc: self.next_gc,
            active: self.active,
            destroyed: self.destroyed,
            temp_roots: self.temp_roots.len(),
        }
    }
}

// Typed payload accessors. Handing one a handle of the wrong kind is an
// internal invariant violation, so these panic rather than return errors.
macro_rules! typed_accessors {
    ($name:ident, $name_mut:ident, $variant:ident, $ty:ty) => {
        impl Heap {
            #[doc = concat!("The `", stringify!($variant), "` payload behind `handle`.")]
            pub fn $name(&self, handle: Handle) -> &$ty {
                match &self.get(handle).kind {
                    ObjKind::$variant(payload) => payload,
                    kind => panic!(
                        "expected {} object, found {}",
                        stringify!($variant),
                        kind.type_name()
                    ),
                }
            }

            #[doc = concat!("The `", stringify!($variant), "` payload behind `handle`, mutable.")]
            pub fn $name_mut(&mut self, handle: Handle) -> &mut $ty {
                match &mut self.get_mut(handle).kind {
                    ObjKind::$variant(payload) => payload,
                    kind => panic!(
                        "expected {} object, found {}",
                        stringify!($variant),
                        kind.type_name()
                    ),
                }
            }
        }
    };
}

typed_accessors!(string, string_mut, Str, crate::object::StrObj);
typed_accessors!(list, list_mut, List, crate::object::ListObj);
typed_accessors!(map, map_mut, Map, crate::object::MapObj);
typed_accessors!(table, table_mut, Table, crate::object::TableObj);
typed_accessors!(range, range_mut, Range, crate::object::RangeObj);
typed_accessors!(function, function_mut, Fn, crate::object::FnObj);
typed_accessors!(closure, closure_mut, Closure, crate::object::ClosureObj);
typed_accessors!(upvalue, upvalue_mut, Upvalue, crate::object::UpvalueObj);
typed_accessors!(fiber, fiber_mut, Fiber, crate::object::FiberObj);
typed_accessors!(class, class_mut, Class, crate::object::ClassObj);
typed_accessors!(instance, instance_mut, Instance, crate::object::InstanceObj);
typed_accessors!(module, module_mut, Module, crate::object::ModuleObj);
