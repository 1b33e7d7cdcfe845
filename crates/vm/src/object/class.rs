//! Class objects and method slots.
//!
//! A class stores a dense method array indexed by the VM-wide method
//! symbol; absent entries are [`Method::None`]. Static methods live on the
//! metaclass, so constructors (which are static) dispatch exactly like
//! instance methods. The multiple-inheritance binding rules that fill
//! these arrays live in [`crate::class_binding`].

use std::rc::Rc;

use crate::heap::Handle;
use crate::value::Value;
use crate::vm::Vm;

/// Destructor for instances of host-defined classes. Receives the raw
/// foreign payload at sweep time; the signature keeps it from re-entering
/// the VM or allocating.
pub type DestructorFn = Rc<dyn Fn(&mut [u8])>;

/// A built-in method. Operates on the argument window in place and tells
/// the interpreter how to continue.
pub type PrimitiveFn = fn(&mut Vm, fiber: Handle, base: usize, argc: usize) -> PrimResult;

/// A foreign method provided by the embedder.
pub type ForeignFn = Rc<dyn Fn(&mut Vm)>;

/// How the interpreter continues after a primitive returns.
pub enum PrimResult {
    /// Replace the argument window with this single result.
    Value(Value),
    /// The window's first slot now holds a function object; invoke it with
    /// the given window width.
    Call { args: usize },
    /// Transfer execution to a fiber; `None` means the program finished.
    RunFiber(Option<Handle>),
    /// Raise the given error value.
    Error(Value),
    /// Continue without touching the stack.
    None,
}

/// One slot of a class's method array.
#[derive(Clone, Default)]
pub enum Method {
    /// No method bound for this symbol.
    #[default]
    None,
    /// A built-in.
    Primitive(PrimitiveFn),
    /// An embedder-provided function.
    Foreign(ForeignFn),
    /// A compiled method body (function or closure).
    Block(Handle),
}

impl Method {
    /// Returns true for a bound method.
    pub fn is_bound(&self) -> bool {
        !matches!(self, Method::None)
    }
}

/// A class.
pub struct ClassObj {
    /// The class name.
    pub name: Handle,
    /// Total number of fields, including inherited ones.
    pub num_fields: usize,
    /// Field offset accumulated from grafted superclasses; methods copied
    /// in from a superclass had their field indexes shifted by the value
    /// this had at graft time.
    pub parent_field_offset: usize,
    /// List of superclasses in declaration order (a list object, so the
    /// super-index walk and the collector both see it).
    pub superclasses: Handle,
    /// Dense method array indexed by method symbol.
    pub methods: Vec<Method>,
    /// Destructor for host-defined instances.
    pub destructor: Option<DestructorFn>,
    /// Byte size of the foreign payload for host-defined classes.
    pub foreign_byte_size: usize,
}

impl ClassObj {
    /// Creates a raw class with no superclasses or methods.
    pub fn bare(name: Handle, num_fields: usize, superclasses: Handle) -> Self {
        Self {
            name,
            num_fields,
            parent_field_offset: 0,
            superclasses,
            methods: Vec::new(),
            destructor: None,
            foreign_byte_size: 0,
        }
    }

    /// The method bound for `symbol`, if any.
    pub fn method(&self, symbol: usize) -> &Method {
        self.methods.get(symbol).unwrap_or(&Method::None)
    }

    /// Binds `method` for `symbol`, extending the array with empty slots
    /// as needed.
    pub fn bind_method(&mut self, symbol: usize, method: Method) {
        if symbol >= self.methods.len() {
            self.methods.resize_with(symbol + 1, Method::default);
        }
        self.methods[symbol] = method;
    }

    /// Unbinds the method for `symbol`.
    pub fn remove_method(&mut self, symbol: usize) {
        if symbol < self.methods.len() {
            self.methods[symbol] = Method::None;
        }
    }

    /// Approximate heap footprint of the method array, in bytes.
    pub fn storage_bytes(&self) -> usize {
        self.methods.capacity() * std::mem::size_of::<Method>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_array_grows_sparsely() {
        let name = Handle::for_testing(0);
        let supers = Handle::for_testing(1);
        let mut class = ClassObj::bare(name, 0, supers);

        assert!(!class.method(5).is_bound());

        class.bind_method(5, Method::Block(Handle::for_testing(2)));
        assert_eq!(class.methods.len(), 6);
        assert!(class.method(5).is_bound());
        assert!(!class.method(0).is_bound());
        assert!(!class.method(100).is_bound());

        class.remove_method(5);
        assert!(!class.method(5).is_bound());
    }
}
