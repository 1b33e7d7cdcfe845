//! VM configuration.
//!
//! The embedder hands a [`VmConfig`] to [`crate::vm::Vm::new`]; every
//! field is optional with a documented default. The VM copies nothing out
//! of band: the callbacks are shared closures invoked from the single
//! interpreter thread.

use std::rc::Rc;

use quill_core::constants::{
    DEFAULT_HEAP_GROWTH_PERCENT, DEFAULT_INITIAL_HEAP, DEFAULT_MAX_CALL_DEPTH, DEFAULT_MAX_STACK,
    DEFAULT_MIN_HEAP,
};

use crate::heap::Handle;
use crate::vm::Vm;

/// Sink for script output (`System.print` and friends).
pub type PrintFn = Rc<dyn Fn(&str)>;

/// Resolves a module name to its source text, or `None` if the module
/// cannot be found (which the importer reports as a runtime error).
pub type ModuleLoaderFn = Rc<dyn Fn(&str) -> Option<String>>;

/// The external-compiler seam: compiles `source` for the given module and
/// returns the module body function, or `None` on a compile error.
///
/// The compiler may allocate through the VM; anything it needs kept alive
/// across its own allocations goes through the temporary-root pins.
pub type CompileFn = Rc<dyn Fn(&mut Vm, Handle, &str, &str) -> Option<Handle>>;

/// Invoked at every `Break` instruction while debug mode is on. Clearing
/// the active fiber from the hook cancels execution.
pub type DebugHookFn = Rc<dyn Fn(&mut Vm)>;

/// Construction-time configuration for a VM.
#[derive(Clone)]
pub struct VmConfig {
    /// Where script output goes. Defaults to stdout.
    pub print: PrintFn,

    /// Loads module source for imports. Without one, every import of an
    /// unloaded module fails at runtime.
    pub module_loader: Option<ModuleLoaderFn>,

    /// Compiles module source. Without one, running source is a compile
    /// error; precompiled functions can still be executed.
    pub compiler: Option<CompileFn>,

    /// Debugger hook for `Break` instructions.
    pub debug_hook: Option<DebugHookFn>,

    /// Bytes allocated before the first collection.
    pub initial_heap_size: usize,

    /// Lower bound for the recomputed collection threshold.
    pub min_heap_size: usize,

    /// Additional heap headroom after a collection, as a percentage of
    /// live bytes.
    pub heap_growth_percent: usize,

    /// Root directory exposed to the embedder's loader, if any.
    pub root_directory: Option<String>,

    /// Maximum operand-stack height per fiber.
    pub max_stack: usize,

    /// Maximum call-frame depth per fiber.
    pub max_call_depth: usize,

    /// Collect before every allocation. For shaking out missing pins in
    /// tests; far too slow for production use.
    pub gc_stress: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            print: Rc::new(|text| print!("{text}")),
            module_loader: None,
            compiler: None,
            debug_hook: None,
            initial_heap_size: DEFAULT_INITIAL_HEAP,
            min_heap_size: DEFAULT_MIN_HEAP,
            heap_growth_percent: DEFAULT_HEAP_GROWTH_PERCENT,
            root_directory: None,
            max_stack: DEFAULT_MAX_STACK,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            gc_stress: false,
        }
    }
}

impl VmConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the print sink.
    pub fn with_print(mut self, print: PrintFn) -> Self {
        self.print = print;
        self
    }

    /// Sets the module loader.
    pub fn with_module_loader(mut self, loader: ModuleLoaderFn) -> Self {
        self.module_loader = Some(loader);
        self
    }

    /// Sets the compiler callback.
    pub fn with_compiler(mut self, compiler: CompileFn) -> Self {
        self.compiler = Some(compiler);
        self
    }

    /// Sets the debugger hook.
    pub fn with_debug_hook(mut self, hook: DebugHookFn) -> Self {
        self.debug_hook = Some(hook);
        self
    }

    /// Sets the heap tuning parameters.
    pub fn with_heap(mut self, initial: usize, min: usize, growth_percent: usize) -> Self {
        self.initial_heap_size = initial;
        self.min_heap_size = min;
        self.heap_growth_percent = growth_percent;
        self
    }

    /// Sets the root directory.
    pub fn with_root_directory<S: Into<String>>(mut self, path: S) -> Self {
        self.root_directory = Some(path.into());
        self
    }

    /// Sets the stack and call-depth maxima.
    pub fn with_limits(mut self, max_stack: usize, max_call_depth: usize) -> Self {
        self.max_stack = max_stack;
        self.max_call_depth = max_call_depth;
        self
    }

    /// Enables collect-on-every-allocation.
    pub fn with_gc_stress(mut self) -> Self {
        self.gc_stress = true;
        self
    }
}
