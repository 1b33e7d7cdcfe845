//! Tuning constants for the Quill runtime.
//!
//! These are the defaults used when the embedder's configuration leaves a
//! field unset, plus the fixed growth factors and hard limits of the
//! runtime data structures.

/// Number of bytes allocated before the first garbage collection (10 MiB).
pub const DEFAULT_INITIAL_HEAP: usize = 10 * 1024 * 1024;

/// Lower bound for the next-collection threshold (1 MiB).
pub const DEFAULT_MIN_HEAP: usize = 1024 * 1024;

/// Additional heap size after a collection, as a percentage of live bytes.
///
/// The collector schedules the next cycle at
/// `live * (100 + DEFAULT_HEAP_GROWTH_PERCENT) / 100`.
pub const DEFAULT_HEAP_GROWTH_PERCENT: usize = 50;

/// Maximum number of values on a fiber's operand stack.
pub const DEFAULT_MAX_STACK: usize = 1024 * 1024;

/// Maximum number of call frames on a fiber.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 255;

/// Maximum number of objects that can be pinned as temporary GC roots at
/// one time. Pins have stack semantics; overflow is a fatal error.
pub const MAX_TEMP_ROOTS: usize = 10;

/// Initial capacity of a fiber's operand stack, in values.
pub const INITIAL_STACK_CAPACITY: usize = 1024;

/// Initial capacity of a fiber's call-frame stack.
pub const INITIAL_FRAME_CAPACITY: usize = 16;

/// Growth factor for fiber stacks and frame buffers.
pub const STACK_GROW_FACTOR: usize = 2;

/// Growth factor for list storage.
pub const LIST_GROW_FACTOR: usize = 2;

/// Smallest non-empty list capacity.
pub const LIST_MIN_CAPACITY: usize = 16;

/// Maximum load of the open-addressed map before it resizes, in percent.
pub const MAP_LOAD_PERCENT: usize = 75;

/// Smallest non-empty map capacity.
pub const MAP_MIN_CAPACITY: usize = 16;

/// Growth factor for map and table storage.
pub const TABLE_GROW_FACTOR: usize = 2;

/// Smallest table capacity.
pub const TABLE_MIN_CAPACITY: usize = 16;

/// Maximum number of fields a class may have, including inherited ones.
pub const MAX_FIELDS: usize = 255;

/// Maximum number of module-level variables (bounded by the operand width).
pub const MAX_MODULE_VARS: usize = 65535;

/// Maximum number of interned method symbols (bounded by the operand width).
pub const MAX_METHOD_SYMBOLS: usize = 65535;

/// Maximum number of arguments a call instruction can pass, including the
/// receiver.
pub const MAX_CALL_ARGS: usize = 17;
