//! Error types for the Quill VM crate.
//!
//! Script-level errors travel through fibers as `Exception` instances and
//! are only surfaced here once nothing catches them. The variants below
//! therefore describe the embedder-visible failures: source that did not
//! compile, a runtime error that escaped every fiber, and fatal conditions
//! that stop the VM outright.

use thiserror::Error;

/// VM errors surfaced to the embedder.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    /// Source was rejected before any fiber ran.
    #[error("Compile error in module '{module}': {message}")]
    Compile { module: String, message: String },

    /// A runtime error escaped every fiber; the trace has been reported.
    #[error("Runtime error: {message}")]
    Runtime { message: String },

    /// An unrecoverable condition: stack or call-depth overflow, pin-stack
    /// overflow, or an internal invariant violation. Never catchable.
    #[error("Fatal error: {message}")]
    Fatal { message: String },

    /// A named module is not in the registry.
    #[error("Unknown module: '{module}'")]
    UnknownModule { module: String },

    /// A module-level variable is not defined.
    #[error("Unknown variable '{name}' in module '{module}'")]
    UnknownVariable { module: String, name: String },

    /// A module ran out of variable slots.
    #[error("Too many variables in module '{module}'")]
    TooManyVariables { module: String },

    /// A host handle does not resolve to a live value.
    #[error("Invalid host handle")]
    InvalidHandle,

    /// A handle or argument held a value of the wrong type.
    #[error("Type error: expected {expected}, got {actual}")]
    WrongType { expected: String, actual: String },
}

impl VmError {
    /// Create a new compile error.
    pub fn compile<S: Into<String>>(module: S, message: S) -> Self {
        Self::Compile {
            module: module.into(),
            message: message.into(),
        }
    }

    /// Create a new runtime error.
    pub fn runtime<S: Into<String>>(message: S) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }

    /// Create a new fatal error.
    pub fn fatal<S: Into<String>>(message: S) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// Create a new unknown-module error.
    pub fn unknown_module<S: Into<String>>(module: S) -> Self {
        Self::UnknownModule {
            module: module.into(),
        }
    }

    /// Create a new unknown-variable error.
    pub fn unknown_variable<S: Into<String>>(module: S, name: S) -> Self {
        Self::UnknownVariable {
            module: module.into(),
            name: name.into(),
        }
    }

    /// Create a new wrong-type error.
    pub fn wrong_type<E: Into<String>, A: Into<String>>(expected: E, actual: A) -> Self {
        Self::WrongType {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Returns true if this error can never be caught by a fiber.
    pub fn is_fatal(&self) -> bool {
        matches!(self, VmError::Fatal { .. })
    }
}

impl From<quill_core::CoreError> for VmError {
    fn from(error: quill_core::CoreError) -> Self {
        VmError::runtime(error.to_string())
    }
}

/// Result type for VM operations.
pub type VmResult<T> = std::result::Result<T, VmError>;

/// Overall outcome of running a script, as reported to the embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LangResult {
    /// The script compiled and ran to completion.
    Success,
    /// The script was rejected by the compiler.
    CompileError,
    /// The script raised an error no fiber caught.
    RuntimeError,
}
