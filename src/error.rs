//! Error types for the interception core.

use crate::identity::CallableId;
use crate::runtime::SlotRef;
use thiserror::Error;

/// Errors surfaced by the identity table, hook registry, context tracker
/// and trampoline.
///
/// All of these are local and recoverable: none of them leaves the registry
/// in a partially mutated state.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HookError {
    #[error("invalid behavior: {0}")]
    InvalidBehavior(String),

    #[error("unknown identity: {0}")]
    UnknownIdentity(CallableId),

    #[error("unknown slot: {0}")]
    UnknownSlot(SlotRef),

    #[error("slot already declared: {0}")]
    DuplicateSlot(SlotRef),

    #[error("incompatible capture: hook captures {hook} upvalues, original has {original}")]
    IncompatibleCapture { hook: usize, original: usize },

    #[error("no active call")]
    NoActiveCall,

    #[error("attempt to yield inside interception hook ({0})")]
    BlockingHook(String),

    #[error("stack overflow (call depth {0})")]
    StackOverflow(usize),

    /// A failure raised by a behavior while it ran.
    #[error("{0}")]
    Raised(String),
}

impl HookError {
    /// Convenience for behaviors raising a script-level error.
    pub fn raised(message: impl Into<String>) -> Self {
        HookError::Raised(message.into())
    }
}
