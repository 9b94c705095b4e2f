//! Host Slot Registration API
//!
//! The embedding host tells the registry which slots exist: plain functions
//! (each registered function is its own slot) and named metamethod slots on
//! host objects. Declaration follows a builder pattern.
//!
//! # Example
//!
//! ```ignore
//! let mut host = registry.host();
//! let print = host.function("print", Behavior::native(|_cx, args| {
//!     Ok(Value::List(args))
//! }))?;
//!
//! let game = host
//!     .object("game")
//!     .metamethod("__namecall", Behavior::native(|cx, _args| {
//!         Ok(Value::String(cx.method_name()?))
//!     }))?
//!     .metamethod("__index", Behavior::native(|_cx, _args| Ok(Value::Nil)))?
//!     .id();
//! ```

use crate::error::HookError;
use crate::identity::{Behavior, CallableId, CallableKind};
use crate::runtime::{CallContext, Registry};
use std::fmt;
use std::sync::Arc;

/// Identifier of a host object that carries metamethod slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl ObjectId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "object#{}", self.0)
    }
}

/// Metamethod used for named method dispatch (`obj:Method(...)`).
pub const NAMECALL: &str = "__namecall";

/// An interception point.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SlotRef {
    /// The function itself: every call to this identity goes through the slot
    Function(CallableId),
    /// A named metamethod on a host object
    Metamethod { object: ObjectId, name: String },
}

impl SlotRef {
    pub fn function(id: CallableId) -> Self {
        SlotRef::Function(id)
    }

    pub fn metamethod(object: ObjectId, name: impl Into<String>) -> Self {
        SlotRef::Metamethod {
            object,
            name: name.into(),
        }
    }

    pub fn namecall(object: ObjectId) -> Self {
        Self::metamethod(object, NAMECALL)
    }
}

impl fmt::Display for SlotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotRef::Function(id) => write!(f, "{}", id),
            SlotRef::Metamethod { object, name } => write!(f, "{}.{}", object, name),
        }
    }
}

// ============================================================================
// Failure reporting
// ============================================================================

/// A failure that escaped a dispatch and reached the host.
#[derive(Debug, Clone)]
pub struct DispatchFailure {
    /// The outermost frame of the failed call
    pub frame: CallContext,
    pub error: HookError,
}

impl fmt::Display for DispatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dispatch through {} (caller {}) failed: {}",
            self.frame.slot, self.frame.caller, self.error
        )
    }
}

/// Handler invoked for every failure that reaches the host.
pub type FailureHandler = Arc<dyn Fn(&DispatchFailure) + Send + Sync>;

/// Default failure handler: log and move on.
pub(crate) fn default_failure_handler(failure: &DispatchFailure) {
    tracing::warn!(
        slot = %failure.frame.slot,
        caller = %failure.frame.caller,
        method = %failure.frame.method,
        "{}",
        failure.error
    );
}

// ============================================================================
// Builders
// ============================================================================

/// Builder for declaring host slots on a [`Registry`].
pub struct HostBuilder<'a> {
    registry: &'a Registry,
}

impl<'a> HostBuilder<'a> {
    pub(crate) fn new(registry: &'a Registry) -> Self {
        Self { registry }
    }

    /// Register a native host function; its identity is also its slot.
    pub fn function(
        &mut self,
        name: &str,
        behavior: impl Into<Behavior>,
    ) -> Result<CallableId, HookError> {
        let identity = self
            .registry
            .identities()
            .register_named(name, behavior, CallableKind::Native)?;
        tracing::debug!(function = name, id = %identity.id(), "declared host function");
        Ok(identity.id())
    }

    /// Start declaring metamethod slots on a new host object.
    pub fn object(&mut self, name: &str) -> ObjectBuilder<'_, 'a> {
        let id = self.registry.create_object(name);
        ObjectBuilder { host: self, id }
    }

    /// Continue declaring slots on an existing object.
    pub fn existing_object(&mut self, id: ObjectId) -> Result<ObjectBuilder<'_, 'a>, HookError> {
        if self.registry.object_name(id).is_none() {
            return Err(HookError::UnknownSlot(SlotRef::namecall(id)));
        }
        Ok(ObjectBuilder { host: self, id })
    }

    /// Register a set of slots supplied by a provider.
    pub fn register_provider<P: HostProvider>(
        &mut self,
        provider: &P,
    ) -> Result<&mut Self, HookError> {
        provider.register(self)?;
        Ok(self)
    }
}

/// Builder for the metamethod slots of one host object.
pub struct ObjectBuilder<'b, 'a> {
    host: &'b mut HostBuilder<'a>,
    id: ObjectId,
}

impl fmt::Debug for ObjectBuilder<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectBuilder").field("id", &self.id).finish_non_exhaustive()
    }
}

impl ObjectBuilder<'_, '_> {
    /// Declare a metamethod slot bound to a native behavior.
    ///
    /// Fails with [`HookError::DuplicateSlot`] if the object already has it.
    pub fn metamethod(
        &mut self,
        name: &str,
        behavior: impl Into<Behavior>,
    ) -> Result<&mut Self, HookError> {
        let registry = self.host.registry;
        let identity = registry
            .identities()
            .register_named(name, behavior, CallableKind::Native)?;
        registry.declare_slot(SlotRef::metamethod(self.id, name), identity)?;
        Ok(self)
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }
}

/// Something that knows how to declare a group of host slots.
pub trait HostProvider {
    fn register(&self, host: &mut HostBuilder<'_>) -> Result<(), HookError>;
}
