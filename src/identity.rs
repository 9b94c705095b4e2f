//! Function Identity Table
//!
//! Every callable the core knows about has a [`CallableIdentity`]: a stable id,
//! a kind (native host function or managed script closure), the number of
//! upvalues it captures, and the behavior it runs.
//!
//! # Example
//!
//! ```ignore
//! let table = IdentityTable::new();
//! let print = table.register_named("print", Behavior::native(|_cx, args| {
//!     Ok(Value::List(args))
//! }), CallableKind::Native)?;
//!
//! let copy = table.clone_callable(print.id())?;
//! assert_ne!(copy.id(), print.id());
//! assert_eq!(copy.kind(), CallableKind::Managed);
//! ```

use crate::error::HookError;
use crate::runtime::CallCx;
use crate::value::Value;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Stable identifier of a registered callable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallableId(u64);

impl CallableId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "function#{}", self.0)
    }
}

/// Whether a callable is a host function or a script closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallableKind {
    Native,
    Managed,
}

impl CallableKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallableKind::Native => "native",
            CallableKind::Managed => "managed",
        }
    }
}

impl fmt::Display for CallableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host function body.
pub type NativeFn = Arc<dyn Fn(&CallCx<'_>, Vec<Value>) -> Result<Value, HookError> + Send + Sync>;

/// Closure body; receives the closure's captured upvalue cells.
pub type ClosureFn =
    Arc<dyn Fn(&CallCx<'_>, &[Upvalue], Vec<Value>) -> Result<Value, HookError> + Send + Sync>;

/// A captured variable cell.
///
/// Cloning an `Upvalue` yields another handle to the same cell.
#[derive(Clone, Default)]
pub struct Upvalue(Arc<Mutex<Value>>);

impl Upvalue {
    pub fn new(value: impl Into<Value>) -> Self {
        Self(Arc::new(Mutex::new(value.into())))
    }

    pub fn get(&self) -> Value {
        self.0.lock().clone()
    }

    pub fn set(&self, value: impl Into<Value>) {
        *self.0.lock() = value.into();
    }

    /// True if both handles refer to the same cell.
    pub fn ptr_eq(&self, other: &Upvalue) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Upvalue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Upvalue").field(&*self.0.lock()).finish()
    }
}

/// What a callable does when invoked.
///
/// `Value` is what a script hands over when it passes an arbitrary value where
/// a function is expected. Only `Value::Function` references are invocable;
/// registering anything else fails with [`HookError::InvalidBehavior`].
#[derive(Clone)]
pub enum Behavior {
    Native(NativeFn),
    Closure { body: ClosureFn, upvalues: Vec<Upvalue> },
    Value(Value),
}

impl Behavior {
    pub fn native<F>(f: F) -> Self
    where
        F: Fn(&CallCx<'_>, Vec<Value>) -> Result<Value, HookError> + Send + Sync + 'static,
    {
        Behavior::Native(Arc::new(f))
    }

    pub fn closure<F>(upvalues: Vec<Upvalue>, f: F) -> Self
    where
        F: Fn(&CallCx<'_>, &[Upvalue], Vec<Value>) -> Result<Value, HookError>
            + Send
            + Sync
            + 'static,
    {
        Behavior::Closure {
            body: Arc::new(f),
            upvalues,
        }
    }

    /// Number of external cells this behavior captures.
    pub fn capture_count(&self) -> usize {
        match self {
            Behavior::Closure { upvalues, .. } => upvalues.len(),
            Behavior::Native(_) | Behavior::Value(_) => 0,
        }
    }

    /// Kind a behavior gets when the caller does not choose one.
    pub fn natural_kind(&self) -> CallableKind {
        match self {
            Behavior::Native(_) => CallableKind::Native,
            Behavior::Closure { .. } | Behavior::Value(_) => CallableKind::Managed,
        }
    }

    pub(crate) fn invoke(&self, cx: &CallCx<'_>, args: Vec<Value>) -> Result<Value, HookError> {
        match self {
            Behavior::Native(f) => f(cx, args),
            Behavior::Closure { body, upvalues } => body(cx, upvalues, args),
            Behavior::Value(v) => Err(HookError::raised(format!(
                "attempt to call a {} value",
                v.type_name()
            ))),
        }
    }
}

impl fmt::Debug for Behavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Behavior::Native(_) => f.write_str("Native(..)"),
            Behavior::Closure { upvalues, .. } => f
                .debug_struct("Closure")
                .field("upvalues", &upvalues.len())
                .finish(),
            Behavior::Value(v) => f.debug_tuple("Value").field(v).finish(),
        }
    }
}

impl From<Value> for Behavior {
    fn from(v: Value) -> Self {
        Behavior::Value(v)
    }
}

/// One distinguishable callable unit.
///
/// Identities compare by id: a clone behaves the same but is never equal.
pub struct CallableIdentity {
    id: CallableId,
    kind: CallableKind,
    name: Option<String>,
    upvalue_count: usize,
    behavior: Behavior,
}

impl CallableIdentity {
    pub fn id(&self) -> CallableId {
        self.id
    }

    pub fn kind(&self) -> CallableKind {
        self.kind
    }

    /// Debug name; also the method name recorded for calls through this
    /// function's slot.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn upvalue_count(&self) -> usize {
        self.upvalue_count
    }

    pub fn is_native(&self) -> bool {
        self.kind == CallableKind::Native
    }

    pub fn is_managed(&self) -> bool {
        self.kind == CallableKind::Managed
    }

    pub(crate) fn behavior(&self) -> &Behavior {
        &self.behavior
    }

    pub(crate) fn invoke(&self, cx: &CallCx<'_>, args: Vec<Value>) -> Result<Value, HookError> {
        self.behavior.invoke(cx, args)
    }
}

impl PartialEq for CallableIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for CallableIdentity {}

impl fmt::Debug for CallableIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallableIdentity")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("upvalue_count", &self.upvalue_count)
            .finish()
    }
}

type IdentityMap = HashMap<CallableId, Arc<CallableIdentity>>;

/// Table of every callable identity, keyed by id.
///
/// Lookups read an immutable snapshot without locking; inserts and removals
/// serialize on `write_lock` and publish a new snapshot.
///
/// Ids come from a monotonic counter and are never reused, even after
/// [`IdentityTable::remove`] or [`IdentityTable::clear`].
pub struct IdentityTable {
    next_id: AtomicU64,
    entries: ArcSwap<IdentityMap>,
    write_lock: Mutex<()>,
}

impl IdentityTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: ArcSwap::from_pointee(IdentityMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Register an anonymous callable.
    pub fn register(
        &self,
        behavior: impl Into<Behavior>,
        kind: CallableKind,
    ) -> Result<Arc<CallableIdentity>, HookError> {
        self.register_inner(None, behavior.into(), kind)
    }

    /// Register a callable with a debug name.
    pub fn register_named(
        &self,
        name: impl Into<String>,
        behavior: impl Into<Behavior>,
        kind: CallableKind,
    ) -> Result<Arc<CallableIdentity>, HookError> {
        self.register_inner(Some(name.into()), behavior.into(), kind)
    }

    fn register_inner(
        &self,
        name: Option<String>,
        behavior: Behavior,
        kind: CallableKind,
    ) -> Result<Arc<CallableIdentity>, HookError> {
        let behavior = self.resolve_behavior(behavior)?;
        let upvalue_count = match kind {
            CallableKind::Native => 0,
            CallableKind::Managed => behavior.capture_count(),
        };
        Ok(self.insert(name, behavior, kind, upvalue_count))
    }

    /// Turn a behavior into something invocable.
    ///
    /// A function reference adopts the referenced identity's behavior; any
    /// other plain value is rejected.
    pub fn resolve_behavior(&self, behavior: Behavior) -> Result<Behavior, HookError> {
        match behavior {
            Behavior::Value(Value::Function(id)) => Ok(self.get(id)?.behavior.clone()),
            Behavior::Value(other) => Err(HookError::InvalidBehavior(format!(
                "{} value is not callable",
                other.type_name()
            ))),
            invocable => Ok(invocable),
        }
    }

    /// Produce a new managed identity that behaves like `id`.
    ///
    /// The clone shares the original's upvalue cells and nothing else.
    pub fn clone_callable(&self, id: CallableId) -> Result<Arc<CallableIdentity>, HookError> {
        let original = self.get(id)?;
        let upvalue_count = original.behavior.capture_count();
        Ok(self.insert(
            original.name.clone(),
            original.behavior.clone(),
            CallableKind::Managed,
            upvalue_count,
        ))
    }

    /// Fresh identity that runs `original`'s behavior directly.
    ///
    /// Unlike a clone it keeps the original's kind and capture count, so it can
    /// stand in for the original wherever the original could be used.
    pub(crate) fn derive_accessor(&self, original: &CallableIdentity) -> Arc<CallableIdentity> {
        self.insert(
            original.name.clone(),
            original.behavior.clone(),
            original.kind,
            original.upvalue_count,
        )
    }

    /// Wrap `id` in a native identity that forwards calls to it.
    ///
    /// The wrapper calls `id` through the trampoline, so hooks installed on
    /// `id` later still apply to calls made through the wrapper.
    pub fn wrap_native(&self, id: CallableId) -> Result<Arc<CallableIdentity>, HookError> {
        let target = self.get(id)?;
        let behavior = Behavior::native(move |cx, args| cx.call(id, args));
        Ok(self.insert(target.name.clone(), behavior, CallableKind::Native, 0))
    }

    pub fn kind_of(&self, id: CallableId) -> Result<CallableKind, HookError> {
        Ok(self.get(id)?.kind)
    }

    pub fn get(&self, id: CallableId) -> Result<Arc<CallableIdentity>, HookError> {
        self.entries
            .load()
            .get(&id)
            .cloned()
            .ok_or(HookError::UnknownIdentity(id))
    }

    pub fn contains(&self, id: CallableId) -> bool {
        self.entries.load().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }

    /// Forget one identity. Holders of its `Arc` (running frames) keep it
    /// alive, but new lookups of `id` fail.
    pub fn remove(&self, id: CallableId) -> Option<Arc<CallableIdentity>> {
        let _guard = self.write_lock.lock();
        let current = self.entries.load_full();
        if !current.contains_key(&id) {
            return None;
        }
        let mut next = (*current).clone();
        let removed = next.remove(&id);
        self.entries.store(Arc::new(next));
        removed
    }

    /// Drop every identity. Ids handed out before stay unknown afterwards.
    pub fn clear(&self) {
        let _guard = self.write_lock.lock();
        self.entries.store(Arc::new(IdentityMap::new()));
    }

    fn insert(
        &self,
        name: Option<String>,
        behavior: Behavior,
        kind: CallableKind,
        upvalue_count: usize,
    ) -> Arc<CallableIdentity> {
        let id = CallableId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let identity = Arc::new(CallableIdentity {
            id,
            kind,
            name,
            upvalue_count,
            behavior,
        });
        let _guard = self.write_lock.lock();
        let mut next = (*self.entries.load_full()).clone();
        next.insert(id, identity.clone());
        self.entries.store(Arc::new(next));
        identity
    }
}

impl Default for IdentityTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Behavior {
        Behavior::native(|_cx, _args| Ok(Value::Nil))
    }

    #[test]
    fn register_assigns_distinct_ids() {
        let table = IdentityTable::new();
        let a = table.register(noop(), CallableKind::Native).expect("register");
        let b = table.register(noop(), CallableKind::Native).expect("register");
        assert_ne!(a.id(), b.id());
        assert_eq!(table.len(), 2);
        assert_eq!(table.kind_of(a.id()), Ok(CallableKind::Native));
    }

    #[test]
    fn register_rejects_non_function_values() {
        let table = IdentityTable::new();
        let err = table
            .register(Value::S64(3), CallableKind::Managed)
            .expect_err("numbers are not callable");
        assert!(matches!(err, HookError::InvalidBehavior(_)));
        assert!(table.is_empty());
    }

    #[test]
    fn register_accepts_function_reference() {
        let table = IdentityTable::new();
        let target = table
            .register(
                Behavior::closure(vec![Upvalue::new(1)], |_, _, _| Ok(Value::Nil)),
                CallableKind::Managed,
            )
            .expect("register");
        let alias = table
            .register(Value::Function(target.id()), CallableKind::Managed)
            .expect("function references are callable");
        assert_ne!(alias.id(), target.id());
        assert_eq!(alias.upvalue_count(), 1);
    }

    #[test]
    fn native_identities_capture_nothing() {
        let table = IdentityTable::new();
        let closure = Behavior::closure(vec![Upvalue::new(1), Upvalue::new(2)], |_, _, _| {
            Ok(Value::Nil)
        });
        let native = table.register(closure, CallableKind::Native).expect("register");
        assert_eq!(native.upvalue_count(), 0);
    }

    #[test]
    fn kind_of_unknown_id_fails() {
        let table = IdentityTable::new();
        let missing = CallableId::from_raw(99);
        assert_eq!(table.kind_of(missing), Err(HookError::UnknownIdentity(missing)));
    }

    #[test]
    fn clone_is_managed_and_shares_cells() {
        let table = IdentityTable::new();
        let cell = Upvalue::new(0);
        let original = table
            .register_named(
                "counter",
                Behavior::closure(vec![cell.clone()], |_, _, _| Ok(Value::Nil)),
                CallableKind::Managed,
            )
            .expect("register");

        let copy = table.clone_callable(original.id()).expect("clone");
        assert_ne!(copy, original);
        assert_eq!(copy.kind(), CallableKind::Managed);
        assert_eq!(copy.name(), Some("counter"));
        assert_eq!(copy.upvalue_count(), 1);

        match copy.behavior() {
            Behavior::Closure { upvalues, .. } => assert!(upvalues[0].ptr_eq(&cell)),
            other => panic!("unexpected behavior: {other:?}"),
        }
    }

    #[test]
    fn remove_forgets_one_identity() {
        let table = IdentityTable::new();
        let keep = table.register(noop(), CallableKind::Native).expect("register");
        let gone = table.register(noop(), CallableKind::Native).expect("register");

        let removed = table.remove(gone.id()).expect("present");
        assert_eq!(removed, gone);
        assert_eq!(table.get(gone.id()), Err(HookError::UnknownIdentity(gone.id())));
        assert!(table.contains(keep.id()));
        assert!(table.remove(gone.id()).is_none());
    }

    #[test]
    fn clear_forgets_identities_but_not_the_counter() {
        let table = IdentityTable::new();
        let before = table.register(noop(), CallableKind::Native).expect("register");
        table.clear();
        assert!(!table.contains(before.id()));
        let after = table.register(noop(), CallableKind::Native).expect("register");
        assert!(after.id() > before.id());
    }
}
