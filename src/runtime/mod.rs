//! Interception Runtime
//!
//! Holds the process-wide [`Registry`]: every known callable identity, every
//! declared slot with its chain of hook bindings, and the observers and
//! failure handler consulted by the trampoline.
//!
//! # Synchronization
//!
//! Slot chains live in an immutable snapshot behind an `ArcSwap`, and so does
//! the identity table. Dispatch resolves slots (and unhooked functions) from
//! the current snapshots without taking a lock. Every slot mutation
//! (`install`, `uninstall`, `restore`, slot declaration, `teardown`) takes the
//! single mutation lock, builds the next snapshot and publishes it in one
//! store, so a concurrent dispatch sees either the old chain or the new one,
//! never a half-applied change. Identity inserts and removals serialize on the
//! table's own lock, always taken after the slot lock.

mod context;
mod hooks;
mod host;
mod interceptor;
mod trampoline;

pub use context::{CallContext, CallerIdentity, ContextStack};
pub use hooks::HookBinding;
pub use host::{
    DispatchFailure, FailureHandler, HostBuilder, HostProvider, ObjectBuilder, ObjectId, SlotRef,
    NAMECALL,
};
pub use interceptor::{DispatchObserver, DispatchRecord, RecordingObserver};
pub use trampoline::{CallCx, ExecThread};

use crate::config::RegistryConfig;
use crate::error::HookError;
use crate::identity::{Behavior, CallableId, CallableIdentity, CallableKind, IdentityTable};
use arc_swap::ArcSwap;
use hooks::SlotMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Process-wide interception state.
///
/// Construct one with [`Registry::new`], share it through the returned `Arc`,
/// and create one [`ExecThread`] per thread of execution.
pub struct Registry {
    config: RegistryConfig,
    identities: IdentityTable,
    slots: ArcSwap<SlotMap>,
    write_lock: Mutex<()>,
    sequence: AtomicU64,
    objects: RwLock<HashMap<ObjectId, String>>,
    next_object: AtomicU64,
    observers: RwLock<Vec<Arc<dyn DispatchObserver>>>,
    failure_handler: RwLock<Option<FailureHandler>>,
}

impl Registry {
    pub fn new(config: RegistryConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            identities: IdentityTable::new(),
            slots: ArcSwap::from_pointee(SlotMap::new()),
            write_lock: Mutex::new(()),
            sequence: AtomicU64::new(1),
            objects: RwLock::new(HashMap::new()),
            next_object: AtomicU64::new(1),
            observers: RwLock::new(Vec::new()),
            failure_handler: RwLock::new(None),
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(RegistryConfig::default())
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Declare host functions, objects and metamethod slots.
    pub fn host(&self) -> HostBuilder<'_> {
        HostBuilder::new(self)
    }

    /// A new execution thread with an empty context stack.
    pub fn thread(self: &Arc<Self>) -> ExecThread {
        ExecThread::new(self.clone())
    }

    pub fn identities(&self) -> &IdentityTable {
        &self.identities
    }

    // ------------------------------------------------------------------------
    // Function identity facade
    // ------------------------------------------------------------------------

    pub fn register(
        &self,
        behavior: impl Into<Behavior>,
        kind: CallableKind,
    ) -> Result<Arc<CallableIdentity>, HookError> {
        self.identities.register(behavior, kind)
    }

    pub fn register_named(
        &self,
        name: impl Into<String>,
        behavior: impl Into<Behavior>,
        kind: CallableKind,
    ) -> Result<Arc<CallableIdentity>, HookError> {
        self.identities.register_named(name, behavior, kind)
    }

    /// `clonefunction`: a distinct managed identity with the same behavior.
    pub fn clone_function(&self, id: CallableId) -> Result<Arc<CallableIdentity>, HookError> {
        self.identities.clone_callable(id)
    }

    /// `newcclosure`: a native wrapper that calls `id`.
    pub fn wrap_native(&self, id: CallableId) -> Result<Arc<CallableIdentity>, HookError> {
        self.identities.wrap_native(id)
    }

    pub fn kind_of(&self, id: CallableId) -> Result<CallableKind, HookError> {
        self.identities.kind_of(id)
    }

    /// `iscclosure`
    pub fn is_native(&self, id: CallableId) -> Result<bool, HookError> {
        Ok(self.kind_of(id)? == CallableKind::Native)
    }

    /// `islclosure`
    pub fn is_managed(&self, id: CallableId) -> Result<bool, HookError> {
        Ok(self.kind_of(id)? == CallableKind::Managed)
    }

    pub fn identity(&self, id: CallableId) -> Result<Arc<CallableIdentity>, HookError> {
        self.identities.get(id)
    }

    // ------------------------------------------------------------------------
    // Host objects
    // ------------------------------------------------------------------------

    pub(crate) fn create_object(&self, name: &str) -> ObjectId {
        let id = ObjectId::from_raw(self.next_object.fetch_add(1, Ordering::Relaxed));
        self.objects.write().insert(id, name.to_string());
        id
    }

    pub fn object_name(&self, id: ObjectId) -> Option<String> {
        self.objects.read().get(&id).cloned()
    }

    /// Look up a host object by name. Names are not required to be unique;
    /// the lowest id wins.
    pub fn find_object(&self, name: &str) -> Option<ObjectId> {
        self.objects
            .read()
            .iter()
            .filter(|(_, n)| n.as_str() == name)
            .map(|(id, _)| *id)
            .min()
    }

    // ------------------------------------------------------------------------
    // Observers and failure reporting
    // ------------------------------------------------------------------------

    pub fn add_observer(&self, observer: Arc<dyn DispatchObserver>) {
        self.observers.write().push(observer);
    }

    pub fn clear_observers(&self) {
        self.observers.write().clear();
    }

    pub(crate) fn observers(&self) -> Vec<Arc<dyn DispatchObserver>> {
        self.observers.read().clone()
    }

    /// Set the handler called for failures that reach the host.
    ///
    /// # Example
    ///
    /// ```ignore
    /// registry.on_failure(|failure| {
    ///     tracing::error!("hook failure: {}", failure);
    /// });
    /// ```
    pub fn on_failure<F>(&self, handler: F)
    where
        F: Fn(&DispatchFailure) + Send + Sync + 'static,
    {
        *self.failure_handler.write() = Some(Arc::new(handler));
    }

    pub(crate) fn report_failure(&self, frame: &CallContext, error: &HookError) {
        let failure = DispatchFailure {
            frame: frame.clone(),
            error: error.clone(),
        };
        let handler = self.failure_handler.read().clone();
        match handler {
            Some(handler) => handler(&failure),
            None => host::default_failure_handler(&failure),
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Forget every slot, binding, identity and object.
    ///
    /// Execution threads created before teardown stay usable but every id
    /// they hold is unknown afterwards.
    pub fn teardown(&self) {
        let _guard = self.write_lock.lock();
        self.slots.store(Arc::new(SlotMap::new()));
        self.identities.clear();
        self.objects.write().clear();
        tracing::debug!("registry torn down");
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }
}
