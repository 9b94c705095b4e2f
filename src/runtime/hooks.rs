//! Hook Registry
//!
//! Every slot resolves to exactly one active identity: the most recently
//! installed hook, or the slot's base behavior when nothing is installed.
//! Installs nest in strict LIFO order; each binding remembers the identity it
//! displaced, so uninstalling walks back down the chain.
//!
//! # Example
//!
//! ```ignore
//! // local old; old = hookfunction(print, function(...) return old(...) end)
//! let old = Upvalue::default();
//! let accessor = registry.install(
//!     &SlotRef::function(print),
//!     Behavior::closure(vec![old.clone()], |cx, upvalues, args| {
//!         cx.call_value(&upvalues[0].get(), args)
//!     }),
//! )?;
//! old.set(accessor.id());
//! ```
//!
//! A hook that calls its own slot instead of the accessor recurses until the
//! trampoline's depth limit stops it.
//!
//! Removing a binding (`uninstall`, `restore`) also removes its hook and
//! accessor identities from the table. Frames already running them keep
//! their own `Arc`; new calls through the accessor id fail with
//! `UnknownIdentity`.

use super::{Registry, SlotRef};
use crate::error::HookError;
use crate::identity::{Behavior, CallableIdentity, CallableKind};
use std::collections::HashMap;
use std::sync::Arc;

/// One active interception.
#[derive(Debug)]
pub struct HookBinding {
    pub slot: SlotRef,
    /// The identity installed in the slot
    pub hook: Arc<CallableIdentity>,
    /// The identity the hook displaced
    pub original: Arc<CallableIdentity>,
    /// Identity returned to the installer; runs `original`'s behavior
    /// without going through the slot
    pub accessor: Arc<CallableIdentity>,
    /// Monotonic install sequence number
    pub installed_at: u64,
}

/// A slot's base identity plus its bindings, oldest first.
#[derive(Debug, Clone)]
pub(crate) struct SlotChain {
    base: Arc<CallableIdentity>,
    bindings: Vec<Arc<HookBinding>>,
}

impl SlotChain {
    fn new(base: Arc<CallableIdentity>) -> Self {
        Self {
            base,
            bindings: Vec::new(),
        }
    }

    fn active(&self) -> &Arc<CallableIdentity> {
        self.bindings
            .last()
            .map(|binding| &binding.hook)
            .unwrap_or(&self.base)
    }
}

pub(crate) type SlotMap = HashMap<SlotRef, SlotChain>;

/// Result of resolving a slot for dispatch.
pub(crate) struct Resolved {
    pub identity: Arc<CallableIdentity>,
    pub hooked: bool,
}

impl Registry {
    /// Declare a slot with its base identity.
    pub(crate) fn declare_slot(
        &self,
        slot: SlotRef,
        base: Arc<CallableIdentity>,
    ) -> Result<(), HookError> {
        let _guard = self.write_lock.lock();
        let current = self.slots.load_full();
        if current.contains_key(&slot) {
            return Err(HookError::DuplicateSlot(slot));
        }
        let mut next = (*current).clone();
        tracing::debug!(slot = %slot, base = %base.id(), "declared slot");
        next.insert(slot, SlotChain::new(base));
        self.slots.store(Arc::new(next));
        Ok(())
    }

    pub(crate) fn resolve_dispatch(&self, slot: &SlotRef) -> Result<Resolved, HookError> {
        let snapshot = self.slots.load();
        if let Some(chain) = snapshot.get(slot) {
            return Ok(Resolved {
                identity: chain.active().clone(),
                hooked: !chain.bindings.is_empty(),
            });
        }
        match slot {
            SlotRef::Function(id) => Ok(Resolved {
                identity: self.identities.get(*id)?,
                hooked: false,
            }),
            SlotRef::Metamethod { .. } => Err(HookError::UnknownSlot(slot.clone())),
        }
    }

    /// The identity a call through `slot` runs right now.
    pub fn resolve_active(&self, slot: &SlotRef) -> Result<Arc<CallableIdentity>, HookError> {
        Ok(self.resolve_dispatch(slot)?.identity)
    }

    /// Install `hook` on `slot` and return the original accessor.
    ///
    /// The hook's kind follows its behavior (native body or managed closure).
    /// If the identity being displaced is managed, the hook may not capture
    /// more upvalues than it does. A failed install changes nothing.
    pub fn install(
        &self,
        slot: &SlotRef,
        hook: impl Into<Behavior>,
    ) -> Result<Arc<CallableIdentity>, HookError> {
        let behavior = self.identities.resolve_behavior(hook.into())?;
        let kind = behavior.natural_kind();

        let _guard = self.write_lock.lock();
        let current = self.slots.load_full();
        let original = match current.get(slot) {
            Some(chain) => chain.active().clone(),
            None => match slot {
                SlotRef::Function(id) => self.identities.get(*id)?,
                SlotRef::Metamethod { .. } => return Err(HookError::UnknownSlot(slot.clone())),
            },
        };

        let captures = match kind {
            CallableKind::Native => 0,
            CallableKind::Managed => behavior.capture_count(),
        };
        if self.config.enforce_capture_check
            && original.kind() == CallableKind::Managed
            && captures > original.upvalue_count()
        {
            return Err(HookError::IncompatibleCapture {
                hook: captures,
                original: original.upvalue_count(),
            });
        }

        let hook = self.identities.register(behavior, kind)?;
        let accessor = self.identities.derive_accessor(&original);
        let binding = Arc::new(HookBinding {
            slot: slot.clone(),
            hook: hook.clone(),
            original: original.clone(),
            accessor: accessor.clone(),
            installed_at: self.next_sequence(),
        });

        let mut next = (*current).clone();
        next.entry(slot.clone())
            .or_insert_with(|| SlotChain::new(original.clone()))
            .bindings
            .push(binding);
        self.slots.store(Arc::new(next));

        tracing::debug!(
            slot = %slot,
            hook = %hook.id(),
            original = %original.id(),
            accessor = %accessor.id(),
            "installed hook"
        );
        Ok(accessor)
    }

    /// Remove the most recent binding on `slot`. Does nothing if the slot has
    /// no hooks or is unknown.
    pub fn uninstall(&self, slot: &SlotRef) -> Option<Arc<HookBinding>> {
        let _guard = self.write_lock.lock();
        let current = self.slots.load_full();
        if current.get(slot).map_or(true, |chain| chain.bindings.is_empty()) {
            return None;
        }

        let mut next = (*current).clone();
        let chain = next.get_mut(slot)?;
        let removed = chain.bindings.pop();
        if chain.bindings.is_empty() && matches!(slot, SlotRef::Function(_)) {
            next.remove(slot);
        }
        self.slots.store(Arc::new(next));

        if let Some(binding) = &removed {
            self.release(binding);
            tracing::debug!(slot = %slot, hook = %binding.hook.id(), "uninstalled hook");
        }
        removed
    }

    /// `restorefunction`: remove every binding on `slot`, newest first.
    pub fn restore(&self, slot: &SlotRef) -> Vec<Arc<HookBinding>> {
        let _guard = self.write_lock.lock();
        let current = self.slots.load_full();
        let Some(chain) = current.get(slot) else {
            return Vec::new();
        };
        if chain.bindings.is_empty() {
            return Vec::new();
        }

        let mut removed = chain.bindings.clone();
        removed.reverse();

        let mut next = (*current).clone();
        match slot {
            SlotRef::Function(_) => {
                next.remove(slot);
            }
            SlotRef::Metamethod { .. } => {
                if let Some(chain) = next.get_mut(slot) {
                    chain.bindings.clear();
                }
            }
        }
        self.slots.store(Arc::new(next));

        for binding in &removed {
            self.release(binding);
        }
        tracing::debug!(slot = %slot, removed = removed.len(), "restored slot");
        removed
    }

    /// Drop a removed binding's hook and accessor from the identity table.
    fn release(&self, binding: &HookBinding) {
        self.identities.remove(binding.hook.id());
        self.identities.remove(binding.accessor.id());
    }

    /// The active binding on `slot`, if any.
    pub fn binding(&self, slot: &SlotRef) -> Option<Arc<HookBinding>> {
        self.slots
            .load()
            .get(slot)
            .and_then(|chain| chain.bindings.last().cloned())
    }

    /// Every binding on `slot`, oldest first.
    pub fn chain(&self, slot: &SlotRef) -> Vec<Arc<HookBinding>> {
        self.slots
            .load()
            .get(slot)
            .map(|chain| chain.bindings.clone())
            .unwrap_or_default()
    }

    /// `isfunctionhooked`
    pub fn is_hooked(&self, slot: &SlotRef) -> bool {
        self.slots
            .load()
            .get(slot)
            .is_some_and(|chain| !chain.bindings.is_empty())
    }

    /// Declared metamethod slots plus every currently hooked function, sorted.
    pub fn slots(&self) -> Vec<SlotRef> {
        let mut slots: Vec<SlotRef> = self.slots.load().keys().cloned().collect();
        slots.sort();
        slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Upvalue;
    use crate::value::Value;

    fn constant(v: i64) -> Behavior {
        Behavior::native(move |_cx, _args| Ok(Value::S64(v)))
    }

    #[test]
    fn install_on_unknown_metamethod_fails() {
        let registry = Registry::with_defaults();
        let object = registry.host().object("game").id();
        let err = registry
            .install(&SlotRef::metamethod(object, "__index"), constant(1))
            .expect_err("slot was never declared");
        assert!(matches!(err, HookError::UnknownSlot(_)));
    }

    #[test]
    fn install_rejects_non_callable_hook() {
        let registry = Registry::with_defaults();
        let f = registry.host().function("f", constant(1)).expect("declare");
        let err = registry
            .install(&SlotRef::function(f), Value::String("nope".into()))
            .expect_err("string is not callable");
        assert!(matches!(err, HookError::InvalidBehavior(_)));
        assert!(!registry.is_hooked(&SlotRef::function(f)));
    }

    #[test]
    fn capture_check_ignores_native_originals() {
        let registry = Registry::with_defaults();
        let f = registry.host().function("f", constant(1)).expect("declare");
        let hook = Behavior::closure(vec![Upvalue::default(), Upvalue::default()], |_, _, _| {
            Ok(Value::Nil)
        });
        assert!(registry.install(&SlotRef::function(f), hook).is_ok());
    }

    #[test]
    fn capture_check_can_be_disabled() {
        let config = crate::config::RegistryConfig {
            enforce_capture_check: false,
            ..Default::default()
        };
        let registry = Registry::new(config);
        let managed = registry
            .register(Behavior::closure(vec![], |_, _, _| Ok(Value::Nil)), CallableKind::Managed)
            .expect("register");
        let hook = Behavior::closure(vec![Upvalue::default()], |_, _, _| Ok(Value::Nil));
        assert!(registry.install(&SlotRef::function(managed.id()), hook).is_ok());
    }

    #[test]
    fn sequence_numbers_increase() {
        let registry = Registry::with_defaults();
        let f = registry.host().function("f", constant(1)).expect("declare");
        let slot = SlotRef::function(f);
        registry.install(&slot, constant(2)).expect("first");
        registry.install(&slot, constant(3)).expect("second");
        let chain = registry.chain(&slot);
        assert_eq!(chain.len(), 2);
        assert!(chain[0].installed_at < chain[1].installed_at);
        assert_eq!(chain[1].original, chain[0].hook);
    }

    #[test]
    fn restore_clears_function_slot_entirely() {
        let registry = Registry::with_defaults();
        let f = registry.host().function("f", constant(1)).expect("declare");
        let slot = SlotRef::function(f);
        registry.install(&slot, constant(2)).expect("first");
        registry.install(&slot, constant(3)).expect("second");

        let removed = registry.restore(&slot);
        assert_eq!(removed.len(), 2);
        assert!(removed[0].installed_at > removed[1].installed_at);
        assert!(registry.slots().is_empty());
        assert_eq!(registry.resolve_active(&slot).expect("resolve").id(), f);
    }

    #[test]
    fn removed_bindings_free_their_identities() {
        let registry = Registry::with_defaults();
        let f = registry.host().function("f", constant(1)).expect("declare");
        let slot = SlotRef::function(f);
        let baseline = registry.identities().len();

        for i in 0..100 {
            registry.install(&slot, constant(i)).expect("install");
            registry.uninstall(&slot).expect("binding present");
        }
        assert_eq!(registry.identities().len(), baseline);

        for i in 0..10 {
            registry.install(&slot, constant(i)).expect("install");
        }
        assert_eq!(registry.restore(&slot).len(), 10);
        assert_eq!(registry.identities().len(), baseline);
        assert!(registry.identities().contains(f));
    }

    #[test]
    fn uninstall_invalidates_only_the_removed_accessor() {
        let registry = Registry::with_defaults();
        let f = registry.host().function("f", constant(1)).expect("declare");
        let slot = SlotRef::function(f);
        let first = registry.install(&slot, constant(2)).expect("first");
        let second = registry.install(&slot, constant(3)).expect("second");

        let removed = registry.uninstall(&slot).expect("binding present");
        assert_eq!(removed.accessor, second);
        assert!(!registry.identities().contains(second.id()));
        assert!(!registry.identities().contains(removed.hook.id()));
        assert!(registry.identities().contains(first.id()));
    }
}
