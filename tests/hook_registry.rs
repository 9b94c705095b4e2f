//! Hook registry tests
//!
//! Install/uninstall ordering, original accessors, capture compatibility and
//! concurrent mutation against lock-free resolution.

use interpose::{
    Behavior, CallableKind, CallerIdentity, HookError, Registry, SlotRef, Upvalue, Value,
};
use std::sync::Arc;
use std::thread;

fn constant(v: i64) -> Behavior {
    Behavior::native(move |_cx, _args| Ok(Value::S64(v)))
}

/// A managed hook that calls the accessor stored in its upvalue and tags the
/// result, like `old = hookfunction(f, function(...) return tag, old(...) end)`.
fn tagging_hook(tag: &'static str) -> (Behavior, Upvalue) {
    let old = Upvalue::default();
    let behavior = Behavior::closure(vec![old.clone()], move |cx, upvalues, args| {
        let inner = cx.call_value(&upvalues[0].get(), args)?;
        Ok(Value::List(vec![Value::from(tag), inner]))
    });
    (behavior, old)
}

#[test]
fn install_round_trip_restores_original() {
    let registry = Registry::with_defaults();
    let f = registry.host().function("f", constant(1)).expect("declare");
    let slot = SlotRef::function(f);

    let before = registry.resolve_active(&slot).expect("resolve");
    registry.install(&slot, constant(2)).expect("install");

    let binding = registry.binding(&slot).expect("binding present");
    assert_eq!(binding.original, before);
    assert_eq!(registry.resolve_active(&slot).expect("resolve"), binding.hook);

    let removed = registry.uninstall(&slot).expect("binding removed");
    assert_eq!(removed.hook, binding.hook);
    assert_eq!(registry.resolve_active(&slot).expect("resolve"), before);
    assert!(!registry.is_hooked(&slot));
}

#[test]
fn accessor_bypasses_the_new_hook() {
    let registry = Registry::with_defaults();
    let f = registry.host().function("f", constant(1)).expect("declare");
    let slot = SlotRef::function(f);

    let accessor = registry.install(&slot, constant(2)).expect("install");
    assert_ne!(accessor.id(), f);
    assert_eq!(accessor.kind(), CallableKind::Native);

    let thread = registry.thread();
    assert_eq!(
        thread.call(CallerIdentity::Controller, f, vec![]),
        Ok(Value::S64(2))
    );
    assert_eq!(
        thread.call(CallerIdentity::Controller, accessor.id(), vec![]),
        Ok(Value::S64(1))
    );
}

#[test]
fn chained_hooks_nest_lifo() {
    let registry = Registry::with_defaults();
    let f = registry.host().function("f", constant(0)).expect("declare");
    let slot = SlotRef::function(f);
    let thread = registry.thread();

    let (h1, old1) = tagging_hook("h1");
    let acc1 = registry.install(&slot, h1).expect("install h1");
    old1.set(acc1.id());
    let h1_identity = registry.resolve_active(&slot).expect("resolve");

    let (h2, old2) = tagging_hook("h2");
    let acc2 = registry.install(&slot, h2).expect("install h2");
    old2.set(acc2.id());

    assert_ne!(registry.resolve_active(&slot).expect("resolve"), h1_identity);
    assert_eq!(registry.chain(&slot).len(), 2);

    // h2 -> h1 -> original
    let nested = Value::List(vec![
        Value::from("h2"),
        Value::List(vec![Value::from("h1"), Value::S64(0)]),
    ]);
    assert_eq!(thread.call(CallerIdentity::Controller, f, vec![]), Ok(nested));

    // h2's accessor dispatches to h1
    assert_eq!(
        thread.call(CallerIdentity::Controller, acc2.id(), vec![]),
        Ok(Value::List(vec![Value::from("h1"), Value::S64(0)]))
    );

    registry.uninstall(&slot).expect("remove h2");
    assert_eq!(registry.resolve_active(&slot).expect("resolve"), h1_identity);

    registry.uninstall(&slot).expect("remove h1");
    assert!(registry.uninstall(&slot).is_none());
    assert_eq!(
        thread.call(CallerIdentity::Controller, f, vec![]),
        Ok(Value::S64(0))
    );
}

#[test]
fn uninstall_without_hooks_is_a_noop() {
    let registry = Registry::with_defaults();
    let f = registry.host().function("f", constant(1)).expect("declare");
    assert!(registry.uninstall(&SlotRef::function(f)).is_none());
    assert!(registry.restore(&SlotRef::function(f)).is_empty());
}

#[test]
fn incompatible_capture_leaves_binding_untouched() {
    let registry = Registry::with_defaults();
    let original = registry
        .register_named(
            "handler",
            Behavior::closure(vec![Upvalue::new(1)], |_cx, upvalues, _args| Ok(upvalues[0].get())),
            CallableKind::Managed,
        )
        .expect("register");
    let slot = SlotRef::function(original.id());

    // One capture: allowed
    let (compatible, old) = tagging_hook("ok");
    let accessor = registry.install(&slot, compatible).expect("install");
    old.set(accessor.id());
    let active = registry.resolve_active(&slot).expect("resolve");
    let identities = registry.identities().len();

    // Two captures against a one-capture managed hook: rejected
    let greedy = Behavior::closure(vec![Upvalue::default(), Upvalue::default()], |_cx, _up, _args| {
        Ok(Value::Nil)
    });
    let err = registry.install(&slot, greedy).expect_err("too many captures");
    assert_eq!(err, HookError::IncompatibleCapture { hook: 2, original: 1 });

    assert_eq!(registry.resolve_active(&slot).expect("resolve"), active);
    assert_eq!(registry.chain(&slot).len(), 1);
    assert_eq!(registry.identities().len(), identities);
}

#[test]
fn native_hooks_fit_any_managed_original() {
    let registry = Registry::with_defaults();
    let original = registry
        .register(
            Behavior::closure(vec![], |_cx, _up, _args| Ok(Value::Nil)),
            CallableKind::Managed,
        )
        .expect("register");
    assert!(registry
        .install(&SlotRef::function(original.id()), constant(5))
        .is_ok());
}

#[test]
fn metamethod_slots_hook_independently() {
    let registry = Registry::with_defaults();
    let game = registry
        .host()
        .object("game")
        .metamethod("__index", constant(1))
        .expect("declare __index")
        .metamethod("__newindex", constant(2))
        .expect("declare __newindex")
        .id();

    let index = SlotRef::metamethod(game, "__index");
    let newindex = SlotRef::metamethod(game, "__newindex");
    registry.install(&index, constant(10)).expect("install");

    assert!(registry.is_hooked(&index));
    assert!(!registry.is_hooked(&newindex));

    let thread = registry.thread();
    assert_eq!(thread.call_slot(CallerIdentity::External, &index, vec![]), Ok(Value::S64(10)));
    assert_eq!(thread.call_slot(CallerIdentity::External, &newindex, vec![]), Ok(Value::S64(2)));

    // Declared metamethod slots stay listed after restore
    registry.restore(&index);
    assert_eq!(registry.slots(), vec![index.clone(), newindex]);
    assert_eq!(thread.call_slot(CallerIdentity::External, &index, vec![]), Ok(Value::S64(1)));
}

#[test]
fn clone_is_distinct_but_equivalent() {
    let registry = Registry::with_defaults();
    let cell = Upvalue::new(10);
    let original = registry
        .register_named(
            "scale",
            Behavior::closure(vec![cell], |_cx, upvalues, args| {
                let factor = i64::try_from(upvalues[0].get())
                    .map_err(|e| HookError::raised(e.to_string()))?;
                let n = args
                    .into_iter()
                    .next()
                    .map(i64::try_from)
                    .transpose()
                    .map_err(|e| HookError::raised(e.to_string()))?
                    .unwrap_or(0);
                Ok(Value::S64(n * factor))
            }),
            CallableKind::Managed,
        )
        .expect("register");
    let copy = registry.clone_function(original.id()).expect("clone");

    assert_ne!(copy.id(), original.id());
    assert_eq!(registry.is_managed(copy.id()), Ok(true));

    let thread = registry.thread();
    for n in [-3, 0, 1, 7, 1000] {
        let a = thread.call(CallerIdentity::Controller, original.id(), vec![Value::S64(n)]);
        let b = thread.call(CallerIdentity::Controller, copy.id(), vec![Value::S64(n)]);
        assert_eq!(a, b);
        assert_eq!(a, Ok(Value::S64(n * 10)));
    }

    // Hooking the original does not affect the clone
    registry
        .install(&SlotRef::function(original.id()), constant(-1))
        .expect("install");
    assert_eq!(
        thread.call(CallerIdentity::Controller, copy.id(), vec![Value::S64(2)]),
        Ok(Value::S64(20))
    );
}

#[test]
fn wrap_native_follows_hooks_on_the_target() {
    let registry = Registry::with_defaults();
    let target = registry
        .register(
            Behavior::closure(vec![], |_cx, _up, _args| Ok(Value::S64(1))),
            CallableKind::Managed,
        )
        .expect("register");
    let wrapper = registry.wrap_native(target.id()).expect("wrap");
    assert_eq!(registry.is_native(wrapper.id()), Ok(true));
    assert_eq!(wrapper.upvalue_count(), 0);

    let thread = registry.thread();
    assert_eq!(thread.call(CallerIdentity::Controller, wrapper.id(), vec![]), Ok(Value::S64(1)));

    registry
        .install(&SlotRef::function(target.id()), constant(2))
        .expect("install");
    assert_eq!(thread.call(CallerIdentity::Controller, wrapper.id(), vec![]), Ok(Value::S64(2)));
}

#[test]
fn teardown_forgets_everything() {
    let registry = Registry::with_defaults();
    let f = registry.host().function("f", constant(1)).expect("declare");
    registry.install(&SlotRef::function(f), constant(2)).expect("install");

    registry.teardown();
    assert!(registry.slots().is_empty());
    assert_eq!(
        registry.resolve_active(&SlotRef::function(f)),
        Err(HookError::UnknownIdentity(f))
    );
}

#[test]
fn concurrent_installs_never_tear() {
    let registry = Registry::with_defaults();
    let f = registry.host().function("f", constant(0)).expect("declare");
    let slot = SlotRef::function(f);
    let baseline = registry.identities().len();

    let writers: Vec<_> = (0..4)
        .map(|w| {
            let registry = Arc::clone(&registry);
            let slot = slot.clone();
            thread::spawn(move || {
                for i in 0..50 {
                    registry.install(&slot, constant(w * 1000 + i)).expect("install");
                    registry.uninstall(&slot).expect("own binding present");
                }
            })
        })
        .collect();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let slot = slot.clone();
            thread::spawn(move || {
                let exec = registry.thread();
                for _ in 0..200 {
                    registry.resolve_active(&slot).expect("always resolvable");
                    exec.call(CallerIdentity::Controller, f, vec![])
                        .expect("dispatch succeeds");
                    assert_eq!(exec.depth(), 0);
                }
            })
        })
        .collect();

    for handle in writers.into_iter().chain(readers) {
        handle.join().expect("thread panicked");
    }

    assert!(!registry.is_hooked(&slot));
    assert_eq!(registry.resolve_active(&slot).expect("resolve").id(), f);
    assert_eq!(registry.identities().len(), baseline);
}

#[test]
fn hook_cycles_do_not_grow_the_identity_table() {
    let registry = Registry::with_defaults();
    let f = registry.host().function("f", constant(1)).expect("declare");
    let slot = SlotRef::function(f);
    let thread = registry.thread();
    let baseline = registry.identities().len();

    for _ in 0..1000 {
        let (hook, old) = tagging_hook("h");
        let accessor = registry.install(&slot, hook).expect("install");
        old.set(accessor.id());
        registry.uninstall(&slot).expect("binding present");
    }
    assert_eq!(registry.identities().len(), baseline);

    for i in 0..100 {
        registry.install(&slot, constant(i)).expect("install");
    }
    assert_eq!(registry.restore(&slot).len(), 100);
    assert_eq!(registry.identities().len(), baseline);
    assert!(!registry.is_hooked(&slot));
    assert_eq!(thread.call(CallerIdentity::Controller, f, vec![]), Ok(Value::S64(1)));
}

#[test]
fn accessor_is_released_with_its_binding() {
    let registry = Registry::with_defaults();
    let f = registry.host().function("f", constant(1)).expect("declare");
    let slot = SlotRef::function(f);
    let thread = registry.thread();

    let accessor = registry.install(&slot, constant(2)).expect("install");
    registry.uninstall(&slot).expect("binding present");

    assert_eq!(
        thread.call(CallerIdentity::Controller, accessor.id(), vec![]),
        Err(HookError::UnknownIdentity(accessor.id()))
    );
    assert_eq!(thread.depth(), 0);
}
