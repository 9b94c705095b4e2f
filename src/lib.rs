//! Interpose: a function and metamethod interception core
//!
//! Models what sits behind a script host's `hookfunction`, `hookmetamethod`,
//! `clonefunction`, `checkcaller` and `getnamecallmethod`, independent of any
//! particular host runtime.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              Embedding host             │
//! │   declares slots, owns exec threads     │
//! ├─────────────────────────────────────────┤
//! │  runtime   - trampoline, hook registry, │
//! │              context tracker, observers │
//! │  identity  - callable identity table    │
//! │  value     - runtime values             │
//! ├─────────────────────────────────────────┤
//! │  scenario  - JSON-driven host for CLI   │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! let registry = Registry::with_defaults();
//! let game = registry
//!     .host()
//!     .object("game")
//!     .metamethod("__namecall", Behavior::native(|cx, _| Ok(cx.method_name()?.into())))?
//!     .id();
//!
//! let old = Upvalue::default();
//! let accessor = registry.install(
//!     &SlotRef::namecall(game),
//!     Behavior::closure(vec![old.clone()], |cx, up, args| {
//!         if cx.method_name()? == "Kick" {
//!             return Ok(Value::Nil);
//!         }
//!         cx.call_value(&up[0].get(), args)
//!     }),
//! )?;
//! old.set(accessor.id());
//!
//! let thread = registry.thread();
//! thread.namecall(CallerIdentity::External, game, "Kick", vec![])?;
//! ```

pub mod config;
pub mod error;
pub mod identity;
pub mod runtime;
pub mod scenario;
pub mod value;

pub use config::RegistryConfig;
pub use error::HookError;
pub use identity::{Behavior, CallableId, CallableIdentity, CallableKind, Upvalue};
pub use runtime::{
    CallContext, CallCx, CallerIdentity, ExecThread, HookBinding, ObjectId, Registry, SlotRef,
};
pub use value::Value;
