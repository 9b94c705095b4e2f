//! Dispatch Trampoline
//!
//! Every mediated call goes through [`ExecThread::enter`]:
//!
//! 1. check the depth limit
//! 2. resolve the slot's active identity
//! 3. push a [`CallContext`] (caller, method name, callee)
//! 4. run observers and the resolved behavior
//! 5. pop the frame, whether the behavior returned, failed, or panicked
//!
//! Behaviors receive a [`CallCx`] through which they query their own context
//! and make nested calls.

use super::context::ContextStack;
use super::{CallContext, CallerIdentity, ObjectId, Registry, SlotRef};
use crate::error::HookError;
use crate::identity::{CallableId, CallableIdentity};
use crate::value::Value;
use std::sync::Arc;

/// How a call determines the method name recorded in its frame.
enum MethodName {
    /// Named dispatch: record this name
    Named(String),
    /// Plain call of a function value: keep the enclosing frame's name
    Inherit,
}

/// One thread of execution with its own context stack.
///
/// Not `Sync`: a stack belongs to exactly one thread at a time.
pub struct ExecThread {
    registry: Arc<Registry>,
    stack: ContextStack,
}

impl ExecThread {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            stack: ContextStack::new(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn depth(&self) -> usize {
        self.stack.depth()
    }

    /// Frames currently on this thread's stack, outermost first.
    pub fn frames(&self) -> Vec<CallContext> {
        self.stack.frames()
    }

    // ------------------------------------------------------------------------
    // Context queries
    // ------------------------------------------------------------------------

    pub fn current_caller(&self) -> Result<CallerIdentity, HookError> {
        self.stack.current_caller()
    }

    /// `getnamecallmethod`
    pub fn current_method_name(&self) -> Result<String, HookError> {
        self.stack.current_method_name()
    }

    /// `checkcaller`: true if the current call chain was started by the
    /// controlling process.
    pub fn check_caller(&self) -> bool {
        self.stack.origin().is_some_and(|origin| origin.is_controller())
    }

    // ------------------------------------------------------------------------
    // Host entry points
    // ------------------------------------------------------------------------

    /// Invoke `slot` by name: the frame records the slot's name as its method
    /// (the function's debug name, or the metamethod name).
    pub fn call_slot(
        &self,
        caller: CallerIdentity,
        slot: &SlotRef,
        args: Vec<Value>,
    ) -> Result<Value, HookError> {
        let method = self.slot_name(slot)?;
        self.enter(caller, slot.clone(), MethodName::Named(method), args)
    }

    /// Named method dispatch (`object:Method(args)`) through the object's
    /// `__namecall` slot.
    pub fn namecall(
        &self,
        caller: CallerIdentity,
        object: ObjectId,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, HookError> {
        self.enter(
            caller,
            SlotRef::namecall(object),
            MethodName::Named(method.to_string()),
            args,
        )
    }

    /// Call a function value. Hooks on the function apply; the method name is
    /// inherited from the enclosing frame (empty at top level).
    pub fn call(
        &self,
        caller: CallerIdentity,
        id: CallableId,
        args: Vec<Value>,
    ) -> Result<Value, HookError> {
        self.enter(caller, SlotRef::Function(id), MethodName::Inherit, args)
    }

    fn slot_name(&self, slot: &SlotRef) -> Result<String, HookError> {
        match slot {
            SlotRef::Function(id) => Ok(self
                .registry
                .identity(*id)?
                .name()
                .unwrap_or_default()
                .to_string()),
            SlotRef::Metamethod { name, .. } => Ok(name.clone()),
        }
    }

    fn enter(
        &self,
        caller: CallerIdentity,
        slot: SlotRef,
        method: MethodName,
        args: Vec<Value>,
    ) -> Result<Value, HookError> {
        let depth = self.stack.depth();
        if depth >= self.registry.config().max_call_depth {
            let error = HookError::StackOverflow(depth);
            tracing::debug!(slot = %slot, depth, "call depth limit reached");
            return Err(error);
        }

        let resolved = self.registry.resolve_dispatch(&slot)?;
        let method = match method {
            MethodName::Named(name) => name,
            MethodName::Inherit => self.stack.current_method_name().unwrap_or_default(),
        };

        let frame = CallContext {
            caller,
            method,
            callee: resolved.identity.id(),
            slot,
            in_hook: resolved.hooked,
            depth,
        };
        tracing::trace!(
            slot = %frame.slot,
            callee = %frame.callee,
            caller = %frame.caller,
            method = %frame.method,
            depth,
            "dispatch"
        );

        let _guard = self.stack.push(frame.clone());
        let result = self.run(&frame, resolved.identity, args);

        if depth == 0 {
            if let Err(error) = &result {
                self.registry.report_failure(&frame, error);
            }
        }
        result
    }

    fn run(
        &self,
        frame: &CallContext,
        callee: Arc<CallableIdentity>,
        args: Vec<Value>,
    ) -> Result<Value, HookError> {
        let observers = self.registry.observers();
        if observers.is_empty() {
            let cx = CallCx { thread: self, callee };
            return cx.callee.invoke(&cx, args);
        }

        let mut replayed = None;
        for observer in &observers {
            if let Some(value) = observer.before_dispatch(frame, &args) {
                replayed.get_or_insert(value);
            }
        }

        let result = match replayed {
            Some(value) => Ok(value),
            None => {
                let cx = CallCx { thread: self, callee };
                cx.callee.invoke(&cx, args.clone())
            }
        };

        for observer in &observers {
            observer.after_dispatch(frame, &args, &result);
        }
        result
    }
}

/// What a running behavior sees: its own identity and the thread it runs on.
pub struct CallCx<'a> {
    thread: &'a ExecThread,
    callee: Arc<CallableIdentity>,
}

impl<'a> CallCx<'a> {
    pub fn thread(&self) -> &'a ExecThread {
        self.thread
    }

    pub fn registry(&self) -> &'a Arc<Registry> {
        &self.thread.registry
    }

    /// The identity running in this frame.
    pub fn callee(&self) -> &CallableIdentity {
        &self.callee
    }

    pub fn caller(&self) -> Result<CallerIdentity, HookError> {
        self.thread.current_caller()
    }

    /// `getnamecallmethod`
    pub fn method_name(&self) -> Result<String, HookError> {
        self.thread.current_method_name()
    }

    /// `checkcaller`
    pub fn check_caller(&self) -> bool {
        self.thread.check_caller()
    }

    /// Call a function by id. If the function is hooked, the active hook runs.
    pub fn call(&self, id: CallableId, args: Vec<Value>) -> Result<Value, HookError> {
        self.thread.call(self.as_caller(), id, args)
    }

    /// Call a value, failing like a script would if it is not a function.
    pub fn call_value(&self, value: &Value, args: Vec<Value>) -> Result<Value, HookError> {
        match value {
            Value::Function(id) => self.call(*id, args),
            other => Err(HookError::raised(format!(
                "attempt to call a {} value",
                other.type_name()
            ))),
        }
    }

    pub fn call_slot(&self, slot: &SlotRef, args: Vec<Value>) -> Result<Value, HookError> {
        self.thread.call_slot(self.as_caller(), slot, args)
    }

    pub fn namecall(
        &self,
        object: ObjectId,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, HookError> {
        self.thread.namecall(self.as_caller(), object, method, args)
    }

    /// Yield point.
    ///
    /// There is no scheduler in the core, so outside hooks this returns
    /// immediately. Inside a hook (or anything a hook called) the request is a
    /// contract violation and fails with [`HookError::BlockingHook`].
    pub fn suspend(&self) -> Result<(), HookError> {
        match self.thread.stack.innermost_hook() {
            Some(frame) => Err(HookError::BlockingHook(frame.slot.to_string())),
            None => Ok(()),
        }
    }

    fn as_caller(&self) -> CallerIdentity {
        CallerIdentity::Callable(self.callee.id())
    }
}
