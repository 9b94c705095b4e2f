//! Call-Site Context Tracker
//!
//! Each execution thread owns a [`ContextStack`]. The trampoline pushes a
//! [`CallContext`] on entry to every mediated call and the returned
//! [`FrameGuard`] pops it again, on normal return, on error, and during a
//! panic unwind alike.

use crate::error::HookError;
use crate::identity::CallableId;
use crate::runtime::SlotRef;
use std::cell::RefCell;
use std::fmt;

/// Who invoked the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallerIdentity {
    /// The controlling process (the embedder's own script thread).
    Controller,
    /// Outside input: the host application or a user-triggered event.
    External,
    /// Another callable running on this thread.
    Callable(CallableId),
}

impl CallerIdentity {
    pub fn is_controller(&self) -> bool {
        matches!(self, CallerIdentity::Controller)
    }
}

impl fmt::Display for CallerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallerIdentity::Controller => f.write_str("controller"),
            CallerIdentity::External => f.write_str("external"),
            CallerIdentity::Callable(id) => write!(f, "{}", id),
        }
    }
}

/// One tracked frame.
#[derive(Debug, Clone, PartialEq)]
pub struct CallContext {
    pub caller: CallerIdentity,
    /// Method name of the named dispatch that reached this frame; empty if none
    pub method: String,
    /// Identity actually running in this frame
    pub callee: CallableId,
    pub slot: SlotRef,
    /// True if `callee` was resolved from a hook binding
    pub in_hook: bool,
    /// Frames below this one (0 = entered by the host)
    pub depth: usize,
}

/// Per-thread stack of tracked frames.
#[derive(Debug, Default)]
pub struct ContextStack {
    frames: RefCell<Vec<CallContext>>,
}

impl ContextStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.frames.borrow().len()
    }

    pub fn current_caller(&self) -> Result<CallerIdentity, HookError> {
        self.frames
            .borrow()
            .last()
            .map(|frame| frame.caller)
            .ok_or(HookError::NoActiveCall)
    }

    pub fn current_method_name(&self) -> Result<String, HookError> {
        self.frames
            .borrow()
            .last()
            .map(|frame| frame.method.clone())
            .ok_or(HookError::NoActiveCall)
    }

    /// Caller of the outermost frame: who started the current call chain.
    pub fn origin(&self) -> Option<CallerIdentity> {
        self.frames.borrow().first().map(|frame| frame.caller)
    }

    /// True if any frame on the stack is running a hook.
    pub fn inside_hook(&self) -> bool {
        self.frames.borrow().iter().any(|frame| frame.in_hook)
    }

    /// Innermost frame running a hook, if any.
    pub fn innermost_hook(&self) -> Option<CallContext> {
        self.frames.borrow().iter().rev().find(|frame| frame.in_hook).cloned()
    }

    pub fn frames(&self) -> Vec<CallContext> {
        self.frames.borrow().clone()
    }

    pub(crate) fn push(&self, frame: CallContext) -> FrameGuard<'_> {
        let mut frames = self.frames.borrow_mut();
        let depth = frames.len();
        frames.push(frame);
        FrameGuard { stack: self, depth }
    }
}

/// Pops its frame (and anything a misbehaving callee left above it) on drop.
pub(crate) struct FrameGuard<'a> {
    stack: &'a ContextStack,
    depth: usize,
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        self.stack.frames.borrow_mut().truncate(self.depth);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ObjectId;

    fn frame(method: &str, in_hook: bool) -> CallContext {
        CallContext {
            caller: CallerIdentity::Controller,
            method: method.to_string(),
            callee: CallableId::from_raw(1),
            slot: SlotRef::metamethod(ObjectId::from_raw(1), "__namecall"),
            in_hook,
            depth: 0,
        }
    }

    #[test]
    fn empty_stack_has_no_active_call() {
        let stack = ContextStack::new();
        assert_eq!(stack.current_caller(), Err(HookError::NoActiveCall));
        assert_eq!(stack.current_method_name(), Err(HookError::NoActiveCall));
        assert_eq!(stack.origin(), None);
    }

    #[test]
    fn guards_restore_depth_in_reverse_order() {
        let stack = ContextStack::new();
        {
            let _outer = stack.push(frame("Outer", false));
            {
                let _inner = stack.push(frame("Inner", true));
                assert_eq!(stack.depth(), 2);
                assert_eq!(stack.current_method_name().as_deref(), Ok("Inner"));
                assert!(stack.inside_hook());
            }
            assert_eq!(stack.depth(), 1);
            assert_eq!(stack.current_method_name().as_deref(), Ok("Outer"));
            assert!(!stack.inside_hook());
        }
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn outer_guard_discards_leaked_frames() {
        let stack = ContextStack::new();
        let outer = stack.push(frame("Outer", false));
        std::mem::forget(stack.push(frame("Leaked", false)));
        assert_eq!(stack.depth(), 2);
        drop(outer);
        assert_eq!(stack.depth(), 0);
    }
}
