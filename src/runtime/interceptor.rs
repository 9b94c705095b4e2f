//! Dispatch Observers
//!
//! Observers see every trampoline-mediated call. They are how the CLI records
//! a trace, and how a replay harness can short-circuit calls with previously
//! recorded results.
//!
//! # Recording
//!
//! A recording observer returns `None` from `before_dispatch` (allowing normal
//! execution) and records the frame, input and output in `after_dispatch`.
//!
//! # Replay
//!
//! A replay observer returns `Some(recorded_output)` from `before_dispatch`,
//! skipping the resolved behavior while the frame stays on the stack.

use crate::error::HookError;
use crate::runtime::CallContext;
use crate::value::Value;
use parking_lot::Mutex;

/// Trait for observing dispatches through the trampoline.
///
/// Both methods run with the call's frame already pushed, so
/// [`CallContext`] reflects what the behavior itself would see.
pub trait DispatchObserver: Send + Sync {
    /// Called before the resolved behavior runs.
    ///
    /// Return `Some(Value)` to short-circuit with that value.
    fn before_dispatch(&self, frame: &CallContext, input: &[Value]) -> Option<Value>;

    /// Called after the call finished, successfully or not.
    fn after_dispatch(
        &self,
        frame: &CallContext,
        input: &[Value],
        output: &Result<Value, HookError>,
    );
}

/// One observed call.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRecord {
    pub frame: CallContext,
    pub input: Vec<Value>,
    pub output: Result<Value, HookError>,
}

/// Observer that records every completed dispatch in completion order.
#[derive(Default)]
pub struct RecordingObserver {
    records: Mutex<Vec<DispatchRecord>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<DispatchRecord> {
        self.records.lock().clone()
    }

    /// Remove and return everything recorded so far.
    pub fn take(&self) -> Vec<DispatchRecord> {
        std::mem::take(&mut *self.records.lock())
    }
}

impl DispatchObserver for RecordingObserver {
    fn before_dispatch(&self, _frame: &CallContext, _input: &[Value]) -> Option<Value> {
        None
    }

    fn after_dispatch(
        &self,
        frame: &CallContext,
        input: &[Value],
        output: &Result<Value, HookError>,
    ) {
        self.records.lock().push(DispatchRecord {
            frame: frame.clone(),
            input: input.to_vec(),
            output: output.clone(),
        });
    }
}
