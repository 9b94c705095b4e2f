//! Scenario documents
//!
//! A scenario is a JSON document that plays the embedding host: it declares
//! host functions and objects with built-in behaviors, then runs a list of
//! steps (install hooks, call slots, clone functions, ...). The CLI runs
//! scenarios and prints what every step did.
//!
//! ```json
//! {
//!   "functions": [{ "name": "print", "behavior": { "kind": "echo" } }],
//!   "objects": [{
//!     "name": "game",
//!     "metamethods": [{ "name": "__namecall", "behavior": { "kind": "method_name" } }]
//!   }],
//!   "steps": [
//!     { "op": "hook", "target": { "object": "game", "metamethod": "__namecall" },
//!       "behavior": { "kind": "filter", "method": "Kick", "value": null } },
//!     { "op": "namecall", "object": "game", "method": "Kick", "caller": "external" },
//!     { "op": "namecall", "object": "game", "method": "GetService" }
//!   ]
//! }
//! ```

use crate::config::RegistryConfig;
use crate::error::HookError;
use crate::identity::{Behavior, CallableId, CallableKind, Upvalue};
use crate::runtime::{
    CallerIdentity, DispatchRecord, ExecThread, ObjectId, RecordingObserver, Registry, SlotRef,
};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScenarioError {
    #[error("invalid scenario: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("unknown object '{0}'")]
    UnknownObject(String),

    #[error("name '{0}' is already taken")]
    DuplicateName(String),

    #[error(transparent)]
    Hook(#[from] HookError),
}

// ============================================================================
// Document model
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    #[serde(default)]
    pub functions: Vec<FunctionDecl>,
    #[serde(default)]
    pub objects: Vec<ObjectDecl>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Scenario {
    pub fn from_json(source: &str) -> Result<Self, ScenarioError> {
        Ok(serde_json::from_str(source)?)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FunctionDecl {
    pub name: String,
    /// Host functions are native; managed ones model script functions
    #[serde(default)]
    pub kind: KindSpec,
    pub behavior: BehaviorSpec,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KindSpec {
    #[default]
    Native,
    Managed,
}

impl From<KindSpec> for CallableKind {
    fn from(kind: KindSpec) -> Self {
        match kind {
            KindSpec::Native => CallableKind::Native,
            KindSpec::Managed => CallableKind::Managed,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObjectDecl {
    pub name: String,
    #[serde(default)]
    pub metamethods: Vec<MetamethodDecl>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetamethodDecl {
    pub name: String,
    pub behavior: BehaviorSpec,
}

/// Built-in behaviors a scenario can attach to functions, slots and hooks.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BehaviorSpec {
    /// Return a fixed value
    Constant { value: serde_json::Value },
    /// Return the arguments as a list
    Echo,
    /// Add up numeric arguments
    Sum,
    /// Return the active method name
    MethodName,
    /// Return whether the call chain started at the controller
    CheckCaller,
    /// Fail with a message
    Raise { message: String },
    /// Managed closure counting its own invocations in an upvalue
    Counter,
    /// Hit a yield point, then return nil
    Yield,
    /// Call another function by name with the same arguments
    CallFunction { function: String },
    /// Hook: call the original and return its result
    Passthrough,
    /// Hook: call the original and prefix its result
    Prefix { text: String },
    /// Hook: return `value` for one method name, defer to the original otherwise
    Filter { method: String, value: serde_json::Value },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TargetSpec {
    Metamethod { object: String, metamethod: String },
    Function { function: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallerSpec {
    #[default]
    Controller,
    External,
}

impl From<CallerSpec> for CallerIdentity {
    fn from(caller: CallerSpec) -> Self {
        match caller {
            CallerSpec::Controller => CallerIdentity::Controller,
            CallerSpec::External => CallerIdentity::External,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", deny_unknown_fields)]
pub enum Step {
    Hook {
        target: TargetSpec,
        behavior: BehaviorSpec,
    },
    Unhook {
        target: TargetSpec,
    },
    Restore {
        target: TargetSpec,
    },
    Call {
        target: TargetSpec,
        #[serde(default)]
        args: Vec<serde_json::Value>,
        #[serde(default)]
        caller: CallerSpec,
    },
    Namecall {
        object: String,
        method: String,
        #[serde(default)]
        args: Vec<serde_json::Value>,
        #[serde(default)]
        caller: CallerSpec,
    },
    Clone {
        function: String,
        name: String,
    },
    WrapNative {
        function: String,
        name: String,
    },
    Resolve {
        target: TargetSpec,
    },
}

impl Step {
    pub fn op(&self) -> &'static str {
        match self {
            Step::Hook { .. } => "hook",
            Step::Unhook { .. } => "unhook",
            Step::Restore { .. } => "restore",
            Step::Call { .. } => "call",
            Step::Namecall { .. } => "namecall",
            Step::Clone { .. } => "clone",
            Step::WrapNative { .. } => "wrap_native",
            Step::Resolve { .. } => "resolve",
        }
    }

    /// Steps that invoke behaviors rather than reshape the registry.
    pub fn is_call(&self) -> bool {
        matches!(self, Step::Call { .. } | Step::Namecall { .. })
    }
}

// ============================================================================
// Reports
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Ok(serde_json::Value),
    Err(String),
}

impl Outcome {
    fn from_result(result: &Result<Value, HookError>) -> Self {
        match result {
            Ok(value) => Outcome::Ok(value.to_json()),
            Err(error) => Outcome::Err(error.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok(_))
    }
}

/// One dispatch observed while a step ran.
#[derive(Debug, Clone, Serialize)]
pub struct TraceLine {
    pub depth: usize,
    pub slot: String,
    pub callee: String,
    pub caller: String,
    pub method: String,
    pub hooked: bool,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub index: usize,
    pub op: &'static str,
    pub outcome: Outcome,
    /// Dispatches in completion order (innermost first)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub trace: Vec<TraceLine>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BindingReport {
    pub installed_at: u64,
    pub hook: String,
    pub original: String,
    pub accessor: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlotReport {
    pub slot: String,
    pub active: String,
    /// Bindings oldest first
    pub chain: Vec<BindingReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub steps: Vec<StepReport>,
    pub slots: Vec<SlotReport>,
}

// ============================================================================
// Runner
// ============================================================================

/// Plays the host described by a scenario.
pub struct ScenarioRunner {
    registry: Arc<Registry>,
    thread: ExecThread,
    recorder: Arc<RecordingObserver>,
    functions: HashMap<String, CallableId>,
    objects: HashMap<String, ObjectId>,
}

impl ScenarioRunner {
    pub fn new(config: RegistryConfig) -> Self {
        let registry = Registry::new(config);
        let recorder = Arc::new(RecordingObserver::new());
        registry.add_observer(recorder.clone());
        Self {
            thread: registry.thread(),
            registry,
            recorder,
            functions: HashMap::new(),
            objects: HashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Run the whole scenario: declarations, then every step.
    pub fn run(
        scenario: &Scenario,
        config: RegistryConfig,
    ) -> Result<ScenarioReport, ScenarioError> {
        let mut runner = Self::new(config);
        runner.declare(scenario)?;
        let mut steps = Vec::with_capacity(scenario.steps.len());
        for (index, step) in scenario.steps.iter().enumerate() {
            steps.push(runner.run_step(index, step)?);
        }
        Ok(ScenarioReport {
            steps,
            slots: runner.inspect(),
        })
    }

    /// Apply declarations and every non-call step, then report the slots.
    pub fn dry_run(
        scenario: &Scenario,
        config: RegistryConfig,
    ) -> Result<Vec<SlotReport>, ScenarioError> {
        let mut runner = Self::new(config);
        runner.declare(scenario)?;
        for (index, step) in scenario.steps.iter().enumerate() {
            if !step.is_call() {
                runner.run_step(index, step)?;
            }
        }
        Ok(runner.inspect())
    }

    /// Declare the scenario's functions and objects.
    pub fn declare(&mut self, scenario: &Scenario) -> Result<(), ScenarioError> {
        for decl in &scenario.functions {
            let (behavior, _) = self.build(&decl.behavior)?;
            let id = match decl.kind {
                KindSpec::Native => self.registry.host().function(&decl.name, behavior)?,
                KindSpec::Managed => {
                    self.registry
                        .register_named(decl.name.as_str(), behavior, CallableKind::Managed)?
                        .id()
                }
            };
            self.bind_function(&decl.name, id)?;
        }

        for decl in &scenario.objects {
            if self.objects.contains_key(&decl.name) {
                return Err(ScenarioError::DuplicateName(decl.name.clone()));
            }
            let mut behaviors = Vec::with_capacity(decl.metamethods.len());
            for meta in &decl.metamethods {
                behaviors.push((meta.name.as_str(), self.build(&meta.behavior)?.0));
            }

            let mut host = self.registry.host();
            let mut object = host.object(&decl.name);
            for (name, behavior) in behaviors {
                object.metamethod(name, behavior)?;
            }
            let id = object.id();
            self.objects.insert(decl.name.clone(), id);
        }
        Ok(())
    }

    /// Run one step. Errors from the registry are part of the report;
    /// only malformed references (unknown names) abort the run.
    pub fn run_step(&mut self, index: usize, step: &Step) -> Result<StepReport, ScenarioError> {
        self.recorder.take();
        let result = self.apply(step)?;
        let trace = self
            .recorder
            .take()
            .iter()
            .map(|record| self.trace_line(record))
            .collect();
        Ok(StepReport {
            index,
            op: step.op(),
            outcome: Outcome::from_result(&result),
            trace,
        })
    }

    fn apply(&mut self, step: &Step) -> Result<Result<Value, HookError>, ScenarioError> {
        Ok(match step {
            Step::Hook { target, behavior } => {
                let slot = self.slot(target)?;
                let (behavior, original) = self.build(behavior)?;
                self.registry.install(&slot, behavior).map(|accessor| {
                    if let Some(cell) = original {
                        cell.set(accessor.id());
                    }
                    Value::Function(accessor.id())
                })
            }
            Step::Unhook { target } => {
                let slot = self.slot(target)?;
                Ok(self
                    .registry
                    .uninstall(&slot)
                    .map(|binding| Value::Function(binding.hook.id()))
                    .unwrap_or_default())
            }
            Step::Restore { target } => {
                let slot = self.slot(target)?;
                Ok(Value::S64(self.registry.restore(&slot).len() as i64))
            }
            Step::Call { target, args, caller } => {
                let slot = self.slot(target)?;
                self.thread
                    .call_slot((*caller).into(), &slot, args.iter().map(Value::from_json).collect())
            }
            Step::Namecall { object, method, args, caller } => {
                let object = self.object(object)?;
                self.thread.namecall(
                    (*caller).into(),
                    object,
                    method,
                    args.iter().map(Value::from_json).collect(),
                )
            }
            Step::Clone { function, name } => {
                let id = self.function(function)?;
                match self.registry.clone_function(id) {
                    Ok(copy) => {
                        self.bind_function(name, copy.id())?;
                        Ok(Value::Function(copy.id()))
                    }
                    Err(e) => Err(e),
                }
            }
            Step::WrapNative { function, name } => {
                let id = self.function(function)?;
                match self.registry.wrap_native(id) {
                    Ok(wrapper) => {
                        self.bind_function(name, wrapper.id())?;
                        Ok(Value::Function(wrapper.id()))
                    }
                    Err(e) => Err(e),
                }
            }
            Step::Resolve { target } => {
                let slot = self.slot(target)?;
                self.registry
                    .resolve_active(&slot)
                    .map(|identity| Value::Function(identity.id()))
            }
        })
    }

    /// Every slot with its active identity and hook chain.
    pub fn inspect(&self) -> Vec<SlotReport> {
        self.registry
            .slots()
            .into_iter()
            .map(|slot| {
                let active = self
                    .registry
                    .resolve_active(&slot)
                    .map(|identity| self.describe_function(identity.id()))
                    .unwrap_or_else(|e| e.to_string());
                let chain = self
                    .registry
                    .chain(&slot)
                    .iter()
                    .map(|binding| BindingReport {
                        installed_at: binding.installed_at,
                        hook: self.describe_function(binding.hook.id()),
                        original: self.describe_function(binding.original.id()),
                        accessor: self.describe_function(binding.accessor.id()),
                    })
                    .collect();
                SlotReport {
                    slot: self.describe_slot(&slot),
                    active,
                    chain,
                }
            })
            .collect()
    }

    // ------------------------------------------------------------------------
    // Name resolution
    // ------------------------------------------------------------------------

    fn bind_function(&mut self, name: &str, id: CallableId) -> Result<(), ScenarioError> {
        if self.functions.contains_key(name) {
            return Err(ScenarioError::DuplicateName(name.to_string()));
        }
        self.functions.insert(name.to_string(), id);
        Ok(())
    }

    fn function(&self, name: &str) -> Result<CallableId, ScenarioError> {
        self.functions
            .get(name)
            .copied()
            .ok_or_else(|| ScenarioError::UnknownFunction(name.to_string()))
    }

    fn object(&self, name: &str) -> Result<ObjectId, ScenarioError> {
        self.objects
            .get(name)
            .copied()
            .ok_or_else(|| ScenarioError::UnknownObject(name.to_string()))
    }

    fn slot(&self, target: &TargetSpec) -> Result<SlotRef, ScenarioError> {
        match target {
            TargetSpec::Function { function } => Ok(SlotRef::function(self.function(function)?)),
            TargetSpec::Metamethod { object, metamethod } => {
                Ok(SlotRef::metamethod(self.object(object)?, metamethod.as_str()))
            }
        }
    }

    fn describe_function(&self, id: CallableId) -> String {
        let name = self
            .functions
            .iter()
            .find(|(_, bound)| **bound == id)
            .map(|(name, _)| name.clone());
        match name {
            Some(name) => format!("{} ({})", name, id),
            None => id.to_string(),
        }
    }

    fn describe_slot(&self, slot: &SlotRef) -> String {
        match slot {
            SlotRef::Function(id) => self.describe_function(*id),
            SlotRef::Metamethod { object, name } => {
                let object = self
                    .registry
                    .object_name(*object)
                    .unwrap_or_else(|| object.to_string());
                format!("{}.{}", object, name)
            }
        }
    }

    fn trace_line(&self, record: &DispatchRecord) -> TraceLine {
        TraceLine {
            depth: record.frame.depth,
            slot: self.describe_slot(&record.frame.slot),
            callee: self.describe_function(record.frame.callee),
            caller: match record.frame.caller {
                CallerIdentity::Callable(id) => self.describe_function(id),
                other => other.to_string(),
            },
            method: record.frame.method.clone(),
            hooked: record.frame.in_hook,
            outcome: Outcome::from_result(&record.output),
        }
    }

    // ------------------------------------------------------------------------
    // Built-in behaviors
    // ------------------------------------------------------------------------

    /// Build a behavior. Hook behaviors also return the upvalue cell that
    /// must receive the original accessor once the hook is installed.
    fn build(&self, spec: &BehaviorSpec) -> Result<(Behavior, Option<Upvalue>), ScenarioError> {
        let behavior = match spec {
            BehaviorSpec::Constant { value } => {
                let value = Value::from_json(value);
                Behavior::native(move |_cx, _args| Ok(value.clone()))
            }
            BehaviorSpec::Echo => Behavior::native(|_cx, args| Ok(Value::List(args))),
            BehaviorSpec::Sum => Behavior::native(|_cx, args| sum(args)),
            BehaviorSpec::MethodName => {
                Behavior::native(|cx, _args| Ok(Value::String(cx.method_name()?)))
            }
            BehaviorSpec::CheckCaller => {
                Behavior::native(|cx, _args| Ok(Value::Bool(cx.check_caller())))
            }
            BehaviorSpec::Raise { message } => {
                let message = message.clone();
                Behavior::native(move |_cx, _args| Err(HookError::raised(message.clone())))
            }
            BehaviorSpec::Counter => {
                Behavior::closure(vec![Upvalue::new(0)], |_cx, upvalues, _args| {
                    let next = match upvalues[0].get() {
                        Value::S64(n) => n + 1,
                        _ => 1,
                    };
                    upvalues[0].set(next);
                    Ok(Value::S64(next))
                })
            }
            BehaviorSpec::Yield => Behavior::native(|cx, _args| {
                cx.suspend()?;
                Ok(Value::Nil)
            }),
            BehaviorSpec::CallFunction { function } => {
                let id = self.function(function)?;
                Behavior::native(move |cx, args| cx.call(id, args))
            }
            BehaviorSpec::Passthrough => {
                let original = Upvalue::default();
                let behavior = Behavior::closure(vec![original.clone()], |cx, upvalues, args| {
                    cx.call_value(&upvalues[0].get(), args)
                });
                return Ok((behavior, Some(original)));
            }
            BehaviorSpec::Prefix { text } => {
                let original = Upvalue::default();
                let text = text.clone();
                let behavior = Behavior::closure(vec![original.clone()], move |cx, upvalues, args| {
                    let result = cx.call_value(&upvalues[0].get(), args)?;
                    Ok(Value::String(format!("{}{}", text, result)))
                });
                return Ok((behavior, Some(original)));
            }
            BehaviorSpec::Filter { method, value } => {
                let original = Upvalue::default();
                let method = method.clone();
                let value = Value::from_json(value);
                let behavior = Behavior::closure(vec![original.clone()], move |cx, upvalues, args| {
                    if cx.method_name()? == method {
                        return Ok(value.clone());
                    }
                    cx.call_value(&upvalues[0].get(), args)
                });
                return Ok((behavior, Some(original)));
            }
        };
        Ok((behavior, None))
    }
}

fn sum(args: Vec<Value>) -> Result<Value, HookError> {
    let mut int_total: i64 = 0;
    let mut float_total: Option<f64> = None;
    for arg in args {
        match arg {
            Value::S64(n) => int_total = int_total.wrapping_add(n),
            Value::F64(n) => *float_total.get_or_insert(0.0) += n,
            other => {
                return Err(HookError::raised(format!(
                    "attempt to perform arithmetic on a {} value",
                    other.type_name()
                )))
            }
        }
    }
    Ok(match float_total {
        Some(f) => Value::F64(f + int_total as f64),
        None => Value::S64(int_total),
    })
}
