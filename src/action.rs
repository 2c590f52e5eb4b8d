//! Actions
//!
//! The event payload type, the argument values passed to fire callbacks,
//! and the name-to-callback registry that lets chains reference actions by
//! string. Name resolution happens at trigger time, not at chain-build
//! time, so a hot-reloaded program can redefine an action and every chain
//! already scheduled against that name picks up the new definition.

use crate::scheduler::Scheduler;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// Error produced by a fire callback. Anything the host can describe.
pub type ActionError = Box<dyn std::error::Error>;

/// Result of a fire callback: `Ok(Some(delay))` pushes the chain's next
/// step out by `delay` seconds, `Ok(None)` continues immediately, `Err` is
/// reported at the step boundary and the chain continues anyway.
pub type FireResult = Result<Option<f64>, ActionError>;

/// A fire callback. Receives the owning scheduler (so it can query `now`,
/// schedule further work, or stop the run) and the argument list captured
/// when the step was built.
pub type ActionFn = Rc<dyn Fn(&Scheduler, &[Value]) -> FireResult>;

/// One-shot closure carried by a scheduled event.
pub(crate) type EventFn = Box<dyn FnOnce(&Scheduler)>;

/// Argument value for fire callbacks. Fixed-arity rendition of a variadic
/// argument list: steps capture a `Vec<Value>` at build time and callbacks
/// receive it as a slice at trigger time.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Num(f64),
    Str(String),
    Bool(bool),
}

impl Value {
    pub fn as_num(&self) -> Option<f64> {
        match self {
            Value::Num(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Num(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Num(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Num(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// A scheduled event's payload: target logical time, the callback to run,
/// and whether `stop()` may cancel it while still pending.
pub struct Action {
    /// Target logical time. Dispatch substitutes this into the logical
    /// clock for the duration of the callback.
    pub time: f64,
    /// Cancelable events are dropped wholesale by `stop()`; protected ones
    /// drain to completion.
    pub cancelable: bool,
    run: EventFn,
}

impl Action {
    pub fn new(time: f64, cancelable: bool, run: impl FnOnce(&Scheduler) + 'static) -> Self {
        Self {
            time,
            cancelable,
            run: Box::new(run),
        }
    }

    /// Consume the payload and run its callback. Callers are expected to
    /// wrap this in a logical-time scope; the scheduler's dispatch does.
    pub fn invoke(self, scheduler: &Scheduler) {
        (self.run)(scheduler);
    }
}

/// Name-keyed action map.
///
/// `reset` exists for host hot-reload: clearing the map guarantees no chain
/// can reach a stale closure from the previous program version; the reloaded
/// program re-registers under the same names.
#[derive(Default)]
pub struct ActionRegistry {
    actions: HashMap<String, ActionFn>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or redefine) `name`.
    pub fn set(&mut self, name: &str, action: impl Fn(&Scheduler, &[Value]) -> FireResult + 'static) {
        self.actions.insert(name.to_string(), Rc::new(action));
    }

    /// Look up `name`.
    pub fn get(&self, name: &str) -> Option<ActionFn> {
        self.actions.get(name).cloned()
    }

    /// Drop every registered name.
    pub fn reset(&mut self) {
        self.actions.clear();
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}
