//! Event Chains
//!
//! The deferred-execution DSL: a chain is an immutable-after-build sequence
//! of wait / fire / continue-if steps that reads like a sequential script
//! but executes through the scheduler. There is no external driver walking
//! the steps - invoking step i schedules invoke(i + 1), and the chain
//! advances purely through the event queue. A chain can be triggered any
//! number of times; each trigger is an independent walk from step 0.

use crate::action::{ActionFn, FireResult, Value};
use crate::scheduler::{Scheduler, SchedulerState};
use std::cell::RefCell;
use std::rc::Rc;

/// Wait duration: fixed, or produced at trigger time (so a step can follow
/// a tempo slider or any other live host value).
#[derive(Clone)]
enum WaitFor {
    Sec(f64),
    Dynamic(Rc<dyn Fn(&Scheduler) -> f64>),
}

impl WaitFor {
    fn eval(&self, scheduler: &Scheduler) -> f64 {
        let sec = match self {
            WaitFor::Sec(s) => *s,
            WaitFor::Dynamic(f) => f(scheduler),
        };
        if sec.is_finite() && sec > 0.0 {
            sec
        } else {
            0.0
        }
    }
}

/// Fire target: a closure captured at build time, or a registry name
/// resolved at trigger time.
#[derive(Clone)]
enum FireTarget {
    Handler(ActionFn),
    Named(String),
}

#[derive(Clone)]
enum Step {
    Wait(WaitFor),
    Fire {
        target: FireTarget,
        args: Vec<Value>,
    },
    ContinueIf(Rc<dyn Fn(&Scheduler) -> bool>),
}

/// A buildable, re-triggerable sequence of steps. Cheap to clone; clones
/// share the step sequence, so a clone captured by a fire step can
/// re-trigger the same chain (the usual looping idiom).
#[derive(Clone)]
pub struct EventChain {
    scheduler: Scheduler,
    steps: Rc<RefCell<Vec<Step>>>,
}

impl EventChain {
    pub(crate) fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler,
            steps: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn len(&self) -> usize {
        self.steps.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.borrow().is_empty()
    }

    fn push(self, step: Step) -> Self {
        self.steps.borrow_mut().push(step);
        self
    }

    /// Append a wait step: on invocation, schedules the continuation at
    /// now + `sec` (cancelable).
    pub fn wait(self, sec: f64) -> Self {
        self.push(Step::Wait(WaitFor::Sec(sec)))
    }

    /// Append a wait step whose duration is computed when the step runs.
    pub fn wait_with(self, f: impl Fn(&Scheduler) -> f64 + 'static) -> Self {
        self.push(Step::Wait(WaitFor::Dynamic(Rc::new(f))))
    }

    /// Append a fire step: on invocation, runs the callback inside the
    /// current event's logical-time scope, then schedules the continuation
    /// at now plus whatever delay the callback returned (cancelable).
    pub fn fire(self, f: impl Fn(&Scheduler, &[Value]) -> FireResult + 'static) -> Self {
        self.push(Step::Fire {
            target: FireTarget::Handler(Rc::new(f)),
            args: Vec::new(),
        })
    }

    /// Append a fire step that resolves `name` in the scheduler's action
    /// registry when the step runs, so the chain survives action
    /// redefinition between build and trigger.
    pub fn fire_named(self, name: &str) -> Self {
        self.fire_named_with(name, Vec::new())
    }

    /// `fire_named` with an argument list passed to the resolved callback.
    pub fn fire_named_with(self, name: &str, args: Vec<Value>) -> Self {
        self.push(Step::Fire {
            target: FireTarget::Named(name.to_string()),
            args,
        })
    }

    /// Append a gate: when the predicate holds, the continuation is
    /// scheduled immediately - as a protected event, so the check's
    /// outcome survives a concurrent stop request. When it does not hold,
    /// the walk halts silently.
    pub fn continue_if(self, pred: impl Fn(&Scheduler) -> bool + 'static) -> Self {
        self.push(Step::ContinueIf(Rc::new(pred)))
    }

    /// Gate on the scheduler still being in its running state. The usual
    /// way a looping chain notices teardown and winds down cleanly.
    pub fn continue_if_still_running(self) -> Self {
        self.continue_if(|s| s.state() == SchedulerState::Running)
    }

    /// Splice `other`'s steps onto the end, producing one combined chain
    /// triggerable as a unit. Lets long pieces be assembled from smaller
    /// named sections ("intro, verse, verse, outro").
    pub fn concat(self, other: &EventChain) -> Self {
        let spliced: Vec<Step> = other.steps.borrow().iter().cloned().collect();
        self.steps.borrow_mut().extend(spliced);
        self
    }

    /// Start a walk from step 0 by scheduling the first invocation at the
    /// current logical time. Deliberately a silent no-op when the chain is
    /// empty or the scheduler is stopping/stopped, so orphaned chains
    /// cannot restart after teardown.
    pub fn trigger(&self) {
        match self.scheduler.state() {
            SchedulerState::Ready | SchedulerState::Running => {}
            _ => return,
        }
        if self.is_empty() {
            return;
        }
        let chain = self.clone();
        self.scheduler
            .schedule(self.scheduler.now(), move |s| chain.invoke_step(0, s));
    }

    /// Run the step at `pos` within the current event scope and schedule
    /// the invocation of `pos + 1`.
    fn invoke_step(&self, pos: usize, s: &Scheduler) {
        let step = match self.steps.borrow().get(pos) {
            Some(step) => step.clone(),
            None => return,
        };
        let has_next = pos + 1 < self.steps.borrow().len();

        match step {
            Step::Wait(wait) => {
                let sec = wait.eval(s);
                if has_next {
                    let chain = self.clone();
                    s.schedule(s.now() + sec, move |s| chain.invoke_step(pos + 1, s));
                }
            }
            Step::Fire { target, args } => {
                let delay = run_fire(&target, &args, s);
                if has_next {
                    let chain = self.clone();
                    s.schedule(s.now() + delay, move |s| chain.invoke_step(pos + 1, s));
                }
            }
            Step::ContinueIf(pred) => {
                if pred(s) && has_next {
                    let chain = self.clone();
                    s.schedule_protected(s.now(), move |s| chain.invoke_step(pos + 1, s));
                }
            }
        }
    }
}

/// Resolve and run a fire target, returning the delay before the next
/// step. Failures never propagate: an unknown name or a callback error is
/// reported and the chain continues with a neutral delay, so one bad step
/// cannot wedge a running chain or the poll loop.
fn run_fire(target: &FireTarget, args: &[Value], s: &Scheduler) -> f64 {
    let resolved = match target {
        FireTarget::Handler(f) => Some(f.clone()),
        FireTarget::Named(name) => {
            let found = s.get(name);
            if found.is_none() {
                tracing::error!(action = %name, "fire step references an unregistered action");
            }
            found
        }
    };

    let Some(callback) = resolved else {
        return 0.0;
    };
    match callback(s, args) {
        Ok(Some(delay)) if delay.is_finite() && delay > 0.0 => delay,
        Ok(_) => 0.0,
        Err(err) => {
            tracing::error!(error = %err, "fire step callback failed");
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders_append_steps() {
        let sched = Scheduler::new();
        let chain = sched
            .fire(|_, _| Ok(None))
            .wait(1.0)
            .fire_named("named")
            .continue_if_still_running();
        assert_eq!(chain.len(), 4);
        assert!(!chain.is_empty());
    }

    #[test]
    fn test_concat_splices_steps() {
        let sched = Scheduler::new();
        let section_a = sched.fire(|_, _| Ok(None)).wait(0.5);
        let section_b = sched.fire(|_, _| Ok(None));

        let piece = sched
            .chain()
            .concat(&section_a)
            .concat(&section_a)
            .concat(&section_b);
        assert_eq!(piece.len(), 5);
        // Sections are untouched.
        assert_eq!(section_a.len(), 2);
        assert_eq!(section_b.len(), 1);
    }

    #[test]
    fn test_trigger_on_empty_chain_is_a_noop() {
        let sched = Scheduler::new();
        sched.chain().trigger();
        assert_eq!(sched.pending(), 0);
    }

    #[test]
    fn test_trigger_after_teardown_is_a_noop() {
        let sched = Scheduler::new();
        let chain = sched.fire(|_, _| Ok(None));

        sched.start().unwrap();
        sched.stop().unwrap();
        chain.trigger();
        assert_eq!(sched.pending(), 0);
    }

    #[test]
    fn test_clones_share_steps() {
        let sched = Scheduler::new();
        let chain = sched.wait(1.0);
        let alias = chain.clone();
        let chain = chain.wait(2.0);
        assert_eq!(chain.len(), 2);
        assert_eq!(alias.len(), 2);
    }
}
