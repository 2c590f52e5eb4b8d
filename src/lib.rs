//! Event Chains
//!
//! A logical-time event scheduler for driving creative-coding sketches:
//! - Stable time-ordered event queue (FIFO among equal timestamps)
//! - Realtime polling driver (spin_sleep) with look-ahead draining
//! - Synchronous fast-forward mode for deterministic offline rendering
//! - Chain DSL: wait / fire / continue-if steps that read sequentially but
//!   execute through the scheduler
//! - Name-keyed action registry so hot-reloaded programs keep their
//!   scheduled chains valid

pub mod action;
pub mod chain;
pub mod clock;
pub mod queue;
pub mod scheduler;


pub use action::{Action, ActionError, ActionFn, ActionRegistry, FireResult, Value};
pub use chain::EventChain;
pub use clock::{wall_clock, ClockFn, LogicalClock};
pub use queue::{EventQueue, EventRef, ScheduledEvent};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerError, SchedulerState};
