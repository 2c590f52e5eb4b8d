//! Real-time demo for the event-chains scheduler.
//!
//! Runs a couple of short scenes against the wall clock and logs what
//! fires through `tracing`:
//!
//!   cargo run --bin chain_demo            # Run all scenes
//!
//! Scenes:
//!   1. Metronome   - a self-retriggering chain ticking every 250ms,
//!                    wound down by a scheduled stop
//!   2. Sections    - a piece concatenated from two reusable sections,
//!                    with a registry action resolved at trigger time

use event_chains::{EventChain, Scheduler, SchedulerConfig, SchedulerState};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::info;

fn run_metronome() {
    info!("scene 1: metronome");
    let sched = Scheduler::with_config(SchedulerConfig {
        interval: 0.01,
        look_ahead: 0.05,
        ..Default::default()
    });

    let slot: Rc<RefCell<Option<EventChain>>> = Rc::new(RefCell::new(None));
    let retrigger = slot.clone();
    let beat = sched
        .fire(|s, _| {
            info!(t = s.now(), "tick");
            Ok(None)
        })
        .wait(0.25)
        .continue_if_still_running()
        .fire(move |_, _| {
            if let Some(chain) = retrigger.borrow().as_ref() {
                chain.trigger();
            }
            Ok(None)
        });
    *slot.borrow_mut() = Some(beat.clone());

    beat.trigger();
    // Wind the scene down from inside the run; the stop sweeps the pending
    // cancelable steps and the loop finalizes on its own.
    sched.schedule_protected(1.9, |s| {
        info!("stopping metronome");
        let _ = s.stop_with(|| info!("metronome ended"));
    });

    sched.start().expect("fresh scheduler should start");
    sched.run();
    assert_eq!(sched.state(), SchedulerState::Stopped);
}

fn run_sections() {
    info!("scene 2: sections");
    let sched = Scheduler::with_config(SchedulerConfig {
        interval: 0.01,
        look_ahead: 0.05,
        keep_alive: false,
        ..Default::default()
    });

    sched.set("chord", |s, args| {
        let root = args.first().and_then(|v| v.as_num()).unwrap_or(60.0);
        info!(t = s.now(), root, "chord");
        Ok(None)
    });

    let intro = sched
        .fire(|s, _| {
            info!(t = s.now(), "intro hit");
            Ok(None)
        })
        .wait(0.3);
    let verse = sched
        .fire_named_with("chord", vec![57.0.into()])
        .wait(0.3)
        .fire_named_with("chord", vec![64.0.into()])
        .wait(0.3);

    let piece = sched.chain().concat(&intro).concat(&verse).concat(&verse);
    piece.trigger();

    sched.set_on_ended(|| info!("sections ended"));
    sched.start().expect("fresh scheduler should start");
    // keep_alive is off: the loop ends once the piece drains.
    sched.run();
}

fn main() {
    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    run_metronome();
    run_sections();
}
