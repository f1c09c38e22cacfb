use crate::common::*;

use std::cell::Cell;
use std::rc::Rc;

use bytebreak::runtime::{Frame, Machine};
use bytebreak::{BreakpointEngine, BreakpointStatus, Dialect, EngineConfig};

fn engine() -> Rc<BreakpointEngine> {
    Rc::new(BreakpointEngine::with_isolated_quotas(
        Dialect::cpython37(),
        EngineConfig::default(),
    ))
}

#[test]
fn detach_restores_attributes_bitwise() {
    let engine = engine();
    let code = greet_fn();
    let pristine = snapshot(&code);

    let mut cookies = Vec::new();
    for _ in 0..3 {
        let (hit, _) = hit_counter();
        let (error, _) = error_counter();
        let cookie = engine.create_raw_breakpoint(&code, 2, hit, error);
        engine.activate_breakpoint(cookie);
        cookies.push(cookie);
    }
    assert_ne!(snapshot(&code), pristine, "patching must change the code");

    engine.detach();

    assert_eq!(snapshot(&code), pristine);
    for cookie in cookies {
        assert_eq!(engine.breakpoint_status(cookie), BreakpointStatus::Unknown);
    }
}

#[test]
fn clearing_the_last_breakpoint_restores_without_detach() {
    let engine = engine();
    let code = hello_fn();
    let pristine = snapshot(&code);

    let (hit, _) = hit_counter();
    let (error, _) = error_counter();
    let cookie = engine.create_raw_breakpoint(&code, 2, hit, error);
    engine.activate_breakpoint(cookie);
    assert_ne!(snapshot(&code), pristine);

    engine.clear_breakpoint(cookie);
    assert_eq!(snapshot(&code), pristine);
}

#[test]
fn generator_patching_restores_bitwise_too() {
    let engine = engine();
    let code = gen3_fn();
    let pristine = snapshot(&code);

    let mut cookies = Vec::new();
    for line in [1, 2, 3] {
        let (hit, _) = hit_counter();
        let (error, _) = error_counter();
        let cookie = engine.create_raw_breakpoint(&code, line, hit, error);
        engine.activate_breakpoint(cookie);
        cookies.push(cookie);
    }
    assert_ne!(snapshot(&code), pristine);

    engine.detach();
    assert_eq!(snapshot(&code), pristine);
}

#[test]
fn clear_from_inside_the_hit_callback() {
    let engine = engine();
    let code = hello_fn();
    let func = function(&code);
    let mut machine = Machine::new();

    // The hit callback clears its own breakpoint: the sentinel is disabled
    // and the code object re-patched while the patched bytecode is still
    // executing on this very stack. The replaced buffers are parked as
    // zombies, so the in-flight frame keeps running valid code.
    let cookie_slot = Rc::new(Cell::new(0i64));
    let hits = Rc::new(Cell::new(0usize));
    let hit = {
        let engine = engine.clone();
        let cookie_slot = cookie_slot.clone();
        let hits = hits.clone();
        Rc::new(move |_: &mut Machine, _: &mut Frame| {
            hits.set(hits.get() + 1);
            engine.clear_breakpoint(cookie_slot.get());
        })
    };
    let (error, _) = error_counter();

    let cookie = engine.create_raw_breakpoint(&code, 2, hit, error);
    cookie_slot.set(cookie);
    engine.activate_breakpoint(cookie);

    let result = machine.call_function(&func, vec![]).unwrap();
    assert_eq!(result.repr(), "'hello'");
    assert_eq!(hits.get(), 1);
    assert_eq!(engine.breakpoint_status(cookie), BreakpointStatus::Done);

    // Second call runs the restored bytecode, no further hits.
    let result = machine.call_function(&func, vec![]).unwrap();
    assert_eq!(result.repr(), "'hello'");
    assert_eq!(hits.get(), 1);
}

#[test]
fn detach_is_idempotent_and_safe_when_empty() {
    let engine = engine();
    engine.detach();
    engine.detach();

    let code = hello_fn();
    let (hit, _) = hit_counter();
    let (error, _) = error_counter();
    let cookie = engine.create_raw_breakpoint(&code, 2, hit, error);
    engine.activate_breakpoint(cookie);
    engine.detach();
    engine.detach();
    assert_eq!(engine.breakpoint_status(cookie), BreakpointStatus::Unknown);
}
