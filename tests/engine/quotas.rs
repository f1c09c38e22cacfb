use crate::common::*;

use bytebreak::bytecode::opcode::*;
use bytebreak::condition::BreakpointEvent;
use bytebreak::runtime::{CodeBuilder, Machine, Value};
use bytebreak::{BreakpointEngine, Dialect, EngineConfig};
use serial_test::serial;

/// Condition spread over `lines` source lines; each line is one traced
/// event, so evaluating it costs at least `lines` quota tokens.
fn expensive_condition(lines: u32) -> bytebreak::runtime::CodeRef {
    let mut b = CodeBuilder::new("<condition>");
    for line in 1..=lines {
        b.line(line);
        b.load_const(Value::Int(line as i64)).emit(POP_TOP);
    }
    b.line(lines + 1);
    b.load_const(Value::Bool(true)).return_value();
    b.build()
}

#[test]
fn per_breakpoint_quota_trips_before_the_global_one() {
    // Global burst capacity 500 lines, per-breakpoint 250.
    let engine =
        BreakpointEngine::with_isolated_quotas(Dialect::cpython37(), EngineConfig::default());
    let code = hello_fn();
    let func = function(&code);
    let mut machine = Machine::new();

    let (sink, events) = recording_sink();
    let cookie = engine.create_breakpoint(&code, 2, Some(expensive_condition(300)), sink);
    engine.activate_breakpoint(cookie);

    machine.call_function(&func, vec![]).unwrap();
    assert_eq!(
        &*events.borrow(),
        &[BreakpointEvent::BreakpointConditionQuotaExceeded]
    );
}

#[test]
fn global_quota_trips_on_a_single_expensive_condition() {
    let engine =
        BreakpointEngine::with_isolated_quotas(Dialect::cpython37(), EngineConfig::default());
    let code = hello_fn();
    let func = function(&code);
    let mut machine = Machine::new();

    let (sink, events) = recording_sink();
    let cookie = engine.create_breakpoint(&code, 2, Some(expensive_condition(600)), sink);
    engine.activate_breakpoint(cookie);

    machine.call_function(&func, vec![]).unwrap();
    assert_eq!(
        &*events.borrow(),
        &[BreakpointEvent::GlobalConditionQuotaExceeded]
    );
}

#[test]
fn cheap_conditions_never_touch_the_quota_events() {
    let engine =
        BreakpointEngine::with_isolated_quotas(Dialect::cpython37(), EngineConfig::default());
    let code = hello_fn();
    let func = function(&code);
    let mut machine = Machine::new();

    let (sink, events) = recording_sink();
    let cookie = engine.create_breakpoint(&code, 2, Some(expensive_condition(3)), sink);
    engine.activate_breakpoint(cookie);

    for _ in 0..10 {
        machine.call_function(&func, vec![]).unwrap();
    }
    assert!(events.borrow().iter().all(|e| *e == BreakpointEvent::Hit));
    assert_eq!(events.borrow().len(), 10);
}

#[test]
fn dynamic_log_quota_limits_messages_and_bytes() {
    let config = EngineConfig {
        max_dynamic_log_rate: 2,          // burst capacity 10 messages
        max_dynamic_log_bytes_rate: 100,  // burst capacity 200 bytes
        ..EngineConfig::default()
    };
    let engine = BreakpointEngine::with_isolated_quotas(Dialect::cpython37(), config);

    // Oversized messages are always refused.
    assert!(!engine.apply_dynamic_log_quota(10_000));
    // Zero-length messages are refused outright.
    assert!(!engine.apply_dynamic_log_quota(0));

    let mut granted = 0;
    for _ in 0..64 {
        if engine.apply_dynamic_log_quota(10) {
            granted += 1;
        }
    }
    // 10 message tokens of burst; one was consumed by the oversized probe.
    assert!(granted <= 10);
    assert!(granted >= 5, "short bursts must be allowed");
}

#[test]
#[serial]
fn process_wide_engines_share_quota_buckets() {
    let first = BreakpointEngine::new(Dialect::cpython37(), EngineConfig::default());
    let second = BreakpointEngine::new(Dialect::cpython37(), EngineConfig::default());

    // Drain the shared message bucket through one engine; the other engine
    // observes the depletion.
    let mut last = true;
    for _ in 0..1024 {
        last = first.apply_dynamic_log_quota(1);
        if !last {
            break;
        }
    }
    assert!(!last, "the shared bucket must eventually deplete");
    assert!(!second.apply_dynamic_log_quota(1_000_000));
}
