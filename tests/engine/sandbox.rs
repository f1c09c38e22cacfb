use crate::common::*;

use bytebreak::bytecode::opcode::*;
use bytebreak::condition::BreakpointEvent;
use bytebreak::error::Error;
use bytebreak::runtime::{CodeBuilder, Frame, Machine, Value};
use bytebreak::{BreakpointEngine, Dialect, EngineConfig};

fn engine() -> BreakpointEngine {
    BreakpointEngine::with_isolated_quotas(Dialect::cpython37(), EngineConfig::default())
}

fn host_frame(globals: bytebreak::runtime::Namespace) -> Frame {
    let mut b = CodeBuilder::new("frame");
    b.load_const(Value::None).return_value();
    Frame::new(&b.build(), globals)
}

#[test]
fn call_immutable_returns_pure_results() {
    let engine = engine();
    let mut machine = Machine::new();
    let frame = host_frame(bytebreak::runtime::new_namespace());

    let mut b = CodeBuilder::new("<expr>");
    b.load_const(Value::Int(6))
        .load_const(Value::Int(7))
        .emit(BINARY_MULTIPLY)
        .return_value();

    let result = engine.call_immutable(&mut machine, &frame, &b.build()).unwrap();
    assert!(matches!(result, Value::Int(42)));
}

#[test]
fn call_immutable_passes_host_exceptions_through() {
    let engine = engine();
    let mut machine = Machine::new();
    let frame = host_frame(bytebreak::runtime::new_namespace());

    let mut b = CodeBuilder::new("<expr>");
    b.load_const(Value::Int(1))
        .load_const(Value::Int(0))
        .emit(BINARY_TRUE_DIVIDE)
        .return_value();

    match engine.call_immutable(&mut machine, &frame, &b.build()) {
        Err(Error::Python(e)) => assert_eq!(e.to_string(), "ZeroDivisionError: division by zero"),
        other => panic!("expected a host exception, got {other:?}"),
    }
}

#[test]
fn call_immutable_rejects_global_mutation() {
    let engine = engine();
    let mut machine = Machine::new();
    let globals = bytebreak::runtime::new_namespace();
    let frame = host_frame(globals.clone());

    let mut b = CodeBuilder::new("<expr>");
    b.load_const(Value::Int(9)).store_global("x");
    b.load_const(Value::None).return_value();

    assert!(matches!(
        engine.call_immutable(&mut machine, &frame, &b.build()),
        Err(Error::MutableCode)
    ));
    assert!(
        globals.borrow().get("x").is_none(),
        "the store must not have executed"
    );
}

#[test]
fn call_immutable_rejects_file_io() {
    let engine = engine();
    let mut machine = Machine::new();
    let frame = host_frame(bytebreak::runtime::new_namespace());

    let mut b = CodeBuilder::new("<expr>");
    b.load_name("open")
        .load_const(Value::str("/tmp/f"))
        .call_function(1)
        .return_value();

    assert!(matches!(
        engine.call_immutable(&mut machine, &frame, &b.build()),
        Err(Error::MutableCode)
    ));
}

#[test]
fn call_immutable_rejects_tight_loops() {
    let engine = engine();
    let mut machine = Machine::new();
    let frame = host_frame(bytebreak::runtime::new_namespace());

    let mut b = CodeBuilder::new("<expr>");
    let top = b.new_label();
    b.bind(top);
    b.jump(JUMP_ABSOLUTE, top);
    b.load_const(Value::None).return_value();

    assert!(matches!(
        engine.call_immutable(&mut machine, &frame, &b.build()),
        Err(Error::MutableCode)
    ));
}

#[test]
fn mutable_condition_surfaces_an_event_not_a_hit() {
    let engine = engine();
    let code = hello_fn();
    let func = function(&code);
    let mut machine = Machine::new();

    let mut c = CodeBuilder::new("<condition>");
    c.load_const(Value::Int(9)).store_global("x");
    c.load_const(Value::Bool(true)).return_value();

    let (sink, events) = recording_sink();
    let cookie = engine.create_breakpoint(&code, 2, Some(c.build()), sink);
    engine.activate_breakpoint(cookie);

    let result = machine.call_function(&func, vec![]).unwrap();
    assert_eq!(result.repr(), "'hello'");
    assert_eq!(
        &*events.borrow(),
        &[BreakpointEvent::ConditionExpressionMutable]
    );
}

#[test]
fn failing_condition_suppresses_the_hit_silently() {
    let engine = engine();
    let code = hello_fn();
    let func = function(&code);
    let mut machine = Machine::new();

    // 1 / 0: a host exception during evaluation, not a sandbox abort.
    let mut c = CodeBuilder::new("<condition>");
    c.load_const(Value::Int(1))
        .load_const(Value::Int(0))
        .emit(BINARY_TRUE_DIVIDE)
        .return_value();

    let (sink, events) = recording_sink();
    let cookie = engine.create_breakpoint(&code, 2, Some(c.build()), sink);
    engine.activate_breakpoint(cookie);

    machine.call_function(&func, vec![]).unwrap();
    assert!(events.borrow().is_empty());
}
