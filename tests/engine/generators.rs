use crate::common::*;

use bytebreak::bytecode::opcode::{POP_TOP, YIELD_VALUE};
use bytebreak::runtime::{CodeBuilder, Machine, Value};
use bytebreak::{BreakpointEngine, BreakpointStatus, Dialect, EngineConfig};

fn engine() -> BreakpointEngine {
    BreakpointEngine::with_isolated_quotas(Dialect::cpython37(), EngineConfig::default())
}

fn start(machine: &mut Machine, code: &bytebreak::runtime::CodeRef) -> Value {
    machine.call_function(&function(code), vec![]).unwrap()
}

#[test]
fn breakpoints_set_mid_iteration_skip_the_consumed_yield() {
    let engine = engine();
    let code = gen3_fn();
    let mut machine = Machine::new();

    let generator = start(&mut machine, &code);
    let Value::Generator(generator) = generator else {
        panic!("expected a generator");
    };

    // Consume 'a' before any breakpoint exists.
    let first = machine.resume(&generator).unwrap().unwrap();
    assert_eq!(first.repr(), "'a'");

    // Now set a breakpoint on each yield line.
    let mut counters = Vec::new();
    for line in [1, 2, 3] {
        let (hit, hits) = hit_counter();
        let (error, errors) = error_counter();
        let cookie = engine.create_raw_breakpoint(&code, line, hit, error);
        engine.activate_breakpoint(cookie);
        assert_eq!(engine.breakpoint_status(cookie), BreakpointStatus::Active);
        counters.push((hits, errors));
    }

    // The suspended frame resumes into the patched bytecode.
    let rest: Vec<String> = std::iter::from_fn(|| {
        machine.resume(&generator).unwrap().map(|v| v.repr())
    })
    .collect();
    assert_eq!(rest, vec!["'b'", "'c'"]);

    // The 'a' yield is already behind the resume offset: 0 hits. The other
    // two fire exactly once each.
    assert_eq!(counters[0].0.get(), 0);
    assert_eq!(counters[1].0.get(), 1);
    assert_eq!(counters[2].0.get(), 1);
    assert!(counters.iter().all(|(_, errors)| errors.get() == 0));
}

#[test]
fn fresh_generator_hits_every_yield() {
    let engine = engine();
    let code = gen3_fn();
    let mut machine = Machine::new();

    let mut counters = Vec::new();
    for line in [1, 2, 3] {
        let (hit, hits) = hit_counter();
        let (error, _) = error_counter();
        let cookie = engine.create_raw_breakpoint(&code, line, hit, error);
        engine.activate_breakpoint(cookie);
        counters.push(hits);
    }

    let Value::Generator(generator) = start(&mut machine, &code) else {
        panic!("expected a generator");
    };
    let items: Vec<String> = std::iter::from_fn(|| {
        machine.resume(&generator).unwrap().map(|v| v.repr())
    })
    .collect();

    assert_eq!(items, vec!["'a'", "'b'", "'c'"]);
    assert!(counters.iter().all(|hits| hits.get() == 1));
}

#[test]
fn append_patching_leaves_the_line_table_alone() {
    let engine = engine();
    let code = gen3_fn();
    let original_table = code.borrow().line_table.as_ref().map(|t| (**t).clone());

    let (hit, _) = hit_counter();
    let (error, _) = error_counter();
    let cookie = engine.create_raw_breakpoint(&code, 2, hit, error);
    engine.activate_breakpoint(cookie);

    let patched_table = code.borrow().line_table.as_ref().map(|t| (**t).clone());
    assert_eq!(original_table, patched_table);

    // The bytecode, however, grew by the appended block.
    assert!(code.borrow().bytecode.len() > 22);
    engine.clear_breakpoint(cookie);
}

#[test]
fn all_failed_patch_keeps_original_attributes() {
    let engine = engine();
    // A line starting on the yield itself can never be patched: the
    // trampoline would have to relocate the yield.
    let mut b = CodeBuilder::new("gen");
    b.line(1);
    b.load_const(Value::str("a"));
    b.line(2);
    b.emit(YIELD_VALUE).emit(POP_TOP);
    b.line(3);
    b.load_const(Value::None).return_value();
    let code = b.build();

    let pristine = snapshot(&code);

    let (hit, hits) = hit_counter();
    let (error, errors) = error_counter();
    let cookie = engine.create_raw_breakpoint(&code, 2, hit, error);
    engine.activate_breakpoint(cookie);

    assert_eq!(engine.breakpoint_status(cookie), BreakpointStatus::Error);
    assert_eq!(errors.get(), 1);

    // The whole batch failed: no sentinel constants, no stack bump, and
    // the bytecode content is the original's.
    assert_eq!(snapshot(&code), pristine);

    // The generator runs unobserved.
    let mut machine = Machine::new();
    let Value::Generator(generator) = start(&mut machine, &code) else {
        panic!("expected a generator");
    };
    assert_eq!(machine.resume(&generator).unwrap().unwrap().repr(), "'a'");
    assert_eq!(hits.get(), 0);

    engine.clear_breakpoint(cookie);
    assert_eq!(engine.breakpoint_status(cookie), BreakpointStatus::Done);
    assert_eq!(snapshot(&code), pristine);
}

#[test]
fn relocation_conflict_goes_to_error_and_recovers() {
    let engine = engine();
    // 60 filler statements put the generator at 250 bytes: any single
    // trampoline still fits a one-byte argument, but once a sibling's
    // appended block pushes the end past 255 the next trampoline needs an
    // EXTENDED_ARG and would have to relocate the yield itself.
    let code = padded_gen_fn(60);
    assert_eq!(code.borrow().bytecode.len(), 250);

    let (hit_a, _) = hit_counter();
    let (error_a, errors_a) = error_counter();
    let filler_line = 30;
    let cookie_a = engine.create_raw_breakpoint(&code, filler_line, hit_a, error_a);
    engine.activate_breakpoint(cookie_a);
    assert_eq!(engine.breakpoint_status(cookie_a), BreakpointStatus::Active);

    let (hit_b, _) = hit_counter();
    let (error_b, errors_b) = error_counter();
    let cookie_b = engine.create_raw_breakpoint(&code, 1, hit_b, error_b);
    engine.activate_breakpoint(cookie_b);

    // The joint patch cannot install the yield-line breakpoint.
    assert_eq!(engine.breakpoint_status(cookie_b), BreakpointStatus::Error);
    assert_eq!(engine.breakpoint_status(cookie_a), BreakpointStatus::Active);
    assert_eq!(errors_b.get(), 1);
    assert_eq!(errors_a.get(), 0);

    // Clearing the healthy sibling retries the errored one, which now fits.
    engine.clear_breakpoint(cookie_a);
    assert_eq!(engine.breakpoint_status(cookie_b), BreakpointStatus::Active);
    assert_eq!(engine.breakpoint_status(cookie_a), BreakpointStatus::Done);
    assert_eq!(errors_b.get(), 1);

    // And the recovered breakpoint actually fires.
    let mut machine = Machine::new();
    let Value::Generator(generator) = start(&mut machine, &code) else {
        panic!("expected a generator");
    };
    assert_eq!(machine.resume(&generator).unwrap().unwrap().repr(), "'x'");
}
