use crate::common::*;

use bytebreak::bytecode::opcode::*;
use bytebreak::runtime::{CodeBuilder, Machine, Value};
use bytebreak::{BreakpointEngine, BreakpointStatus, Dialect, EngineConfig};

const STATEMENTS: u32 = 20_000;

// def f(i):
//     n = 0
//     n = n + 1     (x 20_000, one statement per line)
//     if i % 2 == 0:
//         even = 1
//     else:
//         odd = 1
//     return n
//
// The body alone is ~160 KiB of bytecode, so the branches around the
// conditional already carry EXTENDED_ARG prefixes and every insertion has
// to renumber targets beyond the 16 bit range.
fn big_branchy_fn() -> (bytebreak::runtime::CodeRef, u32, u32) {
    let mut b = CodeBuilder::new("f");
    b.param("i");

    b.line(2);
    b.load_const(Value::Int(0)).store_fast("n");

    let one = b.add_const(Value::Int(1));
    let n = b.var_index("n");
    for s in 0..STATEMENTS {
        b.line(3 + s);
        b.emit_arg(LOAD_FAST, n)
            .emit_arg(LOAD_CONST, one)
            .emit(BINARY_ADD)
            .emit_arg(STORE_FAST, n);
    }

    let if_line = 3 + STATEMENTS;
    let even_line = if_line + 1;
    let odd_line = if_line + 2;
    let end_line = if_line + 3;

    let else_branch = b.new_label();
    let end = b.new_label();

    b.line(if_line);
    b.load_fast("i")
        .load_const(Value::Int(2))
        .emit(BINARY_MODULO)
        .load_const(Value::Int(0))
        .emit_arg(COMPARE_OP, 2);
    b.jump(POP_JUMP_IF_FALSE, else_branch);

    b.line(even_line);
    b.load_const(Value::Int(1)).store_fast("even");
    b.jump(JUMP_FORWARD, end);

    b.line(odd_line);
    b.bind(else_branch);
    b.load_const(Value::Int(1)).store_fast("odd");

    b.line(end_line);
    b.bind(end);
    b.load_fast("n").return_value();

    (b.build(), even_line, odd_line)
}

#[test]
fn breakpoints_survive_widening_over_64k_bytecode() {
    let engine =
        BreakpointEngine::with_isolated_quotas(Dialect::cpython37(), EngineConfig::default());
    let (code, even_line, odd_line) = big_branchy_fn();
    assert!(
        code.borrow().bytecode.len() > 0x1_0000,
        "scenario requires bytecode beyond the 16 bit offset range"
    );

    let func = function(&code);
    let mut machine = Machine::new();

    let (even_hit, even_hits) = hit_counter();
    let (error, even_errors) = error_counter();
    let even_cookie = engine.create_raw_breakpoint(&code, even_line, even_hit, error);
    engine.activate_breakpoint(even_cookie);
    assert_eq!(engine.breakpoint_status(even_cookie), BreakpointStatus::Active);

    let (odd_hit, odd_hits) = hit_counter();
    let (error, odd_errors) = error_counter();
    let odd_cookie = engine.create_raw_breakpoint(&code, odd_line, odd_hit, error);
    engine.activate_breakpoint(odd_cookie);
    assert_eq!(engine.breakpoint_status(odd_cookie), BreakpointStatus::Active);

    for i in 0..5 {
        let result = machine
            .call_function(&func, vec![Value::Int(i)])
            .unwrap();
        assert!(matches!(result, Value::Int(n) if n == STATEMENTS as i64));
    }

    assert_eq!(even_hits.get(), 3, "i in {{0, 2, 4}}");
    assert_eq!(odd_hits.get(), 2, "i in {{1, 3}}");
    assert_eq!(even_errors.get(), 0);
    assert_eq!(odd_errors.get(), 0);

    engine.clear_breakpoint(even_cookie);
    engine.clear_breakpoint(odd_cookie);

    // One more run after restore, unobserved.
    let result = machine
        .call_function(&func, vec![Value::Int(0)])
        .unwrap();
    assert!(matches!(result, Value::Int(n) if n == STATEMENTS as i64));
    assert_eq!(even_hits.get(), 3);
}
