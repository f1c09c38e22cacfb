use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use bytebreak::bytecode::opcode::*;
use bytebreak::condition::{BreakpointEvent, EventSink};
use bytebreak::runtime::{
    new_namespace, ClassObject, CodeBuilder, CodeRef, Frame, FunctionObject, InstanceObject,
    Machine, Namespace, SentinelHook, Value,
};

pub fn function(code: &CodeRef) -> Rc<FunctionObject> {
    function_with_globals(code, new_namespace())
}

pub fn function_with_globals(code: &CodeRef, globals: Namespace) -> Rc<FunctionObject> {
    Rc::new(FunctionObject {
        code: code.clone(),
        globals,
    })
}

/// `def hello(): return 'hello'` with the body on line 2.
pub fn hello_fn() -> CodeRef {
    let mut b = CodeBuilder::new("hello");
    b.line(2);
    b.load_const(Value::str("hello")).return_value();
    b.build()
}

/// `def greet(): print('Hello there')` with the body on line 2.
pub fn greet_fn() -> CodeRef {
    let mut b = CodeBuilder::new("greet");
    b.line(2);
    b.load_const(Value::str("Hello there")).emit(PRINT_EXPR);
    b.load_const(Value::None).return_value();
    b.build()
}

/// `def gen(): yield 'a'; yield 'b'; yield 'c'`, one yield per line.
pub fn gen3_fn() -> CodeRef {
    let mut b = CodeBuilder::new("gen");
    for (i, item) in ["a", "b", "c"].iter().enumerate() {
        b.line(i as u32 + 1);
        b.load_const(Value::str(*item)).emit(YIELD_VALUE).emit(POP_TOP);
    }
    b.line(4);
    b.load_const(Value::None).return_value();
    b.build()
}

/// Generator with one yield on line 1 followed by `fillers` single-line
/// filler statements; used to steer the bytecode length around the one-byte
/// trampoline argument limit.
pub fn padded_gen_fn(fillers: usize) -> CodeRef {
    let mut b = CodeBuilder::new("padded_gen");
    b.line(1);
    b.load_const(Value::str("x")).emit(YIELD_VALUE).emit(POP_TOP);
    for i in 0..fillers {
        b.line(i as u32 + 2);
        b.load_const(Value::Int(i as i64)).emit(POP_TOP);
    }
    b.line(fillers as u32 + 2);
    b.load_const(Value::None).return_value();
    b.build()
}

/// A sentinel hook counting its invocations.
pub fn hit_counter() -> (SentinelHook, Rc<Cell<usize>>) {
    let counter = Rc::new(Cell::new(0));
    let hook = {
        let counter = counter.clone();
        Rc::new(move |_: &mut Machine, _: &mut Frame| {
            counter.set(counter.get() + 1);
        })
    };
    (hook, counter)
}

/// An error hook counting its invocations.
pub fn error_counter() -> (Rc<dyn Fn()>, Rc<Cell<usize>>) {
    let counter = Rc::new(Cell::new(0));
    let hook = {
        let counter = counter.clone();
        Rc::new(move || counter.set(counter.get() + 1))
    };
    (hook, counter)
}

/// An event sink recording every surfaced breakpoint event.
pub fn recording_sink() -> (EventSink, Rc<RefCell<Vec<BreakpointEvent>>>) {
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink: EventSink = {
        let events = events.clone();
        Rc::new(move |event, _frame| {
            events.borrow_mut().push(event);
            Ok(())
        })
    };
    (sink, events)
}

/// Bitwise snapshot of the patchable attributes of a code object.
#[derive(Debug, PartialEq)]
pub struct CodeSnapshot {
    pub bytecode: Vec<u8>,
    pub const_reprs: Vec<String>,
    pub line_table: Option<Vec<u8>>,
    pub stack_size: u32,
}

pub fn snapshot(code: &CodeRef) -> CodeSnapshot {
    let code = code.borrow();
    CodeSnapshot {
        bytecode: (*code.bytecode).clone(),
        const_reprs: code.consts.iter().map(|c| c.repr()).collect(),
        line_table: code.line_table.as_ref().map(|t| (**t).clone()),
        stack_size: code.stack_size,
    }
}

/// Condition source `<name> <op> <int>` compiled in eval mode.
pub fn int_compare_condition(name: &str, op: u32, rhs: i64) -> CodeRef {
    let mut b = CodeBuilder::new("<condition>");
    b.load_name(name)
        .load_const(Value::Int(rhs))
        .emit_arg(COMPARE_OP, op)
        .return_value();
    b.build()
}

/// An instance `t` with `t.x == "self"` and a pure method
/// `work(self): return self.x + ' work'`.
pub fn worker_instance() -> Value {
    let mut b = CodeBuilder::new("work");
    b.param("self");
    b.load_fast("self")
        .load_attr("x")
        .load_const(Value::str(" work"))
        .emit(BINARY_ADD)
        .return_value();
    let work = function(&b.build());

    let class = Rc::new(ClassObject {
        name: "Worker".to_string(),
        methods: HashMap::from([("work".to_string(), work)]),
    });
    Value::Instance(Rc::new(InstanceObject {
        class,
        attrs: RefCell::new(HashMap::from([("x".to_string(), Value::str("self"))])),
    }))
}
