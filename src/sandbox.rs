//! Opcode-level sandbox for evaluating user expressions.
//!
//! Guarantees for the evaluated code: no observable program state changes,
//! no call to a native primitive outside the whitelist, and no unbounded
//! loop. Enforcement is a trace hook classifying every executed opcode and
//! every native call, with a line quota as the backstop.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use log::{info, warn};

use crate::bytecode::dialect::{Dialect, OpcodeGroup};
use crate::bytecode::{linetable, Instruction};
use crate::runtime::{
    code_id, CodeId, CodeRef, Machine, Namespace, PyError, TraceEvent, Value,
};

// Native functions considered immutable. Some of these call back into host
// code (like "repr"); the tracer stays installed and verifies those calls
// recursively.
const WHITELISTED_NATIVE_FUNCTIONS: &[&str] = &[
    "abs", "all", "any", "apply", "bin", "bool", "bytearray", "chr", "cmp", "coerce", "complex",
    "dict", "dir", "divmod", "enumerate", "filter", "float", "format", "frozenset", "getattr",
    "globals", "hasattr", "hash", "hex", "id", "int", "isinstance", "issubclass", "iter", "len",
    "list", "locals", "long", "map", "max", "min", "next", "object", "oct", "ord", "pow", "range",
    "reduce", "repr", "reversed", "round", "set", "slice", "sorted", "str", "sum", "super",
    "tuple", "type", "unichr", "unicode", "vars", "xrange", "zip",
];

// The host interpreter fires no trace event for calls into built-in slots
// like `__setattr__`. Best effort: refuse any code object whose names tuple
// mentions a mutation-carrying dunder. A determined user can still slip
// through; this guards against accidents, not adversaries.
const BLACKLISTED_CODE_NAMES: &[&str] = &[
    "__setattr__",
    "__delattr__",
    "__del__",
    "__new__",
    "__set__",
    "__delete__",
    "__call__",
    "__setitem__",
    "__delitem__",
    "__setslice__",
    "__delslice__",
];

/// Trace-hook state for one evaluation scope.
pub struct ImmutabilityTracer {
    dialect: &'static Dialect,
    max_expression_lines: u32,
    line_count: Cell<u32>,
    mutable_code_detected: Cell<bool>,
    verified_code_objects: RefCell<HashSet<CodeId>>,
}

impl ImmutabilityTracer {
    pub fn new(dialect: &'static Dialect, max_expression_lines: u32) -> Self {
        Self {
            dialect,
            max_expression_lines,
            line_count: Cell::new(0),
            mutable_code_detected: Cell::new(false),
            verified_code_objects: RefCell::new(HashSet::new()),
        }
    }

    pub fn line_count(&self) -> u32 {
        self.line_count.get()
    }

    pub fn is_mutable_code_detected(&self) -> bool {
        self.mutable_code_detected.get()
    }

    fn bump_line_count(&self) {
        self.line_count.set(self.line_count.get() + 1);
    }

    fn on_event(&self, event: &TraceEvent<'_>) -> Result<(), PyError> {
        match event {
            TraceEvent::Call { code } => self.verify_code_object(code),
            TraceEvent::Line { code, line } => {
                self.bump_line_count();
                self.process_code_line(code, *line);
            }
            TraceEvent::CCall { name } => {
                self.bump_line_count();
                self.process_native_call(name);
            }
            TraceEvent::Return
            | TraceEvent::Exception
            | TraceEvent::CReturn
            | TraceEvent::CException => {}
        }

        if self.line_count.get() > self.max_expression_lines {
            info!(target: "bytebreak", "expression evaluation exceeded the line quota");
            self.mutable_code_detected.set(true);
        }

        if self.mutable_code_detected.get() {
            return Err(mutable_code_exception());
        }
        Ok(())
    }

    fn verify_code_object(&self, code: &CodeRef) {
        let id = code_id(code);
        if self.verified_code_objects.borrow().contains(&id) {
            return;
        }

        let code = code.borrow();
        for name in &code.names {
            if BLACKLISTED_CODE_NAMES.contains(&name.as_str()) {
                self.mutable_code_detected.set(true);
                return;
            }
        }

        self.verified_code_objects.borrow_mut().insert(id);
    }

    /// Classify every opcode mapped to `line`.
    fn process_code_line(&self, code: &CodeRef, line: u32) {
        let code = code.borrow();
        let Some(table) = &code.line_table else {
            return;
        };

        let entries = match linetable::decode(
            self.dialect.line_format,
            table,
            code.first_line,
            code.bytecode.len(),
        ) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(target: "bytebreak", "corrupted line table during tracing: {e}");
                self.mutable_code_detected.set(true);
                return;
            }
        };

        for entry in entries {
            if entry.line == Some(line) && entry.start < entry.end {
                self.process_code_range(&code.bytecode, entry.start, entry.end.min(code.bytecode.len()));
                if self.mutable_code_detected.get() {
                    return;
                }
            }
        }
    }

    fn process_code_range(&self, bytecode: &[u8], start: usize, end: usize) {
        let mut it = start;
        while it < end {
            let instruction = match Instruction::read(self.dialect.encoding, bytecode, it) {
                Ok(instruction) => instruction,
                Err(_) => {
                    self.mutable_code_detected.set(true);
                    return;
                }
            };

            // A tight infinite loop compiles to an absolute jump onto
            // itself; it would neither fire another line event nor advance
            // the line counter, so it is caught statically here.
            if self.dialect.group(instruction.opcode) == OpcodeGroup::AbsoluteBranch
                && self.dialect.branch_target(it, &instruction) == it
            {
                info!(target: "bytebreak", "self-jump detected, aborting evaluation");
                self.mutable_code_detected.set(true);
                return;
            }

            if !self.dialect.is_immutable(instruction.opcode) {
                self.mutable_code_detected.set(true);
                return;
            }

            it += instruction.size;
        }
    }

    fn process_native_call(&self, name: &str) {
        if WHITELISTED_NATIVE_FUNCTIONS.contains(&name) {
            return;
        }
        info!(target: "bytebreak", "calling native function {name} is not allowed");
        self.mutable_code_detected.set(true);
    }
}

fn mutable_code_exception() -> PyError {
    PyError::system("Only immutable methods can be called from expressions")
}

/// Everything a caller needs to act on one sandboxed evaluation.
pub struct ImmutableOutcome {
    pub result: Result<Value, PyError>,
    pub line_count: u32,
    pub mutable_code_detected: bool,
}

/// Evaluate `code` against the given namespaces under an immutability scope.
///
/// The previously installed trace hook and the thread's tracing bit are
/// saved on entry and restored on exit, so nested evaluation from within a
/// trace callback still receives events.
pub fn evaluate_immutable(
    machine: &mut Machine,
    code: &CodeRef,
    globals: Namespace,
    locals: Option<HashMap<String, Value>>,
    max_expression_lines: u32,
) -> ImmutableOutcome {
    let tracer = Rc::new(ImmutabilityTracer::new(machine.dialect(), max_expression_lines));

    let hook = {
        let tracer = tracer.clone();
        Rc::new(move |event: &TraceEvent<'_>| tracer.on_event(event))
    };
    let previous_hook = machine.set_trace(Some(hook));
    let previous_tracing = machine.swap_tracing_flag(false);

    let result = machine.eval_code(code, globals, locals);

    machine.swap_tracing_flag(previous_tracing);
    machine.set_trace(previous_hook);

    ImmutableOutcome {
        result,
        line_count: tracer.line_count(),
        mutable_code_detected: tracer.is_mutable_code_detected(),
    }
}
