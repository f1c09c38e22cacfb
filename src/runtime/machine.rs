//! Reference eval loop for the wide dialect.
//!
//! Deliberately small: it executes what the compiler of the modeled host
//! emits for plain functions, generators, conditions and method calls, and
//! fires the trace events the sandbox subscribes to. Code attributes are
//! fetched afresh on every frame (re)entry, exactly like the host
//! interpreter: a generator resumed after its code object was patched
//! executes the patched bytecode, while a frame already inside the eval
//! loop keeps running the buffer it started with.

use std::collections::HashMap;
use std::rc::Rc;

use crate::bytecode::dialect::Dialect;
use crate::bytecode::linetable;
use crate::bytecode::opcode::*;
use crate::bytecode::Instruction;

use super::{
    default_builtins, thread_delivery_disabled, CodeRef, ExcKind, FunctionObject, GeneratorState,
    Namespace, PyError, SequenceIter, Value,
};

/// Events delivered to an installed trace hook.
pub enum TraceEvent<'a> {
    Call { code: &'a CodeRef },
    Line { code: &'a CodeRef, line: u32 },
    Return,
    Exception,
    CCall { name: &'a str },
    CReturn,
    CException,
}

/// A trace hook aborts evaluation by returning an error; the eval loop
/// unwinds it like any other host exception.
pub type TraceFn = Rc<dyn Fn(&TraceEvent<'_>) -> Result<(), PyError>>;

/// One activation record.
pub struct Frame {
    pub code: CodeRef,
    pub globals: Namespace,
    /// Name-lookup namespace for code compiled in eval mode.
    pub locals: Option<Namespace>,
    /// Fast local slots, parameters first.
    pub fast: Vec<Option<Value>>,
    pub stack: Vec<Value>,
    /// Byte offset of the next instruction; for a suspended generator this
    /// is the raw resume offset.
    pub pc: usize,
}

impl Frame {
    pub fn new(code: &CodeRef, globals: Namespace) -> Frame {
        let slots = code.borrow().varnames.len();
        Frame {
            code: code.clone(),
            globals,
            locals: None,
            fast: vec![None; slots],
            stack: Vec::new(),
            pc: 0,
        }
    }

    /// Snapshot of the frame's visible locals: named fast slots merged over
    /// the explicit locals namespace, the way the host interpreter
    /// materializes fast locals before handing a frame to debugger code.
    pub fn locals_dict(&self) -> HashMap<String, Value> {
        let code = self.code.borrow();
        let mut dict = self
            .locals
            .as_ref()
            .map(|l| l.borrow().clone())
            .unwrap_or_default();
        for (name, slot) in code.varnames.iter().zip(&self.fast) {
            if let Some(value) = slot {
                dict.insert(name.clone(), value.clone());
            }
        }
        dict
    }
}

enum FrameResult {
    Return(Value),
    Yield(Value),
}

pub struct Machine {
    dialect: &'static Dialect,
    pub builtins: HashMap<String, Value>,
    trace: Option<TraceFn>,
    /// Set while a trace callback runs, so the callback's own activity does
    /// not recurse into the hook.
    tracing: bool,
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine {
    pub fn new() -> Self {
        Self {
            dialect: Dialect::cpython37(),
            builtins: default_builtins(),
            trace: None,
            tracing: false,
        }
    }

    pub fn dialect(&self) -> &'static Dialect {
        self.dialect
    }

    /// Install a trace hook, returning the previously installed one.
    pub fn set_trace(&mut self, hook: Option<TraceFn>) -> Option<TraceFn> {
        std::mem::replace(&mut self.trace, hook)
    }

    /// Swap the "currently tracing" bit. A tracer entered from within a
    /// trace callback clears the bit on entry and restores it on exit so
    /// that nested evaluation still receives events.
    pub fn swap_tracing_flag(&mut self, value: bool) -> bool {
        std::mem::replace(&mut self.tracing, value)
    }

    fn emit(&mut self, event: TraceEvent<'_>) -> Result<(), PyError> {
        let Some(hook) = self.trace.clone() else {
            return Ok(());
        };
        if self.tracing {
            return Ok(());
        }
        self.tracing = true;
        let result = hook(&event);
        self.tracing = false;
        result
    }

    /// Call a function object with positional arguments.
    pub fn call_function(
        &mut self,
        func: &Rc<FunctionObject>,
        args: Vec<Value>,
    ) -> Result<Value, PyError> {
        let (is_generator, arg_count) = {
            let code = func.code.borrow();
            (code.is_generator(), code.arg_count)
        };
        if args.len() != arg_count {
            return Err(PyError::type_error(format!(
                "{}() takes {} arguments ({} given)",
                func.code.borrow().name,
                arg_count,
                args.len()
            )));
        }

        let mut frame = Frame::new(&func.code, func.globals.clone());
        for (slot, value) in frame.fast.iter_mut().zip(args) {
            *slot = Some(value);
        }

        self.emit(TraceEvent::Call { code: &func.code })?;

        if is_generator {
            return Ok(Value::Generator(Rc::new(std::cell::RefCell::new(
                GeneratorState {
                    frame,
                    started: false,
                    finished: false,
                },
            ))));
        }

        match self.run_frame(&mut frame)? {
            FrameResult::Return(value) => {
                self.emit(TraceEvent::Return)?;
                Ok(value)
            }
            FrameResult::Yield(_) => Err(PyError::system("yield outside of a generator")),
        }
    }

    /// Evaluate a code object compiled in eval mode against explicit
    /// namespaces (the shape conditions are evaluated in).
    pub fn eval_code(
        &mut self,
        code: &CodeRef,
        globals: Namespace,
        locals: Option<HashMap<String, Value>>,
    ) -> Result<Value, PyError> {
        let mut frame = Frame::new(code, globals);
        frame.locals = Some(Rc::new(std::cell::RefCell::new(locals.unwrap_or_default())));

        self.emit(TraceEvent::Call { code })?;
        match self.run_frame(&mut frame)? {
            FrameResult::Return(value) => {
                self.emit(TraceEvent::Return)?;
                Ok(value)
            }
            FrameResult::Yield(_) => Err(PyError::system("yield outside of a generator")),
        }
    }

    /// Drive a generator to its next yield. `None` signals exhaustion.
    pub fn resume(
        &mut self,
        gen: &Rc<std::cell::RefCell<GeneratorState>>,
    ) -> Result<Option<Value>, PyError> {
        let mut state = gen.borrow_mut();
        if state.finished {
            return Ok(None);
        }
        if state.started {
            // The value sent into the paused yield expression.
            state.frame.stack.push(Value::None);
        } else {
            state.started = true;
        }

        let state = &mut *state;
        match self.run_frame(&mut state.frame) {
            Ok(FrameResult::Yield(value)) => Ok(Some(value)),
            Ok(FrameResult::Return(_)) => {
                state.finished = true;
                Ok(None)
            }
            Err(e) => {
                state.finished = true;
                self.emit(TraceEvent::Exception)?;
                Err(e)
            }
        }
    }

    fn run_frame(&mut self, frame: &mut Frame) -> Result<FrameResult, PyError> {
        let encoding = self.dialect.encoding;

        // Re-fetch code attributes on every entry; see the module docs.
        let (bytecode, consts, names, line_starts) = {
            let code = frame.code.borrow();
            let mut line_starts = HashMap::new();
            if let Some(table) = &code.line_table {
                let entries = linetable::decode(
                    self.dialect.line_format,
                    table,
                    code.first_line,
                    code.bytecode.len(),
                )
                .map_err(|e| PyError::system(format!("corrupted line table: {e}")))?;
                for entry in entries {
                    if let Some(line) = entry.line {
                        line_starts.insert(entry.start, line);
                    }
                }
            }
            (
                code.bytecode.clone(),
                code.consts.clone(),
                code.names.clone(),
                line_starts,
            )
        };

        loop {
            let offset = frame.pc;
            if offset >= bytecode.len() {
                return Err(PyError::system("execution fell off the end of the bytecode"));
            }

            if self.trace.is_some() {
                if let Some(&line) = line_starts.get(&offset) {
                    self.emit(TraceEvent::Line {
                        code: &frame.code,
                        line,
                    })?;
                }
            }

            let instruction = Instruction::read(encoding, &bytecode, offset)
                .map_err(|e| PyError::system(format!("bad instruction: {e}")))?;
            frame.pc = offset + instruction.size;
            let arg = instruction.arg;

            match instruction.opcode {
                NOP => {}
                POP_TOP => {
                    pop(frame)?;
                }
                DUP_TOP => {
                    let top = peek(frame)?.clone();
                    frame.stack.push(top);
                }
                ROT_TWO => {
                    let len = frame.stack.len();
                    if len < 2 {
                        return Err(stack_underflow());
                    }
                    frame.stack.swap(len - 1, len - 2);
                }

                LOAD_CONST => {
                    let value = consts
                        .get(arg as usize)
                        .cloned()
                        .ok_or_else(|| PyError::system("constant index out of range"))?;
                    frame.stack.push(value);
                }
                LOAD_FAST => {
                    let value = frame
                        .fast
                        .get(arg as usize)
                        .cloned()
                        .flatten()
                        .ok_or_else(|| {
                            PyError::name_error(&fast_name(frame, arg))
                        })?;
                    frame.stack.push(value);
                }
                STORE_FAST => {
                    let value = pop(frame)?;
                    let slot = frame
                        .fast
                        .get_mut(arg as usize)
                        .ok_or_else(|| PyError::system("fast slot out of range"))?;
                    *slot = Some(value);
                }
                DELETE_FAST => {
                    if let Some(slot) = frame.fast.get_mut(arg as usize) {
                        *slot = None;
                    }
                }

                LOAD_GLOBAL => {
                    let name = name_at(&names, arg)?;
                    let value = frame
                        .globals
                        .borrow()
                        .get(&name)
                        .cloned()
                        .or_else(|| self.builtins.get(&name).cloned())
                        .ok_or_else(|| PyError::name_error(&name))?;
                    frame.stack.push(value);
                }
                STORE_GLOBAL => {
                    let name = name_at(&names, arg)?;
                    let value = pop(frame)?;
                    frame.globals.borrow_mut().insert(name, value);
                }
                DELETE_GLOBAL => {
                    let name = name_at(&names, arg)?;
                    frame.globals.borrow_mut().remove(&name);
                }
                LOAD_NAME => {
                    let name = name_at(&names, arg)?;
                    let from_locals = frame
                        .locals
                        .as_ref()
                        .and_then(|l| l.borrow().get(&name).cloned());
                    let value = from_locals
                        .or_else(|| frame.globals.borrow().get(&name).cloned())
                        .or_else(|| self.builtins.get(&name).cloned())
                        .ok_or_else(|| PyError::name_error(&name))?;
                    frame.stack.push(value);
                }
                STORE_NAME => {
                    let name = name_at(&names, arg)?;
                    let value = pop(frame)?;
                    match &frame.locals {
                        Some(locals) => {
                            locals.borrow_mut().insert(name, value);
                        }
                        None => {
                            frame.globals.borrow_mut().insert(name, value);
                        }
                    }
                }

                LOAD_ATTR => {
                    let name = name_at(&names, arg)?;
                    let object = pop(frame)?;
                    frame.stack.push(load_attr(&object, &name)?);
                }
                STORE_ATTR => {
                    let name = name_at(&names, arg)?;
                    let object = pop(frame)?;
                    let value = pop(frame)?;
                    match object {
                        Value::Instance(inst) => {
                            inst.attrs.borrow_mut().insert(name, value);
                        }
                        other => {
                            return Err(PyError::type_error(format!(
                                "cannot set attributes on '{}'",
                                other.type_name()
                            )))
                        }
                    }
                }

                UNARY_NEGATIVE => {
                    let value = pop(frame)?;
                    frame.stack.push(match value {
                        Value::Int(i) => Value::Int(-i),
                        Value::Float(f) => Value::Float(-f),
                        other => {
                            return Err(PyError::type_error(format!(
                                "bad operand type for unary -: '{}'",
                                other.type_name()
                            )))
                        }
                    });
                }
                UNARY_NOT => {
                    let value = pop(frame)?;
                    frame.stack.push(Value::Bool(!value.is_truthy()));
                }

                BINARY_ADD | BINARY_SUBTRACT | BINARY_MULTIPLY | BINARY_MODULO
                | BINARY_TRUE_DIVIDE | BINARY_FLOOR_DIVIDE | INPLACE_ADD | INPLACE_SUBTRACT
                | INPLACE_MULTIPLY | INPLACE_MODULO | INPLACE_TRUE_DIVIDE
                | INPLACE_FLOOR_DIVIDE => {
                    let rhs = pop(frame)?;
                    let lhs = pop(frame)?;
                    frame.stack.push(binary_op(instruction.opcode, lhs, rhs)?);
                }
                BINARY_SUBSCR => {
                    let index = pop(frame)?;
                    let object = pop(frame)?;
                    frame.stack.push(subscript(&object, &index)?);
                }
                STORE_SUBSCR => {
                    let index = pop(frame)?;
                    let object = pop(frame)?;
                    let value = pop(frame)?;
                    store_subscript(&object, &index, value)?;
                }

                COMPARE_OP => {
                    let rhs = pop(frame)?;
                    let lhs = pop(frame)?;
                    frame.stack.push(Value::Bool(compare(arg, &lhs, &rhs)?));
                }

                BUILD_TUPLE => {
                    let items = pop_n(frame, arg as usize)?;
                    frame.stack.push(Value::Tuple(Rc::new(items)));
                }
                BUILD_LIST => {
                    let items = pop_n(frame, arg as usize)?;
                    frame
                        .stack
                        .push(Value::List(Rc::new(std::cell::RefCell::new(items))));
                }

                GET_ITER => {
                    let value = pop(frame)?;
                    frame.stack.push(make_iter(value)?);
                }
                FOR_ITER => {
                    let next = match peek(frame)?.clone() {
                        Value::Iter(iter) => {
                            let mut iter = iter.borrow_mut();
                            if iter.index < iter.items.len() {
                                iter.index += 1;
                                Some(iter.items[iter.index - 1].clone())
                            } else {
                                None
                            }
                        }
                        Value::Generator(gen) => self.resume(&gen)?,
                        other => {
                            return Err(PyError::type_error(format!(
                                "'{}' object is not an iterator",
                                other.type_name()
                            )))
                        }
                    };
                    match next {
                        Some(value) => frame.stack.push(value),
                        None => {
                            pop(frame)?;
                            frame.pc = offset
                                + instruction.size
                                + arg as usize * self.dialect.branch_unit_scale();
                        }
                    }
                }

                JUMP_ABSOLUTE => {
                    frame.pc = arg as usize * self.dialect.branch_unit_scale();
                }
                JUMP_FORWARD => {
                    frame.pc = offset
                        + instruction.size
                        + arg as usize * self.dialect.branch_unit_scale();
                }
                POP_JUMP_IF_FALSE => {
                    if !pop(frame)?.is_truthy() {
                        frame.pc = arg as usize * self.dialect.branch_unit_scale();
                    }
                }
                POP_JUMP_IF_TRUE => {
                    if pop(frame)?.is_truthy() {
                        frame.pc = arg as usize * self.dialect.branch_unit_scale();
                    }
                }

                CALL_FUNCTION => {
                    let args = pop_n(frame, arg as usize)?;
                    let callee = pop(frame)?;
                    let result = self.call_value(callee, args, frame)?;
                    frame.stack.push(result);
                }

                PRINT_EXPR => {
                    // The interactive printer; the value is simply consumed.
                    pop(frame)?;
                }
                RAISE_VARARGS => {
                    let message = if arg >= 1 {
                        pop(frame)?.repr()
                    } else {
                        "exception re-raised".to_string()
                    };
                    return Err(PyError::new(ExcKind::Value, message));
                }

                RETURN_VALUE => {
                    return Ok(FrameResult::Return(pop(frame)?));
                }
                YIELD_VALUE => {
                    return Ok(FrameResult::Yield(pop(frame)?));
                }

                other => {
                    return Err(PyError::system(format!(
                        "opcode {other} is not supported by the reference runtime"
                    )));
                }
            }
        }
    }

    fn call_value(
        &mut self,
        callee: Value,
        args: Vec<Value>,
        frame: &mut Frame,
    ) -> Result<Value, PyError> {
        match callee {
            Value::Function(func) => self.call_function(&func, args),
            Value::BoundMethod(receiver, func) => {
                let mut full_args = Vec::with_capacity(args.len() + 1);
                full_args.push(Value::Instance(receiver));
                full_args.extend(args);
                self.call_function(&func, full_args)
            }
            Value::Native(native) => {
                self.emit(TraceEvent::CCall { name: native.name })?;
                match (native.func)(&args) {
                    Ok(value) => {
                        self.emit(TraceEvent::CReturn)?;
                        Ok(value)
                    }
                    Err(e) => {
                        self.emit(TraceEvent::CException)?;
                        Err(e)
                    }
                }
            }
            Value::Sentinel(sentinel) => {
                if !thread_delivery_disabled() {
                    sentinel.invoke(self, frame);
                }
                Ok(Value::None)
            }
            Value::Class(class) => Ok(Value::Instance(Rc::new(super::InstanceObject {
                class,
                attrs: std::cell::RefCell::new(HashMap::new()),
            }))),
            other => Err(PyError::type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }
}

fn stack_underflow() -> PyError {
    PyError::system("value stack underflow")
}

fn pop(frame: &mut Frame) -> Result<Value, PyError> {
    frame.stack.pop().ok_or_else(stack_underflow)
}

fn peek(frame: &Frame) -> Result<&Value, PyError> {
    frame.stack.last().ok_or_else(stack_underflow)
}

fn pop_n(frame: &mut Frame, n: usize) -> Result<Vec<Value>, PyError> {
    if frame.stack.len() < n {
        return Err(stack_underflow());
    }
    Ok(frame.stack.split_off(frame.stack.len() - n))
}

fn name_at(names: &[String], arg: u32) -> Result<String, PyError> {
    names
        .get(arg as usize)
        .cloned()
        .ok_or_else(|| PyError::system("name index out of range"))
}

fn fast_name(frame: &Frame, arg: u32) -> String {
    frame
        .code
        .borrow()
        .varnames
        .get(arg as usize)
        .cloned()
        .unwrap_or_else(|| format!("<slot {arg}>"))
}

fn load_attr(object: &Value, name: &str) -> Result<Value, PyError> {
    match object {
        Value::Instance(inst) => {
            if let Some(value) = inst.attrs.borrow().get(name) {
                return Ok(value.clone());
            }
            if let Some(method) = inst.class.methods.get(name) {
                return Ok(Value::BoundMethod(inst.clone(), method.clone()));
            }
            Err(PyError::attribute_error(name))
        }
        _ => Err(PyError::attribute_error(name)),
    }
}

fn subscript(object: &Value, index: &Value) -> Result<Value, PyError> {
    let i = match index {
        Value::Int(i) => *i,
        other => {
            return Err(PyError::type_error(format!(
                "indices must be integers, not '{}'",
                other.type_name()
            )))
        }
    };
    let items: Vec<Value> = match object {
        Value::Tuple(t) => (**t).clone(),
        Value::List(l) => l.borrow().clone(),
        other => {
            return Err(PyError::type_error(format!(
                "'{}' object is not subscriptable",
                other.type_name()
            )))
        }
    };
    let len = items.len() as i64;
    let i = if i < 0 { i + len } else { i };
    if i < 0 || i >= len {
        return Err(PyError::new(ExcKind::Index, "index out of range"));
    }
    Ok(items[i as usize].clone())
}

fn store_subscript(object: &Value, index: &Value, value: Value) -> Result<(), PyError> {
    let (Value::List(list), Value::Int(i)) = (object, index) else {
        return Err(PyError::type_error("item assignment is not supported here"));
    };
    let mut items = list.borrow_mut();
    let len = items.len() as i64;
    let i = if *i < 0 { *i + len } else { *i };
    if i < 0 || i >= len {
        return Err(PyError::new(ExcKind::Index, "assignment index out of range"));
    }
    items[i as usize] = value;
    Ok(())
}

fn make_iter(value: Value) -> Result<Value, PyError> {
    Ok(match value {
        Value::Generator(_) | Value::Iter(_) => value,
        Value::List(l) => Value::Iter(Rc::new(std::cell::RefCell::new(SequenceIter {
            items: l.borrow().clone(),
            index: 0,
        }))),
        Value::Tuple(t) => Value::Iter(Rc::new(std::cell::RefCell::new(SequenceIter {
            items: (*t).clone(),
            index: 0,
        }))),
        other => {
            return Err(PyError::type_error(format!(
                "'{}' object is not iterable",
                other.type_name()
            )))
        }
    })
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        Value::Bool(b) => Some(*b as u8 as f64),
        _ => None,
    }
}

fn binary_op(opcode: u8, lhs: Value, rhs: Value) -> Result<Value, PyError> {
    // Integer pairs stay integers; everything numeric else goes float.
    if let (Value::Int(a), Value::Int(b)) = (&lhs, &rhs) {
        let (a, b) = (*a, *b);
        return Ok(match opcode {
            BINARY_ADD | INPLACE_ADD => Value::Int(a.wrapping_add(b)),
            BINARY_SUBTRACT | INPLACE_SUBTRACT => Value::Int(a.wrapping_sub(b)),
            BINARY_MULTIPLY | INPLACE_MULTIPLY => Value::Int(a.wrapping_mul(b)),
            BINARY_MODULO | INPLACE_MODULO => {
                if b == 0 {
                    return Err(PyError::zero_division());
                }
                Value::Int(a.rem_euclid(b))
            }
            BINARY_FLOOR_DIVIDE | INPLACE_FLOOR_DIVIDE => {
                if b == 0 {
                    return Err(PyError::zero_division());
                }
                Value::Int(a.div_euclid(b))
            }
            BINARY_TRUE_DIVIDE | INPLACE_TRUE_DIVIDE => {
                if b == 0 {
                    return Err(PyError::zero_division());
                }
                Value::Float(a as f64 / b as f64)
            }
            _ => unreachable!("not a binary opcode"),
        });
    }

    if let (Value::Str(a), Value::Str(b)) = (&lhs, &rhs) {
        if matches!(opcode, BINARY_ADD | INPLACE_ADD) {
            return Ok(Value::str(format!("{a}{b}")));
        }
    }

    if let (Some(a), Some(b)) = (numeric(&lhs), numeric(&rhs)) {
        return Ok(match opcode {
            BINARY_ADD | INPLACE_ADD => Value::Float(a + b),
            BINARY_SUBTRACT | INPLACE_SUBTRACT => Value::Float(a - b),
            BINARY_MULTIPLY | INPLACE_MULTIPLY => Value::Float(a * b),
            BINARY_MODULO | INPLACE_MODULO => {
                if b == 0.0 {
                    return Err(PyError::zero_division());
                }
                Value::Float(a % b)
            }
            BINARY_FLOOR_DIVIDE | INPLACE_FLOOR_DIVIDE => {
                if b == 0.0 {
                    return Err(PyError::zero_division());
                }
                Value::Float((a / b).floor())
            }
            BINARY_TRUE_DIVIDE | INPLACE_TRUE_DIVIDE => {
                if b == 0.0 {
                    return Err(PyError::zero_division());
                }
                Value::Float(a / b)
            }
            _ => unreachable!("not a binary opcode"),
        });
    }

    Err(PyError::type_error(format!(
        "unsupported operand types: '{}' and '{}'",
        lhs.type_name(),
        rhs.type_name()
    )))
}

// Comparison operator encoding of COMPARE_OP arguments.
const CMP_LT: u32 = 0;
const CMP_LE: u32 = 1;
const CMP_EQ: u32 = 2;
const CMP_NE: u32 = 3;
const CMP_GT: u32 = 4;
const CMP_GE: u32 = 5;

fn compare(op: u32, lhs: &Value, rhs: &Value) -> Result<bool, PyError> {
    if let (Value::Str(a), Value::Str(b)) = (lhs, rhs) {
        return Ok(match op {
            CMP_LT => a < b,
            CMP_LE => a <= b,
            CMP_EQ => a == b,
            CMP_NE => a != b,
            CMP_GT => a > b,
            CMP_GE => a >= b,
            _ => return Err(PyError::system("unsupported comparison")),
        });
    }

    let (Some(a), Some(b)) = (numeric(lhs), numeric(rhs)) else {
        // Mixed or non-ordered types: only (in)equality is meaningful.
        return match op {
            CMP_EQ => Ok(false),
            CMP_NE => Ok(true),
            _ => Err(PyError::type_error(format!(
                "'{}' and '{}' are not orderable",
                lhs.type_name(),
                rhs.type_name()
            ))),
        };
    };

    Ok(match op {
        CMP_LT => a < b,
        CMP_LE => a <= b,
        CMP_EQ => a == b,
        CMP_NE => a != b,
        CMP_GT => a > b,
        CMP_GE => a >= b,
        _ => return Err(PyError::system("unsupported comparison")),
    })
}
