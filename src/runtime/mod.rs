//! Model of the host-interpreter interface the engine patches against.
//!
//! The engine only ever touches a code object through the attributes below
//! (bytecode, constants, line table, stack size) and drives evaluation
//! through [`Machine`]. The reference eval loop implements the wide dialect
//! and is what integration tests execute patched functions on; a real
//! embedding would back the same surface with its interpreter.

pub mod builder;
pub mod machine;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

pub use builder::CodeBuilder;
pub use machine::{Frame, Machine, TraceEvent};

/// Host-level exception kinds surfaced by evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum ExcKind {
    #[strum(serialize = "SystemError")]
    System,
    #[strum(serialize = "TypeError")]
    Type,
    #[strum(serialize = "NameError")]
    Name,
    #[strum(serialize = "AttributeError")]
    Attribute,
    #[strum(serialize = "IndexError")]
    Index,
    #[strum(serialize = "ZeroDivisionError")]
    ZeroDivision,
    #[strum(serialize = "ValueError")]
    Value,
    #[strum(serialize = "IOError")]
    Io,
}

/// A host exception: evaluation unwinds back to the caller carrying one.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct PyError {
    pub kind: ExcKind,
    pub message: String,
}

impl PyError {
    pub fn new(kind: ExcKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::new(ExcKind::System, message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ExcKind::Type, message)
    }

    pub fn name_error(name: &str) -> Self {
        Self::new(ExcKind::Name, format!("name '{name}' is not defined"))
    }

    pub fn attribute_error(name: &str) -> Self {
        Self::new(ExcKind::Attribute, format!("no attribute '{name}'"))
    }

    pub fn zero_division() -> Self {
        Self::new(ExcKind::ZeroDivision, "division by zero")
    }
}

/// Generator flag in [`CodeObject::flags`].
pub const CO_GENERATOR: u32 = 0x20;

/// Executable code of one function: the four patchable attributes plus the
/// symbol tables the eval loop and the sandbox need.
///
/// The patchable attributes are reference counted so that replaced buffers
/// stay alive for any frame still executing them; the registry additionally
/// parks replaced references until no frame can observe them.
pub struct CodeObject {
    pub name: String,
    pub bytecode: Rc<Vec<u8>>,
    pub consts: Rc<Vec<Value>>,
    /// Global/attribute names referenced by the code.
    pub names: Vec<String>,
    /// Fast local slots; parameters first.
    pub varnames: Vec<String>,
    pub line_table: Option<Rc<Vec<u8>>>,
    pub first_line: u32,
    pub stack_size: u32,
    pub arg_count: usize,
    pub flags: u32,
}

impl CodeObject {
    pub fn is_generator(&self) -> bool {
        self.flags & CO_GENERATOR != 0
    }
}

impl fmt::Debug for CodeObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeObject")
            .field("name", &self.name)
            .field("bytecode_len", &self.bytecode.len())
            .field("consts", &self.consts.len())
            .finish()
    }
}

/// Shared handle to a code object.
pub type CodeRef = Rc<RefCell<CodeObject>>;

/// Identity of a code object (stable for the lifetime of the handle).
pub type CodeId = usize;

pub fn code_id(code: &CodeRef) -> CodeId {
    Rc::as_ptr(code) as CodeId
}

pub type Namespace = Rc<RefCell<HashMap<String, Value>>>;

pub fn new_namespace() -> Namespace {
    Rc::new(RefCell::new(HashMap::new()))
}

/// Function defined in host code.
pub struct FunctionObject {
    pub code: CodeRef,
    pub globals: Namespace,
}

/// Class with plain methods; enough surface for attribute dispatch.
pub struct ClassObject {
    pub name: String,
    pub methods: HashMap<String, Rc<FunctionObject>>,
}

pub struct InstanceObject {
    pub class: Rc<ClassObject>,
    pub attrs: RefCell<HashMap<String, Value>>,
}

/// Native callable; the name is what the sandbox whitelist matches on.
pub struct NativeFunction {
    pub name: &'static str,
    pub func: fn(&[Value]) -> Result<Value, PyError>,
}

/// State of a suspended generator. The frame stores the raw byte offset of
/// the suspension point, which is why patched code around a yield must keep
/// that offset stable.
pub struct GeneratorState {
    pub frame: Frame,
    pub started: bool,
    pub finished: bool,
}

pub struct SequenceIter {
    pub items: Vec<Value>,
    pub index: usize,
}

/// Runtime value.
#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<String>),
    Tuple(Rc<Vec<Value>>),
    List(Rc<RefCell<Vec<Value>>>),
    Function(Rc<FunctionObject>),
    BoundMethod(Rc<InstanceObject>, Rc<FunctionObject>),
    Class(Rc<ClassObject>),
    Instance(Rc<InstanceObject>),
    Native(Rc<NativeFunction>),
    Sentinel(Rc<Sentinel>),
    Generator(Rc<RefCell<GeneratorState>>),
    Iter(Rc<RefCell<SequenceIter>>),
}

impl Value {
    pub fn str(s: impl Into<String>) -> Value {
        Value::Str(Rc::new(s.into()))
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Tuple(t) => !t.is_empty(),
            Value::List(l) => !l.borrow().is_empty(),
            _ => true,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Tuple(_) => "tuple",
            Value::List(_) => "list",
            Value::Function(_) => "function",
            Value::BoundMethod(..) => "method",
            Value::Class(_) => "type",
            Value::Instance(_) => "object",
            Value::Native(_) => "builtin_function_or_method",
            Value::Sentinel(_) => "builtin_function_or_method",
            Value::Generator(_) => "generator",
            Value::Iter(_) => "iterator",
        }
    }

    pub fn repr(&self) -> String {
        match self {
            Value::None => "None".to_string(),
            Value::Bool(true) => "True".to_string(),
            Value::Bool(false) => "False".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Str(s) => format!("'{s}'"),
            Value::Tuple(items) => {
                let inner: Vec<String> = items.iter().map(|v| v.repr()).collect();
                format!("({})", inner.join(", "))
            }
            Value::List(items) => {
                let inner: Vec<String> = items.borrow().iter().map(|v| v.repr()).collect();
                format!("[{}]", inner.join(", "))
            }
            Value::Instance(i) => format!("<{} object>", i.class.name),
            other => format!("<{}>", other.type_name()),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr())
    }
}

/// Hit hook invoked by a sentinel from patched bytecode.
pub type SentinelHook = Rc<dyn Fn(&mut Machine, &mut Frame)>;

/// Zero-argument callable embedded into a patched constants tuple.
///
/// Clearing a breakpoint disables the sentinel *before* the code object is
/// re-patched, so a thread still executing the replaced bytecode reaches a
/// harmless no-op instead of a stale callback.
pub struct Sentinel {
    slot: RefCell<Option<SentinelHook>>,
}

impl Sentinel {
    pub fn wrap(hook: SentinelHook) -> Rc<Sentinel> {
        Rc::new(Sentinel {
            slot: RefCell::new(Some(hook)),
        })
    }

    pub fn disable(&self) {
        *self.slot.borrow_mut() = None;
    }

    pub fn is_enabled(&self) -> bool {
        self.slot.borrow().is_some()
    }

    pub fn invoke(&self, machine: &mut Machine, frame: &mut Frame) {
        let hook = self.slot.borrow().clone();
        if let Some(hook) = hook {
            hook(machine, frame);
        }
    }
}

thread_local! {
    static DELIVERY_DISABLED: Cell<bool> = const { Cell::new(false) };
}

/// Disable or re-enable breakpoint delivery on the current thread. Sentinels
/// reached while delivery is disabled return silently.
pub fn set_thread_delivery_disabled(disabled: bool) {
    DELIVERY_DISABLED.with(|flag| flag.set(disabled));
}

pub fn thread_delivery_disabled() -> bool {
    DELIVERY_DISABLED.with(|flag| flag.get())
}

fn native(name: &'static str, func: fn(&[Value]) -> Result<Value, PyError>) -> (String, Value) {
    (
        name.to_string(),
        Value::Native(Rc::new(NativeFunction { name, func })),
    )
}

fn arity(args: &[Value], n: usize, name: &str) -> Result<(), PyError> {
    if args.len() != n {
        return Err(PyError::type_error(format!(
            "{name}() takes {n} arguments ({} given)",
            args.len()
        )));
    }
    Ok(())
}

/// The default builtin namespace of the reference runtime.
pub fn default_builtins() -> HashMap<String, Value> {
    HashMap::from([
        native("len", |args| {
            arity(args, 1, "len")?;
            match &args[0] {
                Value::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
                Value::Tuple(t) => Ok(Value::Int(t.len() as i64)),
                Value::List(l) => Ok(Value::Int(l.borrow().len() as i64)),
                other => Err(PyError::type_error(format!(
                    "object of type '{}' has no len()",
                    other.type_name()
                ))),
            }
        }),
        native("abs", |args| {
            arity(args, 1, "abs")?;
            match &args[0] {
                Value::Int(i) => Ok(Value::Int(i.abs())),
                Value::Float(f) => Ok(Value::Float(f.abs())),
                other => Err(PyError::type_error(format!(
                    "bad operand type for abs(): '{}'",
                    other.type_name()
                ))),
            }
        }),
        native("str", |args| {
            arity(args, 1, "str")?;
            Ok(match &args[0] {
                Value::Str(s) => Value::Str(s.clone()),
                other => Value::str(other.repr()),
            })
        }),
        native("repr", |args| {
            arity(args, 1, "repr")?;
            Ok(Value::str(args[0].repr()))
        }),
        native("bool", |args| {
            arity(args, 1, "bool")?;
            Ok(Value::Bool(args[0].is_truthy()))
        }),
        native("min", |args| {
            reduce_extremum(args, "min", |a, b| a < b)
        }),
        native("max", |args| {
            reduce_extremum(args, "max", |a, b| a > b)
        }),
        native("sum", |args| {
            arity(args, 1, "sum")?;
            let items = sequence_items(&args[0])
                .ok_or_else(|| PyError::type_error("sum() argument must be iterable"))?;
            let mut total = 0i64;
            for item in items {
                match item {
                    Value::Int(i) => total += i,
                    Value::Bool(b) => total += b as i64,
                    other => {
                        return Err(PyError::type_error(format!(
                            "unsupported operand type for sum: '{}'",
                            other.type_name()
                        )))
                    }
                }
            }
            Ok(Value::Int(total))
        }),
        // Not in the sandbox whitelist.
        native("open", |_args| {
            Err(PyError::new(
                ExcKind::Io,
                "file I/O is not available in this runtime",
            ))
        }),
    ])
}

fn reduce_extremum(
    args: &[Value],
    name: &str,
    better: fn(i64, i64) -> bool,
) -> Result<Value, PyError> {
    let items: Vec<Value> = if args.len() == 1 {
        sequence_items(&args[0])
            .ok_or_else(|| PyError::type_error(format!("{name}() argument must be iterable")))?
    } else {
        args.to_vec()
    };

    let mut best: Option<i64> = None;
    for item in &items {
        let Value::Int(i) = item else {
            return Err(PyError::type_error(format!(
                "{name}() only supports ints in this runtime"
            )));
        };
        best = Some(match best {
            None => *i,
            Some(b) if better(*i, b) => *i,
            Some(b) => b,
        });
    }
    best.map(Value::Int)
        .ok_or_else(|| PyError::new(ExcKind::Value, format!("{name}() of empty sequence")))
}

fn sequence_items(value: &Value) -> Option<Vec<Value>> {
    match value {
        Value::Tuple(t) => Some((**t).clone()),
        Value::List(l) => Some(l.borrow().clone()),
        _ => None,
    }
}
