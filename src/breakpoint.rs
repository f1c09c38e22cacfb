//! Breakpoint registry: cookie bookkeeping, per-code-object patch state and
//! the original-attribute vault that makes `detach` a bitwise restore.
//!
//! Every mutation of a code object's breakpoint set re-runs the patcher from
//! the original bytecode. A breakpoint that failed to activate (for example,
//! because the cascade refused a widening) is retried on every re-patch, so
//! clearing a sibling can transition it from `Error` back to `Active`.
//! Failures that no change of the sibling set can fix — undecodable
//! bytecode, an offset that is not an instruction boundary — are dropped
//! from the retry set instead.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use log::warn;

use crate::bytecode::dialect::Dialect;
use crate::bytecode::linetable;
use crate::bytecode::patcher::BytecodePatcher;
use crate::error::Error;
use crate::runtime::{code_id, CodeId, CodeRef, Sentinel, SentinelHook, Value};

use std::rc::Rc;

pub type Cookie = i64;

/// Returned by create on invalid input; every other operation treats it as a
/// no-op cookie.
pub const INVALID_COOKIE: Cookie = -1;

// Cookie numbering starts high so breakpoint cookies are easy to tell apart
// from other small integers in logs.
const FIRST_COOKIE: Cookie = 1_000_000;

// Patching appends one constant per active breakpoint. Above this many
// constants the LOAD_CONST argument would outgrow 16 bits, which the patcher
// does not support, so such code objects are refused upfront.
const MAX_CODE_OBJECT_CONSTS: usize = 0xF000;

/// Observable breakpoint lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum BreakpointStatus {
    /// Never seen, or cleared and forgotten.
    Unknown,
    /// Created but not patched into the bytecode.
    Inactive,
    /// Patched into the bytecode.
    Active,
    /// Activation failed; recoverable failures are retried on every
    /// re-patch of the code object.
    Error,
    /// Cleared.
    Done,
}

pub type ErrorHook = Rc<dyn Fn()>;

pub struct Breakpoint {
    cookie: Cookie,
    code: CodeRef,
    line: u32,
    /// Instruction offset under the original bytecode, resolved from the
    /// original line table at creation time.
    offset: usize,
    sentinel: Rc<Sentinel>,
    error_hook: ErrorHook,
    status: BreakpointStatus,
}

impl Breakpoint {
    pub fn cookie(&self) -> Cookie {
        self.cookie
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn offset(&self) -> usize {
        self.offset
    }
}

/// Replaced code-object attributes that may still be referenced by a frame
/// executing the previous bytecode. Kept strongly until the reference count
/// proves no execution can observe them.
enum Zombie {
    Bytecode(Rc<Vec<u8>>),
    Consts(Rc<Vec<Value>>),
    LineTable(Rc<Vec<u8>>),
}

impl Zombie {
    fn is_unreferenced(&self) -> bool {
        match self {
            Zombie::Bytecode(rc) => Rc::strong_count(rc) == 1,
            Zombie::Consts(rc) => Rc::strong_count(rc) == 1,
            Zombie::LineTable(rc) => Rc::strong_count(rc) == 1,
        }
    }
}

/// Patch state of one code object: pristine originals, the activated
/// breakpoints as a descending-offset multimap, and the zombie pool.
struct CodeObjectBreakpoints {
    code: CodeRef,
    original_bytecode: Rc<Vec<u8>>,
    original_consts: Rc<Vec<Value>>,
    original_line_table: Option<Rc<Vec<u8>>>,
    original_stack_size: u32,
    /// offset -> activated cookies; iterated in descending offset order so
    /// that injecting at one offset never shifts the offsets still pending.
    breakpoints: BTreeMap<usize, Vec<Cookie>>,
    zombie_refs: Vec<Zombie>,
}

impl CodeObjectBreakpoints {
    fn prune_zombies(&mut self) {
        self.zombie_refs.retain(|z| !z.is_unreferenced());
    }
}

pub struct BreakpointRegistry {
    dialect: &'static Dialect,
    cookie_counter: Cookie,
    cookie_map: BTreeMap<Cookie, Breakpoint>,
    patches: IndexMap<CodeId, CodeObjectBreakpoints>,
}

impl BreakpointRegistry {
    pub fn new(dialect: &'static Dialect) -> Self {
        Self {
            dialect,
            cookie_counter: FIRST_COOKIE,
            cookie_map: BTreeMap::new(),
            patches: IndexMap::new(),
        }
    }

    /// Register a breakpoint at `line` of `code`. The sentinel wrapping
    /// `hit` is created here; activation patches it into the bytecode.
    ///
    /// Offsets are resolved against the *original* line table, so creation
    /// is oblivious to any patches already applied to the code object.
    pub fn create(
        &mut self,
        code: &CodeRef,
        line: u32,
        hit: SentinelHook,
        error_hook: ErrorHook,
    ) -> Result<Cookie, Error> {
        let id = self.prepare(code)?;
        let record = &self.patches[&id];

        let table = record
            .original_line_table
            .as_ref()
            .ok_or(Error::NoLineTable)?;
        let entries = linetable::decode(
            self.dialect.line_format,
            table,
            code.borrow().first_line,
            record.original_bytecode.len(),
        )?;
        let offset = entries
            .iter()
            .find(|e| e.line == Some(line))
            .map(|e| e.start)
            .ok_or(Error::LineNotFound(line))?;

        let cookie = self.cookie_counter;
        self.cookie_counter += 1;

        self.cookie_map.insert(
            cookie,
            Breakpoint {
                cookie,
                code: code.clone(),
                line,
                offset,
                sentinel: Sentinel::wrap(hit),
                error_hook,
                status: BreakpointStatus::Inactive,
            },
        );

        Ok(cookie)
    }

    /// Patch an inactive or errored breakpoint into its code object.
    /// Idempotent on active breakpoints; a no-op for invalid cookies.
    ///
    /// Returns the error hooks of breakpoints that failed during this
    /// re-patch; the caller must invoke them after releasing the registry.
    #[must_use = "returned error hooks must be invoked"]
    pub fn activate(&mut self, cookie: Cookie) -> Vec<ErrorHook> {
        let Some(breakpoint) = self.cookie_map.get(&cookie) else {
            return Vec::new();
        };
        match breakpoint.status {
            BreakpointStatus::Active | BreakpointStatus::Done => return Vec::new(),
            BreakpointStatus::Inactive | BreakpointStatus::Error | BreakpointStatus::Unknown => {}
        }

        let code = breakpoint.code.clone();
        let offset = breakpoint.offset;

        let id = match self.prepare(&code) {
            Ok(id) => id,
            Err(e) => {
                warn!(target: "bytebreak", "activate breakpoint {cookie}: {e:#}");
                let breakpoint = self.cookie_map.get_mut(&cookie).expect("present");
                breakpoint.status = BreakpointStatus::Error;
                return vec![breakpoint.error_hook.clone()];
            }
        };

        let record = self.patches.get_mut(&id).expect("just prepared");
        let at_offset = record.breakpoints.entry(offset).or_default();
        if !at_offset.contains(&cookie) {
            at_offset.push(cookie);
        }

        patch_code_object(self.dialect, record, &mut self.cookie_map)
    }

    /// Remove a breakpoint: disable its sentinel first (so in-flight
    /// executions of the replaced bytecode turn into no-ops), then re-patch
    /// the code object, which also retries errored siblings and restores the
    /// original attributes once no breakpoint remains.
    #[must_use = "returned error hooks must be invoked"]
    pub fn clear(&mut self, cookie: Cookie) -> Vec<ErrorHook> {
        let Some(breakpoint) = self.cookie_map.get_mut(&cookie) else {
            return Vec::new();
        };
        if breakpoint.status == BreakpointStatus::Done {
            return Vec::new();
        }

        breakpoint.sentinel.disable();
        breakpoint.status = BreakpointStatus::Done;
        let id = code_id(&breakpoint.code);

        let mut hooks = Vec::new();
        if let Some(record) = self.patches.get_mut(&id) {
            let mut removed = false;
            record.breakpoints.retain(|_, cookies| {
                if let Some(at) = cookies.iter().position(|&c| c == cookie) {
                    cookies.remove(at);
                    removed = true;
                }
                !cookies.is_empty()
            });

            if removed {
                hooks = patch_code_object(self.dialect, record, &mut self.cookie_map);
            }

            let record = &mut self.patches[&id];
            record.prune_zombies();
            if record.breakpoints.is_empty() && record.zombie_refs.is_empty() {
                self.patches.shift_remove(&id);
            }
        }

        hooks
    }

    pub fn status(&self, cookie: Cookie) -> BreakpointStatus {
        self.cookie_map
            .get(&cookie)
            .map(|b| b.status)
            .unwrap_or(BreakpointStatus::Unknown)
    }

    /// Restore every patched code object and drop all registry state.
    pub fn detach(&mut self) {
        for (_, record) in self.patches.iter_mut() {
            record.breakpoints.clear();
            // With an empty breakpoint set the patch pass is a restore.
            let hooks = patch_code_object(self.dialect, record, &mut self.cookie_map);
            debug_assert!(hooks.is_empty());
            record.prune_zombies();
        }
        self.patches.clear();
        self.cookie_map.clear();
    }

    /// Load the code object into the patch map if not already there,
    /// capturing the original attributes.
    fn prepare(&mut self, code: &CodeRef) -> Result<CodeId, Error> {
        let id = code_id(code);
        if self.patches.contains_key(&id) {
            return Ok(id);
        }

        let borrowed = code.borrow();
        if borrowed.bytecode.is_empty() {
            return Err(Error::NoBytecode);
        }
        if borrowed.consts.len() >= MAX_CODE_OBJECT_CONSTS {
            return Err(Error::TooManyConstants(MAX_CODE_OBJECT_CONSTS));
        }

        let record = CodeObjectBreakpoints {
            code: code.clone(),
            original_bytecode: borrowed.bytecode.clone(),
            original_consts: borrowed.consts.clone(),
            original_line_table: borrowed.line_table.clone(),
            original_stack_size: borrowed.stack_size,
            breakpoints: BTreeMap::new(),
            zombie_refs: Vec::new(),
        };
        drop(borrowed);

        self.patches.insert(id, record);
        Ok(id)
    }
}

/// Rebuild the code object from its originals and the current breakpoint
/// set, swapping all four attributes together and parking the replaced ones
/// as zombies. Error hooks of failed injections are returned for the caller
/// to invoke *after* the swap, so a hook may immediately clear its
/// breakpoint and trigger another re-patch.
fn patch_code_object(
    dialect: &'static Dialect,
    record: &mut CodeObjectBreakpoints,
    cookies: &mut BTreeMap<Cookie, Breakpoint>,
) -> Vec<ErrorHook> {
    let mut code = record.code.borrow_mut();

    if record.breakpoints.is_empty() {
        record
            .zombie_refs
            .push(Zombie::Bytecode(std::mem::replace(
                &mut code.bytecode,
                record.original_bytecode.clone(),
            )));
        record.zombie_refs.push(Zombie::Consts(std::mem::replace(
            &mut code.consts,
            record.original_consts.clone(),
        )));
        if let Some(table) = std::mem::replace(
            &mut code.line_table,
            record.original_line_table.clone(),
        ) {
            record.zombie_refs.push(Zombie::LineTable(table));
        }
        code.stack_size = record.original_stack_size;
        drop(code);
        record.prune_zombies();
        return Vec::new();
    }

    let mut patcher = BytecodePatcher::new(
        dialect,
        (*record.original_bytecode).clone(),
        record.original_line_table.as_ref().map(|t| (**t).clone()),
    );

    let mut new_consts: Vec<Value> = (*record.original_consts).clone();
    let mut failed: Vec<Cookie> = Vec::new();
    let mut abandoned: Vec<(usize, Cookie)> = Vec::new();

    for (&offset, at_offset) in record.breakpoints.iter().rev() {
        for &cookie in at_offset {
            let breakpoint = cookies.get_mut(&cookie).expect("registered cookie");
            debug_assert_eq!(offset, breakpoint.offset);

            let const_index = new_consts.len() as u32;
            match patcher.inject_call(offset, const_index) {
                Ok(()) => {
                    new_consts.push(Value::Sentinel(breakpoint.sentinel.clone()));
                    breakpoint.status = BreakpointStatus::Active;
                }
                Err(e) => {
                    warn!(
                        target: "bytebreak",
                        "failed to insert bytecode for breakpoint {cookie}: {e:#}"
                    );
                    if !e.is_recoverable() {
                        abandoned.push((offset, cookie));
                    }
                    breakpoint.status = BreakpointStatus::Error;
                    failed.push(cookie);
                }
            }
        }
    }

    // Failures that no change of the sibling set can fix are dropped from
    // the retry set, so later re-patches stop re-attempting them. An
    // explicit activate puts such a breakpoint back for one more try.
    for (offset, cookie) in abandoned {
        let now_empty = match record.breakpoints.get_mut(&offset) {
            Some(at_offset) => {
                at_offset.retain(|&c| c != cookie);
                at_offset.is_empty()
            }
            None => false,
        };
        if now_empty {
            record.breakpoints.remove(&offset);
        }
    }

    // The sentinel call pushes one value before popping it; the limit only
    // grows when at least one injection landed.
    let injected_any = new_consts.len() > record.original_consts.len();
    let (bytecode, line_table) = patcher.into_parts();

    record
        .zombie_refs
        .push(Zombie::Bytecode(std::mem::replace(
            &mut code.bytecode,
            Rc::new(bytecode),
        )));
    record.zombie_refs.push(Zombie::Consts(std::mem::replace(
        &mut code.consts,
        Rc::new(new_consts),
    )));
    if let Some(table) = line_table {
        if let Some(old) = std::mem::replace(&mut code.line_table, Some(Rc::new(table))) {
            record.zombie_refs.push(Zombie::LineTable(old));
        }
    }
    code.stack_size = if injected_any {
        record.original_stack_size + 1
    } else {
        record.original_stack_size
    };

    drop(code);
    record.prune_zombies();

    failed
        .into_iter()
        .filter_map(|cookie| cookies.get(&cookie).map(|b| b.error_hook.clone()))
        .collect()
}
