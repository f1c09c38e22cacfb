//! Public facade of the breakpoint core.
//!
//! One engine value owns the registry, the dialect and the quota handles;
//! all host-facing entry points live here. The engine never panics and
//! never raises into the host: failures reach the caller through error
//! callbacks, events or sentinel return values (`-1`, `false`).

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use log::warn;

use crate::breakpoint::{BreakpointRegistry, BreakpointStatus, Cookie, ErrorHook, INVALID_COOKIE};
use crate::bytecode::dialect::Dialect;
use crate::condition::{ConditionalBreakpoint, EventSink};
use crate::config::EngineConfig;
use crate::error::Error;
use crate::quota::QuotaSet;
use crate::runtime::{CodeRef, Frame, Machine, SentinelHook, Value};
use crate::sandbox;

pub struct BreakpointEngine {
    dialect: &'static Dialect,
    config: EngineConfig,
    quotas: Arc<QuotaSet>,
    // RefCell so that callbacks fired by one operation may reenter the
    // engine (an error callback is allowed to clear its breakpoint).
    registry: RefCell<BreakpointRegistry>,
}

impl BreakpointEngine {
    /// Engine bound to the process-wide quotas.
    pub fn new(dialect: &'static Dialect, config: EngineConfig) -> Self {
        let quotas = QuotaSet::process_wide(config);
        Self::with_quotas(dialect, config, quotas)
    }

    /// Engine with its own quota instances instead of the process-wide
    /// singletons; useful for embedders running several isolated targets
    /// (and for tests).
    pub fn with_isolated_quotas(dialect: &'static Dialect, config: EngineConfig) -> Self {
        Self::with_quotas(dialect, config, Arc::new(QuotaSet::new(config)))
    }

    fn with_quotas(dialect: &'static Dialect, config: EngineConfig, quotas: Arc<QuotaSet>) -> Self {
        Self {
            dialect,
            config,
            quotas,
            registry: RefCell::new(BreakpointRegistry::new(dialect)),
        }
    }

    pub fn dialect(&self) -> &'static Dialect {
        self.dialect
    }

    /// Create a conditional breakpoint at `line` of `code`.
    ///
    /// `condition` is a code object compiled in eval mode, or `None` for an
    /// unconditional breakpoint. Every outcome of a hit is delivered to
    /// `sink`. Returns `-1` and fires `BreakpointEvent::Error` through the
    /// sink on invalid input.
    pub fn create_breakpoint(
        &self,
        code: &CodeRef,
        line: u32,
        condition: Option<CodeRef>,
        sink: EventSink,
    ) -> Cookie {
        let breakpoint = Rc::new(ConditionalBreakpoint::new(
            condition,
            sink,
            self.quotas.clone(),
            &self.config,
        ));

        let hit: SentinelHook = {
            let breakpoint = breakpoint.clone();
            Rc::new(move |machine: &mut Machine, frame: &mut Frame| {
                breakpoint.on_hit(machine, frame)
            })
        };
        let error: ErrorHook = Rc::new(move || breakpoint.on_error());

        self.create_raw_breakpoint(code, line, hit, error)
    }

    /// Create a breakpoint with explicit hit and error callbacks, bypassing
    /// condition evaluation and quotas.
    ///
    /// Returns a positive cookie, or `-1` on invalid code/line with `error`
    /// invoked synchronously.
    pub fn create_raw_breakpoint(
        &self,
        code: &CodeRef,
        line: u32,
        hit: SentinelHook,
        error: ErrorHook,
    ) -> Cookie {
        let result = self.registry.borrow_mut().create(code, line, hit, error.clone());
        match result {
            Ok(cookie) => cookie,
            Err(e) => {
                warn!(target: "bytebreak", "create breakpoint at line {line}: {e:#}");
                error();
                INVALID_COOKIE
            }
        }
    }

    /// Patch a created breakpoint into its code object. No-op for `-1`.
    pub fn activate_breakpoint(&self, cookie: Cookie) {
        let hooks = self.registry.borrow_mut().activate(cookie);
        Self::fire(hooks);
    }

    /// Remove a breakpoint and re-patch its code object. No-op for `-1`.
    pub fn clear_breakpoint(&self, cookie: Cookie) {
        let hooks = self.registry.borrow_mut().clear(cookie);
        Self::fire(hooks);
    }

    pub fn breakpoint_status(&self, cookie: Cookie) -> BreakpointStatus {
        self.registry.borrow().status(cookie)
    }

    /// Restore every patched code object and drop all breakpoint state.
    pub fn detach(&self) {
        self.registry.borrow_mut().detach();
    }

    /// Evaluate `code` in the context of `frame` under the immutability
    /// sandbox. Host exceptions of the evaluated code pass through; a
    /// sandbox abort reports [`Error::MutableCode`].
    pub fn call_immutable(
        &self,
        machine: &mut Machine,
        frame: &Frame,
        code: &CodeRef,
    ) -> Result<Value, Error> {
        let locals = frame.locals_dict();
        let outcome = sandbox::evaluate_immutable(
            machine,
            code,
            frame.globals.clone(),
            Some(locals),
            self.config.max_expression_lines,
        );
        if outcome.mutable_code_detected {
            return Err(Error::MutableCode);
        }
        outcome.result.map_err(Error::from)
    }

    /// Charge one dynamic log message of `num_bytes` against the log quotas.
    /// Returns whether the message may be emitted.
    pub fn apply_dynamic_log_quota(&self, num_bytes: usize) -> bool {
        if num_bytes == 0 {
            return false;
        }
        self.quotas.dynamic_log().request(1)
            && self.quotas.dynamic_log_bytes().request(num_bytes as i64)
    }

    // Error hooks are invoked after the registry borrow is released: a hook
    // may call clear_breakpoint and trigger another re-patch.
    fn fire(hooks: Vec<ErrorHook>) {
        for hook in hooks {
            hook();
        }
    }
}

impl Drop for BreakpointEngine {
    fn drop(&mut self) {
        self.registry.borrow_mut().detach();
    }
}
