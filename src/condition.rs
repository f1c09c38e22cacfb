//! Glue between a sentinel hit, the sandbox and the quotas.
//!
//! All outcomes of a hit flow through one caller-supplied sink as a tagged
//! event, never as an exception: a conditional breakpoint must not be able
//! to disturb the program it is set in.

use std::rc::Rc;
use std::sync::Arc;

use log::debug;

use crate::config::EngineConfig;
use crate::quota::{LeakyBucket, QuotaSet};
use crate::runtime::{CodeRef, Frame, Machine};
use crate::sandbox;
use crate::weak_error;

/// The closed set of events surfaced to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum BreakpointEvent {
    /// The breakpoint was reached and its condition (if any) held.
    Hit,
    /// The breakpoint could not be installed.
    Error,
    GlobalConditionQuotaExceeded,
    BreakpointConditionQuotaExceeded,
    ConditionExpressionMutable,
}

/// Event sink; receives the frame for `Hit` events.
pub type EventSink = Rc<dyn Fn(BreakpointEvent, Option<&Frame>) -> anyhow::Result<()>>;

pub struct ConditionalBreakpoint {
    condition: Option<CodeRef>,
    sink: EventSink,
    quotas: Arc<QuotaSet>,
    per_breakpoint_condition_quota: LeakyBucket,
    max_expression_lines: u32,
}

impl ConditionalBreakpoint {
    pub fn new(
        condition: Option<CodeRef>,
        sink: EventSink,
        quotas: Arc<QuotaSet>,
        config: &EngineConfig,
    ) -> Self {
        let per_breakpoint_condition_quota = quotas.new_breakpoint_condition_quota();
        Self {
            condition,
            sink,
            quotas,
            per_breakpoint_condition_quota,
            max_expression_lines: config.max_expression_lines,
        }
    }

    /// Sentinel callback: runs in the frame that reached the patched
    /// instruction.
    pub fn on_hit(&self, machine: &mut Machine, frame: &mut Frame) {
        if !self.evaluate_condition(machine, frame) {
            return;
        }
        self.notify(BreakpointEvent::Hit, Some(frame));
    }

    /// Error callback for activation and re-patch failures.
    pub fn on_error(&self) {
        self.notify(BreakpointEvent::Error, None);
    }

    fn evaluate_condition(&self, machine: &mut Machine, frame: &Frame) -> bool {
        let Some(condition) = &self.condition else {
            return true;
        };

        let locals = frame.locals_dict();
        let outcome = sandbox::evaluate_immutable(
            machine,
            condition,
            frame.globals.clone(),
            Some(locals),
            self.max_expression_lines,
        );

        // Charge the evaluation cost to both budgets before looking at the
        // outcome; a condition that never holds still burns CPU.
        let cost = outcome.line_count as i64;
        self.quotas.condition().take(cost);
        self.per_breakpoint_condition_quota.take(cost);

        if !self.quotas.condition().request(0) {
            debug!(target: "bytebreak", "global condition quota exceeded");
            self.notify(BreakpointEvent::GlobalConditionQuotaExceeded, None);
            return false;
        }
        if !self.per_breakpoint_condition_quota.request(0) {
            debug!(target: "bytebreak", "per-breakpoint condition quota exceeded");
            self.notify(BreakpointEvent::BreakpointConditionQuotaExceeded, None);
            return false;
        }

        if outcome.mutable_code_detected {
            self.notify(BreakpointEvent::ConditionExpressionMutable, None);
            return false;
        }

        match outcome.result {
            Ok(value) => value.is_truthy(),
            Err(e) => {
                debug!(target: "bytebreak", "condition evaluation failed: {e:#}");
                false
            }
        }
    }

    fn notify(&self, event: BreakpointEvent, frame: Option<&Frame>) {
        weak_error!((self.sink)(event, frame), "breakpoint event sink:");
    }
}
