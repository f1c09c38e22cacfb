//! Zero-overhead breakpoints for stack-machine bytecode.
//!
//! Instead of driving the target through a per-instruction trace callback,
//! the engine rewrites the bytecode of the target function so that a hit
//! callback is invoked inline at the instruction corresponding to the
//! requested source line. Conditions attached to a breakpoint are evaluated
//! under an opcode-level sandbox that forbids side effects and bounds CPU
//! consumption with token-bucket quotas.

pub mod breakpoint;
pub mod bytecode;
pub mod condition;
pub mod config;
pub mod engine;
pub mod error;
pub mod quota;
pub mod runtime;
pub mod sandbox;

pub use breakpoint::{BreakpointStatus, Cookie, INVALID_COOKIE};
pub use bytecode::dialect::Dialect;
pub use condition::BreakpointEvent;
pub use config::EngineConfig;
pub use engine::BreakpointEngine;
pub use error::Error;

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "bytebreak", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "bytebreak", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}
