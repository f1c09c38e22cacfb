use serde::Deserialize;

/// Process-scoped tuning knobs for condition evaluation and dynamic logging.
///
/// Values mirror the command line flags of the original debuglet agents, so
/// embedders can deserialize them straight from a configuration file.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Hard cap on the number of lines a single condition evaluation may
    /// execute before it is aborted.
    pub max_expression_lines: u32,
    /// Fill rate (lines/sec) of the global condition quota. The
    /// per-breakpoint quota fills at half this rate.
    pub max_condition_lines_rate: i64,
    /// Fill rate (messages/sec) of the global dynamic log quota.
    pub max_dynamic_log_rate: i64,
    /// Fill rate (bytes/sec) of the global dynamic log bytes quota.
    pub max_dynamic_log_bytes_rate: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_expression_lines: 10_000,
            max_condition_lines_rate: 5_000,
            max_dynamic_log_rate: 50,
            max_dynamic_log_bytes_rate: 20_480,
        }
    }
}
