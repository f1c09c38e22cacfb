//! Token buckets bounding the CPU cost of condition evaluation and the
//! volume of dynamic log output.
//!
//! Buckets are contended across true-parallel native threads (everything
//! else in the engine runs under the host interpreter lock), so the fast
//! path is a single atomic subtraction and only the refill math takes a
//! mutex.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use once_cell::sync::{Lazy, OnceCell};

use crate::config::EngineConfig;

// Capacity is conceptually unrelated to the fill rate, but exposing it as a
// separate knob is not worth it. Smaller factors keep a burst of debugger
// CPU from impacting service throughput, larger factors allow the burst and
// only trip on sustained consumption.
const CONDITION_COST_CAPACITY_FACTOR: f64 = 0.1;
const DYNAMIC_LOG_CAPACITY_FACTOR: f64 = 5.0;
const DYNAMIC_LOG_BYTES_CAPACITY_FACTOR: f64 = 2.0;

static CLOCK_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

fn now_ns() -> i64 {
    CLOCK_EPOCH.elapsed().as_nanos() as i64
}

struct FillState {
    fill_time_ns: i64,
    fractional_tokens: f64,
}

/// Leaky bucket of tokens with a fixed refill rate.
pub struct LeakyBucket {
    capacity: i64,
    fill_rate: i64,
    tokens: AtomicI64,
    fill: Mutex<FillState>,
}

impl LeakyBucket {
    /// `capacity` tokens available for a burst, refilled at `fill_rate`
    /// tokens per second.
    pub fn new(capacity: i64, fill_rate: i64) -> Self {
        Self {
            capacity,
            fill_rate,
            tokens: AtomicI64::new(capacity),
            fill: Mutex::new(FillState {
                fill_time_ns: now_ns(),
                fractional_tokens: 0.0,
            }),
        }
    }

    /// Try to take `n` tokens. Requests larger than the capacity can never
    /// succeed.
    pub fn request(&self, n: i64) -> bool {
        if n > self.capacity {
            return false;
        }
        if self.tokens.fetch_sub(n, Ordering::Relaxed) - n >= 0 {
            return true;
        }
        self.request_slow(n)
    }

    fn request_slow(&self, n: i64) -> bool {
        // Getting the time outside the lock reduces contention.
        let current_time_ns = now_ns();

        let mut fill = self.fill.lock().expect("quota lock poisoned");

        let cur_tokens = self.tokens.load(Ordering::Relaxed);
        if cur_tokens >= 0 {
            return true;
        }

        if self.refill(&mut fill, n + cur_tokens, current_time_ns) >= 0 {
            return true;
        }

        // The request cannot be satisfied, give the tokens back.
        self.tokens.fetch_add(n, Ordering::Relaxed);
        false
    }

    /// Unconditionally consume `n` tokens; the balance may go negative.
    pub fn take(&self, n: i64) {
        let remaining = self.tokens.fetch_sub(n, Ordering::Relaxed) - n;
        if remaining < 0 {
            // Refill opportunistically, otherwise a bucket that only ever
            // sees take() would sink forever and waste accumulated tokens.
            let current_time_ns = now_ns();
            let mut fill = self.fill.lock().expect("quota lock poisoned");
            self.refill(&mut fill, remaining, current_time_ns);
        }
    }

    fn refill(&self, fill: &mut FillState, available_tokens: i64, current_time_ns: i64) -> i64 {
        if current_time_ns <= fill.fill_time_ns {
            // Another thread refilled between our clock read and taking the
            // lock, nothing to do.
            return self.tokens.load(Ordering::Relaxed);
        }

        let elapsed_ns = current_time_ns - fill.fill_time_ns;
        fill.fill_time_ns = current_time_ns;

        // elapsed is in ns and fill_rate in tokens per second, hence the
        // scaling factor. take() may have driven the balance negative, so
        // never add beyond the bucket capacity.
        fill.fractional_tokens +=
            (elapsed_ns as f64 * (self.fill_rate as f64 / 1e9)).min(self.capacity as f64);
        let ideal_tokens_to_add = fill.fractional_tokens as i64;

        let max_tokens_to_add = self.capacity - available_tokens;
        let real_tokens_to_add = if max_tokens_to_add < ideal_tokens_to_add {
            fill.fractional_tokens = 0.0;
            max_tokens_to_add
        } else {
            fill.fractional_tokens -= ideal_tokens_to_add as f64;
            ideal_tokens_to_add
        };

        self.tokens.fetch_add(real_tokens_to_add, Ordering::Relaxed) + real_tokens_to_add
    }

    #[cfg(test)]
    fn balance(&self) -> i64 {
        self.tokens.load(Ordering::Relaxed)
    }
}

/// Process-wide quota buckets.
///
/// The runtime insists on a single instance of these (breakpoints on
/// different code objects share the budgets), so they initialize lazily on
/// first use with whatever configuration reaches them first; everything
/// else in the crate takes explicit values.
pub struct QuotaSet {
    condition: LeakyBucket,
    dynamic_log: LeakyBucket,
    dynamic_log_bytes: LeakyBucket,
    config: EngineConfig,
}

static PROCESS_QUOTAS: OnceCell<Arc<QuotaSet>> = OnceCell::new();

fn condition_capacity(config: &EngineConfig) -> i64 {
    (config.max_condition_lines_rate as f64 * CONDITION_COST_CAPACITY_FACTOR) as i64
}

impl QuotaSet {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            condition: LeakyBucket::new(
                condition_capacity(&config),
                config.max_condition_lines_rate,
            ),
            dynamic_log: LeakyBucket::new(
                (config.max_dynamic_log_rate as f64 * DYNAMIC_LOG_CAPACITY_FACTOR) as i64,
                config.max_dynamic_log_rate,
            ),
            dynamic_log_bytes: LeakyBucket::new(
                (config.max_dynamic_log_bytes_rate as f64 * DYNAMIC_LOG_BYTES_CAPACITY_FACTOR)
                    as i64,
                config.max_dynamic_log_bytes_rate,
            ),
            config,
        }
    }

    /// The process-wide instance, created on first use. The configuration of
    /// the first caller wins; later configurations are ignored.
    pub fn process_wide(config: EngineConfig) -> Arc<QuotaSet> {
        PROCESS_QUOTAS
            .get_or_init(|| Arc::new(QuotaSet::new(config)))
            .clone()
    }

    pub fn condition(&self) -> &LeakyBucket {
        &self.condition
    }

    pub fn dynamic_log(&self) -> &LeakyBucket {
        &self.dynamic_log
    }

    pub fn dynamic_log_bytes(&self) -> &LeakyBucket {
        &self.dynamic_log_bytes
    }

    /// Per-breakpoint condition budget: half the capacity and half the fill
    /// rate of the global one.
    pub fn new_breakpoint_condition_quota(&self) -> LeakyBucket {
        LeakyBucket::new(
            condition_capacity(&self.config) / 2,
            self.config.max_condition_lines_rate / 2,
        )
    }
}
