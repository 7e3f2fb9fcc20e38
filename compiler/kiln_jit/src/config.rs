//! JIT configuration.
//!
//! Every knob has a default; [`JitConfig::from_env`] overrides them from
//! `KILN_JIT_*` variables. Unparsable values are logged and ignored.

use std::num::NonZeroUsize;

use kiln_hir::PassConfig;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JitConfig {
    pub passes: PassConfig,
    /// Compile threads used by batch compilation.
    pub workers: usize,
    /// Functions preloaded for one root, the root included.
    pub preload_dependency_limit: usize,
    /// Capacity of the shared code buffer in bytes.
    pub code_buffer_bytes: usize,
    /// Guard failures after which a function goes back to the interpreter.
    pub guard_failure_threshold: u32,
    /// Interpreted calls after which a function is compiled; `0` disables.
    pub hot_threshold: u32,
}

impl Default for JitConfig {
    fn default() -> Self {
        JitConfig {
            passes: PassConfig::default(),
            workers: std::thread::available_parallelism().map_or(1, NonZeroUsize::get).min(8),
            preload_dependency_limit: 32,
            code_buffer_bytes: 16 << 20,
            guard_failure_threshold: 10,
            hot_threshold: 0,
        }
    }
}

impl JitConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each
    /// `KILN_JIT_*` key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = JitConfig::default();
        let read = |key: &str| lookup(key).map(|v| (key.to_string(), v));

        if let Some((key, v)) = read("KILN_JIT_WORKERS") {
            set_parsed(&key, &v, &mut config.workers);
            config.workers = config.workers.max(1);
        }
        if let Some((key, v)) = read("KILN_JIT_PRELOAD_LIMIT") {
            set_parsed(&key, &v, &mut config.preload_dependency_limit);
        }
        if let Some((key, v)) = read("KILN_JIT_CODE_BUFFER") {
            set_parsed(&key, &v, &mut config.code_buffer_bytes);
        }
        if let Some((key, v)) = read("KILN_JIT_GUARD_FAILURES") {
            set_parsed(&key, &v, &mut config.guard_failure_threshold);
        }
        if let Some((key, v)) = read("KILN_JIT_HOT_THRESHOLD") {
            set_parsed(&key, &v, &mut config.hot_threshold);
        }

        let passes = &mut config.passes;
        if let Some((key, v)) = read("KILN_JIT_INLINER") {
            set_flag(&key, &v, &mut passes.inliner);
        }
        if let Some((key, v)) = read("KILN_JIT_INLINE_COST") {
            set_parsed(&key, &v, &mut passes.inline_cost_limit);
        }
        if let Some((key, v)) = read("KILN_JIT_SIMPLIFY_ITERATIONS") {
            set_parsed(&key, &v, &mut passes.simplify_iteration_limit);
        }
        if let Some((key, v)) = read("KILN_JIT_SIMPLIFY_BLOCKS") {
            set_parsed(&key, &v, &mut passes.simplify_new_block_limit);
        }
        if let Some((key, v)) = read("KILN_JIT_VERIFY") {
            set_flag(&key, &v, &mut passes.verify);
        }
        config
    }
}

fn set_parsed<T: std::str::FromStr>(key: &str, value: &str, slot: &mut T) {
    match value.trim().parse() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!(key, value, "ignoring unparsable setting"),
    }
}

fn set_flag(key: &str, value: &str, slot: &mut bool) {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => *slot = true,
        "0" | "false" | "off" | "no" => *slot = false,
        _ => tracing::warn!(key, value, "ignoring unparsable flag"),
    }
}
