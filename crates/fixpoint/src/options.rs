//! Solver configuration

use serde::{Deserialize, Serialize};

/// Tunables of one solver instance. The defaults match production use; the
/// profiler knobs only matter when the join optimizer runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Dump the RAM after each phase to `debug_file_name`.
    pub enable_debugging: bool,
    /// Additionally dump the solved relations.
    pub enable_debug_print_facts: bool,
    pub debug_file_name: String,
    pub disable_join_optimizer: bool,
    pub use_provenance: bool,
    /// Fan-out of the backing index tree; also sizes parallel scan leaves.
    pub index_arity: usize,
    /// How many nested searches may still split across the worker pool.
    pub par_level: usize,
    /// Minimum sample kept per relation when profiling.
    pub profiler_fact_lower_bound: usize,
    pub profiler_seed: u64,
    /// Total input facts below which profiling is skipped.
    pub profiler_minimum_facts: usize,
    /// Bernoulli sampling probability.
    pub profiler_discrimination: f64,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            enable_debugging: false,
            enable_debug_print_facts: false,
            debug_file_name: "fixpoint-ram.txt".to_string(),
            disable_join_optimizer: false,
            use_provenance: false,
            index_arity: 64,
            par_level: 2,
            profiler_fact_lower_bound: 10,
            profiler_seed: 0,
            profiler_minimum_facts: 100,
            profiler_discrimination: 0.20,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = Options::default();
        assert_eq!(opts.index_arity, 64);
        assert_eq!(opts.par_level, 2);
        assert_eq!(opts.profiler_minimum_facts, 100);
        assert_eq!(opts.profiler_discrimination, 0.20);
    }

    #[test]
    fn test_partial_config_deserializes_over_defaults() {
        let opts: Options = serde_json::from_str(r#"{"par_level": 0}"#).unwrap();
        assert_eq!(opts.par_level, 0);
        assert_eq!(opts.index_arity, 64);
    }
}
