//! Optimizer and join-execution configuration

use serde::Deserialize;

/// Default join buffer size (128KB)
pub const DEFAULT_JOIN_BUFFER_SIZE: usize = 128 * 1024;

/// Smallest join buffer the engine accepts
pub const MIN_JOIN_BUFFER_SIZE: usize = 128;

/// Default join cache level: flat and incremental row-store buffers
pub const DEFAULT_JOIN_CACHE_LEVEL: u8 = 2;

/// Highest join cache level
pub const MAX_JOIN_CACHE_LEVEL: u8 = 8;

/// Cap on exhaustive search depth when the depth is chosen automatically
pub const MAX_AUTO_SEARCH_DEPTH: usize = 7;

/// Default cap on the number of index seeks assumed for one ref lookup
pub const DEFAULT_MAX_SEEKS_FOR_KEY: f64 = 4_294_967_295.0;

/// Pruning applied while extending partial plans
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PruneLevel {
    /// Only prune branches that already cost more than the best complete plan
    Exhaustive,
    /// Also discard siblings dominated in both cost and row count
    Heuristic,
}

/// Individually switchable optimizer features
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OptimizerSwitches {
    /// Consider semi-join strategies other than duplicate weed-out
    pub semijoin: bool,
    pub firstmatch: bool,
    pub loosescan: bool,
    pub materialization: bool,
    /// Allow join buffers on inner tables of outer joins
    pub outer_join_with_cache: bool,
    /// Allow join buffers on semi-join inner tables
    pub semijoin_with_cache: bool,
    /// Allow hash-keyed join buffers
    pub join_cache_hashed: bool,
    /// Allow key-batched join buffers
    pub join_cache_bka: bool,
    /// Convert outer joins to inner joins under null-rejecting WHERE
    pub outer_join_simplification: bool,
}

impl Default for OptimizerSwitches {
    fn default() -> Self {
        Self {
            semijoin: true,
            firstmatch: true,
            loosescan: true,
            materialization: true,
            outer_join_with_cache: true,
            semijoin_with_cache: true,
            join_cache_hashed: true,
            join_cache_bka: true,
            outer_join_simplification: true,
        }
    }
}

/// Configuration for join-order optimization and nested-loop execution
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Depth of the bounded exhaustive search (0 = automatic)
    pub search_depth: usize,

    /// Pruning of dominated partial plans
    pub prune_level: PruneLevel,

    /// Join buffer size in bytes
    pub join_buffer_size: usize,

    /// Which join buffer kinds may be used (0 disables buffering)
    pub join_cache_level: u8,

    /// Upper bound on seeks assumed for one ref lookup
    pub max_seeks_for_key: f64,

    /// Feature switches
    pub switches: OptimizerSwitches,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            search_depth: 0,
            prune_level: PruneLevel::Heuristic,
            join_buffer_size: DEFAULT_JOIN_BUFFER_SIZE,
            join_cache_level: DEFAULT_JOIN_CACHE_LEVEL,
            max_seeks_for_key: DEFAULT_MAX_SEEKS_FOR_KEY,
            switches: OptimizerSwitches::default(),
        }
    }
}

impl OptimizerConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the exhaustive search depth
    pub fn with_search_depth(mut self, depth: usize) -> Self {
        self.search_depth = depth;
        self
    }

    /// Set the prune level
    pub fn with_prune_level(mut self, level: PruneLevel) -> Self {
        self.prune_level = level;
        self
    }

    /// Set the join buffer size
    pub fn with_join_buffer_size(mut self, size: usize) -> Self {
        self.join_buffer_size = size.max(MIN_JOIN_BUFFER_SIZE);
        self
    }

    /// Set the join cache level
    pub fn with_join_cache_level(mut self, level: u8) -> Self {
        self.join_cache_level = level.min(MAX_JOIN_CACHE_LEVEL);
        self
    }

    /// Set the seek cap for ref lookups
    pub fn with_max_seeks_for_key(mut self, seeks: f64) -> Self {
        self.max_seeks_for_key = seeks.max(1.0);
        self
    }

    /// Replace the feature switches
    pub fn with_switches(mut self, switches: OptimizerSwitches) -> Self {
        self.switches = switches;
        self
    }

    /// Search depth to use for `remaining` free tables
    pub fn effective_search_depth(&self, remaining: usize) -> usize {
        if self.search_depth == 0 {
            remaining.min(MAX_AUTO_SEARCH_DEPTH) + 1
        } else {
            self.search_depth
        }
    }

    /// Join buffer size after clamping values loaded from settings
    pub fn buffer_size(&self) -> usize {
        self.join_buffer_size.max(MIN_JOIN_BUFFER_SIZE)
    }

    /// Row-store buffers allowed
    pub fn flat_buffers_allowed(&self) -> bool {
        self.join_cache_level >= 1
    }

    /// Hash-keyed buffers allowed
    pub fn hashed_buffers_allowed(&self) -> bool {
        self.join_cache_level >= 3 && self.switches.join_cache_hashed
    }

    /// Key-batched buffers allowed
    pub fn key_batched_buffers_allowed(&self) -> bool {
        self.join_cache_level >= 5 && self.switches.join_cache_bka
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OptimizerConfig::new();
        assert_eq!(config.join_buffer_size, 128 * 1024);
        assert_eq!(config.join_cache_level, 2);
        assert_eq!(config.prune_level, PruneLevel::Heuristic);
        assert!(config.flat_buffers_allowed());
        assert!(!config.hashed_buffers_allowed());
        assert!(!config.key_batched_buffers_allowed());
    }

    #[test]
    fn test_auto_search_depth() {
        let config = OptimizerConfig::new();
        assert_eq!(config.effective_search_depth(3), 4);
        assert_eq!(config.effective_search_depth(20), 8);
        assert_eq!(config.with_search_depth(2).effective_search_depth(20), 2);
    }

    #[test]
    fn test_builder_clamps() {
        let config = OptimizerConfig::new()
            .with_join_buffer_size(1)
            .with_join_cache_level(42);
        assert_eq!(config.join_buffer_size, MIN_JOIN_BUFFER_SIZE);
        assert_eq!(config.join_cache_level, MAX_JOIN_CACHE_LEVEL);
        assert!(config.key_batched_buffers_allowed());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: OptimizerConfig = serde_json::from_str(
            r#"{"join_cache_level": 4, "prune_level": "exhaustive", "switches": {"loosescan": false}}"#,
        )
        .unwrap();
        assert_eq!(config.join_cache_level, 4);
        assert_eq!(config.prune_level, PruneLevel::Exhaustive);
        assert!(!config.switches.loosescan);
        assert!(config.switches.firstmatch);
        assert_eq!(config.join_buffer_size, DEFAULT_JOIN_BUFFER_SIZE);
    }
}
