//! Execution context for one statement
//!
//! Carries the cooperative cancellation flag checked by the optimizer
//! (once per new best plan) and by the join executor (once per row read).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::OptimizerConfig;

/// Shared cancellation flag; clones observe the same state
#[derive(Debug, Clone, Default)]
pub struct KillFlag(Arc<AtomicBool>);

impl KillFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn kill(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_killed(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-statement context passed to the optimizer and executors
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    pub config: OptimizerConfig,
    pub kill: KillFlag,
}

impl ExecutionContext {
    /// Create a context with its own kill flag
    pub fn new(config: OptimizerConfig) -> Self {
        Self {
            config,
            kill: KillFlag::new(),
        }
    }

    /// Share an existing kill flag
    #[must_use]
    pub fn with_kill_flag(mut self, kill: KillFlag) -> Self {
        self.kill = kill;
        self
    }

    pub fn is_killed(&self) -> bool {
        self.kill.is_killed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kill_flag_is_shared() {
        let ctx = ExecutionContext::default();
        let handle = ctx.kill.clone();
        assert!(!ctx.is_killed());
        handle.kill();
        assert!(ctx.is_killed());
    }
}
