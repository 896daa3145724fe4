//! Planner configuration and optimizer switches.

use bitflags::bitflags;

bitflags! {
    /// Optimizer feature switches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OptimizerSwitch: u32 {
        const SEMIJOIN        = 1 << 0;
        const FIRSTMATCH      = 1 << 1;
        const LOOSESCAN       = 1 << 2;
        const MATERIALIZATION = 1 << 3;
        const DUPSWEEDOUT     = 1 << 4;
        /// Batched key access through the MRR interface
        const JOIN_CACHE_BKA  = 1 << 5;
        /// Hashed join buffers (BNLH / BKAH)
        const JOIN_CACHE_HASHED = 1 << 6;
    }
}

impl Default for OptimizerSwitch {
    fn default() -> Self {
        OptimizerSwitch::all()
    }
}

/// Planner configuration.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    pub optimizer_switch: OptimizerSwitch,
    /// Join buffering is considered for tables after this level; 0
    /// disables buffering entirely
    pub join_cache_level: u8,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            optimizer_switch: OptimizerSwitch::default(),
            join_cache_level: 2,
        }
    }
}
