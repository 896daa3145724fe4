//! Executor configuration.

/// Join executor configuration.
#[derive(Debug, Clone)]
pub struct ExecConfig {
    /// Preferred size of one join buffer in bytes
    pub join_buffer_size: usize,
    /// Total join buffer space budget per query in bytes
    pub join_buffer_space_limit: usize,
    /// Optional per-table join buffer cap (0 = no cap)
    pub join_buffer_size_limit: usize,
    /// Upper bound for in-memory temp tables before disk costs apply
    pub max_heap_table_size: usize,
    /// Size of the auxiliary buffer used by multi-range reads
    pub mrr_buffer_size: usize,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            join_buffer_size: 128 * 1024,
            join_buffer_space_limit: 1024 * 1024,
            join_buffer_size_limit: 0,
            max_heap_table_size: 16 * 1024 * 1024,
            mrr_buffer_size: 16 * 1024,
        }
    }
}
