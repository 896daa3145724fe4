//! Cost model constants and estimates.

/// Cost constants of the planner. Temp-table lookups have two rates: a
/// tuple set that outgrows the heap limit pays the disk rate.
#[derive(Debug, Clone)]
pub struct CostModel {
    /// Reading one row sequentially
    pub row_read_cost: f64,
    /// Reading one row through an index lookup
    pub key_lookup_cost: f64,
    /// One lookup or write against an in-memory temp table
    pub heap_temptable_lookup_cost: f64,
    /// One lookup or write against a spilled temp table
    pub disk_temptable_lookup_cost: f64,
    /// Default selectivity of an equality that cannot use an index
    pub default_eq_selectivity: f64,
    /// Heap temp tables above this byte size pay the disk rate
    pub max_heap_table_size: usize,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            row_read_cost: 1.0,
            key_lookup_cost: 1.0,
            heap_temptable_lookup_cost: 0.05,
            disk_temptable_lookup_cost: 1.0,
            default_eq_selectivity: 0.1,
            max_heap_table_size: 16 * 1024 * 1024,
        }
    }
}

impl CostModel {
    /// Lookup cost for a weedout temp table holding `rows` tuples of
    /// `tuple_size` bytes.
    pub fn temptable_lookup_cost(&self, rows: f64, tuple_size: usize) -> f64 {
        if rows * tuple_size as f64 > self.max_heap_table_size as f64 {
            self.disk_temptable_lookup_cost
        } else {
            self.heap_temptable_lookup_cost
        }
    }
}
