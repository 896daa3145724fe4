//! Executor integration suite.
//!
//! Covers the buffered join algorithms end to end: flat and hashed
//! block nested loops, batched key access, chained buffers, outer-join
//! null complementation and cancellation.

pub mod helpers;
pub mod join_exec_tests;
