//! Planner integration suite: flattening, strategy selection and
//! end-to-end execution of the four semi-join strategies.

pub mod helpers;
pub mod semijoin_tests;
