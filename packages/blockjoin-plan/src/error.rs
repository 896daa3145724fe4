//! Planner error types.

use thiserror::Error;

use blockjoin_core::JoinError;

/// Planning and rewrite errors.
#[derive(Error, Debug)]
pub enum PlanError {
    /// IN predicate operand count differs from the subquery select list
    #[error("IN predicate has {left} operands but the subquery selects {right}")]
    OperandCountMismatch { left: usize, right: usize },

    /// The flattened join would exceed the table limit
    #[error("Join of {needed} tables exceeds the limit of {limit}")]
    TooManyTables { needed: usize, limit: usize },

    /// Semi-join flattening conflicts with STRAIGHT_JOIN
    #[error("Semi-join flattening cannot be applied under STRAIGHT_JOIN")]
    StraightJoinConflict,

    /// The query block has no tables to plan
    #[error("Query block has no tables")]
    EmptyFromList,

    /// An IN subquery survived flattening and has no execution method
    #[error("IN subquery could not be flattened into a semi-join")]
    UnsupportedSubquery,

    /// No valid join order satisfies the dependencies
    #[error("No valid join order found")]
    NoJoinOrder,

    /// Executor-level failure during plan setup
    #[error(transparent)]
    Exec(#[from] JoinError),
}
