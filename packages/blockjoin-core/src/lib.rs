//! Block-based join execution engine.
//!
//! Provides packed join buffers (flat and hashed), right-hand table
//! scanners over a storage handler interface, the join coordinator and
//! the semi-join execution structures.

pub mod cache;
pub mod config;
pub mod error;
pub mod exec;
pub mod keys;
pub mod row;
pub mod scan;
pub mod schema;
pub mod semijoin;
pub mod storage;
pub mod value;

pub use config::ExecConfig;
pub use error::JoinError;
pub use semijoin::SemiJoinStrategy;
