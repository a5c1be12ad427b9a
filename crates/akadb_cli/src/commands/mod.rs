//! CLI command implementations.

pub mod dump_log;
pub mod serve;
