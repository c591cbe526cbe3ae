//! Command implementations.

pub mod call;
pub mod config;
pub mod ping;
pub mod serve;
