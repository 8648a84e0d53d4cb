//! Shared utilities

pub mod command;
pub mod deps;
pub mod error;
pub mod signal;
