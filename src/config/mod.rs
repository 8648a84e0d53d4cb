//! Engine configuration

mod engine;

pub use engine::*;
