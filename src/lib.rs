//! Storix library - storage layout classification and mutation

pub mod config;
pub mod configure;
pub mod disk;
pub mod layout;
pub mod utils;

pub use config::EngineConfig;
pub use layout::{classifier::classify, Layout, LayoutMutator, Transition};
pub use utils::error::StorixError;
