//! Disk management modules

pub mod bcache;
pub mod detection;
pub mod formatting;
pub mod gpt;
pub mod lvm;
pub mod naming;
pub mod partitioning;
pub mod query;
pub mod storage;
