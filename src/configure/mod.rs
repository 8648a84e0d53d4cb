//! Boot-time activation of storage resources

pub mod swap;
