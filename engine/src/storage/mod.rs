//! On-disk storage

pub mod layout;
pub mod settings;
