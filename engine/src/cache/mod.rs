//! In-memory caches

pub mod version;
