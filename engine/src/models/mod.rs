//! Data models

pub mod application;
pub mod catalog;
pub mod vps;
