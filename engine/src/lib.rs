//! kubedeck
//!
//! Deploys, upgrades and removes catalog applications on k3s-backed VPS hosts
//! over pooled SSH sessions, and keeps upstream version metadata fresh.

pub mod app;
pub mod cache;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod gateways;
pub mod kv;
pub mod logs;
pub mod models;
pub mod secrets;
pub mod ssh;
pub mod storage;
pub mod utils;
pub mod versions;
pub mod workers;
