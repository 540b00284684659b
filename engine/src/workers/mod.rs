//! Background workers

pub mod refresh;
pub mod scheduler;
pub mod sweeper;
