//! Deployment module

pub mod fsm;
pub mod helm;
pub mod locks;
pub mod naming;
pub mod orchestrator;
pub mod plan;
