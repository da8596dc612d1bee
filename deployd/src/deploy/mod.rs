//! Deployment pipeline

pub mod compose;
pub mod docker;
pub mod executor;
pub mod fsm;
pub mod git;
pub mod health;
pub mod lock;
pub mod privilege;
pub mod shell;
pub mod stage;
pub mod supervisor;
