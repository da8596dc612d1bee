//! Persisted and wire data models

pub mod deployment;
pub mod history;
