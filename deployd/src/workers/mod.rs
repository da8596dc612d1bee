//! Background workers

pub mod coordinator;
