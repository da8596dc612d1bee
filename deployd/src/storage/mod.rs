//! Persistent storage: paths, settings and the deployment store

pub mod history;
pub mod layout;
pub mod settings;
pub mod store;
