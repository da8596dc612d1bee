//! Live run log streaming

pub mod broadcaster;
pub mod frame;
