//! HTTP and WebSocket server

pub mod handlers;
pub mod response;
pub mod serve;
pub mod state;
pub mod stream;
