//! deployd library
//!
//! Webhook-driven deployment daemon: pulls a working copy, optionally builds
//! and publishes an image, migrates, rolls a swarm stack and streams progress
//! to operators while it runs.

pub mod app;
pub mod authn;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod notify;
pub mod server;
pub mod storage;
pub mod stream;
pub mod utils;
pub mod webhook;
pub mod workers;
