//! Configuration module
//!
//! Handles loading server settings from disk.

mod server;

pub use server::*;
