pub mod challenge;
pub mod config;
pub mod harness;
pub mod memory;
pub mod redis;
pub mod service;
pub mod store;
pub mod types;
