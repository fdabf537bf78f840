pub mod cache;
pub mod config;
pub mod context;
pub mod filelock;
pub mod types;
