pub mod app;
pub mod cli;
pub mod config;
pub mod error;
pub mod journaling;
pub mod model;
pub mod storage;
pub mod sync;

pub use config::{AppConfig, ConfigLoader, ConfigPaths};
