// Export modules for testing and usage
pub mod backup;
pub mod catalog;
pub mod cli;
pub mod commands;
pub mod compression;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod postgres;
