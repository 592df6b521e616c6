//! Client-side configuration for the `mealsync` CLI.

pub mod config;

pub use config::ClientConfig;
