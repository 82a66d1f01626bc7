// ABOUTME: Shared configuration for Tether packages
// ABOUTME: Exposes environment variable names and the typed Settings loader

pub mod constants;
pub mod settings;

pub use settings::{ConfigError, Settings};
