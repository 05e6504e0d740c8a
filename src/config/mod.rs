pub mod env;
mod loader;

pub use env::{AppConfig, BroadcastConfig, DirectoryConfig, RateLimits};
pub use loader::load_config;
