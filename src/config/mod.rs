//! Configuration models and loading.
pub mod loader;
pub mod models;

pub use loader::load_config;
pub use models::{LogFormat, ServerConfig};
