pub mod commands;
pub mod config;
pub mod render;
pub mod tracing_setup;

pub use config::CliConfig;
pub use tracing_setup::init_tracing;
