pub mod config;
pub mod generation;
pub mod hf_inference;
pub mod manuscript;
pub mod models;
pub mod ollama;
pub mod pipeline;
pub mod prompt;
pub mod revise;
pub mod run_log;
pub mod sanitize;
pub mod segment;

pub use config::AppConfig;
pub use pipeline::Reviser;
