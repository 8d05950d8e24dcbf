pub mod config;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod quota;
pub mod registry;
pub mod relay;
pub mod sessions;
pub mod upstream;
pub mod utils;
pub mod web;
