pub mod analytics;
pub mod config;
pub mod decode;
pub mod emotion;
pub mod features;
pub mod inference;
pub mod server;
