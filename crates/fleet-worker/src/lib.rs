pub mod app;
pub mod client;
pub mod config;
pub mod health;
pub mod heartbeat;
pub mod registration;

pub use app::{WorkerApp, WorkerRuntime};
pub use config::{Config, parse_config};
