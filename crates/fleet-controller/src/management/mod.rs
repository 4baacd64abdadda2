pub mod admin;
mod hyper_helpers;
pub mod metrics_server;
pub mod readiness_server;
