// Originally derived from https://github.com/istio/ztunnel (Apache 2.0 licensed)

pub mod bow;
pub mod drain;
pub mod prelude;
pub mod readiness;
pub mod signal;
pub mod telemetry;
pub mod trcng;
pub mod version;
