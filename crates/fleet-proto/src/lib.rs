pub mod capability;
pub mod dispatch;
pub mod error;
pub mod registration;
pub mod version;

pub use capability::{CapabilityDefinition, ErrorCodeDef, IoContract};
pub use dispatch::{DispatchRequest, DispatchResult, RoutePolicy};
pub use error::{ParseError, SchemaViolation};
pub use registration::{HeartbeatRequest, RegisterRequest, RegisterResponse, WorkerState};
pub use version::Version;
