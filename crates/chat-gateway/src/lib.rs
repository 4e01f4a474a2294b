//! Chat Gateway - metered LLM streaming with live supervisor observation.
//!
//! Each chat request reserves credits before the provider is contacted,
//! streams model output to its caller over SSE, mirrors every event to
//! any supervisors watching, and settles the reservation once the stream
//! ends for any reason.

pub mod api;
pub mod config;
pub mod error;
pub mod identity;
pub mod orchestrator;

pub use config::Config;
pub use error::GatewayError;
pub use identity::{Principal, Role};
pub use orchestrator::{
    SessionOrchestrator, SessionOutcome, StartedStream, StreamEnd, StreamRequest,
};
