//! Per-session fan-out for streamed model output.
//!
//! Each live session has one writer (the [`RelayPublisher`]) and one primary
//! consumer, plus any number of observers. Every event gets the next
//! sequence number, lands in a bounded replay buffer and is pushed to every
//! consumer, so all of them see the same gap-free order. A late observer
//! receives the buffered history first, bracketed by markers, and then
//! continues live from where the history ends.
//!
//! ```text
//! open_primary ──► publish × N ──► complete / fail
//!                     │
//!      ┌──────────────┼──────────────┐
//!   primary       observer A     observer B (late: history, then live)
//! ```
//!
//! Observers have bounded queues. One that falls behind is dropped instead
//! of slowing the writer.

mod config;
mod error;
mod event;
mod observer;
mod registry;
mod session;

pub use config::RelayConfig;
pub use error::RelayError;
pub use event::{EventKind, StreamEvent};
pub use observer::{ObserverHandle, ObserverMessage};
pub use registry::{RelayRegistry, RelaySummary};
pub use session::RelayPublisher;
