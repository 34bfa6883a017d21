//! Live game sessions: the registry, the wire protocol and the per-connection broker.
//!
//! A host creates a session under a short shareable code, participants join it, and any
//! participant may replace the shared state. The state itself is opaque here; whichever game
//! runs on top decides what it means.

pub mod broker;
pub mod code;
pub mod error;
pub mod model;
pub mod protocol;
pub mod registry;

pub use broker::{Broker, Connection};
pub use error::SessionError;
pub use model::{EndReason, Session, SessionEvent};
pub use protocol::{ClientMessage, ServerMessage};
pub use registry::{JoinOutcome, LeaveOutcome, RegistrySettings, SessionRegistry};
