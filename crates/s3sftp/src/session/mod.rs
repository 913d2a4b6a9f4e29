//! Per-connection state and the table of live sessions.

mod context;
mod registry;

pub use context::{ResolvedPath, SessionContext};
pub use registry::{
    CloseOutcome, ConnectionTransport, SessionRegistry, SessionSnapshot, TransportHandle,
};
