//! Relay server module
//!
//! Accepts WebSocket connections from the control and execution roles,
//! decodes their command envelopes and routes them to relay handlers.

mod handler;
mod protocol;
mod registry;
mod router;
mod websocket;

pub use handler::*;
pub use protocol::*;
pub use registry::*;
pub use router::*;
pub use websocket::*;
