// ABOUTME: Stream gateway for Corral sessions
// ABOUTME: Ordered per-session event fan-out consumed by WebSocket connections

pub mod events;
pub mod gateway;

pub use events::{CompletionSummary, EventPayload, InboundMessage, StreamEvent, LAGGED_ERROR_CODE};
pub use gateway::{Connection, StreamGateway};
