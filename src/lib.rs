//! Backend for HoroQuiz live quiz sessions.
//!
//! The crate is organised around a per-room actor: the WebSocket layer
//! ([`server`]) parses client envelopes and forwards typed events into the
//! owning room's mailbox; the room actor ([`room`]) is the single writer for
//! all session state and persists durable effects through the [`store`]
//! gateway. Rooms are tracked process-wide by the [`registry`].

pub mod config;
pub mod grader;
pub mod heartbeat;
pub mod model;
pub mod outbound;
pub mod registry;
pub mod room;
pub mod server;
pub mod store;

pub use server::start_ws_server;
