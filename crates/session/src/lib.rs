//! Bidirectional streaming sessions for agentwire.
//!
//! A session is one logical duplex connection: inbound envelopes (chat,
//! control, client tool results, ping) in, turn events and session events
//! out. It is transport-agnostic; a binding feeds [`TransportEvent`]s into a
//! [`SessionHandle`] and drains its outbound envelopes.
//!
//! [`SessionManager`] opens sessions (or re-attaches stored ones) and
//! [`SessionRegistry`] tracks the live ones for listing, broadcast, and
//! graceful shutdown.

pub mod manager;
pub mod registry;
pub mod session;
pub mod state;

pub use manager::SessionManager;
pub use registry::{Registration, SessionRegistry, SessionSnapshot};
pub use session::{SessionHandle, SessionSummary, TransportEvent};
pub use state::{CloseReason, SessionState};
