//! Session state
//!
//! - `SessionHandle` - one live agent instance and its transport
//! - `SessionRegistry` - the authoritative session-id -> handle map

mod handle;
mod registry;

pub use handle::{BackingHandle, SessionHandle, Transport};
pub use registry::{SessionRegistry, SessionSlot};
