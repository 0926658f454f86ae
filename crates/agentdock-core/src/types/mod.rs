//! Core type definitions for AgentDock
//!
//! Shared types used across the scanner, the drivers and the orchestrator.

mod agent_types;
mod session_types;
mod settings_types;

pub use agent_types::*;
pub use session_types::*;
pub use settings_types::*;
