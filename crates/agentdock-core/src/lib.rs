//! AgentDock Core Library
//!
//! Runs heterogeneous agents behind one session API:
//! - Discovery and classification of agent directories on disk
//! - Runtime drivers for spawned processes, containers, n8n webhooks and
//!   the Voiceflow runtime
//! - An in-memory session registry
//! - The session orchestrator with restart-on-failure delivery
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     agentdock-core                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  orchestrator.rs - create/send/end/list/info/cleanup        │
//! │  scanner/        - Agent directory classification           │
//! │  session/        - Session handles and registry             │
//! │  driver/         - Per-kind start/deliver/stop              │
//! │  types/          - Shared type definitions, settings        │
//! │  error.rs        - Error types                              │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod driver;
pub mod error;
pub mod orchestrator;
pub mod scanner;
pub mod session;
pub mod types;

// Re-export commonly used types
pub use error::{Error, ErrorKind, Result};
pub use types::*;

pub use driver::{
    ContainerDriver, ContainerEngine, DirectProcessDriver, DockerCli, DriverReply, DriverTable,
    N8nDriver, RuntimeDriver, StartContext, StartedInstance, VoiceflowDriver,
    MAX_DELIVERY_RESTARTS,
};
pub use orchestrator::SessionOrchestrator;
pub use scanner::AgentScanner;
pub use session::{SessionHandle, SessionRegistry, Transport};
