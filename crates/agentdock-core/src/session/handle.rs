//! Live session handle

use crate::driver::{ContainerInstance, ProcessInstance};
use crate::types::AgentKind;
use std::fmt;

/// Kind-specific connection info for a session
#[derive(Debug, Clone)]
pub enum Transport {
    /// Local HTTP endpoint of a spawned process or a container's mapped port
    Http { host: String, port: u16 },
    /// Cached n8n workflow definition, triggered through its webhook node
    Webhook { workflow: serde_json::Value },
    /// Voiceflow export plus the runtime state returned by the last turn
    Voiceflow {
        flow: Vec<u8>,
        state: Option<serde_json::Value>,
    },
}

impl Transport {
    pub fn http(host: impl Into<String>, port: u16) -> Self {
        Self::Http {
            host: host.into(),
            port,
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Http { port, .. } => Some(*port),
            _ => None,
        }
    }

    /// `http://host:port` for HTTP transports
    pub fn base_url(&self) -> Option<String> {
        match self {
            Self::Http { host, port } => Some(format!("http://{}:{}", host, port)),
            _ => None,
        }
    }
}

/// Process or container exclusively owned by a session
pub enum BackingHandle {
    Process(ProcessInstance),
    Container(ContainerInstance),
}

impl fmt::Debug for BackingHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process(p) => f.debug_tuple("Process").field(&p.pid()).finish(),
            Self::Container(c) => f.debug_tuple("Container").field(&c.container_id).finish(),
        }
    }
}

/// One live instance of a running agent
#[derive(Debug)]
pub struct SessionHandle {
    pub session_id: String,
    /// Descriptor the session was created from (lookup only)
    pub descriptor_id: String,
    pub kind: AgentKind,
    pub transport: Transport,
    pub backing: Option<BackingHandle>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Restarts since the last successful exchange
    pub retry_count: u32,
    pub(crate) ended: bool,
}

impl SessionHandle {
    pub fn new(
        session_id: impl Into<String>,
        descriptor_id: impl Into<String>,
        kind: AgentKind,
        transport: Transport,
        backing: Option<BackingHandle>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            descriptor_id: descriptor_id.into(),
            kind,
            transport,
            backing,
            created_at: chrono::Utc::now(),
            retry_count: 0,
            ended: false,
        }
    }

    pub fn process_mut(&mut self) -> Option<&mut ProcessInstance> {
        match self.backing.as_mut() {
            Some(BackingHandle::Process(p)) => Some(p),
            _ => None,
        }
    }

    pub fn container_mut(&mut self) -> Option<&mut ContainerInstance> {
        match self.backing.as_mut() {
            Some(BackingHandle::Container(c)) => Some(c),
            _ => None,
        }
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }
}
