//! Session orchestrator
//!
//! The public face of the adapter. Resolves agent ids against the cached scan,
//! dispatches to the driver registered for each agent kind and keeps the
//! session registry in step with what is actually running.
//!
//! Sessions move through `created -> active -> ended`. A dead backing
//! instance is only discovered on the next `send_message`, where the driver's
//! restart loop either recovers it or the call fails with `DeliveryFailed`.
//! There is no background liveness sweep, so an instance that dies between
//! messages keeps its registry entry until it is used, ended or cleaned up.

use crate::driver::{DriverTable, RuntimeDriver, StartContext};
use crate::error::{Error, Result, SessionError};
use crate::scanner::AgentScanner;
use crate::session::{SessionHandle, SessionRegistry, SessionSlot};
use crate::types::{
    AdapterSettings, AgentDescriptor, CleanupFailure, CleanupReport, CreatedSession,
    MessageReply, SessionInfo,
};
use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Long-lived adapter context, constructed once and shared by reference
pub struct SessionOrchestrator {
    /// Descriptors from the last scan, keyed by agent id
    descriptors: RwLock<HashMap<String, AgentDescriptor>>,
    registry: SessionRegistry,
    drivers: DriverTable,
    settings: AdapterSettings,
}

impl SessionOrchestrator {
    /// Orchestrator with the four production drivers
    pub fn new(settings: AdapterSettings) -> Self {
        let drivers = DriverTable::standard(&settings);
        Self::with_drivers(settings, drivers)
    }

    pub fn with_drivers(settings: AdapterSettings, drivers: DriverTable) -> Self {
        Self {
            descriptors: RwLock::new(HashMap::new()),
            registry: SessionRegistry::new(),
            drivers,
            settings,
        }
    }

    /// Scan `root` and replace the cached descriptors.
    ///
    /// Live sessions keep running even if their agent disappeared.
    pub fn scan(&self, root: impl AsRef<Path>) -> Result<Vec<AgentDescriptor>> {
        let found = AgentScanner::from_settings(&self.settings).scan(root)?;

        let mut cache = self.descriptors.write();
        cache.clear();
        cache.extend(found.iter().map(|d| (d.id.clone(), d.clone())));

        Ok(found)
    }

    /// Cached descriptors sorted by id
    pub fn descriptors(&self) -> Vec<AgentDescriptor> {
        let mut all: Vec<_> = self.descriptors.read().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn descriptor(&self, id: &str) -> Option<AgentDescriptor> {
        self.descriptors.read().get(id).cloned()
    }

    /// Start an instance of `agent_id` and register it under a new session id.
    ///
    /// A driver start failure is returned as is and leaves no registry entry.
    pub async fn create_session(
        &self,
        agent_id: &str,
        config: HashMap<String, String>,
    ) -> Result<CreatedSession> {
        let descriptor = self
            .descriptor(agent_id)
            .filter(AgentDescriptor::is_runnable)
            .ok_or_else(|| SessionError::UnknownAgent(agent_id.to_string()))?;

        let driver = self
            .drivers
            .get(descriptor.kind)
            .ok_or_else(|| SessionError::UnsupportedKind(descriptor.kind.to_string()))?;

        let session_id = uuid::Uuid::new_v4().to_string();
        info!(
            agent_id = %descriptor.id,
            kind = %descriptor.kind,
            session_id = %session_id,
            "Creating session"
        );

        let ctx = StartContext {
            session_id: session_id.clone(),
            config,
        };
        let started = driver.start(&descriptor, &ctx).await.map_err(|e| {
            error!(agent_id = %descriptor.id, "Failed to start agent: {}", e);
            e
        })?;

        let handle = SessionHandle::new(
            session_id.clone(),
            descriptor.id.clone(),
            descriptor.kind,
            started.transport,
            started.backing,
        );
        self.registry.put(handle);

        Ok(CreatedSession {
            session_id,
            agent_id: descriptor.id,
            kind: descriptor.kind,
        })
    }

    /// Deliver one message to a live session.
    ///
    /// The delivery runs on its own task, so a caller that gives up waiting
    /// does not interrupt a restart half way through.
    pub async fn send_message(&self, session_id: &str, message: &str) -> Result<MessageReply> {
        let slot = self.registry.get(session_id)?;
        let driver = self.driver_for(&slot)?;

        let message = message.to_string();
        tokio::spawn(Self::deliver_on_slot(slot, driver, message))
            .await
            .map_err(|e| Error::Internal(format!("Delivery task failed: {}", e)))?
    }

    async fn deliver_on_slot(
        slot: Arc<SessionSlot>,
        driver: Arc<dyn RuntimeDriver>,
        message: String,
    ) -> Result<MessageReply> {
        let mut handle = slot.lock().await;
        if handle.is_ended() {
            // Ended while this call waited on the lock
            return Err(Error::session_not_found(&slot.session_id));
        }

        let outcome = driver.deliver(&mut handle, &message).await;
        slot.sync_port(&handle);

        match outcome {
            Ok(reply) => {
                handle.retry_count = 0;
                debug!(
                    session_id = %slot.session_id,
                    attempts = reply.attempts,
                    "Reply received"
                );
                Ok(MessageReply {
                    session_id: slot.session_id.clone(),
                    reply: reply.reply,
                    raw: reply.raw,
                    attempts: reply.attempts,
                })
            }
            Err(e) => {
                handle.retry_count += 1;
                warn!(
                    session_id = %slot.session_id,
                    retry_count = handle.retry_count,
                    "Message delivery failed: {}",
                    e
                );
                Err(e)
            }
        }
    }

    /// Stop a session and forget it. The registry entry is removed even when
    /// teardown fails; the failure is only logged.
    pub async fn end_session(&self, session_id: &str) -> Result<()> {
        let slot = self
            .registry
            .remove(session_id)
            .ok_or_else(|| Error::session_not_found(session_id))?;

        info!(session_id = %session_id, "Ending session");
        if let Err(e) = self.stop_slot(&slot).await {
            warn!(session_id = %session_id, "Teardown failed: {}", e);
        }
        Ok(())
    }

    /// Snapshot of every live session, oldest first. Never touches a driver.
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<_> = self.registry.list().iter().map(|s| s.info()).collect();
        sessions.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        sessions
    }

    pub fn get_session_info(&self, session_id: &str) -> Result<SessionInfo> {
        Ok(self.registry.get(session_id)?.info())
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Stop every live session best-effort and clear the registry
    pub async fn cleanup_all(&self) -> CleanupReport {
        let slots = self.registry.drain();
        if slots.is_empty() {
            return CleanupReport::default();
        }
        info!("Cleaning up {} sessions", slots.len());

        let outcomes = join_all(slots.iter().map(|slot| async move {
            (slot.session_id.clone(), self.stop_slot(slot).await)
        }))
        .await;

        let mut report = CleanupReport::default();
        for (session_id, outcome) in outcomes {
            match outcome {
                Ok(()) => report.stopped += 1,
                Err(e) => {
                    warn!(session_id = %session_id, "Teardown failed: {}", e);
                    report.failures.push(CleanupFailure {
                        session_id,
                        message: e.to_string(),
                    });
                }
            }
        }
        report
    }

    fn driver_for(&self, slot: &SessionSlot) -> Result<Arc<dyn RuntimeDriver>> {
        self.drivers
            .get(slot.kind)
            .ok_or_else(|| SessionError::UnsupportedKind(slot.kind.to_string()).into())
    }

    /// Mark the handle ended, then stop its instance.
    /// The slot must already be out of the registry.
    async fn stop_slot(&self, slot: &SessionSlot) -> Result<()> {
        let mut handle = slot.lock().await;
        if handle.is_ended() {
            return Ok(());
        }
        handle.ended = true;

        let driver = self.driver_for(slot)?;
        driver.stop(&mut handle).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverReply, StartedInstance};
    use crate::error::ErrorKind;
    use crate::session::Transport;
    use crate::types::AgentKind;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Records calls; failure modes are fixed at construction
    struct FakeDriver {
        kind: AgentKind,
        starts: AtomicUsize,
        delivers: AtomicUsize,
        stops: AtomicUsize,
        fail_start: bool,
        fail_stop: bool,
        /// Simulate an instance that died and had to be restarted once
        restart_once: bool,
        fail_deliver: bool,
        /// Time each delivery takes
        delay: Option<Duration>,
        inflight: AtomicUsize,
        max_inflight: AtomicUsize,
        completed: AtomicUsize,
    }

    impl FakeDriver {
        fn new(kind: AgentKind) -> Self {
            Self {
                kind,
                starts: AtomicUsize::new(0),
                delivers: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
                fail_start: false,
                fail_stop: false,
                restart_once: false,
                fail_deliver: false,
                delay: None,
                inflight: AtomicUsize::new(0),
                max_inflight: AtomicUsize::new(0),
                completed: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.starts.load(Ordering::SeqCst)
                + self.delivers.load(Ordering::SeqCst)
                + self.stops.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RuntimeDriver for FakeDriver {
        fn kind(&self) -> AgentKind {
            self.kind
        }

        async fn start(
            &self,
            _descriptor: &AgentDescriptor,
            _ctx: &StartContext,
        ) -> Result<StartedInstance> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_start {
                return Err(Error::start_failed("image build exploded"));
            }
            Ok(StartedInstance {
                transport: Transport::http("localhost", 4100),
                backing: None,
            })
        }

        async fn deliver(
            &self,
            handle: &mut SessionHandle,
            message: &str,
        ) -> Result<DriverReply> {
            self.delivers.fetch_add(1, Ordering::SeqCst);
            let now = self.inflight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_inflight.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.inflight.fetch_sub(1, Ordering::SeqCst);
            self.completed.fetch_add(1, Ordering::SeqCst);

            if self.fail_deliver {
                handle.retry_count += 2;
                return Err(Error::delivery_failed("connection refused"));
            }
            let mut attempts = 1;
            if self.restart_once {
                handle.retry_count += 1;
                handle.transport = Transport::http("localhost", 4200);
                attempts = 2;
            }
            let reply = format!("{} back", message);
            Ok(DriverReply {
                raw: json!({ "reply": reply }),
                reply,
                attempts,
            })
        }

        async fn stop(&self, _handle: &mut SessionHandle) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            if self.fail_stop {
                return Err(Error::teardown_failed("container already gone"));
            }
            Ok(())
        }
    }

    /// Agents tree with one agent of every runnable kind plus an unknown one
    fn fixture_tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let write = |rel: &str, content: &str| {
            let path = root.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        };
        write("echo-py/main.py", "print('hi')");
        write("echo-docker/Dockerfile", "FROM python:3.11-slim");
        write("echo-docker/main.py", "print('hi')");
        write("flow/flow.json", r#"{"nodes": [], "connections": {}}"#);
        write("greeter/greeter.vf", "{}");
        write("notes/notes.txt", "nothing runnable");
        dir
    }

    fn orchestrator(drivers: Vec<Arc<FakeDriver>>) -> (SessionOrchestrator, TempDir) {
        let mut table = DriverTable::new();
        for driver in drivers {
            table.register(driver);
        }
        let orch = SessionOrchestrator::with_drivers(AdapterSettings::default(), table);
        let tree = fixture_tree();
        orch.scan(tree.path()).unwrap();
        (orch, tree)
    }

    #[test]
    fn test_scan_caches_descriptors() {
        let (orch, _tree) = orchestrator(vec![]);

        let kinds: Vec<_> = orch.descriptors().iter().map(|d| (d.id.clone(), d.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                ("echo-docker".to_string(), AgentKind::Container),
                ("echo-py".to_string(), AgentKind::DirectProcess),
                ("flow".to_string(), AgentKind::N8nWorkflow),
                ("greeter".to_string(), AgentKind::VoiceflowFlow),
                ("notes".to_string(), AgentKind::Unknown),
            ]
        );
        assert!(orch.descriptor("echo-py").is_some());
        assert!(orch.descriptor("missing").is_none());
    }

    #[tokio::test]
    async fn test_create_unknown_agent_leaves_registry_empty() {
        let fake = Arc::new(FakeDriver::new(AgentKind::DirectProcess));
        let (orch, _tree) = orchestrator(vec![fake.clone()]);

        let err = orch.create_session("nope", HashMap::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownAgent);

        let err = orch.create_session("notes", HashMap::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownAgent);

        assert_eq!(orch.session_count(), 0);
        assert_eq!(fake.calls(), 0);
    }

    #[tokio::test]
    async fn test_create_without_driver_is_unsupported_kind() {
        let (orch, _tree) = orchestrator(vec![]);

        let err = orch.create_session("greeter", HashMap::new()).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::UnsupportedKind);
        assert_eq!(orch.session_count(), 0);
    }

    #[tokio::test]
    async fn test_start_failure_returned_verbatim() {
        let mut fake = FakeDriver::new(AgentKind::Container);
        fake.fail_start = true;
        let (orch, _tree) = orchestrator(vec![Arc::new(fake)]);

        let err = orch.create_session("echo-docker", HashMap::new()).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::DriverStartFailed);
        assert!(err.to_string().contains("image build exploded"));
        assert!(orch.list_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_reply_passed_through_unchanged() {
        let fake = Arc::new(FakeDriver::new(AgentKind::DirectProcess));
        let (orch, _tree) = orchestrator(vec![fake.clone()]);

        let created = orch.create_session("echo-py", HashMap::new()).await.unwrap();
        assert_eq!(created.agent_id, "echo-py");
        assert_eq!(created.kind, AgentKind::DirectProcess);
        assert!(uuid::Uuid::parse_str(&created.session_id).is_ok());

        let reply = orch.send_message(&created.session_id, "hi").await.unwrap();

        assert_eq!(reply.reply, "hi back");
        assert_eq!(reply.raw, json!({ "reply": "hi back" }));
        assert_eq!(reply.session_id, created.session_id);
        assert_eq!(fake.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_restart_during_send_resets_retry_count() {
        let mut fake = FakeDriver::new(AgentKind::DirectProcess);
        fake.restart_once = true;
        let (orch, _tree) = orchestrator(vec![Arc::new(fake)]);
        let created = orch.create_session("echo-py", HashMap::new()).await.unwrap();

        let reply = orch.send_message(&created.session_id, "hi").await.unwrap();

        assert_eq!(reply.attempts, 2);
        let slot = orch.registry.get(&created.session_id).unwrap();
        assert_eq!(slot.lock().await.retry_count, 0);
        assert_eq!(orch.get_session_info(&created.session_id).unwrap().port, Some(4200));
    }

    #[tokio::test]
    async fn test_failed_send_increments_retry_count() {
        let mut fake = FakeDriver::new(AgentKind::DirectProcess);
        fake.fail_deliver = true;
        let (orch, _tree) = orchestrator(vec![Arc::new(fake)]);
        let created = orch.create_session("echo-py", HashMap::new()).await.unwrap();

        let err = orch.send_message(&created.session_id, "hi").await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::DeliveryFailed);
        let slot = orch.registry.get(&created.session_id).unwrap();
        assert_eq!(slot.lock().await.retry_count, 3);
    }

    #[tokio::test]
    async fn test_same_session_sends_are_serialized() {
        let mut fake = FakeDriver::new(AgentKind::DirectProcess);
        fake.delay = Some(Duration::from_millis(50));
        let fake = Arc::new(fake);
        let (orch, _tree) = orchestrator(vec![fake.clone()]);
        let created = orch.create_session("echo-py", HashMap::new()).await.unwrap();

        let (first, second) = tokio::join!(
            orch.send_message(&created.session_id, "one"),
            orch.send_message(&created.session_id, "two"),
        );

        assert_eq!(first.unwrap().reply, "one back");
        assert_eq!(second.unwrap().reply, "two back");
        assert_eq!(fake.delivers.load(Ordering::SeqCst), 2);
        assert_eq!(fake.max_inflight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_abandoned_send_still_completes() {
        let mut fake = FakeDriver::new(AgentKind::DirectProcess);
        fake.delay = Some(Duration::from_millis(100));
        fake.restart_once = true;
        let fake = Arc::new(fake);
        let (orch, _tree) = orchestrator(vec![fake.clone()]);
        let created = orch.create_session("echo-py", HashMap::new()).await.unwrap();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            orch.send_message(&created.session_id, "hi"),
        )
        .await;
        assert!(abandoned.is_err());

        for _ in 0..200 {
            if fake.completed.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(fake.completed.load(Ordering::SeqCst), 1);

        // The bookkeeping after delivery ran even though nobody awaited it
        let slot = orch.registry.get(&created.session_id).unwrap();
        assert_eq!(slot.lock().await.retry_count, 0);
        assert_eq!(orch.get_session_info(&created.session_id).unwrap().port, Some(4200));
    }

    #[tokio::test]
    async fn test_send_to_missing_or_ended_session_never_reaches_driver() {
        let fake = Arc::new(FakeDriver::new(AgentKind::DirectProcess));
        let (orch, _tree) = orchestrator(vec![fake.clone()]);

        let err = orch.send_message("never-created", "hi").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionNotFound);

        let created = orch.create_session("echo-py", HashMap::new()).await.unwrap();
        orch.end_session(&created.session_id).await.unwrap();

        let err = orch.send_message(&created.session_id, "hi").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionNotFound);
        assert_eq!(fake.delivers.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_send_waiting_on_ended_handle_is_not_found() {
        let fake = Arc::new(FakeDriver::new(AgentKind::DirectProcess));
        let mut handle = SessionHandle::new(
            "s-ended",
            "echo-py",
            AgentKind::DirectProcess,
            Transport::http("localhost", 4100),
            None,
        );
        handle.ended = true;
        let slot = SessionRegistry::new().put(handle);

        let err = SessionOrchestrator::deliver_on_slot(slot, fake.clone(), "hi".to_string())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::SessionNotFound);
        assert_eq!(fake.delivers.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_end_session_removes_entry_even_when_stop_fails() {
        let mut fake = FakeDriver::new(AgentKind::Container);
        fake.fail_stop = true;
        let fake = Arc::new(fake);
        let (orch, _tree) = orchestrator(vec![fake.clone()]);
        let created = orch.create_session("echo-docker", HashMap::new()).await.unwrap();

        orch.end_session(&created.session_id).await.unwrap();

        let err = orch.get_session_info(&created.session_id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionNotFound);
        assert_eq!(fake.stops.load(Ordering::SeqCst), 1);

        let err = orch.end_session(&created.session_id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionNotFound);
        assert_eq!(fake.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_list_and_info() {
        let (orch, _tree) = orchestrator(vec![
            Arc::new(FakeDriver::new(AgentKind::DirectProcess)),
            Arc::new(FakeDriver::new(AgentKind::VoiceflowFlow)),
        ]);
        let first = orch.create_session("echo-py", HashMap::new()).await.unwrap();
        let second = orch.create_session("greeter", HashMap::new()).await.unwrap();

        let sessions = orch.list_sessions();
        assert_eq!(sessions.len(), 2);
        assert!(sessions.iter().all(|s| s.uptime_ms >= 0));

        let info = orch.get_session_info(&first.session_id).unwrap();
        assert_eq!(info.agent_id, "echo-py");
        assert_eq!(info.kind, AgentKind::DirectProcess);
        assert_eq!(info.port, Some(4100));

        let info = orch.get_session_info(&second.session_id).unwrap();
        assert_eq!(info.kind, AgentKind::VoiceflowFlow);
    }

    #[tokio::test]
    async fn test_cleanup_all_clears_registry_despite_failures() {
        let mut failing = FakeDriver::new(AgentKind::Container);
        failing.fail_stop = true;
        let failing = Arc::new(failing);
        let (orch, _tree) = orchestrator(vec![
            Arc::new(FakeDriver::new(AgentKind::DirectProcess)),
            failing.clone(),
            Arc::new(FakeDriver::new(AgentKind::N8nWorkflow)),
            Arc::new(FakeDriver::new(AgentKind::VoiceflowFlow)),
        ]);
        for agent in ["echo-py", "echo-py", "echo-docker", "flow", "greeter"] {
            orch.create_session(agent, HashMap::new()).await.unwrap();
        }
        assert_eq!(orch.list_sessions().len(), 5);

        let report = orch.cleanup_all().await;

        assert_eq!(report.stopped, 4);
        assert_eq!(report.failures.len(), 1);
        assert!(!report.is_clean());
        assert!(orch.list_sessions().is_empty());
        assert_eq!(failing.stops.load(Ordering::SeqCst), 1);

        let report = orch.cleanup_all().await;
        assert_eq!(report.stopped, 0);
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_concurrent_sessions_are_independent() {
        let fake = Arc::new(FakeDriver::new(AgentKind::DirectProcess));
        let (orch, _tree) = orchestrator(vec![fake.clone()]);
        let orch = Arc::new(orch);

        let mut tasks = Vec::new();
        for i in 0..8 {
            let orch = Arc::clone(&orch);
            tasks.push(tokio::spawn(async move {
                let created = orch.create_session("echo-py", HashMap::new()).await?;
                orch.send_message(&created.session_id, &format!("m{}", i)).await
            }));
        }

        for (i, task) in tasks.into_iter().enumerate() {
            let reply = task.await.unwrap().unwrap();
            assert_eq!(reply.reply, format!("m{} back", i));
        }
        assert_eq!(orch.session_count(), 8);
        assert_eq!(fake.delivers.load(Ordering::SeqCst), 8);
    }
}
