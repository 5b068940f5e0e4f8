//! # Session Runtime
//!
//! Drives a [`SessionEngine`] on a tokio task. The engine decides; this module
//! only moves bytes and time:
//!
//! - commands from the [`SessionHandle`] become engine calls
//! - engine [`Action`]s become transport opens, writes and closes
//! - transport frames, capture blocks and due deadlines are fed back in
//! - engine events are forwarded to the event stream
//!
//! ## Task Layout:
//! ```text
//! SessionHandle ──commands──► runtime task ◄──inbound── transport pump task
//!                               │    ▲
//!                     events ◄──┘    └── capture blocks
//! ```
//!
//! The clock handed to the engine is tokio's, so paused-time tests advance
//! every deadline consistently.

use std::future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use crate::audio::devices::AudioDevices;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::session::engine::{Action, SessionEngine};
use crate::session::events::SessionEvent;
use crate::transport::{Connector, Inbound, Outbound, TransportLink, CLOSE_ABNORMAL, CLOSE_NORMAL};

/// Stream of everything the engine reports.
pub type EventStream = UnboundedReceiverStream<SessionEvent>;

type Reply = oneshot::Sender<EngineResult<()>>;

#[derive(Debug)]
enum Command {
    Connect { conversation_id: Option<String>, reply: Reply },
    Disconnect,
    SendText { text: String, reply: Reply },
    BargeIn,
    CommitAudio { reply: Reply },
    LocalSpeech,
    SetFocus(bool),
    ResetFatalError,
    Shutdown,
}

/// Cloneable control surface for a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl SessionHandle {
    pub async fn connect(&self, conversation_id: Option<String>) -> EngineResult<()> {
        self.request(|reply| Command::Connect { conversation_id, reply }).await
    }

    pub async fn send_text(&self, text: impl Into<String>) -> EngineResult<()> {
        let text = text.into();
        self.request(|reply| Command::SendText { text, reply }).await
    }

    pub async fn commit_audio(&self) -> EngineResult<()> {
        self.request(|reply| Command::CommitAudio { reply }).await
    }

    pub fn disconnect(&self) {
        self.post(Command::Disconnect);
    }

    pub fn barge_in(&self) {
        self.post(Command::BargeIn);
    }

    /// Report that the host's voice-activity detector heard the user.
    pub fn local_speech(&self) {
        self.post(Command::LocalSpeech);
    }

    pub fn set_focus(&self, focused: bool) {
        self.post(Command::SetFocus(focused));
    }

    pub fn reset_fatal_error(&self) {
        self.post(Command::ResetFatalError);
    }

    /// Disconnect and stop the runtime task.
    pub fn shutdown(&self) {
        self.post(Command::Shutdown);
    }

    fn post(&self, command: Command) {
        if self.tx.send(command).is_err() {
            debug!("session runtime already stopped");
        }
    }

    async fn request(&self, build: impl FnOnce(Reply) -> Command) -> EngineResult<()> {
        let (reply, response) = oneshot::channel();
        self.tx.send(build(reply)).map_err(|_| stopped())?;
        response.await.map_err(|_| stopped())?
    }
}

fn stopped() -> EngineError {
    EngineError::Transport("session runtime stopped".to_string())
}

pub struct SessionRuntime;

impl SessionRuntime {
    /// Spawn a runtime with a default-configured engine.
    pub fn spawn(
        config: EngineConfig,
        devices: Box<dyn AudioDevices>,
        connector: Arc<dyn Connector>,
    ) -> (SessionHandle, EventStream, JoinHandle<()>) {
        Self::spawn_with(config, devices, connector, |engine| engine)
    }

    /// Spawn a runtime, letting the caller customise the engine first
    /// (telemetry sink, recovery store, interruption policy).
    pub fn spawn_with<F>(
        config: EngineConfig,
        devices: Box<dyn AudioDevices>,
        connector: Arc<dyn Connector>,
        customise: F,
    ) -> (SessionHandle, EventStream, JoinHandle<()>)
    where
        F: FnOnce(SessionEngine) -> SessionEngine,
    {
        let (capture_tx, capture_rx) = mpsc::unbounded_channel();
        let engine = customise(SessionEngine::new(config, devices, capture_tx));

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (opened_tx, opened_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            engine,
            connector,
            link: None,
            events: event_tx,
            opened_tx,
        };
        let task = tokio::spawn(driver.run(command_rx, capture_rx, opened_rx));

        (
            SessionHandle { tx: command_tx },
            UnboundedReceiverStream::new(event_rx),
            task,
        )
    }
}

type OpenResult = (u64, EngineResult<TransportLink>);

struct Driver {
    engine: SessionEngine,
    connector: Arc<dyn Connector>,
    link: Option<TransportLink>,
    events: mpsc::UnboundedSender<SessionEvent>,
    opened_tx: mpsc::UnboundedSender<OpenResult>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut capture: mpsc::UnboundedReceiver<Vec<f32>>,
        mut opened: mpsc::UnboundedReceiver<OpenResult>,
    ) {
        info!("session runtime started");

        loop {
            let deadline = self.engine.next_deadline();

            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(Command::Shutdown) | None => {
                            self.engine.disconnect();
                            self.flush();
                            break;
                        }
                        Some(command) => self.handle_command(command),
                    }
                }

                Some((id, result)) = opened.recv() => self.handle_opened(id, result),

                inbound = next_inbound(&mut self.link) => self.handle_inbound(inbound),

                Some(block) = capture.recv() => self.engine.on_capture_block(&block),

                _ = sleep_until(deadline) => self.engine.on_tick(now()),
            }

            self.flush();
        }

        info!("session runtime stopped");
    }

    fn handle_command(&mut self, command: Command) {
        let now = now();
        match command {
            Command::Connect { conversation_id, reply } => {
                let _ = reply.send(self.engine.connect(conversation_id, now));
            }
            Command::Disconnect => self.engine.disconnect(),
            Command::SendText { text, reply } => {
                let _ = reply.send(self.engine.send_text(&text));
            }
            Command::BargeIn => self.engine.barge_in(now),
            Command::CommitAudio { reply } => {
                let _ = reply.send(self.engine.commit_audio(now));
            }
            Command::LocalSpeech => self.engine.on_local_speech(now),
            Command::SetFocus(focused) => self.engine.set_focus(focused, now),
            Command::ResetFatalError => self.engine.reset_fatal_error(),
            Command::Shutdown => {}
        }
    }

    fn handle_opened(&mut self, id: u64, result: EngineResult<TransportLink>) {
        let now = now();
        match result {
            Ok(link) => {
                // Install first: the engine queues session.init right away
                let previous = self.link.replace(link);
                if !self.engine.on_transport_opened(id, now) {
                    if let Some(stale) = self.link.take() {
                        let _ = stale.tx.send(Outbound::Close {
                            code: CLOSE_NORMAL,
                            reason: "superseded".to_string(),
                        });
                    }
                    self.link = previous;
                }
            }
            Err(err) => self.engine.on_transport_failed(id, err, now),
        }
    }

    fn handle_inbound(&mut self, inbound: Option<Inbound>) {
        let now = now();
        match inbound {
            Some(Inbound::Text(text)) => self.engine.on_text(&text, now),
            Some(Inbound::Binary(bytes)) => self.engine.on_binary(&bytes, now),
            Some(Inbound::Closed { code, reason }) => {
                self.link = None;
                self.engine.on_transport_closed(code, &reason, now);
            }
            None => {
                // Pump went away without reporting a close
                self.link = None;
                self.engine.on_transport_closed(CLOSE_ABNORMAL, "transport task ended", now);
            }
        }
    }

    /// Carry out queued actions and forward queued events.
    fn flush(&mut self) {
        for action in self.engine.drain_actions() {
            self.execute(action);
        }
        for event in self.engine.drain_events() {
            if self.events.send(event).is_err() {
                debug!("event stream dropped");
            }
        }
    }

    fn execute(&mut self, action: Action) {
        match action {
            Action::OpenTransport { id, url, credential } => {
                debug!(id, url = %url, "opening transport");
                let connector = Arc::clone(&self.connector);
                let opened_tx = self.opened_tx.clone();
                tokio::spawn(async move {
                    let result = connector.open(&url, &credential).await;
                    let _ = opened_tx.send((id, result));
                });
            }
            Action::Send(frame) => match &self.link {
                Some(link) => {
                    if link.tx.send(frame).is_err() {
                        warn!("transport writer gone, frame dropped");
                    }
                }
                None => debug!("no transport open, frame dropped"),
            },
            Action::CloseTransport { code, reason } => {
                if let Some(link) = self.link.take() {
                    let _ = link.tx.send(Outbound::Close { code, reason });
                }
            }
        }
    }
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}

async fn next_inbound(link: &mut Option<TransportLink>) -> Option<Inbound> {
    match link {
        Some(link) => link.rx.recv().await,
        None => future::pending().await,
    }
}

async fn sleep_until(deadline: Option<std::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(Instant::from_std(deadline)).await,
        None => future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::devices::{HeadlessDevices, OutputClock};
    use crate::session::status::ConnectionStatus;
    use crate::transport::loopback::{LoopbackConnector, ServerEnd};
    use serde_json::Value;
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_stream::StreamExt;

    const WAIT: Duration = Duration::from_secs(5);

    fn config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.server.auth_token = Some("secret".to_string());
        config
    }

    async fn next_client_message(server: &mut ServerEnd) -> Value {
        loop {
            let frame = timeout(WAIT, server.from_client.recv())
                .await
                .expect("timed out waiting for client frame")
                .expect("client link closed");
            if let Outbound::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    async fn wait_for_status(events: &mut EventStream, status: ConnectionStatus) {
        loop {
            let event = timeout(WAIT, events.next())
                .await
                .expect("timed out waiting for status")
                .expect("event stream ended");
            if let SessionEvent::StatusChanged { to, .. } = event {
                if to == status {
                    return;
                }
            }
        }
    }

    async fn handshake(server: &mut ServerEnd, events: &mut EventStream, session_id: &str) {
        let init = next_client_message(server).await;
        assert_eq!(init["type"], "session.init");
        server.send_text(r#"{"type":"session.init.ack","features":[]}"#);
        server.send_text(format!(
            r#"{{"type":"session.ready","session_id":"{}","recovery_eligible":true}}"#,
            session_id
        ));
        wait_for_status(events, ConnectionStatus::Ready).await;
    }

    #[tokio::test]
    async fn test_runtime_connects_and_sends_text() {
        let (connector, mut accepted) = LoopbackConnector::new();
        let devices = HeadlessDevices::new(OutputClock::Manual);
        let (handle, mut events, task) = SessionRuntime::spawn(config(), Box::new(devices), Arc::new(connector));

        handle.connect(None).await.unwrap();
        let mut server = timeout(WAIT, accepted.recv()).await.unwrap().unwrap();
        assert_eq!(server.credential, "secret");
        handshake(&mut server, &mut events, "s-1").await;

        handle.send_text("what's the weather").await.unwrap();
        let message = next_client_message(&mut server).await;
        assert_eq!(message["type"], "text.input");
        assert_eq!(message["text"], "what's the weather");

        handle.shutdown();
        timeout(WAIT, task).await.unwrap().unwrap();
        let close = timeout(WAIT, server.from_client.recv()).await.unwrap();
        assert!(matches!(close, Some(Outbound::Close { code: CLOSE_NORMAL, .. })));
    }

    #[tokio::test]
    async fn test_runtime_resumes_after_drop() {
        let (connector, mut accepted) = LoopbackConnector::new();
        let devices = HeadlessDevices::new(OutputClock::Manual);
        let (handle, mut events, _task) = SessionRuntime::spawn(config(), Box::new(devices), Arc::new(connector));

        handle.connect(None).await.unwrap();
        let mut server = timeout(WAIT, accepted.recv()).await.unwrap().unwrap();
        handshake(&mut server, &mut events, "s-2").await;

        server.close(CLOSE_ABNORMAL, "network");
        wait_for_status(&mut events, ConnectionStatus::Reconnecting).await;

        let mut server = timeout(WAIT, accepted.recv()).await.unwrap().unwrap();
        let resume = next_client_message(&mut server).await;
        assert_eq!(resume["type"], "session.resume");
        assert_eq!(resume["session_id"], "s-2");
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_send_text_before_ready_is_rejected() {
        let (connector, _accepted) = LoopbackConnector::new();
        let devices = HeadlessDevices::new(OutputClock::Manual);
        let (handle, _events, _task) = SessionRuntime::spawn(config(), Box::new(devices), Arc::new(connector));

        let err = handle.send_text("hello").await.unwrap_err();
        assert!(matches!(err, EngineError::NotReady(ConnectionStatus::Disconnected)));
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_handle_after_shutdown_reports_stopped() {
        let (connector, _accepted) = LoopbackConnector::new();
        let devices = HeadlessDevices::new(OutputClock::Manual);
        let (handle, _events, task) = SessionRuntime::spawn(config(), Box::new(devices), Arc::new(connector));

        handle.shutdown();
        timeout(WAIT, task).await.unwrap().unwrap();
        assert!(handle.connect(None).await.is_err());
    }
}
