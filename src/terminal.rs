//! Interactive terminal sessions relayed between a client connection and a
//! shell running inside a sandbox.
//!
//! A [`TerminalBridge`] is the consumer for one client connection: it receives
//! [`ClientEvent`]s over a channel and emits [`ServerEvent`]s over another, so
//! the state machine can be driven without a socket. Each attachment gets one
//! producer task pumping exec output to the client.
//!
//! A second `attach-terminal` while streaming ends the current attachment
//! silently and replaces it.

use crate::backend::{ContainerHandle, ExecInput, ExecStream};
use crate::state::SandboxRegistry;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Events a client sends over its connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    AttachTerminal { id: String },
    TerminalInput(Vec<u8>),
    TerminalResize { rows: u16, cols: u16 },
}

#[derive(Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
enum ClientMessage {
    AttachTerminal {
        #[serde(alias = "containerId")]
        id: String,
    },
    TerminalInput(String),
    TerminalResize {
        rows: u16,
        cols: u16,
    },
}

impl ClientEvent {
    /// Parses a JSON text frame.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        Ok(match serde_json::from_str::<ClientMessage>(text)? {
            ClientMessage::AttachTerminal { id } => ClientEvent::AttachTerminal { id },
            ClientMessage::TerminalInput(data) => ClientEvent::TerminalInput(data.into_bytes()),
            ClientMessage::TerminalResize { rows, cols } => {
                ClientEvent::TerminalResize { rows, cols }
            }
        })
    }
}

/// Events sent back to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    TerminalOutput(String),
    TerminalDisconnected,
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    Idle,
    Attaching,
    Streaming,
    Closed,
}

struct Attachment {
    generation: u64,
    container_id: String,
    exec_id: String,
    handle: ContainerHandle,
    input: ExecInput,
    pump: JoinHandle<()>,
}

/// Per-connection terminal state machine.
pub struct TerminalBridge {
    connection_id: String,
    registry: SandboxRegistry,
    shell: Vec<String>,
    outbound: mpsc::Sender<ServerEvent>,
    state: TerminalState,
    attachment: Option<Attachment>,
    generation: u64,
    ended_tx: mpsc::UnboundedSender<u64>,
    ended_rx: mpsc::UnboundedReceiver<u64>,
}

impl TerminalBridge {
    pub fn new(
        registry: SandboxRegistry,
        shell: Vec<String>,
        outbound: mpsc::Sender<ServerEvent>,
    ) -> Self {
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        Self {
            connection_id: uuid::Uuid::new_v4().to_string(),
            registry,
            shell,
            outbound,
            state: TerminalState::Idle,
            attachment: None,
            generation: 0,
            ended_tx,
            ended_rx,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn state(&self) -> TerminalState {
        self.state
    }

    /// Processes events until the client side of `inbound` closes, then
    /// releases any live attachment.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<ClientEvent>) {
        info!(connection_id = %self.connection_id, "Terminal client connected");
        loop {
            tokio::select! {
                event = inbound.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
                Some(generation) = self.ended_rx.recv() => {
                    self.stream_ended(generation).await;
                }
            }
        }
        self.detach().await;
        info!(connection_id = %self.connection_id, "Terminal client disconnected");
    }

    pub async fn handle(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::AttachTerminal { id } => self.attach(&id).await,
            ClientEvent::TerminalInput(data) => self.write_input(&data).await,
            ClientEvent::TerminalResize { rows, cols } => self.resize(rows, cols).await,
        }
    }

    async fn attach(&mut self, id: &str) {
        if let Some(previous) = self.attachment.as_ref().map(|a| a.container_id.clone()) {
            info!(
                connection_id = %self.connection_id,
                container_id = %previous,
                "Replacing active terminal attachment"
            );
            self.detach().await;
        }

        self.state = TerminalState::Attaching;
        let Some(session) = self.registry.get(id).await else {
            self.state = TerminalState::Closed;
            warn!(connection_id = %self.connection_id, container_id = id, "Attach to unknown sandbox");
            self.send(ServerEvent::Error("Container not found".to_string()))
                .await;
            return;
        };

        match session.handle.exec_interactive(self.shell.clone()).await {
            Ok(stream) => {
                info!(
                    connection_id = %self.connection_id,
                    container_id = id,
                    exec_id = %stream.exec_id,
                    "Terminal attached"
                );
                self.start_streaming(session.handle.clone(), stream);
            }
            Err(e) => {
                self.state = TerminalState::Closed;
                error!(connection_id = %self.connection_id, container_id = id, error = %e, "Terminal attach failed");
                self.send(ServerEvent::Error(e.to_string())).await;
            }
        }
    }

    fn start_streaming(&mut self, handle: ContainerHandle, stream: ExecStream) {
        self.generation += 1;
        let generation = self.generation;
        let ExecStream {
            exec_id,
            mut output,
            input,
        } = stream;

        let outbound = self.outbound.clone();
        let ended = self.ended_tx.clone();
        let connection_id = self.connection_id.clone();
        let pump = tokio::spawn(async move {
            let mut decoder = Utf8Decoder::default();
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(bytes) => {
                        let text = decoder.decode(&bytes);
                        if text.is_empty() {
                            continue;
                        }
                        if outbound.send(ServerEvent::TerminalOutput(text)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(connection_id = %connection_id, error = %e, "Exec stream error");
                        let _ = outbound.send(ServerEvent::Error(e.to_string())).await;
                        break;
                    }
                }
            }
            let tail = decoder.finish();
            if !tail.is_empty() {
                let _ = outbound.send(ServerEvent::TerminalOutput(tail)).await;
            }
            debug!(connection_id = %connection_id, "Exec stream ended");
            let _ = ended.send(generation);
        });

        self.attachment = Some(Attachment {
            generation,
            container_id: handle.id().to_string(),
            exec_id,
            handle,
            input,
            pump,
        });
        self.state = TerminalState::Streaming;
    }

    async fn write_input(&mut self, data: &[u8]) {
        let Some(attachment) = self.attachment.as_mut() else {
            debug!(connection_id = %self.connection_id, "Input without an attached terminal");
            return;
        };
        let written = async {
            attachment.input.write_all(data).await?;
            attachment.input.flush().await
        }
        .await;
        if let Err(e) = written {
            warn!(connection_id = %self.connection_id, error = %e, "Failed to write terminal input");
            self.send(ServerEvent::Error(format!("Terminal input failed: {e}")))
                .await;
            self.detach().await;
            self.send(ServerEvent::TerminalDisconnected).await;
        }
    }

    async fn resize(&mut self, rows: u16, cols: u16) {
        let Some((handle, exec_id)) = self
            .attachment
            .as_ref()
            .map(|a| (a.handle.clone(), a.exec_id.clone()))
        else {
            return;
        };
        if let Err(e) = handle.resize_exec(&exec_id, rows, cols).await {
            warn!(connection_id = %self.connection_id, rows, cols, error = %e, "Terminal resize failed");
        }
    }

    async fn stream_ended(&mut self, generation: u64) {
        let current = self
            .attachment
            .as_ref()
            .is_some_and(|a| a.generation == generation);
        if !current {
            return;
        }
        self.detach().await;
        self.send(ServerEvent::TerminalDisconnected).await;
    }

    /// Releases the exec stream. Safe to call any number of times.
    async fn detach(&mut self) {
        let Some(mut attachment) = self.attachment.take() else {
            return;
        };
        if let Err(e) = attachment.input.shutdown().await {
            debug!(connection_id = %self.connection_id, error = %e, "Exec input already closed");
        }
        attachment.pump.abort();
        self.state = TerminalState::Closed;
        info!(
            connection_id = %self.connection_id,
            container_id = %attachment.container_id,
            "Terminal detached"
        );
    }

    async fn send(&mut self, event: ServerEvent) {
        if self.outbound.send(event).await.is_err() {
            debug!(connection_id = %self.connection_id, "Client gone, dropping event");
        }
    }
}

/// Decodes a byte stream as UTF-8 text, carrying sequences split across
/// chunk boundaries into the next chunk.
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(std::str::from_utf8(&self.pending[..valid]).unwrap_or_default());
                    match e.error_len() {
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }
    }

    fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ContainerBackend;
    use crate::state::{ExposedEndpoints, SandboxSession};
    use crate::testing::{BackendCall, FakeBackend};
    use std::sync::Arc;
    use std::time::Duration;

    struct Harness {
        fake: Arc<FakeBackend>,
        inbound: mpsc::Sender<ClientEvent>,
        outbound: mpsc::Receiver<ServerEvent>,
        bridge: JoinHandle<()>,
    }

    impl Harness {
        async fn new(fake: FakeBackend, container_ids: &[&str]) -> Self {
            let fake = Arc::new(fake);
            let registry = SandboxRegistry::new();
            let backend: Arc<dyn ContainerBackend> = fake.clone();
            for id in container_ids {
                registry
                    .insert(SandboxSession::new(
                        ContainerHandle::new(*id, backend.clone()),
                        "xss-1",
                        ExposedEndpoints::default(),
                    ))
                    .await;
            }
            let (inbound_tx, inbound_rx) = mpsc::channel(16);
            let (outbound_tx, outbound_rx) = mpsc::channel(16);
            let bridge = TerminalBridge::new(registry, vec!["/bin/bash".into()], outbound_tx);
            Self {
                fake,
                inbound: inbound_tx,
                outbound: outbound_rx,
                bridge: tokio::spawn(bridge.run(inbound_rx)),
            }
        }

        async fn send(&self, event: ClientEvent) {
            self.inbound.send(event).await.unwrap();
        }

        async fn recv(&mut self) -> Option<ServerEvent> {
            tokio::time::timeout(Duration::from_secs(5), self.outbound.recv())
                .await
                .ok()
                .flatten()
        }

        async fn recv_nothing(&mut self) -> bool {
            tokio::time::timeout(Duration::from_millis(100), self.outbound.recv())
                .await
                .is_err()
        }
    }

    /// Registers a container in the fake so exec calls against it succeed.
    async fn fake_with_container() -> (FakeBackend, String) {
        let fake = FakeBackend::new();
        let id = fake
            .create_container(&crate::backend::ContainerSpec {
                name: "sandbox-xss-1".into(),
                image: "parrotsec/security:latest".into(),
                exposed_ports: vec![],
                tty: true,
                open_stdin: true,
                auto_remove: true,
            })
            .await
            .unwrap();
        (fake, id)
    }

    fn attach(id: &str) -> ClientEvent {
        ClientEvent::AttachTerminal { id: id.to_string() }
    }

    #[test]
    fn parses_client_frames() {
        assert_eq!(
            ClientEvent::from_json(r#"{"event":"attach-terminal","data":{"containerId":"abc"}}"#)
                .unwrap(),
            attach("abc")
        );
        assert_eq!(
            ClientEvent::from_json(r#"{"event":"terminal-input","data":"ls\r"}"#).unwrap(),
            ClientEvent::TerminalInput(b"ls\r".to_vec())
        );
        assert_eq!(
            ClientEvent::from_json(r#"{"event":"terminal-resize","data":{"rows":40,"cols":120}}"#)
                .unwrap(),
            ClientEvent::TerminalResize { rows: 40, cols: 120 }
        );
        assert!(ClientEvent::from_json(r#"{"event":"bogus"}"#).is_err());
    }

    #[test]
    fn serializes_server_frames() {
        assert_eq!(
            serde_json::to_string(&ServerEvent::TerminalOutput("$ ".into())).unwrap(),
            r#"{"event":"terminal-output","data":"$ "}"#
        );
        assert_eq!(
            serde_json::to_string(&ServerEvent::TerminalDisconnected).unwrap(),
            r#"{"event":"terminal-disconnected"}"#
        );
        assert_eq!(
            serde_json::to_string(&ServerEvent::Error("Container not found".into())).unwrap(),
            r#"{"event":"error","data":"Container not found"}"#
        );
    }

    #[test]
    fn decoder_joins_split_characters() {
        let mut decoder = Utf8Decoder::default();
        let bytes = "héllo".as_bytes();
        assert_eq!(decoder.decode(&bytes[..2]), "h");
        assert_eq!(decoder.decode(&bytes[2..]), "éllo");
        assert_eq!(decoder.decode(&[0xff, b'a']), "\u{FFFD}a");
        assert_eq!(decoder.decode(&[0xe2, 0x82]), "");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }

    #[tokio::test]
    async fn attach_to_unknown_id_never_execs() {
        let mut h = Harness::new(FakeBackend::new(), &[]).await;

        h.send(attach("missing")).await;

        assert_eq!(
            h.recv().await,
            Some(ServerEvent::Error("Container not found".into()))
        );
        assert!(h.fake.calls().is_empty());

        // The connection keeps serving requests.
        h.send(ClientEvent::TerminalInput(b"ls\n".to_vec())).await;
        assert!(h.recv_nothing().await);
    }

    #[tokio::test]
    async fn relays_output_and_input() {
        let (fake, id) = fake_with_container().await;
        let mut h = Harness::new(fake, &[&id]).await;

        h.send(attach(&id)).await;
        let mut exec = h.fake.next_exec().await.unwrap();
        assert_eq!(exec.container_id, id);

        exec.write_output("root@sandbox:~# ");
        assert_eq!(
            h.recv().await,
            Some(ServerEvent::TerminalOutput("root@sandbox:~# ".into()))
        );

        h.send(ClientEvent::TerminalInput(b"whoami\n".to_vec())).await;
        assert_eq!(exec.read_input().await, b"whoami\n");

        assert!(h.fake.count_calls(|c| matches!(
            c,
            BackendCall::ExecInteractive { cmd, .. } if cmd == &vec!["/bin/bash".to_string()]
        )) == 1);
    }

    #[tokio::test]
    async fn resize_reaches_backend_and_failures_are_not_fatal() {
        let (fake, id) = fake_with_container().await;
        let mut h = Harness::new(fake.failing_resize(), &[&id]).await;

        h.send(attach(&id)).await;
        let exec = h.fake.next_exec().await.unwrap();

        h.send(ClientEvent::TerminalResize { rows: 30, cols: 100 }).await;
        exec.write_output("still here");
        assert_eq!(
            h.recv().await,
            Some(ServerEvent::TerminalOutput("still here".into()))
        );
        assert_eq!(
            h.fake.count_calls(|c| matches!(
                c,
                BackendCall::Resize { rows: 30, cols: 100, .. }
            )),
            1
        );
    }

    #[tokio::test]
    async fn end_of_stream_disconnects_exactly_once() {
        let (fake, id) = fake_with_container().await;
        let mut h = Harness::new(fake, &[&id]).await;

        h.send(attach(&id)).await;
        let mut exec = h.fake.next_exec().await.unwrap();

        exec.write_output("bye\n");
        exec.finish();

        assert_eq!(h.recv().await, Some(ServerEvent::TerminalOutput("bye\n".into())));
        assert_eq!(h.recv().await, Some(ServerEvent::TerminalDisconnected));
        assert!(exec.input_closed().await);

        // Client leaves right after; no second disconnect event.
        drop(h.inbound);
        h.bridge.await.unwrap();
        assert_eq!(h.outbound.recv().await, None);
    }

    #[tokio::test]
    async fn client_disconnect_releases_exec_stream() {
        let (fake, id) = fake_with_container().await;
        let h = Harness::new(fake, &[&id]).await;

        h.send(attach(&id)).await;
        let mut exec = h.fake.next_exec().await.unwrap();

        drop(h.inbound);
        h.bridge.await.unwrap();

        assert!(exec.input_closed().await);

        // The aborted pump drops the output side shortly after.
        let mut released = false;
        for _ in 0..50 {
            if !exec.write_output("late") {
                released = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(released);
    }

    #[tokio::test]
    async fn second_attach_replaces_the_first() {
        let (fake, id) = fake_with_container().await;
        let mut h = Harness::new(fake, &[&id]).await;

        h.send(attach(&id)).await;
        let mut first = h.fake.next_exec().await.unwrap();
        h.send(attach(&id)).await;
        let second = h.fake.next_exec().await.unwrap();

        assert!(first.input_closed().await);
        // The replaced stream ending must not disconnect the new one.
        first.finish();
        assert!(h.recv_nothing().await);

        second.write_output("new shell");
        assert_eq!(
            h.recv().await,
            Some(ServerEvent::TerminalOutput("new shell".into()))
        );
    }

    #[tokio::test]
    async fn exec_failure_is_reported_to_client() {
        let (fake, id) = fake_with_container().await;
        let mut h = Harness::new(fake.failing_exec(), &[&id]).await;

        h.send(attach(&id)).await;

        match h.recv().await {
            Some(ServerEvent::Error(message)) => assert!(message.contains("exec failed")),
            other => panic!("expected error event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_error_is_reported_before_disconnect() {
        let (fake, id) = fake_with_container().await;
        let mut h = Harness::new(fake, &[&id]).await;

        h.send(attach(&id)).await;
        let mut exec = h.fake.next_exec().await.unwrap();

        exec.fail_output("connection reset");

        match h.recv().await {
            Some(ServerEvent::Error(message)) => assert!(message.contains("connection reset")),
            other => panic!("expected error event, got {other:?}"),
        }
        assert_eq!(h.recv().await, Some(ServerEvent::TerminalDisconnected));
        assert!(exec.input_closed().await);
        assert!(h.recv_nothing().await);
    }

    #[tokio::test]
    async fn failed_input_write_ends_the_session() {
        let (fake, id) = fake_with_container().await;
        let mut h = Harness::new(fake, &[&id]).await;

        h.send(attach(&id)).await;
        let mut exec = h.fake.next_exec().await.unwrap();
        exec.close_stdin();

        h.send(ClientEvent::TerminalInput(b"ls\n".to_vec())).await;

        match h.recv().await {
            Some(ServerEvent::Error(message)) => {
                assert!(message.starts_with("Terminal input failed"))
            }
            other => panic!("expected error event, got {other:?}"),
        }
        assert_eq!(h.recv().await, Some(ServerEvent::TerminalDisconnected));

        // The pump was released with the attachment.
        let mut released = false;
        for _ in 0..50 {
            if !exec.write_output("late") {
                released = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(released);
        assert!(h.recv_nothing().await);
    }

    #[tokio::test]
    async fn state_follows_attachment_lifecycle() {
        let (fake, id) = fake_with_container().await;
        let fake = Arc::new(fake);
        let registry = SandboxRegistry::new();
        let backend: Arc<dyn ContainerBackend> = fake.clone();
        registry
            .insert(SandboxSession::new(
                ContainerHandle::new(id.clone(), backend),
                "xss-1",
                ExposedEndpoints::default(),
            ))
            .await;
        let (outbound_tx, mut outbound_rx) = mpsc::channel(16);
        let mut bridge = TerminalBridge::new(registry, vec!["/bin/bash".into()], outbound_tx);
        assert_eq!(bridge.state(), TerminalState::Idle);

        bridge.handle(attach("missing")).await;
        assert_eq!(bridge.state(), TerminalState::Closed);
        assert_eq!(
            outbound_rx.recv().await,
            Some(ServerEvent::Error("Container not found".into()))
        );

        bridge.handle(attach(&id)).await;
        assert_eq!(bridge.state(), TerminalState::Streaming);

        let mut exec = fake.next_exec().await.unwrap();
        exec.finish();
        let generation = bridge.ended_rx.recv().await.unwrap();
        bridge.stream_ended(generation).await;
        assert_eq!(bridge.state(), TerminalState::Closed);
        assert_eq!(outbound_rx.recv().await, Some(ServerEvent::TerminalDisconnected));

        // A second end signal for the same stream is a no-op.
        bridge.stream_ended(generation).await;
        assert!(outbound_rx.try_recv().is_err());
    }
}
