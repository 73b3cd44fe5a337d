//! In-memory container backend.
//!
//! Stands in for Docker when exercising the lifecycle manager, the terminal
//! bridge and the HTTP surface. Every call is recorded, interactive execs hand
//! their container-side ends to the test through [`FakeBackend::next_exec`].

use crate::backend::{ContainerBackend, ContainerNetwork, ContainerSpec, ExecStream};
use crate::error::BackendError;
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    InspectImage(String),
    PullImage(String),
    Create(ContainerSpec),
    Start(String),
    Stop(String),
    Restart(String),
    Remove(String),
    Inspect(String),
    ExecDetached { id: String, cmd: Vec<String> },
    ExecInteractive { id: String, cmd: Vec<String> },
    Resize { exec_id: String, rows: u16, cols: u16 },
}

#[derive(Debug)]
struct FakeContainer {
    spec: ContainerSpec,
    host_ports: HashMap<String, u16>,
}

#[derive(Default)]
struct Failures {
    pull: bool,
    start: bool,
    stop: bool,
    restart: bool,
    exec: bool,
    resize: bool,
}

struct Inner {
    local_images: HashSet<String>,
    containers: HashMap<String, FakeContainer>,
    fixed_ports: HashMap<String, u16>,
    omitted_ports: HashSet<String>,
    failures: Failures,
    calls: Vec<BackendCall>,
    next_id: u64,
    next_port: u16,
}

/// Container side of one interactive exec.
pub struct FakeExec {
    pub exec_id: String,
    pub container_id: String,
    output: Option<mpsc::UnboundedSender<Result<Vec<u8>, BackendError>>>,
    input: Option<DuplexStream>,
}

impl FakeExec {
    /// Emit bytes as if the process wrote them to its terminal.
    pub fn write_output(&self, bytes: impl Into<Vec<u8>>) -> bool {
        match &self.output {
            Some(tx) => tx.send(Ok(bytes.into())).is_ok(),
            None => false,
        }
    }

    /// Break the output stream with an I/O error carrying `message`.
    pub fn fail_output(&self, message: &str) -> bool {
        match &self.output {
            Some(tx) => tx
                .send(Err(BackendError::Io(std::io::Error::other(message.to_string()))))
                .is_ok(),
            None => false,
        }
    }

    /// Signal end-of-stream, as when the shell exits.
    pub fn finish(&mut self) {
        self.output.take();
    }

    /// Drop the process's stdin so further writes from the bridge fail.
    pub fn close_stdin(&mut self) {
        self.input.take();
    }

    /// Read whatever the bridge wrote to the process's stdin; empty on EOF.
    pub async fn read_input(&mut self) -> Vec<u8> {
        let Some(input) = self.input.as_mut() else {
            return Vec::new();
        };
        let mut buf = vec![0u8; 4096];
        match tokio::time::timeout(Duration::from_secs(5), input.read(&mut buf)).await {
            Ok(Ok(n)) => buf[..n].to_vec(),
            _ => Vec::new(),
        }
    }

    /// True once the bridge has released its end of stdin.
    pub async fn input_closed(&mut self) -> bool {
        let Some(input) = self.input.as_mut() else {
            return true;
        };
        let mut buf = [0u8; 64];
        loop {
            match tokio::time::timeout(Duration::from_secs(5), input.read(&mut buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) => return true,
                Ok(Ok(_)) => continue,
                Err(_) => return false,
            }
        }
    }
}

pub struct FakeBackend {
    inner: Mutex<Inner>,
    exec_tx: mpsc::UnboundedSender<FakeExec>,
    exec_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<FakeExec>>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn failure(what: &str) -> BackendError {
    BackendError::Io(std::io::Error::other(format!("{what} failed")))
}

impl FakeBackend {
    pub fn new() -> Self {
        let (exec_tx, exec_rx) = mpsc::unbounded_channel();
        Self {
            inner: Mutex::new(Inner {
                local_images: HashSet::new(),
                containers: HashMap::new(),
                fixed_ports: HashMap::new(),
                omitted_ports: HashSet::new(),
                failures: Failures::default(),
                calls: Vec::new(),
                next_id: 1,
                next_port: 49153,
            }),
            exec_tx,
            exec_rx: tokio::sync::Mutex::new(exec_rx),
        }
    }

    fn with_inner(self, f: impl FnOnce(&mut Inner)) -> Self {
        f(&mut self.inner.lock().unwrap());
        self
    }

    pub fn with_local_image(self, image: &str) -> Self {
        let image = image.to_string();
        self.with_inner(|i| {
            i.local_images.insert(image);
        })
    }

    /// Always publish `key` on `port` instead of allocating one.
    pub fn with_host_port(self, key: &str, port: u16) -> Self {
        let key = key.to_string();
        self.with_inner(|i| {
            i.fixed_ports.insert(key, port);
        })
    }

    /// Leave `key` unpublished in inspect results.
    pub fn without_host_port(self, key: &str) -> Self {
        let key = key.to_string();
        self.with_inner(|i| {
            i.omitted_ports.insert(key);
        })
    }

    pub fn failing_pull(self) -> Self {
        self.with_inner(|i| i.failures.pull = true)
    }

    pub fn failing_start(self) -> Self {
        self.with_inner(|i| i.failures.start = true)
    }

    pub fn failing_stop(self) -> Self {
        self.with_inner(|i| i.failures.stop = true)
    }

    pub fn failing_restart(self) -> Self {
        self.with_inner(|i| i.failures.restart = true)
    }

    pub fn failing_exec(self) -> Self {
        self.with_inner(|i| i.failures.exec = true)
    }

    pub fn failing_resize(self) -> Self {
        self.with_inner(|i| i.failures.resize = true)
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn count_calls(&self, pred: impl Fn(&BackendCall) -> bool) -> usize {
        self.inner.lock().unwrap().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn container_exists(&self, id: &str) -> bool {
        self.inner.lock().unwrap().containers.contains_key(id)
    }

    /// Drop a container behind the bridge's back, as auto-remove does after it exits.
    pub fn forget_container(&self, id: &str) {
        self.inner.lock().unwrap().containers.remove(id);
    }

    /// Waits for the next interactive exec started against this backend.
    pub async fn next_exec(&self) -> Option<FakeExec> {
        let mut rx = self.exec_rx.lock().await;
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .ok()
            .flatten()
    }

    fn record(&self, call: BackendCall) -> std::sync::MutexGuard<'_, Inner> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(call);
        inner
    }

    fn require_container(inner: &Inner, id: &str) -> Result<(), BackendError> {
        if inner.containers.contains_key(id) {
            Ok(())
        } else {
            Err(BackendError::ContainerNotFound(id.to_string()))
        }
    }
}

#[async_trait]
impl ContainerBackend for FakeBackend {
    async fn inspect_image(&self, image: &str) -> Result<(), BackendError> {
        let inner = self.record(BackendCall::InspectImage(image.to_string()));
        if inner.local_images.contains(image) {
            Ok(())
        } else {
            Err(BackendError::ImageUnavailable {
                image: image.to_string(),
                reason: "not present locally".to_string(),
            })
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), BackendError> {
        let mut inner = self.record(BackendCall::PullImage(image.to_string()));
        if inner.failures.pull {
            return Err(BackendError::ImageUnavailable {
                image: image.to_string(),
                reason: "pull access denied".to_string(),
            });
        }
        inner.local_images.insert(image.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, BackendError> {
        let mut inner = self.record(BackendCall::Create(spec.clone()));
        let id = format!("fake{:060}", inner.next_id);
        inner.next_id += 1;
        inner.containers.insert(
            id.clone(),
            FakeContainer {
                spec: spec.clone(),
                host_ports: HashMap::new(),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), BackendError> {
        let mut inner = self.record(BackendCall::Start(id.to_string()));
        Self::require_container(&inner, id)?;
        if inner.failures.start {
            return Err(failure("start"));
        }

        let keys = inner.containers[id].spec.exposed_ports.clone();
        let mut host_ports = HashMap::new();
        for key in keys {
            if inner.omitted_ports.contains(&key) {
                continue;
            }
            let fixed = inner.fixed_ports.get(&key).copied();
            let port = match fixed {
                Some(port) => port,
                None => {
                    let port = inner.next_port;
                    inner.next_port += 1;
                    port
                }
            };
            host_ports.insert(key, port);
        }
        if let Some(container) = inner.containers.get_mut(id) {
            container.host_ports = host_ports;
        }
        Ok(())
    }

    async fn stop_container(&self, id: &str, _timeout_secs: i64) -> Result<(), BackendError> {
        let mut inner = self.record(BackendCall::Stop(id.to_string()));
        Self::require_container(&inner, id)?;
        if inner.failures.stop {
            return Err(failure("stop"));
        }
        let auto_remove = inner.containers[id].spec.auto_remove;
        if auto_remove {
            inner.containers.remove(id);
        }
        Ok(())
    }

    async fn restart_container(&self, id: &str, _timeout_secs: i64) -> Result<(), BackendError> {
        let inner = self.record(BackendCall::Restart(id.to_string()));
        Self::require_container(&inner, id)?;
        if inner.failures.restart {
            return Err(failure("restart"));
        }
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), BackendError> {
        let mut inner = self.record(BackendCall::Remove(id.to_string()));
        Self::require_container(&inner, id)?;
        inner.containers.remove(id);
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerNetwork, BackendError> {
        let inner = self.record(BackendCall::Inspect(id.to_string()));
        Self::require_container(&inner, id)?;
        Ok(ContainerNetwork {
            ip_address: Some("172.17.0.2".to_string()),
            host_ports: inner.containers[id].host_ports.clone(),
        })
    }

    async fn exec_detached(&self, id: &str, cmd: Vec<String>) -> Result<(), BackendError> {
        let inner = self.record(BackendCall::ExecDetached {
            id: id.to_string(),
            cmd,
        });
        Self::require_container(&inner, id)?;
        if inner.failures.exec {
            return Err(failure("exec"));
        }
        Ok(())
    }

    async fn exec_interactive(
        &self,
        id: &str,
        cmd: Vec<String>,
    ) -> Result<ExecStream, BackendError> {
        let exec_id = {
            let mut inner = self.record(BackendCall::ExecInteractive {
                id: id.to_string(),
                cmd,
            });
            Self::require_container(&inner, id)?;
            if inner.failures.exec {
                return Err(failure("exec"));
            }
            let exec_id = format!("exec-{}", inner.next_id);
            inner.next_id += 1;
            exec_id
        };

        let (output_tx, output_rx) = mpsc::unbounded_channel::<Result<Vec<u8>, BackendError>>();
        let (bridge_side, container_side) = tokio::io::duplex(4096);

        let output = stream::unfold(output_rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        })
        .boxed();

        let _ = self.exec_tx.send(FakeExec {
            exec_id: exec_id.clone(),
            container_id: id.to_string(),
            output: Some(output_tx),
            input: Some(container_side),
        });

        Ok(ExecStream {
            exec_id,
            output,
            input: Box::pin(bridge_side),
        })
    }

    async fn resize_exec(&self, exec_id: &str, rows: u16, cols: u16) -> Result<(), BackendError> {
        let inner = self.record(BackendCall::Resize {
            exec_id: exec_id.to_string(),
            rows,
            cols,
        });
        if inner.failures.resize {
            return Err(failure("resize"));
        }
        Ok(())
    }
}
