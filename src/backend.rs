//! Container backend capability.
//!
//! The lifecycle manager and terminal bridge only talk to containers through
//! [`ContainerBackend`], so they can run against Docker in production and an
//! in-memory fake in tests.

use crate::error::BackendError;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::AsyncWrite;

/// Everything needed to create one sandbox container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Port keys such as `8081/tcp`, each published on a backend-chosen host port.
    pub exposed_ports: Vec<String>,
    pub tty: bool,
    pub open_stdin: bool,
    pub auto_remove: bool,
}

/// Network state recovered by inspecting a started container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerNetwork {
    pub ip_address: Option<String>,
    /// Exposed port key -> allocated host port.
    pub host_ports: HashMap<String, u16>,
}

pub type ExecOutput = BoxStream<'static, Result<Vec<u8>, BackendError>>;
pub type ExecInput = Pin<Box<dyn AsyncWrite + Send>>;

/// Duplex byte stream attached to an interactive exec.
pub struct ExecStream {
    pub exec_id: String,
    pub output: ExecOutput,
    pub input: ExecInput,
}

impl fmt::Debug for ExecStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecStream")
            .field("exec_id", &self.exec_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Succeeds when the image is present locally.
    async fn inspect_image(&self, image: &str) -> Result<(), BackendError>;

    async fn pull_image(&self, image: &str) -> Result<(), BackendError>;

    /// Returns the backend-assigned container id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, BackendError>;

    async fn start_container(&self, id: &str) -> Result<(), BackendError>;

    async fn stop_container(&self, id: &str, timeout_secs: i64) -> Result<(), BackendError>;

    async fn restart_container(&self, id: &str, timeout_secs: i64) -> Result<(), BackendError>;

    /// Forced removal, used when a created container never started.
    async fn remove_container(&self, id: &str) -> Result<(), BackendError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerNetwork, BackendError>;

    /// Starts a command without attaching to its output.
    async fn exec_detached(&self, id: &str, cmd: Vec<String>) -> Result<(), BackendError>;

    /// Starts a command with a pseudo-terminal and attached stdin/stdout/stderr.
    async fn exec_interactive(&self, id: &str, cmd: Vec<String>)
        -> Result<ExecStream, BackendError>;

    async fn resize_exec(&self, exec_id: &str, rows: u16, cols: u16) -> Result<(), BackendError>;
}

/// A live container as seen through a backend.
///
/// Owned by the registry entry of its sandbox; every lifecycle and exec call
/// for that sandbox goes through it.
#[derive(Clone)]
pub struct ContainerHandle {
    id: String,
    backend: Arc<dyn ContainerBackend>,
}

impl ContainerHandle {
    pub fn new(id: impl Into<String>, backend: Arc<dyn ContainerBackend>) -> Self {
        Self {
            id: id.into(),
            backend,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn stop(&self, timeout_secs: i64) -> Result<(), BackendError> {
        self.backend.stop_container(&self.id, timeout_secs).await
    }

    pub async fn restart(&self, timeout_secs: i64) -> Result<(), BackendError> {
        self.backend.restart_container(&self.id, timeout_secs).await
    }

    pub async fn inspect(&self) -> Result<ContainerNetwork, BackendError> {
        self.backend.inspect_container(&self.id).await
    }

    pub async fn exec_detached(&self, cmd: Vec<String>) -> Result<(), BackendError> {
        self.backend.exec_detached(&self.id, cmd).await
    }

    pub async fn exec_interactive(&self, cmd: Vec<String>) -> Result<ExecStream, BackendError> {
        self.backend.exec_interactive(&self.id, cmd).await
    }

    pub async fn resize_exec(&self, exec_id: &str, rows: u16, cols: u16) -> Result<(), BackendError> {
        self.backend.resize_exec(exec_id, rows, cols).await
    }
}

impl fmt::Debug for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerHandle").field("id", &self.id).finish()
    }
}
