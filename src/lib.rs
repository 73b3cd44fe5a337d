//! Sandbox bridge - disposable desktop sandboxes on Docker with an HTTP API
//! and an interactive websocket terminal.

pub mod backend;
pub mod config;
pub mod docker;
pub mod error;
pub mod http_server;
pub mod probe;
pub mod sandbox;
pub mod state;
pub mod terminal;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use backend::{ContainerBackend, ContainerHandle};
pub use config::BridgeConfig;
pub use error::{BackendError, SandboxError};
pub use sandbox::SandboxManager;
pub use state::{AppState, SandboxRegistry};
