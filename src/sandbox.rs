//! Sandbox lifecycle: spawn, terminate, reset and command dispatch.

use crate::backend::{ContainerBackend, ContainerHandle, ContainerSpec};
use crate::config::BridgeConfig;
use crate::error::{BackendError, Result, SandboxError};
use crate::probe::ReadinessProber;
use crate::state::{ExposedEndpoints, SandboxRegistry, SandboxSession, SessionSummary};
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

/// Characters that would break out of the quoting of the open-url command.
const SHELL_METACHARACTERS: &[char] = &['\'', '"', '`', '$', '\\'];

/// Result of a successful spawn.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnedSandbox {
    pub id: String,
    pub ip_address: Option<String>,
    pub endpoints: ExposedEndpoints,
    pub desktop_url: Option<String>,
    /// Whether the desktop answered before the readiness deadline.
    pub ready: bool,
}

/// Drives sandbox containers through a [`ContainerBackend`] and keeps the
/// registry in step with them.
pub struct SandboxManager {
    backend: Arc<dyn ContainerBackend>,
    registry: SandboxRegistry,
    prober: ReadinessProber,
    config: BridgeConfig,
    name_seq: AtomicU64,
}

impl SandboxManager {
    pub fn new(backend: Arc<dyn ContainerBackend>, config: BridgeConfig) -> Self {
        Self {
            backend,
            registry: SandboxRegistry::new(),
            prober: ReadinessProber::from_config(&config),
            config,
            name_seq: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &SandboxRegistry {
        &self.registry
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Looks up a registered sandbox.
    pub async fn session(&self, id: &str) -> Result<Arc<SandboxSession>> {
        self.registry
            .get(id)
            .await
            .ok_or_else(|| SandboxError::NotFound(id.to_string()))
    }

    /// Docker-safe container name, unique per process even for simultaneous
    /// spawns of the same challenge.
    fn container_name(&self, challenge_id: &str) -> String {
        let mut slug: String = challenge_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        if slug.is_empty() {
            slug.push_str("challenge");
        }
        let seq = self.name_seq.fetch_add(1, Ordering::Relaxed);
        format!("sandbox-{}-{}-{}", slug, Utc::now().timestamp_millis(), seq)
    }

    /// Use the local copy of `image` if there is one, pull it otherwise.
    async fn ensure_image(&self, image: &str) -> Result<()> {
        match self.backend.inspect_image(image).await {
            Ok(()) => {
                info!(image, "Using local image");
                Ok(())
            }
            Err(e) => {
                info!(image, reason = %e, "Local image not found, pulling");
                self.backend.pull_image(image).await?;
                info!(image, "Image pulled");
                Ok(())
            }
        }
    }

    pub async fn spawn(&self, challenge_id: &str, image: Option<&str>) -> Result<SpawnedSandbox> {
        let image = image
            .filter(|i| !i.trim().is_empty())
            .unwrap_or(self.config.default_image.as_str());
        info!(challenge_id, image, "Spawning sandbox");

        self.ensure_image(image).await?;

        let spec = ContainerSpec {
            name: self.container_name(challenge_id),
            image: image.to_string(),
            exposed_ports: vec![
                self.config.desktop_port_key.clone(),
                self.config.shell_port_key.clone(),
            ],
            tty: true,
            open_stdin: true,
            auto_remove: true,
        };
        let id = self.backend.create_container(&spec).await?;

        if let Err(e) = self.backend.start_container(&id).await {
            error!(container_id = %id, error = %e, "Failed to start sandbox");
            if let Err(cleanup) = self.backend.remove_container(&id).await {
                warn!(container_id = %id, error = %cleanup, "Failed to remove unstarted container");
            }
            return Err(e.into());
        }

        let handle = ContainerHandle::new(id.clone(), self.backend.clone());
        let network = match handle.inspect().await {
            Ok(network) => network,
            Err(e) => {
                error!(container_id = %id, error = %e, "Failed to inspect sandbox");
                if let Err(cleanup) = handle.stop(self.config.stop_timeout_secs).await {
                    warn!(container_id = %id, error = %cleanup, "Failed to stop uninspectable container");
                }
                return Err(e.into());
            }
        };

        let endpoints = ExposedEndpoints {
            desktop: network.host_ports.get(&self.config.desktop_port_key).copied(),
            shell: network.host_ports.get(&self.config.shell_port_key).copied(),
        };

        let ready = match endpoints.desktop {
            Some(port) => {
                self.prober
                    .wait_until_ready(port, self.config.readiness_timeout)
                    .await
            }
            None => false,
        };
        if !ready {
            warn!(container_id = %id, "Sandbox desktop not ready, returning it anyway");
        }

        self.registry
            .insert(SandboxSession::new(handle, challenge_id, endpoints))
            .await;
        info!(container_id = %id, challenge_id, ?endpoints, ready, "Sandbox spawned");

        Ok(SpawnedSandbox {
            id,
            ip_address: network.ip_address,
            desktop_url: endpoints.desktop.map(|port| self.config.desktop_url(port)),
            endpoints,
            ready,
        })
    }

    /// Stops the container and forgets it. The entry is removed even when the
    /// stop fails; the stop error is still returned.
    pub async fn terminate(&self, id: &str) -> Result<()> {
        let session = self.session(id).await?;
        let _op = session.op_lock.lock().await;
        if !self.registry.contains(id).await {
            return Err(SandboxError::NotFound(id.to_string()));
        }

        let stopped = session.handle.stop(self.config.stop_timeout_secs).await;
        self.registry.remove(id).await;

        match stopped {
            Ok(()) => {
                info!(container_id = id, "Sandbox terminated");
                Ok(())
            }
            Err(e) => {
                error!(container_id = id, error = %e, "Stop failed, sandbox dropped from registry");
                Err(e.into())
            }
        }
    }

    /// Restarts the container in place; id and published ports are kept.
    pub async fn reset(&self, id: &str) -> Result<()> {
        let session = self.session(id).await?;
        let _op = session.op_lock.lock().await;
        if !self.registry.contains(id).await {
            return Err(SandboxError::NotFound(id.to_string()));
        }

        session.handle.restart(self.config.stop_timeout_secs).await?;
        info!(container_id = id, "Sandbox reset");
        Ok(())
    }

    /// Fire-and-forget command. Only dispatch failures are reported.
    pub async fn execute_detached(&self, id: &str, command: Vec<String>) -> Result<()> {
        let session = self.session(id).await?;
        let _op = session.op_lock.lock().await;
        if !self.registry.contains(id).await {
            return Err(SandboxError::NotFound(id.to_string()));
        }

        session.handle.exec_detached(command).await?;
        Ok(())
    }

    /// Opens `url` in a new browser window on the sandbox desktop.
    pub async fn open_url(&self, id: &str, url: &str) -> Result<()> {
        self.session(id).await?;
        let url = validate_url(url)?;
        let command = vec![
            "/bin/bash".to_string(),
            "-lc".to_string(),
            format!(
                "DISPLAY={} su - {} -c \"firefox --new-window '{}'\"",
                self.config.desktop_display, self.config.desktop_user, url
            ),
        ];
        self.execute_detached(id, command).await?;
        info!(container_id = id, url = %url, "Opened URL in sandbox");
        Ok(())
    }

    pub async fn list(&self) -> Vec<SessionSummary> {
        self.registry.summaries().await
    }

    /// Drops registry entries whose container no longer exists. Entries with an
    /// operation in flight are left alone.
    pub async fn reap(&self) -> usize {
        let mut removed = 0;
        for id in self.registry.ids().await {
            let Some(session) = self.registry.get(&id).await else {
                continue;
            };
            let Ok(_op) = session.op_lock.try_lock() else {
                continue;
            };
            match session.handle.inspect().await {
                Ok(_) => {}
                Err(BackendError::ContainerNotFound(_)) => {
                    if self.registry.remove(&id).await.is_some() {
                        info!(container_id = %id, "Reaped sandbox whose container is gone");
                        removed += 1;
                    }
                }
                Err(e) => warn!(container_id = %id, error = %e, "Reaper could not inspect sandbox"),
            }
        }
        removed
    }

    /// Runs [`reap`](Self::reap) on the configured interval.
    pub fn spawn_reaper(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let period = self.config.reap_interval;
        if period.is_zero() {
            return None;
        }
        let manager = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.reap().await;
            }
        }))
    }
}

/// Accepts absolute http(s) URLs that can be quoted safely for the desktop shell.
fn validate_url(raw: &str) -> Result<String> {
    let parsed = url::Url::parse(raw.trim())
        .map_err(|e| SandboxError::InvalidRequest(format!("invalid url: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(SandboxError::InvalidRequest(
            "url must use http or https".to_string(),
        ));
    }
    let url = parsed.to_string();
    if url.contains(SHELL_METACHARACTERS) {
        return Err(SandboxError::InvalidRequest(
            "url contains characters that cannot be passed to the desktop".to_string(),
        ));
    }
    Ok(url)
}
