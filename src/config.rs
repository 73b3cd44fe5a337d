//! Bridge configuration and public URL composition.

use std::time::Duration;

pub const DEFAULT_IMAGE: &str = "parrotsec/security:latest";
pub const DEFAULT_PUBLIC_URL: &str = "http://127.0.0.1";

/// Exposed port key of the noVNC desktop service.
pub const DESKTOP_PORT_KEY: &str = "8081/tcp";
/// Exposed port key of the SSH service.
pub const SHELL_PORT_KEY: &str = "22/tcp";

/// Runtime settings shared by the manager, prober and HTTP surface.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Base URL the browser uses to reach published host ports.
    pub public_url: String,
    pub default_image: String,
    pub desktop_port_key: String,
    pub shell_port_key: String,
    pub readiness_path: String,
    pub readiness_timeout: Duration,
    pub readiness_interval: Duration,
    /// Grace period handed to the backend when stopping or restarting.
    pub stop_timeout_secs: i64,
    pub shell_command: Vec<String>,
    pub desktop_display: String,
    pub desktop_user: String,
    /// Zero disables the reaper.
    pub reap_interval: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            public_url: DEFAULT_PUBLIC_URL.to_string(),
            default_image: DEFAULT_IMAGE.to_string(),
            desktop_port_key: DESKTOP_PORT_KEY.to_string(),
            shell_port_key: SHELL_PORT_KEY.to_string(),
            readiness_path: "/vnc.html".to_string(),
            readiness_timeout: Duration::from_secs(15),
            readiness_interval: Duration::from_millis(500),
            stop_timeout_secs: 10,
            shell_command: vec!["/bin/bash".to_string()],
            desktop_display: ":1".to_string(),
            desktop_user: "attacker".to_string(),
            reap_interval: Duration::from_secs(60),
        }
    }
}

impl BridgeConfig {
    /// Public URL without a trailing slash.
    pub fn public_base(&self) -> &str {
        self.public_url.trim_end_matches('/')
    }

    /// Public URL with the scheme stripped, as noVNC expects for `host=`.
    pub fn public_host(&self) -> &str {
        let base = self.public_base();
        base.strip_prefix("https://")
            .or_else(|| base.strip_prefix("http://"))
            .unwrap_or(base)
    }

    pub fn readiness_url(&self, host_port: u16) -> String {
        format!("{}:{}{}", self.public_base(), host_port, self.readiness_path)
    }

    /// Browser-facing noVNC address for a published desktop port.
    pub fn desktop_url(&self, host_port: u16) -> String {
        format!(
            "{base}:{port}/vnc.html?autoconnect=1&reconnect=1&path=websockify&host={host}&port={port}\
             &resize=scale&quality=6&compression=2&clipboard=1&show_dot=1&view_only=0&scale=1.0",
            base = self.public_base(),
            host = self.public_host(),
            port = host_port,
        )
    }
}
