//! Gateway configuration.

use std::{
    fmt,
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use crate::error::ConfigurationError;

/// Default control-plane address.
pub const DEFAULT_DOCKER_HOST: &str = "unix:///var/run/docker.sock";

/// Path the terminal socket is served on.
pub const DEFAULT_WS_PATH: &str = "/api/terminal/ws";

/// Fallback agent-server base URL.
pub const DEFAULT_AGENT_SERVER_URL: &str = "http://localhost:4000";

/// Default control-plane connect/response timeout.
pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for a one-shot command to run to completion.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

const DEFAULT_BIND_PORT: u16 = 3000;

/// Where the container runtime's HTTP API is reachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPlaneAddr {
    /// HTTP over a Unix domain socket.
    Unix(PathBuf),
    /// HTTP over TCP.
    Tcp { host: String, port: u16 },
}

impl ControlPlaneAddr {
    /// Value for the `Host` header of control-plane requests.
    #[must_use]
    pub fn host_header(&self) -> String {
        match self {
            Self::Unix(_) => "localhost".to_string(),
            Self::Tcp { host, port } => format!("{host}:{port}"),
        }
    }
}

impl FromStr for ControlPlaneAddr {
    type Err = ConfigurationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        if let Some(path) = raw.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(ConfigurationError::InvalidControlPlane(raw.to_string()));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if raw.starts_with('/') {
            return Ok(Self::Unix(PathBuf::from(raw)));
        }

        let authority = raw
            .strip_prefix("tcp://")
            .or_else(|| raw.strip_prefix("http://"))
            .ok_or_else(|| ConfigurationError::InvalidControlPlane(raw.to_string()))?
            .trim_end_matches('/');
        let (host, port) = authority
            .rsplit_once(':')
            .ok_or_else(|| ConfigurationError::InvalidControlPlane(raw.to_string()))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| ConfigurationError::InvalidControlPlane(raw.to_string()))?;
        if host.is_empty() {
            return Err(ConfigurationError::InvalidControlPlane(raw.to_string()));
        }

        Ok(Self::Tcp {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for ControlPlaneAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
            Self::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
        }
    }
}

/// Linear-backoff retry policy for exec negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt before giving up.
    pub max_retries: u32,
    /// Delay multiplied by the retry number.
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

/// Configuration shared by the gateway, the bridge and the exec client.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Container runtime API address.
    pub control_plane: ControlPlaneAddr,
    /// Container used when a client does not name one.
    pub default_container: Option<String>,
    /// Listen address for the gateway server.
    pub bind: SocketAddr,
    /// Path of the terminal socket route.
    pub ws_path: String,
    /// Bound on control-plane connect and response waits.
    pub control_timeout: Duration,
    /// Bound on one-shot commands, from exec start until their output ends.
    pub command_timeout: Duration,
    /// Negotiation retry policy.
    pub retry: RetryPolicy,
    /// Command run inside the container for interactive terminals.
    pub shell_command: Vec<String>,
    /// Agent-server base URL used when a request names none.
    pub agent_server_url: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            control_plane: ControlPlaneAddr::Unix(PathBuf::from("/var/run/docker.sock")),
            default_container: None,
            bind: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_BIND_PORT)),
            ws_path: DEFAULT_WS_PATH.to_string(),
            control_timeout: DEFAULT_CONTROL_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            retry: RetryPolicy::default(),
            shell_command: interactive_shell_command(),
            agent_server_url: DEFAULT_AGENT_SERVER_URL.to_string(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    /// Returns error if an address variable cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigurationError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    ///
    /// # Errors
    /// Returns error if an address variable cannot be parsed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigurationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(host) = get("DOCKER_HOST") {
            config.control_plane = host.parse()?;
        } else if let Some(socket) = get("DOCKER_SOCKET") {
            config.control_plane = ControlPlaneAddr::Unix(PathBuf::from(socket));
        } else {
            config.control_plane = DEFAULT_DOCKER_HOST.parse()?;
        }

        config.default_container = get("OPENCODE_CONTAINER").or_else(|| get("HOSTNAME"));

        if let Some(bind) = get("PORTAL_BIND") {
            config.bind = bind
                .parse()
                .map_err(|_| ConfigurationError::InvalidBind(bind.clone()))?;
        }

        if let Some(ms) = get("PORTAL_CONTROL_TIMEOUT_MS").and_then(|v| v.parse::<u64>().ok()) {
            config.control_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = get("PORTAL_COMMAND_TIMEOUT_MS").and_then(|v| v.parse::<u64>().ok()) {
            config.command_timeout = Duration::from_millis(ms);
        }

        if let Some(url) = get("OPENCODE_SERVER_URL") {
            config.agent_server_url = url;
        }

        Ok(config)
    }

    /// Resolve the container a client connection should attach to.
    ///
    /// The client's own value wins; otherwise the configured default is used.
    ///
    /// # Errors
    /// Returns `MissingTarget` if neither yields a non-empty identifier.
    pub fn resolve_target(&self, requested: Option<&str>) -> Result<String, ConfigurationError> {
        requested
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .or_else(|| {
                self.default_container
                    .as_deref()
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
            })
            .map(ToString::to_string)
            .ok_or(ConfigurationError::MissingTarget)
    }
}

/// Shell launched for interactive terminals: bash when present, sh otherwise.
#[must_use]
pub fn interactive_shell_command() -> Vec<String> {
    vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        "if command -v bash >/dev/null; then exec bash; else exec sh; fi".to_string(),
    ]
}
