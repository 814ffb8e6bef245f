//! Control-plane client for the exec lifecycle.

use std::time::Duration;

use async_trait::async_trait;
use portal_core::{
    ControlPlane, ControlPlaneAddr, ExecSpec, GatewayConfig, NegotiationError, RawStream,
    ResizeError, config::DEFAULT_COMMAND_TIMEOUT,
};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::{
    endpoint,
    http::{self, ResponseHead, Rewind},
};

/// Body of `POST /containers/{id}/exec`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreateExecBody<'a> {
    attach_stdin: bool,
    attach_stdout: bool,
    attach_stderr: bool,
    tty: bool,
    cmd: &'a [String],
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateExecResponse {
    id: String,
}

/// Body of `POST /exec/{id}/start`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct StartExecBody {
    detach: bool,
    tty: bool,
}

/// Subset of `GET /exec/{id}/json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecInspect {
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub exit_code: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    message: String,
}

/// HTTP client for the container runtime's exec API.
///
/// Every call opens its own connection; exec start hands that connection
/// over to the caller once upgraded.
#[derive(Debug, Clone)]
pub struct DockerClient {
    addr: ControlPlaneAddr,
    timeout: Duration,
    command_timeout: Duration,
}

impl DockerClient {
    /// Create a client for `addr`.
    #[must_use]
    pub const fn new(addr: ControlPlaneAddr, timeout: Duration) -> Self {
        Self {
            addr,
            timeout,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Create a client from gateway configuration.
    #[must_use]
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(config.control_plane.clone(), config.control_timeout)
            .with_command_timeout(config.command_timeout)
    }

    /// Bound on one-shot commands run through [`crate::CommandRunner`].
    #[must_use]
    pub const fn with_command_timeout(mut self, limit: Duration) -> Self {
        self.command_timeout = limit;
        self
    }

    pub(crate) const fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    /// Control-plane address.
    #[must_use]
    pub const fn addr(&self) -> &ControlPlaneAddr {
        &self.addr
    }

    /// Inspect an exec, mainly for its exit code.
    ///
    /// # Errors
    /// Returns error on transport failure or a non-2xx status.
    pub async fn inspect_exec(&self, exec_id: &str) -> Result<ExecInspect, NegotiationError> {
        let (head, body) = self
            .request("GET", &format!("/exec/{exec_id}/json"), None)
            .await?;
        if !head.is_success() {
            return Err(NegotiationError::Api {
                status: head.status,
                body: body_text(&body),
            });
        }
        serde_json::from_slice(&body)
            .map_err(|e| NegotiationError::MalformedResponse(format!("exec inspect: {e}")))
    }

    /// One request/response exchange on a fresh `Connection: close` socket.
    async fn request(
        &self,
        method: &str,
        path: &str,
        body: Option<&[u8]>,
    ) -> Result<(ResponseHead, Vec<u8>), NegotiationError> {
        let exchange = async {
            let mut stream = endpoint::connect(&self.addr, self.timeout).await?;
            let raw = http::encode_request(
                method,
                path,
                &self.addr.host_header(),
                &[("Content-Type", "application/json"), ("Connection", "close")],
                body,
            );
            stream.write_all(&raw).await?;
            stream.flush().await?;

            let (head, leftover) = http::read_head(&mut stream).await?;
            let body = http::read_body(&mut stream, &head, leftover).await?;
            Ok((head, body))
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| NegotiationError::Timeout(self.timeout))?
    }

    async fn start_raw(&self, exec_id: &str, tty: bool) -> Result<RawStream, NegotiationError> {
        let mut stream = endpoint::connect(&self.addr, self.timeout).await?;
        let body = serde_json::to_vec(&StartExecBody { detach: false, tty })
            .map_err(|e| NegotiationError::MalformedResponse(e.to_string()))?;
        let raw = http::encode_request(
            "POST",
            &format!("/exec/{exec_id}/start"),
            &self.addr.host_header(),
            &[
                ("Content-Type", "application/json"),
                ("Connection", "Upgrade"),
                ("Upgrade", "tcp"),
            ],
            Some(&body),
        );
        stream.write_all(&raw).await?;
        stream.flush().await?;

        let (head, leftover) = http::read_head(&mut stream).await?;
        if head.is_attached() {
            tracing::debug!(exec_id, status = head.status, "Exec stream attached");
            return Ok(Box::new(Rewind::new(leftover.freeze(), stream)));
        }

        let body = if head.header("content-length").is_some() {
            http::read_body(&mut stream, &head, leftover)
                .await
                .unwrap_or_else(|e| {
                    tracing::debug!(exec_id, status = head.status, "Failed to read start error body: {e}");
                    Vec::new()
                })
        } else {
            leftover.to_vec()
        };
        let message = serde_json::from_slice::<ApiMessage>(&body)
            .map(|m| m.message)
            .unwrap_or_else(|_| {
                let text = body_text(&body);
                if text.is_empty() { head.reason.clone() } else { text }
            });
        Err(NegotiationError::ExecStart {
            status: head.status,
            message,
        })
    }
}

#[async_trait]
impl ControlPlane for DockerClient {
    async fn create_exec(&self, target: &str, spec: &ExecSpec) -> Result<String, NegotiationError> {
        validate_target(target)?;
        let body = serde_json::to_vec(&CreateExecBody {
            attach_stdin: spec.attach_stdin,
            attach_stdout: true,
            attach_stderr: true,
            tty: spec.tty,
            cmd: &spec.command,
        })
        .map_err(|e| NegotiationError::MalformedResponse(e.to_string()))?;

        let (head, body) = self
            .request("POST", &format!("/containers/{target}/exec"), Some(&body))
            .await?;
        if !head.is_success() {
            return Err(NegotiationError::ExecCreate {
                status: head.status,
                body: body_text(&body),
            });
        }

        let created: CreateExecResponse = serde_json::from_slice(&body)
            .map_err(|e| NegotiationError::MalformedResponse(format!("exec create: {e}")))?;
        tracing::debug!(container = target, exec_id = %created.id, "Exec created");
        Ok(created.id)
    }

    async fn start_exec(&self, exec_id: &str, tty: bool) -> Result<RawStream, NegotiationError> {
        tokio::time::timeout(self.timeout, self.start_raw(exec_id, tty))
            .await
            .map_err(|_| NegotiationError::Timeout(self.timeout))?
    }

    async fn resize_exec(&self, exec_id: &str, cols: u16, rows: u16) -> Result<(), ResizeError> {
        let (head, body) = self
            .request(
                "POST",
                &format!("/exec/{exec_id}/resize?h={rows}&w={cols}"),
                None,
            )
            .await?;
        if head.is_success() {
            Ok(())
        } else {
            Err(ResizeError::Rejected {
                status: head.status,
                body: body_text(&body),
            })
        }
    }
}

/// Reject identifiers that cannot name a container.
///
/// # Errors
/// Returns `InvalidTarget` for empty identifiers or ones with characters
/// outside `[A-Za-z0-9_.-]`.
pub fn validate_target(target: &str) -> Result<(), NegotiationError> {
    let valid = !target.is_empty()
        && target
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(NegotiationError::InvalidTarget(target.to_string()))
    }
}

fn body_text(body: &[u8]) -> String {
    String::from_utf8_lossy(body).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_target() {
        assert!(validate_target("opencode-dev_1.box").is_ok());
        assert!(validate_target("3f2a9c").is_ok());
        assert!(validate_target("").is_err());
        assert!(validate_target("../etc").is_err());
        assert!(validate_target("a b").is_err());
    }

    #[test]
    fn test_create_body_uses_docker_field_names() {
        let cmd = vec!["ls".to_string()];
        let body = serde_json::to_value(CreateExecBody {
            attach_stdin: false,
            attach_stdout: true,
            attach_stderr: true,
            tty: false,
            cmd: &cmd,
        })
        .unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "AttachStdin": false,
                "AttachStdout": true,
                "AttachStderr": true,
                "Tty": false,
                "Cmd": ["ls"],
            })
        );
    }

    #[test]
    fn test_start_body() {
        let body = serde_json::to_string(&StartExecBody {
            detach: false,
            tty: true,
        })
        .unwrap();
        assert_eq!(body, r#"{"Detach":false,"Tty":true}"#);
    }
}
