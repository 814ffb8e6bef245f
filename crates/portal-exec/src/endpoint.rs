//! Transport connections to the control plane.

use std::time::Duration;

use portal_core::{ControlPlaneAddr, NegotiationError, RawStream};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

/// Open a fresh connection to the control plane.
///
/// # Errors
/// Returns `SocketNotFound` for a missing Unix socket, `Timeout` if the
/// connect does not finish in time, `Io` otherwise.
pub async fn connect(
    addr: &ControlPlaneAddr,
    timeout: Duration,
) -> Result<RawStream, NegotiationError> {
    let connecting = async {
        match addr {
            #[cfg(unix)]
            ControlPlaneAddr::Unix(path) => {
                if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                    return Err(NegotiationError::SocketNotFound(
                        path.display().to_string(),
                    ));
                }
                let stream = UnixStream::connect(path).await?;
                Ok(Box::new(stream) as RawStream)
            }
            #[cfg(not(unix))]
            ControlPlaneAddr::Unix(path) => {
                Err(NegotiationError::SocketNotFound(path.display().to_string()))
            }
            ControlPlaneAddr::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream) as RawStream)
            }
        }
    };

    tokio::time::timeout(timeout, connecting)
        .await
        .map_err(|_| NegotiationError::Timeout(timeout))?
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_socket_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docker.sock");
        let err = connect(&ControlPlaneAddr::Unix(path.clone()), Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        match err {
            NegotiationError::SocketNotFound(p) => assert_eq!(p, path.display().to_string()),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_connects_to_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docker.sock");
        let _listener = tokio::net::UnixListener::bind(&path).unwrap();
        assert!(
            connect(&ControlPlaneAddr::Unix(path), Duration::from_secs(1))
                .await
                .is_ok()
        );
    }
}
