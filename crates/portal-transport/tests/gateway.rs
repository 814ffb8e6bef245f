//! Gateway end to end: real sockets, scripted control plane.

use std::{
    cell::Cell,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use portal_core::{
    ClientMessage, ControlPlane, ExecSpec, GatewayConfig, NegotiationError, RawStream,
    ResizeError, RetryPolicy, ServerMessage,
};
use portal_exec::{CommandRunner, ExecError, ExecOutput, StreamType, encode_frame};
use portal_relay::BridgeConfig;
use portal_transport::{
    ConnectionStatus, Gateway, GatewayState, TerminalAdapter, TerminalClient, TerminalSurface,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf},
    net::TcpStream,
    sync::mpsc,
    time::timeout,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

type Calls = Arc<Mutex<Vec<String>>>;
type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Plane {
    calls: Calls,
    next_id: Mutex<usize>,
    remotes: mpsc::UnboundedSender<DuplexStream>,
}

#[async_trait]
impl ControlPlane for Plane {
    async fn create_exec(&self, target: &str, _spec: &ExecSpec) -> Result<String, NegotiationError> {
        self.calls.lock().unwrap().push(format!("create {target}"));
        let mut next = self.next_id.lock().unwrap();
        *next += 1;
        Ok(format!("exec-{next}"))
    }

    async fn start_exec(&self, exec_id: &str, _tty: bool) -> Result<RawStream, NegotiationError> {
        let (local, remote) = tokio::io::duplex(4096);
        let _ = self.remotes.send(remote);
        Ok(Box::new(Tracked {
            inner: local,
            exec_id: exec_id.to_string(),
            calls: self.calls.clone(),
        }))
    }

    async fn resize_exec(&self, exec_id: &str, cols: u16, rows: u16) -> Result<(), ResizeError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("resize {exec_id} {cols}x{rows}"));
        Ok(())
    }
}

struct Tracked {
    inner: DuplexStream,
    exec_id: String,
    calls: Calls,
}

impl AsyncRead for Tracked {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Tracked {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let call = format!("close {}", self.exec_id);
        self.calls.lock().unwrap().push(call);
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

struct NoRunner;

#[async_trait]
impl CommandRunner for NoRunner {
    async fn run(&self, _target: &str, _command: Vec<String>) -> Result<ExecOutput, ExecError> {
        Err(NegotiationError::MalformedResponse("no runner".into()).into())
    }
}

struct Harness {
    gateway: Gateway,
    addr: SocketAddr,
    calls: Calls,
    remotes: mpsc::UnboundedReceiver<DuplexStream>,
}

impl Harness {
    async fn start(default_container: Option<&str>, tty: bool) -> Self {
        let (remotes_tx, remotes) = mpsc::unbounded_channel();
        let calls = Calls::default();
        let plane = Arc::new(Plane {
            calls: calls.clone(),
            next_id: Mutex::new(0),
            remotes: remotes_tx,
        });
        let config = GatewayConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            default_container: default_container.map(String::from),
            ..GatewayConfig::default()
        };
        let bridge = BridgeConfig {
            command: vec!["bash".into()],
            tty,
            retry: RetryPolicy::default(),
        };
        let gateway = Gateway::new(GatewayState::with_bridge(
            config,
            bridge,
            plane,
            Arc::new(NoRunner),
        ));
        let addr = gateway.ensure_started().await.unwrap();
        Self {
            gateway,
            addr,
            calls,
            remotes,
        }
    }

    fn url(&self, query: &str) -> String {
        format!("ws://{}/api/terminal/ws{query}", self.addr)
    }

    async fn open(&self, query: &str) -> Socket {
        let (socket, _) = connect_async(self.url(query)).await.unwrap();
        socket
    }

    async fn remote(&mut self) -> DuplexStream {
        timeout(Duration::from_secs(5), self.remotes.recv())
            .await
            .expect("timed out waiting for exec start")
            .unwrap()
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    async fn wait_for_call(&self, call: &str) {
        timeout(Duration::from_secs(5), async {
            while !self.calls().iter().any(|c| c == call) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("never saw {call:?} in {:?}", self.calls()));
    }
}

async fn send(socket: &mut Socket, msg: &ClientMessage) {
    let json = serde_json::to_string(msg).unwrap();
    socket.send(Message::Text(json.into())).await.unwrap();
}

/// Next server message, or `None` once the socket is closed.
async fn next_message(socket: &mut Socket) -> Option<ServerMessage> {
    loop {
        let msg = timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for server message")?;
        match msg {
            Ok(Message::Text(text)) => return Some(serde_json::from_str(text.as_str()).unwrap()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

/// Next message that is not a progress log.
async fn next_event(socket: &mut Socket) -> Option<ServerMessage> {
    loop {
        match next_message(socket).await {
            Some(ServerMessage::Log { .. }) => {}
            other => return other,
        }
    }
}

#[tokio::test]
async fn test_input_yields_single_output_frame() {
    let mut harness = Harness::start(None, false).await;
    let mut socket = harness.open("?containerId=box").await;

    assert_eq!(
        next_event(&mut socket).await,
        Some(ServerMessage::Connected {
            container_target: "box".into()
        })
    );
    let mut remote = harness.remote().await;

    send(&mut socket, &ClientMessage::input("ls\n")).await;
    let mut buf = [0u8; 16];
    let n = remote.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"ls\n");

    remote
        .write_all(&encode_frame(StreamType::Stdout, b"file.txt\n"))
        .await
        .unwrap();
    assert_eq!(
        next_event(&mut socket).await,
        Some(ServerMessage::output("file.txt\n"))
    );

    // Nothing else follows the single frame.
    send(&mut socket, &ClientMessage::Ping).await;
    assert_eq!(next_event(&mut socket).await, Some(ServerMessage::Pong));
}

#[tokio::test]
async fn test_missing_target_fails_fast() {
    let harness = Harness::start(None, true).await;
    let mut socket = harness.open("").await;

    assert_eq!(
        next_message(&mut socket).await,
        Some(ServerMessage::error(
            "Container ID is required. Set OPENCODE_CONTAINER env variable."
        ))
    );
    assert_eq!(next_message(&mut socket).await, None);
    assert!(harness.calls().is_empty());
}

#[tokio::test]
async fn test_default_container_used_without_query() {
    let harness = Harness::start(Some("fallback"), true).await;
    let mut socket = harness.open("?serverUrl=http://agent:4000").await;

    assert_eq!(
        next_event(&mut socket).await,
        Some(ServerMessage::Connected {
            container_target: "fallback".into()
        })
    );
    assert_eq!(harness.calls()[0], "create fallback");
}

#[tokio::test]
async fn test_client_disconnect_closes_stream_once() {
    let mut harness = Harness::start(Some("box"), true).await;
    let mut socket = harness.open("").await;
    assert!(matches!(
        next_event(&mut socket).await,
        Some(ServerMessage::Connected { .. })
    ));
    let _remote = harness.remote().await;
    assert_eq!(harness.gateway.registry().len().await, 1);

    socket.close(None).await.unwrap();
    harness.wait_for_call("close exec-1").await;

    timeout(Duration::from_secs(5), async {
        while !harness.gateway.registry().is_empty().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let closes = harness
        .calls()
        .iter()
        .filter(|c| c.starts_with("close"))
        .count();
    assert_eq!(closes, 1);
}

#[tokio::test]
async fn test_manual_reconnect_over_socket() {
    let mut harness = Harness::start(Some("box"), true).await;
    let mut socket = harness.open("").await;
    assert!(matches!(
        next_event(&mut socket).await,
        Some(ServerMessage::Connected { .. })
    ));
    let _first = harness.remote().await;

    send(&mut socket, &ClientMessage::Reconnect).await;
    assert!(matches!(
        next_event(&mut socket).await,
        Some(ServerMessage::Connected { .. })
    ));
    let _second = harness.remote().await;

    let calls = harness.calls();
    let close = calls.iter().position(|c| c == "close exec-1").unwrap();
    let create = calls.iter().rposition(|c| c == "create box").unwrap();
    assert!(close < create);
}

#[tokio::test]
async fn test_invalid_client_message_reports_error() {
    let harness = Harness::start(Some("box"), true).await;
    let mut socket = harness.open("").await;
    assert!(matches!(
        next_event(&mut socket).await,
        Some(ServerMessage::Connected { .. })
    ));

    socket
        .send(Message::Text(r#"{"type":"launch"}"#.into()))
        .await
        .unwrap();
    assert!(matches!(
        next_event(&mut socket).await,
        Some(ServerMessage::Error { message }) if message.starts_with("Invalid message")
    ));
}

#[tokio::test]
async fn test_ensure_started_is_idempotent() {
    let harness = Harness::start(Some("box"), true).await;
    let (a, b) = tokio::join!(
        harness.gateway.ensure_started(),
        harness.gateway.ensure_started()
    );
    assert_eq!(a.unwrap(), harness.addr);
    assert_eq!(b.unwrap(), harness.addr);
    assert_eq!(harness.gateway.local_addr(), Some(harness.addr));
}

/// Surface that records writes and reports a fixed size.
#[derive(Clone, Default)]
struct RecordingSurface {
    written: Arc<Mutex<String>>,
    disposed: Arc<Mutex<bool>>,
}

impl TerminalSurface for RecordingSurface {
    fn write(&mut self, data: &str) -> io::Result<()> {
        self.written.lock().unwrap().push_str(data);
        Ok(())
    }

    fn size(&self) -> io::Result<(u16, u16)> {
        Ok((100, 30))
    }

    fn dispose(&mut self) {
        *self.disposed.lock().unwrap() = true;
    }
}

async fn wait_until(check: impl Fn() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}

#[tokio::test]
async fn test_adapter_replays_history_across_remounts() {
    let mut harness = Harness::start(Some("box"), true).await;
    let client = Arc::new(
        TerminalClient::connect(&harness.url(""))
            .await
            .unwrap(),
    );
    wait_until(|| client.status() == ConnectionStatus::Connected).await;
    assert_eq!(client.container_target().as_deref(), Some("box"));

    // Output that arrives before any surface exists.
    let mut remote = harness.remote().await;
    remote.write_all(b"$ early\r\n").await.unwrap();
    wait_until(|| client.output().history() == "$ early\r\n").await;

    let surface = RecordingSurface::default();
    let mounted = TerminalAdapter::mount(client.clone(), surface.clone());
    wait_until(|| surface.written.lock().unwrap().as_str() == "$ early\r\n").await;
    harness.wait_for_call("resize exec-1 100x30").await;

    remote.write_all(b"live\r\n").await.unwrap();
    wait_until(|| surface.written.lock().unwrap().ends_with("live\r\n")).await;

    mounted.input("pwd\n").await.unwrap();
    let mut buf = [0u8; 16];
    let n = remote.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"pwd\n");

    mounted.unmount().await.unwrap();
    assert!(*surface.disposed.lock().unwrap());
    assert_eq!(client.status(), ConnectionStatus::Connected);

    let again = RecordingSurface::default();
    let remounted = TerminalAdapter::mount(client.clone(), again.clone());
    wait_until(|| again.written.lock().unwrap().as_str() == "$ early\r\nlive\r\n").await;
    remounted.unmount().await.unwrap();

    assert!(client.debug_log().iter().any(|e| e.message == "Connected to box"));
}

#[tokio::test]
async fn test_client_tracks_stream_end() {
    let mut harness = Harness::start(Some("box"), true).await;
    let client = TerminalClient::connect(&harness.url("")).await.unwrap();
    wait_until(|| client.status() == ConnectionStatus::Connected).await;

    drop(harness.remote().await);
    wait_until(|| client.status() == ConnectionStatus::Disconnected).await;
    assert_eq!(client.last_error(), None);

    client.reconnect().await.unwrap();
    wait_until(|| client.status() == ConnectionStatus::Connected).await;
}

/// Surface with interior mutability; it can move between threads but not be shared.
struct CellSurface {
    measured: Cell<u16>,
    written: Arc<Mutex<String>>,
}

impl TerminalSurface for CellSurface {
    fn write(&mut self, data: &str) -> io::Result<()> {
        self.written.lock().unwrap().push_str(data);
        Ok(())
    }

    fn size(&self) -> io::Result<(u16, u16)> {
        self.measured.set(self.measured.get() + 1);
        Ok((90, 20))
    }
}

#[tokio::test]
async fn test_adapter_mounts_unshared_surface() {
    let mut harness = Harness::start(Some("box"), true).await;
    let client = Arc::new(TerminalClient::connect(&harness.url("")).await.unwrap());
    wait_until(|| client.status() == ConnectionStatus::Connected).await;
    let mut remote = harness.remote().await;

    let written = Arc::new(Mutex::new(String::new()));
    let mounted = TerminalAdapter::mount(
        client.clone(),
        CellSurface {
            measured: Cell::new(0),
            written: written.clone(),
        },
    );
    harness.wait_for_call("resize exec-1 90x20").await;

    remote.write_all(b"ok\r\n").await.unwrap();
    wait_until(|| written.lock().unwrap().as_str() == "ok\r\n").await;

    let surface = mounted.unmount().await.unwrap();
    assert!(surface.measured.get() >= 1);
}
