//! Terminal gateway server with a bundled xterm.js page.
//!
//! Run with: cargo run -p portal-gateway -- --container <id>
//!
//! Then open http://localhost:3000 in your browser.

use std::net::SocketAddr;

use anyhow::Context;
use axum::{Router, response::Html, routing::get};
use clap::Parser;
use portal_core::GatewayConfig;
use portal_transport::Gateway;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "portal-gateway")]
#[command(about = "Relay browser terminals to container shells")]
#[command(version)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "PORTAL_BIND")]
    bind: Option<SocketAddr>,

    /// Container attached when the page names none
    #[arg(short, long, env = "OPENCODE_CONTAINER")]
    container: Option<String>,

    /// Container runtime API, unix:///path or tcp://host:port
    #[arg(long, env = "DOCKER_HOST")]
    docker_host: Option<String>,

    /// Agent server used when a request names none
    #[arg(long, env = "OPENCODE_SERVER_URL")]
    server_url: Option<String>,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<GatewayConfig> {
        let mut config = GatewayConfig::from_env().context("invalid environment")?;
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(container) = self.container {
            config.default_container = Some(container);
        }
        if let Some(host) = self.docker_host {
            config.control_plane = host.parse()?;
        }
        if let Some(url) = self.server_url {
            config.agent_server_url = url;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Cli::parse().into_config()?;
    tracing::info!(
        control_plane = %config.control_plane,
        default_container = config.default_container.as_deref().unwrap_or(""),
        "Starting gateway"
    );

    let page = Router::new().route("/", get(index_handler));
    let gateway = Gateway::from_config(config).with_routes(page);

    let addr = gateway.ensure_started().await?;
    tracing::info!("Server listening on http://{addr}");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    gateway.shutdown().await;
    Ok(())
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>OpenCode Portal - Terminal</title>
    <link rel="stylesheet" href="https://cdn.jsdelivr.net/npm/xterm@5.3.0/css/xterm.css" />
    <script src="https://cdn.jsdelivr.net/npm/xterm@5.3.0/lib/xterm.js"></script>
    <script src="https://cdn.jsdelivr.net/npm/xterm-addon-fit@0.8.0/lib/xterm-addon-fit.js"></script>
    <style>
        body {
            margin: 0;
            padding: 20px;
            background: #1e1e1e;
            font-family: system-ui, sans-serif;
            color: #ccc;
        }
        h1 { color: #fff; margin-bottom: 10px; }
        #terminal-container {
            width: 100%;
            height: calc(100vh - 260px);
        }
        .bar { display: flex; gap: 12px; align-items: center; margin-bottom: 10px; }
        .status { font-size: 14px; }
        .connecting { color: #cc4; }
        .connected { color: #4a4; }
        .disconnected, .error { color: #a44; }
        #debug {
            height: 120px;
            overflow-y: auto;
            font: 12px monospace;
            background: #111;
            padding: 6px;
            margin-top: 10px;
            white-space: pre-wrap;
        }
    </style>
</head>
<body>
    <h1>OpenCode Portal Terminal</h1>
    <div class="bar">
        <span class="status connecting" id="status">Connecting...</span>
        <button id="reconnect" disabled>Reconnect</button>
        <button id="toggle">Hide terminal</button>
    </div>
    <div id="terminal-container"></div>
    <div id="debug"></div>

    <script>
        const HISTORY_BYTES = 1000000;
        const DEBUG_LOG_LEN = 50;

        const statusEl = document.getElementById('status');
        const reconnectBtn = document.getElementById('reconnect');
        const toggleBtn = document.getElementById('toggle');
        const container = document.getElementById('terminal-container');
        const debugEl = document.getElementById('debug');

        let history = '';
        let logs = [];
        let surface = null;

        function addLog(message) {
            const ts = new Date().toLocaleTimeString();
            logs = [...logs.slice(-(DEBUG_LOG_LEN - 1)), `[${ts}] ${message}`];
            debugEl.textContent = logs.join('\n');
            debugEl.scrollTop = debugEl.scrollHeight;
        }

        function setStatus(status, text) {
            statusEl.textContent = text;
            statusEl.className = `status ${status}`;
            reconnectBtn.disabled = status === 'connected' || status === 'connecting';
        }

        function appendHistory(data) {
            history += data;
            if (history.length > HISTORY_BYTES) {
                history = history.slice(history.length - HISTORY_BYTES);
            }
        }

        // One socket per page; surfaces come and go.
        const params = new URLSearchParams(window.location.search);
        const query = new URLSearchParams();
        if (params.get('containerId')) query.set('containerId', params.get('containerId'));
        const protocol = window.location.protocol === 'https:' ? 'wss:' : 'ws:';
        const ws = new WebSocket(`${protocol}//${window.location.host}/api/terminal/ws?${query}`);

        function send(msg) {
            if (ws.readyState === WebSocket.OPEN) {
                ws.send(JSON.stringify(msg));
            }
        }

        ws.onopen = () => addLog('Socket opened');
        ws.onclose = () => {
            setStatus('disconnected', 'Disconnected');
            addLog('Socket closed');
        };
        ws.onerror = () => addLog('Socket error');
        ws.onmessage = (event) => {
            const msg = JSON.parse(event.data);
            switch (msg.type) {
                case 'output':
                    appendHistory(msg.data);
                    if (surface) surface.term.write(msg.data);
                    break;
                case 'connected':
                    setStatus('connected', `Connected to ${msg.containerTarget}`);
                    addLog(`Connected to ${msg.containerTarget}`);
                    // Resizes sent while connecting were dropped.
                    if (surface) surface.sendSize(true);
                    break;
                case 'disconnected':
                    setStatus('disconnected', `Disconnected: ${msg.reason}`);
                    addLog(`Disconnected (${msg.code}): ${msg.reason}`);
                    break;
                case 'error':
                    setStatus('error', `Error: ${msg.message}`);
                    addLog(`Error: ${msg.message}`);
                    break;
                case 'log':
                    addLog(msg.message);
                    break;
            }
        };

        reconnectBtn.onclick = () => {
            setStatus('connecting', 'Reconnecting...');
            send({ type: 'reconnect' });
        };

        function mount() {
            const term = new Terminal({
                cursorBlink: true,
                fontSize: 14,
                fontFamily: 'Menlo, Monaco, "Courier New", monospace',
                theme: { background: '#1e1e1e', foreground: '#d4d4d4' },
            });
            const fitAddon = new FitAddon.FitAddon();
            term.loadAddon(fitAddon);
            term.open(container);

            let last = null;
            const sendSize = (force) => {
                fitAddon.fit();
                const { cols, rows } = term;
                if (!cols || !rows) return;
                if (!force && last && last.cols === cols && last.rows === rows) return;
                last = { cols, rows };
                send({ type: 'resize', cols, rows });
            };

            const onData = term.onData((data) => send({ type: 'input', data }));
            const observer = new ResizeObserver(() => {
                requestAnimationFrame(() => {
                    sendSize(false);
                    setTimeout(() => sendSize(true), 100);
                });
            });
            observer.observe(container);

            if (history) term.write(history);
            sendSize(false);
            setTimeout(() => sendSize(true), 100);

            return {
                term,
                sendSize,
                dispose() {
                    observer.disconnect();
                    onData.dispose();
                    term.dispose();
                },
            };
        }

        toggleBtn.onclick = () => {
            if (surface) {
                surface.dispose();
                surface = null;
                toggleBtn.textContent = 'Show terminal';
            } else {
                surface = mount();
                toggleBtn.textContent = 'Hide terminal';
            }
        };

        surface = mount();
    </script>
</body>
</html>
"#;
