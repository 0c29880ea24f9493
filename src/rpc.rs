//! RPC Bridge - talks to a plugin process before it is trusted.
//!
//! Lifecycle:
//! 1. The plugin binary is launched with `SKYCTL_PLUGIN_PROTOCOL=1` in its
//!    environment, stdin closed and stdout piped.
//! 2. The plugin binds a loopback TCP listener and prints exactly one
//!    handshake line on stdout:
//!
//!    ```text
//!    SKYCTL_PLUGIN_RPC 1 tcp 127.0.0.1:40123
//!    ```
//!
//! 3. The host connects and exchanges newline-delimited JSON:
//!    `{"id":1,"method":"GetMetadata"}` -> `{"id":1,"result":{...}}`
//!    or `{"id":1,"error":"message"}`.
//! 4. `close` sends SIGTERM, waits a grace period, then kills.
//!
//! Both the handshake and every call are bounded by timeouts. On any
//! failure the process is terminated before the error is returned.

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::path::Path;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::plugins::PluginMetadata;

/// First token of the handshake line
pub const HANDSHAKE_MAGIC: &str = "SKYCTL_PLUGIN_RPC";

/// Protocol version spoken by this host
pub const PROTOCOL_VERSION: u32 = 1;

/// Environment variable telling the plugin it was launched by the host
pub const PROTOCOL_ENV: &str = "SKYCTL_PLUGIN_PROTOCOL";

/// Method name of the metadata call
pub const METHOD_GET_METADATA: &str = "GetMetadata";

/// Longest accepted handshake line, newline included
const MAX_HANDSHAKE_LINE: u64 = 512;

/// Longest accepted response line
const MAX_RESPONSE_LINE: u64 = 1024 * 1024;

static HANDSHAKE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^SKYCTL_PLUGIN_RPC (\d{1,9}) (\S+) (\S+)$").expect("handshake pattern is valid")
});

/// Errors raised by the RPC bridge
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Failed to launch plugin: {0}")]
    Launch(String),

    #[error("Plugin did not complete the handshake within {} seconds", .0.as_secs_f64())]
    HandshakeTimeout(Duration),

    #[error("Invalid plugin handshake: {0}")]
    InvalidHandshake(String),

    #[error("Plugin communication failed: {0}")]
    Communication(String),
}

/// Timeouts governing one bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Window for the handshake line to arrive
    pub handshake_timeout: Duration,
    /// Bound on each request/response exchange
    pub call_timeout: Duration,
    /// Time between SIGTERM and a forced kill
    pub kill_grace: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(30),
            kill_grace: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    id: u64,
    method: &'a str,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    id: u64,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Parse a handshake line into the loopback address the plugin listens on
pub fn parse_handshake(line: &str) -> Result<SocketAddr, BridgeError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let caps = HANDSHAKE_RE.captures(line).ok_or_else(|| {
        BridgeError::InvalidHandshake(format!(
            "expected '{} <version> tcp <address>', got '{}'",
            HANDSHAKE_MAGIC,
            truncate(line, 80)
        ))
    })?;

    let version: u32 = caps[1]
        .parse()
        .map_err(|_| BridgeError::InvalidHandshake("unreadable protocol version".to_string()))?;
    if version != PROTOCOL_VERSION {
        return Err(BridgeError::InvalidHandshake(format!(
            "unsupported protocol version {} (host speaks {})",
            version, PROTOCOL_VERSION
        )));
    }

    if &caps[2] != "tcp" {
        return Err(BridgeError::InvalidHandshake(format!(
            "unsupported network '{}'",
            &caps[2]
        )));
    }

    let addr: SocketAddr = caps[3].parse().map_err(|_| {
        BridgeError::InvalidHandshake(format!("unparseable address '{}'", &caps[3]))
    })?;
    if !addr.ip().is_loopback() {
        return Err(BridgeError::InvalidHandshake(format!(
            "address {} is not a loopback address",
            addr
        )));
    }
    Ok(addr)
}

/// Decode one response line for request `expected_id`
pub fn decode_response<T: DeserializeOwned>(line: &str, expected_id: u64) -> Result<T, BridgeError> {
    let response: RpcResponse = serde_json::from_str(line.trim_end())
        .map_err(|e| BridgeError::Communication(format!("malformed response: {}", e)))?;

    if response.id != expected_id {
        return Err(BridgeError::Communication(format!(
            "response id {} does not match request id {}",
            response.id, expected_id
        )));
    }
    if let Some(error) = response.error {
        return Err(BridgeError::Communication(format!(
            "plugin returned error: {}",
            error
        )));
    }
    let result = response
        .result
        .ok_or_else(|| BridgeError::Communication("response carries no result".to_string()))?;

    serde_json::from_value(result)
        .map_err(|e| BridgeError::Communication(format!("malformed result: {}", e)))
}

/// A running plugin process plus its RPC channel
pub struct BridgeHandle {
    child: Option<Child>,
    channel: Option<BufReader<TcpStream>>,
    config: BridgeConfig,
    next_id: u64,
}

impl BridgeHandle {
    /// Launch `executable` and complete the handshake.
    ///
    /// The process is terminated if anything fails before a handle is returned.
    pub async fn start(executable: &Path, config: BridgeConfig) -> Result<Self, BridgeError> {
        debug!(executable = ?executable, "Launching plugin");

        let mut child = Command::new(executable)
            .env(PROTOCOL_ENV, PROTOCOL_VERSION.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BridgeError::Launch(e.to_string()))?;

        let connected = match Self::handshake(&mut child, &config).await {
            Ok(addr) => Self::connect(addr, &config).await,
            Err(e) => Err(e),
        };

        match connected {
            Ok(stream) => {
                info!(pid = ?child.id(), "Plugin bridge established");
                Ok(Self {
                    child: Some(child),
                    channel: Some(BufReader::new(stream)),
                    config,
                    next_id: 1,
                })
            }
            Err(e) => {
                warn!(error = %e, "Plugin failed to start, terminating it");
                terminate(&mut child, config.kill_grace).await;
                Err(e)
            }
        }
    }

    /// Read the handshake line and hand the rest of stdout to a drain task
    async fn handshake(child: &mut Child, config: &BridgeConfig) -> Result<SocketAddr, BridgeError> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Launch("plugin stdout is not captured".to_string()))?;
        let mut reader = BufReader::new(stdout);

        let line = timeout(
            config.handshake_timeout,
            read_bounded_line(&mut reader, MAX_HANDSHAKE_LINE),
        )
        .await
        .map_err(|_| BridgeError::HandshakeTimeout(config.handshake_timeout))?
        .map_err(|e| BridgeError::InvalidHandshake(format!("reading stdout: {}", e)))?;

        let line = match line {
            BoundedLine::Line(line) => line,
            BoundedLine::Eof => {
                return Err(BridgeError::InvalidHandshake(
                    "plugin closed stdout before the handshake".to_string(),
                ))
            }
            BoundedLine::TooLong => {
                return Err(BridgeError::InvalidHandshake(format!(
                    "handshake line exceeds {} bytes",
                    MAX_HANDSHAKE_LINE
                )))
            }
        };
        let addr = parse_handshake(&line)?;
        debug!(addr = %addr, "Plugin handshake received");

        // A plugin blocked on a full stdout pipe would stop answering calls
        tokio::spawn(async move {
            let mut chunk = [0u8; 4096];
            loop {
                match reader.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => debug!(bytes = n, "Discarded plugin stdout"),
                }
            }
        });

        Ok(addr)
    }

    async fn connect(addr: SocketAddr, config: &BridgeConfig) -> Result<TcpStream, BridgeError> {
        let stream = timeout(config.call_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                BridgeError::Communication(format!("timed out connecting to {}", addr))
            })?
            .map_err(|e| BridgeError::Communication(format!("connecting to {}: {}", addr, e)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| BridgeError::Communication(e.to_string()))?;
        Ok(stream)
    }

    /// Ask the plugin to describe itself
    pub async fn get_metadata(&mut self) -> Result<PluginMetadata, BridgeError> {
        self.call(METHOD_GET_METADATA).await
    }

    /// Issue one request and wait for its response.
    ///
    /// A timeout or transport error terminates the plugin; the handle is
    /// unusable afterwards.
    pub async fn call<T: DeserializeOwned>(&mut self, method: &str) -> Result<T, BridgeError> {
        let id = self.next_id;
        self.next_id += 1;

        let call_timeout = self.config.call_timeout;
        let channel = self
            .channel
            .as_mut()
            .ok_or_else(|| BridgeError::Communication("bridge is closed".to_string()))?;

        let result = match timeout(call_timeout, exchange(channel, id, method)).await {
            Ok(Ok(line)) => decode_response(&line, id),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BridgeError::Communication(format!(
                "no response to {} within {} seconds",
                method,
                call_timeout.as_secs_f64()
            ))),
        };

        if let Err(e) = &result {
            warn!(method = %method, error = %e, "Plugin call failed");
            self.close().await;
        }
        result
    }

    /// Stop the plugin process and drop the channel. Safe to call repeatedly.
    pub async fn close(&mut self) {
        self.channel = None;
        if let Some(mut child) = self.child.take() {
            terminate(&mut child, self.config.kill_grace).await;
        }
    }
}

impl Drop for BridgeHandle {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
    }
}

/// Write one request line and read one response line
async fn exchange(
    channel: &mut BufReader<TcpStream>,
    id: u64,
    method: &str,
) -> Result<String, BridgeError> {
    let mut request = serde_json::to_vec(&RpcRequest { id, method })
        .map_err(|e| BridgeError::Communication(e.to_string()))?;
    request.push(b'\n');

    let comm = |e: std::io::Error| BridgeError::Communication(e.to_string());
    channel.get_mut().write_all(&request).await.map_err(comm)?;
    channel.get_mut().flush().await.map_err(comm)?;

    match read_bounded_line(channel, MAX_RESPONSE_LINE).await.map_err(comm)? {
        BoundedLine::Line(line) => Ok(line),
        BoundedLine::Eof => Err(BridgeError::Communication(
            "plugin closed the connection".to_string(),
        )),
        BoundedLine::TooLong => Err(BridgeError::Communication(format!(
            "response exceeds {} bytes",
            MAX_RESPONSE_LINE
        ))),
    }
}

enum BoundedLine {
    Line(String),
    Eof,
    TooLong,
}

/// Read up to `limit` bytes looking for a newline
async fn read_bounded_line<R>(reader: &mut BufReader<R>, limit: u64) -> std::io::Result<BoundedLine>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let read = (&mut *reader).take(limit).read_until(b'\n', &mut buf).await?;
    if read == 0 {
        return Ok(BoundedLine::Eof);
    }
    if buf.last() != Some(&b'\n') {
        if (read as u64) >= limit {
            return Ok(BoundedLine::TooLong);
        }
        // EOF in the middle of a line
        return Ok(BoundedLine::Eof);
    }
    let line = String::from_utf8(buf).map_err(|e| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
    })?;
    Ok(BoundedLine::Line(line))
}

/// Graceful stop: SIGTERM, wait `grace`, then SIGKILL and reap
async fn terminate(child: &mut Child, grace: Duration) {
    if let Ok(Some(status)) = child.try_wait() {
        debug!(status = %status, "Plugin already exited");
        return;
    }

    if request_exit(child, grace).await {
        return;
    }

    match child.kill().await {
        Ok(()) => debug!("Plugin killed"),
        Err(e) => warn!(error = %e, "Failed to kill plugin process"),
    }
}

/// Send SIGTERM and wait up to `grace` for the plugin to exit
#[cfg(unix)]
async fn request_exit(child: &mut Child, grace: Duration) -> bool {
    let Some(pid) = child.id() else {
        return true;
    };
    // SAFETY: `pid` is our own unreaped child, so it cannot have been recycled.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
    match timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(status = %status, "Plugin exited after SIGTERM");
            true
        }
        _ => false,
    }
}

#[cfg(not(unix))]
async fn request_exit(_child: &mut Child, _grace: Duration) -> bool {
    false
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
