//! Request/response framing between host, guests and capability brokers.
//!
//! Every message is a 4-byte big-endian length followed by a JSON body.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::capabilities::CapabilityOffer;
use crate::value::Value;

/// Upper bound for a single frame body (16 MB).
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Method names understood by the guest SDK and the broker.
pub mod method {
    pub const INITIALIZE: &str = "plugin.initialize";
    pub const EXECUTE: &str = "plugin.execute";
    pub const SHUTDOWN: &str = "plugin.shutdown";
    pub const AUTHENTICATE: &str = "broker.authenticate";
}

#[derive(Error, Debug)]
pub enum WireError {
    #[error("connection closed by peer")]
    Closed,

    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge(usize),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

// ─── Messages ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(result: Value) -> Self {
        Self {
            result,
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            result: Value::empty_map(),
            error: Some(message.into()),
        }
    }

    /// Split into the result or the remote error message.
    pub fn into_result(self) -> Result<Value, String> {
        match self.error {
            Some(msg) => Err(msg),
            None => Ok(self.result),
        }
    }
}

/// Parameters of `plugin.initialize`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeParams {
    pub capabilities: CapabilityOffer,
}

/// What a guest reports about itself after initialization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestIdentity {
    pub name: String,
    pub version: String,
}

// ─── Framing ────────────────────────────────────────────────────────────

pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(body.len()));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns `None` on a clean EOF before the length prefix.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, WireError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            WireError::Closed
        } else {
            WireError::Io(e)
        }
    })?;
    Ok(Some(serde_json::from_slice(&body)?))
}

// ─── Client ─────────────────────────────────────────────────────────────

/// Strictly sequential request/response client over one TCP connection.
#[derive(Debug)]
pub struct RpcClient {
    stream: TcpStream,
}

impl RpcClient {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub async fn connect(addr: std::net::SocketAddr) -> Result<Self, WireError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }

    pub async fn call(&mut self, method: &str, params: Value) -> Result<Response, WireError> {
        write_frame(&mut self.stream, &Request::new(method, params)).await?;
        read_frame(&mut self.stream).await?.ok_or(WireError::Closed)
    }
}
