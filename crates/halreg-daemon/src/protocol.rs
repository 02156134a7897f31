//! Wire format for the registry's local IPC.
//!
//! Length-prefixed JSON-RPC 2.0 frames:
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! Requests carry an `id`; server-push registration notifications are
//! requests without an `id` (method `"registration"`), so a client can
//! tell replies and pushes apart.

use halreg_core::{IpcConfig, RegistryError, Result, ServiceHandle};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Method name of server-push registration notifications.
pub const REGISTRATION_METHOD: &str = "registration";

/// JSON-RPC 2.0 request (or push notification when `id` is absent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

impl RpcRequest {
    /// Create a new JSON-RPC 2.0 request.
    pub fn new(method: impl Into<String>, params: serde_json::Value, id: u64) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params: Some(params),
            id: Some(id),
        }
    }

    /// Create a server-push registration notification (no `id`).
    pub fn notification(event: &RegistrationEvent) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: REGISTRATION_METHOD.to_string(),
            params: serde_json::to_value(event).ok(),
            id: None,
        }
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Option<u64>,
}

impl RpcResponse {
    /// Create a success response.
    pub fn success(id: Option<u64>, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Create an error response.
    pub fn error(id: Option<u64>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(RpcError { code, message }),
            id,
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

/// Incoming frame shape, before we know whether it is a reply or a push.
#[derive(Debug, Deserialize)]
pub struct Incoming {
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<RpcError>,
    #[serde(default)]
    pub id: Option<u64>,
}

/// One registration notification delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationEvent {
    pub fq_name: String,
    pub instance: String,
    pub preexisting: bool,
}

/// Wire form of a resolved handle. The actual data-plane connection to
/// the service is out of scope for the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleDescriptor {
    pub id: u64,
    pub owner_pid: Option<u32>,
}

impl From<&ServiceHandle> for HandleDescriptor {
    fn from(handle: &ServiceHandle) -> Self {
        Self {
            id: handle.id().0,
            owner_pid: handle.owner_pid(),
        }
    }
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed the connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > IpcConfig::MAX_IPC_MESSAGE_SIZE {
        return Err(RegistryError::transport(format!(
            "IPC message size {} exceeds maximum {}",
            len,
            IpcConfig::MAX_IPC_MESSAGE_SIZE
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trip() {
        let payload = br#"{"jsonrpc":"2.0","method":"ping","id":1}"#;
        let mut buf = std::io::Cursor::new(Vec::new());
        write_frame(&mut buf, payload).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf.into_inner());
        let read = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(read, payload);
    }

    #[tokio::test]
    async fn eof_reads_as_none() {
        let mut cursor = std::io::Cursor::new(Vec::new());
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(u32::MAX).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_frame(&mut cursor).await.is_err());
    }

    #[test]
    fn notification_has_no_id() {
        let event = RegistrationEvent {
            fq_name: "pkg.foo@1.0::IFoo".into(),
            instance: "default".into(),
            preexisting: false,
        };
        let frame = RpcRequest::notification(&event);
        assert_eq!(frame.method, REGISTRATION_METHOD);
        assert!(frame.id.is_none());

        let json = serde_json::to_string(&frame).unwrap();
        let incoming: Incoming = serde_json::from_str(&json).unwrap();
        assert_eq!(incoming.method.as_deref(), Some(REGISTRATION_METHOD));
        let parsed: RegistrationEvent = serde_json::from_value(incoming.params.unwrap()).unwrap();
        assert_eq!(parsed, event);
    }
}
