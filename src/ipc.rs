//! Worker IPC - length-prefixed JSON frames over a local socket.
//!
//! Per request: connect, send the pre-shared key frame, send the request
//! frame, read one response frame, done. The socket is one-shot; there is
//! no pooling.

use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::error::{AgentError, Result};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 6000;
pub const DEFAULT_AUTH_KEY: &[u8] = b"deskpilot";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Frames larger than this are refused outright.
const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub prompt: String,
    #[serde(default)]
    pub app_context: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkerResponse {
    pub fn ok(response: serde_json::Value, raw_text: String) -> Self {
        Self {
            success: true,
            response: Some(response),
            raw_text: Some(raw_text),
            error: None,
        }
    }

    pub fn failure(error: String, raw_text: Option<String>) -> Self {
        Self {
            success: false,
            response: None,
            raw_text,
            error: Some(error),
        }
    }
}

/// 4-byte big-endian length prefix, then the payload.
pub fn write_frame(stream: &mut impl Write, payload: &[u8]) -> std::io::Result<()> {
    let len = (payload.len() as u32).to_be_bytes();
    stream.write_all(&len)?;
    stream.write_all(payload)?;
    stream.flush()
}

pub fn read_frame(stream: &mut impl Read) -> std::io::Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes)?;
    let len = u32::from_be_bytes(len_bytes) as usize;

    if len > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes", len),
        ));
    }

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    Ok(payload)
}

/// Blocking client used by the pipeline's LLM threads.
pub struct WorkerClient {
    host: String,
    port: u16,
    auth_key: Vec<u8>,
    timeout: Duration,
}

impl WorkerClient {
    pub fn new(host: &str, port: u16, auth_key: &[u8], timeout: Duration) -> Self {
        Self {
            host: host.to_string(),
            port,
            auth_key: auth_key.to_vec(),
            timeout,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT, DEFAULT_AUTH_KEY, DEFAULT_TIMEOUT)
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Availability probe: a short TCP connect, nothing more.
    pub fn is_available(&self) -> bool {
        let addrs = match self.addr().to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(_) => return false,
        };
        for addr in addrs {
            if TcpStream::connect_timeout(&addr, Duration::from_secs(2)).is_ok() {
                return true;
            }
        }
        false
    }

    /// One full request/response exchange with the worker.
    pub fn think(&self, prompt: &str, app_context: &str) -> Result<WorkerResponse> {
        let addr = self
            .addr()
            .to_socket_addrs()
            .map_err(|e| AgentError::IpcUnavailable(e.to_string()))?
            .next()
            .ok_or_else(|| AgentError::IpcUnavailable("no address for worker".to_string()))?;

        let mut stream = TcpStream::connect_timeout(&addr, Duration::from_secs(2))
            .map_err(|e| AgentError::IpcUnavailable(format!("worker not reachable: {}", e)))?;
        stream
            .set_read_timeout(Some(self.timeout))
            .and_then(|_| stream.set_write_timeout(Some(self.timeout)))
            .map_err(|e| AgentError::Internal(e.to_string()))?;

        write_frame(&mut stream, &self.auth_key)
            .map_err(|e| AgentError::IpcUnavailable(format!("handshake failed: {}", e)))?;

        let request = WorkerRequest {
            prompt: prompt.to_string(),
            app_context: app_context.to_string(),
        };
        let payload = serde_json::to_vec(&request)?;
        write_frame(&mut stream, &payload)
            .map_err(|e| AgentError::IpcUnavailable(format!("send failed: {}", e)))?;

        let response_bytes = read_frame(&mut stream).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut
            {
                AgentError::Timeout(format!(
                    "worker did not answer within {}s",
                    self.timeout.as_secs()
                ))
            } else {
                AgentError::IpcUnavailable(format!("receive failed: {}", e))
            }
        })?;

        let response: WorkerResponse = serde_json::from_slice(&response_bytes)?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_frame_roundtrip() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, b"hello frames").unwrap();

        let mut cursor = Cursor::new(buffer);
        let payload = read_frame(&mut cursor).unwrap();
        assert_eq!(payload, b"hello frames");
    }

    #[test]
    fn test_oversized_frame_refused() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&(u32::MAX).to_be_bytes());
        buffer.extend_from_slice(b"junk");

        let mut cursor = Cursor::new(buffer);
        assert!(read_frame(&mut cursor).is_err());
    }

    #[test]
    fn test_request_serialization() {
        let request = WorkerRequest {
            prompt: "أنشئ مجلد".to_string(),
            app_context: "chrome, notepad".to_string(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["prompt"], "أنشئ مجلد");
        assert_eq!(json["app_context"], "chrome, notepad");
    }

    #[test]
    fn test_response_shapes() {
        let ok = WorkerResponse::ok(serde_json::json!({"intent": "open"}), "raw".to_string());
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["success"], true);
        assert!(json.get("error").is_none());

        let failed = WorkerResponse::failure("no valid JSON".to_string(), Some("blah".to_string()));
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["raw_text"], "blah");
    }

    #[test]
    fn test_probe_fails_on_dead_port() {
        // Port 1 is essentially never listening
        let client = WorkerClient::new("127.0.0.1", 1, b"key", Duration::from_secs(1));
        assert!(!client.is_available());
    }
}
