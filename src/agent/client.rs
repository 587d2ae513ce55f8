//! Unix socket client for the per-VM agent.
//!
//! One connection carries one request/response exchange at a time. The
//! socket lives in the VM home; when it is absent the VM is not running.

use crate::error::{Error, Result};
use snapvisor_protocol::{encode_message, AgentRequest, AgentResponse, HEADER_LEN, MAX_FRAME_SIZE};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

// ============================================================================
// Socket Timeout Constants
// ============================================================================

/// Default socket read timeout (30 seconds).
/// Job submission and status polls answer immediately; anything slower
/// means the agent is wedged.
const DEFAULT_READ_TIMEOUT_SECS: u64 = 30;

/// Default socket write timeout (10 seconds).
const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 10;

/// Client for one agent socket.
pub struct AgentClient {
    stream: UnixStream,
}

impl AgentClient {
    /// Connect to the agent socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be reached or its timeouts
    /// cannot be configured.
    pub fn connect(socket_path: impl AsRef<Path>) -> Result<Self> {
        let stream = UnixStream::connect(socket_path.as_ref())
            .map_err(|e| Error::agent("connect to agent", e.to_string()))?;

        stream
            .set_read_timeout(Some(Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS)))
            .map_err(|e| Error::agent("set read timeout", e.to_string()))?;
        stream
            .set_write_timeout(Some(Duration::from_secs(DEFAULT_WRITE_TIMEOUT_SECS)))
            .map_err(|e| Error::agent("set write timeout", e.to_string()))?;

        Ok(Self { stream })
    }

    /// Send a request and receive its response.
    pub fn request(&mut self, req: &AgentRequest) -> Result<AgentResponse> {
        let data =
            encode_message(req).map_err(|e| Error::agent("encode message", e.to_string()))?;
        self.stream
            .write_all(&data)
            .map_err(|e| Error::agent("send message", e.to_string()))?;

        self.read_response()
    }

    fn read_response(&mut self) -> Result<AgentResponse> {
        let mut header = [0u8; HEADER_LEN];
        self.stream
            .read_exact(&mut header)
            .map_err(|e| Error::agent("read header", e.to_string()))?;

        let len = u32::from_be_bytes(header) as usize;

        // Validate frame size to prevent OOM from malicious/buggy responses
        if len > MAX_FRAME_SIZE as usize {
            return Err(Error::agent(
                "validate frame",
                format!(
                    "frame too large: {} bytes (max: {} bytes)",
                    len, MAX_FRAME_SIZE
                ),
            ));
        }

        let mut buf = vec![0u8; len];
        self.stream
            .read_exact(&mut buf)
            .map_err(|e| Error::agent("read payload", e.to_string()))?;

        serde_json::from_slice(&buf).map_err(|e| Error::agent("parse response", e.to_string()))
    }
}
