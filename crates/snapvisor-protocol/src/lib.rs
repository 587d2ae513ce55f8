//! Wire types for snapvisor host to VM-agent communication.
//!
//! The dispatcher talks to the per-VM execution agent over a Unix socket
//! placed in the VM home directory. Every long-running request is tracked
//! by a host-allocated job id; the host polls the job until it reaches a
//! terminal state or aborts it.
//!
//! # Protocol Overview
//!
//! Communication uses JSON-encoded messages. Each message is prefixed with
//! a 4-byte big-endian length header.
//!
//! ```text
//! +----------------+-------------------+
//! | Length (4 BE)  | JSON payload      |
//! +----------------+-------------------+
//! ```

#![deny(missing_docs)]

use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// Protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame size (16 MB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Length of the frame header in bytes.
pub const HEADER_LEN: usize = 4;

/// Host-allocated identifier of an in-flight agent job.
pub type JobId = u64;

/// Power state reported by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    /// Guest is executing.
    Running,
    /// Guest is paused in memory.
    Paused,
    /// Guest is powered off.
    Stopped,
    /// Guest state is saved to disk.
    Suspended,
    /// Agent cannot tell.
    Unknown,
}

// ============================================================================
// Requests
// ============================================================================

/// Requests sent from the dispatcher to a VM agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum AgentRequest {
    /// Liveness check.
    Ping,

    /// Query the current power state.
    PowerState,

    /// Query the guest tools version.
    GuestAgentVersion,

    /// Start a snapshot job.
    Submit {
        /// Job id chosen by the host.
        job_id: JobId,
        /// What to do.
        command: AgentCommand,
    },

    /// Poll a job.
    Status {
        /// Job to poll.
        job_id: JobId,
    },

    /// Ask the agent to abandon a job.
    Abort {
        /// Job to abort.
        job_id: JobId,
    },
}

/// Snapshot-related commands executed by a live VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentCommand {
    /// Capture disk and memory state under `guid`.
    CreateSnapshot {
        /// Snapshot guid.
        guid: String,
        /// Snapshot name.
        name: String,
        /// Snapshot description.
        description: String,
    },

    /// Remove the state captured under `guid`.
    DeleteState {
        /// Snapshot guid.
        guid: String,
        /// Fold deltas into the parent instead of discarding them.
        merge: bool,
    },

    /// Switch the VM to the state captured under `guid`.
    SwitchToState {
        /// Snapshot guid.
        guid: String,
        /// Leave the VM stopped after the switch.
        skip_resume: bool,
    },

    /// Finish disk operations interrupted by a crash.
    CommitUnfinished,

    /// Power the VM off.
    Stop,
}

impl AgentCommand {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            AgentCommand::CreateSnapshot { .. } => "create_snapshot",
            AgentCommand::DeleteState { .. } => "delete_state",
            AgentCommand::SwitchToState { .. } => "switch_to_state",
            AgentCommand::CommitUnfinished => "commit_unfinished",
            AgentCommand::Stop => "stop",
        }
    }
}

// ============================================================================
// Responses
// ============================================================================

/// Responses sent from a VM agent to the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AgentResponse {
    /// Reply to ping.
    Pong {
        /// Protocol version spoken by the agent.
        version: u32,
    },

    /// Reply to a power-state query.
    PowerState {
        /// Reported state.
        state: PowerState,
    },

    /// Reply to a guest tools query.
    GuestAgentVersion {
        /// Installed tools version, if tools are running.
        version: Option<String>,
    },

    /// Job accepted or still running.
    Pending {
        /// Job id.
        job_id: JobId,
        /// Percent complete (0-100).
        progress: u32,
    },

    /// Job finished successfully.
    Completed {
        /// Job id.
        job_id: JobId,
        /// Screenshot captured by the job, base64-encoded PNG.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        screenshot: Option<String>,
    },

    /// Job finished with an error.
    Failed {
        /// Job id.
        job_id: JobId,
        /// Error message from the agent.
        message: String,
    },

    /// Request-level error.
    Error {
        /// Error message.
        message: String,
    },
}

/// Encode a binary blob for transport in a JSON field.
pub fn encode_blob(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// Decode a blob produced by [`encode_blob`].
pub fn decode_blob(data: &str) -> Result<Vec<u8>, DecodeError> {
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(DecodeError::Blob)
}

// ============================================================================
// Wire Format Helpers
// ============================================================================

/// Encode a message to wire format (length-prefixed JSON).
pub fn encode_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(msg)?;
    let len = json.len() as u32;

    let mut buf = Vec::with_capacity(HEADER_LEN + json.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&json);

    Ok(buf)
}

/// Decode the payload length from a frame header.
pub fn decode_header(header: [u8; HEADER_LEN]) -> Result<usize, DecodeError> {
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_SIZE as usize {
        return Err(DecodeError::TooLarge(len));
    }
    Ok(len)
}

/// Decode a message from wire format.
pub fn decode_message<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, DecodeError> {
    if data.len() < HEADER_LEN {
        return Err(DecodeError::TooShort);
    }

    let len = decode_header([data[0], data[1], data[2], data[3]])?;

    if data.len() < HEADER_LEN + len {
        return Err(DecodeError::Incomplete {
            expected: len,
            got: data.len() - HEADER_LEN,
        });
    }

    serde_json::from_slice(&data[HEADER_LEN..HEADER_LEN + len]).map_err(DecodeError::Json)
}

/// Error decoding a wire message.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Data too short to contain length header.
    #[error("data too short for length header")]
    TooShort,
    /// Frame size exceeds maximum.
    #[error("frame too large: {0} bytes")]
    TooLarge(usize),
    /// Incomplete frame.
    #[error("incomplete frame: expected {expected} bytes, got {got}")]
    Incomplete {
        /// Expected length.
        expected: usize,
        /// Actual length.
        got: usize,
    },
    /// JSON parse error.
    #[error("JSON decode error: {0}")]
    Json(serde_json::Error),
    /// Invalid base64 blob.
    #[error("blob decode error: {0}")]
    Blob(base64::DecodeError),
}
