//! Ferry wire protocol: message types and version.

use serde::{Deserialize, Serialize};

use crate::error::TransferError;
use crate::ids::{DeviceId, SessionId};

/// Current protocol version. Sent in `Welcome`.
pub const PROTOCOL_VERSION: u8 = 1;

/// One roster entry as broadcast in `DeviceList`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: DeviceId,
    /// Empty until the device registers a name.
    pub name: String,
}

/// All wire message types. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    // relay -> client
    /// First frame on every connection: the id the relay allocated for it.
    Welcome {
        protocol_version: u8,
        device_id: DeviceId,
    },
    /// Full roster, broadcast on every registry change.
    DeviceList { devices: Vec<DeviceInfo> },
    /// A proposal delivered to its recipient. `sender_name` is resolved at delivery.
    IncomingTransfer {
        sender_id: DeviceId,
        sender_name: String,
        file_name: String,
        file_size: u64,
    },
    /// Recipient accepted; sender may start streaming `session_id`.
    TransferAccepted {
        session_id: SessionId,
        recipient_id: DeviceId,
        chunk_size: u32,
        total_chunks: u32,
    },
    /// Recipient rejected, or the proposal expired unanswered.
    TransferRejected {
        recipient_id: DeviceId,
        timed_out: bool,
    },
    /// The proposal never reached the recipient, or the recipient left while it was pending.
    ProposalFailed {
        recipient_id: DeviceId,
        error: TransferError,
    },
    /// A proposal shown to this recipient is no longer answerable.
    ProposalWithdrawn { sender_id: DeviceId },
    /// An accept/reject from this recipient could not be applied.
    ResponseFailed {
        sender_id: DeviceId,
        error: TransferError,
    },
    /// Chunk `index` was delivered to the recipient's connection.
    ChunkAck { session_id: SessionId, index: u32 },
    /// Session ended without completing.
    SessionAborted {
        session_id: SessionId,
        error: TransferError,
    },

    // client -> relay
    /// Set (or change) this connection's display name.
    RegisterDevice { name: String },
    ProposeTransfer {
        recipient_id: DeviceId,
        file_name: String,
        file_size: u64,
        chunk_size: u32,
    },
    AcceptTransfer { sender_id: DeviceId },
    RejectTransfer { sender_id: DeviceId },
    /// Either party ends a session early.
    CancelSession { session_id: SessionId },

    // sender -> relay -> recipient
    SessionStart {
        session_id: SessionId,
        sender_id: DeviceId,
        file_name: String,
        file_size: u64,
        chunk_size: u32,
        total_chunks: u32,
    },
    Chunk {
        session_id: SessionId,
        index: u32,
        total_chunks: u32,
        payload: Vec<u8>,
    },
    /// Sent after the last chunk is acknowledged. `digest` is SHA-256 of the whole file.
    SessionComplete {
        session_id: SessionId,
        digest: [u8; 32],
    },
}

impl Message {
    /// Session this message belongs to, for messages the relay forwards between session parties.
    pub fn forwarded_session(&self) -> Option<SessionId> {
        match self {
            Message::SessionStart { session_id, .. }
            | Message::Chunk { session_id, .. }
            | Message::SessionComplete { session_id, .. } => Some(*session_id),
            _ => None,
        }
    }
}
