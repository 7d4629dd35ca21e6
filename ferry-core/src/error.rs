//! Transfer failure taxonomy. Travels on the wire inside failure messages.

use serde::{Deserialize, Serialize};

/// Every way a registry operation, handshake or session can fail.
/// Each failure is scoped to one operation or one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum TransferError {
    #[error("recipient is not registered")]
    UnknownRecipient,
    #[error("a request to this recipient is already pending")]
    ConflictingRequest,
    #[error("recipient is unreachable")]
    RecipientUnreachable,
    #[error("transfer completed with missing or corrupt chunks")]
    IncompleteTransfer,
    #[error("session timed out")]
    SessionTimeout,
    #[error("connection lost")]
    ConnectionLost,
    #[error("transfer cancelled by peer")]
    Cancelled,
    #[error("no pending request from that device")]
    NoPendingRequest,
    #[error("protocol violation")]
    ProtocolViolation,
}

impl TransferError {
    /// Whether the failure ends an in-progress session (as opposed to rejecting one call).
    pub fn is_session_terminal(self) -> bool {
        matches!(
            self,
            TransferError::RecipientUnreachable
                | TransferError::ConnectionLost
                | TransferError::SessionTimeout
                | TransferError::IncompleteTransfer
                | TransferError::Cancelled
                | TransferError::ProtocolViolation
        )
    }
}
