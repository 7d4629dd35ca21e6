//! Transfer sessions as the relay sees them, keyed by session id.

use std::collections::HashMap;

use tracing::debug;

use crate::chunk;
use crate::error::TransferError;
use crate::handshake::TransferRequest;
use crate::ids::{DeviceId, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created on acceptance; sender has not sent `SessionStart` yet.
    Accepted,
    Streaming,
}

/// An accepted transfer. `chunk_size` and `total_chunks` are fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSession {
    pub session_id: SessionId,
    pub sender_id: DeviceId,
    pub recipient_id: DeviceId,
    pub file_name: String,
    pub file_size: u64,
    pub chunk_size: u32,
    pub total_chunks: u32,
    pub state: SessionState,
    /// Tick of the last message relayed for this session.
    pub last_activity: u64,
    pub chunks_relayed: u32,
    /// Index the next relayed chunk must carry.
    pub next_index: u32,
    /// Chunk written to the recipient's queue but not yet delivered.
    pub in_flight: Option<u32>,
}

impl TransferSession {
    /// The other party of the session, if `device` is one of the two.
    pub fn peer_of(&self, device: DeviceId) -> Option<DeviceId> {
        if device == self.sender_id {
            Some(self.recipient_id)
        } else if device == self.recipient_id {
            Some(self.sender_id)
        } else {
            None
        }
    }

    pub fn involves(&self, device: DeviceId) -> bool {
        self.peer_of(device).is_some()
    }
}

/// Arena of live sessions. Sessions share nothing with each other.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<SessionId, TransferSession>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session from an accepted request. Derives `total_chunks` once.
    pub fn create(
        &mut self,
        request: TransferRequest,
        now_tick: u64,
    ) -> Result<&TransferSession, TransferError> {
        let total_chunks = chunk::total_chunks(request.file_size, request.chunk_size)
            .ok_or(TransferError::ProtocolViolation)?;
        let session_id = SessionId::generate();
        debug!(
            %session_id,
            sender = %request.sender_id,
            recipient = %request.recipient_id,
            total_chunks,
            "session created"
        );
        let session = TransferSession {
            session_id,
            sender_id: request.sender_id,
            recipient_id: request.recipient_id,
            file_name: request.file_name,
            file_size: request.file_size,
            chunk_size: request.chunk_size,
            total_chunks,
            state: SessionState::Accepted,
            last_activity: now_tick,
            chunks_relayed: 0,
            next_index: 0,
            in_flight: None,
        };
        Ok(self.sessions.entry(session_id).or_insert(session))
    }

    pub fn get(&self, id: &SessionId) -> Option<&TransferSession> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: &SessionId) -> Option<&mut TransferSession> {
        self.sessions.get_mut(id)
    }

    pub fn remove(&mut self, id: &SessionId) -> Option<TransferSession> {
        self.sessions.remove(id)
    }

    /// Remove every session with `device` as sender or recipient.
    pub fn remove_involving(&mut self, device: DeviceId) -> Vec<TransferSession> {
        let ids: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.involves(device))
            .map(|s| s.session_id)
            .collect();
        ids.iter().filter_map(|id| self.sessions.remove(id)).collect()
    }

    /// Remove sessions with no traffic for more than `timeout_ticks`.
    pub fn remove_idle(&mut self, now_tick: u64, timeout_ticks: u64) -> Vec<TransferSession> {
        let ids: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| now_tick.saturating_sub(s.last_activity) > timeout_ticks)
            .map(|s| s.session_id)
            .collect();
        ids.iter().filter_map(|id| self.sessions.remove(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
