//! Chunking and the sender-side transport state machine.
//!
//! A sender streams chunks `0..total_chunks` strictly in order and never has more
//! than one chunk unacknowledged. Chunk `i + 1` is produced only by the
//! acknowledgement of chunk `i`, so emission cannot be parallelised by construction.

use std::ops::Range;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::TransferError;
use crate::ids::{DeviceId, SessionId};
use crate::protocol::Message;

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: u32 = 256 * 1024; // 256 KiB

/// Largest configurable chunk size; keeps a chunk frame under the wire limit.
pub const MAX_CHUNK_SIZE: u32 = 8 * 1024 * 1024;

/// `ceil(file_size / chunk_size)`. None if `chunk_size` is zero or the count overflows u32.
pub fn total_chunks(file_size: u64, chunk_size: u32) -> Option<u32> {
    if chunk_size == 0 {
        return None;
    }
    let n = file_size.div_ceil(chunk_size as u64);
    u32::try_from(n).ok()
}

/// Byte range of chunk `index` within a file of `file_size` bytes.
pub fn chunk_range(index: u32, file_size: u64, chunk_size: u32) -> Range<usize> {
    let start = (index as u64 * chunk_size as u64).min(file_size);
    let end = (start + chunk_size as u64).min(file_size);
    start as usize..end as usize
}

/// Integer percentage after `done` of `total` chunks. Reaches 100 only when `done == total`.
pub fn progress_percent(done: u32, total: u32) -> u8 {
    if total == 0 || done >= total {
        return 100;
    }
    let (done, total) = (done as u64, total as u64);
    let rounded = (done * 200 + total) / (total * 2);
    rounded.min(99) as u8
}

/// `done / total` as a percentage rounded to the nearest integer. 100 for an empty file.
pub fn round_percent(done: u32, total: u32) -> u8 {
    if total == 0 {
        return 100;
    }
    let (done, total) = (done.min(total) as u64, total as u64);
    ((done * 200 + total) / (total * 2)) as u8
}

/// A file selected by the user for sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingFile {
    pub name: String,
    pub data: Vec<u8>,
}

impl OutgoingFile {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundState {
    Idle,
    Streaming,
    Completed,
    Aborted(TransferError),
}

/// What the sender does after an acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckOutcome {
    /// Upload progress after the acknowledged chunk.
    pub progress: u8,
    /// Next chunk, or `SessionComplete` when the acknowledged chunk was the last.
    pub next: Message,
}

/// Sender side of one accepted session.
#[derive(Debug)]
pub struct OutboundTransfer {
    session_id: SessionId,
    sender_id: DeviceId,
    recipient_id: DeviceId,
    file_name: String,
    data: Vec<u8>,
    file_size: u64,
    chunk_size: u32,
    total_chunks: u32,
    state: OutboundState,
    /// Chunk awaiting acknowledgement and the tick it was sent.
    in_flight: Option<(u32, u64)>,
    progress: u8,
    hasher: Sha256,
}

impl OutboundTransfer {
    /// Build from the relay's acceptance. Fails if the relay's chunk count disagrees with the file.
    pub fn new(
        session_id: SessionId,
        sender_id: DeviceId,
        recipient_id: DeviceId,
        file: OutgoingFile,
        chunk_size: u32,
        total_chunks: u32,
    ) -> Result<Self, TransferError> {
        let file_size = file.size();
        if self::total_chunks(file_size, chunk_size) != Some(total_chunks) {
            warn!(%session_id, file_size, chunk_size, total_chunks, "session parameters do not match file");
            return Err(TransferError::ProtocolViolation);
        }
        Ok(Self {
            session_id,
            sender_id,
            recipient_id,
            file_name: file.name,
            data: file.data,
            file_size,
            chunk_size,
            total_chunks,
            state: OutboundState::Idle,
            in_flight: None,
            progress: 0,
            hasher: Sha256::new(),
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn recipient_id(&self) -> DeviceId {
        self.recipient_id
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    pub fn state(&self) -> OutboundState {
        self.state
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn in_flight(&self) -> Option<u32> {
        self.in_flight.map(|(i, _)| i)
    }

    /// Idle -> Streaming. Returns `SessionStart` followed by chunk 0, or by
    /// `SessionComplete` when the file is empty.
    pub fn start(&mut self, now_tick: u64) -> Result<Vec<Message>, TransferError> {
        if self.state != OutboundState::Idle {
            return Err(TransferError::ProtocolViolation);
        }
        let mut out = vec![Message::SessionStart {
            session_id: self.session_id,
            sender_id: self.sender_id,
            file_name: self.file_name.clone(),
            file_size: self.file_size,
            chunk_size: self.chunk_size,
            total_chunks: self.total_chunks,
        }];
        if self.total_chunks == 0 {
            out.push(self.finish());
        } else {
            self.state = OutboundState::Streaming;
            out.push(self.emit(0, now_tick));
        }
        debug!(session_id = %self.session_id, total_chunks = self.total_chunks, "streaming started");
        Ok(out)
    }

    /// Relay acknowledged delivery of `index`. Only the chunk in flight may be acknowledged.
    pub fn on_ack(&mut self, index: u32, now_tick: u64) -> Result<AckOutcome, TransferError> {
        match (self.state, self.in_flight) {
            (OutboundState::Streaming, Some((pending, _))) if pending == index => {}
            _ => {
                warn!(session_id = %self.session_id, index, in_flight = ?self.in_flight(), "unexpected chunk ack");
                return Err(TransferError::ProtocolViolation);
            }
        }
        self.in_flight = None;
        let range = chunk_range(index, self.file_size, self.chunk_size);
        self.hasher.update(&self.data[range]);
        let done = index + 1;
        let next = if done == self.total_chunks {
            self.finish()
        } else {
            self.progress = progress_percent(done, self.total_chunks);
            self.emit(done, now_tick)
        };
        Ok(AckOutcome {
            progress: self.progress,
            next,
        })
    }

    /// Abort if the chunk in flight has waited longer than `ack_timeout_ticks`.
    pub fn check_timeout(&mut self, now_tick: u64, ack_timeout_ticks: u64) -> Option<TransferError> {
        let (index, sent_at) = self.in_flight?;
        if now_tick.saturating_sub(sent_at) <= ack_timeout_ticks {
            return None;
        }
        warn!(session_id = %self.session_id, index, "chunk ack timed out");
        self.abort(TransferError::SessionTimeout);
        Some(TransferError::SessionTimeout)
    }

    /// Streaming -> Aborted. No completion signal is ever sent after this.
    pub fn abort(&mut self, error: TransferError) {
        if matches!(self.state, OutboundState::Completed | OutboundState::Aborted(_)) {
            return;
        }
        debug!(session_id = %self.session_id, %error, "outbound transfer aborted");
        self.state = OutboundState::Aborted(error);
        self.in_flight = None;
        self.data = Vec::new();
    }

    fn emit(&mut self, index: u32, now_tick: u64) -> Message {
        self.in_flight = Some((index, now_tick));
        let range = chunk_range(index, self.file_size, self.chunk_size);
        Message::Chunk {
            session_id: self.session_id,
            index,
            total_chunks: self.total_chunks,
            payload: self.data[range].to_vec(),
        }
    }

    fn finish(&mut self) -> Message {
        self.state = OutboundState::Completed;
        self.progress = 100;
        self.in_flight = None;
        self.data = Vec::new();
        let digest = std::mem::take(&mut self.hasher).finalize().into();
        Message::SessionComplete {
            session_id: self.session_id,
            digest,
        }
    }
}
