//! Protocol tunables shared by relay and client hosts. One tick is one second.

use crate::chunk::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};

/// Default ticks a proposal may stay unanswered before it is treated as rejected.
pub const DEFAULT_PROPOSAL_TIMEOUT_TICKS: u64 = 60;

/// Default ticks a relay session may go without traffic before it is aborted.
pub const DEFAULT_SESSION_IDLE_TIMEOUT_TICKS: u64 = 30;

/// Default ticks a sender waits for a chunk acknowledgement.
pub const DEFAULT_ACK_TIMEOUT_TICKS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Bytes per chunk for transfers this device sends.
    pub chunk_size: u32,
    pub proposal_timeout_ticks: u64,
    pub session_idle_timeout_ticks: u64,
    pub ack_timeout_ticks: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            proposal_timeout_ticks: DEFAULT_PROPOSAL_TIMEOUT_TICKS,
            session_idle_timeout_ticks: DEFAULT_SESSION_IDLE_TIMEOUT_TICKS,
            ack_timeout_ticks: DEFAULT_ACK_TIMEOUT_TICKS,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::ChunkSize(self.chunk_size));
        }
        if self.proposal_timeout_ticks == 0 {
            return Err(ConfigError::ZeroTimeout("proposal_timeout"));
        }
        if self.session_idle_timeout_ticks == 0 {
            return Err(ConfigError::ZeroTimeout("session_idle_timeout"));
        }
        if self.ack_timeout_ticks == 0 {
            return Err(ConfigError::ZeroTimeout("ack_timeout"));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("chunk size {0} out of range (1 byte to 8 MiB)")]
    ChunkSize(u32),
    #[error("{0} must be at least one second")]
    ZeroTimeout(&'static str),
}
