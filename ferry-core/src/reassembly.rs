//! Recipient-side reassembly: collect indexed chunks, finalize into an artifact.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::chunk::{self, round_percent};
use crate::error::TransferError;
use crate::ids::{DeviceId, SessionId};

/// A completed, verified file ready for the materialization layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub session_id: SessionId,
    pub sender_id: DeviceId,
    pub file_name: String,
    pub data: Vec<u8>,
}

/// Turns a finished artifact into something stored or downloadable (a file on disk, a blob URL).
pub trait ArtifactSink {
    type Output;
    type Error;

    fn materialize(&mut self, artifact: Artifact) -> Result<Self::Output, Self::Error>;
}

/// Per-session inbound state. Owned by exactly one session on the recipient.
#[derive(Debug)]
pub struct ReassemblyBuffer {
    session_id: SessionId,
    sender_id: DeviceId,
    file_name: String,
    file_size: u64,
    chunk_size: u32,
    /// Chunk count derived from `SessionStart`; declared counts must agree with it.
    expected_chunks: Option<u32>,
    /// Learned from the first chunk; 0 until then.
    total_chunks: u32,
    slots: BTreeMap<u32, Vec<u8>>,
    progress: u8,
}

impl ReassemblyBuffer {
    pub fn new(
        session_id: SessionId,
        sender_id: DeviceId,
        file_name: String,
        file_size: u64,
        chunk_size: u32,
    ) -> Self {
        Self {
            session_id,
            sender_id,
            file_name,
            file_size,
            chunk_size,
            expected_chunks: chunk::total_chunks(file_size, chunk_size),
            total_chunks: 0,
            slots: BTreeMap::new(),
            progress: 0,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn sender_id(&self) -> DeviceId {
        self.sender_id
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    pub fn filled_count(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    /// Store `payload` at `index`. A repeated index overwrites the earlier payload.
    /// Returns the download progress after this chunk.
    pub fn insert(
        &mut self,
        index: u32,
        total_chunks: u32,
        payload: Vec<u8>,
    ) -> Result<u8, TransferError> {
        if Some(total_chunks) != self.expected_chunks {
            warn!(session_id = %self.session_id, total_chunks, expected = ?self.expected_chunks, "declared chunk count mismatch");
            return Err(TransferError::ProtocolViolation);
        }
        if index >= total_chunks || payload.len() > self.chunk_size as usize {
            warn!(session_id = %self.session_id, index, len = payload.len(), "chunk out of bounds");
            return Err(TransferError::ProtocolViolation);
        }
        self.total_chunks = total_chunks;
        if self.slots.insert(index, payload).is_some() {
            debug!(session_id = %self.session_id, index, "duplicate chunk overwritten");
        }
        self.progress = round_percent(index + 1, total_chunks);
        Ok(self.progress)
    }

    /// Concatenate all chunks in index order. Fails unless every index `0..total_chunks`
    /// is present and the result matches the declared size and digest.
    pub fn finalize(mut self, digest: &[u8; 32]) -> Result<Artifact, TransferError> {
        let complete = self.expected_chunks == Some(self.total_chunks)
            && self.filled_count() == self.total_chunks
            && self.slots.keys().copied().eq(0..self.total_chunks);
        if !complete {
            warn!(
                session_id = %self.session_id,
                filled = self.filled_count(),
                total = self.total_chunks,
                "completion with missing chunks"
            );
            return Err(TransferError::IncompleteTransfer);
        }
        let mut data = Vec::with_capacity(self.file_size as usize);
        for payload in std::mem::take(&mut self.slots).into_values() {
            data.extend_from_slice(&payload);
        }
        let actual: [u8; 32] = Sha256::digest(&data).into();
        if data.len() as u64 != self.file_size || &actual != digest {
            warn!(session_id = %self.session_id, len = data.len(), "artifact size or digest mismatch");
            return Err(TransferError::IncompleteTransfer);
        }
        Ok(Artifact {
            session_id: self.session_id,
            sender_id: self.sender_id,
            file_name: self.file_name,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{chunk_range, total_chunks};
    use rand::RngCore;

    fn digest(data: &[u8]) -> [u8; 32] {
        Sha256::digest(data).into()
    }

    fn buffer_for(data: &[u8], chunk_size: u32) -> ReassemblyBuffer {
        ReassemblyBuffer::new(
            SessionId::generate(),
            DeviceId::generate(),
            "file.bin".into(),
            data.len() as u64,
            chunk_size,
        )
    }

    fn fill(buf: &mut ReassemblyBuffer, data: &[u8], chunk_size: u32, order: &[u32]) {
        let n = total_chunks(data.len() as u64, chunk_size).unwrap();
        for &i in order {
            let r = chunk_range(i, data.len() as u64, chunk_size);
            buf.insert(i, n, data[r].to_vec()).unwrap();
        }
    }

    fn reassemble(data: &[u8], chunk_size: u32) -> Vec<u8> {
        let n = total_chunks(data.len() as u64, chunk_size).unwrap();
        let mut buf = buffer_for(data, chunk_size);
        let order: Vec<u32> = (0..n).collect();
        fill(&mut buf, data, chunk_size, &order);
        buf.finalize(&digest(data)).unwrap().data
    }

    #[test]
    fn reproduces_original_bytes() {
        let chunk = 64u32;
        let mut rng = rand::thread_rng();
        for len in [0usize, 1, chunk as usize, chunk as usize * 3 + 17] {
            let mut data = vec![0u8; len];
            rng.fill_bytes(&mut data);
            assert_eq!(reassemble(&data, chunk), data, "len {}", len);
        }
    }

    #[test]
    fn storage_order_irrelevant() {
        let data: Vec<u8> = (0..100u32).map(|i| i as u8).collect();
        let mut buf = buffer_for(&data, 30);
        fill(&mut buf, &data, 30, &[3, 1, 0, 2]);
        assert_eq!(buf.finalize(&digest(&data)).unwrap().data, data);
    }

    #[test]
    fn duplicate_index_counts_once() {
        let data = vec![5u8; 60];
        let mut buf = buffer_for(&data, 30);
        fill(&mut buf, &data, 30, &[0, 0, 1]);
        assert_eq!(buf.filled_count(), 2);
        assert!(buf.finalize(&digest(&data)).is_ok());
    }

    #[test]
    fn missing_chunk_is_incomplete() {
        let data = vec![1u8; 100];
        let mut buf = buffer_for(&data, 30);
        fill(&mut buf, &data, 30, &[0, 1, 3]);
        assert_eq!(
            buf.finalize(&digest(&data)),
            Err(TransferError::IncompleteTransfer)
        );
    }

    #[test]
    fn no_chunks_for_nonempty_file_is_incomplete() {
        let data = vec![1u8; 10];
        let buf = buffer_for(&data, 30);
        assert_eq!(
            buf.finalize(&digest(&data)),
            Err(TransferError::IncompleteTransfer)
        );
    }

    #[test]
    fn digest_mismatch_is_incomplete() {
        let data = vec![1u8; 50];
        let mut buf = buffer_for(&data, 30);
        fill(&mut buf, &data, 30, &[0, 1]);
        assert_eq!(
            buf.finalize(&[0u8; 32]),
            Err(TransferError::IncompleteTransfer)
        );
    }

    #[test]
    fn rejects_inconsistent_chunks() {
        let data = vec![0u8; 100];
        let mut buf = buffer_for(&data, 30);
        assert_eq!(
            buf.insert(0, 5, vec![0; 30]),
            Err(TransferError::ProtocolViolation)
        );
        assert_eq!(
            buf.insert(4, 4, vec![0; 10]),
            Err(TransferError::ProtocolViolation)
        );
        assert_eq!(
            buf.insert(0, 4, vec![0; 31]),
            Err(TransferError::ProtocolViolation)
        );
        assert_eq!(buf.total_chunks(), 0);
    }

    #[test]
    fn progress_tracks_index() {
        let data = vec![0u8; 90];
        let mut buf = buffer_for(&data, 30);
        assert_eq!(buf.progress(), 0);
        assert_eq!(buf.insert(0, 3, vec![0; 30]), Ok(33));
        assert_eq!(buf.insert(1, 3, vec![0; 30]), Ok(67));
        assert_eq!(buf.insert(2, 3, vec![0; 30]), Ok(100));
    }

    #[test]
    fn progress_rounds_up_near_the_end() {
        let data = vec![0u8; 200];
        let mut buf = buffer_for(&data, 1);
        assert_eq!(buf.insert(0, 200, vec![0]), Ok(1));
        assert_eq!(buf.insert(198, 200, vec![0]), Ok(100));
        assert_eq!(buf.filled_count(), 2);
    }
}
