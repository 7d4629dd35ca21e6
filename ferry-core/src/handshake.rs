//! Transfer handshake: consent negotiation before any bytes move.
//!
//! `Idle -> Proposed -> {Accepted | Rejected | TimedOut}`. Only `Proposed` requests
//! are stored; every resolution removes the request, returning the pair to `Idle`.

use std::collections::HashMap;

use tracing::debug;

use crate::error::TransferError;
use crate::ids::DeviceId;
use crate::registry::DeviceRegistry;

/// A proposal from `sender_id` to `recipient_id`, alive until answered or expired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub sender_id: DeviceId,
    pub recipient_id: DeviceId,
    pub file_name: String,
    pub file_size: u64,
    pub chunk_size: u32,
    /// Tick at which the proposal was made.
    pub requested_at: u64,
}

/// Pending proposals keyed by ordered (sender, recipient) pair.
#[derive(Debug, Default)]
pub struct Handshake {
    pending: HashMap<(DeviceId, DeviceId), TransferRequest>,
}

impl Handshake {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idle -> Proposed. The recipient must be registered (and not the sender itself),
    /// and the pair must have no proposal outstanding.
    pub fn propose(
        &mut self,
        request: TransferRequest,
        registry: &DeviceRegistry,
    ) -> Result<&TransferRequest, TransferError> {
        if request.recipient_id == request.sender_id || !registry.contains(&request.recipient_id) {
            return Err(TransferError::UnknownRecipient);
        }
        let key = (request.sender_id, request.recipient_id);
        if self.pending.contains_key(&key) {
            return Err(TransferError::ConflictingRequest);
        }
        debug!(
            sender = %request.sender_id,
            recipient = %request.recipient_id,
            file = %request.file_name,
            size = request.file_size,
            "transfer proposed"
        );
        Ok(self.pending.entry(key).or_insert(request))
    }

    /// Proposed -> Accepted.
    pub fn accept(
        &mut self,
        sender_id: DeviceId,
        recipient_id: DeviceId,
    ) -> Result<TransferRequest, TransferError> {
        self.resolve(sender_id, recipient_id, "accepted")
    }

    /// Proposed -> Rejected.
    pub fn reject(
        &mut self,
        sender_id: DeviceId,
        recipient_id: DeviceId,
    ) -> Result<TransferRequest, TransferError> {
        self.resolve(sender_id, recipient_id, "rejected")
    }

    /// Proposed -> TimedOut for every request older than `timeout_ticks`, oldest first.
    pub fn expire(&mut self, now_tick: u64, timeout_ticks: u64) -> Vec<TransferRequest> {
        let overdue: Vec<(DeviceId, DeviceId)> = self
            .pending
            .iter()
            .filter(|(_, r)| now_tick.saturating_sub(r.requested_at) > timeout_ticks)
            .map(|(k, _)| *k)
            .collect();
        let mut out: Vec<TransferRequest> = overdue
            .into_iter()
            .filter_map(|k| self.pending.remove(&k))
            .collect();
        out.sort_by_key(|r| r.requested_at);
        for r in &out {
            debug!(sender = %r.sender_id, recipient = %r.recipient_id, "proposal timed out");
        }
        out
    }

    /// Remove every request naming `device` as sender or recipient.
    pub fn drop_device(&mut self, device: DeviceId) -> Vec<TransferRequest> {
        let keys: Vec<(DeviceId, DeviceId)> = self
            .pending
            .keys()
            .filter(|(s, r)| *s == device || *r == device)
            .copied()
            .collect();
        keys.into_iter()
            .filter_map(|k| self.pending.remove(&k))
            .collect()
    }

    pub fn is_pending(&self, sender_id: DeviceId, recipient_id: DeviceId) -> bool {
        self.pending.contains_key(&(sender_id, recipient_id))
    }

    /// Pending proposals addressed to `recipient_id`.
    pub fn incoming(&self, recipient_id: DeviceId) -> Vec<&TransferRequest> {
        self.pending
            .values()
            .filter(|r| r.recipient_id == recipient_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn resolve(
        &mut self,
        sender_id: DeviceId,
        recipient_id: DeviceId,
        outcome: &str,
    ) -> Result<TransferRequest, TransferError> {
        let request = self
            .pending
            .remove(&(sender_id, recipient_id))
            .ok_or(TransferError::NoPendingRequest)?;
        debug!(sender = %sender_id, recipient = %recipient_id, outcome, "proposal resolved");
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (DeviceRegistry, DeviceId, DeviceId) {
        let mut reg = DeviceRegistry::new();
        let a = DeviceId::generate();
        let b = DeviceId::generate();
        reg.register(a);
        reg.register(b);
        (reg, a, b)
    }

    fn request(sender: DeviceId, recipient: DeviceId, at: u64) -> TransferRequest {
        TransferRequest {
            sender_id: sender,
            recipient_id: recipient,
            file_name: "photo.jpg".into(),
            file_size: 600_000,
            chunk_size: 262_144,
            requested_at: at,
        }
    }

    #[test]
    fn second_proposal_conflicts_until_resolved() {
        let (reg, a, b) = setup();
        let mut hs = Handshake::new();
        assert!(hs.propose(request(a, b, 0), &reg).is_ok());
        assert_eq!(
            hs.propose(request(a, b, 1), &reg).unwrap_err(),
            TransferError::ConflictingRequest
        );
        hs.reject(a, b).unwrap();
        assert!(hs.propose(request(a, b, 2), &reg).is_ok());
        hs.accept(a, b).unwrap();
        assert!(hs.propose(request(a, b, 3), &reg).is_ok());
    }

    #[test]
    fn unknown_recipient_creates_nothing() {
        let (reg, a, _) = setup();
        let mut hs = Handshake::new();
        let ghost = DeviceId::generate();
        assert_eq!(
            hs.propose(request(a, ghost, 0), &reg).unwrap_err(),
            TransferError::UnknownRecipient
        );
        assert_eq!(
            hs.propose(request(a, a, 0), &reg).unwrap_err(),
            TransferError::UnknownRecipient
        );
        assert!(hs.is_empty());
    }

    #[test]
    fn recipient_may_hold_many_senders() {
        let (mut reg, a, b) = setup();
        let c = DeviceId::generate();
        reg.register(c);
        let mut hs = Handshake::new();
        hs.propose(request(a, b, 0), &reg).unwrap();
        hs.propose(request(c, b, 0), &reg).unwrap();
        // Reverse direction is a different ordered pair.
        hs.propose(request(b, a, 0), &reg).unwrap();
        assert_eq!(hs.incoming(b).len(), 2);
        assert_eq!(hs.len(), 3);
    }

    #[test]
    fn answer_without_proposal_fails() {
        let (_, a, b) = setup();
        let mut hs = Handshake::new();
        assert_eq!(hs.accept(a, b), Err(TransferError::NoPendingRequest));
        assert_eq!(hs.reject(a, b), Err(TransferError::NoPendingRequest));
    }

    #[test]
    fn expiry_then_new_proposal_succeeds() {
        let (reg, a, b) = setup();
        let mut hs = Handshake::new();
        hs.propose(request(a, b, 10), &reg).unwrap();
        assert!(hs.expire(20, 10).is_empty());
        let expired = hs.expire(21, 10);
        assert_eq!(expired.len(), 1);
        assert!(!hs.is_pending(a, b));
        assert!(hs.propose(request(a, b, 22), &reg).is_ok());
    }

    #[test]
    fn drop_device_clears_both_directions() {
        let (reg, a, b) = setup();
        let mut hs = Handshake::new();
        hs.propose(request(a, b, 0), &reg).unwrap();
        hs.propose(request(b, a, 0), &reg).unwrap();
        assert_eq!(hs.drop_device(b).len(), 2);
        assert!(hs.is_empty());
    }
}
