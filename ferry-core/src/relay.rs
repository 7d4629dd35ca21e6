//! Host-driven relay: RelayCore receives connection events and messages, returns actions.
//!
//! Owns the device registry, pending proposals and live sessions. Forwards session
//! traffic between the two parties without inspecting payloads.

use tracing::{debug, info, warn};

use crate::chunk::{self, MAX_CHUNK_SIZE};
use crate::config::Config;
use crate::error::TransferError;
use crate::handshake::{Handshake, TransferRequest};
use crate::ids::{DeviceId, SessionId};
use crate::protocol::{Message, PROTOCOL_VERSION};
use crate::registry::DeviceRegistry;
use crate::session::{SessionState, SessionTable, TransferSession};

/// Display names longer than this (in chars) are truncated.
pub const MAX_DISPLAY_NAME_LEN: usize = 64;

/// Action for the host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundAction {
    /// Write `Message` to the device's connection.
    Send(DeviceId, Message),
    /// Write a chunk to `to`; once it is written, report it with
    /// `RelayCore::on_chunk_delivered(session_id, index)`.
    Relay {
        to: DeviceId,
        message: Message,
        session_id: SessionId,
        index: u32,
    },
}

/// Main relay coordinator. One per process.
pub struct RelayCore {
    config: Config,
    registry: DeviceRegistry,
    handshake: Handshake,
    sessions: SessionTable,
    tick_count: u64,
}

impl RelayCore {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            registry: DeviceRegistry::new(),
            handshake: Handshake::new(),
            sessions: SessionTable::new(),
            tick_count: 0,
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    /// A connection opened: allocate its device id, register it, greet it and broadcast.
    pub fn on_connected(&mut self) -> (DeviceId, Vec<OutboundAction>) {
        let device_id = DeviceId::generate();
        self.registry.register(device_id);
        info!(device = %device_id, devices = self.registry.len(), "device connected");
        let mut actions = vec![OutboundAction::Send(
            device_id,
            Message::Welcome {
                protocol_version: PROTOCOL_VERSION,
                device_id,
            },
        )];
        actions.extend(self.broadcast_roster());
        (device_id, actions)
    }

    /// A connection closed: unregister and fail everything that referenced the device.
    pub fn on_disconnected(&mut self, device: DeviceId) -> Vec<OutboundAction> {
        if self.registry.unregister(device).is_none() {
            return vec![];
        }
        info!(device = %device, devices = self.registry.len(), "device disconnected");
        let mut actions = Vec::new();
        for req in self.handshake.drop_device(device) {
            if req.sender_id == device {
                actions.push(OutboundAction::Send(
                    req.recipient_id,
                    Message::ProposalWithdrawn {
                        sender_id: req.sender_id,
                    },
                ));
            } else {
                actions.push(OutboundAction::Send(
                    req.sender_id,
                    Message::ProposalFailed {
                        recipient_id: device,
                        error: TransferError::RecipientUnreachable,
                    },
                ));
            }
        }
        for session in self.sessions.remove_involving(device) {
            if let Some(peer) = session.peer_of(device) {
                debug!(session_id = %session.session_id, "session lost a party");
                actions.push(OutboundAction::Send(
                    peer,
                    Message::SessionAborted {
                        session_id: session.session_id,
                        error: TransferError::ConnectionLost,
                    },
                ));
            }
        }
        actions.extend(self.broadcast_roster());
        actions
    }

    /// Process one message from `from`.
    pub fn on_message_received(&mut self, from: DeviceId, msg: Message) -> Vec<OutboundAction> {
        if !self.registry.contains(&from) {
            warn!(device = %from, "message from unregistered device dropped");
            return vec![];
        }
        match msg {
            Message::RegisterDevice { name } => {
                let name: String = name.trim().chars().take(MAX_DISPLAY_NAME_LEN).collect();
                self.registry.rename(from, &name);
                self.broadcast_roster()
            }
            Message::ProposeTransfer {
                recipient_id,
                file_name,
                file_size,
                chunk_size,
            } => self.on_propose(from, recipient_id, file_name, file_size, chunk_size),
            Message::AcceptTransfer { sender_id } => self.on_accept(sender_id, from),
            Message::RejectTransfer { sender_id } => match self.handshake.reject(sender_id, from) {
                Ok(_) => vec![OutboundAction::Send(
                    sender_id,
                    Message::TransferRejected {
                        recipient_id: from,
                        timed_out: false,
                    },
                )],
                Err(error) => vec![OutboundAction::Send(
                    from,
                    Message::ResponseFailed { sender_id, error },
                )],
            },
            Message::CancelSession { session_id } => self.on_cancel(from, session_id),
            msg @ (Message::SessionStart { .. }
            | Message::Chunk { .. }
            | Message::SessionComplete { .. }) => self.forward(from, msg),
            other => {
                warn!(device = %from, msg = ?std::mem::discriminant(&other), "relay-only message from client ignored");
                vec![]
            }
        }
    }

    /// Periodic tick: expire unanswered proposals and idle sessions.
    pub fn tick(&mut self) -> Vec<OutboundAction> {
        self.tick_count = self.tick_count.saturating_add(1);
        let mut actions = Vec::new();
        for req in self
            .handshake
            .expire(self.tick_count, self.config.proposal_timeout_ticks)
        {
            actions.push(OutboundAction::Send(
                req.sender_id,
                Message::TransferRejected {
                    recipient_id: req.recipient_id,
                    timed_out: true,
                },
            ));
            actions.push(OutboundAction::Send(
                req.recipient_id,
                Message::ProposalWithdrawn {
                    sender_id: req.sender_id,
                },
            ));
        }
        for session in self
            .sessions
            .remove_idle(self.tick_count, self.config.session_idle_timeout_ticks)
        {
            warn!(session_id = %session.session_id, "session idle, aborting");
            actions.extend(self.abort_both(&session, TransferError::SessionTimeout));
        }
        actions
    }

    fn on_propose(
        &mut self,
        from: DeviceId,
        recipient_id: DeviceId,
        file_name: String,
        file_size: u64,
        chunk_size: u32,
    ) -> Vec<OutboundAction> {
        let fail = |error| {
            vec![OutboundAction::Send(
                from,
                Message::ProposalFailed {
                    recipient_id,
                    error,
                },
            )]
        };
        if chunk_size > MAX_CHUNK_SIZE || chunk::total_chunks(file_size, chunk_size).is_none() {
            return fail(TransferError::ProtocolViolation);
        }
        let request = TransferRequest {
            sender_id: from,
            recipient_id,
            file_name,
            file_size,
            chunk_size,
            requested_at: self.tick_count,
        };
        let incoming = match self.handshake.propose(request, &self.registry) {
            Ok(req) => Message::IncomingTransfer {
                sender_id: from,
                sender_name: self
                    .registry
                    .display_name(&from)
                    .unwrap_or_default()
                    .to_string(),
                file_name: req.file_name.clone(),
                file_size: req.file_size,
            },
            Err(error) => {
                debug!(sender = %from, recipient = %recipient_id, %error, "proposal refused");
                return fail(error);
            }
        };
        vec![OutboundAction::Send(recipient_id, incoming)]
    }

    fn on_accept(&mut self, sender_id: DeviceId, recipient_id: DeviceId) -> Vec<OutboundAction> {
        let request = match self.handshake.accept(sender_id, recipient_id) {
            Ok(r) => r,
            Err(error) => {
                return vec![OutboundAction::Send(
                    recipient_id,
                    Message::ResponseFailed { sender_id, error },
                )]
            }
        };
        let session = match self.sessions.create(request, self.tick_count) {
            Ok(s) => s,
            Err(error) => {
                return vec![OutboundAction::Send(
                    recipient_id,
                    Message::ResponseFailed { sender_id, error },
                )]
            }
        };
        vec![OutboundAction::Send(
            sender_id,
            Message::TransferAccepted {
                session_id: session.session_id,
                recipient_id,
                chunk_size: session.chunk_size,
                total_chunks: session.total_chunks,
            },
        )]
    }

    fn on_cancel(&mut self, from: DeviceId, session_id: SessionId) -> Vec<OutboundAction> {
        let involved = self
            .sessions
            .get(&session_id)
            .is_some_and(|s| s.involves(from));
        if !involved {
            return vec![];
        }
        let Some(session) = self.sessions.remove(&session_id) else {
            return vec![];
        };
        debug!(%session_id, by = %from, "session cancelled");
        session
            .peer_of(from)
            .map(|peer| {
                OutboundAction::Send(
                    peer,
                    Message::SessionAborted {
                        session_id,
                        error: TransferError::Cancelled,
                    },
                )
            })
            .into_iter()
            .collect()
    }

    /// Forward session traffic from the sender to the recipient.
    fn forward(&mut self, from: DeviceId, msg: Message) -> Vec<OutboundAction> {
        let Some(session_id) = msg.forwarded_session() else {
            return vec![];
        };
        let abort_sender = |error| {
            vec![OutboundAction::Send(
                from,
                Message::SessionAborted { session_id, error },
            )]
        };
        let Some(session) = self.sessions.get(&session_id) else {
            return abort_sender(TransferError::ProtocolViolation);
        };
        if session.sender_id != from {
            return abort_sender(TransferError::ProtocolViolation);
        }
        let TransferSession {
            recipient_id: recipient,
            state,
            file_size: expected_size,
            chunk_size: expected_chunk_size,
            total_chunks: expected_total,
            next_index,
            in_flight,
            ..
        } = *session;
        if !self.registry.contains(&recipient) {
            self.sessions.remove(&session_id);
            return abort_sender(TransferError::RecipientUnreachable);
        }

        match msg {
            Message::SessionStart {
                sender_id,
                file_size,
                chunk_size,
                total_chunks,
                ..
            } => {
                let matches = state == SessionState::Accepted
                    && sender_id == from
                    && expected_size == file_size
                    && expected_chunk_size == chunk_size
                    && expected_total == total_chunks;
                if !matches {
                    return self.abort_by_id(&session_id, TransferError::ProtocolViolation);
                }
                if let Some(s) = self.sessions.get_mut(&session_id) {
                    s.state = SessionState::Streaming;
                    s.last_activity = self.tick_count;
                }
                vec![OutboundAction::Send(recipient, msg)]
            }
            Message::Chunk {
                index,
                total_chunks,
                ref payload,
                ..
            } => {
                // One chunk in flight, strictly in order.
                let in_order = state == SessionState::Streaming
                    && in_flight.is_none()
                    && index == next_index
                    && index < expected_total
                    && total_chunks == expected_total
                    && payload.len() <= expected_chunk_size as usize;
                if !in_order {
                    warn!(%session_id, index, next_index, "out-of-order chunk");
                    return self.abort_by_id(&session_id, TransferError::ProtocolViolation);
                }
                if let Some(s) = self.sessions.get_mut(&session_id) {
                    s.in_flight = Some(index);
                    s.next_index = index + 1;
                    s.chunks_relayed = s.chunks_relayed.saturating_add(1);
                    s.last_activity = self.tick_count;
                }
                vec![OutboundAction::Relay {
                    to: recipient,
                    message: msg,
                    session_id,
                    index,
                }]
            }
            Message::SessionComplete { .. } => {
                let done = state == SessionState::Streaming
                    && in_flight.is_none()
                    && next_index == expected_total;
                if !done {
                    warn!(%session_id, next_index, expected_total, "early completion");
                    return self.abort_by_id(&session_id, TransferError::ProtocolViolation);
                }
                if let Some(s) = self.sessions.remove(&session_id) {
                    info!(%session_id, chunks = s.chunks_relayed, "session complete");
                }
                vec![OutboundAction::Send(recipient, msg)]
            }
            _ => vec![],
        }
    }

    /// The host wrote chunk `index` to the recipient: release the sender's next chunk.
    /// Stale reports for sessions gone or chunks not in flight are ignored.
    pub fn on_chunk_delivered(&mut self, session_id: SessionId, index: u32) -> Vec<OutboundAction> {
        let Some(s) = self.sessions.get_mut(&session_id) else {
            return vec![];
        };
        if s.in_flight != Some(index) {
            debug!(%session_id, index, "stale delivery report");
            return vec![];
        }
        s.in_flight = None;
        s.last_activity = self.tick_count;
        vec![OutboundAction::Send(
            s.sender_id,
            Message::ChunkAck { session_id, index },
        )]
    }

    fn abort_by_id(&mut self, session_id: &SessionId, error: TransferError) -> Vec<OutboundAction> {
        match self.sessions.remove(session_id) {
            Some(session) => self.abort_both(&session, error),
            None => vec![],
        }
    }

    fn abort_both(&self, session: &TransferSession, error: TransferError) -> Vec<OutboundAction> {
        [session.sender_id, session.recipient_id]
            .into_iter()
            .filter(|d| self.registry.contains(d))
            .map(|d| {
                OutboundAction::Send(
                    d,
                    Message::SessionAborted {
                        session_id: session.session_id,
                        error,
                    },
                )
            })
            .collect()
    }

    fn broadcast_roster(&self) -> Vec<OutboundAction> {
        let devices = self.registry.roster();
        self.registry
            .ids()
            .map(|id| {
                OutboundAction::Send(
                    id,
                    Message::DeviceList {
                        devices: devices.clone(),
                    },
                )
            })
            .collect()
    }
}

impl Default for RelayCore {
    fn default() -> Self {
        Self::new(Config::default())
    }
}
