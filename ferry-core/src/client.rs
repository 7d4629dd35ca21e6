//! Host-driven device client: ClientCore receives relay messages and user intents, returns actions.
//!
//! One device holds at most one outbound transfer (proposed or streaming) and any
//! number of inbound reassembly buffers, each keyed by its session id.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::chunk::{OutboundState, OutboundTransfer, OutgoingFile};
use crate::config::Config;
use crate::error::TransferError;
use crate::ids::{DeviceId, SessionId};
use crate::protocol::{Message, PROTOCOL_VERSION};
use crate::reassembly::{Artifact, ReassemblyBuffer};
use crate::registry::Device;

/// Shown for senders that never registered a name.
pub const UNNAMED_DEVICE: &str = "Unnamed Device";

/// Notification for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected {
        device_id: DeviceId,
    },
    /// Current roster, excluding this device.
    DevicesChanged(Vec<Device>),
    IncomingRequest {
        sender_id: DeviceId,
        sender_name: String,
        file_name: String,
        file_size: u64,
    },
    RequestWithdrawn {
        sender_id: DeviceId,
    },
    ProposalAccepted {
        session_id: SessionId,
        recipient_id: DeviceId,
    },
    ProposalRejected {
        recipient_id: DeviceId,
        timed_out: bool,
    },
    ProposalFailed {
        recipient_id: DeviceId,
        error: TransferError,
    },
    ResponseFailed {
        sender_id: DeviceId,
        error: TransferError,
    },
    UploadProgress {
        session_id: SessionId,
        percent: u8,
    },
    UploadComplete {
        session_id: SessionId,
    },
    DownloadStarted {
        session_id: SessionId,
        sender_id: DeviceId,
        file_name: String,
        file_size: u64,
    },
    DownloadProgress {
        session_id: SessionId,
        percent: u8,
    },
    /// A verified artifact for the materialization layer.
    ArtifactReady(Artifact),
    TransferFailed {
        session_id: SessionId,
        error: TransferError,
    },
}

/// Action for the host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
    Send(Message),
    Emit(ClientEvent),
}

/// A proposal shown to this device, awaiting the user's answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingRequest {
    pub sender_id: DeviceId,
    pub sender_name: String,
    pub file_name: String,
    pub file_size: u64,
}

/// Our proposal, holding the file until the recipient answers.
#[derive(Debug)]
struct PendingProposal {
    recipient_id: DeviceId,
    file: OutgoingFile,
}

pub struct ClientCore {
    config: Config,
    display_name: String,
    device_id: Option<DeviceId>,
    devices: Vec<Device>,
    proposal: Option<PendingProposal>,
    outbound: Option<OutboundTransfer>,
    incoming: Vec<IncomingRequest>,
    inbound: HashMap<SessionId, ReassemblyBuffer>,
    tick_count: u64,
}

impl ClientCore {
    pub fn new(config: Config, display_name: impl Into<String>) -> Self {
        Self {
            config,
            display_name: display_name.into(),
            device_id: None,
            devices: Vec::new(),
            proposal: None,
            outbound: None,
            incoming: Vec::new(),
            inbound: HashMap::new(),
            tick_count: 0,
        }
    }

    /// Id assigned by the relay, once welcomed.
    pub fn device_id(&self) -> Option<DeviceId> {
        self.device_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Other devices on the relay.
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn incoming_requests(&self) -> &[IncomingRequest] {
        &self.incoming
    }

    /// Upload progress of the outbound transfer, if streaming.
    pub fn upload_progress(&self) -> Option<u8> {
        self.outbound.as_ref().map(|t| t.progress())
    }

    pub fn download_progress(&self, session_id: &SessionId) -> Option<u8> {
        self.inbound.get(session_id).map(|b| b.progress())
    }

    pub fn active_downloads(&self) -> usize {
        self.inbound.len()
    }

    /// Whether a proposal or an outbound stream is in progress.
    pub fn is_sending(&self) -> bool {
        self.proposal.is_some() || self.outbound.is_some()
    }

    /// Change display name; sent now if connected, otherwise on welcome.
    pub fn rename(&mut self, name: impl Into<String>) -> Vec<ClientAction> {
        self.display_name = name.into();
        if self.device_id.is_none() {
            return vec![];
        }
        vec![ClientAction::Send(Message::RegisterDevice {
            name: self.display_name.clone(),
        })]
    }

    /// Propose sending `file` to `recipient_id`. One outbound transfer at a time.
    pub fn propose(
        &mut self,
        recipient_id: DeviceId,
        file: OutgoingFile,
    ) -> Result<Vec<ClientAction>, TransferError> {
        if self.is_sending() {
            return Err(TransferError::ConflictingRequest);
        }
        if !self.devices.iter().any(|d| d.id == recipient_id) {
            return Err(TransferError::UnknownRecipient);
        }
        let msg = Message::ProposeTransfer {
            recipient_id,
            file_name: file.name.clone(),
            file_size: file.size(),
            chunk_size: self.config.chunk_size,
        };
        debug!(recipient = %recipient_id, file = %file.name, size = file.size(), "proposing transfer");
        self.proposal = Some(PendingProposal { recipient_id, file });
        Ok(vec![ClientAction::Send(msg)])
    }

    /// Answer a pending incoming request with consent.
    pub fn accept(&mut self, sender_id: DeviceId) -> Result<Vec<ClientAction>, TransferError> {
        self.take_incoming(sender_id)?;
        Ok(vec![ClientAction::Send(Message::AcceptTransfer { sender_id })])
    }

    pub fn reject(&mut self, sender_id: DeviceId) -> Result<Vec<ClientAction>, TransferError> {
        self.take_incoming(sender_id)?;
        Ok(vec![ClientAction::Send(Message::RejectTransfer { sender_id })])
    }

    /// Cancel a session this device is part of, in either direction.
    pub fn cancel(&mut self, session_id: SessionId) -> Vec<ClientAction> {
        let outbound = self
            .outbound
            .as_ref()
            .is_some_and(|t| t.session_id() == session_id);
        if outbound {
            self.outbound = None;
        } else if self.inbound.remove(&session_id).is_none() {
            return vec![];
        }
        info!(%session_id, "transfer cancelled locally");
        vec![
            ClientAction::Send(Message::CancelSession { session_id }),
            ClientAction::Emit(ClientEvent::TransferFailed {
                session_id,
                error: TransferError::Cancelled,
            }),
        ]
    }

    /// Connection to the relay dropped: every session and request is void.
    pub fn on_disconnected(&mut self) -> Vec<ClientAction> {
        let mut actions = Vec::new();
        if let Some(mut t) = self.outbound.take() {
            t.abort(TransferError::ConnectionLost);
            actions.push(failed(t.session_id(), TransferError::ConnectionLost));
        }
        if let Some(p) = self.proposal.take() {
            actions.push(ClientAction::Emit(ClientEvent::ProposalFailed {
                recipient_id: p.recipient_id,
                error: TransferError::ConnectionLost,
            }));
        }
        let mut dropped: Vec<SessionId> = self.inbound.drain().map(|(id, _)| id).collect();
        dropped.sort();
        for id in dropped {
            actions.push(failed(id, TransferError::ConnectionLost));
        }
        self.incoming.clear();
        self.devices.clear();
        self.device_id = None;
        actions
    }

    /// Periodic tick: abort the outbound stream if its chunk ack is overdue.
    pub fn tick(&mut self) -> Vec<ClientAction> {
        self.tick_count = self.tick_count.saturating_add(1);
        let Some(t) = self.outbound.as_mut() else {
            return vec![];
        };
        match t.check_timeout(self.tick_count, self.config.ack_timeout_ticks) {
            Some(error) => {
                let session_id = t.session_id();
                self.outbound = None;
                vec![
                    ClientAction::Send(Message::CancelSession { session_id }),
                    failed(session_id, error),
                ]
            }
            None => vec![],
        }
    }

    /// Process one message from the relay.
    pub fn on_message_received(&mut self, msg: Message) -> Vec<ClientAction> {
        match msg {
            Message::Welcome {
                protocol_version,
                device_id,
            } => {
                if protocol_version != PROTOCOL_VERSION {
                    warn!(protocol_version, "relay speaks a different protocol version");
                }
                self.device_id = Some(device_id);
                vec![
                    ClientAction::Emit(ClientEvent::Connected { device_id }),
                    ClientAction::Send(Message::RegisterDevice {
                        name: self.display_name.clone(),
                    }),
                ]
            }
            Message::DeviceList { devices } => {
                self.devices = devices
                    .into_iter()
                    .filter(|d| Some(d.id) != self.device_id)
                    .map(|d| Device {
                        id: d.id,
                        display_name: d.name,
                    })
                    .collect();
                vec![ClientAction::Emit(ClientEvent::DevicesChanged(
                    self.devices.clone(),
                ))]
            }
            Message::IncomingTransfer {
                sender_id,
                sender_name,
                file_name,
                file_size,
            } => {
                let sender_name = if sender_name.is_empty() {
                    UNNAMED_DEVICE.to_string()
                } else {
                    sender_name
                };
                let request = IncomingRequest {
                    sender_id,
                    sender_name,
                    file_name,
                    file_size,
                };
                self.incoming.retain(|r| r.sender_id != sender_id);
                self.incoming.push(request.clone());
                vec![ClientAction::Emit(ClientEvent::IncomingRequest {
                    sender_id: request.sender_id,
                    sender_name: request.sender_name,
                    file_name: request.file_name,
                    file_size: request.file_size,
                })]
            }
            Message::ProposalWithdrawn { sender_id } => {
                self.incoming.retain(|r| r.sender_id != sender_id);
                vec![ClientAction::Emit(ClientEvent::RequestWithdrawn { sender_id })]
            }
            Message::TransferAccepted {
                session_id,
                recipient_id,
                chunk_size,
                total_chunks,
            } => self.on_accepted(session_id, recipient_id, chunk_size, total_chunks),
            Message::TransferRejected {
                recipient_id,
                timed_out,
            } => {
                self.clear_proposal(recipient_id);
                vec![ClientAction::Emit(ClientEvent::ProposalRejected {
                    recipient_id,
                    timed_out,
                })]
            }
            Message::ProposalFailed {
                recipient_id,
                error,
            } => {
                self.clear_proposal(recipient_id);
                vec![ClientAction::Emit(ClientEvent::ProposalFailed {
                    recipient_id,
                    error,
                })]
            }
            Message::ResponseFailed { sender_id, error } => {
                vec![ClientAction::Emit(ClientEvent::ResponseFailed {
                    sender_id,
                    error,
                })]
            }
            Message::ChunkAck { session_id, index } => self.on_chunk_ack(session_id, index),
            Message::SessionAborted { session_id, error } => self.on_aborted(session_id, error),
            Message::SessionStart {
                session_id,
                sender_id,
                file_name,
                file_size,
                chunk_size,
                ..
            } => {
                debug!(%session_id, sender = %sender_id, file = %file_name, "download starting");
                let buffer = ReassemblyBuffer::new(
                    session_id,
                    sender_id,
                    file_name.clone(),
                    file_size,
                    chunk_size,
                );
                self.inbound.insert(session_id, buffer);
                vec![
                    ClientAction::Emit(ClientEvent::DownloadStarted {
                        session_id,
                        sender_id,
                        file_name,
                        file_size,
                    }),
                    ClientAction::Emit(ClientEvent::DownloadProgress {
                        session_id,
                        percent: 0,
                    }),
                ]
            }
            Message::Chunk {
                session_id,
                index,
                total_chunks,
                payload,
            } => {
                let Some(buffer) = self.inbound.get_mut(&session_id) else {
                    warn!(%session_id, index, "chunk for unknown session dropped");
                    return vec![];
                };
                match buffer.insert(index, total_chunks, payload) {
                    Ok(percent) => vec![ClientAction::Emit(ClientEvent::DownloadProgress {
                        session_id,
                        percent,
                    })],
                    Err(error) => {
                        self.inbound.remove(&session_id);
                        vec![
                            ClientAction::Send(Message::CancelSession { session_id }),
                            failed(session_id, error),
                        ]
                    }
                }
            }
            Message::SessionComplete { session_id, digest } => {
                let Some(buffer) = self.inbound.remove(&session_id) else {
                    warn!(%session_id, "completion for unknown session dropped");
                    return vec![];
                };
                match buffer.finalize(&digest) {
                    Ok(artifact) => {
                        info!(%session_id, file = %artifact.file_name, bytes = artifact.data.len(), "file received");
                        vec![
                            ClientAction::Emit(ClientEvent::DownloadProgress {
                                session_id,
                                percent: 100,
                            }),
                            ClientAction::Emit(ClientEvent::ArtifactReady(artifact)),
                        ]
                    }
                    Err(error) => vec![failed(session_id, error)],
                }
            }
            other => {
                warn!(msg = ?std::mem::discriminant(&other), "client-only message from relay ignored");
                vec![]
            }
        }
    }

    fn on_accepted(
        &mut self,
        session_id: SessionId,
        recipient_id: DeviceId,
        chunk_size: u32,
        total_chunks: u32,
    ) -> Vec<ClientAction> {
        let (Some(sender_id), Some(proposal)) = (self.device_id, self.take_proposal(recipient_id))
        else {
            warn!(%session_id, recipient = %recipient_id, "acceptance without matching proposal");
            return vec![ClientAction::Send(Message::CancelSession { session_id })];
        };
        let mut transfer = match OutboundTransfer::new(
            session_id,
            sender_id,
            recipient_id,
            proposal.file,
            chunk_size,
            total_chunks,
        ) {
            Ok(t) => t,
            Err(error) => {
                return vec![
                    ClientAction::Send(Message::CancelSession { session_id }),
                    failed(session_id, error),
                ]
            }
        };
        let mut actions = vec![ClientAction::Emit(ClientEvent::ProposalAccepted {
            session_id,
            recipient_id,
        })];
        match transfer.start(self.tick_count) {
            Ok(messages) => actions.extend(messages.into_iter().map(ClientAction::Send)),
            Err(error) => {
                actions.push(failed(session_id, error));
                return actions;
            }
        }
        if transfer.state() == OutboundState::Completed {
            actions.extend(upload_done(session_id));
        } else {
            self.outbound = Some(transfer);
        }
        actions
    }

    fn on_chunk_ack(&mut self, session_id: SessionId, index: u32) -> Vec<ClientAction> {
        let Some(t) = self
            .outbound
            .as_mut()
            .filter(|t| t.session_id() == session_id)
        else {
            debug!(%session_id, index, "ack for inactive session ignored");
            return vec![];
        };
        match t.on_ack(index, self.tick_count) {
            Ok(outcome) => {
                let completed = t.state() == OutboundState::Completed;
                let mut actions = vec![ClientAction::Send(outcome.next)];
                if completed {
                    self.outbound = None;
                    actions.extend(upload_done(session_id));
                } else {
                    actions.push(ClientAction::Emit(ClientEvent::UploadProgress {
                        session_id,
                        percent: outcome.progress,
                    }));
                }
                actions
            }
            Err(error) => {
                t.abort(error);
                self.outbound = None;
                vec![
                    ClientAction::Send(Message::CancelSession { session_id }),
                    failed(session_id, error),
                ]
            }
        }
    }

    fn on_aborted(&mut self, session_id: SessionId, error: TransferError) -> Vec<ClientAction> {
        let outbound = self
            .outbound
            .as_ref()
            .is_some_and(|t| t.session_id() == session_id);
        if outbound {
            if let Some(mut t) = self.outbound.take() {
                t.abort(error);
            }
        } else if self.inbound.remove(&session_id).is_none() {
            return vec![];
        }
        info!(%session_id, %error, "session aborted by relay");
        vec![failed(session_id, error)]
    }

    fn take_incoming(&mut self, sender_id: DeviceId) -> Result<IncomingRequest, TransferError> {
        let pos = self
            .incoming
            .iter()
            .position(|r| r.sender_id == sender_id)
            .ok_or(TransferError::NoPendingRequest)?;
        Ok(self.incoming.remove(pos))
    }

    fn take_proposal(&mut self, recipient_id: DeviceId) -> Option<PendingProposal> {
        match &self.proposal {
            Some(p) if p.recipient_id == recipient_id => self.proposal.take(),
            _ => None,
        }
    }

    fn clear_proposal(&mut self, recipient_id: DeviceId) {
        self.take_proposal(recipient_id);
    }
}

fn failed(session_id: SessionId, error: TransferError) -> ClientAction {
    ClientAction::Emit(ClientEvent::TransferFailed { session_id, error })
}

fn upload_done(session_id: SessionId) -> [ClientAction; 2] {
    [
        ClientAction::Emit(ClientEvent::UploadProgress {
            session_id,
            percent: 100,
        }),
        ClientAction::Emit(ClientEvent::UploadComplete { session_id }),
    ]
}
