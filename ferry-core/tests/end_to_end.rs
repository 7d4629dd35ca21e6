//! Relay and clients wired together in memory: every frame goes through the wire codec.

use std::collections::{HashMap, VecDeque};

use ferry_core::chunk::OutgoingFile;
use ferry_core::{
    decode_frame, encode_frame, ClientAction, ClientCore, ClientEvent, Config, DeviceId, Message,
    OutboundAction, RelayCore, SessionId, TransferError,
};
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

enum Hop {
    ToRelay(DeviceId, Message),
    ToClient(DeviceId, Message),
    /// The relay's write of a chunk to the recipient finished.
    Delivered(SessionId, u32),
}

struct Net {
    relay: RelayCore,
    clients: HashMap<DeviceId, ClientCore>,
    events: HashMap<DeviceId, Vec<ClientEvent>>,
    /// Frames for devices driven by hand instead of by a ClientCore.
    inbox: HashMap<DeviceId, Vec<Message>>,
    queue: VecDeque<Hop>,
    /// Devices whose chunk deliveries are counted; delivery stops after the limit.
    cut_after: Option<(DeviceId, usize)>,
    delivered_chunks: HashMap<DeviceId, usize>,
}

fn roundtrip(msg: Message) -> Message {
    let frame = encode_frame(&msg).unwrap();
    let (decoded, used) = decode_frame(&frame).unwrap();
    assert_eq!(used, frame.len());
    decoded
}

impl Net {
    fn new() -> Self {
        Self {
            relay: RelayCore::new(Config::default()),
            clients: HashMap::new(),
            events: HashMap::new(),
            inbox: HashMap::new(),
            queue: VecDeque::new(),
            cut_after: None,
            delivered_chunks: HashMap::new(),
        }
    }

    fn connect(&mut self, name: &str, chunk_size: u32) -> DeviceId {
        let (id, actions) = self.relay.on_connected();
        let config = Config {
            chunk_size,
            ..Config::default()
        };
        self.clients.insert(id, ClientCore::new(config, name));
        self.events.insert(id, Vec::new());
        self.push_relay(actions);
        self.run();
        id
    }

    /// A device with no client behind it; its frames are collected in `inbox`.
    fn connect_raw(&mut self) -> DeviceId {
        let (id, actions) = self.relay.on_connected();
        self.inbox.insert(id, Vec::new());
        self.push_relay(actions);
        self.run();
        id
    }

    fn send_raw(&mut self, from: DeviceId, msg: Message) {
        self.queue.push_back(Hop::ToRelay(from, msg));
    }

    fn disconnect(&mut self, id: DeviceId) {
        self.clients.remove(&id);
        let actions = self.relay.on_disconnected(id);
        self.push_relay(actions);
        self.run();
    }

    fn client(&mut self, id: DeviceId) -> &mut ClientCore {
        self.clients.get_mut(&id).unwrap()
    }

    fn events(&self, id: DeviceId) -> &[ClientEvent] {
        &self.events[&id]
    }

    fn push_relay(&mut self, actions: Vec<OutboundAction>) {
        for action in actions {
            match action {
                OutboundAction::Send(to, msg) => self.queue.push_back(Hop::ToClient(to, msg)),
                OutboundAction::Relay {
                    to,
                    message,
                    session_id,
                    index,
                } => {
                    self.queue.push_back(Hop::ToClient(to, message));
                    self.queue.push_back(Hop::Delivered(session_id, index));
                }
            }
        }
    }

    fn push_client(&mut self, from: DeviceId, actions: Vec<ClientAction>) {
        for action in actions {
            match action {
                ClientAction::Send(msg) => self.queue.push_back(Hop::ToRelay(from, msg)),
                ClientAction::Emit(ev) => {
                    if let Some(log) = self.events.get_mut(&from) {
                        log.push(ev);
                    }
                }
            }
        }
    }

    /// Deliver queued frames until the network is quiet.
    fn run(&mut self) {
        while let Some(hop) = self.queue.pop_front() {
            match hop {
                Hop::ToRelay(from, msg) => {
                    let actions = self.relay.on_message_received(from, roundtrip(msg));
                    self.push_relay(actions);
                }
                Hop::ToClient(to, msg) => {
                    if matches!(msg, Message::Chunk { .. }) {
                        let n = self.delivered_chunks.entry(to).or_default();
                        *n += 1;
                        if let Some((cut, limit)) = self.cut_after {
                            if cut == to && *n > limit {
                                self.cut_after = None;
                                self.queue.clear();
                                self.disconnect(to);
                                return;
                            }
                        }
                    }
                    let Some(client) = self.clients.get_mut(&to) else {
                        if let Some(inbox) = self.inbox.get_mut(&to) {
                            inbox.push(roundtrip(msg));
                        }
                        continue;
                    };
                    let actions = client.on_message_received(roundtrip(msg));
                    self.push_client(to, actions);
                }
                Hop::Delivered(session_id, index) => {
                    let actions = self.relay.on_chunk_delivered(session_id, index);
                    self.push_relay(actions);
                }
            }
        }
    }

    fn propose(&mut self, from: DeviceId, to: DeviceId, name: &str, data: Vec<u8>) {
        let actions = self
            .client(from)
            .propose(to, OutgoingFile::new(name, data))
            .unwrap();
        self.push_client(from, actions);
        self.run();
    }

    fn accept(&mut self, recipient: DeviceId, sender: DeviceId) {
        let actions = self.client(recipient).accept(sender).unwrap();
        self.push_client(recipient, actions);
        self.run();
    }

    fn tick(&mut self, n: u64) {
        for _ in 0..n {
            let actions = self.relay.tick();
            self.push_relay(actions);
            let ids: Vec<DeviceId> = self.clients.keys().copied().collect();
            for id in ids {
                let actions = self.client(id).tick();
                self.push_client(id, actions);
            }
            self.run();
        }
    }
}

fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen()).collect()
}

fn artifact_of(events: &[ClientEvent]) -> Option<&ferry_core::Artifact> {
    events.iter().find_map(|e| match e {
        ClientEvent::ArtifactReady(a) => Some(a),
        _ => None,
    })
}

fn download_progress(events: &[ClientEvent]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|e| match e {
            ClientEvent::DownloadProgress { percent, .. } => Some(*percent),
            _ => None,
        })
        .collect()
}

#[test]
fn file_arrives_byte_identical() {
    let mut net = Net::new();
    let a = net.connect("desk", 1000);
    let b = net.connect("phone", 1000);
    let data = random_bytes(4321, 7);

    net.propose(a, b, "photo.jpg", data.clone());
    assert!(matches!(
        net.events(b).last(),
        Some(ClientEvent::IncomingRequest { sender_name, file_size: 4321, .. }) if sender_name == "desk"
    ));
    net.accept(b, a);

    let artifact = artifact_of(net.events(b)).expect("artifact");
    assert_eq!(artifact.data, data);
    assert_eq!(artifact.file_name, "photo.jpg");
    assert_eq!(artifact.sender_id, a);
    assert_eq!(download_progress(net.events(b)), vec![0, 20, 40, 60, 80, 100, 100]);
    assert!(net
        .events(a)
        .iter()
        .any(|e| matches!(e, ClientEvent::UploadComplete { .. })));
    assert!(net.relay.sessions().is_empty());
}

#[test]
fn empty_file_transfers() {
    let mut net = Net::new();
    let a = net.connect("a", 1000);
    let b = net.connect("b", 1000);
    net.propose(a, b, "empty", Vec::new());
    net.accept(b, a);
    let artifact = artifact_of(net.events(b)).expect("artifact");
    assert!(artifact.data.is_empty());
}

#[test]
fn roster_excludes_self_and_tracks_renames() {
    let mut net = Net::new();
    let a = net.connect("a", 1000);
    let b = net.connect("b", 1000);
    assert_eq!(net.client(a).devices().len(), 1);
    assert_eq!(net.client(a).devices()[0].id, b);

    let actions = net.client(b).rename("b-renamed");
    net.push_client(b, actions);
    net.run();
    assert_eq!(net.client(a).devices()[0].display_name, "b-renamed");

    net.disconnect(b);
    assert!(net.client(a).devices().is_empty());
}

#[test]
fn rejection_reaches_sender() {
    let mut net = Net::new();
    let a = net.connect("a", 1000);
    let b = net.connect("b", 1000);
    net.propose(a, b, "f", vec![1, 2, 3]);
    let actions = net.client(b).reject(a).unwrap();
    net.push_client(b, actions);
    net.run();
    assert!(net.events(a).contains(&ClientEvent::ProposalRejected {
        recipient_id: b,
        timed_out: false
    }));
    assert!(!net.client(a).is_sending());
    assert!(net.relay.handshake().is_empty());
}

#[test]
fn unanswered_proposal_expires() {
    let mut net = Net::new();
    let a = net.connect("a", 1000);
    let b = net.connect("b", 1000);
    net.propose(a, b, "f", vec![1, 2, 3]);
    net.tick(Config::default().proposal_timeout_ticks + 1);
    assert!(net.events(a).contains(&ClientEvent::ProposalRejected {
        recipient_id: b,
        timed_out: true
    }));
    assert!(net
        .events(b)
        .contains(&ClientEvent::RequestWithdrawn { sender_id: a }));
    assert!(net.client(b).incoming_requests().is_empty());
}

#[test]
fn recipient_disconnect_mid_stream_aborts_sender() {
    let mut net = Net::new();
    let a = net.connect("a", 100);
    let b = net.connect("b", 100);
    net.propose(a, b, "f", random_bytes(500, 3));
    net.cut_after = Some((b, 2));
    net.accept(b, a);

    let failure = net.events(a).iter().find_map(|e| match e {
        ClientEvent::TransferFailed { error, .. } => Some(*error),
        _ => None,
    });
    assert_eq!(failure, Some(TransferError::ConnectionLost));
    assert!(!net
        .events(a)
        .iter()
        .any(|e| matches!(e, ClientEvent::UploadComplete { .. })));
    assert!(!net.client(a).is_sending());
    assert!(net.relay.sessions().is_empty());
}

#[test]
fn concurrent_sessions_stay_independent() {
    let mut net = Net::new();
    let a = net.connect("a", 64);
    let b = net.connect("b", 64);
    let c = net.connect("c", 64);
    let from_a = random_bytes(1000, 1);
    let from_c = random_bytes(777, 2);

    net.propose(a, b, "from-a", from_a.clone());
    net.propose(c, b, "from-c", from_c.clone());
    // accept both before delivering anything so the two streams interleave
    let first = net.client(b).accept(a).unwrap();
    let second = net.client(b).accept(c).unwrap();
    net.push_client(b, first);
    net.push_client(b, second);
    net.run();
    assert_eq!(net.relay.sessions().len(), 0);

    let got: HashMap<String, Vec<u8>> = net
        .events(b)
        .iter()
        .filter_map(|e| match e {
            ClientEvent::ArtifactReady(art) => Some((art.file_name.clone(), art.data.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(got.len(), 2);
    assert_eq!(got["from-a"], from_a);
    assert_eq!(got["from-c"], from_c);
}

#[test]
fn duplicate_proposal_to_same_recipient_conflicts() {
    let mut net = Net::new();
    let a = net.connect("a", 1000);
    let b = net.connect("b", 1000);
    // bypass the client's one-outbound guard to reach the relay's check
    net.queue.push_back(Hop::ToRelay(
        a,
        Message::ProposeTransfer {
            recipient_id: b,
            file_name: "x".into(),
            file_size: 1,
            chunk_size: 1000,
        },
    ));
    net.run();
    net.propose(a, b, "y", vec![0]);
    assert!(net.events(a).contains(&ClientEvent::ProposalFailed {
        recipient_id: b,
        error: TransferError::ConflictingRequest
    }));
}

#[test]
fn proposal_to_departed_device_fails() {
    let mut net = Net::new();
    let a = net.connect("a", 1000);
    let b = net.connect("b", 1000);
    net.propose(a, b, "f", vec![1]);
    // b leaves while the proposal is pending
    net.disconnect(b);
    assert!(net.events(a).contains(&ClientEvent::ProposalFailed {
        recipient_id: b,
        error: TransferError::RecipientUnreachable
    }));
    assert_eq!(
        net.client(a)
            .propose(b, OutgoingFile::new("f", vec![1]))
            .unwrap_err(),
        TransferError::UnknownRecipient
    );
    assert!(!net.relay.handshake().is_pending(a, b));
}

/// Hand-driven sender `a` with a started three-chunk session to client `b`.
fn hand_driven_session(net: &mut Net) -> (DeviceId, DeviceId, SessionId) {
    let a = net.connect_raw();
    let b = net.connect("b", 1000);
    net.send_raw(
        a,
        Message::ProposeTransfer {
            recipient_id: b,
            file_name: "f".into(),
            file_size: 3000,
            chunk_size: 1000,
        },
    );
    net.run();
    net.accept(b, a);
    let sid = net.inbox[&a]
        .iter()
        .find_map(|m| match m {
            Message::TransferAccepted { session_id, .. } => Some(*session_id),
            _ => None,
        })
        .expect("accepted");
    net.send_raw(
        a,
        Message::SessionStart {
            session_id: sid,
            sender_id: a,
            file_name: "f".into(),
            file_size: 3000,
            chunk_size: 1000,
            total_chunks: 3,
        },
    );
    net.run();
    (a, b, sid)
}

fn raw_chunk(session_id: SessionId, index: u32) -> Message {
    Message::Chunk {
        session_id,
        index,
        total_chunks: 3,
        payload: vec![index as u8; 1000],
    }
}

fn acks(net: &Net, a: DeviceId) -> Vec<u32> {
    net.inbox[&a]
        .iter()
        .filter_map(|m| match m {
            Message::ChunkAck { index, .. } => Some(*index),
            _ => None,
        })
        .collect()
}

fn assert_violation_reaches_both(net: &Net, a: DeviceId, b: DeviceId, sid: SessionId) {
    assert!(net.inbox[&a].contains(&Message::SessionAborted {
        session_id: sid,
        error: TransferError::ProtocolViolation
    }));
    assert!(net.events(b).contains(&ClientEvent::TransferFailed {
        session_id: sid,
        error: TransferError::ProtocolViolation
    }));
    assert!(artifact_of(net.events(b)).is_none());
    assert!(net.relay.sessions().is_empty());
}

#[test]
fn hand_driven_sender_in_lock_step_succeeds() {
    let mut net = Net::new();
    let (a, b, sid) = hand_driven_session(&mut net);
    let mut data = Vec::new();
    for index in 0..3 {
        net.send_raw(a, raw_chunk(sid, index));
        net.run();
        data.extend(vec![index as u8; 1000]);
    }
    assert_eq!(acks(&net, a), vec![0, 1, 2]);
    let digest: [u8; 32] = Sha256::digest(&data).into();
    net.send_raw(
        a,
        Message::SessionComplete {
            session_id: sid,
            digest,
        },
    );
    net.run();
    assert_eq!(artifact_of(net.events(b)).expect("artifact").data, data);
}

#[test]
fn repeated_chunk_aborts_session() {
    let mut net = Net::new();
    let (a, b, sid) = hand_driven_session(&mut net);
    net.send_raw(a, raw_chunk(sid, 0));
    net.run();
    net.send_raw(a, raw_chunk(sid, 0));
    net.run();
    assert_violation_reaches_both(&net, a, b, sid);
}

#[test]
fn skipped_chunk_aborts_session() {
    let mut net = Net::new();
    let (a, b, sid) = hand_driven_session(&mut net);
    net.send_raw(a, raw_chunk(sid, 0));
    net.run();
    net.send_raw(a, raw_chunk(sid, 2));
    net.run();
    assert_violation_reaches_both(&net, a, b, sid);
}

#[test]
fn chunk_ahead_of_ack_aborts_session() {
    let mut net = Net::new();
    let (a, b, sid) = hand_driven_session(&mut net);
    // both queued before the relay has written chunk 0
    net.send_raw(a, raw_chunk(sid, 0));
    net.send_raw(a, raw_chunk(sid, 1));
    net.run();
    assert!(acks(&net, a).is_empty());
    assert_violation_reaches_both(&net, a, b, sid);
}

#[test]
fn completion_before_last_chunk_aborts_session() {
    let mut net = Net::new();
    let (a, b, sid) = hand_driven_session(&mut net);
    net.send_raw(a, raw_chunk(sid, 0));
    net.run();
    net.send_raw(
        a,
        Message::SessionComplete {
            session_id: sid,
            digest: [0; 32],
        },
    );
    net.run();
    assert_violation_reaches_both(&net, a, b, sid);
}
