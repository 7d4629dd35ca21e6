//! Ferry protocol core: device registry, transfer handshake, chunk transport and reassembly.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod chunk;
pub mod client;
pub mod config;
pub mod error;
pub mod handshake;
pub mod ids;
pub mod protocol;
pub mod reassembly;
pub mod registry;
pub mod relay;
pub mod session;
pub mod wire;

pub use chunk::{OutboundTransfer, OutgoingFile, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
pub use client::{ClientAction, ClientCore, ClientEvent};
pub use config::{Config, ConfigError};
pub use error::TransferError;
pub use ids::{DeviceId, SessionId};
pub use protocol::{DeviceInfo, Message, PROTOCOL_VERSION};
pub use reassembly::{Artifact, ArtifactSink, ReassemblyBuffer};
pub use registry::{Device, DeviceRegistry};
pub use relay::{OutboundAction, RelayCore};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
