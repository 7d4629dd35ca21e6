//! Relay connection driving a ClientCore: framed TCP in, actions out, one tick per second.

use std::time::Duration;

use anyhow::Context;
use ferry_core::wire::{decode_payload, frame_len, LEN_SIZE};
use ferry_core::{encode_frame, ClientAction, ClientCore, ClientEvent, Message, TransferError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Interval;
use tracing::{debug, warn};

pub struct Connection {
    core: ClientCore,
    writer: OwnedWriteHalf,
    inbound: mpsc::UnboundedReceiver<Message>,
    ticker: Interval,
    closed: bool,
}

impl Connection {
    pub async fn connect(addr: &str, core: ClientCore) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connecting to relay {}", addr))?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let (tx, inbound) = mpsc::unbounded_channel();
        tokio::spawn(read_frames(reader, tx));
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.tick().await;
        debug!(%addr, "connected to relay");
        Ok(Self {
            core,
            writer,
            inbound,
            ticker,
            closed: false,
        })
    }

    pub fn core(&self) -> &ClientCore {
        &self.core
    }

    /// Run a core operation and perform its actions. Returns the events it emitted.
    pub async fn apply<F>(&mut self, op: F) -> anyhow::Result<Vec<ClientEvent>>
    where
        F: FnOnce(&mut ClientCore) -> Vec<ClientAction>,
    {
        let actions = op(&mut self.core);
        self.perform(actions).await
    }

    /// Like `apply`, for operations the core can refuse.
    pub async fn try_apply<F>(&mut self, op: F) -> anyhow::Result<Vec<ClientEvent>>
    where
        F: FnOnce(&mut ClientCore) -> Result<Vec<ClientAction>, TransferError>,
    {
        let actions = op(&mut self.core)?;
        self.perform(actions).await
    }

    /// Wait for the next batch of events: a relay message, a tick, or connection loss.
    /// Returns `None` once the connection has closed and its failures were reported.
    pub async fn next_events(&mut self) -> anyhow::Result<Option<Vec<ClientEvent>>> {
        if self.closed {
            return Ok(None);
        }
        let actions = tokio::select! {
            msg = self.inbound.recv() => match msg {
                Some(msg) => self.core.on_message_received(msg),
                None => {
                    self.closed = true;
                    warn!("relay connection closed");
                    let lost = self.core.on_disconnected();
                    return Ok(Some(emitted(lost)));
                }
            },
            _ = self.ticker.tick() => self.core.tick(),
        };
        self.perform(actions).await.map(Some)
    }

    async fn perform(&mut self, actions: Vec<ClientAction>) -> anyhow::Result<Vec<ClientEvent>> {
        let mut events = Vec::new();
        for action in actions {
            match action {
                ClientAction::Send(msg) => {
                    if self.closed {
                        continue;
                    }
                    let frame = encode_frame(&msg)?;
                    self.writer
                        .write_all(&frame)
                        .await
                        .context("writing to relay")?;
                }
                ClientAction::Emit(ev) => events.push(ev),
            }
        }
        self.writer.flush().await.context("writing to relay")?;
        Ok(events)
    }
}

fn emitted(actions: Vec<ClientAction>) -> Vec<ClientEvent> {
    actions
        .into_iter()
        .filter_map(|a| match a {
            ClientAction::Emit(ev) => Some(ev),
            ClientAction::Send(_) => None,
        })
        .collect()
}

/// Read frames until EOF or a bad frame; dropping `tx` signals the close.
async fn read_frames(mut reader: OwnedReadHalf, tx: mpsc::UnboundedSender<Message>) {
    loop {
        let mut len_buf = [0u8; LEN_SIZE];
        if reader.read_exact(&mut len_buf).await.is_err() {
            break;
        }
        let len = match frame_len(len_buf) {
            Ok(len) => len,
            Err(e) => {
                warn!(error = %e, "bad frame from relay");
                break;
            }
        };
        let mut payload = vec![0u8; len];
        if reader.read_exact(&mut payload).await.is_err() {
            break;
        }
        match decode_payload(&payload) {
            Ok(msg) => {
                if tx.send(msg).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "undecodable frame from relay");
                break;
            }
        }
    }
}
