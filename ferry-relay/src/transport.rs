//! Relay transport: TCP listener, one reader and one writer task per connection, length-prefixed frames.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ferry_core::wire::{decode_payload, frame_len, LEN_SIZE};
use ferry_core::{encode_frame, DeviceId, Message, OutboundAction, RelayCore, SessionId};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// A frame queued for a connection. Relayed chunks carry their session and index,
/// reported to the core once the frame has been written.
struct Outgoing {
    frame: Vec<u8>,
    delivered: Option<(SessionId, u32)>,
}

type Senders = Arc<Mutex<HashMap<DeviceId, mpsc::UnboundedSender<Outgoing>>>>;

/// Accept connections forever and drive the relay core's tick every second.
pub async fn run_relay(core: Arc<Mutex<RelayCore>>, listener: TcpListener) -> std::io::Result<()> {
    let senders: Senders = Arc::new(Mutex::new(HashMap::new()));

    let tick_core = core.clone();
    let tick_senders = senders.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.tick().await;
        loop {
            interval.tick().await;
            let actions = tick_core.lock().await.tick();
            dispatch(actions, &tick_senders).await;
        }
    });

    loop {
        let (stream, addr) = listener.accept().await?;
        debug!(%addr, "connection accepted");
        let core = core.clone();
        let senders = senders.clone();
        tokio::spawn(async move {
            run_connection(stream, core, senders).await;
            debug!(%addr, "connection closed");
        });
    }
}

async fn run_connection(stream: TcpStream, core: Arc<Mutex<RelayCore>>, senders: Senders) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "set_nodelay failed");
    }
    let (tx, mut rx) = mpsc::unbounded_channel::<Outgoing>();
    // Register the writer before the core greets the device, so Welcome has somewhere to go.
    let (device, actions) = {
        let mut c = core.lock().await;
        let (device, actions) = c.on_connected();
        senders.lock().await.insert(device, tx);
        (device, actions)
    };
    dispatch(actions, &senders).await;

    let (mut reader, mut writer) = stream.into_split();
    let writer_core = core.clone();
    let writer_senders = senders.clone();
    tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            let written = async {
                writer.write_all(&out.frame).await?;
                writer.flush().await
            }
            .await;
            if let Err(e) = written {
                debug!(%device, error = %e, "write failed");
                break;
            }
            if let Some((session_id, index)) = out.delivered {
                let actions = writer_core.lock().await.on_chunk_delivered(session_id, index);
                dispatch(actions, &writer_senders).await;
            }
        }
    });

    loop {
        let mut len_buf = [0u8; LEN_SIZE];
        if reader.read_exact(&mut len_buf).await.is_err() {
            break;
        }
        let len = match frame_len(len_buf) {
            Ok(len) => len,
            Err(e) => {
                warn!(%device, error = %e, "oversized frame, closing");
                break;
            }
        };
        let mut payload = vec![0u8; len];
        if reader.read_exact(&mut payload).await.is_err() {
            break;
        }
        let msg = match decode_payload(&payload) {
            Ok(m) => m,
            Err(e) => {
                warn!(%device, error = %e, "undecodable frame, closing");
                break;
            }
        };
        let actions = core.lock().await.on_message_received(device, msg);
        dispatch(actions, &senders).await;
    }

    senders.lock().await.remove(&device);
    let actions = core.lock().await.on_disconnected(device);
    dispatch(actions, &senders).await;
    info!(%device, "device left");
}

/// Encode actions and queue them on the target connections. Targets already gone are skipped.
async fn dispatch(actions: Vec<OutboundAction>, senders: &Senders) {
    if actions.is_empty() {
        return;
    }
    let senders = senders.lock().await;
    for action in actions {
        let (to, msg, delivered) = match action {
            OutboundAction::Send(to, msg) => (to, msg, None),
            OutboundAction::Relay {
                to,
                message,
                session_id,
                index,
            } => (to, message, Some((session_id, index))),
        };
        let Some(frame) = encode(&msg) else {
            continue;
        };
        match senders.get(&to) {
            Some(tx) => {
                let _ = tx.send(Outgoing { frame, delivered });
            }
            None => debug!(device = %to, "no connection for outbound frame"),
        }
    }
}

fn encode(msg: &Message) -> Option<Vec<u8>> {
    match encode_frame(msg) {
        Ok(frame) => Some(frame),
        Err(e) => {
            error!(error = %e, "failed to encode frame");
            None
        }
    }
}
