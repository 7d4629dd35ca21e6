//! The three client commands: `devices`, `send` and `receive`.

use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use ferry_core::chunk::OutgoingFile;
use ferry_core::reassembly::ArtifactSink;
use ferry_core::{ClientCore, ClientEvent, Device, DeviceId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::sink::DirectorySink;

/// Connect and wait until the relay has welcomed us and sent the first roster.
async fn join(relay_addr: &str, core: ClientCore) -> anyhow::Result<Connection> {
    let mut conn = Connection::connect(relay_addr, core).await?;
    loop {
        let Some(events) = conn.next_events().await? else {
            bail!("relay closed the connection before sending the device list");
        };
        for ev in events {
            match ev {
                ClientEvent::Connected { device_id } => debug!(%device_id, "welcomed"),
                ClientEvent::DevicesChanged(_) => return Ok(conn),
                _ => {}
            }
        }
    }
}

pub async fn devices(relay_addr: &str, core: ClientCore) -> anyhow::Result<()> {
    let conn = join(relay_addr, core).await?;
    let devices = conn.core().devices();
    if devices.is_empty() {
        println!("No other devices on {}", relay_addr);
        return Ok(());
    }
    for d in devices {
        println!("{}  {}", d.id, display_name(d));
    }
    Ok(())
}

pub async fn send(
    relay_addr: &str,
    core: ClientCore,
    target: &str,
    path: &Path,
) -> anyhow::Result<()> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .context("path has no file name")?
        .to_string();

    let mut conn = join(relay_addr, core).await?;
    let recipient = resolve_device(conn.core().devices(), target)?;
    let file = OutgoingFile::new(name.clone(), data);
    let size = file.size();
    conn.try_apply(|c| c.propose(recipient.id, file))
        .await
        .with_context(|| format!("proposing transfer to {}", display_name(&recipient)))?;
    println!(
        "Waiting for {} to accept {} ({})...",
        display_name(&recipient),
        name,
        format_size(size)
    );

    while let Some(events) = conn.next_events().await? {
        for ev in events {
            match ev {
                ClientEvent::ProposalAccepted { .. } => println!("Accepted, sending"),
                ClientEvent::UploadProgress { percent, .. } => {
                    print!("\r{:>3}%", percent);
                    std::io::stdout().flush()?;
                }
                ClientEvent::UploadComplete { .. } => {
                    println!("\rSent {} to {}", name, display_name(&recipient));
                    return Ok(());
                }
                ClientEvent::ProposalRejected { timed_out, .. } => {
                    if timed_out {
                        bail!("{} did not answer in time", display_name(&recipient));
                    }
                    bail!("{} declined the transfer", display_name(&recipient));
                }
                ClientEvent::ProposalFailed { error, .. } => bail!("transfer not started: {}", error),
                ClientEvent::TransferFailed { error, .. } => {
                    println!();
                    bail!("transfer failed: {}", error);
                }
                _ => {}
            }
        }
    }
    bail!("relay connection closed")
}

pub struct ReceiveOptions {
    pub auto_accept: bool,
    pub out_dir: PathBuf,
    pub once: bool,
}

pub async fn receive(relay_addr: &str, core: ClientCore, opts: ReceiveOptions) -> anyhow::Result<()> {
    let mut conn = join(relay_addr, core).await?;
    let mut sink = DirectorySink::new(&opts.out_dir);
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    // Requests awaiting a y/n answer, oldest first.
    let mut prompts: VecDeque<DeviceId> = VecDeque::new();
    let me = conn.core().display_name().to_string();
    println!("Receiving as \"{}\", saving to {}", me, opts.out_dir.display());

    loop {
        let events = tokio::select! {
            events = conn.next_events() => match events? {
                Some(events) => events,
                None => bail!("relay connection closed"),
            },
            line = stdin.next_line(), if stdin_open && !prompts.is_empty() => {
                let line = line?;
                if line.is_none() {
                    stdin_open = false;
                }
                let Some(sender_id) = prompts.pop_front() else { continue };
                let yes = line.is_some_and(|l| matches!(l.trim(), "y" | "Y" | "yes"));
                let answered = answer(&mut conn, sender_id, yes).await?;
                if let Some(next) = prompts.front() {
                    prompt_for(&conn, *next)?;
                }
                answered
            }
        };

        for ev in events {
            match ev {
                ClientEvent::IncomingRequest {
                    sender_id,
                    sender_name,
                    file_name,
                    file_size,
                } => {
                    info!(sender = %sender_id, file = %file_name, "incoming request");
                    if opts.auto_accept {
                        println!(
                            "Accepting {} ({}) from {}",
                            file_name,
                            format_size(file_size),
                            sender_name
                        );
                        answer(&mut conn, sender_id, true).await?;
                    } else {
                        prompts.retain(|id| *id != sender_id);
                        prompts.push_back(sender_id);
                        if prompts.len() == 1 {
                            prompt_for(&conn, sender_id)?;
                        }
                    }
                }
                ClientEvent::RequestWithdrawn { sender_id } => {
                    if prompts.front() == Some(&sender_id) {
                        println!("\nRequest withdrawn");
                    }
                    prompts.retain(|id| *id != sender_id);
                }
                ClientEvent::ResponseFailed { error, .. } => warn!(%error, "answer not applied"),
                ClientEvent::DownloadStarted { file_name, .. } => println!("Receiving {}", file_name),
                ClientEvent::DownloadProgress { percent, .. } => {
                    print!("\r{:>3}%", percent);
                    std::io::stdout().flush()?;
                }
                ClientEvent::ArtifactReady(artifact) => {
                    let path = sink
                        .materialize(artifact)
                        .context("saving received file")?;
                    println!("\rSaved {}", path.display());
                    if opts.once {
                        return Ok(());
                    }
                }
                ClientEvent::TransferFailed { error, .. } => {
                    println!("\rTransfer failed: {}", error);
                    if opts.once {
                        bail!("transfer failed: {}", error);
                    }
                }
                _ => {}
            }
        }
    }
}

/// Accept or reject a request. A request withdrawn in the meantime is skipped.
async fn answer(conn: &mut Connection, sender_id: DeviceId, accept: bool) -> anyhow::Result<Vec<ClientEvent>> {
    conn.apply(|c| {
        let res = if accept {
            c.accept(sender_id)
        } else {
            c.reject(sender_id)
        };
        res.unwrap_or_else(|error| {
            debug!(sender = %sender_id, %error, "request no longer pending");
            Vec::new()
        })
    })
    .await
}

fn prompt_for(conn: &Connection, sender_id: DeviceId) -> anyhow::Result<()> {
    let Some(req) = conn
        .core()
        .incoming_requests()
        .iter()
        .find(|r| r.sender_id == sender_id)
    else {
        return Ok(());
    };
    print!(
        "{} wants to send {} ({}). Accept? [y/N] ",
        req.sender_name,
        req.file_name,
        format_size(req.file_size)
    );
    std::io::stdout().flush()?;
    Ok(())
}

/// Find a device by id prefix (hex) or by display name, case-insensitive.
pub fn resolve_device(devices: &[Device], query: &str) -> anyhow::Result<Device> {
    let q = query.trim().to_lowercase();
    if q.is_empty() {
        bail!("empty device name");
    }
    let by_name: Vec<&Device> = devices
        .iter()
        .filter(|d| d.display_name.to_lowercase() == q)
        .collect();
    let matches = if by_name.is_empty() {
        devices
            .iter()
            .filter(|d| d.id.to_string().starts_with(&q))
            .collect()
    } else {
        by_name
    };
    match matches.as_slice() {
        [one] => Ok((*one).clone()),
        [] => bail!("no device matches \"{}\"", query),
        _ => bail!("\"{}\" matches {} devices; use a longer id prefix", query, matches.len()),
    }
}

fn display_name(d: &Device) -> &str {
    if d.display_name.is_empty() {
        ferry_core::client::UNNAMED_DEVICE
    } else {
        &d.display_name
    }
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}
