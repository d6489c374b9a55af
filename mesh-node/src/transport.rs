//! Peer transport: TCP listener and dialer, id handshake, kind-tagged packet frames.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mesh_core::{Direction, Packet, PeerId, PROTOCOL_VERSION};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::host::{now_ms, Host};

const KIND_CONTROL: u8 = 0;
const KIND_CHUNK: u8 = 1;
const HEAD_SIZE: usize = 1 + 4; // kind + len
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;
const MAX_ID_LEN: usize = 256;

/// Accept peers on the configured port for as long as the daemon runs.
pub async fn run_listener(host: Arc<Host>) -> io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", host.cfg.listen_port)).await?;
    info!(port = host.cfg.listen_port, "peer transport listening");
    let local_id = host.self_id().clone();
    accept_loop(host, listener, local_id, Direction::Inbound).await
}

/// Accept loop shared by the peer port and hub listeners; `local_id` is what we answer the handshake with.
async fn accept_loop(
    host: Arc<Host>,
    listener: TcpListener,
    local_id: PeerId,
    direction: Direction,
) -> io::Result<()> {
    loop {
        let (mut stream, addr) = listener.accept().await?;
        let host = host.clone();
        let local_id = local_id.clone();
        tokio::spawn(async move {
            match handshake_accept(&mut stream, &local_id).await {
                Ok(peer) => run_connection(host, stream, peer, direction).await,
                Err(e) => debug!(%addr, error = %e, "handshake failed"),
            }
        });
    }
}

/// Dial `addr` expecting `peer` on the other end. Any failure is reported to the node.
pub async fn dial(host: Arc<Host>, peer: PeerId, addr: String) {
    let limit = Duration::from_millis(host.cfg.mesh.connect_timeout_ms);
    let attempt = tokio::time::timeout(limit, async {
        let mut stream = TcpStream::connect(addr.as_str()).await?;
        let remote = handshake_connect(&mut stream, host.self_id()).await?;
        Ok::<_, io::Error>((stream, remote))
    })
    .await;
    let reason = match attempt {
        Ok(Ok((stream, remote))) if remote == peer => {
            return run_connection(host, stream, peer, Direction::Outbound).await;
        }
        Ok(Ok((_, remote))) => format!("answered as {}", remote),
        Ok(Err(e)) => e.to_string(),
        Err(_) => "timed out".to_string(),
    };
    debug!(peer = %peer, %addr, %reason, "dial failed");
    let actions = host.node.lock().await.on_connection_failed(&peer, now_ms());
    host.execute(actions);
}

/// Try to take hub slot `slot`. The node learns the outcome either way.
pub async fn bind_hub(host: Arc<Host>, slot: usize, hub_id: PeerId) {
    let bound = match host.cfg.hub_addr(slot) {
        Some(addr) => TcpListener::bind(addr).await,
        None => Err(io::Error::new(io::ErrorKind::AddrNotAvailable, "no address for hub slot")),
    };
    let actions = match bound {
        Ok(listener) => {
            info!(slot, hub = %hub_id, "hub listener bound");
            let task = tokio::spawn({
                let host = host.clone();
                async move {
                    if let Err(e) = accept_loop(host, listener, hub_id, Direction::HubInbound).await {
                        warn!(slot, error = %e, "hub listener stopped");
                    }
                }
            });
            host.set_hub_listener(slot, task.abort_handle());
            host.node.lock().await.on_hub_bound(slot, now_ms())
        }
        Err(e) => {
            debug!(slot, error = %e, "hub slot unavailable");
            host.node.lock().await.on_hub_bind_failed(slot, now_ms())
        }
    };
    host.execute(actions);
}

async fn run_connection(host: Arc<Host>, stream: TcpStream, peer: PeerId, direction: Direction) {
    let _ = stream.set_nodelay(true);
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let Some(link) = host.register_link(&peer, direction, tx) else {
        return;
    };
    tokio::spawn(write_loop(writer, rx, link.buffered.clone()));
    let actions = host.node.lock().await.on_connection_open(&peer, direction, now_ms());
    host.execute(actions);

    let mut reader = BufReader::new(reader);
    let mut close = link.close;
    loop {
        tokio::select! {
            _ = &mut close => break,
            read = read_packet(&mut reader) => {
                match read {
                    Ok(packet) => {
                        let result = host.node.lock().await.on_packet(&peer, packet, now_ms());
                        match result {
                            Ok(actions) => host.execute(actions),
                            Err(e) => debug!(peer = %peer, error = %e, "bad packet"),
                        }
                    }
                    Err(e) => {
                        debug!(peer = %peer, error = %e, "read ended");
                        break;
                    }
                }
            }
        }
    }
    if host.unregister_link(&peer, link.id) {
        let actions = host.node.lock().await.on_connection_closed(&peer, now_ms());
        host.execute(actions);
    }
}

async fn write_loop(writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Packet>, buffered: Arc<AtomicU64>) {
    let mut writer = BufWriter::new(writer);
    while let Some(packet) = rx.recv().await {
        let len = packet.len() as u64;
        let result = write_packet(&mut writer, &packet).await;
        buffered.fetch_sub(len, Ordering::Relaxed);
        if let Err(e) = result {
            debug!(error = %e, "write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn write_packet<W: AsyncWrite + Unpin>(w: &mut W, packet: &Packet) -> io::Result<()> {
    let (kind, bytes) = match packet {
        Packet::Control(b) => (KIND_CONTROL, b),
        Packet::Chunk(b) => (KIND_CHUNK, b),
    };
    let len = u32::try_from(bytes.len())
        .ok()
        .filter(|l| *l <= MAX_FRAME_LEN)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "packet too large"))?;
    let mut head = [0u8; HEAD_SIZE];
    head[0] = kind;
    head[1..].copy_from_slice(&len.to_le_bytes());
    w.write_all(&head).await?;
    w.write_all(bytes).await?;
    w.flush().await
}

async fn read_packet<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Packet> {
    let mut head = [0u8; HEAD_SIZE];
    r.read_exact(&mut head).await?;
    let len = u32::from_le_bytes([head[1], head[2], head[3], head[4]]);
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await?;
    match head[0] {
        KIND_CONTROL => Ok(Packet::Control(buf)),
        KIND_CHUNK => Ok(Packet::Chunk(buf)),
        _ => Err(io::Error::new(io::ErrorKind::InvalidData, "unknown packet kind")),
    }
}

/// Handshake: version byte, u16 LE id length, id bytes. Each side sends one.
async fn send_id<W: AsyncWrite + Unpin>(w: &mut W, id: &PeerId) -> io::Result<()> {
    let bytes = id.as_str().as_bytes();
    if bytes.len() > MAX_ID_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "peer id too long"));
    }
    let mut out = Vec::with_capacity(3 + bytes.len());
    out.push(PROTOCOL_VERSION);
    out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
    out.extend_from_slice(bytes);
    w.write_all(&out).await?;
    w.flush().await
}

async fn recv_id<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<PeerId> {
    let mut head = [0u8; 3];
    r.read_exact(&mut head).await?;
    if head[0] != PROTOCOL_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unsupported protocol version",
        ));
    }
    let len = u16::from_le_bytes([head[1], head[2]]) as usize;
    if len == 0 || len > MAX_ID_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad peer id length"));
    }
    let mut id = vec![0u8; len];
    r.read_exact(&mut id).await?;
    String::from_utf8(id)
        .map(PeerId::from)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

async fn handshake_accept<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S, local_id: &PeerId) -> io::Result<PeerId> {
    let peer = recv_id(stream).await?;
    send_id(stream, local_id).await?;
    Ok(peer)
}

async fn handshake_connect<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S, local_id: &PeerId) -> io::Result<PeerId> {
    send_id(stream, local_id).await?;
    recv_id(stream).await
}
