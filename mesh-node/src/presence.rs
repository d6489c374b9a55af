//! Presence channel: UDP multicast beacons saying who is alive, where to dial them and which hub slot they hold.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use mesh_core::PresenceBeacon;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::host::{now_ms, Host};

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 60);
const MAX_BEACON: usize = 2048;

/// Publish the node's beacons and feed every received one back to it.
/// The node is told the channel is up once the socket joins the group, and down when it fails.
pub async fn run_presence(
    host: Arc<Host>,
    mut beacons: mpsc::UnboundedReceiver<PresenceBeacon>,
) -> io::Result<()> {
    let port = host.cfg.presence_port;
    let socket = Arc::new(make_multicast_socket(port)?);
    info!(port, group = %MULTICAST_GROUP, "presence channel joined");
    let actions = host.node.lock().await.set_presence_online(true, now_ms());
    host.execute(actions);

    let dest = SocketAddr::from((MULTICAST_GROUP, port));
    let send_socket = socket.clone();
    let sender = tokio::spawn(async move {
        while let Some(beacon) = beacons.recv().await {
            match serde_json::to_vec(&beacon) {
                Ok(bytes) => {
                    if let Err(e) = send_socket.send_to(&bytes, dest).await {
                        debug!(error = %e, "beacon send failed");
                    }
                }
                Err(e) => warn!(error = %e, "beacon encode failed"),
            }
        }
    });

    let mut buf = vec![0u8; MAX_BEACON];
    let result = loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => break Err(e),
        };
        let beacon: PresenceBeacon = match serde_json::from_slice(&buf[..n]) {
            Ok(b) => b,
            Err(e) => {
                trace!(%from, error = %e, "ignoring datagram");
                continue;
            }
        };
        let beacon = with_source_locator(beacon, from);
        let actions = host.node.lock().await.on_presence(beacon, now_ms());
        host.execute(actions);
    };

    sender.abort();
    warn!("presence channel lost");
    let actions = host.node.lock().await.set_presence_online(false, now_ms());
    host.execute(actions);
    result
}

fn make_multicast_socket(port: u16) -> io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_multicast_loop_v4(true)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

/// A peer that did not set `advertise_host` advertises loopback; on the LAN the
/// datagram's source address is the one to dial.
fn with_source_locator(mut beacon: PresenceBeacon, from: SocketAddr) -> PresenceBeacon {
    if from.ip().is_loopback() {
        return beacon;
    }
    if let Some(addr) = beacon
        .locator
        .as_deref()
        .and_then(|l| l.parse::<SocketAddr>().ok())
    {
        if addr.ip().is_loopback() || addr.ip().is_unspecified() {
            beacon.locator = Some(SocketAddr::new(from.ip(), addr.port()).to_string());
        }
    }
    beacon
}
