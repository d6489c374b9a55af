//! Shared daemon state and the executor for the node's outbound actions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use mesh_core::{AppEvent, Direction, Millis, Node, OutboundAction, Packet, PeerId, PresenceBeacon, StreamEvent};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, trace};

use crate::config::Config;
use crate::transport;

const TICK: Duration = Duration::from_secs(1);
const FAST_TICK: Duration = Duration::from_millis(100);

pub fn now_ms() -> Millis {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Millis)
        .unwrap_or(0)
}

/// Recover the guard from a poisoned lock; the maps stay consistent between statements.
fn locked<T>(m: &StdMutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// One live TCP connection. Dropping it closes the socket: the writer sees its
/// channel end and the reader sees `close` fire.
struct PeerLink {
    id: u64,
    direction: Direction,
    tx: mpsc::UnboundedSender<Packet>,
    buffered: Arc<AtomicU64>,
    _close: oneshot::Sender<()>,
}

/// Handles a registered connection's tasks use to talk back to the host.
pub struct LinkHandle {
    pub id: u64,
    pub buffered: Arc<AtomicU64>,
    pub close: oneshot::Receiver<()>,
}

pub struct Host {
    pub node: Mutex<Node>,
    pub cfg: Config,
    self_id: PeerId,
    links: StdMutex<HashMap<PeerId, PeerLink>>,
    streams: StdMutex<HashMap<String, mpsc::UnboundedSender<StreamEvent>>>,
    hubs: StdMutex<HashMap<usize, AbortHandle>>,
    presence_tx: mpsc::UnboundedSender<PresenceBeacon>,
    app_tx: mpsc::UnboundedSender<AppEvent>,
    next_id: AtomicU64,
}

impl Host {
    pub fn new(
        node: Node,
        cfg: Config,
        presence_tx: mpsc::UnboundedSender<PresenceBeacon>,
        app_tx: mpsc::UnboundedSender<AppEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            self_id: node.peer_id().clone(),
            node: Mutex::new(node),
            cfg,
            links: StdMutex::new(HashMap::new()),
            streams: StdMutex::new(HashMap::new()),
            hubs: StdMutex::new(HashMap::new()),
            presence_tx,
            app_tx,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn self_id(&self) -> &PeerId {
        &self.self_id
    }

    /// Monotonic id for links and range requests.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Carry out what the node asked for. Never blocks; socket work is spawned.
    pub fn execute(self: &Arc<Self>, actions: Vec<OutboundAction>) {
        for action in actions {
            match action {
                OutboundAction::Connect { peer, locator } => self.connect(peer, locator),
                OutboundAction::Close(peer) => {
                    if locked(&self.links).remove(&peer).is_some() {
                        debug!(peer = %peer, "connection closed by node");
                    }
                }
                OutboundAction::Send(peer, packet) => {
                    let links = locked(&self.links);
                    match links.get(&peer) {
                        Some(link) => {
                            link.buffered.fetch_add(packet.len() as u64, Ordering::Relaxed);
                            if link.tx.send(packet).is_err() {
                                trace!(peer = %peer, "writer gone, packet dropped");
                            }
                        }
                        None => trace!(peer = %peer, "no link, packet dropped"),
                    }
                }
                OutboundAction::BindHub { slot, hub_id } => {
                    tokio::spawn(transport::bind_hub(self.clone(), slot, hub_id));
                }
                OutboundAction::ReleaseHub { slot } => {
                    if let Some(listener) = locked(&self.hubs).remove(&slot) {
                        listener.abort();
                        debug!(slot, "hub listener released");
                    }
                }
                OutboundAction::PublishPresence(beacon) => {
                    if self.presence_tx.send(beacon).is_err() {
                        debug!("presence task gone, beacon dropped");
                    }
                }
                OutboundAction::App(event) => {
                    if self.app_tx.send(event).is_err() {
                        debug!("front end gone, app event dropped");
                    }
                }
                OutboundAction::Stream(event) => self.route_stream(event),
            }
        }
    }

    fn connect(self: &Arc<Self>, peer: PeerId, locator: Option<String>) {
        let addr = locator.or_else(|| {
            let slot = peer.hub_slot(&self.cfg.mesh.hub_prefix)?;
            self.cfg.hub_addr(slot).map(str::to_string)
        });
        let host = self.clone();
        match addr {
            Some(addr) => {
                tokio::spawn(transport::dial(host, peer, addr));
            }
            None => {
                debug!(peer = %peer, "no address to dial");
                tokio::spawn(async move {
                    let actions = host.node.lock().await.on_connection_failed(&peer, now_ms());
                    host.execute(actions);
                });
            }
        }
    }

    fn route_stream(&self, event: StreamEvent) {
        let mut streams = locked(&self.streams);
        let id = event.request_id().to_string();
        let last = matches!(event, StreamEvent::End { .. } | StreamEvent::Error { .. });
        if let Some(tx) = streams.get(&id) {
            let _ = tx.send(event);
        }
        if last {
            streams.remove(&id);
        }
    }

    /// Route range events for `request_id` to the returned receiver. Register before opening.
    pub fn register_stream(&self, request_id: &str) -> mpsc::UnboundedReceiver<StreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        locked(&self.streams).insert(request_id.to_string(), tx);
        rx
    }

    pub fn unregister_stream(&self, request_id: &str) {
        locked(&self.streams).remove(request_id);
    }

    /// Add a connection to `peer`. With two connections to the same peer, the one
    /// dialled by the smaller id survives; returns `None` if this one loses.
    pub fn register_link(
        &self,
        peer: &PeerId,
        direction: Direction,
        tx: mpsc::UnboundedSender<Packet>,
    ) -> Option<LinkHandle> {
        let mut links = locked(&self.links);
        if let Some(existing) = links.get(peer) {
            let keep_existing = match (existing.direction, direction) {
                (_, Direction::HubInbound) => false,
                (Direction::HubInbound, _) => true,
                (a, b) if a == b => false,
                (existing_dir, _) => {
                    let we_dial = self.self_id < *peer;
                    (existing_dir == Direction::Outbound) == we_dial
                }
            };
            if keep_existing {
                debug!(peer = %peer, "duplicate connection dropped");
                return None;
            }
        }
        let (close_tx, close_rx) = oneshot::channel();
        let buffered = Arc::new(AtomicU64::new(0));
        let id = self.next_id();
        links.insert(
            peer.clone(),
            PeerLink {
                id,
                direction,
                tx,
                buffered: buffered.clone(),
                _close: close_tx,
            },
        );
        Some(LinkHandle {
            id,
            buffered,
            close: close_rx,
        })
    }

    /// Remove the link if `link_id` is still the current one for `peer`.
    pub fn unregister_link(&self, peer: &PeerId, link_id: u64) -> bool {
        let mut links = locked(&self.links);
        if links.get(peer).map(|l| l.id) == Some(link_id) {
            links.remove(peer);
            true
        } else {
            false
        }
    }

    pub fn set_hub_listener(&self, slot: usize, handle: AbortHandle) {
        if let Some(old) = locked(&self.hubs).insert(slot, handle) {
            old.abort();
        }
    }

    fn buffered_amounts(&self) -> Vec<(PeerId, u64)> {
        locked(&self.links)
            .iter()
            .map(|(p, l)| (p.clone(), l.buffered.load(Ordering::Relaxed)))
            .collect()
    }
}

/// Drive the node's timers: `tick` every second, send-queue drain every 100 ms.
pub async fn run_timers(host: Arc<Host>) {
    let mut tick = tokio::time::interval(TICK);
    let mut fast = tokio::time::interval(FAST_TICK);
    loop {
        let actions = tokio::select! {
            _ = tick.tick() => host.node.lock().await.tick(now_ms()),
            _ = fast.tick() => {
                let amounts = host.buffered_amounts();
                let mut node = host.node.lock().await;
                for (peer, amount) in &amounts {
                    node.set_buffered_amount(peer, *amount);
                }
                node.fast_tick(now_ms())
            }
        };
        host.execute(actions);
    }
}
