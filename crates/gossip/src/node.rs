//! Gossip node
//!
//! One task accepts peers, bounded by a semaphore, and serves each inbound
//! connection until the peer hangs up. Outbound traffic to a peer goes through
//! a single persistent link task fed by a channel.

use crate::{
    error::{GossipError, Result},
    peer_set::PeerSet,
    types::{Action, Header, PeerMessage, DEFAULT_GOSSIP_PORT, PROTOCOL_VERSION, SELF_REJECTION},
};
use chrono::{DateTime, Utc};
use futures::{
    future::{join_all, BoxFuture},
    FutureExt, SinkExt, StreamExt,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};
use storm_engine::{EpochSchedule, DEFAULT_EPOCH_SECS};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot, Semaphore},
};
use tokio_tungstenite::{accept_async, client_async, tungstenite::Message, WebSocketStream};

/// Clock offset tolerated before warning
const MAX_DRIFT_MILLIS: i64 = 1_000;

/// A request queued on a link, with the slot for its reply
type Exchange = (Action, oneshot::Sender<Result<PeerMessage>>);

/// Gossip configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipConfig {
    pub listen_addr: SocketAddr,
    /// Peers (`host:port`) contacted at startup
    pub bootstrap: Vec<String>,
    /// Inbound connections served at once
    pub max_connections: usize,
    /// Epoch length used to answer `RelayTps`
    pub epoch_secs: u64,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_GOSSIP_PORT)),
            bootstrap: Vec::new(),
            max_connections: 64,
            epoch_secs: DEFAULT_EPOCH_SECS,
        }
    }
}

/// Unstarted gossip node
pub struct GossipNode {
    config: GossipConfig,
    node_id: u64,
}

impl GossipNode {
    pub fn new(config: GossipConfig) -> Self {
        Self {
            config,
            node_id: rand::random(),
        }
    }

    pub fn with_node_id(mut self, node_id: u64) -> Self {
        self.node_id = node_id;
        self
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    /// Bind the listener, start accepting peers and contact the bootstrap list
    pub async fn start(self) -> Result<GossipHandle> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(
            "Gossip listening on {} (node id {:016x})",
            local_addr,
            self.node_id
        );

        let handle = GossipHandle {
            shared: Arc::new(Shared {
                header: Header::new(self.node_id, local_addr.port()),
                local_addr,
                schedule: EpochSchedule::from_secs(self.config.epoch_secs),
                peers: PeerSet::new(),
                links: Mutex::new(HashMap::new()),
                dialing: Mutex::new(HashSet::new()),
                connections: Arc::new(Semaphore::new(self.config.max_connections.max(1))),
            }),
        };

        tokio::spawn(accept_loop(listener, handle.clone()));

        for entry in &self.config.bootstrap {
            let entry = with_default_port(entry);
            let resolved = tokio::net::lookup_host(entry.as_str()).await;
            match resolved {
                Ok(mut addrs) => match addrs.next() {
                    Some(addr) => {
                        tokio::spawn(handle.discover(addr));
                    }
                    None => tracing::warn!("Bootstrap peer {} has no address", entry),
                },
                Err(e) => tracing::warn!("Cannot resolve bootstrap peer {}: {}", entry, e),
            }
        }

        Ok(handle)
    }
}

struct Shared {
    header: Header,
    local_addr: SocketAddr,
    schedule: EpochSchedule,
    peers: PeerSet,
    links: Mutex<HashMap<SocketAddr, mpsc::Sender<Exchange>>>,
    /// Addresses with a discovery in flight
    dialing: Mutex<HashSet<SocketAddr>>,
    connections: Arc<Semaphore>,
}

/// Running gossip node
#[derive(Clone)]
pub struct GossipHandle {
    shared: Arc<Shared>,
}

impl GossipHandle {
    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn node_id(&self) -> u64 {
        self.shared.header.node_id
    }

    pub fn peer_set(&self) -> &PeerSet {
        &self.shared.peers
    }

    pub fn peers(&self) -> Vec<SocketAddr> {
        self.shared.peers.snapshot()
    }

    /// Ask `addr` for its peers, then do the same for every address it knows
    /// that we do not.
    pub fn discover(&self, addr: SocketAddr) -> BoxFuture<'static, ()> {
        let node = self.clone();
        async move {
            let peers = &node.shared.peers;
            if peers.is_self(&addr) || peers.contains(&addr) {
                return;
            }
            if !node.shared.dialing.lock().insert(addr) {
                return;
            }
            let reply = node.request(addr, Action::GetPeers).await;
            node.shared.dialing.lock().remove(&addr);

            match reply {
                Ok(PeerMessage::Peers(list)) => {
                    if peers.insert(addr) {
                        tracing::info!("Added peer {} ({} known)", addr, peers.len());
                    }
                    let fresh: Vec<SocketAddr> = list
                        .iter()
                        .filter_map(|entry| match entry.parse::<SocketAddr>() {
                            Ok(peer) => Some(peer),
                            Err(_) => {
                                tracing::warn!("Peer {} sent a bad address {:?}", addr, entry);
                                None
                            }
                        })
                        .filter(|peer| !peers.contains(peer) && !peers.is_self(peer))
                        .collect();
                    join_all(fresh.into_iter().map(|peer| node.discover(peer))).await;
                }
                Ok(PeerMessage::Rejected(reason)) if reason == SELF_REJECTION => {
                    tracing::debug!("{} is this node", addr);
                    peers.mark_self(addr);
                    node.shared.links.lock().remove(&addr);
                }
                Ok(PeerMessage::Rejected(reason)) => {
                    tracing::warn!("Peer {} rejected discovery: {}", addr, reason)
                }
                Ok(other) => {
                    tracing::warn!("Peer {} answered GetPeers with {}", addr, other.kind())
                }
                Err(e) => tracing::warn!("Peer {} unreachable: {}", addr, e),
            }
        }
        .boxed()
    }

    /// Send our throughput to every known peer. Returns how many answered.
    ///
    /// Each answer carries the peer's next deadline and clock, which are
    /// checked against ours.
    pub async fn relay_tps(&self, tps: f64) -> usize {
        let peers = self.peers();
        let replies = join_all(peers.iter().map(|&addr| async move {
            let sent = Utc::now();
            let reply = self.request(addr, Action::RelayTps { tps }).await;
            (addr, sent, Utc::now(), reply)
        }))
        .await;

        let mut acknowledged = 0;
        for (addr, sent, received, reply) in replies {
            match reply {
                Ok(PeerMessage::Deadline {
                    next_deadline_millis,
                    sent_at_millis,
                }) => {
                    acknowledged += 1;
                    self.check_clock(addr, sent, received, next_deadline_millis, sent_at_millis);
                }
                Ok(PeerMessage::Rejected(reason)) => {
                    tracing::warn!("Peer {} rejected TPS relay: {}", addr, reason)
                }
                Ok(other) => {
                    tracing::warn!("Peer {} answered RelayTps with {}", addr, other.kind())
                }
                Err(e) => tracing::warn!("TPS relay to {} failed: {}", addr, e),
            }
        }
        tracing::debug!("Relayed {:.2} TPS to {}/{} peers", tps, acknowledged, peers.len());
        acknowledged
    }

    /// Send one request over the persistent link to `addr`
    pub async fn request(&self, addr: SocketAddr, action: Action) -> Result<PeerMessage> {
        let link = self.link(addr).await?;
        let (tx, rx) = oneshot::channel();
        let result = match link.send((action, tx)).await {
            Ok(()) => rx.await.unwrap_or(Err(GossipError::ConnectionClosed)),
            Err(_) => Err(GossipError::ConnectionClosed),
        };
        if result.is_err() {
            let mut links = self.shared.links.lock();
            if links.get(&addr).is_some_and(|l| l.same_channel(&link)) {
                links.remove(&addr);
            }
        }
        result
    }

    async fn link(&self, addr: SocketAddr) -> Result<mpsc::Sender<Exchange>> {
        let existing = self
            .shared
            .links
            .lock()
            .get(&addr)
            .filter(|link| !link.is_closed())
            .cloned();
        if let Some(link) = existing {
            return Ok(link);
        }

        let stream = TcpStream::connect(addr).await?;
        let local = SocketAddr::new(stream.local_addr()?.ip(), self.shared.header.listen_port);
        if self.shared.peers.set_local(local) {
            tracing::info!("Local address is {}", local);
        }
        let (ws, _) = client_async(format!("ws://{}", addr), stream).await?;
        tracing::debug!("Connected to peer {}", addr);

        let (tx, rx) = mpsc::channel(32);
        self.shared.links.lock().insert(addr, tx.clone());
        tokio::spawn(run_link(ws, rx, self.shared.header));
        Ok(tx)
    }

    async fn serve(&self, stream: TcpStream, remote: SocketAddr) -> Result<()> {
        let mut ws = accept_async(stream).await?;
        while let Some(msg) = ws.next().await {
            match msg? {
                Message::Binary(data) => {
                    let reply = self.answer(remote, &data);
                    ws.send(Message::Binary(reply.to_bytes()?)).await?;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        tracing::debug!("Peer {} disconnected", remote);
        Ok(())
    }

    fn answer(&self, remote: SocketAddr, data: &[u8]) -> PeerMessage {
        let (header, action) = match PeerMessage::from_bytes(data) {
            Ok(PeerMessage::Request { header, action }) => (header, action),
            Ok(other) => {
                return PeerMessage::Rejected(format!("expected a request, got {}", other.kind()))
            }
            Err(e) => {
                tracing::warn!("Peer {}: {}", remote, e);
                return PeerMessage::Rejected("malformed request".to_string());
            }
        };

        if header.version != PROTOCOL_VERSION {
            let err = GossipError::VersionMismatch {
                ours: PROTOCOL_VERSION,
                theirs: header.version,
            };
            tracing::warn!("Peer {}: {}", remote, err);
            return PeerMessage::Rejected(err.to_string());
        }
        if header.node_id == self.shared.header.node_id {
            return PeerMessage::Rejected(SELF_REJECTION.to_string());
        }

        // The requester is reachable on its advertised port
        let requester = SocketAddr::new(remote.ip(), header.listen_port);
        let peers = &self.shared.peers;
        if !peers.contains(&requester) && !peers.is_self(&requester) {
            tokio::spawn(self.discover(requester));
        }

        match action {
            Action::GetPeers => {
                PeerMessage::Peers(self.peers().iter().map(|p| p.to_string()).collect())
            }
            Action::RelayTps { tps } => {
                tracing::info!("Peer {} published at {:.2} TPS", requester, tps);
                let now = Utc::now();
                let next_deadline = self.shared.schedule.next_deadline(now);
                PeerMessage::Deadline {
                    next_deadline_millis: next_deadline.timestamp_millis(),
                    sent_at_millis: now.timestamp_millis(),
                }
            }
        }
    }

    fn check_clock(
        &self,
        addr: SocketAddr,
        sent: DateTime<Utc>,
        received: DateTime<Utc>,
        next_deadline_millis: i64,
        sent_at_millis: i64,
    ) {
        let ours = self.shared.schedule.next_deadline(received).timestamp_millis();
        if ours != next_deadline_millis {
            tracing::warn!(
                "Peer {} expects the next deadline at {} ms, ours is {} ms",
                addr,
                next_deadline_millis,
                ours
            );
        }
        let offset = clock_offset(
            sent.timestamp_millis(),
            received.timestamp_millis(),
            sent_at_millis,
        );
        if offset.abs() > MAX_DRIFT_MILLIS {
            tracing::warn!(
                "Peer {} clock is off by {} ms, deadlines will not line up (check NTP)",
                addr,
                offset
            );
        }
    }
}

async fn accept_loop(listener: TcpListener, node: GossipHandle) {
    loop {
        let permit = match node.shared.connections.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        match listener.accept().await {
            Ok((stream, remote)) => {
                tracing::debug!("Peer connected from {}", remote);
                let node = node.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = node.serve(stream, remote).await {
                        tracing::warn!("Peer connection {} error: {}", remote, e);
                    }
                });
            }
            Err(e) => tracing::error!("Accept error: {}", e),
        }
    }
}

/// Serve queued requests in order until one fails or every sender is gone
async fn run_link(
    mut ws: WebSocketStream<TcpStream>,
    mut rx: mpsc::Receiver<Exchange>,
    header: Header,
) {
    while let Some((action, reply)) = rx.recv().await {
        let result = exchange(&mut ws, header, action).await;
        let failed = result.is_err();
        let _ = reply.send(result);
        if failed {
            break;
        }
    }
    let _ = ws.close(None).await;
}

async fn exchange(
    ws: &mut WebSocketStream<TcpStream>,
    header: Header,
    action: Action,
) -> Result<PeerMessage> {
    let request = PeerMessage::Request { header, action };
    ws.send(Message::Binary(request.to_bytes()?)).await?;
    while let Some(msg) = ws.next().await {
        match msg? {
            Message::Binary(data) => return PeerMessage::from_bytes(&data),
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err(GossipError::ConnectionClosed)
}

/// Peer clock minus ours at the moment it replied, assuming a symmetric path
fn clock_offset(sent: i64, received: i64, peer_now: i64) -> i64 {
    peer_now - (sent + (received - sent) / 2)
}

fn with_default_port(entry: &str) -> String {
    if entry.contains(':') {
        entry.to_string()
    } else {
        format!("{}:{}", entry, DEFAULT_GOSSIP_PORT)
    }
}
