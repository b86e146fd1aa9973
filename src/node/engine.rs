// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The overlay engine: one task per node that owns the UDP socket, the
//! routing table, the pending-request table and the cookie -> session
//! router.
//!
//! Every received datagram is classified by its leading cookie: a match
//! in the pending table makes it a response, a match in the session
//! table makes it channel traffic, anything else is parsed as a
//! request. Timers drive request expiry (lookups advance to their next
//! candidate), bucket refresh and announcement upkeep.

use std::{
    collections::{HashMap, VecDeque},
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use anyhow::{Context, Result, bail, ensure};
use bytes::Bytes;
use dashmap::DashMap;
use tokio::{
    net::UdpSocket,
    sync::{mpsc, oneshot},
    time::interval,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    buckets::Buckets,
    cfg::config::Config,
    crypto::{
        identity::Identity,
        session::{CipherState, HandshakeError, SessionHandshake},
    },
    models::{
        identifier::{HASH_SIZE, Identifier},
        message::{
            K, MAX_MESSAGE_SIZE, MIN_MESSAGE_SIZE, MsgType, Request, ResultMsg,
            build_announce, build_find, build_ping, build_result, build_start_stream,
            build_start_stream_response, read_cookie,
        },
        peer::{Node, Peer},
    },
    node::{
        query::SearchQuery,
        service::{FailedConnection, ServiceHandler, ServiceSocket, SocketKind},
        socket::{DatagramSocket, SessionCore},
        stream::StreamSocket,
    },
};

/// Result of an iterative lookup.
#[derive(Debug, Clone)]
pub enum LookupOutcome {
    /// FIND_NODE located the target node itself.
    Found(Node),
    /// FIND_VALUE reached a node storing announcements for the target.
    FoundValue(Vec<Node>),
    /// The lookup exhausted its candidates; carries the nearest-K seen.
    NotFound(Vec<Node>),
}

/// Raw and per-second traffic counters of a node.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Bytes per second, refreshed once a second.
    pub in_rate: u64,
    pub out_rate: u64,
}

#[derive(Debug, Default)]
pub(crate) struct TrafficStats {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    in_rate: AtomicU64,
    out_rate: AtomicU64,
}

impl TrafficStats {
    pub(crate) fn count_in(&self, n: usize) {
        self.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn count_out(&self, n: usize) {
        self.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> Stats {
        Stats {
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            in_rate: self.in_rate.load(Ordering::Relaxed),
            out_rate: self.out_rate.load(Ordering::Relaxed),
        }
    }
}

enum Command {
    Ping(Ipv4Addr, u16),
    FindNode(Identifier, oneshot::Sender<LookupOutcome>),
    FindValue(Identifier, oneshot::Sender<LookupOutcome>),
    Announce(Identifier),
    StartChannel {
        service: u16,
        to: Node,
        kind: SocketKind,
        reply: oneshot::Sender<Result<ServiceSocket>>,
    },
    CloseSession(Identifier),
    Nodes(oneshot::Sender<Vec<Node>>),
    NumNodes(oneshot::Sender<usize>),
    Nearest(Identifier, usize, oneshot::Sender<Vec<Node>>),
}

/// Capability handed to sessions: enough to ask the engine to evict a
/// cookie, nothing more.
#[derive(Clone)]
pub(crate) struct EngineHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl EngineHandle {
    pub(crate) fn close_session(&self, cookie: Identifier) {
        let _ = self.tx.send(Command::CloseSession(cookie));
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FindKind {
    Node,
    Value,
}

struct Lookup {
    query: SearchQuery,
    /// Absent for internally started lookups (bootstrap, announce).
    reply: Option<oneshot::Sender<LookupOutcome>>,
}

struct PendingStream {
    service: u16,
    to: Node,
    kind: SocketKind,
    handshake: SessionHandshake,
    reply: oneshot::Sender<Result<ServiceSocket>>,
}

enum PendingKind {
    Ping,
    FindNode(Lookup),
    FindValue(Lookup),
    StartStream(Box<PendingStream>),
}

struct Pending {
    kind: PendingKind,
    created: Instant,
}

struct SessionRoute {
    core: Arc<SessionCore>,
    tx: mpsc::Sender<Bytes>,
    /// Cached for idempotent replies to duplicate handshakes; empty on
    /// the initiating side.
    handshake_response: Bytes,
}

struct Announcement {
    peer: Peer,
    at: Instant,
}

struct Engine {
    identity: Arc<Identity>,
    self_id: Identifier,
    cfg: Config,
    socket: Arc<UdpSocket>,
    buckets: Buckets,
    candidates: VecDeque<Peer>,
    /// data id -> owner id -> where and when it was announced.
    announcements: HashMap<Identifier, HashMap<Identifier, Announcement>>,
    /// Own data: id -> last time ANNOUNCE went out (None before the
    /// first broadcast).
    announced: HashMap<Identifier, Option<Instant>>,
    pending: HashMap<Identifier, Pending>,
    sessions: DashMap<Identifier, SessionRoute>,
    handler: Box<dyn ServiceHandler>,
    handle: EngineHandle,
    stats: Arc<TrafficStats>,
    shutdown: CancellationToken,
    /// Malformed / undecryptable datagrams seen so far.
    dropped: u64,
    last_bytes_in: u64,
    last_bytes_out: u64,
}

impl Engine {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let socket = Arc::clone(&self.socket);
        let shutdown = self.shutdown.clone();
        let mut buf = vec![0u8; 2 * MAX_MESSAGE_SIZE];
        let mut request_timer = interval(self.cfg.dht.request_check_interval);
        let mut node_timer = interval(self.cfg.dht.node_refresh_interval);
        let mut announcement_timer = interval(self.cfg.dht.announcement_interval);
        let mut rate_timer = interval(std::time::Duration::from_secs(1));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd).await,
                    None => break,
                },

                received = socket.recv_from(&mut buf) => match received {
                    Ok((n, from)) => self.on_datagram(&buf[..n], from).await,
                    Err(e) => warn!(error = %e, "UDP receive failed"),
                },

                _ = request_timer.tick() => self.check_request_timeouts().await,
                _ = node_timer.tick() => self.refresh_nodes().await,
                _ = announcement_timer.tick() => self.refresh_announcements().await,
                _ = rate_timer.tick() => self.update_rates(),
            }
        }

        debug!(id = %self.self_id, "engine stopped");
        // Dropping the session routes closes every pump quietly.
        self.sessions.clear();
    }

    async fn send_to(&self, msg: &[u8], peer: Peer) {
        match self.socket.send_to(msg, peer.socket_addr()).await {
            Ok(n) => self.stats.count_out(n),
            Err(e) => debug!(addr = %peer.addr, port = peer.port, error = %e,
                             "UDP send failed"),
        }
    }

    /*
     * Datagram classification.
     */

    async fn on_datagram(&mut self, buf: &[u8], from: SocketAddr) {
        self.stats.count_in(buf.len());
        let SocketAddr::V4(from) = from else {
            self.dropped += 1;
            return;
        };
        let peer = Peer::from(from);
        if buf.len() < MIN_MESSAGE_SIZE || buf.len() > MAX_MESSAGE_SIZE {
            self.dropped += 1;
            debug!(len = buf.len(), addr = %peer.addr, "dropping bad-sized datagram");
            return;
        }
        let Ok(cookie) = read_cookie(buf) else {
            self.dropped += 1;
            return;
        };
        let body = &buf[HASH_SIZE..];

        if let Some(pending) = self.pending.remove(&cookie) {
            self.on_response(cookie, pending, body, peer).await;
        } else if self.sessions.contains_key(&cookie) {
            self.on_channel_traffic(&cookie, body);
        } else {
            match Request::parse(body) {
                Ok(request) => self.on_request(cookie, request, peer).await,
                Err(e) => {
                    self.dropped += 1;
                    debug!(addr = %peer.addr, port = peer.port, error = %e,
                           "dropping malformed datagram");
                },
            }
        }
    }

    /*
     * Responses.
     */

    async fn on_response(
        &mut self,
        cookie: Identifier,
        pending: Pending,
        body: &[u8],
        peer: Peer,
    ) {
        match pending.kind {
            PendingKind::Ping => self.on_ping_response(body, peer).await,
            PendingKind::FindNode(lookup) => {
                self.on_find_response(FindKind::Node, lookup, body).await;
            },
            PendingKind::FindValue(lookup) => {
                self.on_find_response(FindKind::Value, lookup, body).await;
            },
            PendingKind::StartStream(ps) => {
                self.on_start_stream_response(cookie, *ps, body, peer);
            },
        }
    }

    async fn on_ping_response(&mut self, body: &[u8], peer: Peer) {
        let Ok(Request::Ping { sender }) = Request::parse(body) else {
            self.dropped += 1;
            debug!(addr = %peer.addr, "dropping malformed ping response");
            return;
        };
        debug!(id = %sender, addr = %peer.addr, port = peer.port, "node reachable");
        let bootstrapping = self.buckets.is_empty();
        self.buckets.add(sender, peer);
        if bootstrapping {
            // First contact: search for the own neighborhood.
            debug!("bootstrapping, searching for own identifier");
            self.start_lookup(FindKind::Node, self.self_id, None).await;
        }
    }

    async fn on_find_response(&mut self, kind: FindKind, mut lookup: Lookup, body: &[u8]) {
        match ResultMsg::parse(body) {
            Ok(result) => {
                if kind == FindKind::Value && result.success {
                    if let Some(reply) = lookup.reply {
                        let _ = reply.send(LookupOutcome::FoundValue(result.triples));
                    }
                    return;
                }
                for node in result.triples {
                    if node.id == self.self_id {
                        continue;
                    }
                    // Triples are hearsay until the node answers a ping.
                    self.buckets.add_candidate(node.id, node.peer);
                    lookup.query.update(node);
                }
                if kind == FindKind::Node
                    && lookup.query.found()
                    && let Some(first) = lookup.query.first().copied()
                {
                    debug!(id = %first.id, addr = %first.peer.addr,
                           port = first.peer.port, "node found");
                    if let Some(reply) = lookup.reply {
                        let _ = reply.send(LookupOutcome::Found(first));
                    }
                    return;
                }
            },
            Err(e) => {
                self.dropped += 1;
                debug!(error = %e, "malformed lookup response, advancing anyway");
            },
        }
        self.advance_lookup(kind, lookup).await;
    }

    fn on_start_stream_response(
        &mut self,
        cookie: Identifier,
        ps: PendingStream,
        body: &[u8],
        peer: Peer,
    ) {
        let Some((&success, blob)) = body.split_first() else {
            let _ = ps
                .reply
                .send(Err(HandshakeError::Truncated(body.len()).into()));
            return;
        };
        if success == 0 {
            let _ = ps.reply.send(Err(HandshakeError::ServiceRejected.into()));
            return;
        }
        let verified = match SessionHandshake::verify_peer(blob) {
            Ok(v) => v,
            Err(e) => {
                debug!(cookie = %cookie, error = %e, "handshake response rejected");
                let _ = ps.reply.send(Err(e.into()));
                return;
            },
        };
        if verified.identity.id() != ps.to.id {
            let e = HandshakeError::WrongPeer {
                expected: ps.to.id,
                got: verified.identity.id(),
            };
            debug!(cookie = %cookie, error = %e, "handshake response rejected");
            let _ = ps.reply.send(Err(e.into()));
            return;
        }
        let cipher = ps.handshake.derive(&verified.session_key);
        let peer_node = Node::new(ps.to.id, peer.addr, peer.port);
        let socket = self.establish_session(
            cookie,
            ps.kind,
            peer_node,
            ps.service,
            cipher,
            Bytes::new(),
        );
        info!(peer = %peer_node.id, service = ps.service, "channel established");
        let _ = ps.reply.send(Ok(socket));
    }

    /*
     * Requests.
     */

    async fn on_request(&mut self, cookie: Identifier, request: Request, peer: Peer) {
        match request {
            Request::Ping { sender } => {
                debug!(addr = %peer.addr, port = peer.port, "ping request");
                let pong = build_ping(&cookie, &self.self_id);
                self.send_to(&pong, peer).await;
                if !self.buckets.contains(&sender) && sender != self.self_id {
                    self.queue_candidate(peer).await;
                }
            },
            Request::FindNode { target } => {
                let best = self.buckets.nearest(&target, K);
                let response = build_result(&cookie, false, &best);
                self.send_to(&response, peer).await;
            },
            Request::FindValue { target } => {
                let owners: Vec<Node> = self
                    .announcements
                    .get(&target)
                    .map(|owners| {
                        owners
                            .iter()
                            .map(|(id, a)| Node { id: *id, peer: a.peer })
                            .collect()
                    })
                    .unwrap_or_default();
                let response = if owners.is_empty() {
                    build_result(&cookie, false, &self.buckets.nearest(&target, K))
                } else {
                    build_result(&cookie, true, &owners)
                };
                self.send_to(&response, peer).await;
            },
            Request::Announce { what, who } => self.on_announce(what, who, peer),
            Request::StartStream { service, handshake } => {
                self.on_start_stream_request(cookie, service, &handshake, peer)
                    .await;
            },
        }
    }

    fn on_announce(&mut self, what: Identifier, who: Identifier, peer: Peer) {
        // Store only when this node sits inside the K-neighborhood of
        // the announced identifier.
        let nearest = self.buckets.nearest(&what, K);
        let keep = nearest.len() < K
            || nearest
                .last()
                .is_some_and(|far| what.distance(&far.id) > what.distance(&self.self_id));
        if !keep {
            return;
        }
        debug!(what = %what, who = %who, "storing announcement");
        self.announcements.entry(what).or_default().insert(
            who,
            Announcement {
                peer,
                at: Instant::now(),
            },
        );
    }

    async fn on_start_stream_request(
        &mut self,
        cookie: Identifier,
        service: u16,
        handshake: &[u8],
        peer: Peer,
    ) {
        // A lost response makes the initiator resend its handshake;
        // answer with the cached response instead of resetting state.
        if let Some(route) = self.sessions.get(&cookie) {
            if !route.handshake_response.is_empty() {
                let response = route.handshake_response.clone();
                drop(route);
                debug!(cookie = %cookie, "duplicate handshake, resending response");
                self.send_to(&response, peer).await;
            }
            return;
        }

        let Some(socket_kind) = self.handler.new_socket(service) else {
            debug!(service, addr = %peer.addr, "no such service, closing channel");
            self.send_to(&build_start_stream_response(&cookie, false, &[]), peer)
                .await;
            self.handler.connection_failed(FailedConnection {
                service,
                cookie,
                peer: None,
                error: HandshakeError::ServiceRejected,
            });
            return;
        };

        let verified = match SessionHandshake::verify_peer(handshake) {
            Ok(v) => v,
            Err(error) => {
                debug!(service, error = %error, "handshake verification failed");
                self.send_to(&build_start_stream_response(&cookie, false, &[]), peer)
                    .await;
                self.handler.connection_failed(FailedConnection {
                    service,
                    cookie,
                    peer: None,
                    error,
                });
                return;
            },
        };
        let peer_node = Node::new(verified.identity.id(), peer.addr, peer.port);

        if !self.handler.allow_connection(service, &peer_node) {
            debug!(service, peer = %peer_node.id, "connection denied by policy");
            self.send_to(&build_start_stream_response(&cookie, false, &[]), peer)
                .await;
            self.handler.connection_failed(FailedConnection {
                service,
                cookie,
                peer: Some(peer_node),
                error: HandshakeError::ServiceRejected,
            });
            return;
        }

        let ours = match SessionHandshake::build(&self.identity) {
            Ok(hs) => hs,
            Err(e) => {
                warn!(error = %e, "failed to build handshake");
                return;
            },
        };
        let response = build_start_stream_response(&cookie, true, ours.blob());
        let cipher = ours.derive(&verified.session_key);
        self.send_to(&response, peer).await;
        let socket = self.establish_session(
            cookie,
            socket_kind,
            peer_node,
            service,
            cipher,
            response,
        );
        info!(peer = %peer_node.id, service, "incoming channel established");
        self.handler.connection_started(socket);
    }

    /*
     * Channel traffic.
     */

    fn on_channel_traffic(&mut self, cookie: &Identifier, body: &[u8]) {
        if body.len() < 4 {
            self.dropped += 1;
            return;
        }
        let seq = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        let Some(route) = self.sessions.get(cookie) else {
            return;
        };
        match route.core.decrypt(seq, &body[4..]) {
            Ok(plaintext) => {
                // A slow consumer drops datagrams, as UDP would.
                let _ = route.tx.try_send(Bytes::from(plaintext));
            },
            Err(e) => {
                self.dropped += 1;
                debug!(cookie = %cookie, error = %e, "dropping undecryptable datagram");
            },
        }
    }

    fn establish_session(
        &mut self,
        cookie: Identifier,
        kind: SocketKind,
        peer: Node,
        service: u16,
        cipher: CipherState,
        handshake_response: Bytes,
    ) -> ServiceSocket {
        let (tx, rx) = mpsc::channel(64);
        let core = Arc::new(SessionCore::new(
            cookie,
            peer,
            service,
            cipher,
            Arc::clone(&self.socket),
            self.handle.clone(),
            Arc::clone(&self.stats),
        ));
        let socket = match kind {
            SocketKind::Stream => ServiceSocket::Stream(StreamSocket::spawn(
                Arc::clone(&core),
                self.cfg.stream_timers(),
                rx,
            )),
            SocketKind::Datagram => {
                ServiceSocket::Datagram(DatagramSocket::new(Arc::clone(&core), rx))
            },
        };
        self.sessions.insert(
            cookie,
            SessionRoute {
                core,
                tx,
                handshake_response,
            },
        );
        socket
    }

    /*
     * Lookups.
     */

    async fn start_lookup(
        &mut self,
        kind: FindKind,
        target: Identifier,
        reply: Option<oneshot::Sender<LookupOutcome>>,
    ) {
        let mut query = SearchQuery::new(target);
        query.seed(self.buckets.nearest(&target, K));
        let lookup = Lookup { query, reply };
        self.advance_lookup(kind, lookup).await;
    }

    async fn advance_lookup(&mut self, kind: FindKind, mut lookup: Lookup) {
        match lookup.query.next() {
            Some(next) => self.send_find(kind, next, lookup).await,
            None => self.finish_lookup(kind, lookup).await,
        }
    }

    async fn send_find(&mut self, kind: FindKind, to: Node, lookup: Lookup) {
        let cookie = Identifier::random();
        let ty = match kind {
            FindKind::Node => MsgType::FindNode,
            FindKind::Value => MsgType::FindValue,
        };
        debug!(target = %lookup.query.target(), to = %to.id, "sending lookup request");
        let msg = build_find(&cookie, ty, lookup.query.target());
        let pending_kind = match kind {
            FindKind::Node => PendingKind::FindNode(lookup),
            FindKind::Value => PendingKind::FindValue(lookup),
        };
        self.pending.insert(
            cookie,
            Pending {
                kind: pending_kind,
                created: Instant::now(),
            },
        );
        self.send_to(&msg, to.peer).await;
    }

    async fn finish_lookup(&mut self, kind: FindKind, lookup: Lookup) {
        let target = *lookup.query.target();
        if kind == FindKind::Node && self.announced.contains_key(&target) {
            // The lookup converged on the data id's neighborhood: hand
            // the announcement to the best nodes seen.
            let best = lookup.query.best().to_vec();
            debug!(what = %target, n = best.len(), "announcing to nearest nodes");
            for node in &best {
                let msg = build_announce(&Identifier::random(), &target, &self.self_id);
                self.send_to(&msg, node.peer).await;
            }
            self.announced.insert(target, Some(Instant::now()));
        } else {
            debug!(target = %target, "lookup exhausted without result");
        }
        if let Some(reply) = lookup.reply {
            let _ = reply.send(LookupOutcome::NotFound(lookup.query.best().to_vec()));
        }
    }

    /*
     * Commands from the public handle.
     */

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Ping(addr, port) => self.send_ping(Peer::new(addr, port)).await,
            Command::FindNode(id, reply) => {
                self.start_lookup(FindKind::Node, id, Some(reply)).await;
            },
            Command::FindValue(id, reply) => {
                self.start_lookup(FindKind::Value, id, Some(reply)).await;
            },
            Command::Announce(id) => {
                debug!(what = %id, "announcing data");
                self.announced.entry(id).or_insert(None);
                self.start_lookup(FindKind::Node, id, None).await;
            },
            Command::StartChannel {
                service,
                to,
                kind,
                reply,
            } => self.start_channel(service, to, kind, reply).await,
            Command::CloseSession(cookie) => {
                if self.sessions.remove(&cookie).is_some() {
                    debug!(cookie = %cookie, "session evicted");
                }
            },
            Command::Nodes(reply) => {
                let _ = reply.send(self.buckets.nodes());
            },
            Command::NumNodes(reply) => {
                let _ = reply.send(self.buckets.num_nodes());
            },
            Command::Nearest(target, k, reply) => {
                let _ = reply.send(self.buckets.nearest(&target, k));
            },
        }
    }

    async fn send_ping(&mut self, peer: Peer) {
        let cookie = Identifier::random();
        debug!(addr = %peer.addr, port = peer.port, "sending ping");
        self.pending.insert(
            cookie,
            Pending {
                kind: PendingKind::Ping,
                created: Instant::now(),
            },
        );
        let msg = build_ping(&cookie, &self.self_id);
        self.send_to(&msg, peer).await;
    }

    async fn start_channel(
        &mut self,
        service: u16,
        to: Node,
        kind: SocketKind,
        reply: oneshot::Sender<Result<ServiceSocket>>,
    ) {
        let handshake = match SessionHandshake::build(&self.identity) {
            Ok(hs) => hs,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            },
        };
        let cookie = Identifier::random();
        let msg = build_start_stream(&cookie, service, handshake.blob());
        debug!(peer = %to.id, service, cookie = %cookie, "opening channel");
        self.pending.insert(
            cookie,
            Pending {
                kind: PendingKind::StartStream(Box::new(PendingStream {
                    service,
                    to,
                    kind,
                    handshake,
                    reply,
                })),
                created: Instant::now(),
            },
        );
        self.send_to(&msg, to.peer).await;
    }

    /*
     * Timers.
     */

    async fn check_request_timeouts(&mut self) {
        let deadline = self.cfg.dht.request_timeout;
        let expired: Vec<Identifier> = self
            .pending
            .iter()
            .filter(|(_, p)| p.created.elapsed() > deadline)
            .map(|(cookie, _)| *cookie)
            .collect();
        for cookie in expired {
            let Some(pending) = self.pending.remove(&cookie) else {
                continue;
            };
            match pending.kind {
                PendingKind::Ping => debug!(cookie = %cookie, "ping timed out"),
                PendingKind::FindNode(lookup) => {
                    self.advance_lookup(FindKind::Node, lookup).await;
                },
                PendingKind::FindValue(lookup) => {
                    self.advance_lookup(FindKind::Value, lookup).await;
                },
                PendingKind::StartStream(ps) => {
                    debug!(peer = %ps.to.id, "channel handshake timed out");
                    let _ = ps
                        .reply
                        .send(Err(anyhow::anyhow!("channel handshake timed out")));
                },
            }
        }
        self.ping_candidates().await;
    }

    async fn refresh_nodes(&mut self) {
        let stale = self.buckets.older_than(self.cfg.dht.ping_age);
        if !stale.is_empty() {
            debug!(n = stale.len(), "refreshing stale bucket entries");
        }
        for node in stale {
            self.send_ping(node.peer).await;
        }
        self.buckets.remove_older_than(self.cfg.dht.evict_age);
        self.ping_candidates().await;
    }

    async fn refresh_announcements(&mut self) {
        // Forget foreign announcements past their lifetime.
        let expiry = self.cfg.dht.announcement_expiry;
        for owners in self.announcements.values_mut() {
            owners.retain(|_, a| a.at.elapsed() <= expiry);
        }
        self.announcements.retain(|_, owners| !owners.is_empty());

        // Refresh own data.
        let reannounce = self.cfg.dht.reannounce_age;
        let due: Vec<Identifier> = self
            .announced
            .iter()
            .filter(|(_, at)| at.is_none_or(|at| at.elapsed() > reannounce))
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            debug!(what = %id, "re-announcing data");
            self.start_lookup(FindKind::Node, id, None).await;
        }
    }

    async fn queue_candidate(&mut self, peer: Peer) {
        if self.candidates.len() < self.cfg.dht.candidate_limit {
            self.candidates.push_back(peer);
        }
        // Verify promptly so freshly met peers become routable.
        self.ping_candidates().await;
    }

    async fn ping_candidates(&mut self) {
        while let Some(peer) = self.candidates.pop_front() {
            self.send_ping(peer).await;
        }
    }

    fn update_rates(&mut self) {
        let now = self.stats.snapshot();
        self.stats
            .in_rate
            .store(now.bytes_in - self.last_bytes_in, Ordering::Relaxed);
        self.stats
            .out_rate
            .store(now.bytes_out - self.last_bytes_out, Ordering::Relaxed);
        self.last_bytes_in = now.bytes_in;
        self.last_bytes_out = now.bytes_out;
    }
}

/// Public handle of a running overlay node. Cloneable; the engine task
/// stops once [`OverlayNode::shutdown`] is called.
#[derive(Clone)]
pub struct OverlayNode {
    handle: EngineHandle,
    local_id: Identifier,
    local_addr: SocketAddr,
    stats: Arc<TrafficStats>,
    shutdown: CancellationToken,
}

impl OverlayNode {
    /// Binds the UDP socket, spawns the engine task and pings the
    /// configured bootstrap peers.
    pub async fn start(
        cfg: Config,
        identity: Identity,
        handler: Box<dyn ServiceHandler>,
    ) -> Result<OverlayNode> {
        ensure!(
            identity.has_private_key(),
            "a node identity needs its private key to answer handshakes"
        );
        let socket = UdpSocket::bind((cfg.node.bind_address, cfg.node.port))
            .await
            .with_context(|| {
                format!(
                    "cannot bind UDP {}:{}",
                    cfg.node.bind_address, cfg.node.port
                )
            })?;
        let local_addr = socket.local_addr()?;
        let self_id = identity.id();
        info!(id = %self_id, addr = %local_addr, "starting overlay node");

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = EngineHandle { tx };
        let stats = Arc::new(TrafficStats::default());
        let shutdown = CancellationToken::new();
        let bootstrap = cfg.node.bootstrap.clone();

        let engine = Engine {
            identity: Arc::new(identity),
            self_id,
            cfg,
            socket: Arc::new(socket),
            buckets: Buckets::new(self_id),
            candidates: VecDeque::new(),
            announcements: HashMap::new(),
            announced: HashMap::new(),
            pending: HashMap::new(),
            sessions: DashMap::new(),
            handler,
            handle: handle.clone(),
            stats: Arc::clone(&stats),
            shutdown: shutdown.clone(),
            dropped: 0,
            last_bytes_in: 0,
            last_bytes_out: 0,
        };
        tokio::spawn(engine.run(rx));

        let node = OverlayNode {
            handle,
            local_id: self_id,
            local_addr,
            stats,
            shutdown,
        };
        for entry in bootstrap {
            match SocketAddrV4::from_str(&entry) {
                Ok(sa) => node.ping(*sa.ip(), sa.port()),
                Err(e) => warn!(entry = %entry, error = %e, "skipping bad bootstrap address"),
            }
        }
        Ok(node)
    }

    pub fn local_id(&self) -> Identifier {
        self.local_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Sends a ping; a reply adds the peer to the routing table.
    pub fn ping(&self, addr: Ipv4Addr, port: u16) {
        let _ = self.handle.tx.send(Command::Ping(addr, port));
    }

    /// Iterative FIND_NODE for `id`.
    pub async fn find_node(&self, id: Identifier) -> Result<LookupOutcome> {
        let (tx, rx) = oneshot::channel();
        self.handle
            .tx
            .send(Command::FindNode(id, tx))
            .map_err(|_| anyhow::anyhow!("engine stopped"))?;
        rx.await.context("engine dropped the lookup")
    }

    /// Iterative FIND_VALUE for `id`.
    pub async fn find_value(&self, id: Identifier) -> Result<LookupOutcome> {
        let (tx, rx) = oneshot::channel();
        self.handle
            .tx
            .send(Command::FindValue(id, tx))
            .map_err(|_| anyhow::anyhow!("engine stopped"))?;
        rx.await.context("engine dropped the lookup")
    }

    /// Announces that this node provides the data named `id`; refreshed
    /// periodically until shutdown.
    pub fn announce(&self, id: Identifier) {
        let _ = self.handle.tx.send(Command::Announce(id));
    }

    /// Opens an encrypted channel of the given shape to `to`.
    pub async fn start_channel(
        &self,
        service: u16,
        to: Node,
        kind: SocketKind,
    ) -> Result<ServiceSocket> {
        let (tx, rx) = oneshot::channel();
        self.handle
            .tx
            .send(Command::StartChannel {
                service,
                to,
                kind,
                reply: tx,
            })
            .map_err(|_| anyhow::anyhow!("engine stopped"))?;
        rx.await.context("engine dropped the channel")?
    }

    /// Convenience wrapper opening a reliable stream.
    pub async fn start_stream(&self, service: u16, to: Node) -> Result<StreamSocket> {
        match self.start_channel(service, to, SocketKind::Stream).await? {
            ServiceSocket::Stream(stream) => Ok(stream),
            ServiceSocket::Datagram(_) => bail!("engine returned the wrong socket kind"),
        }
    }

    /// Evicts a channel by cookie; subsequent traffic for it is
    /// dropped. Sockets normally do this themselves on close.
    pub fn close_channel(&self, cookie: Identifier) {
        self.handle.close_session(cookie);
    }

    pub async fn nodes(&self) -> Result<Vec<Node>> {
        let (tx, rx) = oneshot::channel();
        self.handle
            .tx
            .send(Command::Nodes(tx))
            .map_err(|_| anyhow::anyhow!("engine stopped"))?;
        rx.await.context("engine stopped")
    }

    pub async fn num_nodes(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.handle
            .tx
            .send(Command::NumNodes(tx))
            .map_err(|_| anyhow::anyhow!("engine stopped"))?;
        rx.await.context("engine stopped")
    }

    /// The up-to-`k` known nodes nearest to `id`.
    pub async fn nearest(&self, id: Identifier, k: usize) -> Result<Vec<Node>> {
        let (tx, rx) = oneshot::channel();
        self.handle
            .tx
            .send(Command::Nearest(id, k, tx))
            .map_err(|_| anyhow::anyhow!("engine stopped"))?;
        rx.await.context("engine stopped")
    }

    pub fn stats(&self) -> Stats {
        self.stats.snapshot()
    }

    /// Stops the engine task and closes every session.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for OverlayNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayNode")
            .field("id", &self.local_id)
            .field("addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}
