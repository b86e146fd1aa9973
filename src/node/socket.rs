// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Shared core of an established channel, plus the datagram socket
//! flavor.
//!
//! The core owns the cipher state and the outgoing sequence counter and
//! frames every send as `cookie | seq | ciphertext`. Both socket
//! flavors embed it; the engine decrypts inbound traffic and forwards
//! the plaintext datagrams over a per-session channel.

use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use bytes::Bytes;
use tokio::{net::UdpSocket, sync::mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
    crypto::session::{CipherState, DecryptError},
    models::{
        identifier::Identifier,
        message::{SEC_MAX_DATA_SIZE, build_channel_packet},
        peer::Node,
    },
    node::engine::{EngineHandle, TrafficStats},
};

pub(crate) struct SessionCore {
    cookie: Identifier,
    peer: Node,
    service: u16,
    cipher: CipherState,
    /// Advances by the size of every datagram sent; only uniqueness
    /// matters for the IV derivation.
    out_seq: Mutex<u32>,
    socket: Arc<UdpSocket>,
    engine: EngineHandle,
    stats: Arc<TrafficStats>,
}

impl SessionCore {
    pub(crate) fn new(
        cookie: Identifier,
        peer: Node,
        service: u16,
        cipher: CipherState,
        socket: Arc<UdpSocket>,
        engine: EngineHandle,
        stats: Arc<TrafficStats>,
    ) -> Self {
        SessionCore {
            cookie,
            peer,
            service,
            cipher,
            out_seq: Mutex::new(0),
            socket,
            engine,
            stats,
        }
    }

    pub(crate) fn cookie(&self) -> Identifier {
        self.cookie
    }

    pub(crate) fn peer(&self) -> Node {
        self.peer
    }

    pub(crate) fn service(&self) -> u16 {
        self.service
    }

    pub(crate) fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    /// Encrypts and sends one channel datagram. A zero-length payload
    /// is the keepalive.
    pub(crate) async fn send_datagram(&self, plaintext: &[u8]) -> Result<()> {
        if plaintext.len() > SEC_MAX_DATA_SIZE {
            bail!(
                "datagram of {} bytes exceeds the {SEC_MAX_DATA_SIZE} byte bound",
                plaintext.len()
            );
        }
        let pkt = {
            let mut seq = self.out_seq.lock().expect("out_seq lock poisoned");
            let ciphertext = self.cipher.encrypt(*seq, plaintext);
            let pkt = build_channel_packet(&self.cookie, *seq, &ciphertext);
            *seq = seq.wrapping_add(pkt.len() as u32);
            pkt
        };
        self.socket
            .send_to(&pkt, self.peer.peer.socket_addr())
            .await?;
        self.stats.count_out(pkt.len());
        Ok(())
    }

    pub(crate) fn decrypt(&self, seq: u32, ciphertext: &[u8]) -> Result<Vec<u8>, DecryptError> {
        self.cipher.decrypt(seq, ciphertext)
    }
}

impl std::fmt::Debug for SessionCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCore")
            .field("cookie", &self.cookie)
            .field("peer", &self.peer)
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}

/// Encrypted datagram channel: unordered, unacknowledged, one
/// ciphertext per send.
#[derive(Debug)]
pub struct DatagramSocket {
    core: Arc<SessionCore>,
    rx: mpsc::Receiver<Bytes>,
    closed: CancellationToken,
}

impl DatagramSocket {
    pub(crate) fn new(core: Arc<SessionCore>, rx: mpsc::Receiver<Bytes>) -> Self {
        DatagramSocket {
            core,
            rx,
            closed: CancellationToken::new(),
        }
    }

    pub fn peer(&self) -> Node {
        self.core.peer()
    }

    pub fn cookie(&self) -> Identifier {
        self.core.cookie()
    }

    pub fn service(&self) -> u16 {
        self.core.service()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub async fn send_datagram(&self, data: &[u8]) -> Result<()> {
        if self.is_closed() {
            bail!("datagram socket is closed");
        }
        self.core.send_datagram(data).await
    }

    /// The next decrypted datagram; keepalives are filtered out. `None`
    /// once the channel is closed or evicted.
    pub async fn recv_datagram(&mut self) -> Option<Bytes> {
        loop {
            tokio::select! {
                _ = self.closed.cancelled() => return None,
                msg = self.rx.recv() => match msg {
                    None => return None,
                    Some(data) if data.is_empty() => continue,
                    Some(data) => return Some(data),
                },
            }
        }
    }

    /// Evicts the session from the engine. Idempotent.
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            self.closed.cancel();
            self.core.engine().close_session(self.core.cookie());
        }
    }
}

impl Drop for DatagramSocket {
    fn drop(&mut self) {
        self.close();
    }
}
