// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The surface the engine exposes to application services.
//!
//! For an incoming channel the engine first asks the handler for a
//! socket shape (`new_socket`), verifies the handshake, then lets the
//! handler veto the peer (`allow_connection`). Ownership of the
//! established socket is transferred through `connection_started`;
//! rejected or failed channels are reported through
//! `connection_failed`. Handlers run on the engine task and must not
//! block.

use crate::{
    crypto::session::HandshakeError,
    models::{identifier::Identifier, peer::Node},
    node::{socket::DatagramSocket, stream::StreamSocket},
};

/// The two channel flavors a service can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    /// Encrypted datagrams, no ordering or delivery guarantee.
    Datagram,
    /// Reliable ordered byte stream.
    Stream,
}

/// An established channel, handed to the service that accepted it.
#[derive(Debug)]
pub enum ServiceSocket {
    Datagram(DatagramSocket),
    Stream(StreamSocket),
}

impl ServiceSocket {
    pub fn peer(&self) -> Node {
        match self {
            ServiceSocket::Datagram(s) => s.peer(),
            ServiceSocket::Stream(s) => s.peer(),
        }
    }

    pub fn cookie(&self) -> Identifier {
        match self {
            ServiceSocket::Datagram(s) => s.cookie(),
            ServiceSocket::Stream(s) => s.cookie(),
        }
    }
}

/// Why an incoming channel never reached `connection_started`.
#[derive(Debug)]
pub struct FailedConnection {
    pub service: u16,
    pub cookie: Identifier,
    /// Present once the handshake verified far enough to name the peer.
    pub peer: Option<Node>,
    pub error: HandshakeError,
}

/// Gate keeper and dispatcher for incoming channels.
pub trait ServiceHandler: Send + Sync + 'static {
    /// Decides whether `service` exists and which socket shape it
    /// speaks. `None` closes the channel before any handshake work.
    fn new_socket(&mut self, service: u16) -> Option<SocketKind>;

    /// Policy check after the peer's identity has been verified.
    fn allow_connection(&mut self, service: u16, peer: &Node) -> bool;

    /// Transfers ownership of an established socket.
    fn connection_started(&mut self, socket: ServiceSocket);

    /// Reports a rejected or failed channel.
    fn connection_failed(&mut self, failed: FailedConnection);
}

/// Handler for nodes that only participate in the DHT and accept no
/// channels at all.
#[derive(Debug, Default)]
pub struct RejectAllServices;

impl ServiceHandler for RejectAllServices {
    fn new_socket(&mut self, _service: u16) -> Option<SocketKind> {
        None
    }

    fn allow_connection(&mut self, _service: u16, _peer: &Node) -> bool {
        false
    }

    fn connection_started(&mut self, _socket: ServiceSocket) {}

    fn connection_failed(&mut self, _failed: FailedConnection) {}
}
