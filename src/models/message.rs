// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Wire format of the DHT layer.
//!
//! Every overlay datagram starts with a 20-byte cookie. A datagram whose
//! cookie matches an outstanding request is a response; one whose cookie
//! matches an established channel is session traffic; anything else is
//! parsed as a request with a type byte right after the cookie:
//!
//! ```text
//! PING          cookie[20] | 0x01 | sender_id[20]            = 41 B
//! FIND_NODE     cookie[20] | 0x02 | target[20]               = 41 B
//! FIND_VALUE    cookie[20] | 0x03 | target[20]               = 41 B
//! ANNOUNCE      cookie[20] | 0x04 | what[20] | who[20]       = 61 B
//! START_STREAM  cookie[20] | 0x05 | service[2] | handshake   variable
//! RESULT        cookie[20] | success[1] | triple[26] * n     n <= K
//! ```
//!
//! Integers are big-endian. A PING is answered by echoing the request
//! shape with the responder's identifier; ANNOUNCE is never answered.

use std::net::Ipv4Addr;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U16,
    Unaligned,
};

use crate::models::{
    identifier::{HASH_SIZE, Identifier},
    peer::Node,
};

/// Maximum UDP payload of an overlay datagram.
pub const MAX_MESSAGE_SIZE: usize = 1024;
/// Anything shorter than a cookie cannot be a message.
pub const MIN_MESSAGE_SIZE: usize = HASH_SIZE;
/// Size of one `(id, ipv4, port)` triple.
pub const TRIPLE_SIZE: usize = HASH_SIZE + 4 + 2;
/// Upper bound on triples in one RESULT datagram.
pub const MAX_TRIPLES: usize = (MAX_MESSAGE_SIZE - HASH_SIZE - 1) / TRIPLE_SIZE;
/// Bucket size; a full bucket always fits into one RESULT datagram.
pub const K: usize = if MAX_TRIPLES < 8 { MAX_TRIPLES } else { 8 };

/// Maximum payload of a channel datagram after the cookie.
pub const MAX_DATA_SIZE: usize = MAX_MESSAGE_SIZE - HASH_SIZE;
/// Maximum plaintext of one secure datagram: a hash-size slice is
/// reserved so the padded ciphertext plus cookie and sequence number
/// never exceed `MAX_MESSAGE_SIZE`.
pub const SEC_MAX_DATA_SIZE: usize = MAX_DATA_SIZE - HASH_SIZE;
/// Maximum application bytes in one stream DATA frame (type + seq take 5).
pub const MAX_STREAM_PAYLOAD: usize = SEC_MAX_DATA_SIZE - 5;

/// Request type byte, located right after the cookie.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Ping = 0x01,
    FindNode = 0x02,
    FindValue = 0x03,
    Announce = 0x04,
    StartStream = 0x05,
}

impl MsgType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x01 => Self::Ping,
            0x02 => Self::FindNode,
            0x03 => Self::FindValue,
            0x04 => Self::Announce,
            0x05 => Self::StartStream,
            _ => return None,
        })
    }
}

/// Raised while decoding a datagram; the packet is dropped and counted.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("datagram too short: {0} bytes")]
    TooShort(usize),
    #[error("unknown message type 0x{0:02x}")]
    UnknownType(u8),
    #[error("length {got} does not match type (expected {expected})")]
    LengthMismatch { got: usize, expected: usize },
    #[error("result payload of {0} bytes is not a whole number of triples")]
    RaggedTriples(usize),
}

/// On-wire `(id, ipv4, port)` triple of a RESULT message.
#[repr(C)]
#[derive(Debug, Clone, ZFromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct NodeTriple {
    pub id: [u8; HASH_SIZE],
    pub ip: [u8; 4],
    pub port: U16<BigEndian>,
}

impl NodeTriple {
    pub fn from_node(node: &Node) -> Self {
        NodeTriple {
            id: *node.id.as_bytes(),
            ip: node.addr().octets(),
            port: U16::new(node.port()),
        }
    }

    pub fn to_node(&self) -> Node {
        Node::new(
            Identifier::from_bytes(self.id),
            Ipv4Addr::from(self.ip),
            self.port.get(),
        )
    }
}

/// A decoded request datagram (cookie stripped).
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Ping {
        sender: Identifier,
    },
    FindNode {
        target: Identifier,
    },
    FindValue {
        target: Identifier,
    },
    Announce {
        what: Identifier,
        who: Identifier,
    },
    StartStream {
        service: u16,
        handshake: Bytes,
    },
}

/// Reads the leading cookie of a datagram.
pub fn read_cookie(buf: &[u8]) -> Result<Identifier, WireError> {
    Identifier::from_slice(buf.get(..HASH_SIZE).ok_or(WireError::TooShort(buf.len()))?)
        .ok_or(WireError::TooShort(buf.len()))
}

impl Request {
    /// Parses the part of a datagram after the cookie.
    pub fn parse(body: &[u8]) -> Result<Self, WireError> {
        let (&ty, rest) = body.split_first().ok_or(WireError::TooShort(body.len()))?;
        let ty = MsgType::from_u8(ty).ok_or(WireError::UnknownType(ty))?;
        match ty {
            MsgType::Ping | MsgType::FindNode | MsgType::FindValue => {
                let id = Identifier::from_slice(rest).ok_or(WireError::LengthMismatch {
                    got: body.len(),
                    expected: 1 + HASH_SIZE,
                })?;
                Ok(match ty {
                    MsgType::Ping => Request::Ping { sender: id },
                    MsgType::FindNode => Request::FindNode { target: id },
                    _ => Request::FindValue { target: id },
                })
            },
            MsgType::Announce => {
                if rest.len() != 2 * HASH_SIZE {
                    return Err(WireError::LengthMismatch {
                        got: body.len(),
                        expected: 1 + 2 * HASH_SIZE,
                    });
                }
                let (what, who) = rest.split_at(HASH_SIZE);
                Ok(Request::Announce {
                    what: Identifier::from_slice(what)
                        .ok_or(WireError::TooShort(body.len()))?,
                    who: Identifier::from_slice(who)
                        .ok_or(WireError::TooShort(body.len()))?,
                })
            },
            MsgType::StartStream => {
                if rest.len() < 2 {
                    return Err(WireError::TooShort(body.len()));
                }
                let service = u16::from_be_bytes([rest[0], rest[1]]);
                Ok(Request::StartStream {
                    service,
                    handshake: Bytes::copy_from_slice(&rest[2..]),
                })
            },
        }
    }
}

/// A decoded RESULT datagram (cookie stripped).
#[derive(Debug, Clone)]
pub struct ResultMsg {
    pub success: bool,
    pub triples: Vec<Node>,
}

impl ResultMsg {
    pub fn parse(body: &[u8]) -> Result<Self, WireError> {
        let (&success, rest) = body.split_first().ok_or(WireError::TooShort(body.len()))?;
        if rest.len() % TRIPLE_SIZE != 0 {
            return Err(WireError::RaggedTriples(rest.len()));
        }
        let mut triples = Vec::with_capacity(rest.len() / TRIPLE_SIZE);
        for chunk in rest.chunks_exact(TRIPLE_SIZE) {
            let triple = NodeTriple::read_from_bytes(chunk)
                .map_err(|_| WireError::RaggedTriples(rest.len()))?;
            triples.push(triple.to_node());
        }
        Ok(ResultMsg {
            success: success != 0,
            triples,
        })
    }
}

fn with_cookie(cookie: &Identifier, cap: usize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(cap);
    buf.put_slice(cookie.as_bytes());
    buf
}

pub fn build_ping(cookie: &Identifier, sender: &Identifier) -> Bytes {
    let mut buf = with_cookie(cookie, HASH_SIZE + 1 + HASH_SIZE);
    buf.put_u8(MsgType::Ping as u8);
    buf.put_slice(sender.as_bytes());
    buf.freeze()
}

pub fn build_find(cookie: &Identifier, ty: MsgType, target: &Identifier) -> Bytes {
    debug_assert!(matches!(ty, MsgType::FindNode | MsgType::FindValue));
    let mut buf = with_cookie(cookie, HASH_SIZE + 1 + HASH_SIZE);
    buf.put_u8(ty as u8);
    buf.put_slice(target.as_bytes());
    buf.freeze()
}

pub fn build_announce(cookie: &Identifier, what: &Identifier, who: &Identifier) -> Bytes {
    let mut buf = with_cookie(cookie, HASH_SIZE + 1 + 2 * HASH_SIZE);
    buf.put_u8(MsgType::Announce as u8);
    buf.put_slice(what.as_bytes());
    buf.put_slice(who.as_bytes());
    buf.freeze()
}

/// Builds a RESULT message; at most [`K`] triples are serialized.
pub fn build_result(cookie: &Identifier, success: bool, nodes: &[Node]) -> Bytes {
    let n = nodes.len().min(K);
    let mut buf = with_cookie(cookie, HASH_SIZE + 1 + n * TRIPLE_SIZE);
    buf.put_u8(u8::from(success));
    for node in &nodes[..n] {
        buf.put_slice(NodeTriple::from_node(node).as_bytes());
    }
    buf.freeze()
}

pub fn build_start_stream(cookie: &Identifier, service: u16, handshake: &[u8]) -> Bytes {
    let mut buf = with_cookie(cookie, HASH_SIZE + 3 + handshake.len());
    buf.put_u8(MsgType::StartStream as u8);
    buf.put_u16(service);
    buf.put_slice(handshake);
    buf.freeze()
}

pub fn build_start_stream_response(
    cookie: &Identifier,
    success: bool,
    handshake: &[u8],
) -> Bytes {
    let mut buf = with_cookie(cookie, HASH_SIZE + 1 + handshake.len());
    buf.put_u8(u8::from(success));
    if success {
        buf.put_slice(handshake);
    }
    buf.freeze()
}

/// Frames a channel datagram: `cookie | seq | ciphertext`.
pub fn build_channel_packet(cookie: &Identifier, seq: u32, ciphertext: &[u8]) -> Bytes {
    let mut buf = with_cookie(cookie, HASH_SIZE + 4 + ciphertext.len());
    buf.put_u32(seq);
    buf.put_slice(ciphertext);
    buf.freeze()
}
