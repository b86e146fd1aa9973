// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Frames of the reliable stream, carried inside decrypted channel
//! datagrams:
//!
//! ```text
//! DATA   0x00 | seq[4] | payload[<= MAX_STREAM_PAYLOAD]
//! ACK    0x01 | seq[4] | window[4]
//! RESET  0x02
//! FIN    0x03                          (reserved, ignored on receipt)
//! ```
//!
//! A zero-length datagram is the keepalive and carries no frame at all.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::models::message::MAX_STREAM_PAYLOAD;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("unknown frame type 0x{0:02x}")]
    UnknownType(u8),
    #[error("frame of {got} bytes is too short for its type")]
    Truncated { got: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data { seq: u32, payload: Bytes },
    Ack { seq: u32, window: u32 },
    Reset,
    Fin,
}

impl Frame {
    pub const TYPE_DATA: u8 = 0;
    pub const TYPE_ACK: u8 = 1;
    pub const TYPE_RESET: u8 = 2;
    pub const TYPE_FIN: u8 = 3;

    /// Decodes one frame from a decrypted datagram. The caller handles
    /// the zero-length keepalive before calling this.
    pub fn parse(buf: &[u8]) -> Result<Self, FrameError> {
        let (&ty, rest) = buf
            .split_first()
            .ok_or(FrameError::Truncated { got: buf.len() })?;
        match ty {
            Self::TYPE_DATA => {
                if rest.len() < 4 {
                    return Err(FrameError::Truncated { got: buf.len() });
                }
                let seq = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
                Ok(Frame::Data {
                    seq,
                    payload: Bytes::copy_from_slice(&rest[4..]),
                })
            },
            Self::TYPE_ACK => {
                if rest.len() != 8 {
                    return Err(FrameError::Truncated { got: buf.len() });
                }
                let seq = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
                let window = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]);
                Ok(Frame::Ack { seq, window })
            },
            Self::TYPE_RESET => Ok(Frame::Reset),
            Self::TYPE_FIN => Ok(Frame::Fin),
            other => Err(FrameError::UnknownType(other)),
        }
    }

    pub fn encode(&self) -> Bytes {
        match self {
            Frame::Data { seq, payload } => {
                debug_assert!(payload.len() <= MAX_STREAM_PAYLOAD);
                let mut buf = BytesMut::with_capacity(5 + payload.len());
                buf.put_u8(Self::TYPE_DATA);
                buf.put_u32(*seq);
                buf.put_slice(payload);
                buf.freeze()
            },
            Frame::Ack { seq, window } => {
                let mut buf = BytesMut::with_capacity(9);
                buf.put_u8(Self::TYPE_ACK);
                buf.put_u32(*seq);
                buf.put_u32(*window);
                buf.freeze()
            },
            Frame::Reset => Bytes::from_static(&[Self::TYPE_RESET]),
            Frame::Fin => Bytes::from_static(&[Self::TYPE_FIN]),
        }
    }
}
