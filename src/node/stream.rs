// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The reliable stream flavor of a channel.
//!
//! Layered on the session core: DATA frames carry 32-bit sequence
//! numbers into a reassembly buffer, ACKs drain the retransmission
//! buffer and carry the receive window, RESET tears the stream down.
//! A pump task per stream owns the timers (keepalive 1 s, retransmit
//! check 100 ms, idle 10 s by default) and processes inbound frames;
//! the application handle shares the buffer state with it.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use anyhow::{Result, bail};
use bytes::Bytes;
use tokio::{
    sync::{Notify, mpsc},
    time::{Instant, interval, sleep},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    models::{
        frame::Frame,
        identifier::Identifier,
        message::MAX_STREAM_PAYLOAD,
        peer::Node,
    },
    node::socket::SessionCore,
    stream::{inbuf::StreamInBuffer, outbuf::StreamOutBuffer},
};

/// Timer settings of one stream, taken from the node configuration.
#[derive(Debug, Clone, Copy)]
pub struct StreamTimers {
    pub keepalive: Duration,
    pub retransmit_check: Duration,
    pub idle_timeout: Duration,
    pub initial_rto: Duration,
}

impl Default for StreamTimers {
    fn default() -> Self {
        StreamTimers {
            keepalive: Duration::from_secs(1),
            retransmit_check: Duration::from_millis(100),
            idle_timeout: Duration::from_secs(10),
            initial_rto: Duration::from_millis(100),
        }
    }
}

struct StreamState {
    inbuf: StreamInBuffer,
    outbuf: StreamOutBuffer,
    /// Cleared once a RESET went out or came in; guards the
    /// at-most-one-RESET rule.
    open: bool,
}

struct StreamShared {
    state: Mutex<StreamState>,
    readable: Notify,
    writable: Notify,
    closed: CancellationToken,
}

impl StreamShared {
    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().expect("stream state lock poisoned")
    }
}

/// Application handle of a reliable stream.
#[derive(Debug)]
pub struct StreamSocket {
    core: Arc<SessionCore>,
    shared: Arc<StreamShared>,
}

impl std::fmt::Debug for StreamShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamShared")
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl StreamSocket {
    /// Builds the stream over an established session and spawns its
    /// pump. `rx` is the engine's feed of decrypted datagrams.
    pub(crate) fn spawn(
        core: Arc<SessionCore>,
        timers: StreamTimers,
        rx: mpsc::Receiver<Bytes>,
    ) -> Self {
        let shared = Arc::new(StreamShared {
            state: Mutex::new(StreamState {
                inbuf: StreamInBuffer::new(),
                outbuf: StreamOutBuffer::new(timers.initial_rto),
                open: true,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
            closed: CancellationToken::new(),
        });
        tokio::spawn(pump(
            Arc::clone(&core),
            Arc::clone(&shared),
            rx,
            timers,
        ));
        StreamSocket { core, shared }
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
        self.shared.closed.is_cancelled()
    }

    /// Ordered bytes ready for [`Self::read`].
    pub fn available(&self) -> usize {
        self.shared.lock().inbuf.available()
    }

    /// Bytes a `write` would accept right now.
    pub fn free(&self) -> usize {
        self.shared.lock().outbuf.free().min(MAX_STREAM_PAYLOAD)
    }

    /// Bytes written but not yet acknowledged by the peer.
    pub fn bytes_to_write(&self) -> usize {
        self.shared.lock().outbuf.available()
    }

    /// Reads in-order bytes; returns 0 when nothing is buffered (or
    /// the stream is closed and drained).
    pub fn read(&self, dst: &mut [u8]) -> usize {
        self.shared.lock().inbuf.read(dst)
    }

    /// Waits until at least one byte is readable, then reads. Returns 0
    /// once the stream closed with nothing left to deliver.
    pub async fn read_some(&self, dst: &mut [u8]) -> usize {
        loop {
            let notified = self.shared.readable.notified();
            let n = self.read(dst);
            if n > 0 {
                return n;
            }
            if self.is_closed() {
                return 0;
            }
            notified.await;
        }
    }

    /// Queues and sends at most one DATA frame worth of `data`,
    /// bounded by the retransmission buffer and the remote window.
    /// Returns the bytes accepted; 0 means backpressure, wait for
    /// [`Self::writable`].
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let frame = {
            let mut st = self.shared.lock();
            if !st.open || self.is_closed() {
                bail!("write on closed stream");
            }
            let seq = st.outbuf.next_sequence();
            let bound = data.len().min(MAX_STREAM_PAYLOAD);
            let len = st.outbuf.write(&data[..bound]);
            if len == 0 {
                return Ok(0);
            }
            Frame::Data {
                seq,
                payload: Bytes::copy_from_slice(&data[..len]),
            }
        };
        let len = match &frame {
            Frame::Data { payload, .. } => payload.len(),
            _ => 0,
        };
        // A lost send is repaired by the retransmission timer; the
        // bytes are committed to the out-buffer either way.
        if let Err(e) = self.core.send_datagram(&frame.encode()).await {
            debug!(error = %e, "stream DATA send failed, retransmit will cover");
        }
        Ok(len)
    }

    /// Resolves when readable bytes exist or the stream closed.
    pub async fn readable(&self) {
        loop {
            let notified = self.shared.readable.notified();
            if self.available() > 0 || self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    /// Resolves when a write would accept bytes or the stream closed.
    pub async fn writable(&self) {
        loop {
            let notified = self.shared.writable.notified();
            if self.free() > 0 || self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    /// Resolves once the stream is closed.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await;
    }

    /// Sends RESET (once), cancels the timers and evicts the session.
    /// Calling it again is a no-op.
    pub async fn close(&self) {
        shutdown(&self.core, &self.shared, true).await;
    }
}

impl Drop for StreamSocket {
    fn drop(&mut self) {
        if !self.is_closed() {
            // Cannot send the RESET from a sync context; the peer's
            // idle timer will finish the job.
            finish_close(&self.core, &self.shared);
        }
    }
}

/// Marks the stream closed exactly once and wakes every waiter.
fn finish_close(core: &SessionCore, shared: &StreamShared) {
    if shared.closed.is_cancelled() {
        return;
    }
    shared.lock().open = false;
    shared.closed.cancel();
    core.engine().close_session(core.cookie());
    shared.readable.notify_waiters();
    shared.writable.notify_waiters();
}

async fn shutdown(core: &SessionCore, shared: &StreamShared, send_reset: bool) {
    let reset_wanted = {
        let mut st = shared.lock();
        let was_open = st.open;
        st.open = false;
        was_open && send_reset
    };
    if reset_wanted {
        debug!(cookie = %core.cookie(), "closing stream, sending RESET");
        if let Err(e) = core.send_datagram(&Frame::Reset.encode()).await {
            warn!(error = %e, "failed to send RESET");
        }
    }
    finish_close(core, shared);
}

async fn pump(
    core: Arc<SessionCore>,
    shared: Arc<StreamShared>,
    mut rx: mpsc::Receiver<Bytes>,
    timers: StreamTimers,
) {
    let mut keepalive = interval(timers.keepalive);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut rto_check = interval(timers.retransmit_check);
    rto_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let idle = sleep(timers.idle_timeout);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            _ = shared.closed.cancelled() => break,

            msg = rx.recv() => match msg {
                Some(datagram) => {
                    idle.as_mut().reset(Instant::now() + timers.idle_timeout);
                    handle_datagram(&core, &shared, &datagram).await;
                },
                // The engine dropped the session; close quietly.
                None => {
                    finish_close(&core, &shared);
                    break;
                },
            },

            _ = keepalive.tick() => {
                let quiet = shared.lock().outbuf.available() == 0;
                if quiet && let Err(e) = core.send_datagram(&[]).await {
                    debug!(error = %e, "keepalive send failed");
                }
            },

            _ = rto_check.tick() => {
                retransmit(&core, &shared).await;
            },

            _ = &mut idle => {
                debug!(cookie = %core.cookie(), "stream idle timeout, closing");
                shutdown(&core, &shared, true).await;
                break;
            },
        }
    }
}

async fn handle_datagram(core: &SessionCore, shared: &StreamShared, datagram: &[u8]) {
    // Zero-length datagrams are keepalives; the idle timer was already
    // restarted by the caller.
    if datagram.is_empty() {
        return;
    }
    let frame = match Frame::parse(datagram) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(error = %e, "dropping bad stream frame");
            return;
        },
    };
    match frame {
        Frame::Data { seq, payload } => {
            let ack = {
                let mut st = shared.lock();
                if !st.open {
                    return;
                }
                let fresh = st.inbuf.put_packet(seq, &payload);
                (fresh > 0).then(|| Frame::Ack {
                    seq: st.inbuf.next_sequence(),
                    window: u32::from(st.inbuf.window()),
                })
            };
            if let Some(ack) = ack {
                if let Err(e) = core.send_datagram(&ack.encode()).await {
                    warn!(error = %e, "failed to send ACK");
                }
                shared.readable.notify_waiters();
            }
        },
        Frame::Ack { seq, window } => {
            let freed = shared.lock().outbuf.ack(seq, window);
            if freed > 0 {
                shared.writable.notify_waiters();
            }
        },
        Frame::Reset => {
            debug!(cookie = %core.cookie(), "RESET received");
            // The peer already tore the channel down; no RESET back.
            shutdown(core, shared, false).await;
        },
        Frame::Fin => {
            // Reserved for a future half-close.
            debug!(cookie = %core.cookie(), "FIN received, ignored");
        },
    }
}

async fn retransmit(core: &SessionCore, shared: &StreamShared) {
    let frame = {
        let mut st = shared.lock();
        if !st.open || !st.outbuf.timed_out() {
            None
        } else {
            let mut segment = [0u8; MAX_STREAM_PAYLOAD];
            let (len, seq) = st.outbuf.resend(&mut segment);
            (len > 0).then(|| Frame::Data {
                seq,
                payload: Bytes::copy_from_slice(&segment[..len]),
            })
        }
    };
    if let Some(frame) = frame {
        if let Frame::Data { seq, payload } = &frame {
            debug!(seq, len = payload.len(), "retransmitting oldest segment");
        }
        if let Err(e) = core.send_datagram(&frame.encode()).await {
            debug!(error = %e, "retransmit send failed");
        }
    }
}
