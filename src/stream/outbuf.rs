// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Send side of the reliable stream.
//!
//! Written bytes stay in the ring until the peer acknowledges them.
//! The retransmission timeout adapts to the observed ACK round trips:
//! every 64 samples it becomes `mean + 3 * stddev`, computed on integer
//! sums exactly as the sender's periodic check consumes it.

use std::time::{Duration, Instant};

use crate::stream::ring::FixedRingBuffer;

/// `x` in `(a, b]` on the 32-bit sequence circle.
fn acked_range(x: u32, a: u32, b: u32) -> bool {
    if a < b { a < x && x <= b } else { a < x || x <= b }
}

pub struct StreamOutBuffer {
    buffer: FixedRingBuffer,
    /// Sequence number of the first (oldest) unacknowledged byte.
    first_sequence: u32,
    /// Sequence number of the next byte to be written.
    next_sequence: u32,
    /// Bytes the remote advertised it will still accept.
    window: u32,
    /// When the oldest unacknowledged byte was (re)sent.
    timestamp: Instant,
    timeout: Duration,
    rt_sum: u64,
    rt_sumsq: u64,
    rt_count: u32,
}

impl StreamOutBuffer {
    pub fn new(initial_timeout: Duration) -> Self {
        StreamOutBuffer {
            buffer: FixedRingBuffer::new(),
            first_sequence: 0,
            next_sequence: 0,
            window: 0xffff,
            timestamp: Instant::now(),
            timeout: initial_timeout,
            rt_sum: 0,
            rt_sumsq: 0,
            rt_count: 0,
        }
    }

    /// Bytes that may be written without exceeding either the ring or
    /// the remote window.
    pub fn free(&self) -> usize {
        let unacked = self.buffer.available();
        if unacked > self.window as usize {
            return 0;
        }
        self.buffer.free().min(self.window as usize - unacked)
    }

    /// Unacknowledged bytes currently held.
    pub fn available(&self) -> usize {
        self.buffer.available()
    }

    pub fn first_sequence(&self) -> u32 {
        self.first_sequence
    }

    pub fn next_sequence(&self) -> u32 {
        self.next_sequence
    }

    pub fn window(&self) -> u32 {
        self.window
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Age of the oldest unacknowledged byte.
    pub fn age(&self) -> Duration {
        self.timestamp.elapsed()
    }

    /// True when the oldest byte has waited past the adaptive timeout.
    pub fn timed_out(&self) -> bool {
        self.buffer.available() > 0 && self.age() > self.timeout
    }

    /// Appends bytes, bounded by [`Self::free`]. Returns bytes taken.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let bound = self.free().min(data.len());
        let len = self.buffer.write(&data[..bound]);
        if len > 0 {
            if self.first_sequence == self.next_sequence {
                self.timestamp = Instant::now();
            }
            self.next_sequence = self.next_sequence.wrapping_add(len as u32);
        }
        len
    }

    /// Acknowledges everything up to `seq` (exclusive of already-acked
    /// bytes) and adopts the remote window. Returns the bytes freed.
    pub fn ack(&mut self, seq: u32, window: u32) -> usize {
        if !acked_range(seq, self.first_sequence, self.next_sequence) {
            return 0;
        }
        let dropped = seq.wrapping_sub(self.first_sequence) as usize;
        let sample = self.age();
        self.update_round_trip(sample);
        self.timestamp = Instant::now();
        self.first_sequence = seq;
        self.window = window;
        self.buffer.drop_front(dropped)
    }

    /// Copies the oldest unacknowledged segment into `dst` for
    /// retransmission and refreshes its timestamp. Returns the segment
    /// length and its sequence number.
    pub fn resend(&mut self, dst: &mut [u8]) -> (usize, u32) {
        let seq = self.first_sequence;
        let len = self.buffer.peek(0, dst);
        self.timestamp = Instant::now();
        (len, seq)
    }

    fn update_round_trip(&mut self, sample: Duration) {
        let ms = sample.as_millis() as u64;
        self.rt_sum += ms;
        self.rt_sumsq += ms * ms;
        self.rt_count += 1;
        if self.rt_count == 64 {
            // mean + 3 * stddev over the 64-sample window, integer sums.
            let mean = self.rt_sum >> 6;
            let var = (self.rt_sumsq >> 6).saturating_sub(mean * mean);
            let stddev = (var as f64).sqrt() as u64;
            self.timeout = Duration::from_millis(mean + 3 * stddev);
            self.rt_sum = 0;
            self.rt_sumsq = 0;
            self.rt_count = 0;
        }
    }
}
