use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::segment::MAX_PAYLOAD;

/// A transmitted segment awaiting cumulative acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Unacked {
    pub seq: u32,
    pub payload: Vec<u8>,
    pub fin: bool,
}

impl Unacked {
    fn seq_len(&self) -> u32 {
        self.payload.len() as u32 + u32::from(self.fin)
    }
}

/// Go-Back-N sender state: the unsent byte queue, the in-flight segment
/// queue `base..next_seq`, and the single retransmission timer.
///
/// Pure bookkeeping; the connection worker turns the entries returned here
/// into wire segments. Sequence comparisons are plain `u32` compares: initial
/// sequence numbers are drawn below 2^31 and exhausting the remaining space
/// is reported through [`SendBuffer::overflowed`] instead of wrapping.
#[derive(Debug)]
pub(crate) struct SendBuffer {
    base: u32,
    next_seq: u32,
    unsent: VecDeque<u8>,
    in_flight: VecDeque<Unacked>,
    timer: Option<Instant>,
    resend_interval: Duration,
    fin_seq: Option<u32>,
    overflowed: bool,
}

impl SendBuffer {
    pub fn new(initial_seq: u32, resend_interval: Duration) -> Self {
        SendBuffer {
            base: initial_seq,
            next_seq: initial_seq,
            unsent: VecDeque::new(),
            in_flight: VecDeque::new(),
            timer: None,
            resend_interval,
            fin_seq: None,
            overflowed: false,
        }
    }

    pub fn queue(&mut self, data: &[u8]) {
        self.unsent.extend(data.iter().copied());
    }

    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    pub fn bytes_in_flight(&self) -> u32 {
        self.next_seq - self.base
    }

    pub fn has_unsent(&self) -> bool {
        !self.unsent.is_empty()
    }

    pub fn is_drained(&self) -> bool {
        self.unsent.is_empty() && self.in_flight.is_empty()
    }

    pub fn fin_sent(&self) -> bool {
        self.fin_seq.is_some()
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// Slices the next segment's worth of queued bytes if the peer's window
    /// has room for it, registers it as in flight and returns it for
    /// transmission. Arms the timer when the queue was previously empty.
    pub fn pop_transmittable(&mut self, peer_window: u16, now: Instant) -> Option<&Unacked> {
        if self.unsent.is_empty() || self.overflowed || self.fin_sent() {
            return None;
        }

        let budget = u32::from(peer_window).saturating_sub(self.bytes_in_flight()) as usize;
        let len = self.unsent.len().min(MAX_PAYLOAD).min(budget);
        if len == 0 {
            return None;
        }

        let Some(end) = self.next_seq.checked_add(len as u32) else {
            self.overflowed = true;
            return None;
        };

        let payload: Vec<u8> = self.unsent.drain(..len).collect();
        if self.in_flight.is_empty() {
            self.arm(now);
        }
        self.in_flight.push_back(Unacked {
            seq: self.next_seq,
            payload,
            fin: false,
        });
        self.next_seq = end;

        self.in_flight.back()
    }

    /// Assigns a sequence number to our FIN and registers it for
    /// (re)transmission. A FIN occupies one unit of sequence space.
    pub fn queue_fin(&mut self, now: Instant) -> Option<u32> {
        if self.fin_sent() {
            return None;
        }

        let seq = self.next_seq;
        let Some(end) = seq.checked_add(1) else {
            self.overflowed = true;
            return None;
        };

        if self.in_flight.is_empty() {
            self.arm(now);
        }
        self.in_flight.push_back(Unacked {
            seq,
            payload: Vec::new(),
            fin: true,
        });
        self.next_seq = end;
        self.fin_seq = Some(seq);

        Some(seq)
    }

    /// Applies a cumulative acknowledgement. Stale ACKs (`ack <= base`) and
    /// ACKs for sequence numbers never sent are ignored. Returns whether the
    /// window advanced.
    pub fn on_ack(&mut self, ack: u32, now: Instant) -> bool {
        if ack <= self.base || ack > self.next_seq {
            return false;
        }

        self.base = ack;
        while let Some(front) = self.in_flight.front() {
            if front.seq + front.seq_len() <= ack {
                self.in_flight.pop_front();
            } else {
                break;
            }
        }

        if self.in_flight.is_empty() {
            self.timer = None;
        } else {
            self.arm(now);
        }

        true
    }

    pub fn timer_expired(&self, now: Instant) -> bool {
        self.timer.is_some_and(|deadline| now >= deadline)
    }

    pub fn rearm(&mut self, now: Instant) {
        self.arm(now);
    }

    pub fn in_flight(&self) -> impl Iterator<Item = &Unacked> {
        self.in_flight.iter()
    }

    fn arm(&mut self, now: Instant) {
        self.timer = Some(now + self.resend_interval);
    }
}
