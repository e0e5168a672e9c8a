use std::collections::{BTreeMap, VecDeque};

use log::trace;

/// An out-of-order segment parked until the gap before it fills.
#[derive(Debug)]
struct OutOfOrder {
    payload: Vec<u8>,
    fin: bool,
}

/// Receiver state: the next expected sequence number, the contiguous bytes
/// ready for the application, and the reorder buffer holding segments that
/// arrived ahead of a gap.
///
/// Every accepted, duplicate or out-of-order segment raises `pending_ack`;
/// the connection worker either piggybacks the acknowledgement on outgoing
/// data or flushes it as a pure ACK within the same tick.
#[derive(Debug)]
pub(crate) struct RecvBuffer {
    next_expected: u32,
    capacity: usize,
    ready: VecDeque<u8>,
    reorder: BTreeMap<u32, OutOfOrder>,
    reorder_bytes: usize,
    pending_ack: bool,
    fin_reached: bool,
}

impl RecvBuffer {
    pub fn new(next_expected: u32, capacity: u16) -> Self {
        RecvBuffer {
            next_expected,
            capacity: capacity as usize,
            ready: VecDeque::new(),
            reorder: BTreeMap::new(),
            reorder_bytes: 0,
            pending_ack: false,
            fin_reached: false,
        }
    }

    /// Cumulative acknowledgement to advertise: all bytes below it arrived.
    pub fn ack_num(&self) -> u32 {
        self.next_expected
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn fin_reached(&self) -> bool {
        self.fin_reached
    }

    /// Free receive space to advertise, in bytes.
    pub fn window(&self) -> u16 {
        self.capacity
            .saturating_sub(self.ready.len() + self.reorder_bytes)
            .min(u16::MAX as usize) as u16
    }

    pub fn pending_ack(&self) -> bool {
        self.pending_ack
    }

    pub fn set_pending_ack(&mut self) {
        self.pending_ack = true;
    }

    pub fn clear_pending_ack(&mut self) {
        self.pending_ack = false;
    }

    /// Files a checksum-valid data or FIN segment.
    pub fn on_segment(&mut self, seq: u32, payload: Vec<u8>, fin: bool) {
        self.pending_ack = true;

        if self.fin_reached || seq < self.next_expected {
            // Past the end of the stream, or a duplicate: re-acknowledge and
            // drop the payload.
            return;
        }

        if seq == self.next_expected {
            self.accept(payload, fin);
            self.drain_reorder();
            return;
        }

        // Ahead of a gap: park it, bounded by the advertised window.
        if self.reorder.contains_key(&seq) {
            return;
        }
        self.reorder_bytes += payload.len();
        self.reorder.insert(seq, OutOfOrder { payload, fin });
        while self.ready.len() + self.reorder_bytes > self.capacity {
            let Some((trimmed, entry)) = self.reorder.pop_last() else {
                break;
            };
            self.reorder_bytes -= entry.payload.len();
            trace!("reorder buffer over window, trimming segment {trimmed}");
        }
    }

    fn accept(&mut self, payload: Vec<u8>, fin: bool) {
        self.next_expected = self
            .next_expected
            .wrapping_add(payload.len() as u32)
            .wrapping_add(u32::from(fin));
        self.ready.extend(payload);
        if fin {
            self.fin_reached = true;
            self.reorder.clear();
            self.reorder_bytes = 0;
        }
    }

    fn drain_reorder(&mut self) {
        while let Some((seq, entry)) = self.reorder.pop_first() {
            self.reorder_bytes -= entry.payload.len();
            if seq < self.next_expected {
                // Superseded by data delivered in the meantime.
                continue;
            }
            if seq > self.next_expected {
                self.reorder_bytes += entry.payload.len();
                self.reorder.insert(seq, entry);
                break;
            }
            self.accept(entry.payload, entry.fin);
            if self.fin_reached {
                break;
            }
        }
    }

    /// Hands up to `max` contiguous bytes to the application. Reopening a
    /// window that was advertised as zero schedules an immediate ACK so a
    /// stalled sender resumes.
    pub fn take(&mut self, max: usize) -> Vec<u8> {
        let was_zero = self.window() == 0;
        let len = self.ready.len().min(max);
        let out: Vec<u8> = self.ready.drain(..len).collect();
        if was_zero && self.window() > 0 {
            self.pending_ack = true;
        }
        out
    }
}
