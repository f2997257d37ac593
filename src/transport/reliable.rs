//! Reliable delivery bookkeeping.
//!
//! Pure state, no I/O: [`OutboundWindow`] numbers envelopes and tracks
//! which are still unacknowledged, [`InboundWindow`] restores sequence
//! order on the receiving side, and [`FragmentAccumulator`] reassembles
//! split payloads.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::codec::CoreRecord;

/// An envelope waiting for its acknowledgement.
#[derive(Debug, Clone)]
pub struct PendingEnvelope {
    /// Encoded Reliable record, ready to resend as-is.
    pub record: Vec<u8>,
    /// When it was last handed to the send queue.
    pub last_sent: Instant,
}

impl PendingEnvelope {
    /// Whether the envelope has waited longer than `timeout`.
    pub fn is_due(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_sent) > timeout
    }
}

/// Sender side of the reliable channel.
#[derive(Debug, Default)]
pub struct OutboundWindow {
    next_seq: u32,
    pending: BTreeMap<u32, PendingEnvelope>,
}

impl OutboundWindow {
    /// Wrap `inner` in the next envelope and start tracking it.
    ///
    /// Returns the encoded Reliable record.
    pub fn wrap(&mut self, inner: &[u8], now: Instant) -> Vec<u8> {
        let seq = self.next_seq;
        let record = CoreRecord::Reliable {
            seq,
            inner: inner.to_vec(),
        }
        .encode();
        self.pending.insert(
            seq,
            PendingEnvelope {
                record: record.clone(),
                last_sent: now,
            },
        );
        self.next_seq = self.next_seq.wrapping_add(1);
        record
    }

    /// Retire every envelope with a sequence number up to `seq`.
    ///
    /// Acks for numbers never sent are ignored. Returns how many
    /// envelopes were retired.
    pub fn acknowledge(&mut self, seq: u32) -> usize {
        if seq >= self.next_seq {
            return 0;
        }
        let before = self.pending.len();
        self.pending.retain(|pending_seq, _| *pending_seq > seq);
        before - self.pending.len()
    }

    /// Records older than `timeout`, with their timestamps refreshed.
    pub fn due(&mut self, now: Instant, timeout: Duration) -> Vec<Vec<u8>> {
        self.pending
            .values_mut()
            .filter(|envelope| envelope.is_due(now, timeout))
            .map(|envelope| {
                envelope.last_sent = now;
                envelope.record.clone()
            })
            .collect()
    }

    /// Sequence number the next envelope will carry.
    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    /// Number of unacknowledged envelopes.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether `seq` is still unacknowledged.
    pub fn is_pending(&self, seq: u32) -> bool {
        self.pending.contains_key(&seq)
    }

    /// Drop everything outstanding.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Result of receiving one envelope.
#[derive(Debug, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Already delivered; re-acknowledge `ack`.
    Duplicate {
        /// Highest sequence number delivered so far.
        ack: u32,
    },
    /// Stored. `ready` holds the now-contiguous run in order; each entry
    /// must be acknowledged and processed.
    Accepted {
        /// `(seq, inner)` pairs ready for delivery.
        ready: Vec<(u32, Vec<u8>)>,
    },
    /// Too far ahead to buffer.
    OutOfWindow,
}

/// Receiver side of the reliable channel.
#[derive(Debug, Default)]
pub struct InboundWindow {
    next_expected: u32,
    reorder: BTreeMap<u32, Vec<u8>>,
}

impl InboundWindow {
    /// Accept envelope `seq`.
    pub fn receive(&mut self, seq: u32, inner: Vec<u8>, limit: u32) -> InboundOutcome {
        if seq < self.next_expected {
            return InboundOutcome::Duplicate {
                ack: self.next_expected - 1,
            };
        }
        if seq - self.next_expected > limit {
            return InboundOutcome::OutOfWindow;
        }

        self.reorder.insert(seq, inner);

        let mut ready = Vec::new();
        while let Some(entry) = self.reorder.first_entry() {
            if *entry.key() != self.next_expected {
                break;
            }
            ready.push((self.next_expected, entry.remove()));
            self.next_expected = self.next_expected.wrapping_add(1);
        }
        InboundOutcome::Accepted { ready }
    }

    /// Next sequence number awaited.
    pub fn next_expected(&self) -> u32 {
        self.next_expected
    }

    /// Envelopes held waiting for a gap to fill.
    pub fn buffered(&self) -> usize {
        self.reorder.len()
    }

    /// Reset to a fresh channel.
    pub fn clear(&mut self) {
        self.next_expected = 0;
        self.reorder.clear();
    }
}

/// Collects fragment chunks until the tail arrives.
///
/// Once a stream outgrows its limit, the rest of it (tail included) is
/// dropped so no partial payload is ever handed out.
#[derive(Debug, Default)]
pub struct FragmentAccumulator {
    chunks: Vec<Vec<u8>>,
    len: usize,
    discarding: bool,
}

impl FragmentAccumulator {
    /// Append a non-final chunk. Returns `false` if the chunk was dropped
    /// because the stream grew past `limit`.
    pub fn push(&mut self, chunk: Vec<u8>, limit: usize) -> bool {
        if self.discarding {
            return false;
        }
        if self.len + chunk.len() > limit {
            self.clear();
            self.discarding = true;
            return false;
        }
        self.len += chunk.len();
        self.chunks.push(chunk);
        true
    }

    /// Append the final chunk and return the whole payload, or `None` if
    /// the stream was being discarded.
    pub fn finish(&mut self, tail: Vec<u8>) -> Option<Vec<u8>> {
        if std::mem::take(&mut self.discarding) {
            return None;
        }
        let mut payload = Vec::with_capacity(self.len + tail.len());
        for chunk in self.chunks.drain(..) {
            payload.extend_from_slice(&chunk);
        }
        payload.extend_from_slice(&tail);
        self.len = 0;
        Some(payload)
    }

    /// Bytes collected so far.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no chunks are held.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Whether the current stream is being dropped.
    pub fn is_discarding(&self) -> bool {
        self.discarding
    }

    /// Discard held chunks and start over.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.len = 0;
        self.discarding = false;
    }
}
