//! Retransmit Engine (C6): gap detection, bounded in-flight retransmit
//! requests, batching of large ranges, and fill accounting.
//!
//! At most one retransmit request is ever outstanding for a session
//! (spec §4.1 invariant 3, §4.3). A gap detected while one is already
//! outstanding is buffered and only requested once the current one fully
//! fills or is rejected; a range larger than `batch_max` is split into
//! contiguous chunks issued one at a time, never in parallel.
//!
//! Grounded on `forwarder::replay::ReplayEngine`, which
//! computes pending (unacked) ranges from a journal and groups them by
//! epoch for sequential resend; here the ranges come from live sequence
//! gaps rather than a persisted ack cursor, and batching/one-outstanding
//! bookkeeping is added since the exchange protocol caps retransmit size.

use std::collections::VecDeque;

/// Default `BATCH_MAX` for iLink3 (spec §4.3).
pub const BATCH_MAX_DEFAULT: u64 = 2500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransmitRequest {
    pub from: u64,
    pub count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Outstanding {
    requested_from: u64,
    requested_count: u64,
    fill_seq: u64,
}

/// Outcome of a fill or reject event against the currently outstanding
/// request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillResult {
    /// `next_recv_seq` should advance to this value.
    pub next_recv_seq: u64,
    /// A new request to send immediately (the next chunk of the same
    /// logical gap, or the first chunk of a deferred one).
    pub next_request: Option<RetransmitRequest>,
    /// `true` once no retransmit request remains in flight at all.
    pub outstanding_cleared: bool,
}

#[derive(Default)]
pub struct RetransmitEngine {
    batch_max: u64,
    outstanding: Option<Outstanding>,
    pending_chunks: VecDeque<(u64, u64)>,
    deferred_gaps: VecDeque<(u64, u64)>,
}

impl RetransmitEngine {
    #[must_use]
    pub fn new(batch_max: u64) -> Self {
        RetransmitEngine { batch_max: batch_max.max(1), ..Default::default() }
    }

    #[must_use]
    pub fn is_outstanding(&self) -> bool {
        self.outstanding.is_some()
    }

    /// `fill_seq` of the in-flight request, or `None` (spec: "`fill_seq =
    /// NONE` iff no request in flight").
    #[must_use]
    pub fn fill_seq(&self) -> Option<u64> {
        self.outstanding.map(|o| o.fill_seq)
    }

    /// A message arrived at `received_seq` while `next_recv_seq` was
    /// expected: `received_seq > next_recv_seq`. Either issues a new
    /// retransmit request (possibly only the first chunk of a larger
    /// range) or, if one is already outstanding, buffers the gap for
    /// later.
    pub fn on_gap_detected(&mut self, next_recv_seq: u64, received_seq: u64) -> Option<RetransmitRequest> {
        debug_assert!(received_seq > next_recv_seq);
        let count = received_seq - next_recv_seq;
        if self.outstanding.is_some() {
            self.deferred_gaps.push_back((next_recv_seq, count));
            return None;
        }
        Some(self.start_gap(next_recv_seq, count))
    }

    /// A retransmitted message (`is_retransmit = true`) arrived matching
    /// the current outstanding request's next expected fill sequence.
    /// Returns `None` if nothing is outstanding (a protocol violation the
    /// caller should handle separately).
    pub fn on_retransmit_fill(&mut self) -> Option<FillResult> {
        let outstanding = self.outstanding.as_mut()?;
        outstanding.fill_seq += 1;
        let filled_through = outstanding.fill_seq;
        let chunk_done = filled_through == outstanding.requested_from + outstanding.requested_count;
        if chunk_done {
            Some(self.advance_after_completion(filled_through))
        } else {
            Some(FillResult { next_recv_seq: filled_through, next_request: None, outstanding_cleared: false })
        }
    }

    /// The peer rejected the outstanding retransmit request. The range is
    /// abandoned (no messages will arrive for it); `next_recv_seq` jumps
    /// straight to the far end of the requested range and any buffered
    /// follow-up gap or batch chunk is issued (spec §8 scenario 4: session
    /// stays ESTABLISHED, `next_recv_seq` still advances).
    pub fn on_retransmit_reject(&mut self) -> Option<FillResult> {
        let outstanding = self.outstanding?;
        let filled_through = outstanding.requested_from + outstanding.requested_count;
        Some(self.advance_after_completion(filled_through))
    }

    fn advance_after_completion(&mut self, filled_through: u64) -> FillResult {
        self.outstanding = None;
        let next_request = if let Some((from, count)) = self.pending_chunks.pop_front() {
            Some(self.set_outstanding(from, count))
        } else if let Some((from, count)) = self.deferred_gaps.pop_front() {
            Some(self.start_gap(from, count))
        } else {
            None
        };
        FillResult { next_recv_seq: filled_through, next_request, outstanding_cleared: next_request.is_none() }
    }

    fn start_gap(&mut self, from: u64, count: u64) -> RetransmitRequest {
        let mut chunks = split_into_chunks(from, count, self.batch_max);
        let (first_from, first_count) = chunks.remove(0);
        self.pending_chunks = chunks.into();
        self.set_outstanding(first_from, first_count)
    }

    fn set_outstanding(&mut self, from: u64, count: u64) -> RetransmitRequest {
        self.outstanding = Some(Outstanding { requested_from: from, requested_count: count, fill_seq: from });
        RetransmitRequest { from, count }
    }
}

fn split_into_chunks(from: u64, count: u64, batch_max: u64) -> Vec<(u64, u64)> {
    let mut chunks = Vec::new();
    let mut remaining = count;
    let mut cursor = from;
    while remaining > 0 {
        let take = remaining.min(batch_max);
        chunks.push((cursor, take));
        cursor += take;
        remaining -= take;
    }
    chunks
}
