//! Per-request transfer bookkeeping
//!
//! A [`TransferSession`] tracks one client response from validation to
//! completion. Offsets are absolute positions in the upstream resource:
//! `origin` is where the client response starts, so a resume always asks
//! for `origin + forwarded` and never re-applies the client's own range.

use crate::proxy::range::ByteRange;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    Validating,
    Admitted,
    Streaming,
    Resuming,
    Complete,
    Failed,
}

impl TransferPhase {
    pub fn can_become(self, next: TransferPhase) -> bool {
        use TransferPhase::*;
        matches!(
            (self, next),
            (Validating, Admitted)
                | (Validating, Complete)
                | (Validating, Failed)
                | (Admitted, Streaming)
                | (Admitted, Failed)
                | (Streaming, Resuming)
                | (Streaming, Complete)
                | (Streaming, Failed)
                | (Resuming, Resuming)
                | (Resuming, Streaming)
                | (Resuming, Complete)
                | (Resuming, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TransferPhase::Complete | TransferPhase::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct TransferSession {
    requested: ByteRange,
    origin: u64,
    end: Option<u64>,
    forwarded: u64,
    expected_total: Option<u64>,
    retry_count: u32,
    phase: TransferPhase,
}

impl TransferSession {
    pub fn new(requested: Option<ByteRange>) -> Self {
        let requested = requested.unwrap_or(ByteRange::from_start(0));
        Self {
            requested,
            origin: requested.start,
            end: requested.end,
            forwarded: 0,
            expected_total: None,
            retry_count: 0,
            phase: TransferPhase::Validating,
        }
    }

    /// The range the client asked for; the first upstream fetch uses it verbatim
    pub fn requested(&self) -> ByteRange {
        self.requested
    }

    pub fn phase(&self) -> TransferPhase {
        self.phase
    }

    pub fn set_phase(&mut self, next: TransferPhase) {
        if !self.phase.can_become(next) {
            warn!(from = ?self.phase, to = ?next, "Unexpected transfer phase change");
        }
        debug!(from = ?self.phase, to = ?next, forwarded = self.forwarded, "Transfer phase");
        self.phase = next;
    }

    /// Fix what the client response covers, from the first upstream reply
    pub fn begin(&mut self, origin: u64, end: Option<u64>, expected_total: Option<u64>) {
        self.origin = origin;
        self.end = end;
        self.expected_total = expected_total;
        self.set_phase(TransferPhase::Streaming);
    }

    pub fn record_chunk(&mut self, len: usize) {
        self.forwarded += len as u64;
    }

    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }

    pub fn expected_total(&self) -> Option<u64> {
        self.expected_total
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Count one more resume attempt
    pub fn begin_retry(&mut self) -> u32 {
        self.retry_count += 1;
        self.set_phase(TransferPhase::Resuming);
        self.retry_count
    }

    /// Bytes still owed to the client, when the total is known
    pub fn remaining(&self) -> Option<u64> {
        self.expected_total
            .map(|total| total.saturating_sub(self.forwarded))
    }

    /// Whether every advertised byte has been delivered
    pub fn is_satisfied(&self) -> bool {
        self.remaining() == Some(0)
    }

    /// Whether a clean upstream end still leaves the client short
    pub fn is_short(&self) -> bool {
        self.remaining().is_some_and(|remaining| remaining > 0)
    }

    /// Absolute offset of the next byte the client needs
    pub fn next_offset(&self) -> u64 {
        self.origin + self.forwarded
    }

    /// Range to request when resuming after an interruption
    pub fn resume_range(&self) -> ByteRange {
        ByteRange {
            start: self.next_offset(),
            end: self.end,
        }
    }
}
