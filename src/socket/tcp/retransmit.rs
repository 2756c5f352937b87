use core::fmt;
use std::collections::VecDeque;

use super::Segment;
use crate::time::{Duration, Instant};
use crate::wire::{TcpFlags, TcpSeqNumber};

/// A segment exhausted its retransmissions.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct RetriesExhausted {
    pub seq_number: TcpSeqNumber,
}

impl fmt::Display for RetriesExhausted {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "segment seq={} not acknowledged", self.seq_number)
    }
}

impl core::error::Error for RetriesExhausted {}

#[derive(Debug, Clone)]
struct Entry {
    segment: Segment,
    deadline: Instant,
    retries: u8,
}

/// Segments sent and not yet acknowledged, in sequence order.
#[derive(Debug)]
pub struct RetransmitQueue {
    entries: VecDeque<Entry>,
    timeout: Duration,
    max_retries: u8,
}

impl RetransmitQueue {
    pub fn new(timeout: Duration, max_retries: u8) -> RetransmitQueue {
        RetransmitQueue {
            entries: VecDeque::new(),
            timeout,
            max_retries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear()
    }

    /// Start the retransmission timer of a segment that was just sent.
    pub fn track(&mut self, now: Instant, segment: Segment) {
        self.entries.push_back(Entry {
            segment,
            deadline: now + self.timeout,
            retries: 0,
        })
    }

    /// Forget every segment `ack` covers entirely. Returns how many were released.
    pub fn acknowledge(&mut self, ack: TcpSeqNumber) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|entry| entry.segment.seq_number + entry.segment.segment_len() > ack);
        before - self.entries.len()
    }

    /// Return whether a FIN is still waiting for its acknowledgment.
    pub fn contains_fin(&self) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.segment.flags.contains(TcpFlags::FIN))
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().map(|entry| entry.deadline).min()
    }

    /// Push every expired segment onto `out` again, unchanged, and restart its timer.
    ///
    /// A segment that already used up its retransmissions fails the pass; segments after
    /// it are not looked at.
    pub fn poll(&mut self, now: Instant, out: &mut Vec<Segment>) -> Result<(), RetriesExhausted> {
        for entry in self.entries.iter_mut() {
            if entry.deadline > now {
                continue;
            }
            if entry.retries >= self.max_retries {
                return Err(RetriesExhausted {
                    seq_number: entry.segment.seq_number,
                });
            }
            entry.retries += 1;
            entry.deadline = now + self.timeout;
            out.push(entry.segment.clone());
        }
        Ok(())
    }
}
