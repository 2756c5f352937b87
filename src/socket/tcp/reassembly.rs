use crate::wire::TcpSeqNumber;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Pending {
    seq: TcpSeqNumber,
    payload: Vec<u8>,
    push: bool,
}

/// Received segments waiting for the ones before them.
///
/// Segments are kept sorted by sequence number and released only once they are contiguous
/// with `RCV_NXT`.
#[derive(Debug, Default)]
pub struct ReassemblyBuffer {
    segments: Vec<Pending>,
}

impl ReassemblyBuffer {
    pub fn new() -> ReassemblyBuffer {
        ReassemblyBuffer::default()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn clear(&mut self) {
        self.segments.clear()
    }

    /// Buffer a segment. Returns `false`, dropping the segment, if one with the same
    /// sequence number is already held.
    pub fn insert(&mut self, seq: TcpSeqNumber, payload: &[u8], push: bool) -> bool {
        if payload.is_empty() || self.segments.iter().any(|pending| pending.seq == seq) {
            return false;
        }
        let at = self
            .segments
            .iter()
            .position(|pending| pending.seq > seq)
            .unwrap_or(self.segments.len());
        self.segments.insert(
            at,
            Pending {
                seq,
                payload: payload.to_vec(),
                push,
            },
        );
        true
    }

    /// Release the next in-order run of data, advancing `rcv_nxt` past it.
    ///
    /// Octets before `rcv_nxt` that were already delivered are trimmed off; segments that
    /// hold nothing new are discarded.
    pub fn pop(&mut self, rcv_nxt: &mut TcpSeqNumber) -> Option<(Vec<u8>, bool)> {
        while let Some(front) = self.segments.first() {
            if front.seq > *rcv_nxt {
                return None;
            }
            let end = front.seq + front.payload.len();
            let front = self.segments.remove(0);
            if end <= *rcv_nxt {
                continue;
            }
            let skip = *rcv_nxt - front.seq;
            let mut payload = front.payload;
            payload.drain(..skip);
            *rcv_nxt = end;
            return Some((payload, front.push));
        }
        None
    }
}
