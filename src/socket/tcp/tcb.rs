use core::fmt;

use crate::wire::TcpSeqNumber;

/// Transmission control block: the sequence space bookkeeping of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Tcb {
    /// Oldest unacknowledged sequence number.
    pub snd_una: TcpSeqNumber,
    /// Next sequence number to be sent.
    pub snd_nxt: TcpSeqNumber,
    /// Window advertised by the remote endpoint.
    pub snd_wnd: usize,
    pub snd_up: TcpSeqNumber,
    /// Sequence number of the segment used for the last window update.
    pub snd_wl1: TcpSeqNumber,
    /// Acknowledgment number of the segment used for the last window update.
    pub snd_wl2: TcpSeqNumber,
    /// Initial send sequence number.
    pub iss: TcpSeqNumber,
    /// Next sequence number expected from the remote endpoint.
    pub rcv_nxt: TcpSeqNumber,
    /// Window advertised to the remote endpoint.
    pub rcv_wnd: usize,
    pub rcv_up: TcpSeqNumber,
    /// Initial receive sequence number.
    pub irs: TcpSeqNumber,
}

impl Tcb {
    pub fn new(iss: TcpSeqNumber, rcv_wnd: usize) -> Tcb {
        Tcb {
            snd_una: iss,
            snd_nxt: iss,
            snd_up: iss,
            snd_wl2: iss,
            iss,
            rcv_wnd,
            ..Tcb::default()
        }
    }

    /// Record the initial sequence number of the remote endpoint.
    pub fn synchronize(&mut self, irs: TcpSeqNumber) {
        self.irs = irs;
        self.rcv_nxt = irs + 1;
        self.rcv_up = irs + 1;
    }

    /// Return whether a segment of `seg_len` octets of sequence space starting at `seq`
    /// falls, at least partly, within the receive window (RFC 793 § 3.3).
    pub fn check_sequence_number(&self, seq: TcpSeqNumber, seg_len: usize) -> bool {
        let window_end = self.rcv_nxt + self.rcv_wnd;
        let in_window = |seq: TcpSeqNumber| self.rcv_nxt <= seq && seq < window_end;
        match (seg_len, self.rcv_wnd) {
            (0, 0) => seq == self.rcv_nxt,
            (0, _) => in_window(seq),
            (_, 0) => false,
            (_, _) => in_window(seq) || in_window(seq + (seg_len - 1)),
        }
    }

    /// Return whether `ack` acknowledges something sent but not yet acknowledged.
    pub fn is_acceptable_ack(&self, ack: TcpSeqNumber) -> bool {
        self.snd_una < ack && ack <= self.snd_nxt
    }

    /// Take the window from a segment if it is newer than the one the current window came
    /// from. Returns whether the window was updated.
    pub fn update_window(&mut self, seq: TcpSeqNumber, ack: TcpSeqNumber, window: usize) -> bool {
        if self.snd_wl1 < seq || (self.snd_wl1 == seq && self.snd_wl2 <= ack) {
            self.snd_wnd = window;
            self.snd_wl1 = seq;
            self.snd_wl2 = ack;
            true
        } else {
            false
        }
    }

    /// Octets sent but not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        self.snd_nxt - self.snd_una
    }

    /// Octets the remote window still has room for.
    pub fn send_window_available(&self) -> usize {
        let window_end = self.snd_una + self.snd_wnd;
        window_end.distance(self.snd_nxt).max(0) as usize
    }
}

impl fmt::Display for Tcb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "snd_una={} snd_nxt={} snd_wnd={} rcv_nxt={} rcv_wnd={}",
            self.snd_una, self.snd_nxt, self.snd_wnd, self.rcv_nxt, self.rcv_wnd
        )
    }
}
