use super::{
    CloseError, ConnectError, Event, ListenError, ReassemblyBuffer, RetransmitQueue, Segment,
    SendError, State, Tcb,
};
use crate::config::Config;
use crate::rand::Rand;
use crate::socket::PollAt;
use crate::storage::RingBuffer;
use crate::time::{Duration, Instant};
use crate::wire::{TcpFlags, TcpRepr, TcpSeqNumber};

/// Whether a connection takes part in the exchange or only follows it.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Mode {
    /// Sends handshake, acknowledgment, data and retransmitted segments.
    Active,
    /// Tracks state and delivers data but never emits a segment.
    Passive,
}

/// Everything a call into a [Connection] produced, to be acted on once its lock is
/// released.
#[derive(Debug, Default)]
pub struct Dispatch {
    /// Segments to transmit, in order.
    pub segments: Vec<Segment>,
    /// In-order payload for the application, with its push flag.
    pub delivered: Vec<(Vec<u8>, bool)>,
    /// Events for the observers of the connection.
    pub events: Vec<Event>,
}

impl Dispatch {
    pub fn new() -> Dispatch {
        Dispatch::default()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty() && self.delivered.is_empty() && self.events.is_empty()
    }
}

/// The TCP state machine of one connection.
///
/// A connection performs no I/O and reads no clock: every call takes the current time and
/// appends what it produced to a [Dispatch].
#[derive(Debug)]
pub struct Connection {
    mode: Mode,
    state: State,
    last_state: State,
    tcb: Tcb,
    tx_buffer: RingBuffer<'static, u8>,
    reassembly: ReassemblyBuffer,
    retransmit: RetransmitQueue,
    /// Close was requested; a FIN goes out once the send buffer drains.
    fin_pending: bool,
    fin_sent: bool,
    time_wait_until: Option<Instant>,
    error: Option<ConnectError>,
    mss: usize,
    receive_window: usize,
    msl: Duration,
    rand: Rand,
}

impl Connection {
    pub fn new(config: &Config, mode: Mode) -> Connection {
        Connection {
            mode,
            state: State::Closed,
            last_state: State::Closed,
            tcb: Tcb::default(),
            tx_buffer: RingBuffer::new(vec![0; config.send_buffer_size]),
            reassembly: ReassemblyBuffer::new(),
            retransmit: RetransmitQueue::new(config.retransmit_timeout, config.max_retries),
            fin_pending: false,
            fin_sent: false,
            time_wait_until: None,
            error: None,
            mss: config.mss.max(1),
            receive_window: config.receive_window as usize,
            msl: config.msl,
            rand: Rand::from_seed(config.random_seed),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Return the state the connection was in before the current one.
    pub fn last_state(&self) -> State {
        self.last_state
    }

    pub fn tcb(&self) -> &Tcb {
        &self.tcb
    }

    /// Return why the connection last closed abnormally, if it did.
    pub fn error(&self) -> Option<ConnectError> {
        self.error
    }

    /// Octets accepted by [send](Connection::send) and not yet segmented.
    pub fn send_queue(&self) -> usize {
        self.tx_buffer.len()
    }

    pub fn retransmit_queue(&self) -> &RetransmitQueue {
        &self.retransmit
    }

    pub fn reassembly_buffer(&self) -> &ReassemblyBuffer {
        &self.reassembly
    }

    fn set_state(&mut self, state: State) {
        if self.state != state {
            tcp_trace!("state={}=>{}", self.state, state);
            self.last_state = self.state;
        }
        self.state = state;
    }

    /// Create a fresh TCB with a random initial sequence number.
    fn reset_tcb(&mut self) {
        let iss = TcpSeqNumber(self.rand.rand_u32());
        self.tcb = Tcb::new(iss, self.receive_window);
        self.clear_buffers();
        self.error = None;
    }

    fn clear_buffers(&mut self) {
        self.tx_buffer.clear();
        self.reassembly.clear();
        self.retransmit.clear();
        self.fin_pending = false;
        self.fin_sent = false;
        self.time_wait_until = None;
    }

    fn enter_closed(&mut self, event: Event, out: &mut Dispatch) {
        self.clear_buffers();
        self.tcb = Tcb::default();
        self.set_state(State::Closed);
        out.events.push(event);
    }

    fn restart_time_wait(&mut self, now: Instant) {
        self.time_wait_until = Some(now + self.msl);
    }

    fn window_len(&self) -> u16 {
        self.tcb.rcv_wnd.min(u16::MAX as usize) as u16
    }

    fn segment(&self, seq_number: TcpSeqNumber, flags: TcpFlags, payload: Vec<u8>) -> Segment {
        Segment {
            seq_number,
            ack_number: Some(self.tcb.rcv_nxt),
            flags: flags | TcpFlags::ACK,
            window_len: self.window_len(),
            payload,
        }
    }

    fn emit(&self, segment: Segment, out: &mut Dispatch) {
        if self.mode == Mode::Active {
            tcp_trace!("send {}", segment);
            out.segments.push(segment);
        }
    }

    fn emit_tracked(&mut self, now: Instant, segment: Segment, out: &mut Dispatch) {
        if self.mode == Mode::Active {
            tcp_trace!("send {}", segment);
            self.retransmit.track(now, segment.clone());
            out.segments.push(segment);
        }
    }

    fn send_ack(&self, out: &mut Dispatch) {
        self.emit(self.segment(self.tcb.snd_nxt, TcpFlags::empty(), Vec::new()), out)
    }

    fn send_reset(&self, out: &mut Dispatch) {
        let reset = Segment {
            seq_number: self.tcb.snd_nxt,
            ack_number: None,
            flags: TcpFlags::RST,
            window_len: 0,
            payload: Vec::new(),
        };
        self.emit(reset, out)
    }

    /// Answer a segment that has no business arriving, per RFC 793 § 3.4.
    fn send_reset_reply(&self, repr: &TcpRepr, out: &mut Dispatch) {
        let reset = match repr.ack_number {
            Some(ack) => Segment {
                seq_number: ack,
                ack_number: None,
                flags: TcpFlags::RST,
                window_len: 0,
                payload: Vec::new(),
            },
            None => Segment {
                seq_number: TcpSeqNumber(0),
                ack_number: Some(repr.seq_number + repr.segment_len()),
                flags: TcpFlags::RST | TcpFlags::ACK,
                window_len: 0,
                payload: Vec::new(),
            },
        };
        self.emit(reset, out)
    }

    /// Start waiting for a connection request.
    pub fn listen(&mut self) -> Result<(), ListenError> {
        if self.state != State::Closed {
            return Err(ListenError::InvalidState);
        }
        self.reset_tcb();
        self.set_state(State::Listen);
        Ok(())
    }

    /// Send a SYN and start the handshake.
    pub fn connect(&mut self, now: Instant, out: &mut Dispatch) -> Result<(), ConnectError> {
        if self.mode == Mode::Passive || self.state != State::Closed {
            return Err(ConnectError::InvalidState);
        }
        self.reset_tcb();
        let syn = Segment {
            seq_number: self.tcb.iss,
            ack_number: None,
            flags: TcpFlags::SYN,
            window_len: self.window_len(),
            payload: Vec::new(),
        };
        self.tcb.snd_nxt = self.tcb.iss + 1;
        self.emit_tracked(now, syn, out);
        self.set_state(State::SynSent);
        Ok(())
    }

    /// Queue data for transmission and send as much of it as the window allows.
    ///
    /// Data queued before the handshake completes goes out on the transition to
    /// ESTABLISHED. Returns how many octets fit in the send buffer.
    pub fn send(
        &mut self,
        now: Instant,
        data: &[u8],
        out: &mut Dispatch,
    ) -> Result<usize, SendError> {
        let writable = matches!(
            self.state,
            State::SynSent | State::SynReceived | State::Established | State::CloseWait
        );
        if self.mode == Mode::Passive || self.fin_pending || !writable {
            return Err(SendError::InvalidState);
        }
        let size = self.tx_buffer.enqueue_slice(data);
        self.segment_and_send(now, out);
        Ok(size)
    }

    /// Start an orderly close: queued data is sent, followed by a FIN.
    pub fn close(&mut self, now: Instant, out: &mut Dispatch) -> Result<(), CloseError> {
        match self.state {
            State::Closed => Err(CloseError::InvalidState),
            State::Listen | State::SynSent => {
                self.enter_closed(Event::Closed, out);
                Ok(())
            }
            _ if self.mode == Mode::Passive => {
                self.enter_closed(Event::Closed, out);
                Ok(())
            }
            State::SynReceived | State::Established => {
                self.fin_pending = true;
                self.set_state(State::FinWait1);
                self.segment_and_send(now, out);
                Ok(())
            }
            State::CloseWait => {
                self.fin_pending = true;
                self.set_state(State::LastAck);
                self.segment_and_send(now, out);
                Ok(())
            }
            State::FinWait1
            | State::FinWait2
            | State::Closing
            | State::LastAck
            | State::TimeWait => Err(CloseError::InvalidState),
        }
    }

    /// Drop the connection at once, resetting it if the remote endpoint knows about it.
    pub fn abort(&mut self, out: &mut Dispatch) {
        if self.state.is_synchronized() && self.state != State::TimeWait {
            self.send_reset(out);
        }
        if self.state != State::Closed {
            self.enter_closed(Event::Closed, out);
        }
    }

    /// Cut queued data into segments and send those the remote window has room for,
    /// then the FIN if one is pending. Returns whether anything was sent.
    pub fn segment_and_send(&mut self, now: Instant, out: &mut Dispatch) -> bool {
        let may_send = matches!(
            self.state,
            State::Established
                | State::CloseWait
                | State::FinWait1
                | State::Closing
                | State::LastAck
        );
        if !may_send {
            return false;
        }

        let mut sent = false;
        loop {
            let size = self
                .mss
                .min(self.tx_buffer.len())
                .min(self.tcb.send_window_available());
            if size == 0 {
                break;
            }
            let mut payload = vec![0; size];
            self.tx_buffer.dequeue_slice(&mut payload);
            let segment = self.segment(self.tcb.snd_nxt, TcpFlags::PSH, payload);
            self.tcb.snd_nxt += size;
            self.emit_tracked(now, segment, out);
            sent = true;
        }

        if self.fin_pending && !self.fin_sent && self.tx_buffer.is_empty() {
            let fin = self.segment(self.tcb.snd_nxt, TcpFlags::FIN, Vec::new());
            self.tcb.snd_nxt += 1;
            self.fin_sent = true;
            self.emit_tracked(now, fin, out);
            sent = true;
        }
        sent
    }

    /// Run the timers: retransmission, and the end of TIME-WAIT.
    pub fn poll(&mut self, now: Instant, out: &mut Dispatch) -> PollAt {
        if self.state == State::TimeWait
            && self.time_wait_until.is_some_and(|deadline| deadline <= now)
        {
            tcp_trace!("TIME-WAIT elapsed");
            self.enter_closed(Event::Closed, out);
        }

        let mut retransmitted = Vec::new();
        match self.retransmit.poll(now, &mut retransmitted) {
            Ok(()) => {
                for segment in retransmitted {
                    tcp_trace!("retransmit {}", segment);
                    out.segments.push(segment);
                }
            }
            Err(err) => {
                net_debug!("tcp: {}, giving up on the connection", err);
                self.error = Some(ConnectError::TimedOut);
                self.enter_closed(Event::Failed, out);
            }
        }
        self.poll_at()
    }

    /// Return when [poll](Connection::poll) next has something to do.
    pub fn poll_at(&self) -> PollAt {
        let deadline = match (self.retransmit.next_deadline(), self.time_wait_until) {
            (Some(retransmit), Some(time_wait)) => Some(retransmit.min(time_wait)),
            (retransmit, time_wait) => retransmit.or(time_wait),
        };
        deadline.map_or(PollAt::Ingress, PollAt::Time)
    }

    /// Process a received segment whose ports and checksum have been checked.
    pub fn process(&mut self, now: Instant, repr: &TcpRepr, out: &mut Dispatch) {
        tcp_trace!("recv {} in {}", repr, self.state);
        match self.state {
            State::Closed => {
                if !repr.flags.contains(TcpFlags::RST) {
                    self.send_reset_reply(repr, out)
                }
            }
            State::Listen => self.process_listen(now, repr, out),
            State::SynSent => self.process_syn_sent(now, repr, out),
            _ => self.process_synchronized(now, repr, out),
        }
    }

    fn process_listen(&mut self, now: Instant, repr: &TcpRepr, out: &mut Dispatch) {
        if repr.flags.contains(TcpFlags::RST) {
            return;
        }
        if repr.ack_number.is_some() {
            self.send_reset_reply(repr, out);
            return;
        }
        if !repr.flags.contains(TcpFlags::SYN) {
            return;
        }

        self.tcb.synchronize(repr.seq_number);
        self.tcb.snd_wnd = repr.window_len as usize;
        self.tcb.snd_wl1 = repr.seq_number;
        let syn_ack = self.segment(self.tcb.iss, TcpFlags::SYN, Vec::new());
        self.tcb.snd_nxt = self.tcb.iss + 1;
        self.emit_tracked(now, syn_ack, out);
        self.set_state(State::SynReceived);
    }

    fn process_syn_sent(&mut self, now: Instant, repr: &TcpRepr, out: &mut Dispatch) {
        let flags = repr.flags;
        if let Some(ack) = repr.ack_number {
            if ack <= self.tcb.iss || ack > self.tcb.snd_nxt {
                if !flags.contains(TcpFlags::RST) {
                    self.send_reset_reply(repr, out);
                }
                return;
            }
        }
        if flags.contains(TcpFlags::RST) {
            if repr.ack_number.is_some() {
                net_debug!("tcp: connection refused");
                self.error = Some(ConnectError::Reset);
                self.enter_closed(Event::Reset, out);
            }
            return;
        }
        if !flags.contains(TcpFlags::SYN) {
            return;
        }

        self.tcb.synchronize(repr.seq_number);
        if let Some(ack) = repr.ack_number {
            self.tcb.snd_una = ack;
            self.retransmit.acknowledge(ack);
        }
        self.tcb.snd_wnd = repr.window_len as usize;
        self.tcb.snd_wl1 = repr.seq_number;
        self.tcb.snd_wl2 = repr.ack_number.unwrap_or(self.tcb.iss);

        if self.tcb.snd_una > self.tcb.iss {
            self.set_state(State::Established);
            out.events.push(Event::Established);
            self.send_ack(out);
            self.segment_and_send(now, out);
        } else {
            // Simultaneous open: our SYN is answered by the SYN-ACK from now on.
            self.retransmit.clear();
            let syn_ack = self.segment(self.tcb.iss, TcpFlags::SYN, Vec::new());
            self.emit_tracked(now, syn_ack, out);
            self.set_state(State::SynReceived);
        }
    }

    fn process_synchronized(&mut self, now: Instant, repr: &TcpRepr, out: &mut Dispatch) {
        let flags = repr.flags;

        if !self
            .tcb
            .check_sequence_number(repr.seq_number, repr.segment_len())
        {
            if !flags.contains(TcpFlags::RST) {
                net_debug!(
                    "tcp: seq={} len={} outside the receive window at {}",
                    repr.seq_number,
                    repr.segment_len(),
                    self.tcb.rcv_nxt
                );
                if self.state == State::TimeWait && flags.contains(TcpFlags::FIN) {
                    self.restart_time_wait(now);
                }
                self.send_ack(out);
            }
            return;
        }

        if flags.contains(TcpFlags::RST) {
            if self.state == State::SynReceived && self.last_state == State::Listen {
                tcp_trace!("reset during passive open");
                self.reset_tcb();
                self.set_state(State::Listen);
            } else {
                net_debug!("tcp: connection reset by peer");
                self.error = Some(ConnectError::Reset);
                self.enter_closed(Event::Reset, out);
            }
            return;
        }

        if flags.contains(TcpFlags::SYN) {
            net_debug!("tcp: SYN in {}, resetting", self.state);
            self.send_reset(out);
            self.error = Some(ConnectError::Reset);
            self.enter_closed(Event::Reset, out);
            return;
        }

        let Some(ack) = repr.ack_number else {
            return;
        };
        if self.mode == Mode::Passive {
            // The other side's sequence space is not ours to check.
            if self.state == State::SynReceived {
                self.set_state(State::Established);
                out.events.push(Event::Established);
            }
        } else if !self.process_ack(now, repr, ack, out) {
            return;
        }

        let mut needs_ack = false;
        if !repr.payload.is_empty()
            && matches!(
                self.state,
                State::Established | State::FinWait1 | State::FinWait2
            )
        {
            let push = flags.contains(TcpFlags::PSH);
            if !self.reassembly.insert(repr.seq_number, repr.payload, push) {
                tcp_trace!("duplicate segment seq={}", repr.seq_number);
            }
            while let Some(delivered) = self.reassembly.pop(&mut self.tcb.rcv_nxt) {
                out.delivered.push(delivered);
            }
            needs_ack = true;
        }

        if flags.contains(TcpFlags::FIN) {
            let fin_seq = repr.seq_number + repr.payload.len();
            if fin_seq == self.tcb.rcv_nxt {
                self.tcb.rcv_nxt += 1;
                needs_ack = true;
                match self.state {
                    State::SynReceived | State::Established => self.set_state(State::CloseWait),
                    State::FinWait1 => self.set_state(State::Closing),
                    State::FinWait2 => {
                        self.set_state(State::TimeWait);
                        self.restart_time_wait(now);
                    }
                    State::TimeWait => self.restart_time_wait(now),
                    _ => {}
                }
            } else {
                tcp_trace!("FIN at {} ahead of missing data", fin_seq);
            }
        }

        if needs_ack {
            self.send_ack(out);
        }
        self.segment_and_send(now, out);
    }

    /// Handle the acknowledgment field of a segment in a synchronized state. Returns
    /// whether processing of the segment continues.
    fn process_ack(
        &mut self,
        now: Instant,
        repr: &TcpRepr,
        ack: TcpSeqNumber,
        out: &mut Dispatch,
    ) -> bool {
        if self.state == State::SynReceived {
            if !self.tcb.is_acceptable_ack(ack) {
                self.send_reset_reply(repr, out);
                return false;
            }
            self.set_state(State::Established);
            out.events.push(Event::Established);
        }

        if ack > self.tcb.snd_nxt {
            net_debug!("tcp: ack={} for data not yet sent", ack);
            self.send_ack(out);
            return false;
        }
        if self.tcb.snd_una < ack {
            self.tcb.snd_una = ack;
            self.retransmit.acknowledge(ack);
        }
        if self.tcb.snd_una <= ack {
            self.tcb
                .update_window(repr.seq_number, ack, repr.window_len as usize);
        }

        let fin_acked = self.fin_sent && !self.retransmit.contains_fin();
        match self.state {
            State::FinWait1 if fin_acked => self.set_state(State::FinWait2),
            State::Closing if fin_acked => {
                self.set_state(State::TimeWait);
                self.restart_time_wait(now);
            }
            State::LastAck if fin_acked => {
                self.enter_closed(Event::Closed, out);
                return false;
            }
            _ => {}
        }
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const T0: Instant = Instant::ZERO;
    const PEER_IRS: u32 = 49;

    fn config() -> Config {
        let mut config = Config::default();
        config.random_seed = Some(0x5eed);
        config
    }

    fn repr(seq: u32, ack: Option<TcpSeqNumber>, flags: TcpFlags, payload: &[u8]) -> TcpRepr<'_> {
        let mut flags = flags;
        flags.set(TcpFlags::ACK, ack.is_some());
        TcpRepr {
            src_port: 4000,
            dst_port: 80,
            flags,
            seq_number: TcpSeqNumber(seq),
            ack_number: ack,
            window_len: u16::MAX,
            urgent_at: 0,
            payload,
        }
    }

    fn ack_segment(seq: TcpSeqNumber, ack: u32) -> Segment {
        Segment {
            seq_number: seq,
            ack_number: Some(TcpSeqNumber(ack)),
            flags: TcpFlags::ACK,
            window_len: u16::MAX,
            payload: Vec::new(),
        }
    }

    /// An actively opened connection whose peer started at `PEER_IRS`, so `RCV_NXT` is 50.
    fn established_with(config: &Config) -> Connection {
        let mut conn = Connection::new(config, Mode::Active);
        let mut out = Dispatch::new();
        conn.connect(T0, &mut out).unwrap();
        let iss = conn.tcb().iss;
        conn.process(
            T0,
            &repr(PEER_IRS, Some(iss + 1), TcpFlags::SYN, b""),
            &mut out,
        );
        assert_eq!(conn.state(), State::Established);
        conn
    }

    fn established() -> Connection {
        established_with(&config())
    }

    #[test]
    fn test_active_open() {
        let mut conn = Connection::new(&config(), Mode::Active);
        let mut out = Dispatch::new();
        conn.connect(T0, &mut out).unwrap();
        let iss = conn.tcb().iss;
        assert_eq!(conn.state(), State::SynSent);
        assert_eq!(
            out.segments,
            vec![Segment {
                seq_number: iss,
                ack_number: None,
                flags: TcpFlags::SYN,
                window_len: u16::MAX,
                payload: Vec::new(),
            }]
        );

        let mut out = Dispatch::new();
        conn.process(T0, &repr(PEER_IRS, Some(iss + 1), TcpFlags::SYN, b""), &mut out);
        assert_eq!(conn.state(), State::Established);
        assert_eq!(out.segments, vec![ack_segment(iss + 1, 50)]);
        assert_eq!(out.events, vec![Event::Established]);
        assert!(conn.retransmit_queue().is_empty());
    }

    #[test]
    fn test_passive_open() {
        let mut conn = Connection::new(&config(), Mode::Active);
        conn.listen().unwrap();
        let iss = conn.tcb().iss;

        let mut out = Dispatch::new();
        conn.process(T0, &repr(100, None, TcpFlags::SYN, b""), &mut out);
        assert_eq!(conn.state(), State::SynReceived);
        assert_eq!(out.segments.len(), 1);
        let syn_ack = &out.segments[0];
        assert_eq!(syn_ack.flags, TcpFlags::SYN | TcpFlags::ACK);
        assert_eq!(syn_ack.seq_number, iss);
        assert_eq!(syn_ack.ack_number, Some(TcpSeqNumber(101)));
        assert_eq!(conn.retransmit_queue().len(), 1);

        let mut out = Dispatch::new();
        conn.process(T0, &repr(101, Some(iss + 1), TcpFlags::empty(), b""), &mut out);
        assert_eq!(conn.state(), State::Established);
        assert!(out.segments.is_empty());
        assert_eq!(out.events, vec![Event::Established]);
        assert!(conn.retransmit_queue().is_empty());
    }

    #[test]
    fn test_simultaneous_open() {
        let mut conn = Connection::new(&config(), Mode::Active);
        let mut out = Dispatch::new();
        conn.connect(T0, &mut out).unwrap();
        let iss = conn.tcb().iss;

        let mut out = Dispatch::new();
        conn.process(T0, &repr(300, None, TcpFlags::SYN, b""), &mut out);
        assert_eq!(conn.state(), State::SynReceived);
        assert_eq!(conn.last_state(), State::SynSent);
        assert_eq!(out.segments.len(), 1);
        assert_eq!(out.segments[0].flags, TcpFlags::SYN | TcpFlags::ACK);
        assert_eq!(out.segments[0].seq_number, iss);
        assert_eq!(out.segments[0].ack_number, Some(TcpSeqNumber(301)));
        assert_eq!(conn.retransmit_queue().len(), 1);

        let mut out = Dispatch::new();
        conn.process(T0, &repr(301, Some(iss + 1), TcpFlags::empty(), b""), &mut out);
        assert_eq!(conn.state(), State::Established);
    }

    #[test]
    fn test_syn_sent_bad_ack_is_reset() {
        let mut conn = Connection::new(&config(), Mode::Active);
        let mut out = Dispatch::new();
        conn.connect(T0, &mut out).unwrap();
        let iss = conn.tcb().iss;

        let mut out = Dispatch::new();
        conn.process(T0, &repr(7, Some(iss + 5), TcpFlags::SYN, b""), &mut out);
        assert_eq!(conn.state(), State::SynSent);
        assert_eq!(out.segments.len(), 1);
        assert_eq!(out.segments[0].flags, TcpFlags::RST);
        assert_eq!(out.segments[0].seq_number, iss + 5);
    }

    #[test]
    fn test_connection_refused() {
        let mut conn = Connection::new(&config(), Mode::Active);
        let mut out = Dispatch::new();
        conn.connect(T0, &mut out).unwrap();
        let iss = conn.tcb().iss;

        let mut out = Dispatch::new();
        conn.process(T0, &repr(0, Some(iss + 1), TcpFlags::RST, b""), &mut out);
        assert_eq!(conn.state(), State::Closed);
        assert_eq!(out.events, vec![Event::Reset]);
        assert_eq!(conn.error(), Some(ConnectError::Reset));
    }

    #[test]
    fn test_segmentation() {
        let mut conn = established();
        let iss = conn.tcb().iss;
        let data: Vec<u8> = (0..3000).map(|i| i as u8).collect();

        let mut out = Dispatch::new();
        assert_eq!(conn.send(T0, &data, &mut out), Ok(3000));
        let seqs: Vec<TcpSeqNumber> = out.segments.iter().map(|s| s.seq_number).collect();
        assert_eq!(seqs, vec![iss + 1, iss + 1401, iss + 2801]);
        let sizes: Vec<usize> = out.segments.iter().map(|s| s.payload.len()).collect();
        assert_eq!(sizes, vec![1400, 1400, 200]);
        let joined: Vec<u8> = out.segments.iter().flat_map(|s| s.payload.clone()).collect();
        assert_eq!(joined, data);
        for segment in out.segments.iter() {
            assert_eq!(segment.flags, TcpFlags::ACK | TcpFlags::PSH);
            assert_eq!(segment.ack_number, Some(TcpSeqNumber(50)));
        }
        assert_eq!(conn.retransmit_queue().len(), 3);
        assert_eq!(conn.tcb().snd_nxt, iss + 3001);
    }

    #[test]
    fn test_send_bounded_by_window() {
        let mut conn = Connection::new(&config(), Mode::Active);
        let mut out = Dispatch::new();
        conn.connect(T0, &mut out).unwrap();
        let iss = conn.tcb().iss;
        let mut syn_ack = repr(PEER_IRS, Some(iss + 1), TcpFlags::SYN, b"");
        syn_ack.window_len = 2000;
        conn.process(T0, &syn_ack, &mut out);

        let mut out = Dispatch::new();
        conn.send(T0, &[0xaa; 3000], &mut out).unwrap();
        let sizes: Vec<usize> = out.segments.iter().map(|s| s.payload.len()).collect();
        assert_eq!(sizes, vec![1400, 600]);
        assert_eq!(conn.send_queue(), 1000);

        // The window slides as the first segment is acknowledged.
        let mut out = Dispatch::new();
        let mut ack = repr(50, Some(iss + 1401), TcpFlags::empty(), b"");
        ack.window_len = 2000;
        conn.process(T0, &ack, &mut out);
        let sizes: Vec<usize> = out.segments.iter().map(|s| s.payload.len()).collect();
        assert_eq!(sizes, vec![1000]);
        assert_eq!(out.segments[0].seq_number, iss + 2001);
        assert_eq!(conn.send_queue(), 0);
    }

    #[test]
    fn test_send_deferred_until_established() {
        let mut conn = Connection::new(&config(), Mode::Active);
        let mut out = Dispatch::new();
        conn.connect(T0, &mut out).unwrap();
        let iss = conn.tcb().iss;

        let mut out = Dispatch::new();
        assert_eq!(conn.send(T0, b"early", &mut out), Ok(5));
        assert!(out.segments.is_empty());

        conn.process(T0, &repr(PEER_IRS, Some(iss + 1), TcpFlags::SYN, b""), &mut out);
        assert_eq!(out.segments.len(), 2);
        assert_eq!(out.segments[0], ack_segment(iss + 1, 50));
        assert_eq!(out.segments[1].seq_number, iss + 1);
        assert_eq!(out.segments[1].payload, b"early".to_vec());
    }

    #[test]
    fn test_retransmission_then_failure() {
        let mut conn = established();
        let mut out = Dispatch::new();
        conn.send(T0, b"0123456789", &mut out).unwrap();
        let original = out.segments[0].clone();

        let mut out = Dispatch::new();
        conn.poll(Instant::from_millis(1999), &mut out);
        assert!(out.is_empty());

        for round in 1..=3 {
            let mut out = Dispatch::new();
            conn.poll(Instant::from_millis(2000 * round), &mut out);
            assert_eq!(out.segments, vec![original.clone()]);
            assert!(out.events.is_empty());
        }

        let mut out = Dispatch::new();
        assert_eq!(conn.poll(Instant::from_millis(8000), &mut out), PollAt::Ingress);
        assert_eq!(conn.state(), State::Closed);
        assert_eq!(out.events, vec![Event::Failed]);
        assert!(out.segments.is_empty());
        assert_eq!(conn.error(), Some(ConnectError::TimedOut));

        let mut out = Dispatch::new();
        conn.poll(Instant::from_millis(10_000), &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_poll_at_follows_retransmit_deadline() {
        let mut conn = established();
        assert_eq!(conn.poll_at(), PollAt::Ingress);
        let mut out = Dispatch::new();
        conn.send(Instant::from_millis(500), b"x", &mut out).unwrap();
        assert_eq!(conn.poll_at(), PollAt::Time(Instant::from_millis(2500)));
    }

    #[test]
    fn test_out_of_order_delivery() {
        let mut conn = established();
        let ack = Some(conn.tcb().iss + 1);

        let mut out = Dispatch::new();
        conn.process(T0, &repr(100, ack, TcpFlags::PSH, &[1; 50]), &mut out);
        assert!(out.delivered.is_empty());
        assert_eq!(out.segments.len(), 1);
        assert_eq!(out.segments[0].ack_number, Some(TcpSeqNumber(50)));

        let mut out = Dispatch::new();
        conn.process(T0, &repr(50, ack, TcpFlags::PSH, &[0; 50]), &mut out);
        assert_eq!(out.delivered, vec![(vec![0; 50], true), (vec![1; 50], true)]);
        assert_eq!(conn.tcb().rcv_nxt, TcpSeqNumber(150));

        let mut out = Dispatch::new();
        conn.process(T0, &repr(200, ack, TcpFlags::empty(), &[3; 50]), &mut out);
        assert!(out.delivered.is_empty());
        assert_eq!(conn.reassembly_buffer().len(), 1);

        let mut out = Dispatch::new();
        conn.process(T0, &repr(150, ack, TcpFlags::empty(), &[2; 50]), &mut out);
        assert_eq!(out.delivered, vec![(vec![2; 50], false), (vec![3; 50], false)]);
        assert_eq!(out.segments.last().and_then(|s| s.ack_number), Some(TcpSeqNumber(250)));
    }

    #[test]
    fn test_duplicate_segment_delivered_once() {
        let mut conn = established();
        let ack = Some(conn.tcb().iss + 1);
        let mut out = Dispatch::new();
        conn.process(T0, &repr(100, ack, TcpFlags::empty(), b"first"), &mut out);
        conn.process(T0, &repr(100, ack, TcpFlags::empty(), b"again"), &mut out);
        assert_eq!(conn.reassembly_buffer().len(), 1);

        let mut out = Dispatch::new();
        conn.process(T0, &repr(50, ack, TcpFlags::empty(), &[0; 50]), &mut out);
        assert_eq!(
            out.delivered,
            vec![(vec![0; 50], false), (b"first".to_vec(), false)]
        );

        // A retransmission of delivered data is acknowledged, not delivered.
        let mut out = Dispatch::new();
        conn.process(T0, &repr(50, ack, TcpFlags::empty(), &[0; 50]), &mut out);
        assert!(out.delivered.is_empty());
        assert_eq!(out.segments, vec![ack_segment(conn.tcb().snd_nxt, 105)]);
    }

    #[test]
    fn test_out_of_window_gets_bare_ack() {
        let mut conn = established();
        let iss = conn.tcb().iss;
        let mut out = Dispatch::new();
        conn.process(T0, &repr(50 + 70_000, Some(iss + 1), TcpFlags::empty(), b"far"), &mut out);
        assert!(out.delivered.is_empty());
        assert_eq!(out.segments, vec![ack_segment(iss + 1, 50)]);
        assert_eq!(conn.state(), State::Established);
    }

    #[test]
    fn test_ack_for_unsent_data() {
        let mut conn = established();
        let iss = conn.tcb().iss;
        let mut out = Dispatch::new();
        conn.process(T0, &repr(50, Some(iss + 100), TcpFlags::empty(), b"data"), &mut out);
        assert_eq!(out.segments, vec![ack_segment(iss + 1, 50)]);
        assert!(out.delivered.is_empty());
        assert_eq!(conn.tcb().snd_una, iss + 1);
    }

    #[test]
    fn test_active_close() {
        let mut conn = established();
        let iss = conn.tcb().iss;

        let mut out = Dispatch::new();
        conn.close(T0, &mut out).unwrap();
        assert_eq!(conn.state(), State::FinWait1);
        assert_eq!(out.segments.len(), 1);
        assert_eq!(out.segments[0].flags, TcpFlags::FIN | TcpFlags::ACK);
        assert_eq!(out.segments[0].seq_number, iss + 1);
        assert!(conn.retransmit_queue().contains_fin());

        let mut out = Dispatch::new();
        conn.process(T0, &repr(50, Some(iss + 2), TcpFlags::empty(), b""), &mut out);
        assert_eq!(conn.state(), State::FinWait2);
        assert!(out.segments.is_empty());

        let t1 = Instant::from_secs(1);
        let mut out = Dispatch::new();
        conn.process(t1, &repr(50, Some(iss + 2), TcpFlags::FIN, b""), &mut out);
        assert_eq!(conn.state(), State::TimeWait);
        assert_eq!(out.segments, vec![ack_segment(iss + 2, 51)]);
        assert_eq!(conn.poll_at(), PollAt::Time(t1 + Duration::from_secs(30)));

        let mut out = Dispatch::new();
        conn.poll(t1 + Duration::from_millis(29_999), &mut out);
        assert_eq!(conn.state(), State::TimeWait);
        conn.poll(t1 + Duration::from_secs(30), &mut out);
        assert_eq!(conn.state(), State::Closed);
        assert_eq!(out.events, vec![Event::Closed]);
        assert!(out.segments.is_empty());
    }

    #[test]
    fn test_close_sends_queued_data_first() {
        let mut config = config();
        config.mss = 4;
        let mut conn = established_with(&config);
        let iss = conn.tcb().iss;
        let mut closed_window = repr(50, Some(iss + 1), TcpFlags::empty(), b"");
        closed_window.window_len = 0;
        let mut out = Dispatch::new();
        conn.process(T0, &closed_window, &mut out);
        conn.send(T0, b"abcdef", &mut out).unwrap();
        let mut out = Dispatch::new();
        conn.close(T0, &mut out).unwrap();
        assert!(out.segments.is_empty());
        assert_eq!(conn.state(), State::FinWait1);

        // Opening it releases the data, then the FIN.
        let mut out = Dispatch::new();
        conn.process(T0, &repr(50, Some(iss + 1), TcpFlags::empty(), b""), &mut out);
        let flags: Vec<TcpFlags> = out.segments.iter().map(|s| s.flags).collect();
        assert_eq!(
            flags,
            vec![
                TcpFlags::ACK | TcpFlags::PSH,
                TcpFlags::ACK | TcpFlags::PSH,
                TcpFlags::ACK | TcpFlags::FIN
            ]
        );
        assert_eq!(out.segments[2].seq_number, iss + 7);
    }

    #[test]
    fn test_passive_close() {
        let mut conn = established();
        let iss = conn.tcb().iss;

        let mut out = Dispatch::new();
        conn.process(T0, &repr(50, Some(iss + 1), TcpFlags::FIN, b""), &mut out);
        assert_eq!(conn.state(), State::CloseWait);
        assert_eq!(out.segments, vec![ack_segment(iss + 1, 51)]);

        let mut out = Dispatch::new();
        assert_eq!(conn.send(T0, b"bye", &mut out), Ok(3));
        conn.close(T0, &mut out).unwrap();
        assert_eq!(conn.state(), State::LastAck);
        assert_eq!(out.segments.len(), 2);
        assert_eq!(out.segments[1].flags, TcpFlags::FIN | TcpFlags::ACK);
        assert_eq!(out.segments[1].seq_number, iss + 4);

        let mut out = Dispatch::new();
        conn.process(T0, &repr(51, Some(iss + 5), TcpFlags::empty(), b""), &mut out);
        assert_eq!(conn.state(), State::Closed);
        assert_eq!(out.events, vec![Event::Closed]);
    }

    #[test]
    fn test_simultaneous_close() {
        let mut conn = established();
        let iss = conn.tcb().iss;
        let mut out = Dispatch::new();
        conn.close(T0, &mut out).unwrap();

        let mut out = Dispatch::new();
        conn.process(T0, &repr(50, Some(iss + 1), TcpFlags::FIN, b""), &mut out);
        assert_eq!(conn.state(), State::Closing);
        assert_eq!(out.segments, vec![ack_segment(iss + 2, 51)]);

        let mut out = Dispatch::new();
        conn.process(T0, &repr(51, Some(iss + 2), TcpFlags::empty(), b""), &mut out);
        assert_eq!(conn.state(), State::TimeWait);
        assert!(out.segments.is_empty());
    }

    #[test]
    fn test_peer_fin_before_ours_is_sent() {
        let mut config = config();
        config.mss = 4;
        let mut conn = established_with(&config);
        let iss = conn.tcb().iss;
        let mut small_window = repr(50, Some(iss + 1), TcpFlags::empty(), b"");
        small_window.window_len = 4;
        let mut out = Dispatch::new();
        conn.process(T0, &small_window, &mut out);
        assert_eq!(conn.send(T0, b"abcdef", &mut out), Ok(6));
        assert_eq!(conn.send_queue(), 2);
        let mut out = Dispatch::new();
        conn.close(T0, &mut out).unwrap();
        assert_eq!(conn.state(), State::FinWait1);
        assert!(out.segments.is_empty());

        let mut fin = repr(50, Some(iss + 1), TcpFlags::FIN, b"");
        fin.window_len = 4;
        let mut out = Dispatch::new();
        conn.process(T0, &fin, &mut out);
        assert_eq!(conn.state(), State::Closing);
        assert_eq!(out.segments, vec![ack_segment(iss + 5, 51)]);

        // Window room lets the rest of the data out, then our FIN.
        let mut ack = repr(51, Some(iss + 5), TcpFlags::empty(), b"");
        ack.window_len = 100;
        let mut out = Dispatch::new();
        conn.process(T0, &ack, &mut out);
        assert_eq!(conn.state(), State::Closing);
        assert_eq!(out.segments.len(), 2);
        assert_eq!(out.segments[0].payload, b"ef".to_vec());
        assert_eq!(out.segments[0].seq_number, iss + 5);
        assert_eq!(out.segments[1].flags, TcpFlags::ACK | TcpFlags::FIN);
        assert_eq!(out.segments[1].seq_number, iss + 7);
        assert_eq!(conn.send_queue(), 0);

        let mut out = Dispatch::new();
        conn.process(T0, &repr(51, Some(iss + 8), TcpFlags::empty(), b""), &mut out);
        assert_eq!(conn.state(), State::TimeWait);
        assert!(conn.retransmit_queue().is_empty());
    }

    #[test]
    fn test_time_wait_fin_reacked() {
        let mut conn = established();
        let iss = conn.tcb().iss;
        let mut out = Dispatch::new();
        conn.close(T0, &mut out).unwrap();
        conn.process(T0, &repr(50, Some(iss + 2), TcpFlags::FIN, b""), &mut out);
        assert_eq!(conn.state(), State::TimeWait);

        // The peer did not hear our ACK and sends its FIN again.
        let t1 = Instant::from_secs(10);
        let mut out = Dispatch::new();
        conn.process(t1, &repr(50, Some(iss + 2), TcpFlags::FIN, b""), &mut out);
        assert_eq!(out.segments, vec![ack_segment(iss + 2, 51)]);
        assert_eq!(conn.state(), State::TimeWait);

        conn.poll(Instant::from_secs(30), &mut out);
        assert_eq!(conn.state(), State::TimeWait);
        conn.poll(Instant::from_secs(40), &mut out);
        assert_eq!(conn.state(), State::Closed);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut conn = established();
        let mut out = Dispatch::new();
        conn.send(T0, b"unacknowledged", &mut out).unwrap();
        conn.process(T0, &repr(100, Some(conn.tcb().iss + 1), TcpFlags::empty(), b"gap"), &mut out);
        assert_eq!(conn.retransmit_queue().len(), 1);
        assert_eq!(conn.reassembly_buffer().len(), 1);

        let mut out = Dispatch::new();
        conn.process(T0, &repr(50, None, TcpFlags::RST, b""), &mut out);
        assert_eq!(conn.state(), State::Closed);
        assert_eq!(out.events, vec![Event::Reset]);
        assert!(out.segments.is_empty());
        assert!(conn.retransmit_queue().is_empty());
        assert!(conn.reassembly_buffer().is_empty());
        assert_eq!(conn.send_queue(), 0);
    }

    #[test]
    fn test_reset_outside_window_ignored() {
        let mut conn = established();
        let mut out = Dispatch::new();
        conn.process(T0, &repr(50 + 70_000, None, TcpFlags::RST, b""), &mut out);
        assert_eq!(conn.state(), State::Established);
        assert!(out.is_empty());
    }

    #[test]
    fn test_reset_returns_to_listen() {
        let mut conn = Connection::new(&config(), Mode::Active);
        conn.listen().unwrap();
        let mut out = Dispatch::new();
        conn.process(T0, &repr(100, None, TcpFlags::SYN, b""), &mut out);
        assert_eq!(conn.state(), State::SynReceived);

        let mut out = Dispatch::new();
        conn.process(T0, &repr(101, None, TcpFlags::RST, b""), &mut out);
        assert_eq!(conn.state(), State::Listen);
        assert!(out.events.is_empty());
        assert!(conn.retransmit_queue().is_empty());
    }

    #[test]
    fn test_reset_after_simultaneous_open_closes() {
        let mut conn = Connection::new(&config(), Mode::Active);
        let mut out = Dispatch::new();
        conn.connect(T0, &mut out).unwrap();
        conn.process(T0, &repr(300, None, TcpFlags::SYN, b""), &mut out);
        assert_eq!(conn.state(), State::SynReceived);

        let mut out = Dispatch::new();
        conn.process(T0, &repr(301, None, TcpFlags::RST, b""), &mut out);
        assert_eq!(conn.state(), State::Closed);
        assert_eq!(out.events, vec![Event::Reset]);
    }

    #[test]
    fn test_syn_in_window_resets() {
        let mut conn = established();
        let snd_nxt = conn.tcb().snd_nxt;
        let mut out = Dispatch::new();
        conn.process(T0, &repr(60, None, TcpFlags::SYN, b""), &mut out);
        assert_eq!(conn.state(), State::Closed);
        assert_eq!(out.segments.len(), 1);
        assert_eq!(out.segments[0].flags, TcpFlags::RST);
        assert_eq!(out.segments[0].seq_number, snd_nxt);
        assert_eq!(out.events, vec![Event::Reset]);
    }

    #[test]
    fn test_closed_answers_with_reset() {
        let mut conn = Connection::new(&config(), Mode::Active);
        let mut out = Dispatch::new();
        conn.process(T0, &repr(7, None, TcpFlags::SYN, b""), &mut out);
        assert_eq!(out.segments.len(), 1);
        assert_eq!(out.segments[0].flags, TcpFlags::RST | TcpFlags::ACK);
        assert_eq!(out.segments[0].seq_number, TcpSeqNumber(0));
        assert_eq!(out.segments[0].ack_number, Some(TcpSeqNumber(8)));

        let mut out = Dispatch::new();
        conn.process(T0, &repr(7, None, TcpFlags::RST, b""), &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_invalid_api_use() {
        let mut conn = Connection::new(&config(), Mode::Active);
        let mut out = Dispatch::new();
        assert_eq!(conn.send(T0, b"x", &mut out), Err(SendError::InvalidState));
        assert_eq!(conn.close(T0, &mut out), Err(CloseError::InvalidState));
        conn.listen().unwrap();
        assert_eq!(conn.listen(), Err(ListenError::InvalidState));
        assert_eq!(conn.connect(T0, &mut out), Err(ConnectError::InvalidState));
        assert_eq!(conn.state(), State::Listen);

        let mut conn = established();
        conn.close(T0, &mut out).unwrap();
        assert_eq!(conn.close(T0, &mut out), Err(CloseError::InvalidState));
        assert_eq!(conn.send(T0, b"x", &mut out), Err(SendError::InvalidState));
        assert_eq!(conn.state(), State::FinWait1);
    }

    #[test]
    fn test_abort() {
        let mut conn = established();
        let snd_nxt = conn.tcb().snd_nxt;
        let mut out = Dispatch::new();
        conn.abort(&mut out);
        assert_eq!(conn.state(), State::Closed);
        assert_eq!(out.segments.len(), 1);
        assert_eq!(out.segments[0].flags, TcpFlags::RST);
        assert_eq!(out.segments[0].seq_number, snd_nxt);
        assert_eq!(out.events, vec![Event::Closed]);

        let mut out = Dispatch::new();
        conn.abort(&mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_passive_mode_never_transmits() {
        let mut conn = Connection::new(&config(), Mode::Passive);
        let mut out = Dispatch::new();
        assert_eq!(conn.connect(T0, &mut out), Err(ConnectError::InvalidState));
        conn.listen().unwrap();

        conn.process(T0, &repr(100, None, TcpFlags::SYN, b""), &mut out);
        assert_eq!(conn.state(), State::SynReceived);
        conn.process(T0, &repr(101, Some(TcpSeqNumber(9000)), TcpFlags::empty(), b""), &mut out);
        assert_eq!(conn.state(), State::Established);
        conn.process(T0, &repr(101, Some(TcpSeqNumber(9000)), TcpFlags::PSH, b"hello"), &mut out);
        conn.process(T0, &repr(106, Some(TcpSeqNumber(9000)), TcpFlags::FIN, b""), &mut out);
        assert_eq!(conn.state(), State::CloseWait);

        assert!(out.segments.is_empty());
        assert_eq!(out.delivered, vec![(b"hello".to_vec(), true)]);
        assert_eq!(out.events, vec![Event::Established]);
        assert_eq!(conn.send(T0, b"x", &mut out), Err(SendError::InvalidState));
        assert_eq!(conn.poll_at(), PollAt::Ingress);
    }
}
