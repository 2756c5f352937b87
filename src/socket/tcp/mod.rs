/*! The TCP layer.

[TcpSocket] runs one connection: handshake, segmentation, sliding-window flow control,
retransmission and in-order delivery. [TcpListenerSocket] follows a connection through
the same state machine without ever sending a segment.

The protocol logic lives in a sans-IO connection engine driven with explicit timestamps;
the sockets add locking, blocking calls, the retransmission timer and the frame plumbing.
*/

use core::fmt::{self, Display};
use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::frame::{Frame, Kind};
use crate::socket::ip::PseudoHeaderSource;
use crate::socket::{Direction, Links};
use crate::wire::{TcpFlags, TcpPacket, TcpRepr, TcpSeqNumber, TCP_HEADER_LEN};

macro_rules! tcp_trace {
    ($($arg:expr),* $(,)?) => (net_log!(trace, $($arg),*));
}

mod connection;
mod listener;
mod reassembly;
mod retransmit;
mod socket;
mod tcb;

pub use self::connection::{Connection, Dispatch, Mode};
pub use self::listener::TcpListenerSocket;
pub use self::reassembly::ReassemblyBuffer;
pub use self::retransmit::{RetransmitQueue, RetriesExhausted};
pub use self::socket::TcpSocket;
pub use self::tcb::Tcb;

/// Error returned by [`TcpSocket::listen`]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ListenError {
    InvalidState,
}

impl Display for ListenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ListenError::InvalidState => write!(f, "invalid state"),
        }
    }
}

impl core::error::Error for ListenError {}

/// Error returned by [`TcpSocket::connect`]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ConnectError {
    InvalidState,
    /// The remote endpoint refused or reset the connection.
    Reset,
    /// The handshake was retransmitted too many times.
    TimedOut,
}

impl Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ConnectError::InvalidState => write!(f, "invalid state"),
            ConnectError::Reset => write!(f, "connection reset"),
            ConnectError::TimedOut => write!(f, "connection timed out"),
        }
    }
}

impl core::error::Error for ConnectError {}

/// Error returned by [`TcpSocket::send`]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SendError {
    InvalidState,
}

impl Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            SendError::InvalidState => write!(f, "invalid state"),
        }
    }
}

impl core::error::Error for SendError {}

/// Error returned by [`TcpSocket::close`]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CloseError {
    InvalidState,
}

impl Display for CloseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            CloseError::InvalidState => write!(f, "invalid state"),
        }
    }
}

impl core::error::Error for CloseError {}

/// The state of a TCP connection, according to [RFC 793].
///
/// [RFC 793]: https://tools.ietf.org/html/rfc793
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum State {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            State::Closed => write!(f, "CLOSED"),
            State::Listen => write!(f, "LISTEN"),
            State::SynSent => write!(f, "SYN-SENT"),
            State::SynReceived => write!(f, "SYN-RECEIVED"),
            State::Established => write!(f, "ESTABLISHED"),
            State::FinWait1 => write!(f, "FIN-WAIT-1"),
            State::FinWait2 => write!(f, "FIN-WAIT-2"),
            State::CloseWait => write!(f, "CLOSE-WAIT"),
            State::Closing => write!(f, "CLOSING"),
            State::LastAck => write!(f, "LAST-ACK"),
            State::TimeWait => write!(f, "TIME-WAIT"),
        }
    }
}

impl State {
    /// Return whether both sequence spaces are known in this state.
    pub fn is_synchronized(&self) -> bool {
        !matches!(self, State::Closed | State::Listen | State::SynSent)
    }
}

/// Something an observer of a connection is told about.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Event {
    /// The handshake completed.
    Established,
    /// The connection finished closing.
    Closed,
    /// The connection was reset by, or had to be reset because of, the remote endpoint.
    Reset,
    /// A segment went unacknowledged after every retransmission; the connection is closed.
    Failed,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Event::Established => write!(f, "established"),
            Event::Closed => write!(f, "closed"),
            Event::Reset => write!(f, "reset"),
            Event::Failed => write!(f, "failed"),
        }
    }
}

/// An outgoing segment, without its ports.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Segment {
    pub seq_number: TcpSeqNumber,
    pub ack_number: Option<TcpSeqNumber>,
    pub flags: TcpFlags,
    pub window_len: u16,
    pub payload: Vec<u8>,
}

impl Segment {
    /// Return the length of the segment, in terms of sequence space.
    pub fn segment_len(&self) -> usize {
        let mut length = self.payload.len();
        if self.flags.contains(TcpFlags::SYN) {
            length += 1
        }
        if self.flags.contains(TcpFlags::FIN) {
            length += 1
        }
        length
    }

    pub fn as_repr(&self, src_port: u16, dst_port: u16) -> TcpRepr<'_> {
        TcpRepr {
            src_port,
            dst_port,
            flags: self.flags,
            seq_number: self.seq_number,
            ack_number: self.ack_number,
            window_len: self.window_len,
            urgent_at: 0,
            payload: &self.payload,
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} seq={}", self.flags, self.seq_number)?;
        if let Some(ack_number) = self.ack_number {
            write!(f, " ack={ack_number}")?;
        }
        write!(f, " len={}", self.payload.len())
    }
}

/// What to do with a frame pushed up into a TCP socket.
#[derive(Debug)]
enum Inbound {
    /// Not addressed to this socket's ports.
    NotMine,
    /// Addressed to this socket but unusable; claimed and dropped.
    Discard,
    /// A well-formed, correctly checksummed segment.
    Accept(Vec<u8>),
}

fn classify(
    frame: &Frame,
    local_port: u16,
    remote_port: u16,
    ip: &dyn PseudoHeaderSource,
) -> Inbound {
    let bytes = frame.bytes();
    let Ok(packet) = TcpPacket::new_checked(&bytes[..]) else {
        tcp_trace!("tcp: truncated segment");
        return Inbound::NotMine;
    };
    if packet.dst_port() != local_port || packet.src_port() != remote_port {
        return Inbound::NotMine;
    }
    let pseudo_header = ip.pseudo_header(Direction::Up, bytes.len());
    if !packet.verify_checksum(&pseudo_header) {
        net_debug!("tcp: bad checksum, dropping segment");
        return Inbound::Discard;
    }
    if TcpRepr::parse(&packet).is_err() {
        net_debug!("tcp: malformed segment");
        return Inbound::Discard;
    }
    Inbound::Accept(bytes)
}

/// Serialize a segment into a `Tcp` frame carrying its payload.
fn encode(segment: &Segment, local_port: u16, remote_port: u16, ip: &dyn PseudoHeaderSource) -> Frame {
    let repr = segment.as_repr(local_port, remote_port);
    let mut bytes = vec![0; repr.buffer_len()];
    let pseudo_header = ip.pseudo_header(Direction::Down, bytes.len());
    repr.emit(&mut TcpPacket::new_unchecked(&mut bytes[..]), &pseudo_header);
    let payload = bytes.split_off(TCP_HEADER_LEN);
    Frame::new(Kind::Tcp, bytes, Some(Frame::raw(payload)))
}

/// Subscribers to the [Event]s of a connection.
#[derive(Debug, Default)]
struct Observers {
    senders: Mutex<Vec<Sender<Event>>>,
}

impl Observers {
    fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = mpsc::channel();
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    fn notify(&self, events: &[Event]) {
        if events.is_empty() {
            return;
        }
        let mut senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
        senders.retain(|sender| events.iter().all(|event| sender.send(*event).is_ok()));
    }
}

#[derive(Default)]
struct Pending {
    frames: VecDeque<(Direction, Frame, bool)>,
    draining: bool,
}

/// Frames produced under a connection's lock, handed to the neighbours in the order they
/// were produced once the lock is released.
///
/// Whichever thread finds the outbox idle drains it; others only queue. No lock is held
/// while a sink runs.
#[derive(Default)]
struct Outbox {
    pending: Mutex<Pending>,
}

impl Outbox {
    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue the segments and deliveries of `out`, leaving its events.
    fn stage(
        &self,
        out: &mut Dispatch,
        local_port: u16,
        remote_port: u16,
        ip: &dyn PseudoHeaderSource,
    ) {
        if out.segments.is_empty() && out.delivered.is_empty() {
            return;
        }
        let mut pending = self.lock();
        for segment in out.segments.drain(..) {
            let push = segment.flags.contains(TcpFlags::PSH);
            let frame = encode(&segment, local_port, remote_port, ip);
            pending.frames.push_back((Direction::Down, frame, push));
        }
        for (data, push) in out.delivered.drain(..) {
            pending.frames.push_back((Direction::Up, Frame::raw(data), push));
        }
    }

    fn drain(&self, links: &Links) {
        let mut pending = self.lock();
        if pending.draining {
            return;
        }
        pending.draining = true;
        while let Some((direction, frame, push)) = pending.frames.pop_front() {
            drop(pending);
            match direction {
                Direction::Up => links.frame_decapsulated(frame, push),
                Direction::Down => links.frame_encapsulated(frame, push),
            }
            pending = self.lock();
        }
        pending.draining = false;
    }
}
