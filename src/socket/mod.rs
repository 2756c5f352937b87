/*! Stackable protocol layers.

The `socket` module deals with *protocol layers* and how they are chained together.

Every layer implements [Socket]. Frames travelling from the network towards the
application enter a layer through [Socket::push_up]; the layer strips its own header and,
if the frame was meant for it, hands the inner frame to the [Sink] attached above it.
Frames travelling towards the network enter through [Socket::push_down]; the layer adds its
header and hands the result to the [Sink] attached below it.

[link] chains two layers so that each one feeds the other. The outermost sinks, the
application above the top layer and the frame dispatch pipeline below the bottom one, are
attached directly; an `mpsc::Sender<(Frame, bool)>` is a ready-made [Sink].
*/

use core::fmt;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::frame::Frame;
use crate::time::Instant;
use crate::wire::{IpProtocol, Ipv4Address};

pub mod ip;
pub mod tcp;

/// Gives an indication on the next time the socket should be polled.
#[derive(Debug, PartialOrd, Ord, PartialEq, Eq, Clone, Copy)]
pub enum PollAt {
    /// The socket needs to be polled at given [Instant][struct.Instant].
    Time(Instant),
    /// The socket does not need to be polled unless there are external changes.
    Ingress,
}

/// The side of a socket a neighbour is attached to.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum Direction {
    /// Towards the application.
    Up,
    /// Towards the network.
    Down,
}

/// Receiver of the frames a socket produces.
///
/// A sink is always called with no socket lock held, so it may call back into any socket.
pub trait Sink: Send + Sync {
    fn deliver(&self, frame: Frame, push: bool);
}

impl Sink for Sender<(Frame, bool)> {
    fn deliver(&self, frame: Frame, push: bool) {
        if self.send((frame, push)).is_err() {
            net_debug!("sink: receiver gone, frame dropped");
        }
    }
}

/// One end of a binding.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum BindingAddress {
    Ipv4(Ipv4Address),
    Port(u16),
}

impl fmt::Display for BindingAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BindingAddress::Ipv4(addr) => write!(f, "{addr}"),
            BindingAddress::Port(port) => write!(f, "{port}"),
        }
    }
}

/// What a socket is bound to: the frames it claims on the way up and stamps on the way
/// down.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub struct Binding {
    pub local: BindingAddress,
    pub remote: BindingAddress,
    pub protocol: IpProtocol,
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {} <-> {}", self.protocol, self.local, self.remote)
    }
}

/// A bidirectional protocol layer.
pub trait Socket: Send + Sync {
    /// Attempt to decapsulate `frame`.
    ///
    /// Returns `false` if the frame does not belong to this socket's binding, in which case
    /// nothing else happens. Otherwise the inner frame, if any is complete, goes to the sink
    /// above.
    fn push_up(&self, frame: &Frame, push: bool) -> bool;

    /// Encapsulate `frame` according to this socket's binding and hand the result to the
    /// sink below.
    fn push_down(&self, frame: &Frame, push: bool);

    /// Emit any buffered output.
    fn flush(&self);

    fn binding(&self) -> Binding;

    /// The neighbours of this socket.
    fn links(&self) -> &Links;

    fn attach(&self, direction: Direction, sink: Arc<dyn Sink>) {
        self.links().attach(direction, sink)
    }

    fn detach(&self, direction: Direction) {
        self.links().detach(direction)
    }

    /// Detach from both neighbours. Frames pushed afterwards are processed but go nowhere.
    fn close(&self) {
        self.links().clear()
    }
}

#[derive(Default)]
struct Neighbours {
    up: Option<Arc<dyn Sink>>,
    down: Option<Arc<dyn Sink>>,
}

/// The sinks attached above and below a socket.
#[derive(Default)]
pub struct Links {
    inner: Mutex<Neighbours>,
}

impl fmt::Debug for Links {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Links")
            .field("up", &inner.up.is_some())
            .field("down", &inner.down.is_some())
            .finish()
    }
}

impl Links {
    pub fn new() -> Links {
        Links::default()
    }

    pub fn attach(&self, direction: Direction, sink: Arc<dyn Sink>) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match direction {
            Direction::Up => inner.up = Some(sink),
            Direction::Down => inner.down = Some(sink),
        }
    }

    pub fn detach(&self, direction: Direction) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match direction {
            Direction::Up => inner.up = None,
            Direction::Down => inner.down = None,
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.up = None;
        inner.down = None;
    }

    fn sink(&self, direction: Direction) -> Option<Arc<dyn Sink>> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match direction {
            Direction::Up => inner.up.clone(),
            Direction::Down => inner.down.clone(),
        }
    }

    /// Hand a decapsulated frame to the sink above.
    pub fn frame_decapsulated(&self, frame: Frame, push: bool) {
        match self.sink(Direction::Up) {
            Some(sink) => sink.deliver(frame, push),
            None => net_trace!("links: nothing attached above, dropping {}", frame),
        }
    }

    /// Hand an encapsulated frame to the sink below.
    pub fn frame_encapsulated(&self, frame: Frame, push: bool) {
        match self.sink(Direction::Down) {
            Some(sink) => sink.deliver(frame, push),
            None => net_trace!("links: nothing attached below, dropping {}", frame),
        }
    }
}

struct PushUp(Weak<dyn Socket>);

impl Sink for PushUp {
    fn deliver(&self, frame: Frame, push: bool) {
        if let Some(socket) = self.0.upgrade() {
            socket.push_up(&frame, push);
        }
    }
}

struct PushDown(Weak<dyn Socket>);

impl Sink for PushDown {
    fn deliver(&self, frame: Frame, push: bool) {
        if let Some(socket) = self.0.upgrade() {
            socket.push_down(&frame, push);
        }
    }
}

/// Chain `upper` on top of `lower`: frames `lower` decapsulates are pushed up into `upper`,
/// frames `upper` encapsulates are pushed down into `lower`.
///
/// The link holds weak references only; dropping either socket breaks it.
pub fn link<L, U>(lower: &Arc<L>, upper: &Arc<U>)
where
    L: Socket + 'static,
    U: Socket + 'static,
{
    let lower_weak: Weak<L> = Arc::downgrade(lower);
    let upper_weak: Weak<U> = Arc::downgrade(upper);
    let lower_dyn: Weak<dyn Socket> = lower_weak;
    let upper_dyn: Weak<dyn Socket> = upper_weak;
    lower.attach(Direction::Up, Arc::new(PushUp(upper_dyn)));
    upper.attach(Direction::Down, Arc::new(PushDown(lower_dyn)));
}
