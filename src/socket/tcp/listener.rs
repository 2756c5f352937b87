use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{
    classify, Connection, Dispatch, Event, Inbound, ListenError, Mode, Observers, Outbox,
    SendError, State,
};
use crate::config::Config;
use crate::frame::Frame;
use crate::socket::ip::PseudoHeaderSource;
use crate::socket::{Binding, BindingAddress, Links, Socket};
use crate::time::Instant;
use crate::wire::{IpProtocol, TcpPacket, TcpRepr};

/// A receive-only TCP socket.
///
/// It follows the handshake, the in-order data and the remote close of a connection it
/// observes, delivering the data upward, but never emits a segment: no acknowledgments,
/// no retransmissions, no resets.
pub struct TcpListenerSocket {
    local_port: u16,
    remote_port: u16,
    ip: Arc<dyn PseudoHeaderSource>,
    connection: Mutex<Connection>,
    links: Links,
    outbox: Outbox,
    observers: Observers,
}

impl TcpListenerSocket {
    pub fn new(
        config: &Config,
        ip: Arc<dyn PseudoHeaderSource>,
        local_port: u16,
        remote_port: u16,
    ) -> TcpListenerSocket {
        TcpListenerSocket {
            local_port,
            remote_port,
            ip,
            connection: Mutex::new(Connection::new(config, Mode::Passive)),
            links: Links::new(),
            outbox: Outbox::default(),
            observers: Observers::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn run<R>(&self, f: impl FnOnce(&mut Connection, &mut Dispatch) -> R) -> R {
        let mut out = Dispatch::new();
        let result = {
            let mut connection = self.lock();
            let result = f(&mut connection, &mut out);
            self.outbox
                .stage(&mut out, self.local_port, self.remote_port, &*self.ip);
            result
        };
        self.observers.notify(&out.events);
        self.outbox.drain(&self.links);
        result
    }

    pub fn listen(&self) -> Result<(), ListenError> {
        self.run(|connection, _| connection.listen())
    }

    /// Always fails: a listener has nothing to send with.
    pub fn send(&self, _data: &[u8]) -> Result<usize, SendError> {
        Err(SendError::InvalidState)
    }

    /// Stop following the connection.
    pub fn stop(&self) {
        self.run(|connection, out| {
            if connection.state() != State::Closed {
                connection.abort(out);
            }
        })
    }

    pub fn state(&self) -> State {
        self.lock().state()
    }

    pub fn subscribe(&self) -> Receiver<Event> {
        self.observers.subscribe()
    }
}

impl Socket for TcpListenerSocket {
    fn push_up(&self, frame: &Frame, _push: bool) -> bool {
        let bytes = match classify(frame, self.local_port, self.remote_port, &*self.ip) {
            Inbound::NotMine => return false,
            Inbound::Discard => return true,
            Inbound::Accept(bytes) => bytes,
        };
        let packet = TcpPacket::new_unchecked(&bytes[..]);
        if let Ok(repr) = TcpRepr::parse(&packet) {
            self.run(|connection, out| connection.process(Instant::now(), &repr, out));
        }
        true
    }

    fn push_down(&self, frame: &Frame, _push: bool) {
        net_debug!(
            "tcp: listener on port {} cannot send, dropped {} octets",
            self.local_port,
            frame.length()
        );
    }

    fn flush(&self) {}

    fn binding(&self) -> Binding {
        Binding {
            local: BindingAddress::Port(self.local_port),
            remote: BindingAddress::Port(self.remote_port),
            protocol: IpProtocol::Tcp,
        }
    }

    fn links(&self) -> &Links {
        &self.links
    }
}
