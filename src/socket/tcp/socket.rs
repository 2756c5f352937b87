use core::fmt;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};

use super::{
    classify, CloseError, ConnectError, Connection, Dispatch, Event, Inbound, ListenError,
    Mode, Observers, Outbox, SendError, State, Tcb,
};
use crate::config::Config;
use crate::frame::Frame;
use crate::socket::ip::PseudoHeaderSource;
use crate::socket::{Binding, BindingAddress, Links, PollAt, Socket};
use crate::time::Instant;
use crate::timer::{Timed, Timer, TimerHandle};
use crate::wire::{IpProtocol, TcpPacket, TcpRepr};

/// A TCP connection between two ports, on top of an IP layer.
///
/// Every method takes `&self`: inbound segments, the owning thread and the timer thread
/// all work on the same socket. The connection state lives behind one mutex; frames are
/// handed to the neighbouring layers only after it is released.
pub struct TcpSocket {
    local_port: u16,
    remote_port: u16,
    ip: Arc<dyn PseudoHeaderSource>,
    connection: Mutex<Connection>,
    changed: Condvar,
    timer: TimerHandle,
    links: Links,
    outbox: Outbox,
    observers: Observers,
}

impl fmt::Debug for TcpSocket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TcpSocket")
            .field("local_port", &self.local_port)
            .field("remote_port", &self.remote_port)
            .field("state", &self.state())
            .field("links", &self.links)
            .finish()
    }
}

impl TcpSocket {
    /// Create a closed socket. `ip` supplies the checksum pseudo-header, normally the
    /// [IpSocket](crate::socket::ip::IpSocket) the socket will be linked above.
    pub fn new(
        config: &Config,
        timer: &Timer,
        ip: Arc<dyn PseudoHeaderSource>,
        local_port: u16,
        remote_port: u16,
    ) -> Arc<TcpSocket> {
        Arc::new_cyclic(|this: &Weak<TcpSocket>| {
            let target: Weak<dyn Timed> = this.clone();
            TcpSocket {
                local_port,
                remote_port,
                ip,
                connection: Mutex::new(Connection::new(config, Mode::Active)),
                changed: Condvar::new(),
                timer: timer.register(target),
                links: Links::new(),
                outbox: Outbox::default(),
                observers: Observers::default(),
            }
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` on the connection, then act on what it produced with the lock released.
    fn run<R>(&self, f: impl FnOnce(&mut Connection, &mut Dispatch) -> R) -> R {
        let mut out = Dispatch::new();
        let (result, poll_at) = {
            let mut connection = self.lock();
            let result = f(&mut connection, &mut out);
            self.outbox
                .stage(&mut out, self.local_port, self.remote_port, &*self.ip);
            (result, connection.poll_at())
        };
        self.changed.notify_all();
        self.timer.schedule(poll_at);
        self.observers.notify(&out.events);
        self.outbox.drain(&self.links);
        result
    }

    /// Wait for a connection request from the remote port.
    pub fn listen(&self) -> Result<(), ListenError> {
        self.run(|connection, _| connection.listen())
    }

    /// Send a SYN and return without waiting for the handshake.
    pub fn open(&self) -> Result<(), ConnectError> {
        self.run(|connection, out| connection.connect(Instant::now(), out))
    }

    /// Open the connection and block until the handshake completes or fails.
    pub fn connect(&self) -> Result<(), ConnectError> {
        self.open()?;
        let connection = self
            .changed
            .wait_while(self.lock(), |connection| {
                matches!(connection.state(), State::SynSent | State::SynReceived)
            })
            .unwrap_or_else(PoisonError::into_inner);
        match connection.state() {
            State::Closed => Err(connection.error().unwrap_or(ConnectError::Reset)),
            _ => Ok(()),
        }
    }

    /// Queue `data` for transmission. Returns how many octets fit in the send buffer.
    pub fn send(&self, data: &[u8]) -> Result<usize, SendError> {
        self.run(|connection, out| connection.send(Instant::now(), data, out))
    }

    /// Start an orderly close and return without waiting for it.
    pub fn shutdown(&self) -> Result<(), CloseError> {
        self.run(|connection, out| connection.close(Instant::now(), out))
    }

    /// Close the connection and block until it reaches CLOSED or TIME-WAIT.
    ///
    /// This does not detach the socket from its neighbours; see [Socket::close].
    pub fn close(&self) -> Result<(), CloseError> {
        self.shutdown()?;
        let _connection = self
            .changed
            .wait_while(self.lock(), |connection| {
                !matches!(connection.state(), State::Closed | State::TimeWait)
            })
            .unwrap_or_else(PoisonError::into_inner);
        Ok(())
    }

    /// Reset the connection and drop everything queued.
    pub fn abort(&self) {
        self.run(|connection, out| connection.abort(out))
    }

    /// Block until `done` holds for the connection state, or `timeout` passes. Returns
    /// whether `done` held.
    pub fn wait_for(
        &self,
        timeout: core::time::Duration,
        mut done: impl FnMut(State) -> bool,
    ) -> bool {
        let (connection, _) = self
            .changed
            .wait_timeout_while(self.lock(), timeout, |connection| {
                !done(connection.state())
            })
            .unwrap_or_else(PoisonError::into_inner);
        done(connection.state())
    }

    pub fn state(&self) -> State {
        self.lock().state()
    }

    /// Return a snapshot of the transmission control block.
    pub fn tcb(&self) -> Tcb {
        *self.lock().tcb()
    }

    /// Octets queued and not yet sent.
    pub fn send_queue(&self) -> usize {
        self.lock().send_queue()
    }

    /// Receive every [Event] of this connection from now on.
    pub fn subscribe(&self) -> Receiver<Event> {
        self.observers.subscribe()
    }
}

impl Socket for TcpSocket {
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
        let data = frame.bytes();
        match self.send(&data) {
            Ok(size) if size < data.len() => {
                net_debug!("tcp: send buffer full, dropped {} octets", data.len() - size)
            }
            Ok(_) => {}
            Err(err) => net_debug!("tcp: cannot send in {}: {}", self.state(), err),
        }
    }

    fn flush(&self) {
        self.run(|connection, out| {
            connection.segment_and_send(Instant::now(), out);
        })
    }

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

impl Timed for TcpSocket {
    fn on_timer(&self, now: Instant) -> PollAt {
        self.run(|connection, out| connection.poll(now, out))
    }
}
