/*! A TCP connection over IPv4, ready to be plugged into a frame pipeline.

[TcpIpStack] builds an [IpSocket] bound to the two addresses, a [TcpSocket] bound to the
two ports on top of it, and links them. Received datagrams go in through
[TcpIpStack::push_up]; outgoing datagrams come out of the sink attached with
[TcpIpStack::attach_network]; delivered data comes out of the sink attached with
[TcpIpStack::attach_application].
*/

use std::sync::Arc;

use crate::config::Config;
use crate::frame::Frame;
use crate::socket::ip::IpSocket;
use crate::socket::tcp::TcpSocket;
use crate::socket::{link, Direction, Sink, Socket};
use crate::timer::Timer;
use crate::wire::{IpEndpoint, IpProtocol};

/// An IP layer and a TCP layer, linked.
#[derive(Debug)]
pub struct TcpIpStack {
    ip: Arc<IpSocket>,
    tcp: Arc<TcpSocket>,
}

impl TcpIpStack {
    pub fn new(config: &Config, timer: &Timer, local: IpEndpoint, remote: IpEndpoint) -> TcpIpStack {
        let ip = Arc::new(IpSocket::new(config, local.addr, remote.addr, IpProtocol::Tcp));
        let tcp = TcpSocket::new(config, timer, ip.clone(), local.port, remote.port);
        link(&ip, &tcp);
        net_debug!(
            "stack: {}:{} <-> {}:{}",
            ip.local_addr(),
            tcp.local_port(),
            ip.remote_addr(),
            tcp.remote_port()
        );
        TcpIpStack { ip, tcp }
    }

    pub fn ip(&self) -> &Arc<IpSocket> {
        &self.ip
    }

    pub fn tcp(&self) -> &Arc<TcpSocket> {
        &self.tcp
    }

    /// Feed a received datagram in. Returns whether it was addressed to this stack.
    pub fn push_up(&self, frame: &Frame) -> bool {
        self.ip.push_up(frame, false)
    }

    /// Send outgoing datagrams to `sink`.
    pub fn attach_network(&self, sink: Arc<dyn Sink>) {
        self.ip.attach(Direction::Down, sink)
    }

    /// Send delivered data to `sink`.
    pub fn attach_application(&self, sink: Arc<dyn Sink>) {
        self.tcp.attach(Direction::Up, sink)
    }

    /// Detach both layers from everything. The connection itself is left as it is.
    pub fn close(&self) {
        Socket::close(&*self.tcp);
        Socket::close(&*self.ip);
    }
}
