/*! A user-space TCP/IP stack assembled from stackable sockets.

Every protocol layer is a [socket::Socket]: a bidirectional unit that decapsulates frames
travelling up (`push_up`) and encapsulates frames travelling down (`push_down`). Units are
chained with [socket::link]; each one hands its output to its neighbour through a
[socket::Sink].

 * The [wire] module holds the bit-exact IPv4 and TCP codecs.
 * The [frame] module holds the encapsulation tree exchanged between layers.
 * [socket::ip::IpSocket] fragments and reassembles datagrams and supplies the TCP
   pseudo-header.
 * [socket::tcp::TcpSocket] runs the TCP connection state machine on top of it, with
   retransmission driven by a [timer::Timer] thread.
 * [stack::TcpIpStack] wires the two together.

The frame dispatch pipeline that feeds received frames in, and consumes outgoing frames,
is not part of this crate; it only has to call [stack::TcpIpStack::push_up] and attach a
[socket::Sink] below the IP layer.
*/

#![deny(unsafe_code)]

#[macro_use]
mod macros;

pub mod config;
pub mod frame;
mod rand;
pub mod socket;
pub mod stack;
pub mod storage;
pub mod time;
pub mod timer;
pub mod wire;

pub use self::config::Config;
pub use self::frame::Frame;
pub use self::stack::TcpIpStack;
