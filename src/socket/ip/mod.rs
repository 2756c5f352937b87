/*! The IPv4 layer.

An [IpSocket] is bound to a local address, a remote address and a protocol. Going up it
checks the header, filters on the binding and reassembles fragmented datagrams; going down
it adds a header and splits the datagram to fit the MTU.
*/

use std::sync::{Mutex, PoisonError};

use crate::config::Config;
use crate::frame::{Frame, Kind};
use crate::rand::Rand;
use crate::socket::{Binding, BindingAddress, Direction, Links, Socket};
use crate::time::{Duration, Instant};
use crate::wire::{
    IpProtocol, Ipv4Address, Ipv4Packet, Ipv4PseudoHeader, Ipv4Repr, IPV4_HEADER_LEN,
};

mod fragmentation;

pub use self::fragmentation::FragmentError;
use self::fragmentation::PacketAssemblerSet;

/// Something that knows the addresses an upper-layer checksum covers.
pub trait PseudoHeaderSource: Send + Sync {
    /// Return the pseudo-header of a `length` octet segment travelling in `direction`.
    fn pseudo_header(&self, direction: Direction, length: usize) -> Ipv4PseudoHeader;
}

#[derive(Debug)]
struct State {
    fragments: PacketAssemblerSet,
    next_ident: u16,
}

/// An IPv4 layer bound to one (local, remote, protocol) triple.
#[derive(Debug)]
pub struct IpSocket {
    local: Ipv4Address,
    remote: Ipv4Address,
    protocol: IpProtocol,
    mtu: usize,
    hop_limit: u8,
    max_datagram_size: usize,
    reassembly_timeout: Duration,
    links: Links,
    state: Mutex<State>,
}

impl IpSocket {
    pub fn new(
        config: &Config,
        local: Ipv4Address,
        remote: Ipv4Address,
        protocol: IpProtocol,
    ) -> IpSocket {
        let mut rand = Rand::from_seed(config.random_seed.map(|seed| seed ^ 0x1d));
        IpSocket {
            local,
            remote,
            protocol,
            mtu: config.mtu,
            hop_limit: config.hop_limit,
            max_datagram_size: config.max_datagram_size,
            reassembly_timeout: config.reassembly_timeout,
            links: Links::new(),
            state: Mutex::new(State {
                fragments: PacketAssemblerSet::new(),
                next_ident: rand.rand_u16(),
            }),
        }
    }

    pub fn local_addr(&self) -> Ipv4Address {
        self.local
    }

    pub fn remote_addr(&self) -> Ipv4Address {
        self.remote
    }

    /// Largest payload carried by one fragment: what fits in the MTU, rounded down to a
    /// multiple of 8.
    fn fragment_payload_len(&self) -> usize {
        let room = self.mtu.saturating_sub(IPV4_HEADER_LEN);
        ((room / 8) * 8).max(8)
    }

    /// Process one received datagram as of `now`. See [Socket::push_up].
    pub fn push_up_at(&self, now: Instant, frame: &Frame, push: bool) -> bool {
        let bytes = frame.bytes();
        let packet = match Ipv4Packet::new_checked(&bytes[..]) {
            Ok(packet) => packet,
            Err(_) => {
                net_debug!("ip: truncated datagram");
                return false;
            }
        };
        let repr = match Ipv4Repr::parse(&packet) {
            Ok(repr) => repr,
            Err(_) => {
                net_debug!("ip: malformed datagram or bad header checksum");
                return false;
            }
        };
        if repr.src_addr != self.remote
            || repr.dst_addr != self.local
            || repr.next_header != self.protocol
        {
            return false;
        }

        if !packet.is_fragment() {
            self.links
                .frame_decapsulated(Frame::raw(packet.payload()), push);
            return true;
        }

        let result = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.fragments.remove_expired(now);
            state.fragments.add(
                packet.get_key(),
                packet.payload(),
                repr.frag_offset as usize,
                !repr.more_frags,
                now + self.reassembly_timeout,
                self.max_datagram_size,
            )
        };
        match result {
            Ok(Some(datagram)) => {
                net_trace!(
                    "ip: reassembled datagram {} ({} octets)",
                    repr.ident,
                    datagram.len()
                );
                self.links.frame_decapsulated(Frame::raw(datagram), push)
            }
            Ok(None) => {}
            Err(err) => net_debug!("ip: dropped fragment of datagram {}: {}", repr.ident, err),
        }
        true
    }
}

impl Socket for IpSocket {
    fn push_up(&self, frame: &Frame, push: bool) -> bool {
        self.push_up_at(Instant::now(), frame, push)
    }

    fn push_down(&self, frame: &Frame, push: bool) {
        let payload = frame.bytes();
        if payload.len() > u16::MAX as usize - IPV4_HEADER_LEN {
            net_debug!("ip: {} octet payload does not fit a datagram", payload.len());
            return;
        }

        let ident = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let ident = state.next_ident;
            state.next_ident = ident.wrapping_add(1);
            ident
        };

        let chunk_len = self.fragment_payload_len();
        let mut offset = 0;
        loop {
            let end = (offset + chunk_len).min(payload.len());
            let chunk = &payload[offset..end];
            let repr = Ipv4Repr {
                src_addr: self.local,
                dst_addr: self.remote,
                next_header: self.protocol,
                payload_len: chunk.len(),
                hop_limit: self.hop_limit,
                ident,
                more_frags: end < payload.len(),
                frag_offset: offset as u16,
            };
            let mut header = vec![0; repr.buffer_len()];
            repr.emit(&mut Ipv4Packet::new_unchecked(&mut header[..]));
            net_trace!("ip: send {} len={}", repr, chunk.len());
            self.links.frame_encapsulated(
                Frame::new(Kind::Ipv4, header, Some(Frame::raw(chunk))),
                push,
            );

            offset = end;
            if offset >= payload.len() {
                break;
            }
        }
    }

    fn flush(&self) {}

    fn binding(&self) -> Binding {
        Binding {
            local: BindingAddress::Ipv4(self.local),
            remote: BindingAddress::Ipv4(self.remote),
            protocol: self.protocol,
        }
    }

    fn links(&self) -> &Links {
        &self.links
    }

    fn close(&self) {
        self.links.clear();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.fragments = PacketAssemblerSet::new();
    }
}

impl PseudoHeaderSource for IpSocket {
    fn pseudo_header(&self, direction: Direction, length: usize) -> Ipv4PseudoHeader {
        let (src_addr, dst_addr) = match direction {
            Direction::Down => (self.local, self.remote),
            Direction::Up => (self.remote, self.local),
        };
        Ipv4PseudoHeader {
            src_addr,
            dst_addr,
            protocol: self.protocol,
            length: length as u16,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::mpsc::{self, Receiver};
    use std::sync::Arc;

    const LOCAL: Ipv4Address = Ipv4Address::new(10, 0, 0, 1);
    const REMOTE: Ipv4Address = Ipv4Address::new(10, 0, 0, 2);

    fn socket(config: &Config) -> (IpSocket, Receiver<(Frame, bool)>, Receiver<(Frame, bool)>) {
        let socket = IpSocket::new(config, LOCAL, REMOTE, IpProtocol::Tcp);
        let (up_tx, up_rx) = mpsc::channel::<(Frame, bool)>();
        let (down_tx, down_rx) = mpsc::channel::<(Frame, bool)>();
        socket.attach(Direction::Up, Arc::new(up_tx));
        socket.attach(Direction::Down, Arc::new(down_tx));
        (socket, up_rx, down_rx)
    }

    fn datagram(src: Ipv4Address, dst: Ipv4Address, protocol: IpProtocol, payload: &[u8]) -> Frame {
        let repr = Ipv4Repr {
            src_addr: src,
            dst_addr: dst,
            next_header: protocol,
            payload_len: payload.len(),
            hop_limit: 64,
            ident: 7,
            more_frags: false,
            frag_offset: 0,
        };
        let mut bytes = vec![0; repr.buffer_len() + payload.len()];
        let mut packet = Ipv4Packet::new_unchecked(&mut bytes[..]);
        repr.emit(&mut packet);
        packet.payload_mut().copy_from_slice(payload);
        Frame::raw(bytes)
    }

    #[test]
    fn test_push_up_unfragmented() {
        let (socket, up_rx, _down_rx) = socket(&Config::default());
        let frame = datagram(REMOTE, LOCAL, IpProtocol::Tcp, b"segment");
        assert!(socket.push_up(&frame, true));
        let (inner, push) = up_rx.try_recv().unwrap();
        assert_eq!(inner.bytes(), b"segment".to_vec());
        assert!(push);
    }

    #[test]
    fn test_push_up_binding_mismatch() {
        let (socket, up_rx, _down_rx) = socket(&Config::default());
        let other = Ipv4Address::new(10, 0, 0, 3);
        assert!(!socket.push_up(&datagram(other, LOCAL, IpProtocol::Tcp, b"x"), false));
        assert!(!socket.push_up(&datagram(REMOTE, other, IpProtocol::Tcp, b"x"), false));
        assert!(!socket.push_up(&datagram(REMOTE, LOCAL, IpProtocol::Udp, b"x"), false));
        assert!(up_rx.try_recv().is_err());
    }

    #[test]
    fn test_push_up_bad_checksum() {
        let (socket, up_rx, _down_rx) = socket(&Config::default());
        let mut bytes = datagram(REMOTE, LOCAL, IpProtocol::Tcp, b"x").bytes();
        bytes[10] ^= 0xff;
        assert!(!socket.push_up(&Frame::raw(bytes), false));
        assert!(!socket.push_up(&Frame::raw(vec![0x45; 8]), false));
        assert!(up_rx.try_recv().is_err());
    }

    #[test]
    fn test_fragment_and_reassemble() {
        let mut config = Config::default();
        config.mtu = 60;
        let (sender, _up_rx, down_rx) = socket(&config);
        let payload: Vec<u8> = (0..100u8).collect();
        sender.push_down(&Frame::raw(payload.clone()), true);

        let fragments: Vec<Frame> = down_rx.try_iter().map(|(frame, _)| frame).collect();
        // 40 octets per fragment: 40 + 40 + 20.
        assert_eq!(fragments.len(), 3);
        for (i, fragment) in fragments.iter().enumerate() {
            let bytes = fragment.bytes();
            assert!(bytes.len() <= 60);
            let packet = Ipv4Packet::new_checked(&bytes[..]).unwrap();
            assert_eq!(packet.frag_offset() as usize, i * 40);
            assert_eq!(packet.more_frags(), i < 2);
            assert_eq!(packet.src_addr(), LOCAL);
            assert_eq!(packet.dst_addr(), REMOTE);
        }

        // Feed them, out of order, to a socket bound the other way round.
        let receiver = IpSocket::new(&config, REMOTE, LOCAL, IpProtocol::Tcp);
        let (up_tx, up_rx) = mpsc::channel::<(Frame, bool)>();
        receiver.attach(Direction::Up, Arc::new(up_tx));
        let now = Instant::from_secs(1);
        assert!(receiver.push_up_at(now, &fragments[2], true));
        assert!(receiver.push_up_at(now, &fragments[0], true));
        assert!(up_rx.try_recv().is_err());
        assert!(receiver.push_up_at(now, &fragments[1], true));
        assert_eq!(up_rx.try_recv().unwrap().0.bytes(), payload);
    }

    #[test]
    fn test_reassembly_times_out() {
        let mut config = Config::default();
        config.mtu = 60;
        config.reassembly_timeout = Duration::from_secs(1);
        let (sender, _up_rx, down_rx) = socket(&config);
        sender.push_down(&Frame::raw(vec![0xaa; 60]), false);
        let fragments: Vec<Frame> = down_rx.try_iter().map(|(frame, _)| frame).collect();
        assert_eq!(fragments.len(), 2);

        let receiver = IpSocket::new(&config, REMOTE, LOCAL, IpProtocol::Tcp);
        let (up_tx, up_rx) = mpsc::channel::<(Frame, bool)>();
        receiver.attach(Direction::Up, Arc::new(up_tx));
        assert!(receiver.push_up_at(Instant::from_secs(10), &fragments[0], false));
        assert!(receiver.push_up_at(Instant::from_secs(12), &fragments[1], false));
        assert!(up_rx.try_recv().is_err());
    }

    #[test]
    fn test_oversize_fragment_rejected() {
        let mut config = Config::default();
        config.max_datagram_size = 64;
        let (socket, up_rx, _down_rx) = socket(&config);
        let repr = Ipv4Repr {
            src_addr: REMOTE,
            dst_addr: LOCAL,
            next_header: IpProtocol::Tcp,
            payload_len: 16,
            hop_limit: 64,
            ident: 3,
            more_frags: false,
            frag_offset: 56,
        };
        let mut bytes = vec![0; repr.buffer_len() + 16];
        repr.emit(&mut Ipv4Packet::new_unchecked(&mut bytes[..]));
        // Claimed by the binding, but never delivered.
        assert!(socket.push_up(&Frame::raw(bytes), false));
        assert!(up_rx.try_recv().is_err());
    }

    #[test]
    fn test_empty_payload_sends_one_datagram() {
        let (socket, _up_rx, down_rx) = socket(&Config::default());
        socket.push_down(&Frame::raw(Vec::new()), false);
        let frames: Vec<Frame> = down_rx.try_iter().map(|(frame, _)| frame).collect();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].length(), IPV4_HEADER_LEN);
    }

    #[test]
    fn test_pseudo_header_orientation() {
        let socket = IpSocket::new(&Config::default(), LOCAL, REMOTE, IpProtocol::Tcp);
        let out = socket.pseudo_header(Direction::Down, 40);
        assert_eq!(out.emit(), [10, 0, 0, 1, 10, 0, 0, 2, 0, 6, 0, 40]);
        let inbound = socket.pseudo_header(Direction::Up, 40);
        assert_eq!((inbound.src_addr, inbound.dst_addr), (REMOTE, LOCAL));
    }
}
