/*! The encapsulation tree exchanged between socket layers.

A [Frame] is one protocol layer: the octets of its own header plus, optionally, the frame
it carries. A frame without an encapsulated child is a leaf whose `header` is its whole
content.
*/

use core::fmt;

use crate::wire::{self, Ipv4Packet, TcpPacket};

/// The layer a [Frame] header belongs to.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum Kind {
    /// Opaque octets, usually an application payload.
    Raw,
    /// An IPv4 header.
    Ipv4,
    /// A TCP header.
    Tcp,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Kind::Raw => write!(f, "raw"),
            Kind::Ipv4 => write!(f, "IPv4"),
            Kind::Tcp => write!(f, "TCP"),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Frame {
    kind: Kind,
    header: Vec<u8>,
    encapsulated: Option<Box<Frame>>,
}

impl Frame {
    /// Create a frame with the given header, wrapping `inner`.
    pub fn new(kind: Kind, header: Vec<u8>, inner: Option<Frame>) -> Frame {
        Frame {
            kind,
            header,
            encapsulated: inner.map(Box::new),
        }
    }

    /// Create a leaf frame holding opaque octets.
    pub fn raw(data: impl Into<Vec<u8>>) -> Frame {
        Frame::new(Kind::Raw, data.into(), None)
    }

    /// Parse an IPv4 datagram into an `Ipv4` frame wrapping a raw payload.
    ///
    /// The total length field is honoured, so trailing link-layer padding is dropped.
    pub fn parse_ipv4(data: &[u8]) -> wire::Result<Frame> {
        let packet = Ipv4Packet::new_checked(data)?;
        let header_len = packet.header_len() as usize;
        let total_len = packet.total_len() as usize;
        Ok(Frame::new(
            Kind::Ipv4,
            data[..header_len].to_vec(),
            Some(Frame::raw(&data[header_len..total_len])),
        ))
    }

    /// Parse a TCP segment into a `Tcp` frame wrapping a raw payload.
    pub fn parse_tcp(data: &[u8]) -> wire::Result<Frame> {
        let packet = TcpPacket::new_checked(data)?;
        let header_len = packet.header_len() as usize;
        Ok(Frame::new(
            Kind::Tcp,
            data[..header_len].to_vec(),
            Some(Frame::raw(&data[header_len..])),
        ))
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// Return the octets of this layer's own header.
    pub fn header(&self) -> &[u8] {
        &self.header
    }

    /// Return the frame carried by this one, if any.
    pub fn encapsulated(&self) -> Option<&Frame> {
        self.encapsulated.as_deref()
    }

    /// Consume the frame, returning the frame carried by it.
    pub fn into_encapsulated(self) -> Option<Frame> {
        self.encapsulated.map(|inner| *inner)
    }

    /// Return the total length of this frame and everything it carries, in octets.
    pub fn length(&self) -> usize {
        self.header.len() + self.encapsulated().map_or(0, Frame::length)
    }

    /// Return this frame serialized: its header followed by the carried frame.
    pub fn bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.length());
        self.write_into(&mut bytes);
        bytes
    }

    fn write_into(&self, bytes: &mut Vec<u8>) {
        bytes.extend_from_slice(&self.header);
        if let Some(inner) = self.encapsulated() {
            inner.write_into(bytes);
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({} octets)", self.kind, self.header.len())?;
        if let Some(inner) = self.encapsulated() {
            write!(f, " / {inner}")?;
        }
        Ok(())
    }
}
