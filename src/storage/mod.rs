/*! Specialized containers.

The `storage` module provides the containers used by the sockets: a ring buffer holding
outgoing TCP data, and an assembler tracking which parts of a fragmented datagram have
arrived.
*/

use core::fmt;

mod assembler;
mod ring_buffer;

pub use self::assembler::{Assembler, TooManyHolesError};
pub use self::ring_buffer::RingBuffer;

/// Error returned when enqueuing into a full buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Full;

impl fmt::Display for Full {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "buffer full")
    }
}

impl core::error::Error for Full {}
