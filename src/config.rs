/*! Stack parameters.

Compile-time capacities live here as constants; everything a user may want to tune per
connection is a field of [Config], which is passed to each socket when it is created.
*/

use crate::time::Duration;

/// Number of IP datagrams that may be in the middle of reassembly at once, per socket.
/// Must be a power of two.
pub const REASSEMBLY_BUFFER_COUNT: usize = 16;

/// Number of discontiguous ranges tracked while reassembling one IP datagram.
pub const ASSEMBLER_MAX_SEGMENT_COUNT: usize = 32;

pub const DEFAULT_MSS: usize = 1400;
pub const DEFAULT_MTU: usize = 1500;
pub const DEFAULT_RETRANSMIT_TIMEOUT: Duration = Duration::from_millis(2_000);
pub const DEFAULT_MAX_RETRIES: u8 = 3;
pub const DEFAULT_MSL: Duration = Duration::from_millis(30_000);

/// Parameters of an IP socket and the TCP connection above it.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Config {
    /// Largest TCP payload sent in one segment.
    pub mss: usize,
    /// Largest IP datagram, header included, put on the wire. Larger datagrams are
    /// fragmented.
    pub mtu: usize,
    /// Time an unacknowledged segment waits before being sent again.
    pub retransmit_timeout: Duration,
    /// Retransmissions attempted for one segment before the connection is abandoned.
    pub max_retries: u8,
    /// Maximum segment lifetime; the time spent in TIME-WAIT.
    pub msl: Duration,
    /// Receive window advertised to the remote endpoint.
    pub receive_window: u16,
    /// Capacity of the send buffer, in octets.
    pub send_buffer_size: usize,
    /// Time-to-live of outgoing datagrams.
    pub hop_limit: u8,
    /// Largest datagram accepted by the fragment reassembler.
    pub max_datagram_size: usize,
    /// Time after which an incomplete datagram is dropped.
    pub reassembly_timeout: Duration,
    /// Seed for initial sequence numbers and IP identification. `None` seeds from the clock.
    pub random_seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            mss: DEFAULT_MSS,
            mtu: DEFAULT_MTU,
            retransmit_timeout: DEFAULT_RETRANSMIT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            msl: DEFAULT_MSL,
            receive_window: u16::MAX,
            send_buffer_size: 64 * 1024,
            hop_limit: 64,
            max_datagram_size: u16::MAX as usize,
            reassembly_timeout: Duration::from_secs(60),
            random_seed: None,
        }
    }
}
