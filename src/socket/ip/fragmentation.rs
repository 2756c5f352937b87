use core::fmt;

use heapless::FnvIndexMap;

use crate::config::REASSEMBLY_BUFFER_COUNT;
use crate::storage::Assembler;
use crate::time::Instant;
use crate::wire::Ipv4FragKey;

/// Why a fragment was not accepted.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum FragmentError {
    /// The fragment reaches past the largest datagram we reassemble.
    Oversize,
    /// The fragment disagrees with the datagram length set by the last fragment.
    Inconsistent,
    /// The datagram has too many gaps to track.
    TooManyHoles,
    /// Every reassembly slot is in use.
    Full,
}

impl fmt::Display for FragmentError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FragmentError::Oversize => write!(f, "fragment exceeds maximum datagram size"),
            FragmentError::Inconsistent => write!(f, "fragment inconsistent with datagram length"),
            FragmentError::TooManyHoles => write!(f, "too many holes in datagram"),
            FragmentError::Full => write!(f, "no free reassembly slot"),
        }
    }
}

impl core::error::Error for FragmentError {}

/// Holds the fragments of one datagram.
#[derive(Debug)]
pub(crate) struct PacketAssembler {
    buffer: Vec<u8>,
    assembler: Assembler,
    total_size: Option<usize>,
    expires_at: Instant,
}

impl PacketAssembler {
    fn new(expires_at: Instant) -> PacketAssembler {
        PacketAssembler {
            buffer: Vec::new(),
            assembler: Assembler::new(),
            total_size: None,
            expires_at,
        }
    }

    /// Copy `data` in at `offset`. If `last` is set the datagram ends with this fragment.
    ///
    /// Every bound is checked before the buffer is touched.
    fn add(
        &mut self,
        data: &[u8],
        offset: usize,
        last: bool,
        max_size: usize,
    ) -> Result<(), FragmentError> {
        let end = offset + data.len();
        if end > max_size {
            return Err(FragmentError::Oversize);
        }
        match self.total_size {
            Some(total) if end > total || (last && end != total) => {
                return Err(FragmentError::Inconsistent);
            }
            None if last && self.buffer.len() > end => {
                // Data already received lies beyond the claimed end.
                return Err(FragmentError::Inconsistent);
            }
            _ => {}
        }

        self.assembler
            .add(offset, data.len())
            .map_err(|_| FragmentError::TooManyHoles)?;
        if self.buffer.len() < end {
            self.buffer.resize(end, 0);
        }
        self.buffer[offset..end].copy_from_slice(data);
        if last {
            self.total_size = Some(end);
        }

        net_trace!(
            "frag assembler: received {} octets at offset {}, have {}",
            data.len(),
            offset,
            self.assembler
        );
        Ok(())
    }

    fn is_complete(&self) -> bool {
        match self.total_size {
            Some(total) => self.assembler.is_complete(total),
            None => false,
        }
    }
}

/// Datagrams in the middle of reassembly, keyed by identification, addresses and protocol.
#[derive(Debug, Default)]
pub(crate) struct PacketAssemblerSet {
    assemblers: FnvIndexMap<Ipv4FragKey, PacketAssembler, REASSEMBLY_BUFFER_COUNT>,
}

impl PacketAssemblerSet {
    pub fn new() -> PacketAssemblerSet {
        PacketAssemblerSet::default()
    }

    pub fn len(&self) -> usize {
        self.assemblers.len()
    }

    /// Drop every datagram that has been in progress for too long.
    pub fn remove_expired(&mut self, now: Instant) {
        let expired: heapless::Vec<Ipv4FragKey, REASSEMBLY_BUFFER_COUNT> = self
            .assemblers
            .iter()
            .filter(|(_, assembler)| assembler.expires_at <= now)
            .map(|(key, _)| *key)
            .collect();
        for key in expired {
            net_debug!("frag assembler: datagram {} expired", key.id());
            self.assemblers.remove(&key);
        }
    }

    /// Add one fragment. Returns the whole datagram once its last piece is in.
    ///
    /// A datagram that gets an error is forgotten.
    pub fn add(
        &mut self,
        key: Ipv4FragKey,
        data: &[u8],
        offset: usize,
        last: bool,
        expires_at: Instant,
        max_size: usize,
    ) -> Result<Option<Vec<u8>>, FragmentError> {
        if !self.assemblers.contains_key(&key)
            && self
                .assemblers
                .insert(key, PacketAssembler::new(expires_at))
                .is_err()
        {
            return Err(FragmentError::Full);
        }
        let Some(assembler) = self.assemblers.get_mut(&key) else {
            return Err(FragmentError::Full);
        };

        if let Err(err) = assembler.add(data, offset, last, max_size) {
            self.assemblers.remove(&key);
            return Err(err);
        }
        if !assembler.is_complete() {
            return Ok(None);
        }

        Ok(self
            .assemblers
            .remove(&key)
            .map(|assembler| assembler.buffer))
    }
}
