use core::fmt;

use heapless::Vec;

use crate::config::ASSEMBLER_MAX_SEGMENT_COUNT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TooManyHolesError;

impl fmt::Display for TooManyHolesError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "too many holes")
    }
}

impl core::error::Error for TooManyHolesError {}

/// Tracks which byte ranges of a buffer have been filled in.
///
/// Ranges are kept sorted, disjoint and non-adjacent; adding a range merges it with every
/// range it touches. At most [ASSEMBLER_MAX_SEGMENT_COUNT] discontiguous ranges are held.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct Assembler {
    // (start, end) pairs, end exclusive.
    ranges: Vec<(usize, usize), ASSEMBLER_MAX_SEGMENT_COUNT>,
}

impl fmt::Display for Assembler {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[ ")?;
        for (start, end) in self.ranges.iter() {
            write!(f, "{start}..{end} ")?;
        }
        write!(f, "]")
    }
}

impl Assembler {
    /// Create a new, empty assembler.
    pub const fn new() -> Assembler {
        Assembler { ranges: Vec::new() }
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Return whether the assembler contains no data.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Return length of the range starting at offset zero, if any.
    pub fn peek_front(&self) -> usize {
        match self.ranges.first() {
            Some(&(0, end)) => end,
            _ => 0,
        }
    }

    /// Return whether `0..size` is entirely filled in.
    pub fn is_complete(&self, size: usize) -> bool {
        self.peek_front() >= size
    }

    /// Mark `offset..offset + size` as filled in,
    /// or return `Err(TooManyHolesError)` if too many discontinuities are already recorded.
    pub fn add(&mut self, offset: usize, size: usize) -> Result<(), TooManyHolesError> {
        if size == 0 {
            return Ok(());
        }
        let (mut start, mut end) = (offset, offset + size);

        // First range that ends at or after our start; everything before stays.
        let first = self
            .ranges
            .iter()
            .position(|&(_, e)| e >= start)
            .unwrap_or(self.ranges.len());
        // One past the last range that starts at or before our end.
        let last = self.ranges[first..]
            .iter()
            .position(|&(s, _)| s > end)
            .map_or(self.ranges.len(), |n| first + n);

        if first == last {
            return self
                .ranges
                .insert(first, (start, end))
                .map_err(|_| TooManyHolesError);
        }

        start = start.min(self.ranges[first].0);
        end = end.max(self.ranges[last - 1].1);
        self.ranges[first] = (start, end);
        for _ in first + 1..last {
            self.ranges.remove(first + 1);
        }
        Ok(())
    }

    /// Iterate over all of the filled ranges, shifted by `first_offset`.
    pub fn iter_data(&self, first_offset: usize) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.ranges
            .iter()
            .map(move |&(start, end)| (start + first_offset, end + first_offset))
    }
}
