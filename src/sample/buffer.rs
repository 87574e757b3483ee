//! Raw sample buffer access and incremental drain tracking.
//!
//! The collector appends fixed-size entries to a ring region behind a
//! small header carrying `total_count` and `overflow_count`. Repeated
//! drains of the same growing buffer must not count an entry twice; the
//! [`Watermark`] records how far the previous drain got and [`drain`]
//! turns the current buffer image into a lazy iterator over the entries
//! that are genuinely new.

use thiserror::Error;
use tracing::warn;

use super::decode::{
    decode_entry, read_u32_le, read_u64_le, DecodeError, PmuDecoder, ENTRY_HEADER_SIZE,
};
use super::Sample;

/// Buffer header size in bytes (total_count, overflow_count, entry_size, pad).
pub const BUFFER_HEADER_SIZE: usize = 24;

/// Errors that can occur while reading a raw buffer image.
#[derive(Error, Debug)]
pub enum BufferError {
    #[error("buffer too short for header: {size} bytes")]
    TruncatedHeader { size: usize },

    #[error("invalid entry size {entry_size}")]
    InvalidEntrySize { entry_size: u32 },

    #[error(
        "buffer truncated: header claims {claimed} entries of {entry_size} bytes, \
         {available} bytes of entry data present"
    )]
    TruncatedEntries {
        claimed: u64,
        entry_size: u32,
        available: usize,
    },
}

/// Parsed buffer header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferHeader {
    /// Number of entries currently in the buffer.
    pub total_count: u64,
    /// Number of times the buffer has been reset after filling up.
    pub overflow_count: u64,
    /// Size of each entry in bytes, header included.
    pub entry_size: u32,
}

/// Read-only view over one raw sample buffer image.
#[derive(Debug)]
pub struct RawBuffer<'a> {
    header: BufferHeader,
    entries: &'a [u8],
}

impl<'a> RawBuffer<'a> {
    /// Parse a raw buffer image, validating the header against the
    /// available entry bytes.
    pub fn parse(data: &'a [u8]) -> Result<Self, BufferError> {
        if data.len() < BUFFER_HEADER_SIZE {
            return Err(BufferError::TruncatedHeader { size: data.len() });
        }

        let total_count = read_u64_le(data, 0);
        let overflow_count = read_u64_le(data, 8);
        let entry_size = read_u32_le(data, 16);

        // An entry must hold its header plus at least one register word,
        // and stay word-aligned.
        if (entry_size as usize) < ENTRY_HEADER_SIZE + 8 || entry_size % 8 != 0 {
            return Err(BufferError::InvalidEntrySize { entry_size });
        }

        let entries = &data[BUFFER_HEADER_SIZE..];
        let needed = total_count.saturating_mul(u64::from(entry_size));
        if (entries.len() as u64) < needed {
            return Err(BufferError::TruncatedEntries {
                claimed: total_count,
                entry_size,
                available: entries.len(),
            });
        }

        Ok(Self {
            header: BufferHeader {
                total_count,
                overflow_count,
                entry_size,
            },
            entries,
        })
    }

    /// Returns the parsed header.
    pub fn header(&self) -> BufferHeader {
        self.header
    }

    /// Returns the raw bytes of entry `idx`, or `None` past `total_count`.
    pub fn entry(&self, idx: u64) -> Option<&'a [u8]> {
        if idx >= self.header.total_count {
            return None;
        }
        let size = self.header.entry_size as usize;
        let start = (idx as usize).checked_mul(size)?;
        self.entries.get(start..start + size)
    }
}

/// Last-seen `(count, overflows)` pair from the previous drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermark {
    pub count: u64,
    pub overflows: u64,
}

/// How a drain should treat the current buffer relative to a watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainPlan {
    /// Leading entries already processed by an earlier drain.
    pub skip: u64,
    /// The buffer wrapped past previously seen data; entries were lost.
    pub lost: bool,
}

impl Watermark {
    /// Sentinel watermark: all bits set, so the first drain skips nothing.
    pub const INITIAL: Self = Self {
        count: u64::MAX,
        overflows: u64::MAX,
    };

    /// Whether this is the pre-first-drain sentinel.
    pub fn is_initial(&self) -> bool {
        *self == Self::INITIAL
    }

    /// Decide how many leading entries of a buffer with header `hdr`
    /// were already seen. The buffer is contiguous with the previous
    /// drain when the overflow count is unchanged and the entry count
    /// has not gone backward, or when exactly one reset happened and
    /// the buffer has already refilled past the old count.
    pub fn plan(&self, hdr: BufferHeader) -> DrainPlan {
        if self.is_initial() {
            return DrainPlan {
                skip: 0,
                lost: false,
            };
        }

        let same_cycle = self.overflows == hdr.overflow_count && self.count <= hdr.total_count;
        let one_reset = self.overflows.checked_add(1) == Some(hdr.overflow_count)
            && self.count < hdr.total_count;

        if same_cycle || one_reset {
            DrainPlan {
                skip: self.count,
                lost: false,
            }
        } else {
            DrainPlan { skip: 0, lost: true }
        }
    }
}

/// Lazy iterator over the entries of one drain that are new relative to
/// the previous watermark.
pub struct Drain<'a, 'd> {
    buf: &'a RawBuffer<'a>,
    decoder: &'d dyn PmuDecoder,
    next: u64,
    end: u64,
    /// Leading entries skipped as already processed.
    pub skipped: u64,
    /// Whether the buffer wrapped past the watermark with data loss.
    pub lost: bool,
}

impl Drain<'_, '_> {
    /// Number of entries this drain will visit.
    pub fn remaining(&self) -> u64 {
        self.end - self.next
    }
}

impl Iterator for Drain<'_, '_> {
    type Item = Result<Sample, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let idx = self.next;
        self.next += 1;

        let data = self.buf.entry(idx)?;
        Some(decode_entry(data, self.decoder).map(|(sample, _consumed)| sample))
    }
}

/// Begin a drain: compute the new-entry window from `watermark`, advance
/// the watermark to the buffer's current header, and return the lazy
/// sample iterator. A wrap past the watermark is logged once here and
/// never fatal.
pub fn drain<'a, 'd>(
    buf: &'a RawBuffer<'a>,
    watermark: &mut Watermark,
    decoder: &'d dyn PmuDecoder,
) -> Drain<'a, 'd> {
    let hdr = buf.header();
    let plan = watermark.plan(hdr);

    if plan.lost {
        warn!(
            last_count = watermark.count,
            last_overflows = watermark.overflows,
            total_count = hdr.total_count,
            overflow_count = hdr.overflow_count,
            "sample buffer wrapped past watermark, samples may have been lost"
        );
    }

    *watermark = Watermark {
        count: hdr.total_count,
        overflows: hdr.overflow_count,
    };

    Drain {
        buf,
        decoder,
        next: plan.skip,
        end: hdr.total_count,
        skipped: plan.skip,
        lost: plan.lost,
    }
}
