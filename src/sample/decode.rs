//! Sample entry decoding for raw buffer records.
//!
//! Each buffer entry is a fixed-size record: a 24-byte entry header
//! followed by a PMU register block of little-endian 64-bit words.
//! Length checks happen once per entry, then fixed-width reads use
//! unchecked unaligned loads to minimize decoder overhead. The register
//! block layout is PMU-model specific and handled by [`PmuDecoder`]
//! implementations.

use thiserror::Error;

use super::{EarPayload, Sample};

/// Entry header size in bytes (pid, tid, timestamp, ip).
pub const ENTRY_HEADER_SIZE: usize = 24;

/// Errors that can occur while decoding a sample entry.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("entry too short: {size} bytes")]
    Truncated { size: usize },

    #[error("register block is {size} bytes, not a multiple of 8")]
    MisalignedRegisters { size: usize },

    #[error("{model}: register block has {got} words, need {need}")]
    ShortRegisterBlock {
        model: &'static str,
        got: usize,
        need: usize,
    },

    #[error("{model}: sample flagged invalid by hardware")]
    InvalidSample { model: &'static str },
}

/// Little-endian word view over an entry's PMU register block.
#[derive(Debug, Clone, Copy)]
pub struct RegBlock<'a> {
    data: &'a [u8],
}

impl<'a> RegBlock<'a> {
    /// Wraps a register block, rejecting byte lengths that are not a
    /// whole number of 64-bit words.
    pub fn new(data: &'a [u8]) -> Result<Self, DecodeError> {
        if data.len() % 8 != 0 {
            return Err(DecodeError::MisalignedRegisters { size: data.len() });
        }
        Ok(Self { data })
    }

    /// Number of 64-bit words in the block.
    pub fn words(&self) -> usize {
        self.data.len() / 8
    }

    /// Reads word `idx`, or `None` past the end of the block.
    pub fn word(&self, idx: usize) -> Option<u64> {
        let offset = idx.checked_mul(8)?;
        if offset + 8 > self.data.len() {
            return None;
        }
        Some(read_u64_le(self.data, offset))
    }
}

/// Decodes one PMU-model-specific register block into an EAR payload.
///
/// Returns the payload and how many words of the block were consumed,
/// so callers can account for models with trailing status words.
pub trait PmuDecoder: Send + Sync {
    /// Returns the model name for logging.
    fn name(&self) -> &'static str;

    /// Decode one register block.
    fn decode(&self, regs: &RegBlock<'_>) -> Result<(EarPayload, usize), DecodeError>;
}

/// Decode one raw buffer entry into a [`Sample`], returning the sample
/// and how many register words its decoder consumed.
pub fn decode_entry(
    data: &[u8],
    decoder: &dyn PmuDecoder,
) -> Result<(Sample, usize), DecodeError> {
    if data.len() < ENTRY_HEADER_SIZE {
        return Err(DecodeError::Truncated { size: data.len() });
    }

    let pid = read_u32_le(data, 0);
    let tid = read_u32_le(data, 4);
    let timestamp = read_u64_le(data, 8);
    let ip = read_u64_le(data, 16);

    // Safety: `data.len() >= ENTRY_HEADER_SIZE` is checked at entry.
    let regs = RegBlock::new(unsafe { data.get_unchecked(ENTRY_HEADER_SIZE..) })?;
    let (payload, consumed) = decoder.decode(&regs)?;

    Ok((
        Sample {
            pid,
            tid,
            timestamp,
            ip,
            payload,
        },
        consumed,
    ))
}

// ---------------------------------------------------------------------------
// Byte-reading helpers
// ---------------------------------------------------------------------------

#[inline(always)]
pub(crate) fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(read_fixed::<4>(data, offset))
}

#[inline(always)]
pub(crate) fn read_u64_le(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(read_fixed::<8>(data, offset))
}

#[inline(always)]
fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    debug_assert!(offset + N <= data.len());
    // Safety: callers ensure `offset + N <= data.len()` via upfront length checks.
    unsafe { (data.as_ptr().add(offset) as *const [u8; N]).read_unaligned() }
}

// ---------------------------------------------------------------------------
// Per-model decoders
// ---------------------------------------------------------------------------

fn require_words(
    regs: &RegBlock<'_>,
    need: usize,
    model: &'static str,
) -> Result<(), DecodeError> {
    if regs.words() < need {
        Err(DecodeError::ShortRegisterBlock {
            model,
            got: regs.words(),
            need,
        })
    } else {
        Ok(())
    }
}

/// First-generation data EAR block: 3 words.
///
/// word 0: data address. word 1: instruction address, low 2 bits are
/// the bundle slot. word 2: status (bit 0 valid, bits 2-13 latency,
/// bits 14-15 level indicator).
pub struct ItaniumDecoder;

impl PmuDecoder for ItaniumDecoder {
    fn name(&self) -> &'static str {
        "itanium"
    }

    fn decode(&self, regs: &RegBlock<'_>) -> Result<(EarPayload, usize), DecodeError> {
        require_words(regs, 3, self.name())?;
        let daddr = regs.word(0).unwrap_or(0);
        let iaddr = regs.word(1).unwrap_or(0);
        let status = regs.word(2).unwrap_or(0);

        if status & 1 == 0 {
            return Err(DecodeError::InvalidSample { model: self.name() });
        }

        Ok((
            EarPayload {
                data_address: daddr,
                instr_address: iaddr & !0x3,
                latency: ((status >> 2) & 0xfff) as u32,
                hw_level: ((status >> 14) & 0x3) as u8,
            },
            3,
        ))
    }
}

/// Second-generation data EAR block: 3 words, wider latency field.
///
/// word 0: data address. word 1: instruction bundle address, low 4 bits
/// are the slot. word 2: status (bit 0 valid, bits 2-14 latency,
/// bits 15-16 level indicator).
pub struct Itanium2Decoder;

impl PmuDecoder for Itanium2Decoder {
    fn name(&self) -> &'static str {
        "itanium2"
    }

    fn decode(&self, regs: &RegBlock<'_>) -> Result<(EarPayload, usize), DecodeError> {
        require_words(regs, 3, self.name())?;
        let daddr = regs.word(0).unwrap_or(0);
        let iaddr = regs.word(1).unwrap_or(0);
        let status = regs.word(2).unwrap_or(0);

        if status & 1 == 0 {
            return Err(DecodeError::InvalidSample { model: self.name() });
        }

        Ok((
            EarPayload {
                data_address: daddr,
                instr_address: iaddr & !0xf,
                latency: ((status >> 2) & 0x1fff) as u32,
                hw_level: ((status >> 15) & 0x3) as u8,
            },
            3,
        ))
    }
}

/// Dual-core generation data EAR block: 4 words.
///
/// Words 0-2 follow the itanium2 shape with a 14-bit latency at bits
/// 2-15 and the level indicator at bits 16-17; word 3 is an extended
/// status word that is consumed but carries nothing we report.
pub struct MontecitoDecoder;

impl PmuDecoder for MontecitoDecoder {
    fn name(&self) -> &'static str {
        "montecito"
    }

    fn decode(&self, regs: &RegBlock<'_>) -> Result<(EarPayload, usize), DecodeError> {
        require_words(regs, 4, self.name())?;
        let daddr = regs.word(0).unwrap_or(0);
        let iaddr = regs.word(1).unwrap_or(0);
        let status = regs.word(2).unwrap_or(0);

        if status & 1 == 0 {
            return Err(DecodeError::InvalidSample { model: self.name() });
        }

        Ok((
            EarPayload {
                data_address: daddr,
                instr_address: iaddr & !0xf,
                latency: ((status >> 2) & 0x3fff) as u32,
                hw_level: ((status >> 16) & 0x3) as u8,
            },
            4,
        ))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
