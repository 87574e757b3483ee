//! Binary sample stream format.
//!
//! In binary output mode the session skips per-sample aggregation and
//! streams decoded samples behind a fixed header. The sample count in
//! the header is back-patched when the stream is finished, so readers
//! can trust it even though it is unknown up front.

use std::io::{self, Read, Seek, SeekFrom, Write};

use thiserror::Error;

use crate::config::ViewMode;
use crate::sample::{EarPayload, Sample, SamplingMode};

/// Stream magic: "EARS" in little-endian.
pub const MAGIC: u32 = 0x5352_4145;

/// Current stream format version.
pub const FORMAT_VERSION: u32 = 1;

/// Stream header size in bytes (magic, version, mode, view, pad, count).
pub const STREAM_HEADER_SIZE: usize = 24;

/// Fixed size of one serialized sample record.
pub const RECORD_SIZE: usize = 48;

/// Byte offset of the back-patched count field.
const COUNT_OFFSET: u64 = 16;

/// Errors that can occur while reading a sample stream.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("bad stream magic 0x{found:08x}")]
    BadMagic { found: u32 },

    #[error("unsupported stream version {version}")]
    UnsupportedVersion { version: u32 },

    #[error("unknown sampling mode byte {raw}")]
    UnknownMode { raw: u8 },

    #[error("unknown view mode byte {raw}")]
    UnknownView { raw: u8 },

    #[error("stream truncated mid-record after {records} records")]
    TruncatedRecord { records: u64 },
}

/// Parsed stream header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    pub version: u32,
    pub mode: SamplingMode,
    pub view: ViewMode,
    /// Number of records, back-patched by the writer at finish time.
    pub count: u64,
}

/// Writes a sample stream, back-patching the record count on finish.
pub struct SampleStreamWriter<W: Write + Seek> {
    out: W,
    count: u64,
}

impl<W: Write + Seek> SampleStreamWriter<W> {
    /// Write the stream header with a zero count placeholder.
    pub fn new(mut out: W, mode: SamplingMode, view: ViewMode) -> io::Result<Self> {
        out.write_all(&MAGIC.to_le_bytes())?;
        out.write_all(&FORMAT_VERSION.to_le_bytes())?;
        out.write_all(&[mode as u8, view as u8])?;
        out.write_all(&[0u8; 6])?; // pad
        out.write_all(&0u64.to_le_bytes())?; // count, patched at finish
        Ok(Self { out, count: 0 })
    }

    /// Append one decoded sample record.
    pub fn write_sample(&mut self, s: &Sample) -> io::Result<()> {
        let mut rec = [0u8; RECORD_SIZE];
        rec[0..4].copy_from_slice(&s.pid.to_le_bytes());
        rec[4..8].copy_from_slice(&s.tid.to_le_bytes());
        rec[8..16].copy_from_slice(&s.timestamp.to_le_bytes());
        rec[16..24].copy_from_slice(&s.ip.to_le_bytes());
        rec[24..32].copy_from_slice(&s.payload.data_address.to_le_bytes());
        rec[32..40].copy_from_slice(&s.payload.instr_address.to_le_bytes());
        rec[40..44].copy_from_slice(&s.payload.latency.to_le_bytes());
        rec[44] = s.payload.hw_level;
        // rec[45..48] stays zero (pad)
        self.out.write_all(&rec)?;
        self.count += 1;
        Ok(())
    }

    /// Records written so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Back-patch the record count into the header and flush, returning
    /// the inner writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.out.seek(SeekFrom::Start(COUNT_OFFSET))?;
        self.out.write_all(&self.count.to_le_bytes())?;
        self.out.seek(SeekFrom::End(0))?;
        self.out.flush()?;
        Ok(self.out)
    }
}

/// Reads a sample stream written by [`SampleStreamWriter`].
#[derive(Debug)]
pub struct SampleStreamReader<R: Read> {
    input: R,
    header: StreamHeader,
    read: u64,
}

impl<R: Read> SampleStreamReader<R> {
    pub fn new(mut input: R) -> Result<Self, StreamError> {
        let mut hdr = [0u8; STREAM_HEADER_SIZE];
        input.read_exact(&mut hdr)?;

        let magic = u32::from_le_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]);
        if magic != MAGIC {
            return Err(StreamError::BadMagic { found: magic });
        }

        let version = u32::from_le_bytes([hdr[4], hdr[5], hdr[6], hdr[7]]);
        if version != FORMAT_VERSION {
            return Err(StreamError::UnsupportedVersion { version });
        }

        let mode =
            SamplingMode::from_u8(hdr[8]).ok_or(StreamError::UnknownMode { raw: hdr[8] })?;
        let view = ViewMode::from_u8(hdr[9]).ok_or(StreamError::UnknownView { raw: hdr[9] })?;
        let count = u64::from_le_bytes([
            hdr[16], hdr[17], hdr[18], hdr[19], hdr[20], hdr[21], hdr[22], hdr[23],
        ]);

        Ok(Self {
            input,
            header: StreamHeader {
                version,
                mode,
                view,
                count,
            },
            read: 0,
        })
    }

    pub fn header(&self) -> StreamHeader {
        self.header
    }

    /// Read the next record, or `None` once `count` records were read.
    pub fn next_sample(&mut self) -> Result<Option<Sample>, StreamError> {
        if self.read >= self.header.count {
            return Ok(None);
        }

        let mut rec = [0u8; RECORD_SIZE];
        self.input.read_exact(&mut rec).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                StreamError::TruncatedRecord { records: self.read }
            } else {
                StreamError::Io(e)
            }
        })?;
        self.read += 1;

        let u32_at = |off: usize| u32::from_le_bytes([rec[off], rec[off + 1], rec[off + 2], rec[off + 3]]);
        let u64_at = |off: usize| {
            u64::from_le_bytes([
                rec[off],
                rec[off + 1],
                rec[off + 2],
                rec[off + 3],
                rec[off + 4],
                rec[off + 5],
                rec[off + 6],
                rec[off + 7],
            ])
        };

        Ok(Some(Sample {
            pid: u32_at(0),
            tid: u32_at(4),
            timestamp: u64_at(8),
            ip: u64_at(16),
            payload: EarPayload {
                data_address: u64_at(24),
                instr_address: u64_at(32),
                latency: u32_at(40),
                hw_level: rec[44],
            },
        }))
    }
}
