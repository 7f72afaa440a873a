use crc32c::crc32c;
use std::io::{self, Read, Write};
use thiserror::Error;

pub const MAX_FRAME_BODY_BYTES: usize = 64 * 1024 * 1024;

/// ts (8) + op (1) + crc (4)
const MIN_BODY_BYTES: usize = 8 + 1 + 4;
const LEN_BYTES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOp {
    Put,
    Delete,
    /// Carries only a timestamp; written by compaction to keep the high
    /// water mark of dropped records.
    Mark,
}

impl LogOp {
    fn to_byte(self) -> u8 {
        match self {
            LogOp::Put => 0x01,
            LogOp::Delete => 0x02,
            LogOp::Mark => 0x03,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(LogOp::Put),
            0x02 => Some(LogOp::Delete),
            0x03 => Some(LogOp::Mark),
            _ => None,
        }
    }
}

/// One record of the metadata log: `len | ts | op | payload | crc32c`, all
/// integers big-endian, crc over everything before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFrame {
    pub ts: u64,
    pub op: LogOp,
    pub payload: Vec<u8>,
}

impl LogFrame {
    pub fn encoded_len(&self) -> usize {
        LEN_BYTES + MIN_BODY_BYTES + self.payload.len()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("truncated frame")]
    Truncation,
    #[error("corrupt frame")]
    Corruption,
    #[error("io error: {0}")]
    Io(String),
}

impl From<io::Error> for FrameError {
    fn from(value: io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

pub struct FrameWriter<W: Write> {
    inner: W,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Encodes the whole frame before touching the writer so a failed
    /// encode never leaves a partial frame behind.
    pub fn append(&mut self, ts: u64, op: LogOp, payload: &[u8]) -> Result<usize, FrameError> {
        let body_len = MIN_BODY_BYTES + payload.len();
        if body_len > MAX_FRAME_BODY_BYTES {
            return Err(FrameError::Corruption);
        }
        let frame_length = u32::try_from(body_len).map_err(|_| FrameError::Corruption)?;

        let mut buf = Vec::with_capacity(LEN_BYTES + body_len);
        buf.extend_from_slice(&frame_length.to_be_bytes());
        buf.extend_from_slice(&ts.to_be_bytes());
        buf.push(op.to_byte());
        buf.extend_from_slice(payload);
        let crc = crc32c(&buf);
        buf.extend_from_slice(&crc.to_be_bytes());

        self.inner.write_all(&buf)?;
        Ok(buf.len())
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

pub struct FrameReader<R: Read> {
    inner: R,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn next_frame(&mut self) -> Result<Option<LogFrame>, FrameError> {
        let mut len_buf = [0u8; LEN_BYTES];
        let first = self.inner.read(&mut len_buf[0..1])?;
        if first == 0 {
            return Ok(None);
        }
        read_exact_or_truncation(&mut self.inner, &mut len_buf[1..])?;
        let body_len = u32::from_be_bytes(len_buf) as usize;
        if !(MIN_BODY_BYTES..=MAX_FRAME_BODY_BYTES).contains(&body_len) {
            return Err(FrameError::Corruption);
        }

        let mut body = vec![0u8; body_len];
        read_exact_or_truncation(&mut self.inner, &mut body)?;

        let crc_offset = body_len - 4;
        let stored_crc = u32::from_be_bytes(
            body[crc_offset..]
                .try_into()
                .map_err(|_| FrameError::Corruption)?,
        );
        let mut crc_input = Vec::with_capacity(LEN_BYTES + crc_offset);
        crc_input.extend_from_slice(&len_buf);
        crc_input.extend_from_slice(&body[..crc_offset]);
        if crc32c(&crc_input) != stored_crc {
            return Err(FrameError::Corruption);
        }

        let ts = u64::from_be_bytes(body[0..8].try_into().map_err(|_| FrameError::Corruption)?);
        let op = LogOp::from_byte(body[8]).ok_or(FrameError::Corruption)?;
        let payload = body[9..crc_offset].to_vec();
        Ok(Some(LogFrame { ts, op, payload }))
    }
}

fn read_exact_or_truncation<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), FrameError> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(FrameError::Truncation),
        Err(e) => Err(FrameError::Io(e.to_string())),
    }
}
