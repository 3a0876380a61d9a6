//! Guacamole instruction encoding, parsing and stream framing.
//!
//! An instruction is a comma-separated list of elements terminated by `;`.
//! Each element is `<length>.<value>` where `<length>` counts Unicode scalar
//! values, not bytes:
//!
//! ```text
//! 6.select,3.rdp;
//! 4.size,4.1024,3.768,2.96;
//! ```
//!
//! Because lengths are explicit, a `;` or `,` inside a value (such as the
//! `audio/L16;rate=44100,channels=2` mimetype) never ends an element. The
//! [`InstructionReader`] honours that when cutting a byte stream into units.

use std::fmt;
use std::str::FromStr;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::ProtocolError;

/// Opcode of internal tunnel instructions (`0.,4.ping,...;`).
pub const INTERNAL_OPCODE: &str = "";

/// Largest single instruction accepted from the wire.
pub const MAX_INSTRUCTION_BYTES: usize = 1024 * 1024;

/// Bytes requested from the socket per read.
const READ_CHUNK: usize = 8192;

/// One protocol instruction: an opcode followed by ordered arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: String,
    pub args: Vec<String>,
}

impl Instruction {
    pub fn new<I, S>(opcode: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            opcode: opcode.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Canonical wire representation.
    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// Parse exactly one instruction. Trailing bytes after `;` are an error.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let mut elements = Vec::new();
        let mut rest = raw;

        loop {
            let dot = rest
                .find('.')
                .ok_or_else(|| ProtocolError::Malformed("missing element length".to_string()))?;
            let len_str = &rest[..dot];
            if len_str.is_empty() || !len_str.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ProtocolError::Malformed(format!(
                    "invalid element length '{len_str}'"
                )));
            }
            let len: usize = len_str
                .parse()
                .map_err(|_| ProtocolError::Malformed(format!("length overflow '{len_str}'")))?;

            let value_and_rest = &rest[dot + 1..];
            let value_end = value_and_rest
                .char_indices()
                .nth(len)
                .map_or(value_and_rest.len(), |(idx, _)| idx);
            if value_and_rest[..value_end].chars().count() != len {
                return Err(ProtocolError::Malformed("element shorter than its length".to_string()));
            }
            elements.push(value_and_rest[..value_end].to_string());

            let after = &value_and_rest[value_end..];
            match after.chars().next() {
                Some(',') => rest = &after[1..],
                Some(';') if after.len() == 1 => break,
                Some(';') => {
                    return Err(ProtocolError::Malformed(
                        "trailing data after terminator".to_string(),
                    ))
                }
                Some(c) => {
                    return Err(ProtocolError::Malformed(format!(
                        "unexpected '{c}' after element"
                    )))
                }
                None => return Err(ProtocolError::Malformed("missing terminator".to_string())),
            }
        }

        let mut elements = elements.into_iter();
        let opcode = elements.next().unwrap_or_default();
        Ok(Self {
            opcode,
            args: elements.collect(),
        })
    }

    /// Whether this is the client keepalive `0.,4.ping,...;`.
    pub fn is_internal_ping(&self) -> bool {
        self.opcode == INTERNAL_OPCODE && self.args.first().is_some_and(|a| a == "ping")
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.opcode.chars().count(), self.opcode)?;
        for arg in &self.args {
            write!(f, ",{}.{}", arg.chars().count(), arg)?;
        }
        f.write_str(";")
    }
}

impl FromStr for Instruction {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Result of scanning a buffer for one complete instruction.
#[derive(Debug, PartialEq, Eq)]
enum Scan {
    /// Instruction ends at this exclusive byte offset.
    Complete(usize),
    /// More bytes needed; resume scanning at this element boundary.
    Partial(usize),
}

/// Width of the UTF-8 sequence introduced by `lead`.
fn utf8_width(lead: u8) -> Result<usize, ProtocolError> {
    match lead {
        0x00..=0x7F => Ok(1),
        0xC0..=0xDF => Ok(2),
        0xE0..=0xEF => Ok(3),
        0xF0..=0xF7 => Ok(4),
        _ => Err(ProtocolError::Malformed(format!(
            "invalid UTF-8 lead byte {lead:#04x}"
        ))),
    }
}

/// Walk elements starting at `from` (which must be an element boundary of the
/// instruction beginning at offset 0).
fn scan(buf: &[u8], from: usize) -> Result<Scan, ProtocolError> {
    let mut pos = from;
    loop {
        let element_start = pos;

        let mut len: usize = 0;
        let mut digits = 0usize;
        loop {
            let Some(&b) = buf.get(pos) else {
                return Ok(Scan::Partial(element_start));
            };
            match b {
                b'0'..=b'9' => {
                    len = len
                        .checked_mul(10)
                        .and_then(|l| l.checked_add(usize::from(b - b'0')))
                        .ok_or_else(|| ProtocolError::Malformed("length overflow".to_string()))?;
                    digits += 1;
                    pos += 1;
                }
                b'.' if digits > 0 => {
                    pos += 1;
                    break;
                }
                _ => {
                    return Err(ProtocolError::Malformed(format!(
                        "unexpected byte {b:#04x} in element length"
                    )))
                }
            }
        }

        for _ in 0..len {
            let Some(&b) = buf.get(pos) else {
                return Ok(Scan::Partial(element_start));
            };
            pos += utf8_width(b)?;
        }

        match buf.get(pos) {
            None => return Ok(Scan::Partial(element_start)),
            Some(b',') => pos += 1,
            Some(b';') => return Ok(Scan::Complete(pos + 1)),
            Some(&b) => {
                return Err(ProtocolError::Malformed(format!(
                    "unexpected byte {b:#04x} after element"
                )))
            }
        }
    }
}

/// Cuts a byte stream into whole instructions.
pub struct InstructionReader<R> {
    inner: R,
    buf: Vec<u8>,
    resume: usize,
}

impl<R: AsyncRead + Unpin> InstructionReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(READ_CHUNK),
            resume: 0,
        }
    }

    /// Read the raw bytes of the next complete instruction, terminator
    /// included. `Ok(None)` on a clean EOF between instructions.
    pub async fn read_raw(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        loop {
            if !self.buf.is_empty() {
                match scan(&self.buf, self.resume)? {
                    Scan::Complete(end) => {
                        let rest = self.buf.split_off(end);
                        let unit = std::mem::replace(&mut self.buf, rest);
                        self.resume = 0;
                        return Ok(Some(unit));
                    }
                    Scan::Partial(resume) => self.resume = resume,
                }
            }

            if self.buf.len() > MAX_INSTRUCTION_BYTES {
                return Err(ProtocolError::TooLong(MAX_INSTRUCTION_BYTES));
            }

            self.buf.reserve(READ_CHUNK);
            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(ProtocolError::Malformed(
                    "connection closed mid-instruction".to_string(),
                ));
            }
        }
    }

    /// Give back the underlying stream. Buffered bytes are discarded.
    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Read and parse the next instruction.
    pub async fn read_instruction(&mut self) -> Result<Option<Instruction>, ProtocolError> {
        let Some(raw) = self.read_raw().await? else {
            return Ok(None);
        };
        let text = std::str::from_utf8(&raw)
            .map_err(|e| ProtocolError::Malformed(format!("invalid UTF-8: {e}")))?;
        Instruction::parse(text).map(Some)
    }
}
