//! Row decompression for compressed SAS7BDAT files.
//!
//! `SASYZCRL` files use a run-length scheme driven by a command nibble;
//! `SASYZCR2` files use Ross Data Compression, which mixes literal bytes,
//! runs and back-references under 16-bit control words.

use std::fmt::Display;

use crate::error::Error;
use crate::types::{FileFormat, Result};

fn corrupt(message: impl Display) -> Error {
    Error::parse(FileFormat::Sas7bdat, format!("corrupt compressed row: {}", message))
}

/// Declared row lengths come from the file, so only this much is reserved up front
const INITIAL_CAPACITY: usize = 64 * 1024;

/// Bounded output buffer shared by both decoders
struct Output {
    buf: Vec<u8>,
    limit: usize,
}

impl Output {
    fn new(limit: usize) -> Self {
        Self {
            buf: Vec::with_capacity(limit.min(INITIAL_CAPACITY)),
            limit,
        }
    }

    fn room(&self, len: usize) -> Result<()> {
        if self.buf.len() + len > self.limit {
            return Err(corrupt("row expands past its declared length"));
        }
        Ok(())
    }

    fn fill(&mut self, byte: u8, len: usize) -> Result<()> {
        self.room(len)?;
        self.buf.resize(self.buf.len() + len, byte);
        Ok(())
    }

    fn copy(&mut self, bytes: &[u8]) -> Result<()> {
        self.room(bytes.len())?;
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    fn back_reference(&mut self, distance: usize, len: usize) -> Result<()> {
        self.room(len)?;
        let start = self
            .buf
            .len()
            .checked_sub(distance)
            .ok_or_else(|| corrupt("back-reference before start of row"))?;
        // Byte by byte: source and destination may overlap.
        for i in 0..len {
            let byte = self.buf[start + i];
            self.buf.push(byte);
        }
        Ok(())
    }

    fn finish(self) -> Result<Vec<u8>> {
        if self.buf.len() != self.limit {
            return Err(corrupt(format!(
                "expanded to {} bytes, expected {}",
                self.buf.len(),
                self.limit
            )));
        }
        Ok(self.buf)
    }
}

/// Forward reader over the compressed bytes
struct Input<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Input<'a> {
    fn byte(&mut self) -> Result<u8> {
        let b = *self
            .bytes
            .get(self.pos)
            .ok_or_else(|| corrupt("unexpected end of input"))?;
        self.pos += 1;
        Ok(b)
    }

    fn slice(&mut self, len: usize) -> Result<&'a [u8]> {
        let s = self
            .bytes
            .get(self.pos..self.pos + len)
            .ok_or_else(|| corrupt("unexpected end of input"))?;
        self.pos += len;
        Ok(s)
    }

    fn is_done(&self) -> bool {
        self.pos >= self.bytes.len()
    }
}

/// Expand an RLE (`SASYZCRL`) row to `row_length` bytes
pub fn rle(input: &[u8], row_length: usize) -> Result<Vec<u8>> {
    let mut input = Input {
        bytes: input,
        pos: 0,
    };
    let mut out = Output::new(row_length);

    while !input.is_done() {
        let control = input.byte()?;
        let command = control >> 4;
        let low = usize::from(control & 0x0f);

        match command {
            0x0 => {
                let len = usize::from(input.byte()?) + 64 + low * 256;
                out.copy(input.slice(len)?)?;
            }
            0x1 => {
                let len = usize::from(input.byte()?) + 64 + low * 256 + 4096;
                out.copy(input.slice(len)?)?;
            }
            0x2 => out.copy(input.slice(low + 96)?)?,
            0x4 => {
                let len = usize::from(input.byte()?) + 18 + low * 256;
                let byte = input.byte()?;
                out.fill(byte, len)?;
            }
            0x5 => {
                let len = usize::from(input.byte()?) + 17 + low * 256;
                out.fill(b'@', len)?;
            }
            0x6 => {
                let len = usize::from(input.byte()?) + 17 + low * 256;
                out.fill(b' ', len)?;
            }
            0x7 => {
                let len = usize::from(input.byte()?) + 17 + low * 256;
                out.fill(0, len)?;
            }
            0x8 => out.copy(input.slice(low + 1)?)?,
            0x9 => out.copy(input.slice(low + 17)?)?,
            0xa => out.copy(input.slice(low + 33)?)?,
            0xb => out.copy(input.slice(low + 49)?)?,
            0xc => {
                let byte = input.byte()?;
                out.fill(byte, low + 3)?;
            }
            0xd => out.fill(b'@', low + 2)?,
            0xe => out.fill(b' ', low + 2)?,
            0xf => out.fill(0, low + 2)?,
            other => return Err(corrupt(format!("unknown RLE command {:#x}", other))),
        }
    }

    out.finish()
}

/// Expand an RDC (`SASYZCR2`) row to `row_length` bytes
pub fn rdc(input: &[u8], row_length: usize) -> Result<Vec<u8>> {
    let mut input = Input {
        bytes: input,
        pos: 0,
    };
    let mut out = Output::new(row_length);
    let mut control_bits: u16 = 0;
    let mut control_mask: u16 = 0;

    while !input.is_done() {
        control_mask >>= 1;
        if control_mask == 0 {
            let hi = input.byte()?;
            let lo = input.byte()?;
            control_bits = u16::from_be_bytes([hi, lo]);
            control_mask = 0x8000;
            if input.is_done() {
                break;
            }
        }

        if control_bits & control_mask == 0 {
            let byte = input.byte()?;
            out.copy(&[byte])?;
            continue;
        }

        let first = input.byte()?;
        let command = first >> 4;
        let count = usize::from(first & 0x0f);

        match command {
            // short run
            0 => {
                let byte = input.byte()?;
                out.fill(byte, count + 3)?;
            }
            // long run
            1 => {
                let len = count + (usize::from(input.byte()?) << 4) + 19;
                let byte = input.byte()?;
                out.fill(byte, len)?;
            }
            // long pattern
            2 => {
                let distance = count + 3 + (usize::from(input.byte()?) << 4);
                let len = usize::from(input.byte()?) + 16;
                out.back_reference(distance, len)?;
            }
            // short pattern, the command nibble is the length
            len => {
                let distance = count + 3 + (usize::from(input.byte()?) << 4);
                out.back_reference(distance, usize::from(len))?;
            }
        }
    }

    out.finish()
}
