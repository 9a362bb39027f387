//! Primitive field codecs shared by the packet and property modules.
//!
//! MQTT builds every packet out of a handful of field shapes: single bytes,
//! 16- and 32-bit big-endian integers, variable byte integers, and
//! 2-byte-length-prefixed UTF-8 strings or binary blobs. `Decoder` is a
//! cursor over a received byte slice; the `write_*` helpers append the same
//! shapes to an outgoing buffer.

use crate::error::{ProtocolError, Result};
use crate::varint;

/// Cursor-style decoder over a packet body.
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Bytes consumed so far.
    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        if self.pos >= self.buf.len() {
            return Err(ProtocolError::IncompletePacket { needed: 1, have: 0 });
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        if self.remaining() < 2 {
            return Err(ProtocolError::IncompletePacket {
                needed: 2,
                have: self.remaining(),
            });
        }
        let val = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(val)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        if self.remaining() < 4 {
            return Err(ProtocolError::IncompletePacket {
                needed: 4,
                have: self.remaining(),
            });
        }
        let val = u32::from_be_bytes([
            self.buf[self.pos],
            self.buf[self.pos + 1],
            self.buf[self.pos + 2],
            self.buf[self.pos + 3],
        ]);
        self.pos += 4;
        Ok(val)
    }

    /// Read a variable byte integer.
    pub fn read_varint(&mut self) -> Result<u32> {
        match varint::decode(&self.buf[self.pos..])? {
            Some((value, consumed)) => {
                self.pos += consumed;
                Ok(value)
            }
            None => Err(ProtocolError::IncompletePacket {
                needed: 1,
                have: 0,
            }),
        }
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(ProtocolError::IncompletePacket {
                needed: len,
                have: self.remaining(),
            });
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    /// Read a 2-byte-length-prefixed UTF-8 string.
    ///
    /// The string must not contain the null character U+0000.
    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        if bytes.contains(&0u8) {
            return Err(ProtocolError::MalformedPacket(
                "UTF-8 string must not contain null character".into(),
            ));
        }
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }

    /// Read a 2-byte-length-prefixed binary blob.
    pub fn read_binary(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        Ok(bytes.to_vec())
    }
}

pub fn write_u8(buf: &mut Vec<u8>, value: u8) {
    buf.push(value);
}

pub fn write_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_be_bytes());
}

pub fn write_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

pub fn write_varint(buf: &mut Vec<u8>, value: u32) -> Result<usize> {
    varint::encode(value, buf)
}

/// Write a 2-byte-length-prefixed UTF-8 string.
pub fn write_string(buf: &mut Vec<u8>, value: &str) -> Result<()> {
    if value.len() > u16::MAX as usize {
        return Err(ProtocolError::BadArg("string exceeds 65535 bytes"));
    }
    write_u16(buf, value.len() as u16);
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

/// Write a 2-byte-length-prefixed binary blob.
pub fn write_binary(buf: &mut Vec<u8>, value: &[u8]) -> Result<()> {
    if value.len() > u16::MAX as usize {
        return Err(ProtocolError::BadArg("binary data exceeds 65535 bytes"));
    }
    write_u16(buf, value.len() as u16);
    buf.extend_from_slice(value);
    Ok(())
}
