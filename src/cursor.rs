//! Sequential little-endian reader over an in-memory byte buffer.
use crate::error::DecodeError;

/// Cursor over a borrowed byte slice. All multi-byte reads are little-endian,
/// matching the DXB container's on-wire format.
pub struct ByteCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        ByteCursor { bytes, pos: 0 }
    }

    pub fn at(bytes: &'a [u8], pos: usize) -> Self {
        ByteCursor { bytes, pos }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    fn need(&self, n: usize, section: &'static str) -> Result<(), DecodeError> {
        if self.remaining() < n {
            Err(DecodeError::Truncated(section))
        } else {
            Ok(())
        }
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        self.need(1, "u8")?;
        let v = self.bytes[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        self.need(2, "u16")?;
        let v = u16::from_le_bytes([self.bytes[self.pos], self.bytes[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        self.need(4, "u32")?;
        let v = u32::from_le_bytes([
            self.bytes[self.pos],
            self.bytes[self.pos + 1],
            self.bytes[self.pos + 2],
            self.bytes[self.pos + 3],
        ]);
        self.pos += 4;
        Ok(v)
    }

    pub fn read_i32(&mut self) -> Result<i32, DecodeError> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_f64(&mut self) -> Result<f64, DecodeError> {
        self.need(8, "f64")?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.bytes[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(f64::from_le_bytes(buf))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        self.need(n, "bytes")?;
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Reads a null-terminated string and advances past the terminator.
    pub fn read_cstring(&mut self) -> Result<String, DecodeError> {
        let start = self.pos;
        let mut end = start;
        while end < self.bytes.len() && self.bytes[end] != 0 {
            end += 1;
        }
        if end >= self.bytes.len() {
            return Err(DecodeError::Truncated("cstring"));
        }
        let s = String::from_utf8_lossy(&self.bytes[start..end]).into_owned();
        self.pos = end + 1;
        Ok(s)
    }
}
