#![forbid(unsafe_code)]
//! Big-endian cursors and the modified UTF-8 string encoding shared by every
//! on-disk structure.

use std::convert::TryInto;

use crate::error::{Result, StorageError};

pub mod mutf8;

/// Sequential reader over a byte slice.
#[derive(Debug, Clone)]
pub struct DataReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> DataReader<'a> {
    /// Reader over `buf`, starting at offset 0.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Offset of the next byte to read.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Moves the cursor. Positions past the end are corruption.
    pub fn set_pos(&mut self, pos: usize) -> Result<()> {
        if pos > self.buf.len() {
            return Err(StorageError::corruption(format!(
                "seek to {pos} past end of {}-byte buffer",
                self.buf.len()
            )));
        }
        self.pos = pos;
        Ok(())
    }

    /// Bytes left after the cursor.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                StorageError::corruption(format!(
                    "read of {len} bytes at offset {} overruns {}-byte buffer",
                    self.pos,
                    self.buf.len()
                ))
            })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Reads one byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Reads an unsigned 16-bit value (the on-disk "short int").
    pub fn read_u16(&mut self) -> Result<u16> {
        let bytes: [u8; 2] = self
            .take(2)?
            .try_into()
            .map_err(|_| StorageError::corruption("short read"))?;
        Ok(u16::from_be_bytes(bytes))
    }

    /// Big-endian.
    pub fn read_i32(&mut self) -> Result<i32> {
        let bytes: [u8; 4] = self
            .take(4)?
            .try_into()
            .map_err(|_| StorageError::corruption("int read"))?;
        Ok(i32::from_be_bytes(bytes))
    }

    /// Big-endian.
    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(self.read_i32()? as u32)
    }

    /// Big-endian.
    pub fn read_i64(&mut self) -> Result<i64> {
        let bytes: [u8; 8] = self
            .take(8)?
            .try_into()
            .map_err(|_| StorageError::corruption("long read"))?;
        Ok(i64::from_be_bytes(bytes))
    }

    /// Borrows the next `len` bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        self.take(len)
    }

    /// Reads a string written by [`DataWriter::write_string`].
    pub fn read_string(&mut self) -> Result<String> {
        let units = self.read_i32()?;
        if units < 0 {
            return Err(StorageError::corruption(format!(
                "negative string length {units}"
            )));
        }
        let (text, consumed) = mutf8::decode_units(&self.buf[self.pos..], units as usize)?;
        self.pos += consumed;
        Ok(text)
    }
}

/// Growable big-endian writer.
#[derive(Debug, Default, Clone)]
pub struct DataWriter {
    buf: Vec<u8>,
}

impl DataWriter {
    /// Empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty writer with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing was written yet.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Appends one byte.
    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    /// Big-endian.
    pub fn write_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Writes a length or offset that must fit the 16-bit on-disk field.
    pub fn write_short(&mut self, value: usize) -> Result<()> {
        let short = u16::try_from(value).map_err(|_| {
            StorageError::CapacityExceeded(format!("{value} does not fit a 16-bit field"))
        })?;
        self.write_u16(short);
        Ok(())
    }

    /// Big-endian.
    pub fn write_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Big-endian.
    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Big-endian.
    pub fn write_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Appends raw bytes without a length prefix.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Writes the UTF-16 unit count as an int followed by the modified UTF-8 bytes.
    pub fn write_string(&mut self, value: &str) -> Result<()> {
        let units = value.encode_utf16().count();
        let units = i32::try_from(units)
            .map_err(|_| StorageError::CapacityExceeded("string longer than i32::MAX".into()))?;
        self.write_i32(units);
        mutf8::encode_into(value, &mut self.buf);
        Ok(())
    }

    /// Bytes written so far, borrowed.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Consumes the writer, returning its buffer.
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Reads a big-endian u16 at `offset` in a page buffer.
pub fn get_u16(buf: &[u8], offset: usize) -> Result<u16> {
    let slice = buf
        .get(offset..offset + 2)
        .ok_or_else(|| StorageError::corruption(format!("u16 at offset {offset} out of bounds")))?;
    Ok(u16::from_be_bytes([slice[0], slice[1]]))
}

/// Reads a big-endian u32 at `offset` in a page buffer.
pub fn get_u32(buf: &[u8], offset: usize) -> Result<u32> {
    let slice = buf
        .get(offset..offset + 4)
        .ok_or_else(|| StorageError::corruption(format!("u32 at offset {offset} out of bounds")))?;
    Ok(u32::from_be_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

/// Writes a big-endian u32 at `offset` in a page buffer.
pub fn put_u32(buf: &mut [u8], offset: usize, value: u32) -> Result<()> {
    let slice = buf
        .get_mut(offset..offset + 4)
        .ok_or_else(|| StorageError::corruption(format!("u32 at offset {offset} out of bounds")))?;
    slice.copy_from_slice(&value.to_be_bytes());
    Ok(())
}
