//! Modified UTF-8: UTF-16 code units encoded in one to three bytes each.
//!
//! `U+0000` takes two bytes and supplementary characters are written as
//! surrogate pairs, so no encoded byte is ever `0x00` or above `0xEF`.

use crate::error::{Result, StorageError};

/// Number of bytes `value` occupies once encoded.
pub fn encoded_len(value: &str) -> usize {
    value.encode_utf16().map(unit_len).sum()
}

fn unit_len(unit: u16) -> usize {
    match unit {
        0x0001..=0x007F => 1,
        0x0000 | 0x0080..=0x07FF => 2,
        _ => 3,
    }
}

/// Encodes `value` as modified UTF-8.
pub fn encode(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded_len(value));
    encode_into(value, &mut out);
    out
}

/// Like [`encode`], appending to `out`.
pub fn encode_into(value: &str, out: &mut Vec<u8>) {
    for unit in value.encode_utf16() {
        match unit {
            0x0001..=0x007F => out.push(unit as u8),
            0x0000 | 0x0080..=0x07FF => {
                out.push(0xC0 | ((unit >> 6) & 0x1F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
            _ => {
                out.push(0xE0 | ((unit >> 12) & 0x0F) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
        }
    }
}

/// Decodes an entire buffer.
pub fn decode(bytes: &[u8]) -> Result<String> {
    let mut units = Vec::with_capacity(bytes.len());
    let mut pos = 0;
    while pos < bytes.len() {
        let (unit, len) = decode_unit(bytes, pos)?;
        units.push(unit);
        pos += len;
    }
    units_to_string(&units)
}

/// Decodes exactly `count` UTF-16 units, returning the text and bytes consumed.
pub fn decode_units(bytes: &[u8], count: usize) -> Result<(String, usize)> {
    let mut units = Vec::with_capacity(count);
    let mut pos = 0;
    while units.len() < count {
        let (unit, len) = decode_unit(bytes, pos)?;
        units.push(unit);
        pos += len;
    }
    Ok((units_to_string(&units)?, pos))
}

fn decode_unit(bytes: &[u8], pos: usize) -> Result<(u16, usize)> {
    let lead = *bytes
        .get(pos)
        .ok_or_else(|| StorageError::corruption("modified UTF-8 string truncated"))?;
    let cont = |offset: usize| -> Result<u16> {
        let byte = *bytes
            .get(pos + offset)
            .ok_or_else(|| StorageError::corruption("modified UTF-8 sequence truncated"))?;
        if byte & 0xC0 != 0x80 {
            return Err(StorageError::corruption(format!(
                "bad continuation byte {byte:#04x} at offset {}",
                pos + offset
            )));
        }
        Ok(u16::from(byte & 0x3F))
    };
    match lead {
        0x01..=0x7F => Ok((u16::from(lead), 1)),
        0xC0..=0xDF => Ok(((u16::from(lead & 0x1F) << 6) | cont(1)?, 2)),
        0xE0..=0xEF => Ok((
            (u16::from(lead & 0x0F) << 12) | (cont(1)? << 6) | cont(2)?,
            3,
        )),
        other => Err(StorageError::corruption(format!(
            "invalid modified UTF-8 lead byte {other:#04x} at offset {pos}"
        ))),
    }
}

fn units_to_string(units: &[u16]) -> Result<String> {
    String::from_utf16(units)
        .map_err(|_| StorageError::corruption("unpaired surrogate in stored string"))
}
