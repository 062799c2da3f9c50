// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Unsigned LEB128 varints plus a zigzag-mapped signed flavor. Every
//! multi-byte integer in the capture stream uses one of these two
//! encodings; fixed-width fields appear only in the rewritable header.

use std::io::{self, Write};

/// The number of bytes needed to encode `value` as an unsigned varint.
#[inline]
pub fn encoded_len(value: u64) -> usize {
    // https://github.com/google/protobuf/blob/3.3.x/src/google/protobuf/io/coded_stream.h#L1301-L1309
    ((((value | 1).leading_zeros() ^ 63) * 9 + 73) / 64) as usize
}

/// Encodes `value` as an unsigned LEB128 varint.
///
/// Serialization happens one byte at a time; use a buffered writer.
#[inline]
pub fn write_varint<W: Write>(writer: &mut W, value: u64) -> io::Result<()> {
    let mut value = value;
    loop {
        let byte = if value < 0x80 {
            value as u8
        } else {
            ((value & 0x7F) | 0x80) as u8
        };
        writer.write_all(&[byte])?;
        if value < 0x80 {
            return Ok(());
        }
        value >>= 7;
    }
}

/// Encodes `value` as a zigzag-mapped LEB128 varint, keeping small
/// magnitudes of either sign short on the wire.
#[inline]
pub fn write_svarint<W: Write>(writer: &mut W, value: i64) -> io::Result<()> {
    write_varint(writer, zigzag(value))
}

#[inline]
pub fn zigzag(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

#[inline]
pub fn unzigzag(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

/// Appends `value` to `buf` as an unsigned LEB128 varint.
#[inline]
pub fn put_varint(buf: &mut Vec<u8>, value: u64) {
    // Writing to a Vec cannot fail.
    let _ = write_varint(buf, value);
}

/// Appends `value` to `buf` as a zigzag-mapped LEB128 varint.
#[inline]
pub fn put_svarint(buf: &mut Vec<u8>, value: i64) {
    let _ = write_svarint(buf, value);
}

/// Decodes an unsigned varint from the front of `buf`, returning the value
/// and the number of bytes consumed. `None` when `buf` ends mid-varint or
/// the encoding exceeds ten bytes.
pub fn decode_from_slice(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, byte) in buf.iter().enumerate() {
        if i >= 10 {
            return None;
        }
        value |= u64::from(byte & 0x7F) << (7 * i as u32);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}
