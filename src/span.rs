//! Byte cursors for reading and emitting container structures in memory.

use crate::error::{ContainerError, ContainerResult};

/// Simple cursor for reading container structures from an in-memory buffer.
pub struct SpanReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> SpanReader<'a> {
    /// Creates a new reader positioned at the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        SpanReader { data, offset: 0 }
    }

    /// Returns the current position within the underlying slice.
    pub fn position(&self) -> usize {
        self.offset
    }

    /// Returns the number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.offset)
    }

    /// Repositions the cursor to an absolute offset measured from the start of the slice.
    pub fn seek(&mut self, offset: usize) -> ContainerResult<()> {
        if offset > self.data.len() {
            return Err(ContainerError::UnexpectedEof {
                offset: self.data.len(),
                expected: offset.saturating_sub(self.data.len()),
            });
        }
        self.offset = offset;
        Ok(())
    }

    /// Reads `len` bytes and returns a borrowed slice.
    pub fn read_bytes(&mut self, len: usize) -> ContainerResult<&'a [u8]> {
        self.ensure(len)?;
        let start = self.offset;
        let end = self.offset + len;
        self.offset = end;
        Ok(&self.data[start..end])
    }

    /// Reads a fixed-size array from the stream.
    pub fn read_array<const N: usize>(&mut self) -> ContainerResult<[u8; N]> {
        let bytes = self.read_bytes(N)?;
        let mut array = [0u8; N];
        array.copy_from_slice(bytes);
        Ok(array)
    }

    /// Reads a single byte.
    pub fn read_u8(&mut self) -> ContainerResult<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    /// Reads a little-endian `u16`.
    pub fn read_u16(&mut self) -> ContainerResult<u16> {
        Ok(u16::from_le_bytes(self.read_array::<2>()?))
    }

    /// Reads a little-endian `u32`.
    pub fn read_u32(&mut self) -> ContainerResult<u32> {
        Ok(u32::from_le_bytes(self.read_array::<4>()?))
    }

    /// Reads a little-endian `u64`.
    pub fn read_u64(&mut self) -> ContainerResult<u64> {
        Ok(u64::from_le_bytes(self.read_array::<8>()?))
    }

    /// Reads an unsigned LEB128 value from the stream.
    pub fn read_uleb128(&mut self) -> ContainerResult<u32> {
        let mut result: u32 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            result |= ((byte & 0x7f) as u32) << shift;
            if (byte & 0x80) == 0 {
                break;
            }
            shift += 7;
            if shift > 28 {
                return Err(ContainerError::format("uleb128 integer overflow"));
            }
        }
        Ok(result)
    }

    /// Reads a signed LEB128 value from the stream.
    pub fn read_sleb128(&mut self) -> ContainerResult<i64> {
        let mut result: i64 = 0;
        let mut shift = 0u32;
        let mut byte: u8;
        loop {
            byte = self.read_u8()?;
            result |= ((byte & 0x7f) as i64) << shift;
            shift += 7;
            if (byte & 0x80) == 0 {
                break;
            }
            if shift >= 64 {
                return Err(ContainerError::format("sleb128 integer overflow"));
            }
        }

        if (shift < 64) && (byte & 0x40) != 0 {
            result |= !0i64 << shift;
        }

        Ok(result)
    }

    /// Reads bytes until the terminating NUL, consuming it.
    pub fn read_cstring_bytes(&mut self) -> ContainerResult<Vec<u8>> {
        let mut buffer = Vec::new();
        while self.remaining() > 0 {
            let byte = self.read_u8()?;
            if byte == 0 {
                break;
            }
            buffer.push(byte);
        }
        Ok(buffer)
    }

    fn ensure(&self, len: usize) -> ContainerResult<()> {
        if self
            .offset
            .checked_add(len)
            .is_some_and(|end| end <= self.data.len())
        {
            Ok(())
        } else {
            Err(ContainerError::UnexpectedEof {
                offset: self.offset,
                expected: len,
            })
        }
    }
}

/// Convenience builder for emitting container structures to memory.
#[derive(Default)]
pub struct SpanWriter {
    buffer: Vec<u8>,
}

impl SpanWriter {
    pub fn new() -> Self {
        SpanWriter { buffer: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        SpanWriter {
            buffer: Vec::with_capacity(capacity),
        }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buffer
    }

    pub fn position(&self) -> usize {
        self.buffer.len()
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Writes an unsigned LEB128 value.
    pub fn write_uleb128(&mut self, mut value: u32) {
        loop {
            let mut byte = (value & 0x7f) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            self.buffer.push(byte);
            if value == 0 {
                break;
            }
        }
    }

    /// Writes a signed LEB128 value.
    pub fn write_sleb128(&mut self, mut value: i64) {
        loop {
            let mut byte = (value & 0x7f) as u8;
            value >>= 7;
            let sign = (byte & 0x40) != 0;
            if (value == 0 && !sign) || (value == -1 && sign) {
                self.buffer.push(byte);
                break;
            }
            byte |= 0x80;
            self.buffer.push(byte);
        }
    }

    /// Emits zero bytes until the cursor reaches `offset`.
    ///
    /// Padding backwards is an internal-consistency failure: offsets are
    /// assigned by a monotone layout pass before serialization begins.
    pub fn pad_to(&mut self, offset: usize) {
        assert!(
            offset >= self.buffer.len(),
            "layout assigned offset 0x{:x} behind write cursor 0x{:x}",
            offset,
            self.buffer.len()
        );
        self.buffer.resize(offset, 0);
    }

    /// Rewrites a previously written little-endian `u32` in place.
    pub fn patch_u32(&mut self, offset: usize, value: u32) {
        self.buffer[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}

/// Number of bytes an unsigned LEB128 encoding of `value` occupies.
pub fn uleb128_size(value: u32) -> u32 {
    let mut size = 1;
    let mut rest = value >> 7;
    while rest != 0 {
        size += 1;
        rest >>= 7;
    }
    size
}

/// Decodes a MUTF-8 byte sequence into a Rust string.
pub fn decode_mutf8(input: &[u8]) -> ContainerResult<String> {
    let mut units: Vec<u16> = Vec::with_capacity(input.len());
    let mut index = 0;
    while index < input.len() {
        let byte = input[index];
        index += 1;

        match byte {
            0x00 => {
                return Err(ContainerError::format("embedded NUL inside MUTF-8 string"));
            }
            0x01..=0x7f => {
                units.push(byte as u16);
            }
            0xc0..=0xdf => {
                if index >= input.len() {
                    return Err(ContainerError::format("truncated MUTF-8 sequence"));
                }
                let b2 = input[index];
                index += 1;
                if byte == 0xc0 && b2 == 0x80 {
                    units.push(0);
                } else {
                    let value = (((byte & 0x1f) as u16) << 6) | ((b2 & 0x3f) as u16);
                    units.push(value);
                }
            }
            0xe0..=0xef => {
                if index + 1 >= input.len() {
                    return Err(ContainerError::format("truncated three-byte MUTF-8 sequence"));
                }
                let b2 = input[index];
                let b3 = input[index + 1];
                index += 2;
                let value = (((byte & 0x0f) as u16) << 12)
                    | (((b2 & 0x3f) as u16) << 6)
                    | ((b3 & 0x3f) as u16);
                units.push(value);
            }
            _ => {
                return Err(ContainerError::format("unsupported MUTF-8 leading byte"));
            }
        }
    }

    String::from_utf16(&units).map_err(|_| ContainerError::format("invalid UTF-16 sequence"))
}

/// Encodes a Rust string as MUTF-8 and reports its UTF-16 code unit count.
pub fn encode_mutf8(value: &str) -> (Vec<u8>, u32, bool) {
    let mut bytes = Vec::with_capacity(value.len());
    let mut utf16_len = 0u32;
    let mut is_ascii = true;
    for unit in value.encode_utf16() {
        utf16_len += 1;
        match unit {
            0x0000 => {
                bytes.extend_from_slice(&[0xc0, 0x80]);
                is_ascii = false;
            }
            0x0001..=0x007f => {
                bytes.push(unit as u8);
            }
            0x0080..=0x07ff => {
                bytes.push(0xc0 | ((unit >> 6) as u8));
                bytes.push(0x80 | ((unit & 0x3f) as u8));
                is_ascii = false;
            }
            _ => {
                bytes.push(0xe0 | ((unit >> 12) as u8));
                bytes.push(0x80 | (((unit >> 6) & 0x3f) as u8));
                bytes.push(0x80 | ((unit & 0x3f) as u8));
                is_ascii = false;
            }
        }
    }
    (bytes, utf16_len, is_ascii)
}

#[cfg(test)]
mod tests {
    use super::{SpanReader, SpanWriter, decode_mutf8, encode_mutf8, uleb128_size};

    #[test]
    fn leb128_round_trips() {
        let mut writer = SpanWriter::new();
        for value in [0u32, 1, 127, 128, 300, 0x3fff, 0x4000, u32::MAX >> 4] {
            writer.write_uleb128(value);
        }
        writer.write_sleb128(-1);
        writer.write_sleb128(-300);
        writer.write_sleb128(64);

        let bytes = writer.into_inner();
        let mut reader = SpanReader::new(&bytes);
        for value in [0u32, 1, 127, 128, 300, 0x3fff, 0x4000, u32::MAX >> 4] {
            assert_eq!(reader.read_uleb128().unwrap(), value);
        }
        assert_eq!(reader.read_sleb128().unwrap(), -1);
        assert_eq!(reader.read_sleb128().unwrap(), -300);
        assert_eq!(reader.read_sleb128().unwrap(), 64);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn uleb128_size_matches_encoding() {
        for value in [0u32, 1, 127, 128, 16383, 16384, u32::MAX] {
            let mut writer = SpanWriter::new();
            writer.write_uleb128(value);
            assert_eq!(uleb128_size(value) as usize, writer.position());
        }
    }

    #[test]
    fn mutf8_round_trips_embedded_nul_and_bmp() {
        for value in ["", "hello", "s\u{0}s", "caf\u{e9}", "\u{4e16}\u{754c}"] {
            let (bytes, _, _) = encode_mutf8(value);
            assert_eq!(decode_mutf8(&bytes).unwrap(), value);
        }
    }

    #[test]
    fn ascii_flag_reflects_content() {
        assert!(encode_mutf8("plain").2);
        assert!(!encode_mutf8("caf\u{e9}").2);
    }

    #[test]
    fn patch_u32_rewrites_in_place() {
        let mut writer = SpanWriter::new();
        writer.write_u32(0);
        writer.write_u32(7);
        writer.patch_u32(0, 0xdead_beef);
        let bytes = writer.into_inner();
        assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), 0xdead_beef);
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 7);
    }
}
