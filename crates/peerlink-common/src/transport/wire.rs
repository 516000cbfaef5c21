//! Big-endian primitive encoding used inside blocks.

use crate::protocol::error::{PeerlinkError, Result};

/// Growable buffer that one command is encoded into before it is sealed as a block.
#[derive(Debug, Default, Clone)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_i8(&mut self, v: i8) {
        self.buf.push(v as u8);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i16(&mut self, v: i16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_bits().to_be_bytes());
    }

    pub fn write_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_bits().to_be_bytes());
    }

    pub fn write_char(&mut self, v: char) {
        self.write_u32(v as u32);
    }

    /// Writes a u32 length followed by the UTF-8 bytes.
    pub fn write_str(&mut self, v: &str) {
        self.write_bytes(v.as_bytes());
    }

    /// Writes a u32 length followed by the bytes.
    pub fn write_bytes(&mut self, v: &[u8]) {
        self.write_u32(v.len() as u32);
        self.buf.extend_from_slice(v);
    }

    /// Writes the bytes without a length prefix.
    pub fn write_raw(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }
}

/// Cursor over the payload of one received block.
///
/// Running past the end is a protocol error: a well-formed command always
/// fits exactly into its block.
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_exhausted(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(PeerlinkError::Protocol(format!(
                "Unexpected end of block: needed {} bytes at offset {}, {} available",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.take(1)?[0] as i8)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(PeerlinkError::Protocol(format!("Invalid boolean: {}", other))),
        }
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take_array()?))
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(i16::from_be_bytes(self.take_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.take_array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(u32::from_be_bytes(self.take_array()?)))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(u64::from_be_bytes(self.take_array()?)))
    }

    pub fn read_char(&mut self) -> Result<char> {
        let code = self.read_u32()?;
        char::from_u32(code)
            .ok_or_else(|| PeerlinkError::Protocol(format!("Invalid char code point: {:#x}", code)))
    }

    pub fn read_str(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| PeerlinkError::Protocol(format!("Invalid UTF-8 string: {}", e)))
    }

    pub fn read_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }

    /// Reads a u32 element count and checks that at least `min_element_size`
    /// bytes per element are still available.
    pub fn read_len(&mut self, min_element_size: usize) -> Result<usize> {
        let len = self.read_u32()? as usize;
        if len.saturating_mul(min_element_size) > self.remaining() {
            return Err(PeerlinkError::Protocol(format!(
                "Invalid element count: {} with {} bytes remaining",
                len,
                self.remaining()
            )));
        }
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitives_are_big_endian() {
        let mut w = WireWriter::new();
        w.write_u16(0x7e86);
        w.write_i32(-2);
        assert_eq!(w.as_slice(), &[0x7e, 0x86, 0xff, 0xff, 0xff, 0xfe]);
    }

    #[test]
    fn test_reader_follows_writer() {
        let mut w = WireWriter::new();
        w.write_bool(true);
        w.write_i64(i64::MIN);
        w.write_f64(1.5);
        w.write_char('é');
        w.write_str("peer");
        let bytes = w.into_inner();

        let mut r = WireReader::new(&bytes);
        assert!(r.read_bool().unwrap());
        assert_eq!(r.read_i64().unwrap(), i64::MIN);
        assert_eq!(r.read_f64().unwrap(), 1.5);
        assert_eq!(r.read_char().unwrap(), 'é');
        assert_eq!(r.read_str().unwrap(), "peer");
        assert!(r.is_exhausted());
    }

    #[test]
    fn test_short_read_is_protocol_error() {
        let mut r = WireReader::new(&[0, 1]);
        assert!(matches!(r.read_u32(), Err(PeerlinkError::Protocol(_))));
    }

    #[test]
    fn test_element_count_checked_against_remaining() {
        let mut w = WireWriter::new();
        w.write_u32(1_000_000);
        w.write_u32(1);
        let bytes = w.into_inner();
        let mut r = WireReader::new(&bytes);
        assert!(r.read_len(4).is_err());
    }
}
