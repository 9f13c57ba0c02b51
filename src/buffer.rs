use byteorder::{ByteOrder, LittleEndian};

use crate::error::Result;
use crate::hasher;

/// A contiguous mutable byte region with a cursor, read and written in
/// little-endian. The store's whole data image lives in one of these; the
/// durability backends copy dirty ranges out of it.
#[derive(Debug)]
pub struct Buffer {
    pub hb: Vec<u8>,
    pub position: usize,
}

impl Buffer {
    /// Creates a zero-filled buffer of the given capacity.
    pub fn new(capacity: usize) -> Self {
        Buffer {
            hb: vec![0; capacity],
            position: 0,
        }
    }

    /// Wraps an existing image, e.g. one read back from disk.
    pub fn from_vec(hb: Vec<u8>) -> Self {
        Buffer { hb, position: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.hb.len()
    }

    pub fn get_u8(&mut self) -> u8 {
        let v = self.hb[self.position];
        self.position += 1;
        v
    }

    pub fn put_u8(&mut self, v: u8) {
        self.hb[self.position] = v;
        self.position += 1;
    }

    pub fn get_u16(&mut self) -> u16 {
        let v = LittleEndian::read_u16(&self.hb[self.position..]);
        self.position += 2;
        v
    }

    pub fn put_u16(&mut self, v: u16) {
        LittleEndian::write_u16(&mut self.hb[self.position..], v);
        self.position += 2;
    }

    pub fn get_i32(&mut self) -> i32 {
        let v = LittleEndian::read_i32(&self.hb[self.position..]);
        self.position += 4;
        v
    }

    pub fn put_i32(&mut self, v: i32) {
        LittleEndian::write_i32(&mut self.hb[self.position..], v);
        self.position += 4;
    }

    pub fn get_i64(&mut self) -> i64 {
        let v = LittleEndian::read_i64(&self.hb[self.position..]);
        self.position += 8;
        v
    }

    pub fn put_i64(&mut self, v: i64) {
        LittleEndian::write_i64(&mut self.hb[self.position..], v);
        self.position += 8;
    }

    pub fn get_bytes(&mut self, len: usize) -> Vec<u8> {
        let v = self.hb[self.position..self.position + len].to_vec();
        self.position += len;
        v
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.hb[self.position..self.position + bytes.len()].copy_from_slice(bytes);
        self.position += bytes.len();
    }

    /// Reads `len` bytes at the cursor as UTF-8.
    pub fn get_str(&mut self, len: usize) -> Result<String> {
        Ok(String::from_utf8(self.get_bytes(len))?)
    }

    // Absolute-offset accessors, used for header updates and in-place value
    // rewrites that must not disturb the cursor.

    pub fn get_u32_at(&self, offset: usize) -> u32 {
        LittleEndian::read_u32(&self.hb[offset..])
    }

    pub fn put_u32_at(&mut self, offset: usize, v: u32) {
        LittleEndian::write_u32(&mut self.hb[offset..], v);
    }

    pub fn get_u64_at(&self, offset: usize) -> u64 {
        LittleEndian::read_u64(&self.hb[offset..])
    }

    pub fn put_u64_at(&mut self, offset: usize, v: u64) {
        LittleEndian::write_u64(&mut self.hb[offset..], v);
    }

    pub fn get_i32_at(&self, offset: usize) -> i32 {
        LittleEndian::read_i32(&self.hb[offset..])
    }

    pub fn put_i32_at(&mut self, offset: usize, v: i32) {
        LittleEndian::write_i32(&mut self.hb[offset..], v);
    }

    pub fn get_i64_at(&self, offset: usize) -> i64 {
        LittleEndian::read_i64(&self.hb[offset..])
    }

    pub fn put_i64_at(&mut self, offset: usize, v: i64) {
        LittleEndian::write_i64(&mut self.hb[offset..], v);
    }

    /// Checksum of `len` bytes starting at `start`, in absolute lanes.
    pub fn checksum(&self, start: usize, len: usize) -> u64 {
        hasher::checksum(&self.hb, start, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_round_trip() {
        let mut buffer = Buffer::new(64);
        buffer.put_u8(0xAB);
        buffer.put_u16(0xBEEF);
        buffer.put_i32(-7);
        buffer.put_i64(i64::MIN + 1);
        buffer.put_bytes(b"abc");

        buffer.position = 0;
        assert_eq!(buffer.get_u8(), 0xAB);
        assert_eq!(buffer.get_u16(), 0xBEEF);
        assert_eq!(buffer.get_i32(), -7);
        assert_eq!(buffer.get_i64(), i64::MIN + 1);
        assert_eq!(buffer.get_bytes(3), b"abc");
    }

    #[test]
    fn test_little_endian_layout() {
        let mut buffer = Buffer::new(8);
        buffer.put_i32(0x0A0B0C0D);
        assert_eq!(&buffer.hb[..4], &[0x0D, 0x0C, 0x0B, 0x0A]);
    }

    #[test]
    fn test_absolute_accessors_leave_cursor() {
        let mut buffer = Buffer::new(32);
        buffer.position = 5;
        buffer.put_u32_at(0, 42);
        buffer.put_u64_at(4, u64::MAX - 1);
        assert_eq!(buffer.position, 5);
        assert_eq!(buffer.get_u32_at(0), 42);
        assert_eq!(buffer.get_u64_at(4), u64::MAX - 1);
    }

    #[test]
    fn test_utf8_strings() {
        let mut buffer = Buffer::new(32);
        let s = "héllo";
        buffer.put_bytes(s.as_bytes());
        buffer.position = 0;
        assert_eq!(buffer.get_str(s.len()).unwrap(), s);
    }
}
