//! Fixed-capacity byte region with `position <= limit <= capacity` cursors
//! and a runtime-selectable byte order. The framing codec reads and writes
//! through these buffers exclusively; the order may change between messages
//! on the same buffer when the peer says so.

use crate::net::shared::{NetError, NetResult};
use byteorder::{BigEndian, ByteOrder as _, LittleEndian};
use std::io;

/// Byte filled into alignment padding on encode.
pub const PADDING_BYTE: u8 = 0xFF;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ByteOrder {
    Big,
    Little,
}

impl ByteOrder {
    /// The byte order this host uses natively.
    #[inline]
    pub fn native() -> ByteOrder {
        if cfg!(target_endian = "big") {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }
}

macro_rules! scalar_accessors {
    ($get:ident, $put:ident, $ty:ty, $size:expr, $read:ident, $write:ident) => {
        #[inline]
        pub fn $get(&mut self) -> $ty {
            debug_assert!(self.remaining() >= $size, "buffer underrun");
            let value = match self.order {
                ByteOrder::Big => BigEndian::$read(&self.data[self.position..]),
                ByteOrder::Little => LittleEndian::$read(&self.data[self.position..]),
            };
            self.position += $size;
            value
        }

        #[inline]
        pub fn $put(&mut self, value: $ty) {
            debug_assert!(self.remaining() >= $size, "buffer overrun");
            match self.order {
                ByteOrder::Big => BigEndian::$write(&mut self.data[self.position..], value),
                ByteOrder::Little => LittleEndian::$write(&mut self.data[self.position..], value),
            }
            self.position += $size;
        }
    };
}

pub struct ByteBuffer {
    data: Vec<u8>,
    position: usize,
    limit: usize,
    order: ByteOrder,
}

impl ByteBuffer {
    pub fn new(capacity: usize, order: ByteOrder) -> ByteBuffer {
        ByteBuffer {
            data: vec![0; capacity],
            position: 0,
            limit: capacity,
            order,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }

    #[inline]
    pub fn set_position(&mut self, position: usize) {
        debug_assert!(position <= self.limit, "position beyond limit");
        self.position = position;
    }

    #[inline]
    pub fn limit(&self) -> usize {
        self.limit
    }

    #[inline]
    pub fn set_limit(&mut self, limit: usize) {
        debug_assert!(limit <= self.capacity(), "limit beyond capacity");
        self.limit = limit;
        if self.position > limit {
            self.position = limit;
        }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    #[inline]
    pub fn order(&self) -> ByteOrder {
        self.order
    }

    #[inline]
    pub fn set_order(&mut self, order: ByteOrder) {
        self.order = order;
    }

    /// `position = 0, limit = capacity`.
    #[inline]
    pub fn clear(&mut self) {
        self.position = 0;
        self.limit = self.capacity();
    }

    /// `limit = position, position = 0`: switch from filling to draining.
    #[inline]
    pub fn flip(&mut self) {
        self.limit = self.position;
        self.position = 0;
    }

    /// Fails with an overflow error when fewer than `count` bytes remain.
    #[inline]
    pub fn ensure_capacity(&self, count: usize) -> NetResult<()> {
        if self.remaining() < count {
            return Err(NetError::Overflow);
        }
        Ok(())
    }

    #[inline]
    pub fn get_u8(&mut self) -> u8 {
        debug_assert!(self.remaining() >= 1, "buffer underrun");
        let value = self.data[self.position];
        self.position += 1;
        value
    }

    #[inline]
    pub fn put_u8(&mut self, value: u8) {
        debug_assert!(self.remaining() >= 1, "buffer overrun");
        self.data[self.position] = value;
        self.position += 1;
    }

    #[inline]
    pub fn get_i8(&mut self) -> i8 {
        self.get_u8() as i8
    }

    #[inline]
    pub fn put_i8(&mut self, value: i8) {
        self.put_u8(value as u8);
    }

    scalar_accessors!(get_u16, put_u16, u16, 2, read_u16, write_u16);
    scalar_accessors!(get_i16, put_i16, i16, 2, read_i16, write_i16);
    scalar_accessors!(get_u32, put_u32, u32, 4, read_u32, write_u32);
    scalar_accessors!(get_i32, put_i32, i32, 4, read_i32, write_i32);
    scalar_accessors!(get_u64, put_u64, u64, 8, read_u64, write_u64);
    scalar_accessors!(get_i64, put_i64, i64, 8, read_i64, write_i64);
    scalar_accessors!(get_f32, put_f32, f32, 4, read_f32, write_f32);
    scalar_accessors!(get_f64, put_f64, f64, 8, read_f64, write_f64);

    /// Absolute single-byte access, cursors untouched.
    #[inline]
    pub fn get_u8_at(&self, index: usize) -> u8 {
        self.data[index]
    }

    #[inline]
    pub fn put_u8_at(&mut self, index: usize, value: u8) {
        self.data[index] = value;
    }

    /// Absolute u32 write in the buffer's current order; used to back-patch
    /// payload sizes into already-written headers.
    #[inline]
    pub fn put_u32_at(&mut self, index: usize, value: u32) {
        match self.order {
            ByteOrder::Big => BigEndian::write_u32(&mut self.data[index..index + 4], value),
            ByteOrder::Little => LittleEndian::write_u32(&mut self.data[index..index + 4], value),
        }
    }

    #[inline]
    pub fn put_slice(&mut self, src: &[u8]) {
        debug_assert!(self.remaining() >= src.len(), "buffer overrun");
        self.data[self.position..self.position + src.len()].copy_from_slice(src);
        self.position += src.len();
    }

    #[inline]
    pub fn get_slice(&mut self, dst: &mut [u8]) {
        debug_assert!(self.remaining() >= dst.len(), "buffer underrun");
        dst.copy_from_slice(&self.data[self.position..self.position + dst.len()]);
        self.position += dst.len();
    }

    /// Advances position to the next multiple of `alignment`, writing
    /// padding bytes.
    pub fn align_put(&mut self, alignment: usize) {
        let mask = alignment - 1;
        let target = (self.position + mask) & !mask;
        while self.position < target {
            self.put_u8(PADDING_BYTE);
        }
    }

    /// Advances position to the next multiple of `alignment`, skipping
    /// padding.
    pub fn align_get(&mut self, alignment: usize) {
        let mask = alignment - 1;
        let target = (self.position + mask) & !mask;
        debug_assert!(target <= self.limit, "alignment skip beyond limit");
        self.position = target;
    }

    /// One `read` into the `position..limit` window, advancing position.
    pub fn read_from<R: io::Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        let window = &mut self.data[self.position..self.limit];
        let count = reader.read(window)?;
        self.position += count;
        Ok(count)
    }

    /// One `write` from the `position..limit` window, advancing position.
    pub fn write_to<W: io::Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        let window = &self.data[self.position..self.limit];
        let count = writer.write(window)?;
        self.position += count;
        Ok(count)
    }

    /// The readable window as a slice, cursors untouched.
    #[inline]
    pub fn window(&self) -> &[u8] {
        &self.data[self.position..self.limit]
    }

    /// Moves the readable window so it starts at `index`. Overlapping
    /// regions are handled; cursors are left for the caller to fix up.
    #[inline]
    pub fn move_window(&mut self, index: usize) {
        let (position, limit) = (self.position, self.limit);
        self.data.copy_within(position..limit, index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_discipline() {
        let mut buf = ByteBuffer::new(16, ByteOrder::Big);
        assert_eq!(buf.remaining(), 16);

        buf.put_u32(0xDEAD_BEEF);
        assert_eq!(buf.position(), 4);

        buf.flip();
        assert_eq!(buf.position(), 0);
        assert_eq!(buf.limit(), 4);
        assert_eq!(buf.get_u32(), 0xDEAD_BEEF);

        buf.clear();
        assert_eq!(buf.position(), 0);
        assert_eq!(buf.limit(), 16);
    }

    #[test]
    fn test_order_switch_mid_buffer() {
        let mut buf = ByteBuffer::new(16, ByteOrder::Big);
        buf.put_u32(0x0102_0304);
        buf.set_order(ByteOrder::Little);
        buf.put_u32(0x0102_0304);

        buf.flip();
        buf.set_order(ByteOrder::Big);
        assert_eq!(buf.get_u32(), 0x0102_0304);
        assert_eq!(buf.get_u32(), 0x0403_0201);
    }

    #[test]
    fn test_ensure_capacity() {
        let mut buf = ByteBuffer::new(4, ByteOrder::Little);
        assert!(buf.ensure_capacity(4).is_ok());
        buf.put_u16(1);
        assert_eq!(buf.ensure_capacity(3), Err(NetError::Overflow));
    }

    #[test]
    fn test_align() {
        let mut buf = ByteBuffer::new(16, ByteOrder::Big);
        buf.put_u8(1);
        buf.align_put(4);
        assert_eq!(buf.position(), 4);
        assert_eq!(buf.get_u8_at(1), PADDING_BYTE);
        assert_eq!(buf.get_u8_at(3), PADDING_BYTE);

        // aligned position stays put
        buf.align_put(4);
        assert_eq!(buf.position(), 4);

        buf.flip();
        buf.get_u8();
        buf.align_get(4);
        assert_eq!(buf.position(), 4);
    }

    #[test]
    fn test_scalar_roundtrip_both_orders() {
        for order in [ByteOrder::Big, ByteOrder::Little].iter() {
            let mut buf = ByteBuffer::new(64, *order);
            buf.put_i16(-2);
            buf.put_u16(3);
            buf.put_i32(-4);
            buf.put_i64(-5);
            buf.put_u64(6);
            buf.put_f32(7.5);
            buf.put_f64(-8.25);

            buf.flip();
            assert_eq!(buf.get_i16(), -2);
            assert_eq!(buf.get_u16(), 3);
            assert_eq!(buf.get_i32(), -4);
            assert_eq!(buf.get_i64(), -5);
            assert_eq!(buf.get_u64(), 6);
            assert_eq!(buf.get_f32(), 7.5);
            assert_eq!(buf.get_f64(), -8.25);
        }
    }

    #[test]
    fn test_io_windows() {
        let mut buf = ByteBuffer::new(8, ByteOrder::Big);
        let mut src: &[u8] = &[1, 2, 3, 4, 5];
        let count = buf.read_from(&mut src).unwrap();
        assert_eq!(count, 5);

        buf.flip();
        let mut out = Vec::new();
        let count = buf.write_to(&mut out).unwrap();
        assert_eq!(count, 5);
        assert_eq!(out, vec![1, 2, 3, 4, 5]);
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn test_backpatch() {
        let mut buf = ByteBuffer::new(16, ByteOrder::Little);
        buf.put_u32(0);
        buf.put_u8(9);
        buf.put_u32_at(0, 0x55AA);

        buf.flip();
        assert_eq!(buf.get_u32(), 0x55AA);
        assert_eq!(buf.get_u8(), 9);
    }
}
