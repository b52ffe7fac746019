//! Little-endian wire helpers for on-disk headers
//!
//! Every persisted integer in objbd is little-endian. Serialization appends
//! to a `Vec<u8>`; parsing walks a borrowed buffer and fails with `Corrupt`
//! on truncation, since a short header can only mean damaged state.

use objbd_common::{Error, Result};
use uuid::Uuid;

pub(crate) fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_uuid(buf: &mut Vec<u8>, v: &Uuid) {
    buf.extend_from_slice(v.as_bytes());
}

/// Zero-pad `buf` to a multiple of `align` bytes
pub(crate) fn pad_to(buf: &mut Vec<u8>, align: usize) {
    let rem = buf.len() % align;
    if rem != 0 {
        buf.resize(buf.len() + align - rem, 0);
    }
}

/// Forward-only reader over a parsed on-disk buffer
pub(crate) struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Current absolute offset
    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    /// Reposition to an absolute offset (offset/len-addressed arrays)
    pub(crate) fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.buf.len() {
            return Err(Error::corrupt("offset past end of header"));
        }
        self.pos = pos;
        Ok(())
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(Error::corrupt("truncated header"));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub(crate) fn uuid(&mut self) -> Result<Uuid> {
        let bytes: [u8; 16] = self.take(16)?.try_into().unwrap();
        Ok(Uuid::from_bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_scalars() {
        let mut buf = Vec::new();
        put_u32(&mut buf, 0xDEAD_BEEF);
        put_u64(&mut buf, u64::MAX - 1);
        let id = Uuid::new_v4();
        put_uuid(&mut buf, &id);

        let mut c = Cursor::new(&buf);
        assert_eq!(c.u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(c.u64().unwrap(), u64::MAX - 1);
        assert_eq!(c.uuid().unwrap(), id);
        assert!(c.u8().is_err());
    }

    #[test]
    fn test_pad_to() {
        let mut buf = vec![1u8; 5];
        pad_to(&mut buf, 8);
        assert_eq!(buf.len(), 8);
        assert_eq!(&buf[5..], &[0, 0, 0]);
        pad_to(&mut buf, 8);
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn test_seek_bounds() {
        let buf = [0u8; 4];
        let mut c = Cursor::new(&buf);
        assert!(c.seek(4).is_ok());
        assert!(c.seek(5).is_err());
    }
}
