use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{get_len, get_u32, get_u64, take_bytes};
use crate::error::{Error, Result};

/// Contents of a run of present slots.
///
/// Embedded mode stores the values themselves (`Vec<T>`); detached mode stores only how many
/// slots the run covers (`SlotCount`). The tree only ever splits, joins and measures runs, so
/// both modes share every structural algorithm.
pub trait Slots: Default + Sized {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keeps `[0, at)` in `self` and returns `[at, len)`.
    fn split_off(&mut self, at: usize) -> Self;

    fn append(&mut self, other: Self);

    /// Writes the run contents (not its length) for `save`.
    fn encode(&self, buf: &mut BytesMut);

    /// Reads back a run of `len` slots written by `encode`.
    fn decode(len: usize, buf: &mut Bytes) -> Result<Self>;
}

/// Present run in detached mode: only a length.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SlotCount(pub usize);

impl Slots for SlotCount {
    fn len(&self) -> usize {
        self.0
    }

    fn split_off(&mut self, at: usize) -> Self {
        let rest = self.0 - at;
        self.0 = at;
        SlotCount(rest)
    }

    fn append(&mut self, other: Self) {
        self.0 += other.0;
    }

    fn encode(&self, _buf: &mut BytesMut) {}

    fn decode(len: usize, _buf: &mut Bytes) -> Result<Self> {
        Ok(SlotCount(len))
    }
}

impl<T: Payload> Slots for Vec<T> {
    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn split_off(&mut self, at: usize) -> Self {
        Vec::split_off(self, at)
    }

    fn append(&mut self, mut other: Self) {
        Vec::append(self, &mut other);
    }

    fn encode(&self, buf: &mut BytesMut) {
        for value in self {
            value.encode(buf);
        }
    }

    fn decode(len: usize, buf: &mut Bytes) -> Result<Self> {
        let mut out = Vec::with_capacity(len.min(buf.remaining()));
        for _ in 0..len {
            out.push(T::decode(buf)?);
        }
        Ok(out)
    }
}

/// Byte serialization for values stored in embedded mode.
pub trait Payload: Clone {
    fn encode(&self, buf: &mut BytesMut);
    fn decode(buf: &mut Bytes) -> Result<Self>;
}

impl Payload for Bytes {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.len() as u64);
        buf.put_slice(self);
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        let len = get_len(buf)?;
        take_bytes(buf, len)
    }
}

impl Payload for Vec<u8> {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.len() as u64);
        buf.put_slice(self);
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        let len = get_len(buf)?;
        Ok(take_bytes(buf, len)?.to_vec())
    }
}

impl Payload for String {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.len() as u64);
        buf.put_slice(self.as_bytes());
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        let len = get_len(buf)?;
        let raw = take_bytes(buf, len)?;
        String::from_utf8(raw.to_vec()).map_err(|e| Error::Decode(e.to_string()))
    }
}

impl Payload for char {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(*self as u32);
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        let raw = get_u32(buf)?;
        char::from_u32(raw).ok_or_else(|| Error::Decode(format!("invalid char {raw:#x}")))
    }
}

impl Payload for u64 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(*self);
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        get_u64(buf)
    }
}

impl Payload for i64 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i64_le(*self);
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        Ok(get_u64(buf)? as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip<T: Payload>(value: &T) -> Result<T> {
        let mut buf = BytesMut::new();
        value.encode(&mut buf);
        T::decode(&mut buf.freeze())
    }

    #[test]
    fn byte_strings_carry_a_u64_length() {
        let value = "héllo".to_string();
        let mut buf = BytesMut::new();
        value.encode(&mut buf);
        assert_eq!(buf.len(), 8 + value.len());
        assert_eq!(&buf[..8], &(value.len() as u64).to_le_bytes());
        assert_eq!(round_trip(&value).unwrap(), value);
        assert_eq!(round_trip(&vec![1u8, 2, 3]).unwrap(), vec![1, 2, 3]);
        assert_eq!(round_trip(&Bytes::from_static(b"xy")).unwrap(), Bytes::from_static(b"xy"));
    }

    #[test]
    fn lengths_past_the_input_are_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u64_le(u64::MAX);
        buf.put_slice(b"abc");
        let err = String::decode(&mut buf.freeze()).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));

        let mut buf = BytesMut::new();
        buf.put_u64_le(2);
        buf.put_slice(&[0xff, 0xfe]);
        assert!(matches!(String::decode(&mut buf.freeze()), Err(Error::Decode(_))));
    }
}
