//! Bitcoin consensus encoding.
//!
//! Values are encoded little-endian; collections carry a [`VarInt`] length prefix.
//! Decoding of collections never trusts the length prefix for allocation.

use std::io::{self, Read, Write};

use crate::error::{WireError, WireResult};

/// Largest single allocation made up front while decoding a collection.
const MAX_PREALLOCATION: usize = 1024;

/// Data which can be encoded in a consensus-consistent way.
pub trait Encodable {
    /// Encode into a writer, returning the number of bytes written.
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error>;
}

/// Data which can be decoded in a consensus-consistent way.
pub trait Decodable: Sized {
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> WireResult<Self>;
}

/// Encode an object into a vector.
pub fn serialize<T: Encodable + ?Sized>(data: &T) -> Vec<u8> {
    let mut encoder = Vec::new();
    // Writing to a Vec cannot fail.
    let _ = data.consensus_encode(&mut encoder);
    encoder
}

/// Deserialize an object from a slice, erroring if the whole slice is not consumed.
pub fn deserialize<T: Decodable>(data: &[u8]) -> WireResult<T> {
    let (rv, consumed) = deserialize_partial(data)?;
    if consumed == data.len() {
        Ok(rv)
    } else {
        Err(WireError::ParseFailed("data not consumed entirely when explicitly deserializing"))
    }
}

/// Deserialize an object from a slice, returning it with the number of bytes consumed.
pub fn deserialize_partial<T: Decodable>(data: &[u8]) -> WireResult<(T, usize)> {
    let mut decoder = io::Cursor::new(data);
    let rv = T::consensus_decode(&mut decoder)?;
    Ok((rv, decoder.position() as usize))
}

/// A variable-length unsigned integer.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug)]
pub struct VarInt(pub u64);

impl VarInt {
    /// Number of bytes this varint occupies when encoded.
    pub fn size(&self) -> usize {
        match self.0 {
            0..=0xFC => 1,
            0xFD..=0xFFFF => 3,
            0x10000..=0xFFFFFFFF => 5,
            _ => 9,
        }
    }
}

impl Encodable for VarInt {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        match self.0 {
            0..=0xFC => {
                (self.0 as u8).consensus_encode(w)?;
                Ok(1)
            }
            0xFD..=0xFFFF => {
                w.write_all(&[0xFD])?;
                (self.0 as u16).consensus_encode(w)?;
                Ok(3)
            }
            0x10000..=0xFFFFFFFF => {
                w.write_all(&[0xFE])?;
                (self.0 as u32).consensus_encode(w)?;
                Ok(5)
            }
            _ => {
                w.write_all(&[0xFF])?;
                self.0.consensus_encode(w)?;
                Ok(9)
            }
        }
    }
}

impl Decodable for VarInt {
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> WireResult<Self> {
        let n = u8::consensus_decode(r)?;
        match n {
            0xFF => {
                let x = u64::consensus_decode(r)?;
                if x < 0x100000000 {
                    Err(WireError::NonMinimalVarInt)
                } else {
                    Ok(VarInt(x))
                }
            }
            0xFE => {
                let x = u32::consensus_decode(r)?;
                if x < 0x10000 {
                    Err(WireError::NonMinimalVarInt)
                } else {
                    Ok(VarInt(x as u64))
                }
            }
            0xFD => {
                let x = u16::consensus_decode(r)?;
                if x < 0xFD {
                    Err(WireError::NonMinimalVarInt)
                } else {
                    Ok(VarInt(x as u64))
                }
            }
            n => Ok(VarInt(n as u64)),
        }
    }
}

macro_rules! impl_int_encodable {
    ($ty:ident, $len:expr) => {
        impl Encodable for $ty {
            #[inline]
            fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
                w.write_all(&self.to_le_bytes())?;
                Ok($len)
            }
        }

        impl Decodable for $ty {
            #[inline]
            fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> WireResult<Self> {
                let mut buf = [0u8; $len];
                r.read_exact(&mut buf)?;
                Ok($ty::from_le_bytes(buf))
            }
        }
    };
}

impl_int_encodable!(u8, 1);
impl_int_encodable!(u16, 2);
impl_int_encodable!(u32, 4);
impl_int_encodable!(u64, 8);
impl_int_encodable!(i32, 4);
impl_int_encodable!(i64, 8);

impl Encodable for bool {
    #[inline]
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        w.write_all(&[*self as u8])?;
        Ok(1)
    }
}

impl Decodable for bool {
    #[inline]
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> WireResult<Self> {
        Ok(u8::consensus_decode(r)? != 0)
    }
}

macro_rules! impl_array {
    ($size:expr) => {
        impl Encodable for [u8; $size] {
            #[inline]
            fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
                w.write_all(&self[..])?;
                Ok($size)
            }
        }

        impl Decodable for [u8; $size] {
            #[inline]
            fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> WireResult<Self> {
                let mut ret = [0; $size];
                r.read_exact(&mut ret)?;
                Ok(ret)
            }
        }
    };
}

impl_array!(4);
impl_array!(12);
impl_array!(16);
impl_array!(20);
impl_array!(32);

impl<T: Encodable> Encodable for Vec<T> {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = VarInt(self.len() as u64).consensus_encode(w)?;
        for item in self {
            len += item.consensus_encode(w)?;
        }
        Ok(len)
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> WireResult<Self> {
        let count = VarInt::consensus_decode(r)?.0;
        let mut ret = Vec::with_capacity(std::cmp::min(count as usize, MAX_PREALLOCATION));
        for _ in 0..count {
            ret.push(T::consensus_decode(r)?);
        }
        Ok(ret)
    }
}

/// Write a length-prefixed byte string.
pub fn write_var_bytes<W: Write + ?Sized>(w: &mut W, data: &[u8]) -> Result<usize, io::Error> {
    let len = VarInt(data.len() as u64).consensus_encode(w)?;
    w.write_all(data)?;
    Ok(len + data.len())
}

/// Read a length-prefixed byte string.
pub fn read_var_bytes<R: Read + ?Sized>(r: &mut R) -> WireResult<Vec<u8>> {
    let len = VarInt::consensus_decode(r)?.0;
    read_exact_bytes(r, len)
}

/// Read exactly `len` bytes without allocating more than has actually arrived.
pub fn read_exact_bytes<R: Read + ?Sized>(r: &mut R, len: u64) -> WireResult<Vec<u8>> {
    let mut ret = Vec::with_capacity(std::cmp::min(len as usize, MAX_PREALLOCATION * 64));
    let read = Read::take(&mut *r, len).read_to_end(&mut ret)?;
    if (read as u64) < len {
        return Err(WireError::Io(io::Error::from(io::ErrorKind::UnexpectedEof)));
    }
    Ok(ret)
}
