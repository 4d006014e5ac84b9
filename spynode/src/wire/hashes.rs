//! Hash types used on the wire.

use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

use crate::error::{WireError, WireResult};
use crate::wire::encode::{Decodable, Encodable};

/// A double SHA-256 hash, used for block and transaction ids.
///
/// Displayed and parsed in the conventional byte-reversed hex form.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Hash32(pub [u8; 32]);

impl Hash32 {
    pub const fn all_zeros() -> Self {
        Hash32([0u8; 32])
    }

    pub fn from_slice(data: &[u8]) -> WireResult<Self> {
        let bytes: [u8; 32] =
            data.try_into().map_err(|_| WireError::ParseFailed("hash must be 32 bytes"))?;
        Ok(Hash32(bytes))
    }

    /// Hashes `data` twice with SHA-256.
    pub fn hash(data: &[u8]) -> Self {
        Hash32(sha256d(data))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut reversed = self.0;
        reversed.reverse();
        f.write_str(&hex::encode(reversed))
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Hash32 {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        bytes.reverse();
        Ok(Hash32(bytes))
    }
}

impl Encodable for Hash32 {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        self.0.consensus_encode(w)
    }
}

impl Decodable for Hash32 {
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> WireResult<Self> {
        Ok(Hash32(<[u8; 32]>::consensus_decode(r)?))
    }
}

/// A RIPEMD160(SHA256) hash, the form push data is matched in.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Hash20(pub [u8; 20]);

impl Hash20 {
    pub fn from_slice(data: &[u8]) -> WireResult<Self> {
        let bytes: [u8; 20] =
            data.try_into().map_err(|_| WireError::ParseFailed("hash must be 20 bytes"))?;
        Ok(Hash20(bytes))
    }

    /// RIPEMD160 of the SHA-256 of `data`.
    pub fn hash(data: &[u8]) -> Self {
        let sha = Sha256::digest(data);
        let mut out = [0u8; 20];
        out.copy_from_slice(&Ripemd160::digest(sha));
        Hash20(out)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for Hash20 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Hash20 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Hash20 {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Hash20(bytes))
    }
}

impl Encodable for Hash20 {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        self.0.consensus_encode(w)
    }
}

impl Decodable for Hash20 {
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> WireResult<Self> {
        Ok(Hash20(<[u8; 20]>::consensus_decode(r)?))
    }
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

pub fn sha256d(data: &[u8]) -> [u8; 32] {
    Sha256::digest(Sha256::digest(data)).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash32_display_is_reversed() {
        let genesis: Hash32 =
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f".parse().unwrap();
        assert_eq!(genesis.0[0], 0x6f);
        assert_eq!(genesis.0[31], 0x00);
        assert_eq!(
            genesis.to_string(),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
    }

    #[test]
    fn test_sha256d_known_vector() {
        // sha256d("hello")
        assert_eq!(
            hex::encode(sha256d(b"hello")),
            "9595c9df90075148eb06860365df33584b75bff782a510c6cd4883a419833d50"
        );
    }

    #[test]
    fn test_hash160_known_vector() {
        // Compressed public key of private key 1.
        let pubkey =
            hex::decode("0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798")
                .unwrap();
        assert_eq!(Hash20::hash(&pubkey).to_string(), "751e76e8199196d454941c45d1b3a323f1433bd6");
    }

    #[test]
    fn test_invalid_hex() {
        assert!("zz".parse::<Hash32>().is_err());
        assert!("00".parse::<Hash32>().is_err());
    }
}
