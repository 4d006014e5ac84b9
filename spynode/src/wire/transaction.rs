//! Transactions.

use std::fmt;
use std::io::{self, Read, Write};

use crate::error::WireResult;
use crate::wire::encode::{read_var_bytes, serialize, write_var_bytes, Decodable, Encodable};
use crate::wire::hashes::Hash32;

/// Output index used by the null outpoint of a coinbase input.
pub const COINBASE_INDEX: u32 = 0xffffffff;

/// A reference to a transaction output.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct OutPoint {
    pub txid: Hash32,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: Hash32, vout: u32) -> OutPoint {
        OutPoint {
            txid,
            vout,
        }
    }

    /// The outpoint spent by coinbase inputs.
    pub fn null() -> OutPoint {
        OutPoint {
            txid: Hash32::all_zeros(),
            vout: COINBASE_INDEX,
        }
    }

    pub fn is_null(&self) -> bool {
        *self == OutPoint::null()
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

impl Encodable for OutPoint {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        Ok(self.txid.consensus_encode(w)? + self.vout.consensus_encode(w)?)
    }
}

impl Decodable for OutPoint {
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> WireResult<Self> {
        Ok(OutPoint {
            txid: Decodable::consensus_decode(r)?,
            vout: Decodable::consensus_decode(r)?,
        })
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Hash)]
pub struct TxIn {
    pub previous_output: OutPoint,
    /// Unlocking script.
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl Encodable for TxIn {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = self.previous_output.consensus_encode(w)?;
        len += write_var_bytes(w, &self.script_sig)?;
        len += self.sequence.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for TxIn {
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> WireResult<Self> {
        Ok(TxIn {
            previous_output: Decodable::consensus_decode(r)?,
            script_sig: read_var_bytes(r)?,
            sequence: Decodable::consensus_decode(r)?,
        })
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Hash, Default)]
pub struct TxOut {
    /// Value in satoshis.
    pub value: u64,
    /// Locking script.
    pub script_pubkey: Vec<u8>,
}

impl Encodable for TxOut {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        Ok(self.value.consensus_encode(w)? + write_var_bytes(w, &self.script_pubkey)?)
    }
}

impl Decodable for TxOut {
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> WireResult<Self> {
        Ok(TxOut {
            value: Decodable::consensus_decode(r)?,
            script_pubkey: read_var_bytes(r)?,
        })
    }
}

/// A Bitcoin SV transaction.
#[derive(Clone, PartialEq, Eq, Debug, Hash)]
pub struct Transaction {
    pub version: i32,
    pub input: Vec<TxIn>,
    pub output: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn txid(&self) -> Hash32 {
        Hash32::hash(&serialize(self))
    }

    pub fn is_coinbase(&self) -> bool {
        self.input.len() == 1 && self.input[0].previous_output.is_null()
    }

    /// Serialized size in bytes.
    pub fn size(&self) -> usize {
        serialize(self).len()
    }
}

impl Encodable for Transaction {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = self.version.consensus_encode(w)?;
        len += self.input.consensus_encode(w)?;
        len += self.output.consensus_encode(w)?;
        len += self.lock_time.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for Transaction {
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> WireResult<Self> {
        Ok(Transaction {
            version: Decodable::consensus_decode(r)?,
            input: Decodable::consensus_decode(r)?,
            output: Decodable::consensus_decode(r)?,
            lock_time: Decodable::consensus_decode(r)?,
        })
    }
}
