//! Network messages.
//!
//! This module defines the `NetworkMessage` and `RawNetworkMessage` types that
//! are used for (de)serializing Bitcoin SV objects for transmission on the network.
//!
//! Frames carry the network magic, a 12 byte command, the payload length and the
//! first four bytes of the payload's double SHA-256 as a checksum.

use std::io::{self, Cursor, Read, Write};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use crate::error::{WireError, WireResult};
use crate::wire::block::{Block, BlockHeader};
use crate::wire::encode::{
    read_var_bytes, serialize, write_var_bytes, Decodable, Encodable, VarInt,
};
use crate::wire::hashes::{sha256d, Hash32};
use crate::wire::transaction::Transaction;

/// Size of the frame header: magic(4) + command(12) + length(4) + checksum(4).
pub const HEADER_LEN: usize = 24;

/// Protocol version advertised in the version message.
pub const PROTOCOL_VERSION: u32 = 70015;

/// Maximum number of inventory vectors in one `inv`/`getdata` message.
pub const MAX_INV_PER_MSG: usize = 50000;

/// Service bit of a full node.
pub const SERVICE_NODE_NETWORK: u64 = 0x01;

/// `inv` type codes.
const INV_TYPE_TX: u32 = 1;
const INV_TYPE_BLOCK: u32 = 2;

/// An inventory item.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash)]
pub enum Inventory {
    Transaction(Hash32),
    Block(Hash32),
    Unknown {
        inv_type: u32,
        hash: Hash32,
    },
}

impl Inventory {
    pub fn hash(&self) -> Hash32 {
        match self {
            Inventory::Transaction(hash) | Inventory::Block(hash) => *hash,
            Inventory::Unknown {
                hash,
                ..
            } => *hash,
        }
    }
}

impl Encodable for Inventory {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let (inv_type, hash) = match *self {
            Inventory::Transaction(hash) => (INV_TYPE_TX, hash),
            Inventory::Block(hash) => (INV_TYPE_BLOCK, hash),
            Inventory::Unknown {
                inv_type,
                hash,
            } => (inv_type, hash),
        };
        Ok(inv_type.consensus_encode(w)? + hash.consensus_encode(w)?)
    }
}

impl Decodable for Inventory {
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> WireResult<Self> {
        let inv_type = u32::consensus_decode(r)?;
        let hash = Hash32::consensus_decode(r)?;
        Ok(match inv_type {
            INV_TYPE_TX => Inventory::Transaction(hash),
            INV_TYPE_BLOCK => Inventory::Block(hash),
            inv_type => Inventory::Unknown {
                inv_type,
                hash,
            },
        })
    }
}

/// The `getheaders` message.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct GetHeadersMessage {
    pub version: u32,
    /// Block locator, most recent first.
    pub locator_hashes: Vec<Hash32>,
    /// Zero to get as many headers as the peer allows.
    pub stop_hash: Hash32,
}

impl GetHeadersMessage {
    pub fn new(locator_hashes: Vec<Hash32>, stop_hash: Hash32) -> GetHeadersMessage {
        GetHeadersMessage {
            version: PROTOCOL_VERSION,
            locator_hashes,
            stop_hash,
        }
    }
}

impl Encodable for GetHeadersMessage {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = self.version.consensus_encode(w)?;
        len += self.locator_hashes.consensus_encode(w)?;
        len += self.stop_hash.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for GetHeadersMessage {
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> WireResult<Self> {
        Ok(GetHeadersMessage {
            version: Decodable::consensus_decode(r)?,
            locator_hashes: Decodable::consensus_decode(r)?,
            stop_hash: Decodable::consensus_decode(r)?,
        })
    }
}

/// A network address as carried in `version` and `addr` messages.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct Address {
    pub services: u64,
    /// IPv6 or IPv4-mapped IPv6 address.
    pub ip: [u8; 16],
    pub port: u16,
}

impl Address {
    pub fn new(socket: &SocketAddr, services: u64) -> Address {
        let ip = match socket.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        Address {
            services,
            ip: ip.octets(),
            port: socket.port(),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        let v6 = Ipv6Addr::from(self.ip);
        let ip = match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        };
        SocketAddr::new(ip, self.port)
    }
}

impl Encodable for Address {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = self.services.consensus_encode(w)?;
        len += self.ip.consensus_encode(w)?;
        w.write_all(&self.port.to_be_bytes())?;
        Ok(len + 2)
    }
}

impl Decodable for Address {
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> WireResult<Self> {
        let services = u64::consensus_decode(r)?;
        let ip = <[u8; 16]>::consensus_decode(r)?;
        let mut port = [0u8; 2];
        r.read_exact(&mut port)?;
        Ok(Address {
            services,
            ip,
            port: u16::from_be_bytes(port),
        })
    }
}

/// An `addr` entry: last seen time and address.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TimedAddress {
    pub time: u32,
    pub address: Address,
}

impl Encodable for TimedAddress {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        Ok(self.time.consensus_encode(w)? + self.address.consensus_encode(w)?)
    }
}

impl Decodable for TimedAddress {
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> WireResult<Self> {
        Ok(TimedAddress {
            time: Decodable::consensus_decode(r)?,
            address: Decodable::consensus_decode(r)?,
        })
    }
}

/// The `version` message.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct VersionMessage {
    pub version: u32,
    pub services: u64,
    pub timestamp: i64,
    pub receiver: Address,
    pub sender: Address,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

impl Encodable for VersionMessage {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = self.version.consensus_encode(w)?;
        len += self.services.consensus_encode(w)?;
        len += self.timestamp.consensus_encode(w)?;
        len += self.receiver.consensus_encode(w)?;
        len += self.sender.consensus_encode(w)?;
        len += self.nonce.consensus_encode(w)?;
        len += write_var_bytes(w, self.user_agent.as_bytes())?;
        len += self.start_height.consensus_encode(w)?;
        len += self.relay.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for VersionMessage {
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> WireResult<Self> {
        let version = u32::consensus_decode(r)?;
        let services = u64::consensus_decode(r)?;
        let timestamp = i64::consensus_decode(r)?;
        let receiver = Address::consensus_decode(r)?;
        let sender = Address::consensus_decode(r)?;
        let nonce = u64::consensus_decode(r)?;
        let user_agent = String::from_utf8_lossy(&read_var_bytes(r)?).into_owned();
        let start_height = i32::consensus_decode(r)?;
        // Relay flag is optional for older peers.
        let relay = bool::consensus_decode(r).unwrap_or(true);
        Ok(VersionMessage {
            version,
            services,
            timestamp,
            receiver,
            sender,
            nonce,
            user_agent,
            start_height,
            relay,
        })
    }
}

/// The `reject` message.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Reject {
    /// Command of the rejected message.
    pub message: String,
    pub code: u8,
    pub reason: String,
    /// Hash of the rejected object when present.
    pub hash: Option<Hash32>,
}

impl Encodable for Reject {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = write_var_bytes(w, self.message.as_bytes())?;
        len += self.code.consensus_encode(w)?;
        len += write_var_bytes(w, self.reason.as_bytes())?;
        if let Some(hash) = self.hash {
            len += hash.consensus_encode(w)?;
        }
        Ok(len)
    }
}

impl Decodable for Reject {
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> WireResult<Self> {
        Ok(Reject {
            message: String::from_utf8_lossy(&read_var_bytes(r)?).into_owned(),
            code: Decodable::consensus_decode(r)?,
            reason: String::from_utf8_lossy(&read_var_bytes(r)?).into_owned(),
            hash: Hash32::consensus_decode(r).ok(),
        })
    }
}

/// A network message payload.
#[derive(Clone, PartialEq, Eq, Debug)]
#[allow(clippy::large_enum_variant)]
pub enum NetworkMessage {
    /// `version`
    Version(VersionMessage),
    /// `verack`
    Verack,
    /// `ping`
    Ping(u64),
    /// `pong`
    Pong(u64),
    /// `getheaders`
    GetHeaders(GetHeadersMessage),
    /// `headers`
    Headers(Vec<BlockHeader>),
    /// `getdata`
    GetData(Vec<Inventory>),
    /// `inv`
    Inv(Vec<Inventory>),
    /// `notfound`
    NotFound(Vec<Inventory>),
    /// `block`
    Block(Block),
    /// `tx`
    Tx(Transaction),
    /// `mempool`
    MemPool,
    /// `getaddr`
    GetAddr,
    /// `addr`
    Addr(Vec<TimedAddress>),
    /// `sendheaders`
    SendHeaders,
    /// `reject`
    Reject(Reject),
    /// Any other message.
    Unknown {
        command: String,
        payload: Vec<u8>,
    },
}

impl NetworkMessage {
    /// Return the message command as a static string reference.
    ///
    /// This returns `"unknown"` for [NetworkMessage::Unknown].
    pub fn cmd(&self) -> &'static str {
        match *self {
            NetworkMessage::Version(_) => "version",
            NetworkMessage::Verack => "verack",
            NetworkMessage::Ping(_) => "ping",
            NetworkMessage::Pong(_) => "pong",
            NetworkMessage::GetHeaders(_) => "getheaders",
            NetworkMessage::Headers(_) => "headers",
            NetworkMessage::GetData(_) => "getdata",
            NetworkMessage::Inv(_) => "inv",
            NetworkMessage::NotFound(_) => "notfound",
            NetworkMessage::Block(_) => "block",
            NetworkMessage::Tx(_) => "tx",
            NetworkMessage::MemPool => "mempool",
            NetworkMessage::GetAddr => "getaddr",
            NetworkMessage::Addr(_) => "addr",
            NetworkMessage::SendHeaders => "sendheaders",
            NetworkMessage::Reject(_) => "reject",
            NetworkMessage::Unknown {
                ..
            } => "unknown",
        }
    }

    /// Return the command carried on the wire, including for unknown messages.
    pub fn command(&self) -> &str {
        match self {
            NetworkMessage::Unknown {
                command,
                ..
            } => command,
            _ => self.cmd(),
        }
    }

    /// Serialize the payload of this message.
    pub fn payload(&self) -> Vec<u8> {
        match self {
            NetworkMessage::Version(dat) => serialize(dat),
            NetworkMessage::Ping(nonce) | NetworkMessage::Pong(nonce) => serialize(nonce),
            NetworkMessage::GetHeaders(dat) => serialize(dat),
            NetworkMessage::Headers(headers) => {
                let mut buf = serialize(&VarInt(headers.len() as u64));
                for header in headers {
                    buf.extend(serialize(header));
                    buf.push(0);
                }
                buf
            }
            NetworkMessage::GetData(dat)
            | NetworkMessage::Inv(dat)
            | NetworkMessage::NotFound(dat) => serialize(dat),
            NetworkMessage::Block(dat) => serialize(dat),
            NetworkMessage::Tx(dat) => serialize(dat),
            NetworkMessage::Addr(dat) => serialize(dat),
            NetworkMessage::Reject(dat) => serialize(dat),
            NetworkMessage::Verack
            | NetworkMessage::MemPool
            | NetworkMessage::GetAddr
            | NetworkMessage::SendHeaders => vec![],
            NetworkMessage::Unknown {
                payload,
                ..
            } => payload.clone(),
        }
    }

    /// Decode a payload for the given command.
    pub fn decode_payload(command: &str, payload: Vec<u8>) -> WireResult<NetworkMessage> {
        let mut r = Cursor::new(&payload[..]);
        let message = match command {
            "version" => NetworkMessage::Version(Decodable::consensus_decode(&mut r)?),
            "verack" => NetworkMessage::Verack,
            "ping" => NetworkMessage::Ping(u64::consensus_decode(&mut r).unwrap_or(0)),
            "pong" => NetworkMessage::Pong(Decodable::consensus_decode(&mut r)?),
            "getheaders" => NetworkMessage::GetHeaders(Decodable::consensus_decode(&mut r)?),
            "headers" => {
                let count = VarInt::consensus_decode(&mut r)?.0;
                let mut headers = Vec::with_capacity(std::cmp::min(count as usize, 2000));
                for _ in 0..count {
                    headers.push(BlockHeader::consensus_decode(&mut r)?);
                    if VarInt::consensus_decode(&mut r)?.0 != 0 {
                        return Err(WireError::ParseFailed(
                            "Headers message should not contain transactions",
                        ));
                    }
                }
                NetworkMessage::Headers(headers)
            }
            "getdata" => NetworkMessage::GetData(Decodable::consensus_decode(&mut r)?),
            "inv" => NetworkMessage::Inv(Decodable::consensus_decode(&mut r)?),
            "notfound" => NetworkMessage::NotFound(Decodable::consensus_decode(&mut r)?),
            "block" => NetworkMessage::Block(Decodable::consensus_decode(&mut r)?),
            "tx" => NetworkMessage::Tx(Decodable::consensus_decode(&mut r)?),
            "mempool" => NetworkMessage::MemPool,
            "getaddr" => NetworkMessage::GetAddr,
            "addr" => NetworkMessage::Addr(Decodable::consensus_decode(&mut r)?),
            "sendheaders" => NetworkMessage::SendHeaders,
            "reject" => NetworkMessage::Reject(Decodable::consensus_decode(&mut r)?),
            _ => {
                return Ok(NetworkMessage::Unknown {
                    command: command.to_string(),
                    payload,
                });
            }
        };
        Ok(message)
    }
}

/// The fixed size header of a framed message.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MessageHeader {
    pub magic: u32,
    pub command: [u8; 12],
    pub length: u32,
    pub checksum: [u8; 4],
}

impl MessageHeader {
    /// The command with NUL padding removed.
    pub fn command_str(&self) -> WireResult<&str> {
        let end = self.command.iter().position(|b| *b == 0).unwrap_or(self.command.len());
        if self.command[end..].iter().any(|b| *b != 0) {
            return Err(WireError::InvalidCommand);
        }
        std::str::from_utf8(&self.command[..end]).map_err(|_| WireError::InvalidCommand)
    }

    pub fn verify_checksum(&self, payload: &[u8]) -> WireResult<()> {
        let actual = checksum(payload);
        if actual != self.checksum {
            return Err(WireError::InvalidChecksum {
                expected: self.checksum,
                actual,
            });
        }
        Ok(())
    }
}

impl Decodable for MessageHeader {
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> WireResult<Self> {
        Ok(MessageHeader {
            magic: Decodable::consensus_decode(r)?,
            command: Decodable::consensus_decode(r)?,
            length: Decodable::consensus_decode(r)?,
            checksum: Decodable::consensus_decode(r)?,
        })
    }
}

/// A framed network message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawNetworkMessage {
    /// Magic bytes to identify the network these messages are meant for
    pub magic: u32,
    pub payload: NetworkMessage,
}

impl RawNetworkMessage {
    pub fn cmd(&self) -> &'static str {
        self.payload.cmd()
    }
}

impl Encodable for RawNetworkMessage {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let command = self.payload.command().as_bytes();
        if command.len() > 12 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "command too long"));
        }
        let mut command_bytes = [0u8; 12];
        command_bytes[..command.len()].copy_from_slice(command);
        let payload = self.payload.payload();

        let mut len = self.magic.consensus_encode(w)?;
        len += command_bytes.consensus_encode(w)?;
        len += (payload.len() as u32).consensus_encode(w)?;
        len += checksum(&payload).consensus_encode(w)?;
        w.write_all(&payload)?;
        Ok(len + payload.len())
    }
}

impl Decodable for RawNetworkMessage {
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> WireResult<Self> {
        let header = MessageHeader::consensus_decode(r)?;
        let payload = crate::wire::encode::read_exact_bytes(r, header.length as u64)?;
        header.verify_checksum(&payload)?;
        let command = header.command_str()?;
        Ok(RawNetworkMessage {
            magic: header.magic,
            payload: NetworkMessage::decode_payload(command, payload)?,
        })
    }
}

/// First four bytes of the double SHA-256 of the payload.
pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let hash = sha256d(payload);
    [hash[0], hash[1], hash[2], hash[3]]
}
