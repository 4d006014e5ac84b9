//! Bitcoin SV wire types and consensus encoding.

pub mod block;
pub mod encode;
pub mod hashes;
pub mod message;
pub mod network;
pub mod script;
pub mod transaction;

pub use block::{Block, BlockHeader};
pub use encode::{deserialize, serialize, Decodable, Encodable, VarInt};
pub use hashes::{Hash20, Hash32};
pub use message::{
    GetHeadersMessage, Inventory, NetworkMessage, RawNetworkMessage, Reject, VersionMessage,
};
pub use network::Network;
pub use transaction::{OutPoint, Transaction, TxIn, TxOut};
