//! Bitcoin SV network types.

use std::fmt;

use crate::wire::block::BlockHeader;
use crate::wire::hashes::Hash32;

/// The network to act on.
#[derive(Copy, PartialEq, Eq, PartialOrd, Ord, Clone, Hash, Debug, Default)]
pub enum Network {
    /// Bitcoin SV main network.
    #[default]
    Mainnet,
    /// Bitcoin SV testnet.
    Testnet,
    /// Scaling test network.
    Stn,
    /// Local regression test network.
    Regtest,
}

impl Network {
    /// Creates a `Network` from the magic bytes.
    pub fn from_magic(magic: u32) -> Option<Network> {
        // Note: any new entries here must be added to `magic` below
        match magic {
            0xE8F3E1E3 => Some(Network::Mainnet),
            0xF4F3E5F4 => Some(Network::Testnet),
            0xF9C4CEFB => Some(Network::Stn),
            0xFABFB5DA => Some(Network::Regtest),
            _ => None,
        }
    }

    /// Return the network magic bytes, which should be encoded little-endian
    /// at the start of every message
    pub fn magic(self) -> u32 {
        // Note: any new entries here must be added to `from_magic` above
        match self {
            Network::Mainnet => 0xE8F3E1E3,
            Network::Testnet => 0xF4F3E5F4,
            Network::Stn => 0xF9C4CEFB,
            Network::Regtest => 0xFABFB5DA,
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Network::Mainnet => 8333,
            Network::Testnet => 18333,
            Network::Stn => 9333,
            Network::Regtest => 18444,
        }
    }

    /// Header of the first block of the chain.
    pub fn genesis_header(self) -> BlockHeader {
        let merkle_root = Hash32([
            0x3b, 0xa3, 0xed, 0xfd, 0x7a, 0x7b, 0x12, 0xb2, 0x7a, 0xc7, 0x2c, 0x3e, 0x67, 0x76,
            0x8f, 0x61, 0x7f, 0xc8, 0x1b, 0xc3, 0x88, 0x8a, 0x51, 0x32, 0x3a, 0x9f, 0xb8, 0xaa,
            0x4b, 0x1e, 0x5e, 0x4a,
        ]);
        let (time, bits, nonce) = match self {
            Network::Mainnet => (1231006505, 0x1d00ffff, 2083236893),
            Network::Testnet | Network::Stn => (1296688602, 0x1d00ffff, 414098458),
            Network::Regtest => (1296688602, 0x207fffff, 2),
        };
        BlockHeader {
            version: 1,
            prev_blockhash: Hash32::all_zeros(),
            merkle_root,
            time,
            bits,
            nonce,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Network::Mainnet => write!(f, "mainnet"),
            Network::Testnet => write!(f, "testnet"),
            Network::Stn => write!(f, "stn"),
            Network::Regtest => write!(f, "regtest"),
        }
    }
}

impl std::str::FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" | "main" | "bsv" => Ok(Network::Mainnet),
            "testnet" | "test" => Ok(Network::Testnet),
            "stn" => Ok(Network::Stn),
            "regtest" => Ok(Network::Regtest),
            _ => Err(format!("Unknown network type: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_magic() {
        for network in [Network::Mainnet, Network::Testnet, Network::Stn, Network::Regtest] {
            assert_eq!(Network::from_magic(network.magic()), Some(network));
        }
        assert_eq!(Network::Mainnet.magic().to_le_bytes(), [0xe3, 0xe1, 0xf3, 0xe8]);
        assert_eq!(Network::from_magic(0x12345678), None);
    }

    #[test]
    fn test_genesis_hashes() {
        assert_eq!(
            Network::Testnet.genesis_header().block_hash().to_string(),
            "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943"
        );
        assert_eq!(
            Network::Regtest.genesis_header().block_hash().to_string(),
            "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206"
        );
    }

    #[test]
    fn test_network_from_str() {
        assert_eq!("mainnet".parse::<Network>().unwrap(), Network::Mainnet);
        assert_eq!("TESTNET".parse::<Network>().unwrap(), Network::Testnet);
        assert!("dash".parse::<Network>().is_err());
    }
}
