//! Framed TCP connection to a peer.
//!
//! A connection is split into a [`MessageReader`] owned by the incoming task and a
//! [`MessageWriter`] owned by the outgoing task, so reads never wait on writes.

use std::io::Cursor;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::error::{NetworkError, NetworkResult, WireError};
use crate::network::constants::DIAL_TIMEOUT;
use crate::wire::encode::{Decodable, serialize};
use crate::wire::message::{HEADER_LEN, MessageHeader};
use crate::wire::{Network, NetworkMessage, RawNetworkMessage};

/// Payload buffers grow past this size only as bytes arrive.
const INITIAL_PAYLOAD_CAPACITY: usize = 1 << 20;

/// Reads framed messages for one network.
pub struct MessageReader<R> {
    inner: BufReader<R>,
    network: Network,
    address: String,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R, network: Network, address: impl Into<String>) -> Self {
        Self {
            inner: BufReader::new(inner),
            network,
            address: address.into(),
        }
    }

    /// Reads the next message. Unknown commands are returned as
    /// [`NetworkMessage::Unknown`].
    pub async fn read_message(&mut self) -> NetworkResult<NetworkMessage> {
        let mut header_bytes = [0u8; HEADER_LEN];
        self.inner.read_exact(&mut header_bytes).await.map_err(read_error)?;
        let header = MessageHeader::consensus_decode(&mut Cursor::new(&header_bytes[..]))?;

        if header.magic != self.network.magic() {
            return Err(WireError::WrongMagic {
                expected: self.network.magic(),
                actual: header.magic,
            }
            .into());
        }

        let length = header.length as usize;
        let mut payload = Vec::with_capacity(length.min(INITIAL_PAYLOAD_CAPACITY));
        let read = (&mut self.inner)
            .take(header.length as u64)
            .read_to_end(&mut payload)
            .await
            .map_err(read_error)?;
        if read != length {
            return Err(NetworkError::PeerDisconnected);
        }

        header.verify_checksum(&payload)?;
        let command = header.command_str()?;
        let message = NetworkMessage::decode_payload(command, payload)?;
        tracing::trace!("Received {} from {}", message.command(), self.address);
        Ok(message)
    }
}

fn read_error(e: std::io::Error) -> NetworkError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        NetworkError::PeerDisconnected
    } else {
        NetworkError::Io(e)
    }
}

/// Writes framed messages for one network.
pub struct MessageWriter<W> {
    inner: W,
    network: Network,
    address: String,
    bytes_sent: u64,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(inner: W, network: Network, address: impl Into<String>) -> Self {
        Self {
            inner,
            network,
            address: address.into(),
            bytes_sent: 0,
        }
    }

    pub async fn write_message(&mut self, message: NetworkMessage) -> NetworkResult<()> {
        let raw = RawNetworkMessage {
            magic: self.network.magic(),
            payload: message,
        };
        let data = serialize(&raw);
        self.inner.write_all(&data).await?;
        self.inner.flush().await?;
        self.bytes_sent += data.len() as u64;
        tracing::trace!("Sent {} to {}", raw.cmd(), self.address);
        Ok(())
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub async fn shutdown(&mut self) {
        if let Err(e) = self.inner.shutdown().await {
            tracing::debug!("Failed to shut down connection to {}: {}", self.address, e);
        }
    }
}

pub type TcpReader = MessageReader<OwnedReadHalf>;
pub type TcpWriter = MessageWriter<OwnedWriteHalf>;

/// Dials `address` (`host:port`) and splits the stream into a reader and a writer.
pub async fn connect(address: &str, network: Network) -> NetworkResult<(TcpReader, TcpWriter)> {
    let stream = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(NetworkError::ConnectionFailed(format!(
                "Failed to connect to {}: {}",
                address, e
            )));
        }
        Err(_) => {
            return Err(NetworkError::Timeout(format!("Dial to {} timed out", address)));
        }
    };
    stream.set_nodelay(true).map_err(|e| {
        NetworkError::ConnectionFailed(format!("Failed to set TCP_NODELAY: {}", e))
    })?;

    tracing::debug!("Connected to {}", address);
    let (read_half, write_half) = stream.into_split();
    Ok((
        MessageReader::new(read_half, network, address),
        MessageWriter::new(write_half, network, address),
    ))
}
