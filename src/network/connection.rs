//! Connection handling
//!
//! Wraps a TcpStream with the frame codec and read/write buffers. Decoding
//! is purely buffer-driven; the stream is only read when the decoder needs
//! more bytes, so a partial frame never blocks the write side.

use bytes::BytesMut;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::protocol::{self, CodecError, Decoder, Message, MessageError};

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Framing error: {0}")]
    Codec(#[from] CodecError),

    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    #[error("Connection closed mid-frame")]
    Closed,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Byte and message counters, logged at disconnect
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// One framed TCP connection
pub struct Connection {
    remote_addr: SocketAddr,
    stream: TcpStream,
    decoder: Decoder,
    read_buf: BytesMut,
    write_buf: BytesMut,
    stats: ConnectionStats,
}

impl Connection {
    /// Wrap an established stream
    pub fn new(stream: TcpStream, remote_addr: SocketAddr) -> Self {
        Self {
            remote_addr,
            stream,
            decoder: Decoder::new(),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
            stats: ConnectionStats::default(),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Encode and send one message
    pub async fn send(&mut self, message: &Message) -> ConnectionResult<()> {
        self.write_buf.clear();
        protocol::encode(message.type_code(), &message.pack(), &mut self.write_buf)?;

        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;

        self.stats.messages_sent += 1;
        self.stats.bytes_sent += self.write_buf.len() as u64;
        Ok(())
    }

    /// Receive the next message. Returns `None` on clean EOF.
    pub async fn recv(&mut self) -> ConnectionResult<Option<Message>> {
        loop {
            if let Some(raw) = self.decoder.decode(&mut self.read_buf)? {
                self.stats.messages_received += 1;
                return Ok(Some(Message::unpack(raw.type_code, &raw.body)?));
            }

            let mut buf = [0u8; 4096];
            let n = self.stream.read(&mut buf).await?;

            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(ConnectionError::Closed);
            }

            self.read_buf.extend_from_slice(&buf[..n]);
            self.stats.bytes_received += n as u64;
        }
    }

    /// Shut down the write side; queued frames are already flushed by send
    pub async fn shutdown(&mut self) -> ConnectionResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
