#![allow(missing_docs)]

//! Out-of-band bootstrap channel.
//!
//! Before two queue pairs can talk they swap [`Address`](crate::address::Address)es and
//! remote region descriptors over an ordinary stream. Anything that is tokio
//! `AsyncRead + AsyncWrite` works as a channel; [`TcpBootstrap`] opens TCP ones.
//! Every structure crossing the channel has a fixed-size little-endian encoding, see
//! [`Wire`].

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::config::BootstrapConfig;
use crate::error::{Result, TransportError};

const READY_BYTE: u8 = 0x52;

/// A structure with a fixed-size encoding.
///
/// The encoding is bincode's fixed-int little-endian form, checked against
/// [`WIRE_LEN`](Wire::WIRE_LEN) in both directions.
pub trait Wire: Serialize + DeserializeOwned {
    /// Exact encoded size.
    const WIRE_LEN: usize;
    /// Name used in error messages.
    const NAME: &'static str;

    fn encode(&self) -> Result<Vec<u8>> {
        let bytes = bincode::serialize(self).map_err(|e| TransportError::Codec {
            what: Self::NAME,
            reason: e.to_string(),
        })?;
        if bytes.len() != Self::WIRE_LEN {
            return Err(TransportError::Codec {
                what: Self::NAME,
                reason: format!("encoded {} bytes, expected {}", bytes.len(), Self::WIRE_LEN),
            });
        }
        Ok(bytes)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::WIRE_LEN {
            return Err(TransportError::Codec {
                what: Self::NAME,
                reason: format!("got {} bytes, expected {}", bytes.len(), Self::WIRE_LEN),
            });
        }
        bincode::deserialize(bytes).map_err(|e| TransportError::Codec {
            what: Self::NAME,
            reason: e.to_string(),
        })
    }
}

/// A reliable, ordered byte channel used only during connection setup.
#[async_trait]
pub trait Bootstrap: Send {
    /// Writes and flushes all of `bytes`.
    async fn send_bytes(&mut self, bytes: &[u8]) -> Result<()>;

    /// Fills `buf` completely.
    async fn recv_exact(&mut self, buf: &mut [u8]) -> Result<()>;
}

#[async_trait]
impl<S> Bootstrap for S
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_all(bytes).await?;
        self.flush().await?;
        Ok(())
    }

    async fn recv_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.read_exact(buf).await?;
        Ok(())
    }
}

/// Sends one fixed-size structure.
pub async fn send<B, T>(channel: &mut B, value: &T) -> Result<()>
where
    B: Bootstrap + ?Sized,
    T: Wire,
{
    let bytes = value.encode()?;
    channel.send_bytes(&bytes).await
}

/// Receives one fixed-size structure.
pub async fn recv<B, T>(channel: &mut B) -> Result<T>
where
    B: Bootstrap + ?Sized,
    T: Wire,
{
    let mut buf = vec![0u8; T::WIRE_LEN];
    channel.recv_exact(&mut buf).await?;
    T::decode(&buf)
}

/// Sends `local` and returns the peer's value. Both sides call this symmetrically.
pub async fn exchange<B, T>(channel: &mut B, local: &T) -> Result<T>
where
    B: Bootstrap + ?Sized,
    T: Wire,
{
    send(channel, local).await?;
    recv(channel).await
}

/// Waits until the peer reaches the same point. Used after both sides connected their
/// queue pairs so that nobody posts to a peer still in Init.
pub async fn ready_barrier<B>(channel: &mut B) -> Result<()>
where
    B: Bootstrap + ?Sized,
{
    channel.send_bytes(&[READY_BYTE]).await?;
    let mut byte = [0u8; 1];
    channel.recv_exact(&mut byte).await?;
    if byte[0] != READY_BYTE {
        return Err(TransportError::Codec {
            what: "ready barrier",
            reason: format!("unexpected byte {:#04x}", byte[0]),
        });
    }
    Ok(())
}

/// Opens TCP bootstrap channels.
#[derive(Debug, Clone, Default)]
pub struct TcpBootstrap {
    config: BootstrapConfig,
}

impl TcpBootstrap {
    pub fn new(config: BootstrapConfig) -> Self {
        Self { config }
    }

    /// Connects to `addr` within the configured timeout.
    pub async fn connect(&self, addr: &str) -> Result<TcpStream> {
        let start = Instant::now();
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::TimedOut {
                operation: "bootstrap connect",
                elapsed_ms: start.elapsed().as_millis() as u64,
            })??;
        if self.config.nodelay {
            stream.set_nodelay(true)?;
        }
        debug!(addr, "bootstrap connected");
        Ok(stream)
    }

    pub async fn listen(&self, addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(addr).await?;
        debug!(addr = %listener.local_addr()?, "bootstrap listening");
        Ok(listener)
    }

    pub async fn accept(&self, listener: &TcpListener) -> Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = listener.accept().await?;
        if self.config.nodelay {
            stream.set_nodelay(true)?;
        }
        debug!(%peer, "bootstrap accepted");
        Ok((stream, peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::memory::RemoteMemoryRegion;

    #[tokio::test]
    async fn test_exchange_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let left = Address::new(7, 42);
        let right = Address::new(9, 99);

        let peer = tokio::spawn(async move { exchange(&mut b, &right).await.unwrap() });
        let got = exchange(&mut a, &left).await.unwrap();
        assert_eq!(got, Address::new(9, 99));
        assert_eq!(peer.await.unwrap(), Address::new(7, 42));
    }

    #[tokio::test]
    async fn test_ready_barrier() {
        let (mut a, mut b) = tokio::io::duplex(8);
        let peer = tokio::spawn(async move { ready_barrier(&mut b).await });
        ready_barrier(&mut a).await.unwrap();
        peer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bad_barrier_byte() {
        let (mut a, mut b) = tokio::io::duplex(8);
        b.write_all(&[0xff]).await.unwrap();
        let err = ready_barrier(&mut a).await.unwrap_err();
        assert!(matches!(err, TransportError::Codec { what: "ready barrier", .. }));
    }

    #[tokio::test]
    async fn test_peer_hangup_is_io_error() {
        let (mut a, b) = tokio::io::duplex(8);
        drop(b);
        let err = recv::<_, RemoteMemoryRegion>(&mut a).await.unwrap_err();
        assert!(matches!(err, TransportError::Io(_)));
    }

    #[tokio::test]
    async fn test_tcp_connect_and_accept() {
        let boot = TcpBootstrap::default();
        let listener = boot.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let boot = TcpBootstrap::default();
            let (mut stream, _) = boot.accept(&listener).await.unwrap();
            let region: RemoteMemoryRegion = recv(&mut stream).await.unwrap();
            assert_eq!(region.rkey, 0x77);
        });

        let mut stream = boot.connect(&addr).await.unwrap();
        let region = RemoteMemoryRegion {
            addr: 0x1000,
            rkey: 0x77,
        };
        send(&mut stream, &region).await.unwrap();
        server.await.unwrap();
    }

    #[test]
    fn test_decode_wrong_length() {
        let err = RemoteMemoryRegion::decode(&[0u8; 11]).unwrap_err();
        assert!(matches!(
            err,
            TransportError::Codec {
                what: "remote memory region",
                ..
            }
        ));
    }
}
