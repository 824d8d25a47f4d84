//! RTMP simple handshake
//!
//! ```text
//! Client                                   Server
//!   |------- C0 + C1 ---------------------->|
//!   |<------ S0 + S1 + S2 ------------------|
//!   |------- C2 (echo of S1) -------------->|
//! ```
//!
//! C1/S1 carry a 4-byte time, 4 zero bytes and 1528 filler bytes. C2/S2 echo
//! the peer's packet with our own time in bytes 4..8. Echoes are not
//! verified since several servers do not echo faithfully.
//!
//! [`Handshake`] is a sans-IO state machine; [`client_handshake`] and
//! [`server_handshake`] drive it over any async stream.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{HandshakeError, Result};
use crate::protocol::constants::{HANDSHAKE_SIZE, RTMP_VERSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Nothing sent yet
    Start,
    /// Client sent C0C1 and waits for S0S1S2, server waits for C0C1
    AwaitingPeer,
    /// Server sent S0S1S2 and waits for C2
    AwaitingEcho,
    Done,
}

#[derive(Debug)]
pub struct Handshake {
    role: HandshakeRole,
    phase: Phase,
    epoch: Instant,
}

impl Handshake {
    pub fn new(role: HandshakeRole) -> Self {
        Self {
            role,
            phase: Phase::Start,
            epoch: Instant::now(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    /// Bytes the peer must send before [`Handshake::receive`] can progress
    pub fn bytes_needed(&self) -> usize {
        match (self.phase, self.role) {
            (Phase::AwaitingPeer, HandshakeRole::Client) => 1 + 2 * HANDSHAKE_SIZE,
            (Phase::AwaitingPeer, HandshakeRole::Server) => 1 + HANDSHAKE_SIZE,
            (Phase::AwaitingEcho, _) => HANDSHAKE_SIZE,
            _ => 0,
        }
    }

    /// Start the exchange, returning C0C1 for a client
    pub fn start(&mut self) -> Option<Bytes> {
        if self.phase != Phase::Start {
            return None;
        }
        self.phase = Phase::AwaitingPeer;
        match self.role {
            HandshakeRole::Client => {
                let mut buf = BytesMut::with_capacity(1 + HANDSHAKE_SIZE);
                buf.put_u8(RTMP_VERSION);
                self.put_packet(&mut buf);
                Some(buf.freeze())
            }
            HandshakeRole::Server => None,
        }
    }

    /// Consume exactly [`Handshake::bytes_needed`] bytes from the peer
    ///
    /// Returns the bytes to send back, if any.
    pub fn receive(&mut self, data: &[u8]) -> Result<Option<Bytes>> {
        if data.len() < self.bytes_needed() || self.bytes_needed() == 0 {
            return Ok(None);
        }

        match (self.phase, self.role) {
            (Phase::AwaitingPeer, HandshakeRole::Client) => {
                check_version(data[0])?;
                let s1 = &data[1..1 + HANDSHAKE_SIZE];
                self.phase = Phase::Done;
                Ok(Some(self.echo(s1)))
            }
            (Phase::AwaitingPeer, HandshakeRole::Server) => {
                check_version(data[0])?;
                let c1 = &data[1..1 + HANDSHAKE_SIZE];
                let mut buf = BytesMut::with_capacity(1 + 2 * HANDSHAKE_SIZE);
                buf.put_u8(RTMP_VERSION);
                self.put_packet(&mut buf);
                buf.put_slice(&self.echo(c1));
                self.phase = Phase::AwaitingEcho;
                Ok(Some(buf.freeze()))
            }
            (Phase::AwaitingEcho, _) => {
                self.phase = Phase::Done;
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    fn uptime_ms(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }

    fn put_packet(&self, buf: &mut BytesMut) {
        let time = self.uptime_ms();
        buf.put_u32(time);
        buf.put_u32(0);

        // xorshift filler; the handshake carries no secret
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u64)
            .unwrap_or(0);
        let mut state = (nanos << 32 | time as u64) | 1;
        let mut written = 8;
        while written < HANDSHAKE_SIZE {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let bytes = state.to_be_bytes();
            let n = (HANDSHAKE_SIZE - written).min(8);
            buf.put_slice(&bytes[..n]);
            written += n;
        }
    }

    fn echo(&self, peer: &[u8]) -> Bytes {
        let mut buf = BytesMut::from(peer);
        buf[4..8].copy_from_slice(&self.uptime_ms().to_be_bytes());
        buf.freeze()
    }
}

fn check_version(version: u8) -> Result<()> {
    // Some encoders send values above 3; anything below is not RTMP
    if version < RTMP_VERSION {
        return Err(HandshakeError::InvalidVersion(version).into());
    }
    Ok(())
}

async fn read_exact_or_interrupted<S>(stream: &mut S, buf: &mut [u8]) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(HandshakeError::Interrupted.into())
        }
        Err(e) => Err(e.into()),
    }
}

/// Run the client side of the handshake over `stream`
pub async fn client_handshake<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut handshake = Handshake::new(HandshakeRole::Client);
    if let Some(c0c1) = handshake.start() {
        stream.write_all(&c0c1).await?;
        stream.flush().await?;
    }

    let mut response = vec![0u8; handshake.bytes_needed()];
    read_exact_or_interrupted(stream, &mut response).await?;
    if let Some(c2) = handshake.receive(&response)? {
        stream.write_all(&c2).await?;
        stream.flush().await?;
    }

    tracing::debug!("RTMP handshake complete");
    Ok(())
}

/// Run the server side of the handshake over `stream`
pub async fn server_handshake<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut handshake = Handshake::new(HandshakeRole::Server);
    handshake.start();

    while !handshake.is_done() {
        let mut data = vec![0u8; handshake.bytes_needed()];
        read_exact_or_interrupted(stream, &mut data).await?;
        if let Some(reply) = handshake.receive(&data)? {
            stream.write_all(&reply).await?;
            stream.flush().await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_state_machine_exchange() {
        let mut client = Handshake::new(HandshakeRole::Client);
        let mut server = Handshake::new(HandshakeRole::Server);

        assert!(server.start().is_none());
        assert_eq!(server.bytes_needed(), 1 + HANDSHAKE_SIZE);

        let c0c1 = client.start().unwrap();
        assert_eq!(c0c1.len(), 1 + HANDSHAKE_SIZE);
        assert_eq!(c0c1[0], RTMP_VERSION);
        assert_eq!(&c0c1[5..9], &[0, 0, 0, 0]);

        let s0s1s2 = server.receive(&c0c1).unwrap().unwrap();
        assert_eq!(s0s1s2.len(), 1 + 2 * HANDSHAKE_SIZE);
        // S2 echoes the filler of C1
        assert_eq!(&s0s1s2[1 + HANDSHAKE_SIZE + 8..], &c0c1[9..]);

        let c2 = client.receive(&s0s1s2).unwrap().unwrap();
        assert_eq!(c2.len(), HANDSHAKE_SIZE);
        assert_eq!(&c2[8..], &s0s1s2[9..1 + HANDSHAKE_SIZE]);
        assert!(client.is_done());

        assert!(server.receive(&c2).unwrap().is_none());
        assert!(server.is_done());
    }

    #[test]
    fn test_start_twice() {
        let mut client = Handshake::new(HandshakeRole::Client);
        assert!(client.start().is_some());
        assert!(client.start().is_none());
    }

    #[test]
    fn test_short_input_waits() {
        let mut client = Handshake::new(HandshakeRole::Client);
        client.start();
        assert!(client.receive(&[RTMP_VERSION; 100]).unwrap().is_none());
        assert!(!client.is_done());
    }

    #[test]
    fn test_invalid_version() {
        let mut server = Handshake::new(HandshakeRole::Server);
        server.start();
        let mut c0c1 = vec![0u8; 1 + HANDSHAKE_SIZE];
        c0c1[0] = 2;
        let err = server.receive(&c0c1).unwrap_err();
        assert!(matches!(
            err,
            Error::Handshake(HandshakeError::InvalidVersion(2))
        ));
    }

    #[test]
    fn test_higher_version_accepted() {
        let mut server = Handshake::new(HandshakeRole::Server);
        server.start();
        let mut c0c1 = vec![0u8; 1 + HANDSHAKE_SIZE];
        c0c1[0] = 31;
        assert!(server.receive(&c0c1).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_handshake_over_stream() {
        let (mut client, mut server) = tokio::io::duplex(8192);

        let server_task = tokio::spawn(async move { server_handshake(&mut server).await });
        client_handshake(&mut client).await.unwrap();
        server_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_peer_closes_mid_handshake() {
        let (mut client, server) = tokio::io::duplex(8192);
        drop(server);

        let err = client_handshake(&mut client).await.unwrap_err();
        assert!(err.is_transport());
    }
}
