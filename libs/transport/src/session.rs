use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt as _, StreamExt as _};
use sha2::{Digest as _, Sha256};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Instant, timeout};
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::frame::FrameCodec;
use crate::tls::TlsMaterial;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub handshake: Duration,
    pub write: Duration,
    pub keepalive: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(30),
            write: Duration::from_secs(10),
            keepalive: Duration::from_secs(30),
        }
    }
}

/// The authenticated identity of the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Subject CN, or the first SAN DNS name if the subject has no CN.
    pub common_name: String,
    /// Lowercase hex SHA-256 over the peer's DER certificate.
    pub fingerprint: String,
}

impl PeerIdentity {
    /// The identity of a peer that presented no certificate.
    pub fn anonymous() -> Self {
        Self {
            common_name: String::new(),
            fingerprint: String::new(),
        }
    }

    fn from_der(cert: &[u8]) -> Result<Self, Error> {
        let (_, parsed) = x509_parser::parse_x509_certificate(cert)
            .map_err(|e| Error::Auth(format!("unparseable peer certificate: {e}")))?;

        let common_name = parsed
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(ToOwned::to_owned)
            .or_else(|| first_san_dns_name(&parsed))
            .unwrap_or_default();

        Ok(Self {
            common_name,
            fingerprint: hex::encode(Sha256::digest(cert)),
        })
    }
}

fn first_san_dns_name(cert: &x509_parser::certificate::X509Certificate<'_>) -> Option<String> {
    let san = cert.subject_alternative_name().ok().flatten()?;

    san.value.general_names.iter().find_map(|name| match name {
        x509_parser::extensions::GeneralName::DNSName(dns) => Some((*dns).to_owned()),
        _ => None,
    })
}

/// One established, framed transport session.
///
/// Split it into its two halves before starting the pumps; each half is
/// owned by exactly one task, so frames are never interleaved.
pub struct Session<S> {
    stream: S,
    peer: PeerIdentity,
    codec: FrameCodec,
    timeouts: Timeouts,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite,
{
    pub fn new(stream: S, peer: PeerIdentity, max_frame: u16, timeouts: Timeouts) -> Self {
        Self {
            stream,
            peer,
            codec: FrameCodec::new(max_frame),
            timeouts,
        }
    }

    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    pub fn split(self) -> (SessionReader<S>, SessionWriter<S>) {
        let (read, write) = tokio::io::split(self.stream);

        (
            SessionReader {
                framed: FramedRead::new(read, self.codec),
                dead_peer_after: self.timeouts.keepalive * 2,
            },
            SessionWriter {
                framed: FramedWrite::new(write, self.codec),
                write_timeout: self.timeouts.write,
                keepalive_interval: self.timeouts.keepalive,
                last_write: Instant::now(),
            },
        )
    }
}

pub struct SessionReader<S> {
    framed: FramedRead<ReadHalf<S>, FrameCodec>,
    dead_peer_after: Duration,
}

impl<S> SessionReader<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Returns the next datagram frame.
    ///
    /// Keepalives are consumed here and never surface. A peer that stays
    /// silent for two keepalive intervals is considered dead; that surfaces
    /// as an I/O error so the caller enters its reconnect path.
    pub async fn read_frame(&mut self) -> Result<Bytes, Error> {
        loop {
            let frame = timeout(self.dead_peer_after, self.framed.next())
                .await
                .map_err(|_| {
                    Error::Io(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no frames from peer within {:?}", self.dead_peer_after),
                    ))
                })?
                .ok_or(Error::Closed)??;

            if frame.is_empty() {
                tracing::trace!(target: "sssonector::transport", "Received keepalive");
                continue;
            }

            return Ok(frame);
        }
    }
}

pub struct SessionWriter<S> {
    framed: FramedWrite<WriteHalf<S>, FrameCodec>,
    write_timeout: Duration,
    keepalive_interval: Duration,
    last_write: Instant,
}

impl<S> SessionWriter<S>
where
    S: AsyncRead + AsyncWrite,
{
    pub async fn write_frame(&mut self, payload: Bytes) -> Result<(), Error> {
        timeout(self.write_timeout, self.framed.send(payload))
            .await
            .map_err(|_| Error::Timeout(self.write_timeout))??;

        self.last_write = Instant::now();

        Ok(())
    }

    /// Sends a keepalive if the outbound side has been idle for one interval.
    pub async fn maybe_send_keepalive(&mut self) -> Result<(), Error> {
        if self.last_write.elapsed() < self.keepalive_interval {
            return Ok(());
        }

        tracing::trace!(target: "sssonector::transport", "Sending keepalive");

        self.write_frame(Bytes::new()).await
    }

    /// Flushes pending frames and sends the TLS close-notify.
    pub async fn close(&mut self) -> Result<(), Error> {
        timeout(self.write_timeout, self.framed.close())
            .await
            .map_err(|_| Error::Timeout(self.write_timeout))??;

        Ok(())
    }
}

/// A bound TLS listener.
pub struct Listener {
    tcp: TcpListener,
    acceptor: TlsAcceptor,
    mutual_auth: bool,
    max_frame: u16,
    timeouts: Timeouts,
}

pub async fn listen(
    addr: SocketAddr,
    material: &TlsMaterial,
    max_frame: u16,
    timeouts: Timeouts,
) -> Result<Listener, Error> {
    let tcp = TcpListener::bind(addr).await?;
    let acceptor = TlsAcceptor::from(material.server_config()?);

    tracing::info!(%addr, "Listening for tunnel clients");

    Ok(Listener {
        tcp,
        acceptor,
        mutual_auth: material.settings().mutual_auth,
        max_frame,
        timeouts,
    })
}

impl Listener {
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.tcp.local_addr()?)
    }

    /// Accepts and authenticates one client.
    pub async fn accept(&self) -> Result<(Session<TlsStream<TcpStream>>, SocketAddr), Error> {
        let (stream, remote) = self.tcp.accept().await?;

        let stream = timeout(self.timeouts.handshake, self.acceptor.accept(stream))
            .await
            .map_err(|_| Error::Timeout(self.timeouts.handshake))?
            .map_err(Error::TlsHandshake)?;

        let peer = identity_of(stream.get_ref().1, self.mutual_auth)?;

        tracing::info!(
            %remote,
            peer = %peer.common_name,
            fingerprint = %peer.fingerprint,
            "Accepted tunnel client"
        );

        Ok((
            Session::new(
                TlsStream::from(stream),
                peer,
                self.max_frame,
                self.timeouts,
            ),
            remote,
        ))
    }
}

/// Dials `endpoint` (`host:port`) and completes the TLS handshake.
pub async fn connect(
    endpoint: &str,
    material: &TlsMaterial,
    max_frame: u16,
    timeouts: Timeouts,
) -> Result<Session<TlsStream<TcpStream>>, Error> {
    let host = endpoint
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(endpoint);

    let server_name = rustls_pki_types::ServerName::try_from(host.to_owned())
        .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

    let connector = TlsConnector::from(material.client_config()?);

    let stream = timeout(timeouts.handshake, TcpStream::connect(endpoint))
        .await
        .map_err(|_| Error::Timeout(timeouts.handshake))??;

    let stream = timeout(timeouts.handshake, connector.connect(server_name, stream))
        .await
        .map_err(|_| Error::Timeout(timeouts.handshake))?
        .map_err(Error::TlsHandshake)?;

    let peer = identity_of(stream.get_ref().1, true)?;

    tracing::info!(
        %endpoint,
        peer = %peer.common_name,
        fingerprint = %peer.fingerprint,
        "Connected to tunnel server"
    );

    Ok(Session::new(
        TlsStream::from(stream),
        peer,
        max_frame,
        timeouts,
    ))
}

fn identity_of<D>(
    connection: &rustls::ConnectionCommon<D>,
    require_identity: bool,
) -> Result<PeerIdentity, Error> {
    let Some(cert) = connection.peer_certificates().and_then(|certs| certs.first()) else {
        if require_identity {
            return Err(Error::Auth("peer presented no certificate".to_owned()));
        }

        return Ok(PeerIdentity::anonymous());
    };

    let peer = PeerIdentity::from_der(cert)?;

    if require_identity && peer.common_name.is_empty() {
        return Err(Error::Auth(
            "peer certificate has neither a CN nor a SAN".to_owned(),
        ));
    }

    Ok(peer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;

    fn pair(max_frame: u16, timeouts: Timeouts) -> (Session<tokio::io::DuplexStream>, Session<tokio::io::DuplexStream>) {
        let (a, b) = tokio::io::duplex(64 * 1024);

        (
            Session::new(a, PeerIdentity::anonymous(), max_frame, timeouts),
            Session::new(b, PeerIdentity::anonymous(), max_frame, timeouts),
        )
    }

    #[tokio::test]
    async fn frames_cross_the_session_in_order() {
        let (left, right) = pair(u16::MAX, Timeouts::default());
        let (_lr, mut lw) = left.split();
        let (mut rr, _rw) = right.split();

        for i in 0u8..20 {
            lw.write_frame(Bytes::from(vec![i; 64])).await.unwrap();
        }

        for i in 0u8..20 {
            assert_eq!(rr.read_frame().await.unwrap().as_ref(), &[i; 64]);
        }
    }

    #[tokio::test]
    async fn keepalives_are_invisible_to_the_reader() {
        let (left, right) = pair(u16::MAX, Timeouts::default());
        let (_lr, mut lw) = left.split();
        let (mut rr, _rw) = right.split();

        lw.write_frame(Bytes::new()).await.unwrap();
        lw.write_frame(Bytes::from_static(b"actual data")).await.unwrap();

        assert_eq!(rr.read_frame().await.unwrap().as_ref(), b"actual data");
    }

    #[tokio::test]
    async fn corrupt_length_header_kills_the_read() {
        let (mut raw, peer) = tokio::io::duplex(1024);
        let session = Session::new(peer, PeerIdentity::anonymous(), 1600, Timeouts::default());
        let (mut reader, _writer) = session.split();

        raw.write_all(&[0xff, 0xff]).await.unwrap();

        assert!(matches!(
            reader.read_frame().await,
            Err(Error::Corrupt { len: 0xffff, max: 1600 })
        ));
    }

    #[tokio::test]
    async fn closed_peer_surfaces_as_closed() {
        let (left, right) = pair(u16::MAX, Timeouts::default());
        let (_lr, mut lw) = left.split();
        let (mut rr, _rw) = right.split();

        lw.close().await.unwrap();
        drop(lw);
        drop(_lr);

        assert!(matches!(rr.read_frame().await, Err(Error::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_is_declared_dead() {
        let timeouts = Timeouts {
            keepalive: Duration::from_secs(5),
            ..Timeouts::default()
        };
        let (left, _right) = pair(u16::MAX, timeouts);
        let (mut lr, _lw) = left.split();

        let before = Instant::now();
        let result = lr.read_frame().await;

        assert!(matches!(result, Err(Error::Io(_))));
        assert!(before.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_is_sent_only_when_idle() {
        let timeouts = Timeouts {
            keepalive: Duration::from_secs(5),
            ..Timeouts::default()
        };
        let (left, right) = pair(u16::MAX, timeouts);
        let (_lr, mut lw) = left.split();
        let (mut rr, _rw) = right.split();

        // Fresh writer: nothing is due yet.
        lw.maybe_send_keepalive().await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        lw.maybe_send_keepalive().await.unwrap();
        lw.write_frame(Bytes::from_static(b"after idle")).await.unwrap();

        // The keepalive is skipped over; only the datagram surfaces.
        assert_eq!(rr.read_frame().await.unwrap().as_ref(), b"after idle");
    }
}
