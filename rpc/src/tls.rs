//! TLS as an inner security layer.
//!
//! This module does not implement TLS; it drives rustls over any byte
//! stream so it can sit underneath [`crate::CredentialSecurity`] (or be
//! installed on its own, which is also how a client talks to a chained
//! server).

use std::any::Any;
use std::fs;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use peerlink_core::PeerConn;
use rustls::pki_types::ServerName;
use rustls::server::WebPkiClientVerifier;
use rustls::{
    ClientConfig, ClientConnection, Connection, ProtocolVersion, RootCertStore, ServerConfig,
    ServerConnection,
};
use rustls_pemfile::{certs, private_key};

use crate::auth::AuthInfo;
use crate::error::HandshakeError;
use crate::security::{ProtocolInfo, Session, TransportSecurity};

/// Synchronous TLS wrapper around an arbitrary byte stream.
pub struct TlsStream<S> {
    socket: S,
    tls: Connection,
}

impl<S: Read + Write> TlsStream<S> {
    /// Create a new TLS stream from a server connection and complete the
    /// handshake
    pub fn from_server(socket: S, tls: ServerConnection) -> Result<Self, HandshakeError> {
        let mut stream = Self {
            socket,
            tls: Connection::Server(tls),
        };
        stream.complete_handshake()?;
        Ok(stream)
    }

    /// Create a new TLS stream from a client connection and complete the
    /// handshake
    pub fn from_client(socket: S, tls: ClientConnection) -> Result<Self, HandshakeError> {
        let mut stream = Self {
            socket,
            tls: Connection::Client(tls),
        };
        stream.complete_handshake()?;
        Ok(stream)
    }

    /// Complete the TLS handshake
    fn complete_handshake(&mut self) -> Result<(), HandshakeError> {
        while self.tls.is_handshaking() {
            if self.tls.wants_write() {
                self.tls.write_tls(&mut self.socket)?;
            }
            if self.tls.wants_read() {
                if self.tls.read_tls(&mut self.socket)? == 0 {
                    return Err(HandshakeError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed the stream mid-handshake",
                    )));
                }
                self.tls.process_new_packets()?;
            }
        }
        Ok(())
    }

    fn negotiated_auth(&self) -> TlsAuthInfo {
        TlsAuthInfo {
            protocol_version: self.tls.protocol_version(),
            peer_certificate_presented: self
                .tls
                .peer_certificates()
                .is_some_and(|chain| !chain.is_empty()),
        }
    }
}

impl<S: Read + Write> Read for TlsStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            // rustls reports "no plaintext buffered yet" as WouldBlock;
            // on a blocking stream that means: pull more TLS records.
            match self.tls.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(err) if err.kind() != io::ErrorKind::WouldBlock => return Err(err),
                Err(_) => {}
            }

            if !self.tls.wants_read() {
                return Ok(0); // EOF
            }

            if self.tls.read_tls(&mut self.socket)? == 0 {
                return Ok(0); // Clean shutdown
            }
            // A processed record may carry no plaintext at all (session
            // tickets, key updates); keep pulling until some arrives or
            // the peer closes.
            self.tls
                .process_new_packets()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        }
    }
}

impl<S: Read + Write> Write for TlsStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.tls.writer().write(buf)?;
        while self.tls.wants_write() {
            self.tls.write_tls(&mut self.socket)?;
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.tls.writer().flush()?;
        while self.tls.wants_write() {
            self.tls.write_tls(&mut self.socket)?;
        }
        self.socket.flush()
    }
}

/// Authentication record produced by the TLS layer.
pub struct TlsAuthInfo {
    protocol_version: Option<ProtocolVersion>,
    peer_certificate_presented: bool,
}

impl TlsAuthInfo {
    /// The negotiated protocol version.
    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.protocol_version
    }

    /// Whether the peer presented a certificate (for servers: whether a
    /// client certificate was verified).
    pub fn peer_certificate_presented(&self) -> bool {
        self.peer_certificate_presented
    }
}

impl AuthInfo for TlsAuthInfo {
    fn auth_type(&self) -> &str {
        "tls"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// TLS transport security over Unix (or any) stream connections,
/// parameterized by externally constructed rustls configuration.
///
/// Clones share the same `Arc`ed configuration and no per-handshake
/// state.
#[derive(Clone)]
pub struct TlsSecurity {
    server_config: Option<Arc<ServerConfig>>,
    client_config: Option<Arc<ClientConfig>>,
}

impl TlsSecurity {
    /// Server-side TLS with an externally built configuration.
    pub fn from_server_config(config: Arc<ServerConfig>) -> Self {
        Self {
            server_config: Some(config),
            client_config: None,
        }
    }

    /// Client-side TLS with an externally built configuration.
    pub fn from_client_config(config: Arc<ClientConfig>) -> Self {
        Self {
            server_config: None,
            client_config: Some(config),
        }
    }
}

impl TransportSecurity for TlsSecurity {
    fn server_handshake(&self, conn: PeerConn) -> Result<Session, HandshakeError> {
        let config = self
            .server_config
            .clone()
            .ok_or(HandshakeError::NotConfigured)?;

        let tls = ServerConnection::new(config)?;
        let stream = TlsStream::from_server(conn, tls)?;
        let auth = stream.negotiated_auth();
        tracing::debug!(
            "TLS server handshake complete, version {:?}",
            auth.protocol_version
        );

        Ok(Session::new(Box::new(stream), Arc::new(auth)))
    }

    fn client_handshake(
        &self,
        conn: PeerConn,
        server_name: &str,
    ) -> Result<Session, HandshakeError> {
        let config = self
            .client_config
            .clone()
            .ok_or(HandshakeError::NotConfigured)?;

        let name = ServerName::try_from(server_name.to_owned())
            .map_err(|_| HandshakeError::Other(anyhow!("invalid server name {server_name:?}")))?;
        let tls = ClientConnection::new(config, name)?;
        let stream = TlsStream::from_client(conn, tls)?;
        let auth = stream.negotiated_auth();

        Ok(Session::new(Box::new(stream), Arc::new(auth)))
    }

    fn protocol_info(&self) -> ProtocolInfo {
        ProtocolInfo::new("tls")
    }
}

/// Load a server configuration from PEM files, with client certificate
/// verification when a CA path is given (mutual TLS).
pub fn load_server_config(
    cert_path: &Path,
    key_path: &Path,
    client_ca_path: Option<&Path>,
) -> Result<Arc<ServerConfig>> {
    // Install default crypto provider for rustls if not already installed
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let cert_pem = fs::read(cert_path)
        .with_context(|| format!("Failed to read server certificate from {cert_path:?}"))?;
    let key_pem = fs::read(key_path)
        .with_context(|| format!("Failed to read server key from {key_path:?}"))?;

    let cert_chain = certs(&mut BufReader::new(&*cert_pem))
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse server certificate")?;
    let private_key = private_key(&mut BufReader::new(&*key_pem))
        .context("Failed to parse server private key")?
        .ok_or_else(|| anyhow!("No private key found in {key_path:?}"))?;

    let builder = match client_ca_path {
        Some(ca_path) => {
            let root_store = read_root_store(ca_path)?;
            let verifier = WebPkiClientVerifier::builder(Arc::new(root_store))
                .build()
                .context("Failed to configure client certificate verification")?;
            ServerConfig::builder().with_client_cert_verifier(verifier)
        }
        None => ServerConfig::builder().with_no_client_auth(),
    };

    let config = builder
        .with_single_cert(cert_chain, private_key)
        .context("Failed to configure server certificate")?;
    Ok(Arc::new(config))
}

/// Load a client configuration from PEM files, presenting a client
/// certificate when an identity pair is given.
pub fn load_client_config(
    ca_path: &Path,
    identity: Option<(&Path, &Path)>,
) -> Result<Arc<ClientConfig>> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let root_store = read_root_store(ca_path)?;
    let builder = ClientConfig::builder().with_root_certificates(root_store);

    let config = match identity {
        Some((cert_path, key_path)) => {
            let cert_pem = fs::read(cert_path)
                .with_context(|| format!("Failed to read client certificate from {cert_path:?}"))?;
            let key_pem = fs::read(key_path)
                .with_context(|| format!("Failed to read client key from {key_path:?}"))?;

            let cert_chain = certs(&mut BufReader::new(&*cert_pem))
                .collect::<Result<Vec<_>, _>>()
                .context("Failed to parse client certificate")?;
            let private_key = private_key(&mut BufReader::new(&*key_pem))
                .context("Failed to parse client private key")?
                .ok_or_else(|| anyhow!("No private key found in {key_path:?}"))?;

            builder
                .with_client_auth_cert(cert_chain, private_key)
                .context("Failed to configure client authentication")?
        }
        None => builder.with_no_client_auth(),
    };

    Ok(Arc::new(config))
}

fn read_root_store(ca_path: &Path) -> Result<RootCertStore> {
    let ca_pem = fs::read(ca_path)
        .with_context(|| format!("Failed to read root CA certificate from {ca_path:?}"))?;
    let ca_certs = certs(&mut BufReader::new(&*ca_pem))
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse root CA certificate")?;

    let mut root_store = RootCertStore::empty();
    root_store.add_parsable_certificates(ca_certs);

    if root_store.is_empty() {
        return Err(anyhow!("No valid CA certificates found in {ca_path:?}"));
    }

    Ok(root_store)
}
