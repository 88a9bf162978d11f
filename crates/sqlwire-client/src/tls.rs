//! TLS upgrade of the client channel.
//!
//! # Upgrade Flow
//!
//! 1. Server offers `CLIENT_SSL` in its challenge
//! 2. Client sends an `SSL_REQUEST` frame carrying the first 32 bytes of
//!    its handshake response: flags with `CLIENT_SSL`, max frame size,
//!    charset and reserved zeros
//! 3. Client runs the TLS handshake on the same socket
//! 4. The handshake response and every later frame travel encrypted
//!
//! # Feature Flag
//!
//! The rustls implementation is behind the `tls` feature:
//!
//! ```toml
//! [dependencies]
//! sqlwire-client = { version = "0.1", features = ["tls"] }
//! ```
//!
//! Without it, any upgrade fails with a `ConnectionError` of kind `Ssl`.

use std::fmt;
use std::io::{Read, Write};

use sqlwire_core::{AuthError, AuthErrorKind, ConnectionError, ConnectionErrorKind, Error, Result};

use crate::config::{SslMode, TlsConfig};
use crate::protocol::{PacketWriter, capabilities};
use crate::transport::Transport;

/// Build the `SSL_REQUEST` payload (32 bytes).
pub fn build_ssl_request_payload(client_caps: u32, max_frame_size: u32, charset: u8) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(32);
    writer.write_u32_le(client_caps | capabilities::CLIENT_SSL);
    writer.write_u32_le(max_frame_size);
    writer.write_u8(charset);
    writer.write_zeros(23);
    writer.into_bytes()
}

pub const fn server_supports_ssl(server_caps: u32) -> bool {
    server_caps & capabilities::CLIENT_SSL != 0
}

/// Decide whether to upgrade.
///
/// A mode that requires SSL against a server without it fails with
/// `AuthErrorKind::SslUnavailable`; nothing has been sent at that point.
pub fn validate_ssl_mode(ssl_mode: SslMode, server_caps: u32) -> Result<bool> {
    let server_supports = server_supports_ssl(server_caps);
    match ssl_mode {
        SslMode::Disable => Ok(false),
        SslMode::Preferred => Ok(server_supports),
        SslMode::Required | SslMode::VerifyCa | SslMode::VerifyIdentity => {
            if server_supports {
                Ok(true)
            } else {
                Err(AuthError::new(
                    AuthErrorKind::SslUnavailable,
                    format!("SSL mode {ssl_mode:?} requires SSL but the server does not offer it"),
                )
                .at_stage("ssl")
                .into())
            }
        }
    }
}

/// Check that the certificate material fits the SSL mode.
pub fn validate_tls_config(ssl_mode: SslMode, tls_config: &TlsConfig) -> Result<()> {
    if !matches!(ssl_mode, SslMode::VerifyCa | SslMode::VerifyIdentity) {
        return Ok(());
    }
    if tls_config.ca_cert_path.is_none() && !tls_config.danger_skip_verify {
        return Err(tls_error(
            "verifying modes need a CA certificate (or danger_skip_verify)",
        ));
    }
    if tls_config.client_cert_path.is_some() != tls_config.client_key_path.is_some() {
        return Err(tls_error(
            "client certificate and client key must be configured together",
        ));
    }
    Ok(())
}

fn tls_error(message: impl Into<String>) -> Error {
    Error::Connection(ConnectionError::new(ConnectionErrorKind::Ssl, message))
}

/// Wrap `stream` in TLS and return it as a secure transport.
#[cfg(feature = "tls")]
pub fn upgrade<S>(
    stream: S,
    server_name: &str,
    tls_config: &TlsConfig,
    ssl_mode: SslMode,
) -> Result<Box<dyn Transport>>
where
    S: Read + Write + Send + fmt::Debug + 'static,
{
    validate_tls_config(ssl_mode, tls_config)?;
    let stream = TlsStream::new(stream, tls_config, server_name, ssl_mode)?;
    tracing::debug!(
        protocol = ?stream.protocol_version(),
        server_name,
        "TLS handshake complete"
    );
    Ok(Box::new(stream))
}

#[cfg(not(feature = "tls"))]
pub fn upgrade<S>(
    _stream: S,
    _server_name: &str,
    _tls_config: &TlsConfig,
    _ssl_mode: SslMode,
) -> Result<Box<dyn Transport>>
where
    S: Read + Write + Send + fmt::Debug + 'static,
{
    Err(tls_error(
        "TLS support requires the 'tls' feature of sqlwire-client",
    ))
}

#[cfg(feature = "tls")]
pub use rustls_stream::TlsStream;

#[cfg(feature = "tls")]
mod rustls_stream {
    use std::fmt;
    use std::fs::File;
    use std::io::{self, BufReader, Read, Write};
    use std::path::Path;
    use std::sync::Arc;

    use rustls::client::WantsClientCert;
    use rustls::pki_types::CertificateDer;
    use rustls::{ClientConfig, ClientConnection, ConfigBuilder, RootCertStore};
    use sqlwire_core::Result;

    use super::tls_error;
    use crate::config::{SslMode, TlsConfig};
    use crate::transport::Transport;

    /// A channel encrypted with rustls.
    pub struct TlsStream<S: Read + Write> {
        conn: ClientConnection,
        stream: S,
    }

    impl<S: Read + Write> fmt::Debug for TlsStream<S> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("TlsStream")
                .field("protocol_version", &self.conn.protocol_version())
                .field("is_handshaking", &self.conn.is_handshaking())
                .finish_non_exhaustive()
        }
    }

    impl<S: Read + Write> TlsStream<S> {
        /// Run the TLS handshake over `stream`.
        pub fn new(
            mut stream: S,
            tls_config: &TlsConfig,
            server_name: &str,
            ssl_mode: SslMode,
        ) -> Result<Self> {
            let config = build_client_config(tls_config, ssl_mode)?;
            let sni = tls_config.server_name.as_deref().unwrap_or(server_name);
            let name = sni
                .to_string()
                .try_into()
                .map_err(|e| tls_error(format!("invalid TLS server name '{sni}': {e}")))?;

            let mut conn = ClientConnection::new(Arc::new(config), name)
                .map_err(|e| tls_error(format!("failed to create TLS session: {e}")))?;

            while conn.is_handshaking() {
                while conn.wants_write() {
                    conn.write_tls(&mut stream)
                        .map_err(|e| tls_error(format!("TLS handshake write failed: {e}")))?;
                }
                if conn.wants_read() {
                    let n = conn
                        .read_tls(&mut stream)
                        .map_err(|e| tls_error(format!("TLS handshake read failed: {e}")))?;
                    if n == 0 {
                        return Err(tls_error("server closed the channel during TLS handshake"));
                    }
                    conn.process_new_packets()
                        .map_err(|e| tls_error(format!("TLS handshake failed: {e}")))?;
                }
            }

            Ok(Self { conn, stream })
        }

        pub fn protocol_version(&self) -> Option<rustls::ProtocolVersion> {
            self.conn.protocol_version()
        }
    }

    impl<S: Read + Write> Read for TlsStream<S> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            loop {
                match self.conn.reader().read(buf) {
                    Ok(n) if n > 0 => return Ok(n),
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e),
                }
                if !self.conn.wants_read() {
                    return Ok(0);
                }
                if self.conn.read_tls(&mut self.stream)? == 0 {
                    return Ok(0);
                }
                self.conn
                    .process_new_packets()
                    .map_err(|e| io::Error::other(format!("TLS error: {e}")))?;
            }
        }
    }

    impl<S: Read + Write> Write for TlsStream<S> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = self.conn.writer().write(buf)?;
            while self.conn.wants_write() {
                self.conn.write_tls(&mut self.stream)?;
            }
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.conn.writer().flush()?;
            while self.conn.wants_write() {
                self.conn.write_tls(&mut self.stream)?;
            }
            self.stream.flush()
        }
    }

    impl<S> Transport for TlsStream<S>
    where
        S: Read + Write + Send + fmt::Debug + 'static,
    {
        fn is_secure(&self) -> bool {
            true
        }

        fn upgrade_tls(
            self: Box<Self>,
            _server_name: &str,
            _tls_config: &TlsConfig,
            _ssl_mode: SslMode,
        ) -> Result<Box<dyn Transport>> {
            Err(tls_error("channel is already encrypted"))
        }
    }

    fn build_client_config(tls_config: &TlsConfig, ssl_mode: SslMode) -> Result<ClientConfig> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
            .map_err(|e| tls_error(format!("failed to set TLS versions: {e}")))?;

        if ssl_mode == SslMode::Disable {
            return Err(tls_error("TLS upgrade requested with SSL disabled"));
        }
        if tls_config.danger_skip_verify {
            return Ok(builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(danger::AcceptAnyCertificate))
                .with_no_client_auth());
        }

        let mut roots = RootCertStore::empty();
        match &tls_config.ca_cert_path {
            Some(ca_path) => {
                for cert in load_certs(ca_path)? {
                    roots
                        .add(cert)
                        .map_err(|e| tls_error(format!("failed to add CA certificate: {e}")))?;
                }
            }
            None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
        }

        with_client_auth(builder.with_root_certificates(roots), tls_config)
    }

    fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
        let file = File::open(path)
            .map_err(|e| tls_error(format!("failed to open '{}': {e}", path.display())))?;
        let certs = rustls_pemfile::certs(&mut BufReader::new(file))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| tls_error(format!("failed to parse '{}': {e}", path.display())))?;
        if certs.is_empty() {
            return Err(tls_error(format!(
                "no certificates found in '{}'",
                path.display()
            )));
        }
        Ok(certs)
    }

    fn with_client_auth(
        builder: ConfigBuilder<ClientConfig, WantsClientCert>,
        tls_config: &TlsConfig,
    ) -> Result<ClientConfig> {
        let (Some(cert_path), Some(key_path)) =
            (&tls_config.client_cert_path, &tls_config.client_key_path)
        else {
            return Ok(builder.with_no_client_auth());
        };

        let certs = load_certs(cert_path)?;
        let key_file = File::open(key_path)
            .map_err(|e| tls_error(format!("failed to open '{}': {e}", key_path.display())))?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
            .map_err(|e| tls_error(format!("failed to parse client key: {e}")))?
            .ok_or_else(|| tls_error(format!("no private key in '{}'", key_path.display())))?;

        builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| tls_error(format!("failed to configure client certificate: {e}")))
    }

    mod danger {
        use rustls::client::danger::{
            HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
        };
        use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
        use rustls::{DigitallySignedStruct, Error, SignatureScheme};

        /// Accepts every server certificate.
        #[derive(Debug)]
        pub(super) struct AcceptAnyCertificate;

        impl ServerCertVerifier for AcceptAnyCertificate {
            fn verify_server_cert(
                &self,
                _end_entity: &CertificateDer<'_>,
                _intermediates: &[CertificateDer<'_>],
                _server_name: &ServerName<'_>,
                _ocsp_response: &[u8],
                _now: UnixTime,
            ) -> Result<ServerCertVerified, Error> {
                Ok(ServerCertVerified::assertion())
            }

            fn verify_tls12_signature(
                &self,
                _message: &[u8],
                _cert: &CertificateDer<'_>,
                _dss: &DigitallySignedStruct,
            ) -> Result<HandshakeSignatureValid, Error> {
                Ok(HandshakeSignatureValid::assertion())
            }

            fn verify_tls13_signature(
                &self,
                _message: &[u8],
                _cert: &CertificateDer<'_>,
                _dss: &DigitallySignedStruct,
            ) -> Result<HandshakeSignatureValid, Error> {
                Ok(HandshakeSignatureValid::assertion())
            }

            fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
                rustls::crypto::ring::default_provider()
                    .signature_verification_algorithms
                    .supported_schemes()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::charset;

    #[test]
    fn test_build_ssl_request_payload() {
        let payload = build_ssl_request_payload(
            capabilities::BASE_CLIENT_FLAGS,
            16 * 1024 * 1024,
            charset::UTF8MB4_0900_AI_CI,
        );
        assert_eq!(payload.len(), 32);
        let caps = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        assert_ne!(caps & capabilities::CLIENT_SSL, 0);
        assert_eq!(&payload[4..8], &(16_u32 * 1024 * 1024).to_le_bytes());
        assert_eq!(payload[8], charset::UTF8MB4_0900_AI_CI);
        assert!(payload[9..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_server_supports_ssl() {
        assert!(server_supports_ssl(capabilities::CLIENT_SSL));
        assert!(!server_supports_ssl(capabilities::CLIENT_PROTOCOL_41));
    }

    #[test]
    fn test_validate_ssl_mode() {
        assert!(!validate_ssl_mode(SslMode::Disable, capabilities::CLIENT_SSL).unwrap());
        assert!(!validate_ssl_mode(SslMode::Preferred, 0).unwrap());
        assert!(validate_ssl_mode(SslMode::Preferred, capabilities::CLIENT_SSL).unwrap());
        assert!(validate_ssl_mode(SslMode::VerifyIdentity, capabilities::CLIENT_SSL).unwrap());
    }

    #[test]
    fn test_required_ssl_unavailable() {
        for mode in [SslMode::Required, SslMode::VerifyCa, SslMode::VerifyIdentity] {
            let err = validate_ssl_mode(mode, 0).unwrap_err();
            assert_eq!(err.auth_kind(), Some(AuthErrorKind::SslUnavailable));
        }
    }

    #[test]
    fn test_validate_tls_config() {
        assert!(validate_tls_config(SslMode::Required, &TlsConfig::new()).is_ok());
        assert!(validate_tls_config(SslMode::VerifyCa, &TlsConfig::new()).is_err());
        assert!(
            validate_tls_config(SslMode::VerifyCa, &TlsConfig::new().ca_cert("/ca.pem")).is_ok()
        );
        assert!(
            validate_tls_config(SslMode::VerifyCa, &TlsConfig::new().skip_verify(true)).is_ok()
        );

        let half_mtls = TlsConfig::new().ca_cert("/ca.pem").client_cert("/client.pem");
        let err = validate_tls_config(SslMode::VerifyIdentity, &half_mtls).unwrap_err();
        assert_eq!(err.connection_kind(), Some(ConnectionErrorKind::Ssl));
    }

    #[cfg(not(feature = "tls"))]
    #[test]
    fn test_upgrade_without_feature() {
        let err = upgrade(std::io::empty(), "db", &TlsConfig::new(), SslMode::Required)
            .unwrap_err();
        assert_eq!(err.connection_kind(), Some(ConnectionErrorKind::Ssl));
    }
}
