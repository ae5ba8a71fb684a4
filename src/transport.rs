//! Transport layer abstraction for MQTT connections.
//!
//! This module provides a unified interface for different transport types:
//! - TCP (plain)
//! - TLS (secure)

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

#[cfg(feature = "tls")]
use tokio_rustls::client::TlsStream;

/// Transport type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// Plain TCP connection.
    Tcp,
    /// TLS encrypted connection.
    #[cfg(feature = "tls")]
    Tls,
}

impl TransportType {
    /// Parse transport type from URL scheme.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_lowercase().as_str() {
            "tcp" | "mqtt" | "" => Some(TransportType::Tcp),
            #[cfg(feature = "tls")]
            "tls" | "mqtts" | "ssl" => Some(TransportType::Tls),
            _ => None,
        }
    }

    /// Get default port for this transport type.
    pub fn default_port(&self) -> u16 {
        match self {
            TransportType::Tcp => 1883,
            #[cfg(feature = "tls")]
            TransportType::Tls => 8883,
        }
    }
}

/// A unified transport that wraps different connection types.
pub enum Transport {
    /// Plain TCP stream.
    Tcp(TcpStream),
    /// TLS stream.
    #[cfg(feature = "tls")]
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

#[cfg(feature = "tls")]
pub mod tls {
    //! TLS configuration and utilities.

    use std::io;
    use std::sync::Arc;
    use tokio::net::TcpStream;
    use tokio_rustls::rustls::{ClientConfig, RootCertStore};
    use tokio_rustls::TlsConnector;

    /// TLS configuration for client connections.
    #[derive(Clone)]
    pub struct TlsConfig {
        /// The TLS connector.
        pub connector: TlsConnector,
    }

    impl TlsConfig {
        /// Create a new TLS config with default settings.
        pub fn new() -> io::Result<Self> {
            let root_store = RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            };

            let config = ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth();

            Ok(Self {
                connector: TlsConnector::from(Arc::new(config)),
            })
        }

        /// Create a TLS config that skips certificate verification.
        /// **WARNING: This is insecure and should only be used for testing!**
        pub fn insecure() -> Self {
            use tokio_rustls::rustls::client::danger::{
                HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
            };
            use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
            use tokio_rustls::rustls::{DigitallySignedStruct, SignatureScheme};

            #[derive(Debug)]
            struct InsecureVerifier;

            impl ServerCertVerifier for InsecureVerifier {
                fn verify_server_cert(
                    &self,
                    _end_entity: &CertificateDer<'_>,
                    _intermediates: &[CertificateDer<'_>],
                    _server_name: &ServerName<'_>,
                    _ocsp_response: &[u8],
                    _now: UnixTime,
                ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
                    Ok(ServerCertVerified::assertion())
                }

                fn verify_tls12_signature(
                    &self,
                    _message: &[u8],
                    _cert: &CertificateDer<'_>,
                    _dss: &DigitallySignedStruct,
                ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
                    Ok(HandshakeSignatureValid::assertion())
                }

                fn verify_tls13_signature(
                    &self,
                    _message: &[u8],
                    _cert: &CertificateDer<'_>,
                    _dss: &DigitallySignedStruct,
                ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
                    Ok(HandshakeSignatureValid::assertion())
                }

                fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
                    vec![
                        SignatureScheme::RSA_PKCS1_SHA256,
                        SignatureScheme::RSA_PKCS1_SHA384,
                        SignatureScheme::RSA_PKCS1_SHA512,
                        SignatureScheme::ECDSA_NISTP256_SHA256,
                        SignatureScheme::ECDSA_NISTP384_SHA384,
                        SignatureScheme::RSA_PSS_SHA256,
                        SignatureScheme::RSA_PSS_SHA384,
                        SignatureScheme::RSA_PSS_SHA512,
                        SignatureScheme::ED25519,
                    ]
                }
            }

            let config = ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
                .with_no_client_auth();

            Self {
                connector: TlsConnector::from(Arc::new(config)),
            }
        }

        /// Connect to a TLS server.
        pub async fn connect(
            &self,
            stream: TcpStream,
            domain: &str,
        ) -> io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
            use tokio_rustls::rustls::pki_types::ServerName;

            let domain = ServerName::try_from(domain.to_string())
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid domain name"))?;

            self.connector.connect(domain, stream).await
        }
    }

    impl Default for TlsConfig {
        fn default() -> Self {
            Self::new().expect("failed to create default TLS config")
        }
    }

    /// Server-side TLS configuration for the broker's TLS-wrapped listener.
    /// Certificate/key loading is a thin helper, not the subject of detailed
    /// design; callers needing mutual TLS or SNI-based selection should build
    /// their own `rustls::ServerConfig` and construct an acceptor directly.
    #[derive(Clone)]
    pub struct ServerTlsConfig {
        acceptor: tokio_rustls::TlsAcceptor,
    }

    impl ServerTlsConfig {
        /// Load a certificate chain and private key from PEM files.
        pub fn from_pem_files(cert_path: &str, key_path: &str) -> io::Result<Self> {
            use tokio_rustls::rustls::ServerConfig;

            let cert_file = std::fs::File::open(cert_path)?;
            let mut cert_reader = io::BufReader::new(cert_file);
            let certs = rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;

            let key_file = std::fs::File::open(key_path)?;
            let mut key_reader = io::BufReader::new(key_file);
            let key = rustls_pemfile::private_key(&mut key_reader)?
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no private key found in PEM file"))?;

            let config = ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(certs, key)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

            Ok(Self { acceptor: tokio_rustls::TlsAcceptor::from(Arc::new(config)) })
        }

        /// Wrap an accepted `TcpStream` as a TLS server stream.
        pub async fn accept(
            &self,
            stream: TcpStream,
        ) -> io::Result<tokio_rustls::server::TlsStream<TcpStream>> {
            self.acceptor.accept(stream).await
        }
    }
}

#[cfg(all(test, feature = "tls"))]
mod tls_tests {
    use super::tls::{ServerTlsConfig, TlsConfig};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Generates a self-signed cert/key pair and round-trips a byte
    /// string client -> server over a loopback TLS connection.
    #[tokio::test]
    async fn self_signed_round_trip() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let cert_pem = cert.cert.pem();
        let key_pem = cert.key_pair.serialize_pem();

        let dir = std::env::temp_dir().join(format!("mqtt5-tls-test-{:?}", std::thread::current().id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, cert_pem).unwrap();
        std::fs::write(&key_path, key_pem).unwrap();

        let server_tls = ServerTlsConfig::from_pem_files(
            cert_path.to_str().unwrap(),
            key_path.to_str().unwrap(),
        )
        .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut tls_stream = server_tls.accept(stream).await.unwrap();
            let mut buf = [0u8; 5];
            tls_stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
        });

        let client_tls = TlsConfig::insecure();
        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut tls_stream = client_tls.connect(stream, "localhost").await.unwrap();
        tls_stream.write_all(b"hello").await.unwrap();

        server.await.unwrap();
    }
}
