//! TLS configuration for both ends of the tunnel.
//!
//! Both sides present a certificate chaining to the configured CA; the CA is
//! the only trust anchor, so any other chain fails the handshake.

use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};

use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinTlsVersion {
    V1_2,
    V1_3,
}

const TLS12_AND_TLS13: &[&rustls::SupportedProtocolVersion] =
    &[&rustls::version::TLS12, &rustls::version::TLS13];
const TLS13_ONLY: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS13];

impl MinTlsVersion {
    fn protocol_versions(self) -> &'static [&'static rustls::SupportedProtocolVersion] {
        match self {
            Self::V1_2 => TLS12_AND_TLS13,
            Self::V1_3 => TLS13_ONLY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsSettings {
    pub min_version: MinTlsVersion,
    pub mutual_auth: bool,
    /// Disabling verification is a test mode only; it logs a warning.
    pub verify_cert: bool,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            min_version: MinTlsVersion::V1_2,
            mutual_auth: true,
            verify_cert: true,
        }
    }
}

/// Our certificate chain, private key and trust anchor.
pub struct TlsMaterial {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    roots: RootCertStore,
    settings: TlsSettings,
}

impl TlsMaterial {
    pub fn load(
        cert_file: &Path,
        key_file: &Path,
        ca_file: &Path,
        settings: TlsSettings,
    ) -> Result<Self, Error> {
        let certs = load_certs(cert_file)?;
        let key = load_key(key_file)?;

        let mut roots = RootCertStore::empty();
        for ca in load_certs(ca_file)? {
            roots.add(ca).map_err(|e| Error::Pem {
                path: ca_file.display().to_string(),
                reason: e.to_string(),
            })?;
        }

        if !settings.verify_cert {
            tracing::warn!(
                "Certificate verification is DISABLED; this mode exists for tests only"
            );
        }

        Ok(Self {
            certs,
            key,
            roots,
            settings,
        })
    }

    pub fn settings(&self) -> TlsSettings {
        self.settings
    }

    pub fn server_config(&self) -> Result<Arc<ServerConfig>, Error> {
        let builder =
            ServerConfig::builder_with_protocol_versions(self.settings.min_version.protocol_versions());

        let builder = if self.settings.mutual_auth && self.settings.verify_cert {
            let verifier = WebPkiClientVerifier::builder(Arc::new(self.roots.clone()))
                .build()
                .map_err(|e| Error::Auth(e.to_string()))?;

            builder.with_client_cert_verifier(verifier)
        } else {
            builder.with_no_client_auth()
        };

        let config = builder.with_single_cert(self.certs.clone(), self.key.clone_key())?;

        Ok(Arc::new(config))
    }

    pub fn client_config(&self) -> Result<Arc<ClientConfig>, Error> {
        let builder =
            ClientConfig::builder_with_protocol_versions(self.settings.min_version.protocol_versions());

        let builder = if self.settings.verify_cert {
            builder.with_root_certificates(self.roots.clone())
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(DangerAcceptAnyServerCert::default()))
        };

        let config = if self.settings.mutual_auth {
            builder.with_client_auth_cert(self.certs.clone(), self.key.clone_key())?
        } else {
            builder.with_no_client_auth()
        };

        Ok(Arc::new(config))
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file = fs::File::open(path).map_err(|e| Error::Pem {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::Pem {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

    if certs.is_empty() {
        return Err(Error::Pem {
            path: path.display().to_string(),
            reason: "no certificates found".to_owned(),
        });
    }

    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, Error> {
    let file = fs::File::open(path).map_err(|e| Error::Pem {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| Error::Pem {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?
        .ok_or_else(|| Error::Pem {
            path: path.display().to_string(),
            reason: "no private key found".to_owned(),
        })
}

/// Accepts any server certificate. Test mode only.
#[derive(Debug)]
struct DangerAcceptAnyServerCert {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl Default for DangerAcceptAnyServerCert {
    fn default() -> Self {
        Self {
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }
}

impl ServerCertVerifier for DangerAcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
