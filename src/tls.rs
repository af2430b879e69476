// Copyright 2024 All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! TLS configuration for both ends of the tunnel.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{
    ClientConfig, DigitallySignedStruct, DistinguishedName, RootCertStore, ServerConfig,
    SignatureScheme,
};
use tracing::{info, warn};

use crate::error::{Error, Result};

/// ALPN protocol spoken by the load balancer. Only HTTP/1.1 connections
/// can be taken over as tunnels.
pub const ALPN_HTTP1: &[u8] = b"http/1.1";

/// ALPN protocol identifier for HTTP/2.
pub const ALPN_H2: &[u8] = b"h2";

/// A certificate chain together with its private key.
#[derive(Debug)]
pub struct Identity {
    /// Leaf certificate first, followed by intermediates.
    pub chain: Vec<CertificateDer<'static>>,
    /// The leaf certificate's private key.
    pub key: PrivateKeyDer<'static>,
}

impl Identity {
    /// Loads a PEM certificate chain and private key.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Tls`] if either file is unreadable or empty.
    #[inline]
    pub fn from_files(cert_path: &Path, key_path: &Path) -> Result<Self> {
        Ok(Self {
            chain: load_certs(cert_path)?,
            key: load_private_key(key_path)?,
        })
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Load TLS certificates from a PEM file.
///
/// # Errors
///
/// Fails with [`Error::Tls`] if the file cannot be read or holds no
/// certificate.
#[inline]
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| Error::Tls(format!("Failed to open cert file {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("Failed to parse certs: {e}")))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Load a private key from a PEM file.
///
/// # Errors
///
/// Fails with [`Error::Tls`] if the file cannot be read or holds no key.
#[inline]
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| Error::Tls(format!("Failed to open key file {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::Tls(format!("Failed to parse key: {e}")))?
        .ok_or_else(|| Error::Tls("No private key found".to_owned()))
}

/// Builds a trust store from a PEM CA bundle, or from the bundled
/// Mozilla roots when no bundle is given.
///
/// # Errors
///
/// Fails with [`Error::Tls`] if the bundle cannot be loaded or none of
/// its certificates is a usable trust anchor.
#[inline]
pub fn load_root_store(ca_path: Option<&Path>) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    let Some(path) = ca_path else {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        return Ok(roots);
    };

    let (added, ignored) = roots.add_parsable_certificates(load_certs(path)?);
    if added == 0 {
        return Err(Error::Tls(format!(
            "Unable to add certificates from {}",
            path.display()
        )));
    }
    if ignored > 0 {
        warn!(ignored, path = %path.display(), "ignored unparsable CA certificates");
    }
    Ok(roots)
}

/// Client configuration used by backends to dial the load balancer.
///
/// The identity, if any, is what the load balancer authorizes the
/// registration against.
///
/// # Errors
///
/// Fails with [`Error::Tls`] if the identity's key does not match.
#[inline]
pub fn client_config(identity: Option<Identity>, roots: RootCertStore) -> Result<Arc<ClientConfig>> {
    let builder = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(format!("Unsupported protocol versions: {e}")))?
        .with_root_certificates(roots);

    let mut config = match identity {
        Some(Identity { chain, key }) => builder
            .with_client_auth_cert(chain, key)
            .map_err(|e| Error::Tls(format!("Invalid client cert/key: {e}")))?,
        None => builder.with_no_client_auth(),
    };
    config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];
    Ok(Arc::new(config))
}

/// [`client_config`] from files. The identity is only loaded when both
/// `cert_path` and `key_path` are given.
///
/// # Errors
///
/// Fails with [`Error::Tls`] if any given file cannot be loaded.
#[inline]
pub fn client_config_from_files(
    cert_path: Option<&Path>,
    key_path: Option<&Path>,
    ca_path: Option<&Path>,
) -> Result<Arc<ClientConfig>> {
    let identity = match (cert_path, key_path) {
        (Some(cert), Some(key)) => Some(Identity::from_files(cert, key)?),
        _ => None,
    };
    client_config(identity, load_root_store(ca_path)?)
}

/// Server configuration for the load balancer.
///
/// With `client_roots`, client certificates are verified against them
/// when presented. Without, any certificate is accepted, which weakens
/// authorization to "any self-signed certificate with a matching common
/// name".
///
/// # Errors
///
/// Fails with [`Error::Tls`] if the server identity is unusable.
#[inline]
pub fn server_config(
    identity: Identity,
    client_roots: Option<RootCertStore>,
) -> Result<Arc<ServerConfig>> {
    let provider = provider();
    let verifier: Arc<dyn ClientCertVerifier> = match client_roots {
        Some(roots) => WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
            .allow_unauthenticated()
            .build()
            .map_err(|e| Error::Tls(format!("Invalid client CA: {e}")))?,
        None => {
            warn!("Warning: Client certificate verification disabled!");
            Arc::new(RequestClientCert::new(provider.clone()))
        }
    };

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(format!("Unsupported protocol versions: {e}")))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(identity.chain, identity.key)
        .map_err(|e| Error::Tls(format!("Invalid cert/key: {e}")))?;
    config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];
    Ok(Arc::new(config))
}

/// [`server_config`] from files.
///
/// # Errors
///
/// Fails with [`Error::Tls`] if any given file cannot be loaded.
#[inline]
pub fn server_config_from_files(
    cert_path: &Path,
    key_path: &Path,
    client_ca_path: Option<&Path>,
) -> Result<Arc<ServerConfig>> {
    info!("Loading TLS certificate from: {}", cert_path.display());
    let identity = Identity::from_files(cert_path, key_path)?;
    let client_roots = client_ca_path
        .map(|path| load_root_store(Some(path)))
        .transpose()?;
    server_config(identity, client_roots)
}

/// Requests a client certificate but does not check its chain.
///
/// The handshake signature is still verified, so the peer has to hold
/// the key of the certificate it presents.
#[derive(Debug)]
struct RequestClientCert {
    provider: Arc<CryptoProvider>,
}

impl RequestClientCert {
    const fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl ClientCertVerifier for RequestClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
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
        verify_tls13_signature(
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

#[cfg(test)]
mod tests {
    use std::io::Write;

    use rcgen::{CertificateParams, KeyPair};
    use tempfile::NamedTempFile;

    use super::*;

    fn pem_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn self_signed_pem() -> (String, String) {
        let key = KeyPair::generate().unwrap();
        let cert = CertificateParams::new(vec!["localhost".to_owned()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        (cert.pem(), key.serialize_pem())
    }

    #[test]
    fn loads_pem_identity() {
        let (cert, key) = self_signed_pem();
        let cert_file = pem_file(&cert);
        let key_file = pem_file(&key);
        let identity = Identity::from_files(cert_file.path(), key_file.path()).unwrap();
        assert_eq!(identity.chain.len(), 1);
    }

    #[test]
    fn missing_cert_file_is_a_tls_error() {
        let err = load_certs(Path::new("/nonexistent/cert.pem")).unwrap_err();
        assert!(matches!(err, Error::Tls(_)));
    }

    #[test]
    fn empty_ca_bundle_is_rejected() {
        let file = pem_file("");
        assert!(matches!(load_root_store(Some(file.path())), Err(Error::Tls(_))));
    }

    #[test]
    fn default_roots_are_not_empty() {
        assert!(!load_root_store(None).unwrap().is_empty());
    }

    #[test]
    fn server_config_speaks_http1_only() {
        let (cert, key) = self_signed_pem();
        let cert_file = pem_file(&cert);
        let key_file = pem_file(&key);
        let config = server_config_from_files(cert_file.path(), key_file.path(), None).unwrap();
        assert_eq!(config.alpn_protocols, vec![ALPN_HTTP1.to_vec()]);
    }

    #[test]
    fn server_config_with_client_ca() {
        let (cert, key) = self_signed_pem();
        let cert_file = pem_file(&cert);
        let key_file = pem_file(&key);
        let config = server_config_from_files(
            cert_file.path(),
            key_file.path(),
            Some(cert_file.path()),
        );
        assert!(config.is_ok());
    }

    #[test]
    fn client_config_with_identity() {
        let (cert, key) = self_signed_pem();
        let cert_file = pem_file(&cert);
        let key_file = pem_file(&key);
        let config = client_config_from_files(
            Some(cert_file.path()),
            Some(key_file.path()),
            Some(cert_file.path()),
        )
        .unwrap();
        assert!(config.client_auth_cert_resolver.has_certs());
    }
}
