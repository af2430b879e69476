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

//! Authorization of registration requests.
//!
//! A backend's scope is encoded as a URL in the subject common name
//! of its client certificate, e.g. `https://example.com/app` allows
//! registering any path under `/app` on host `example.com`. The
//! scheme is ignored. Certificate validity is the TLS layer's job.

use http::Uri;
use percent_encoding::percent_decode_str;
use rustls::pki_types::CertificateDer;
use tracing::debug;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::error::{Error, Result};

/// The host and path prefix a certificate identity grants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    /// Host as written in the identity, including the port if any.
    pub host: String,
    /// Path prefix.
    pub path: String,
}

impl Scope {
    /// Parses an identity string as a URL.
    ///
    /// Returns `None` when the string is not a URL with a host.
    #[must_use]
    #[inline]
    pub fn parse(identity: &str) -> Option<Self> {
        let uri: Uri = identity.parse().ok()?;
        let authority = uri.authority()?;
        // Userinfo is not part of the host.
        let host = authority.as_str().rsplit('@').next()?;
        Some(Self {
            host: host.to_owned(),
            path: decoded_path(uri.path()),
        })
    }

    /// Whether this scope covers a request for `path` on `host`.
    #[must_use]
    #[inline]
    pub fn covers(&self, host: &str, path: &str) -> bool {
        self.host == host && path.starts_with(&self.path)
    }
}

/// Percent-decodes a request or identity path. Prefixes are compared on
/// the decoded form, so `/%61pp` and `/app` name the same location.
/// Invalid UTF-8 is replaced rather than rejected.
#[inline]
#[must_use]
pub fn decoded_path(path: &str) -> String {
    percent_decode_str(path).decode_utf8_lossy().into_owned()
}

/// Returns the subject common name of a DER encoded certificate.
///
/// When the subject carries several common names the last one wins.
#[must_use]
#[inline]
pub fn common_name(cert: &CertificateDer<'_>) -> Option<String> {
    let (_, parsed) = X509Certificate::from_der(cert.as_ref()).ok()?;
    let name = parsed
        .subject()
        .iter_common_name()
        .filter_map(|cn| cn.as_str().ok())
        .last()?;
    Some(name.to_owned())
}

/// Decides whether any of `peer_certs` authorizes registering
/// `path` on `host`. An empty certificate set is never authorized.
#[must_use]
#[inline]
pub fn is_authorized(peer_certs: &[CertificateDer<'_>], host: &str, path: &str) -> bool {
    peer_certs.iter().any(|cert| {
        let Some(identity) = common_name(cert) else {
            debug!("peer certificate without a usable common name");
            return false;
        };
        Scope::parse(&identity).is_some_and(|scope| scope.covers(host, path))
    })
}

/// Like [`is_authorized`], but fails with [`Error::Unauthorized`].
///
/// # Errors
///
/// Returns [`Error::Unauthorized`] when no certificate covers the target.
#[inline]
pub fn authorize(peer_certs: &[CertificateDer<'_>], host: &str, path: &str) -> Result<()> {
    if is_authorized(peer_certs, host, path) {
        Ok(())
    } else {
        Err(Error::Unauthorized {
            host: host.to_owned(),
            path: path.to_owned(),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use rcgen::{CertificateParams, DnType, KeyPair};

    use super::*;

    /// Self-signed certificate whose subject CN is `cn`.
    pub(crate) fn cert_with_cn(cn: &str) -> CertificateDer<'static> {
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, cn);
        let key = KeyPair::generate().unwrap();
        params.self_signed(&key).unwrap().der().clone()
    }

    #[test]
    fn scope_ignores_scheme_and_userinfo() {
        let scope = Scope::parse("http://user@lb.example:8443/app").unwrap();
        assert_eq!(scope.host, "lb.example:8443");
        assert_eq!(scope.path, "/app");
    }

    #[test]
    fn scope_path_is_decoded() {
        let scope = Scope::parse("https://lb.example/my%20app").unwrap();
        assert_eq!(scope.path, "/my app");
        assert!(scope.covers("lb.example", &decoded_path("/my%20app/x")));
        assert!(scope.covers("lb.example", &decoded_path("/my app/x")));
    }

    #[test]
    fn decoding_leaves_plain_paths_alone() {
        assert_eq!(decoded_path("/app/index.html"), "/app/index.html");
        assert_eq!(decoded_path("/%61pp/x"), "/app/x");
        assert_eq!(decoded_path("/100%"), "/100%");
    }

    #[test]
    fn scope_without_host_is_rejected() {
        assert_eq!(Scope::parse("/app"), None);
        assert_eq!(Scope::parse("not a url"), None);
    }

    #[test]
    fn common_name_is_extracted() {
        let cert = cert_with_cn("https://lb.example/app");
        assert_eq!(common_name(&cert).as_deref(), Some("https://lb.example/app"));
    }

    #[test]
    fn no_certificates_is_rejected() {
        assert!(!is_authorized(&[], "lb.example", "/app"));
    }

    #[test]
    fn matching_host_and_path_is_accepted() {
        let certs = [cert_with_cn("https://lb.example/app")];
        assert!(is_authorized(&certs, "lb.example", "/app"));
        assert!(is_authorized(&certs, "lb.example", "/app/index.html"));
    }

    #[test]
    fn matching_host_with_other_path_is_rejected() {
        let certs = [cert_with_cn("https://lb.example/app")];
        assert!(!is_authorized(&certs, "lb.example", "/other"));
        assert!(!is_authorized(&certs, "lb.example", "/ap"));
    }

    #[test]
    fn other_host_is_rejected() {
        let certs = [cert_with_cn("https://lb.example/app")];
        assert!(!is_authorized(&certs, "evil.example", "/app"));
        assert!(!is_authorized(&certs, "lb.example:8443", "/app"));
    }

    #[test]
    fn one_matching_certificate_among_many_is_enough() {
        let certs = [
            cert_with_cn("backend-01"),
            cert_with_cn("https://other.example/app"),
            cert_with_cn("https://lb.example/app"),
        ];
        assert!(is_authorized(&certs, "lb.example", "/app/x"));
        assert!(authorize(&certs, "lb.example", "/app/x").is_ok());
    }

    #[test]
    fn authorize_reports_target() {
        let err = authorize(&[], "lb.example", "/app").unwrap_err();
        assert!(matches!(
            err,
            Error::Unauthorized { ref host, ref path } if host == "lb.example" && path == "/app"
        ));
    }
}
