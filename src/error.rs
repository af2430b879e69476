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

use core::error::Error as StdError;
use std::io;

use http::StatusCode;
use thiserror::Error;

/// A boxed error coming from the transport (TCP, TLS or HTTP framing).
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Everything that can go wrong while binding a backend or
/// while proxying through the load balancer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The target URL could not be parsed or uses an unsupported scheme.
    #[error("invalid address {address:?}: {reason}")]
    InvalidAddress {
        /// The address as given.
        address: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Dialing, the TLS handshake or the registration exchange failed.
    #[error("transport error while {context}: {source}")]
    Transport {
        /// The step that failed.
        context: &'static str,
        /// The underlying failure.
        #[source]
        source: BoxError,
    },

    /// The load balancer answered the registration with a non-200 status.
    #[error("registration rejected with {status}: {detail}")]
    RegistrationRejected {
        /// The status the load balancer answered with.
        status: StatusCode,
        /// The response body, lossily decoded.
        detail: String,
    },

    /// The passthrough listener was closed after its connection was taken.
    #[error("listener closed")]
    ListenerClosed,

    /// No certificate presented during registration covers the target.
    #[error("dynamic proxying of {host}{path} not allowed")]
    Unauthorized {
        /// The requested host.
        host: String,
        /// The requested path.
        path: String,
    },

    /// No registered backend covers the request path.
    #[error("no proxy available for {path}")]
    NoBackend {
        /// The request path that nothing covers.
        path: String,
    },

    /// Relaying through the tunnel failed; the backend is presumed dead.
    #[error("{0}")]
    BackendFailure(#[source] hyper::Error),

    /// The hosting HTTP layer cannot hand over its connection.
    #[error("protocol invariant violated: {0}")]
    ProtocolInvariantViolation(String),

    /// Loading certificates, keys or trust roots failed.
    #[error("TLS configuration error: {0}")]
    Tls(String),

    /// Binding or another socket operation failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn transport(context: &'static str, source: impl Into<BoxError>) -> Self {
        Self::Transport {
            context,
            source: source.into(),
        }
    }

    pub(crate) fn invalid_address(address: &str, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            address: address.to_owned(),
            reason: reason.into(),
        }
    }

    /// The status the load balancer answers with when this error ends
    /// a request.
    #[must_use]
    #[inline]
    pub const fn status_code(&self) -> StatusCode {
        match *self {
            Self::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            Self::NoBackend { .. } | Self::BackendFailure(_) => StatusCode::BAD_GATEWAY,
            Self::RegistrationRejected { status, .. } => status,
            Self::InvalidAddress { .. }
            | Self::Transport { .. }
            | Self::ListenerClosed
            | Self::ProtocolInvariantViolation(_)
            | Self::Tls(_)
            | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The plain-text body sent alongside [`Error::status_code`].
    #[must_use]
    #[inline]
    pub fn response_body(&self) -> String {
        match *self {
            Self::Unauthorized { .. } => "Dynamic proxying not allowed.".to_owned(),
            Self::NoBackend { .. } => "502: No proxies available.".to_owned(),
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_side_errors_map_to_statuses() {
        let unauthorized = Error::Unauthorized {
            host: "lb.example".to_owned(),
            path: "/app".to_owned(),
        };
        assert_eq!(unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(unauthorized.response_body(), "Dynamic proxying not allowed.");

        let no_backend = Error::NoBackend {
            path: "/other".to_owned(),
        };
        assert_eq!(no_backend.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(no_backend.response_body(), "502: No proxies available.");
    }

    #[test]
    fn rejection_keeps_remote_status() {
        let err = Error::RegistrationRejected {
            status: StatusCode::UNAUTHORIZED,
            detail: "Dynamic proxying not allowed.".to_owned(),
        };
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
        assert!(err.to_string().contains("Dynamic proxying not allowed."));
    }
}
