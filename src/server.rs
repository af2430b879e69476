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

use core::future::Future;
use core::net::SocketAddr;
use core::time::Duration;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use rustls::pki_types::CertificateDer;
use rustls::ServerConfig;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, debug_span, info, warn, Instrument};

use crate::dynamic_proxy::DynamicProxy;
use crate::error::{Error, Result};
use crate::tls::{self, ALPN_H2};

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Where the load balancer listens and which TLS material it uses.
#[derive(Debug, Clone)]
pub struct LoadBalancerConfig {
    /// Address the TLS listener binds.
    pub bind_addr: SocketAddr,

    /// Server certificate chain (PEM). Required.
    pub cert_path: PathBuf,

    /// Server private key (PEM). Required.
    pub key_path: PathBuf,

    /// CA bundle backend certificates are verified against. Without
    /// it, any client certificate is accepted.
    pub client_ca_path: Option<PathBuf>,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 443)),
            cert_path: PathBuf::from("cert.pem"),
            key_path: PathBuf::from("key.pem"),
            client_ca_path: None,
        }
    }
}

/// A TLS listener feeding every connection into a [`DynamicProxy`].
pub struct LoadBalancer {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    proxy: DynamicProxy,
}

impl LoadBalancer {
    /// Loads the TLS material named by `config` and binds its address.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Tls`] if the certificates cannot be loaded and
    /// with [`Error::Io`] if the address cannot be bound.
    #[allow(clippy::missing_inline_in_public_items)]
    pub async fn bind(config: &LoadBalancerConfig) -> Result<Self> {
        let tls = tls::server_config_from_files(
            &config.cert_path,
            &config.key_path,
            config.client_ca_path.as_deref(),
        )?;
        let listener = TcpListener::bind(config.bind_addr).await?;
        Self::new(listener, tls)
    }

    /// Serves on an already bound `listener`.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::ProtocolInvariantViolation`] if `tls` would
    /// negotiate HTTP/2, whose connections cannot become tunnels.
    #[inline]
    pub fn new(listener: TcpListener, tls: Arc<ServerConfig>) -> Result<Self> {
        ensure_hijackable(&tls)?;
        Ok(Self {
            listener,
            acceptor: TlsAcceptor::from(tls),
            proxy: DynamicProxy::new(),
        })
    }

    /// # Errors
    ///
    /// Fails if the socket has no local address.
    #[inline]
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    #[inline]
    pub const fn proxy(&self) -> &DynamicProxy {
        &self.proxy
    }

    /// Accepts connections forever, one task per connection.
    ///
    /// # Errors
    ///
    /// Only fails if the local address cannot be read; accept and
    /// handshake failures are logged and skipped.
    #[allow(clippy::missing_inline_in_public_items)]
    pub async fn run(self) -> Result<()> {
        info!("Listening on {}", self.local_addr()?);
        loop {
            let (tcp, peer) = accept_next(|| self.listener.accept()).await;
            let acceptor = self.acceptor.clone();
            let proxy = self.proxy.clone();
            tokio::spawn(
                async move {
                    let stream = match acceptor.accept(tcp).await {
                        Ok(stream) => stream,
                        Err(err) => {
                            debug!("TLS handshake failed: {err}");
                            return;
                        }
                    };
                    let peer_certs: Vec<CertificateDer<'static>> = stream
                        .get_ref()
                        .1
                        .peer_certificates()
                        .map(|certs| certs.iter().map(|cert| cert.clone().into_owned()).collect())
                        .unwrap_or_default();
                    debug!(certs = peer_certs.len(), "accepted connection");
                    if let Err(err) = proxy.serve_connection(stream, peer_certs).await {
                        debug!("connection error: {err}");
                    }
                }
                .instrument(debug_span!("conn", %peer)),
            );
        }
    }
}

/// Waits for the next connection. Failed accepts (out of descriptors and
/// the like) are logged and retried after [`ACCEPT_BACKOFF`].
async fn accept_next<T, F, Fut>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(err) => {
                warn!("failed to accept connection: {err}");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// Connections are taken over after an HTTP/1.1 exchange. HTTP/2
/// multiplexes streams over the socket, so it cannot be offered.
fn ensure_hijackable(config: &ServerConfig) -> Result<()> {
    if config.alpn_protocols.iter().any(|proto| proto == ALPN_H2) {
        return Err(Error::ProtocolInvariantViolation(
            "HTTP/2 is offered via ALPN but connections cannot be taken over".to_owned(),
        ));
    }
    Ok(())
}
