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

use core::convert::Infallible;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use bytes::Bytes;
use futures::ready;
use http::header::{CONNECTION, CONTENT_TYPE, HOST, UPGRADE};
use http::{HeaderMap, HeaderName, HeaderValue, Version};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::server::conn::http1::Builder as Http1Builder;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use pin_project::pin_project;
use rustls::pki_types::CertificateDer;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tower_service::Service;
use tracing::{debug, error, warn};

use crate::authorize::{authorize, decoded_path};
use crate::error::{Error, Result};
use crate::registry::{BackendTunnel, Registry};
use crate::rewind::Rewind;
use crate::UPGRADE_HEADER_VALUE;

/// Body of every response produced by the load balancer.
pub type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

/// Headers that only describe the client's connection to us and must
/// not be written onto the tunnel.
const HOP_BY_HOP_HEADERS: [&str; 5] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "upgrade",
];

/// What an inbound request asks the load balancer to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// A backend wants to turn this connection into a tunnel.
    Registration,

    /// Ordinary traffic to relay through the tunnel.
    Traffic,
}

impl RequestKind {
    /// Requests carrying `Upgrade: DynamicProxy` are registrations,
    /// everything else is traffic.
    #[inline]
    pub fn classify<B>(request: &Request<B>) -> Self {
        if request.headers().get(UPGRADE)
            == Some(&HeaderValue::from_static(UPGRADE_HEADER_VALUE))
        {
            Self::Registration
        } else {
            Self::Traffic
        }
    }
}

/// The load balancer's request handler and the registry it owns.
///
/// Every request, registration or traffic, is handled while holding the
/// registry lock, so at most one operation touches the tunnel at a time.
/// For traffic the lock is released once the relayed response body has
/// been fully streamed.
#[derive(Debug, Clone, Default)]
pub struct DynamicProxy {
    registry: Arc<Mutex<Registry>>,
}

impl DynamicProxy {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The prefix of the currently registered backend, if any.
    #[allow(clippy::missing_inline_in_public_items)]
    pub async fn backend_prefix(&self) -> Option<String> {
        self.registry.lock().await.prefix().map(str::to_owned)
    }

    /// Serves HTTP/1.1 on `io` until the client goes away or a
    /// registration takes the connection over.
    ///
    /// `peer_certs` are the certificates the client presented during the
    /// TLS handshake; they are the only input to authorization.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the HTTP connection fails and
    /// [`Error::BackendFailure`] if a registered connection cannot be
    /// turned into a tunnel.
    #[allow(clippy::missing_inline_in_public_items)]
    pub async fn serve_connection<Io>(
        &self,
        io: Io,
        peer_certs: Vec<CertificateDer<'static>>,
    ) -> Result<()>
    where
        Io: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let hijack = Hijack::default();
        let service = ProxyConnection {
            proxy: self.clone(),
            peer_certs: peer_certs.into(),
            hijack: hijack.clone(),
        };

        let parts = Http1Builder::new()
            .serve_connection(TokioIo::new(io), TowerToHyperService::new(service))
            .without_shutdown()
            .await
            .map_err(|err| Error::transport("serving connection", err))?;

        let Some(Claim {
            prefix,
            mut registry,
        }) = hijack.take()
        else {
            debug!("connection finished");
            return Ok(());
        };

        // The socket is ours now. Anything hyper read past the
        // registration request belongs to the tunnel.
        let io = Rewind::new(parts.io.into_inner(), parts.read_buf);
        let tunnel = BackendTunnel::establish(TokioIo::new(io), prefix).await?;
        registry.install(tunnel);
        Ok(())
    }
}

/// A registration that was accepted on this connection. The registry
/// stays locked until the tunnel is installed.
#[derive(Debug)]
struct Claim {
    prefix: String,
    registry: OwnedMutexGuard<Registry>,
}

/// Records that the current connection has been claimed as a tunnel.
#[derive(Debug, Clone, Default)]
struct Hijack(Arc<StdMutex<Option<Claim>>>);

impl Hijack {
    fn claim(&self, prefix: &str, registry: OwnedMutexGuard<Registry>) -> Result<()> {
        let mut slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(Error::ProtocolInvariantViolation(
                "connection hijacked twice".to_owned(),
            ));
        }
        *slot = Some(Claim {
            prefix: prefix.to_owned(),
            registry,
        });
        Ok(())
    }

    fn take(&self) -> Option<Claim> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// The per-connection view of a [`DynamicProxy`].
#[derive(Clone)]
struct ProxyConnection {
    proxy: DynamicProxy,

    /// Certificates presented by the client of this connection.
    peer_certs: Arc<[CertificateDer<'static>]>,

    hijack: Hijack,
}

impl Service<Request<Incoming>> for ProxyConnection {
    type Response = Response<ProxyBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    #[inline]
    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    #[inline]
    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { Ok(this.handle(req).await) })
    }
}

impl ProxyConnection {
    async fn handle(self, req: Request<Incoming>) -> Response<ProxyBody> {
        let registry = Arc::clone(&self.proxy.registry).lock_owned().await;
        let result = match RequestKind::classify(&req) {
            RequestKind::Registration => self.register(registry, &req),
            RequestKind::Traffic => forward(registry, req).await,
        };
        result.unwrap_or_else(|err| {
            if let Error::ProtocolInvariantViolation(ref reason) = err {
                error!("cannot take over connection: {reason}");
            }
            error_response(&err)
        })
    }

    /// Authorizes a registration and marks the connection for takeover.
    /// The registry guard moves into the claim, so the lock is held until
    /// hyper has written the response, released the socket and the tunnel
    /// has been installed.
    fn register(
        &self,
        registry: OwnedMutexGuard<Registry>,
        req: &Request<Incoming>,
    ) -> Result<Response<ProxyBody>> {
        let host = request_host(req);
        let path = decoded_path(req.uri().path());
        if let Err(err) = authorize(&self.peer_certs, &host, &path) {
            warn!("Blocked attempt to proxy {host}{path}");
            return Err(err);
        }
        self.hijack.claim(&path, registry)?;
        debug!(%host, %path, "registration accepted");

        let mut response = Response::new(empty());
        *response.status_mut() = StatusCode::OK;
        response
            .headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("close"));
        Ok(response)
    }
}

/// Relays `req` through the registered tunnel. The returned body keeps
/// the registry locked until it has been streamed.
async fn forward(
    mut registry: OwnedMutexGuard<Registry>,
    mut req: Request<Incoming>,
) -> Result<Response<ProxyBody>> {
    let path = decoded_path(req.uri().path());
    strip_hop_by_hop(req.headers_mut());
    // The tunnel is kept alive across requests.
    *req.version_mut() = Version::HTTP_11;

    let outcome = match registry.route(&path) {
        Some(tunnel) => tunnel.send(req).await,
        None => {
            debug!(%path, "no backend covers request");
            return Err(Error::NoBackend { path });
        }
    };

    match outcome {
        Ok(response) => Ok(relay(response, registry)),
        Err(err) => {
            warn!("Backend crashed: {err}");
            registry.clear();
            Err(err)
        }
    }
}

fn relay(
    response: Response<Incoming>,
    registry: OwnedMutexGuard<Registry>,
) -> Response<ProxyBody> {
    let (parts, body) = response.into_parts();
    let mut relayed = Response::new(RegistryGuardedBody::new(body, registry).boxed_unsync());
    *relayed.status_mut() = parts.status;
    let headers = relayed.headers_mut();
    for (name, value) in &parts.headers {
        headers.append(name, value.clone());
    }
    relayed
}

/// The `Host` of a request, including the port if one was given.
fn request_host<B>(req: &Request<B>) -> String {
    req.headers()
        .get(HOST)
        .and_then(|host| host.to_str().ok())
        .or_else(|| req.uri().authority().map(http::uri::Authority::as_str))
        .unwrap_or_default()
        .to_owned()
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn error_response(err: &Error) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from(err.response_body()))
        .map_err(|never| match never {})
        .boxed_unsync();
    let mut response = Response::new(body);
    *response.status_mut() = err.status_code();
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// A response body streamed from the tunnel that holds the registry
/// lock until it ends. A read error while streaming discards the tunnel.
#[pin_project]
struct RegistryGuardedBody<B> {
    #[pin]
    inner: B,

    guard: Option<OwnedMutexGuard<Registry>>,
}

impl<B> RegistryGuardedBody<B> {
    const fn new(inner: B, guard: OwnedMutexGuard<Registry>) -> Self {
        Self {
            inner,
            guard: Some(guard),
        }
    }
}

impl<B> Body for RegistryGuardedBody<B>
where
    B: Body<Error = hyper::Error>,
{
    type Data = B::Data;
    type Error = hyper::Error;

    #[inline]
    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let frame = ready!(this.inner.poll_frame(cx));
        match frame {
            None => drop(this.guard.take()),
            Some(Err(ref err)) => {
                if let Some(mut registry) = this.guard.take() {
                    warn!("Backend crashed while streaming: {err}");
                    registry.clear();
                }
            }
            Some(Ok(_)) => {}
        }
        Poll::Ready(frame)
    }

    #[inline]
    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    #[inline]
    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
