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

use core::pin::Pin;
use core::task::{Context, Poll};
use std::io;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::{select, Either};
use http::header::{HOST, UPGRADE};
use http::uri::{Authority, PathAndQuery};
use http::{Request, StatusCode, Uri};
use http_body_util::{BodyExt, Empty};
use hyper::client::conn::http1::handshake as http1_handshake;
use hyper_util::rt::TokioIo;
use pin_project::pin_project;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::listener::PassthroughListener;
use crate::rewind::Rewind;
use crate::tls;
use crate::{BIND_METHOD, UPGRADE_HEADER_VALUE};

/// How a backend dials the load balancer.
#[derive(Debug, Clone, Default)]
pub struct BindConfig {
    /// TLS client configuration. When unset, `https` targets are dialed
    /// with the bundled roots and no client certificate.
    tls: Option<Arc<ClientConfig>>,

    /// Whether `http` targets are accepted. Only meant for demos; no
    /// identity is sent in that mode.
    allow_plaintext: bool,
}

impl BindConfig {
    /// Uses `config` for the TLS handshake.
    #[inline]
    #[must_use]
    pub const fn with_client_config(config: Arc<ClientConfig>) -> Self {
        Self {
            tls: Some(config),
            allow_plaintext: false,
        }
    }

    /// Loads the backend identity and the CA that signed the load
    /// balancer's certificate.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Tls`] if any given file cannot be loaded.
    #[inline]
    pub fn from_files(
        cert_path: Option<&Path>,
        key_path: Option<&Path>,
        ca_path: Option<&Path>,
    ) -> Result<Self> {
        Ok(Self::with_client_config(tls::client_config_from_files(
            cert_path, key_path, ca_path,
        )?))
    }

    /// Additionally accepts `http` targets.
    #[inline]
    #[must_use]
    pub const fn plaintext(mut self) -> Self {
        self.allow_plaintext = true;
        self
    }

    fn client_config(&self) -> Result<Arc<ClientConfig>> {
        match self.tls {
            Some(ref config) => Ok(Arc::clone(config)),
            None => tls::client_config(None, tls::load_root_store(None)?),
        }
    }
}

/// The connection a backend registered through.
#[pin_project(project = TunnelStreamProj)]
#[derive(Debug)]
pub enum TunnelStream {
    /// An `http` registration.
    Plain(#[pin] TcpStream),
    /// An `https` registration.
    Tls(#[pin] Box<TlsStream<TcpStream>>),
}

impl AsyncRead for TunnelStream {
    #[inline]
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            TunnelStreamProj::Plain(stream) => stream.poll_read(cx, buf),
            TunnelStreamProj::Tls(stream) => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TunnelStream {
    #[inline]
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            TunnelStreamProj::Plain(stream) => stream.poll_write(cx, buf),
            TunnelStreamProj::Tls(stream) => stream.poll_write(cx, buf),
        }
    }

    #[inline]
    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            TunnelStreamProj::Plain(stream) => stream.poll_flush(cx),
            TunnelStreamProj::Tls(stream) => stream.poll_flush(cx),
        }
    }

    #[inline]
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            TunnelStreamProj::Plain(stream) => stream.poll_shutdown(cx),
            TunnelStreamProj::Tls(stream) => stream.poll_shutdown(cx),
        }
    }
}

/// Where to dial and what to claim, derived from the target URL.
#[derive(Debug)]
struct Target {
    secure: bool,
    authority: Authority,
    path: PathAndQuery,
}

impl Target {
    fn parse(address: &str, allow_plaintext: bool) -> Result<Self> {
        let uri: Uri = address
            .parse()
            .map_err(|err: http::uri::InvalidUri| Error::invalid_address(address, err.to_string()))?;
        let secure = match uri.scheme_str() {
            Some("https") => true,
            Some("http") if allow_plaintext => false,
            Some("http") => {
                return Err(Error::invalid_address(
                    address,
                    "plaintext registration is not enabled",
                ))
            }
            Some(other) => {
                return Err(Error::invalid_address(
                    address,
                    format!("Scheme {other} is unsupported"),
                ))
            }
            None => return Err(Error::invalid_address(address, "missing scheme")),
        };
        let authority = uri
            .authority()
            .cloned()
            .ok_or_else(|| Error::invalid_address(address, "missing host"))?;
        let path = uri
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));
        Ok(Self {
            secure,
            authority,
            path,
        })
    }

    /// The host without brackets, as used for DNS and SNI.
    fn host(&self) -> &str {
        self.authority
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']')
    }

    fn port(&self) -> u16 {
        self.authority
            .port_u16()
            .unwrap_or(if self.secure { 443 } else { 80 })
    }

    /// The value of the `Host` header: host and port, no userinfo.
    fn host_header(&self) -> &str {
        self.authority
            .as_str()
            .rsplit('@')
            .next()
            .unwrap_or_else(|| self.authority.host())
    }

    fn registration(&self) -> Result<Request<Empty<Bytes>>> {
        Request::builder()
            .method(BIND_METHOD)
            .uri(self.path.as_str())
            .header(HOST, self.host_header())
            .header(UPGRADE, UPGRADE_HEADER_VALUE)
            .body(Empty::new())
            .map_err(|err| Error::invalid_address(self.path.as_str(), err.to_string()))
    }

    async fn dial(&self, config: &BindConfig) -> Result<TunnelStream> {
        let tcp = TcpStream::connect((self.host(), self.port()))
            .await
            .map_err(|err| Error::transport("dialing load balancer", err))?;
        if !self.secure {
            return Ok(TunnelStream::Plain(tcp));
        }

        let server_name = ServerName::try_from(self.host().to_owned())
            .map_err(|err| Error::invalid_address(self.authority.as_str(), err.to_string()))?;
        let tls = TlsConnector::from(config.client_config()?)
            .connect(server_name, tcp)
            .await
            .map_err(|err| Error::transport("TLS handshake", err))?;
        Ok(TunnelStream::Tls(Box::new(tls)))
    }
}

/// Creates a listener that is bound to a URL instead of a port.
///
/// Dials the load balancer named by `address`, registers for its path
/// and returns a listener that yields the resulting tunnel once.
///
/// # Errors
///
/// - [`Error::InvalidAddress`] if `address` is not an `https` URL (or an
///   `http` URL when [`BindConfig::plaintext`] is set).
/// - [`Error::Transport`] if dialing, TLS or the exchange fails.
/// - [`Error::RegistrationRejected`] if the load balancer does not
///   answer `200`.
#[allow(clippy::missing_inline_in_public_items)]
pub async fn bind_url(
    address: &str,
    config: &BindConfig,
) -> Result<PassthroughListener<Rewind<TunnelStream>>> {
    let target = Target::parse(address, config.allow_plaintext)?;
    let request = target.registration()?;
    let stream = target.dial(config).await?;
    debug!(%address, "connected, registering");

    let tunnel = get_conn_after_registration(stream, request).await?;
    info!(%address, "registered with load balancer");
    Ok(PassthroughListener::new(tunnel))
}

/// Sends the registration `request` over `io` and, if it is accepted,
/// takes the connection back from the HTTP client together with any
/// bytes that were already read past the response.
///
/// # Errors
///
/// Returns [`Error::RegistrationRejected`] with the response body as
/// detail if the status is not `200`, or [`Error::Transport`] if the
/// connection fails during the exchange.
#[allow(clippy::missing_inline_in_public_items)]
pub async fn get_conn_after_registration<Io>(
    io: Io,
    request: Request<Empty<Bytes>>,
) -> Result<Rewind<Io>>
where
    Io: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut sender, conn) = http1_handshake(TokioIo::new(io))
        .await
        .map_err(|err| Error::transport("starting registration", err))?;

    let request_fut = sender.send_request(request);
    let registration_conn = conn.without_shutdown();
    futures::pin_mut!(request_fut);
    futures::pin_mut!(registration_conn);
    let (response, finished) = match select(request_fut, &mut registration_conn).await {
        Either::Left((response_res, _)) => {
            let response =
                response_res.map_err(|err| Error::transport("sending registration", err))?;
            (response, None)
        }
        Either::Right((conn_res, request_fut)) => {
            // `Connection: close` ends the connection in the same poll that
            // hands the response over, so it is already queued.
            let parts =
                conn_res.map_err(|err| Error::transport("sending registration", err))?;
            let response = request_fut
                .await
                .map_err(|err| Error::transport("sending registration", err))?;
            (response, Some(parts))
        }
    };

    let status = response.status();
    let body_fut = response.into_body().collect();
    futures::pin_mut!(body_fut);
    let (body, parts) = match finished {
        Some(parts) => {
            let body = body_fut
                .await
                .map_err(|err| Error::transport("reading registration", err))?;
            (body.to_bytes(), parts)
        }
        None => match select(body_fut, &mut registration_conn).await {
            Either::Left((body_res, conn_fut)) => {
                let body =
                    body_res.map_err(|err| Error::transport("reading registration", err))?;
                // No further requests: lets the connection wind down.
                drop(sender);
                let parts = conn_fut
                    .await
                    .map_err(|err| Error::transport("finishing registration", err))?;
                (body.to_bytes(), parts)
            }
            Either::Right((conn_res, body_fut)) => {
                let parts =
                    conn_res.map_err(|err| Error::transport("finishing registration", err))?;
                let body = body_fut
                    .await
                    .map_err(|err| Error::transport("reading registration", err))?;
                (body.to_bytes(), parts)
            }
        },
    };

    if status != StatusCode::OK {
        return Err(Error::RegistrationRejected {
            status,
            detail: String::from_utf8_lossy(&body).into_owned(),
        });
    }

    Ok(Rewind::new(parts.io.into_inner(), parts.read_buf))
}

#[cfg(test)]
mod tests {
    use core::convert::Infallible;

    use http::Response;
    use http_body_util::Full;
    use hyper::body::Incoming;
    use hyper::service::service_fn;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::authorize::tests::cert_with_cn;
    use crate::dynamic_proxy::DynamicProxy;

    /// Runs `proxy` on a local port over plain TCP. Every connection
    /// presents a certificate scoped to `scope_path`, which is returned
    /// as a URL.
    async fn plaintext_proxy(proxy: DynamicProxy, scope_path: &str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let scope = format!("http://{}{scope_path}", listener.local_addr().unwrap());
        let certs = vec![cert_with_cn(&scope)];
        tokio::spawn(async move {
            loop {
                let (tcp, _) = listener.accept().await.unwrap();
                let proxy = proxy.clone();
                let certs = certs.clone();
                tokio::spawn(async move { proxy.serve_connection(tcp, certs).await });
            }
        });
        scope
    }

    /// Accepts one connection, reads the request head and answers with
    /// `response` verbatim. The task yields the head and the connection.
    async fn one_shot_server(
        response: &'static [u8],
    ) -> (String, tokio::task::JoinHandle<(String, TcpStream)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            while !head.ends_with(b"\r\n\r\n") {
                let mut byte = [0u8; 1];
                stream.read_exact(&mut byte).await.unwrap();
                head.push(byte[0]);
            }
            stream.write_all(response).await.unwrap();
            (String::from_utf8(head).unwrap(), stream)
        });
        (format!("http://{addr}/app"), task)
    }

    #[test]
    fn unparseable_address_is_invalid() {
        let err = Target::parse("http://bad host/", true).unwrap_err();
        assert!(matches!(err, Error::InvalidAddress { .. }));
    }

    #[test]
    fn unsupported_scheme_is_invalid() {
        let err = Target::parse("ftp://lb.example/app", true).unwrap_err();
        assert!(matches!(err, Error::InvalidAddress { ref reason, .. } if reason.contains("ftp")));
    }

    #[test]
    fn plaintext_requires_opt_in() {
        assert!(matches!(
            Target::parse("http://lb.example/app", false),
            Err(Error::InvalidAddress { .. })
        ));
        assert!(Target::parse("http://lb.example/app", true).is_ok());
    }

    #[test]
    fn target_defaults() {
        let target = Target::parse("https://user@[::1]/app?x=1", false).unwrap();
        assert_eq!(target.host(), "::1");
        assert_eq!(target.port(), 443);
        assert_eq!(target.host_header(), "[::1]");
        assert_eq!(target.path.as_str(), "/app?x=1");

        let target = Target::parse("https://lb.example:8443", false).unwrap();
        assert_eq!(target.host_header(), "lb.example:8443");
        assert_eq!(target.path.as_str(), "/");
    }

    #[test]
    fn registration_request_shape() {
        let target = Target::parse("https://lb.example/app", false).unwrap();
        let request = target.registration().unwrap();
        assert_eq!(request.method().as_str(), "BIND");
        assert_eq!(request.uri(), "/app");
        assert_eq!(request.headers().get(HOST).unwrap(), "lb.example");
        assert_eq!(request.headers().get(UPGRADE).unwrap(), "DynamicProxy");
    }

    #[tokio::test]
    async fn unreachable_load_balancer_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let config = BindConfig::default().plaintext();
        let err = bind_url(&format!("http://{addr}/app"), &config)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
    }

    #[tokio::test]
    async fn rejection_carries_body() {
        let (address, server) = one_shot_server(
            b"HTTP/1.1 401 Unauthorized\r\ncontent-length: 29\r\n\r\nDynamic proxying not allowed.",
        )
        .await;
        let config = BindConfig::default().plaintext();
        let err = bind_url(&address, &config).await.unwrap_err();
        match err {
            Error::RegistrationRejected { status, detail } => {
                assert_eq!(status, StatusCode::UNAUTHORIZED);
                assert_eq!(detail, "Dynamic proxying not allowed.");
            }
            other => panic!("unexpected error: {other}"),
        }
        let (head, _) = server.await.unwrap();
        assert!(head.starts_with("BIND /app HTTP/1.1\r\n"), "{head}");
        assert!(head.to_ascii_lowercase().contains("upgrade: dynamicproxy"));
    }

    #[tokio::test]
    async fn accepted_registration_yields_tunnel_with_early_bytes() {
        // The first traffic request follows the response immediately.
        let (address, server) = one_shot_server(
            b"HTTP/1.1 200 OK\r\nconnection: close\r\ncontent-length: 0\r\n\r\nGET /app/x HTTP/1.1\r\n\r\n",
        )
        .await;
        let config = BindConfig::default().plaintext();
        let listener = bind_url(&address, &config).await.unwrap();
        let mut tunnel = listener.accept().await.unwrap();

        let mut first = vec![0u8; b"GET /app/x HTTP/1.1\r\n\r\n".len()];
        tunnel.read_exact(&mut first).await.unwrap();
        assert_eq!(first, b"GET /app/x HTTP/1.1\r\n\r\n");

        let (_, mut lb_side) = server.await.unwrap();
        tunnel.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        lb_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn registers_with_dynamic_proxy() {
        let proxy = DynamicProxy::new();
        let scope = plaintext_proxy(proxy.clone(), "/app").await;

        let config = BindConfig::default().plaintext();
        let listener = bind_url(&scope, &config).await.unwrap();
        // The load balancer installs the tunnel before anyone else can
        // look at the registry.
        assert_eq!(proxy.backend_prefix().await.as_deref(), Some("/app"));

        tokio::spawn(async move {
            listener
                .serve(service_fn(|req: Request<Incoming>| async move {
                    let body = Bytes::from(format!("served {}", req.uri().path()));
                    Ok::<_, Infallible>(Response::new(Full::new(body)))
                }))
                .await
        });

        let addr = scope.trim_start_matches("http://").trim_end_matches("/app");
        let tcp = TcpStream::connect(addr).await.unwrap();
        let (mut sender, conn) = http1_handshake(TokioIo::new(tcp)).await.unwrap();
        tokio::spawn(conn);
        let request = Request::get("/app/page")
            .header(HOST, addr)
            .body(Empty::<Bytes>::new())
            .unwrap();
        let response = sender.send_request(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"served /app/page");
    }

    #[tokio::test]
    async fn registration_outside_scope_is_rejected_by_dynamic_proxy() {
        let proxy = DynamicProxy::new();
        let scope = plaintext_proxy(proxy.clone(), "/app").await;
        let other = scope.replace("/app", "/admin");

        let config = BindConfig::default().plaintext();
        let err = bind_url(&other, &config).await.unwrap_err();
        assert!(matches!(
            err,
            Error::RegistrationRejected { status, .. } if status == StatusCode::UNAUTHORIZED
        ));
        assert_eq!(proxy.backend_prefix().await, None);
    }
}
