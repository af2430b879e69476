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
use core::net::SocketAddr;
use std::sync::{Mutex, PoisonError};

use hyper::body::{Body, Incoming};
use hyper::server::conn::http1::Builder as Http1Builder;
use hyper::service::HttpService;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};

/// A listener that yields one already-established connection.
///
/// The first [`accept`](Self::accept) returns the wrapped connection.
/// Every later call waits until the listener is closed and then fails
/// with [`Error::ListenerClosed`].
#[derive(Debug)]
pub struct PassthroughListener<S> {
    /// The connection, until it has been handed out.
    conn: Mutex<Option<S>>,

    /// Cancelled by [`close`](Self::close) to release parked accepts.
    closed: CancellationToken,
}

impl<S> PassthroughListener<S> {
    /// Wraps a connection that was established by other means.
    #[inline]
    pub fn new(conn: S) -> Self {
        Self {
            conn: Mutex::new(Some(conn)),
            closed: CancellationToken::new(),
        }
    }

    /// Returns the wrapped connection on the first call.
    ///
    /// # Errors
    ///
    /// After the first call, waits for [`close`](Self::close) and returns
    /// [`Error::ListenerClosed`]. Returns immediately once closed.
    #[allow(clippy::missing_inline_in_public_items)]
    pub async fn accept(&self) -> Result<S> {
        let conn = self
            .conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(conn) = conn {
            return Ok(conn);
        }
        self.closed.cancelled().await;
        Err(Error::ListenerClosed)
    }

    /// Unblocks any parked [`accept`](Self::accept). Closing twice is
    /// harmless.
    ///
    /// # Errors
    ///
    /// Never fails; the result mirrors listener APIs that can.
    #[inline]
    pub fn close(&self) -> Result<()> {
        self.closed.cancel();
        Ok(())
    }

    #[cfg(test)]
    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// The listener never bound a port, so it has no local address.
    #[inline]
    pub const fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

impl<S> PassthroughListener<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Accepts the tunnel and serves HTTP/1.1 on it with `service`
    /// until the load balancer or the listener closes it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ListenerClosed`] if the connection was already
    /// taken and [`Error::Transport`] if serving fails.
    #[allow(clippy::missing_inline_in_public_items)]
    pub async fn serve<Svc, B>(&self, service: Svc) -> Result<()>
    where
        Svc: HttpService<Incoming, ResBody = B>,
        Svc::Error: Into<Box<dyn StdError + Send + Sync>>,
        B: Body + 'static,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let conn = self.accept().await?;
        let served = Http1Builder::new().serve_connection(TokioIo::new(conn), service);
        tokio::select! {
            result = served => {
                debug!("tunnel connection finished");
                result.map_err(|err| Error::transport("serving tunnel", err))
            }
            () = self.closed.cancelled() => Err(Error::ListenerClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use core::time::Duration;
    use std::sync::Arc;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn first_accept_returns_connection() {
        let (near, mut far) = tokio::io::duplex(64);
        let listener = PassthroughListener::new(near);
        let mut conn = listener.accept().await.unwrap();
        conn.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn second_accept_blocks_until_close() {
        let (near, _far) = tokio::io::duplex(64);
        let listener = Arc::new(PassthroughListener::new(near));
        let _conn = listener.accept().await.unwrap();

        let parked = tokio::spawn({
            let listener = Arc::clone(&listener);
            async move { listener.accept().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!parked.is_finished());

        listener.close().unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), parked)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::ListenerClosed)));

        // Accepting after close fails right away.
        assert!(matches!(listener.accept().await, Err(Error::ListenerClosed)));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (near, _far) = tokio::io::duplex(64);
        let listener = PassthroughListener::new(near);
        listener.close().unwrap();
        listener.close().unwrap();
        assert!(listener.is_closed());
    }

    #[tokio::test]
    async fn connection_survives_close_before_accept() {
        let (near, _far) = tokio::io::duplex(64);
        let listener = PassthroughListener::new(near);
        listener.close().unwrap();
        assert!(listener.accept().await.is_ok());
        assert!(matches!(listener.accept().await, Err(Error::ListenerClosed)));
    }

    #[test]
    fn has_no_address() {
        let (near, _far) = tokio::io::duplex(64);
        assert_eq!(PassthroughListener::new(near).local_addr(), None);
    }
}
