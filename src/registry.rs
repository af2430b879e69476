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

//! The single-slot registry of backend tunnels.

use hyper::body::Incoming;
use hyper::client::conn::http1::{handshake as http1_handshake, SendRequest};
use hyper::rt::{Read, Write};
use hyper::{Request, Response};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// A live connection dialed by a backend and kept open by the load
/// balancer to relay traffic.
///
/// The connection is driven by its own task; dropping the tunnel aborts
/// that task, which closes the underlying stream.
#[derive(Debug)]
pub struct BackendTunnel {
    /// The path prefix the backend registered for.
    prefix: String,

    /// The http1 client half written to for every proxied request.
    sender: SendRequest<Incoming>,

    /// The task polling the client connection.
    driver: JoinHandle<()>,
}

impl BackendTunnel {
    /// Starts speaking HTTP/1.1 as a client over `io`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BackendFailure`] if the handshake fails.
    #[allow(clippy::missing_inline_in_public_items)]
    pub async fn establish<Io>(io: Io, prefix: String) -> Result<Self>
    where
        Io: Read + Write + Send + Unpin + 'static,
    {
        let (sender, conn) = http1_handshake(io).await.map_err(Error::BackendFailure)?;
        let tunnel_prefix = prefix.clone();
        let driver = tokio::spawn(async move {
            match conn.await {
                Ok(()) => debug!(prefix = %tunnel_prefix, "tunnel closed by backend"),
                Err(err) => debug!(prefix = %tunnel_prefix, "tunnel failed: {err}"),
            }
        });
        Ok(Self {
            prefix,
            sender,
            driver,
        })
    }

    #[inline]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Whether requests for `path` are routed to this tunnel.
    #[inline]
    pub fn covers(&self, path: &str) -> bool {
        path.starts_with(&self.prefix)
    }

    /// Whether the connection behind the tunnel is gone.
    #[cfg(test)]
    fn is_closed(&self) -> bool {
        self.sender.is_closed() || self.driver.is_finished()
    }

    /// Writes `request` onto the tunnel and waits for the response head.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BackendFailure`] when the tunnel is dead or the
    /// backend answers with something that is not an HTTP response.
    #[allow(clippy::missing_inline_in_public_items)]
    pub async fn send(&mut self, request: Request<Incoming>) -> Result<Response<Incoming>> {
        self.sender.ready().await.map_err(Error::BackendFailure)?;
        self.sender
            .send_request(request)
            .await
            .map_err(Error::BackendFailure)
    }
}

impl Drop for BackendTunnel {
    #[inline]
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Holds at most one [`BackendTunnel`].
///
/// The registry itself does no locking; the owner guards it with a
/// single mutex so that replacing the tunnel and relaying through it
/// never overlap.
#[derive(Debug, Default)]
pub struct Registry {
    tunnel: Option<BackendTunnel>,
}

impl Registry {
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self { tunnel: None }
    }

    #[cfg(test)]
    const fn is_empty(&self) -> bool {
        self.tunnel.is_none()
    }

    /// The prefix of the current tunnel, if any.
    #[inline]
    pub fn prefix(&self) -> Option<&str> {
        self.tunnel.as_ref().map(BackendTunnel::prefix)
    }

    /// Installs `tunnel`, closing the one it replaces.
    ///
    /// Returns whether a previous tunnel was replaced.
    #[inline]
    pub fn install(&mut self, tunnel: BackendTunnel) -> bool {
        let prefix = tunnel.prefix.clone();
        match self.tunnel.replace(tunnel) {
            Some(old) => {
                info!(old = %old.prefix, new = %prefix, "Switching backends");
                drop(old);
                true
            }
            None => {
                info!(%prefix, "We now have a backend!");
                false
            }
        }
    }

    /// The tunnel responsible for `path`.
    #[inline]
    pub fn route(&mut self, path: &str) -> Option<&mut BackendTunnel> {
        self.tunnel.as_mut().filter(|tunnel| tunnel.covers(path))
    }

    /// Discards the current tunnel, closing it.
    #[inline]
    pub fn clear(&mut self) -> Option<String> {
        self.tunnel.take().map(|tunnel| tunnel.prefix.clone())
    }
}
