//! The broker server: one endpoint, one serve loop, one registry.
//!
//! The serve loop receives a request, dispatches it against the registry and
//! sends exactly one response to the sender's endpoint before receiving the
//! next. The loop owns all server state by value, so requests are serialized
//! without any locking.

mod dispatch;

pub use dispatch::ServerState;

use crate::config::BrokerConfig;
use crate::device::DeviceDriver;
use crate::error::{Error, Result};
use crate::identity::ProcessIdentity;
use crate::ipc::{Endpoint, send_with_handle};
use crate::observability::{self, span_request, span_server};
use crate::protocol::{Command, MAX_DATAGRAM_SIZE, Request, Response, StatusCode};
use crate::registry::Registry;
use dispatch::{Dispatcher, Outcome, Reply};
use rustix::fd::AsFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// A bound broker server, ready to serve.
pub struct Server {
    endpoint: Endpoint,
    config: BrokerConfig,
    dispatcher: Dispatcher,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("endpoint", &self.endpoint.path())
            .field("state", self.dispatcher.state())
            .finish()
    }
}

impl Server {
    /// Bind the well-known endpoint and initialize device state.
    ///
    /// Fails if the endpoint path already exists; stale files must be
    /// removed by the caller first.
    pub fn bind(config: BrokerConfig, driver: Arc<dyn DeviceDriver>) -> Result<Self> {
        config.ensure_runtime_dir()?;
        let endpoint = Endpoint::bind(config.server_endpoint())?;
        endpoint.set_timeout(None)?;
        let state = ServerState::initialize(driver.as_ref())?;
        tracing::info!(endpoint = %endpoint.path().display(), "server bound");
        Ok(Self {
            endpoint,
            config,
            dispatcher: Dispatcher::new(driver, state),
        })
    }

    /// Path of the bound endpoint.
    pub fn path(&self) -> &Path {
        self.endpoint.path()
    }

    /// Device state created at bind time.
    pub fn state(&self) -> &ServerState {
        self.dispatcher.state()
    }

    /// The registry as it stands.
    pub fn registry(&self) -> &Registry {
        self.dispatcher.registry()
    }

    /// Serve requests until HALT or a fatal device error.
    ///
    /// On return the endpoint is unlinked and the registry dropped, releasing
    /// the server's reference to every region.
    pub fn serve(mut self) -> Result<()> {
        let span = span_server(self.endpoint.path());
        let _guard = span.enter();
        tracing::info!("serving");

        // One spare byte so an oversized datagram fails to decode instead of
        // being silently cut to the limit.
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE + 1];
        loop {
            let (len, source) = match self.endpoint.recv_from(&mut buf) {
                Ok(received) => received,
                Err(Error::Timeout) => continue,
                Err(e) => {
                    tracing::error!("receive failed: {}", e);
                    return Err(e);
                }
            };

            let request = match Request::from_bytes(&buf[..len]) {
                Ok(request) => request,
                Err(e) => {
                    self.reject_undecodable(source, e);
                    continue;
                }
            };

            let started = Instant::now();
            let outcome = {
                let _req = span_request(request.command, request.sender.pid).entered();
                let outcome = self.dispatcher.dispatch(&request);
                let delivered = self.send_reply(&request, outcome.reply());
                if !delivered && request.command == Command::Allocate {
                    if let Some(handle) = outcome.reply().response.handle {
                        self.dispatcher.discard_region(handle);
                    }
                }
                outcome
            };

            let status = outcome.reply().response.status;
            observability::record_request(request.command, status, started.elapsed());
            let registry = self.dispatcher.registry();
            observability::record_registry(registry.len(), registry.subscriber_count());

            match outcome {
                Outcome::Continue(_) => {}
                Outcome::Halt(_) => {
                    tracing::info!(pid = request.sender.pid, "halt requested");
                    return Ok(());
                }
                Outcome::Fatal(_, e) => {
                    tracing::error!(
                        command = %request.command,
                        pid = request.sender.pid,
                        "device failure, shutting down: {}",
                        e
                    );
                    return Err(e);
                }
            }
        }
    }

    fn reply_path(&self, identity: &ProcessIdentity) -> PathBuf {
        self.config.client_endpoint(&identity.endpoint_name())
    }

    /// Send `reply` to the requester. Returns false if it was not delivered.
    fn send_reply(&self, request: &Request, reply: &Reply) -> bool {
        let peer = self.reply_path(&request.sender);
        let sent = reply.response.to_bytes().and_then(|bytes| match &reply.handle {
            Some(fd) => send_with_handle(&peer, &bytes, fd.as_fd()),
            None => self.endpoint.send_to(&bytes, &peer),
        });
        match sent {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    peer = %peer.display(),
                    status = %reply.response.status,
                    "failed to send response: {}",
                    e
                );
                false
            }
        }
    }

    fn reject_undecodable(&self, source: Option<PathBuf>, error: Error) {
        let Some(peer) = source else {
            tracing::warn!("dropping undecodable datagram from unnamed socket: {}", error);
            return;
        };
        tracing::warn!(peer = %peer.display(), "undecodable request: {}", error);
        let response = Response::new(StatusCode::InvalidRequest, ProcessIdentity::with_pid(0, 0));
        let sent = response
            .to_bytes()
            .and_then(|bytes| self.endpoint.send_to(&bytes, &peer));
        if let Err(e) = sent {
            tracing::warn!(peer = %peer.display(), "failed to send rejection: {}", e);
        }
    }
}
