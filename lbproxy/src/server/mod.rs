// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Proxy front-end: accepts calls and forwards each one to a pooled backend.

use crate::client::balance::{LoadBalance, RoundRobin};
use crate::client::core::stub::Stub;
use crate::client::{Connection, ConnectionPool, DialConfig, RpcError};
use crate::discover::{self, BackendSpec, Resolve, SystemResolver};
use crate::error::{CallError, ProxyError};
use crate::transport::codec::{Bincode, Codec, Json};
use crate::transport::{self, HangupStream, Transport};
use crate::{context, ClientMessage, Message, RequestName, Response, ServerError};
use futures::prelude::*;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

pub use core::*;

mod core {
    pub use ::tarpc::server::*;
}

/// Settings of the listening side.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerConfig {
    /// transport codec type.
    pub(crate) transport_codec: Codec,
    /// Maximum frame length, default is usize::MAX.
    pub(crate) max_frame_len: usize,
    /// Controls the buffer size of the in-process channel over which a server's handlers send
    /// responses to the [`Channel`]. In other words, this is the number of responses that can sit
    /// in the outbound queue before request handlers begin blocking.
    /// Default is 100.
    pub(crate) pending_response_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport_codec: Codec::default(),
            max_frame_len: usize::MAX,
            pending_response_buffer: Config::default().pending_response_buffer,
        }
    }
}

impl ServerConfig {
    /// Set transport codec type.
    pub fn with_transport_codec(mut self, transport_codec: Codec) -> Self {
        self.transport_codec = transport_codec;
        self
    }
    /// transport codec type.
    pub fn transport_codec(&self) -> Codec {
        self.transport_codec
    }
    /// Set maximum frame length, zero means usize::MAX.
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = if max_frame_len == 0 { usize::MAX } else { max_frame_len };
        self
    }
    /// Maximum frame length, default is usize::MAX.
    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
    /// Set the buffer size of the in-process channel over which a server's handlers send
    /// responses to the [`Channel`], zero means 100.
    pub fn with_pending_response_buffer(mut self, pending_response_buffer: usize) -> Self {
        self.pending_response_buffer = if pending_response_buffer == 0 { 100 } else { pending_response_buffer };
        self
    }
    /// Number of responses that can sit in the outbound queue before request handlers begin blocking.
    pub fn pending_response_buffer(&self) -> usize {
        self.pending_response_buffer
    }
}

/// Everything needed to start a [`Proxy`].
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ProxyConfig {
    /// Address the front-end listens on.
    pub listen_address: SocketAddr,
    /// Where the backends are.
    pub backends: BackendSpec,
    /// Re-resolution interval of `dns:///` backends. Default is 30s.
    pub refresh_interval: Duration,
    /// How backends are dialed.
    pub dial: DialConfig,
    /// How callers are served.
    pub server: ServerConfig,
}

impl ProxyConfig {
    /// Create a proxy config with default dial and server settings.
    pub fn new(listen_address: SocketAddr, backends: BackendSpec) -> Self {
        Self {
            listen_address,
            backends,
            refresh_interval: Duration::from_secs(30),
            dial: DialConfig::default(),
            server: ServerConfig::default(),
        }
    }
    /// Set the transport codec used towards callers and backends alike.
    pub fn with_transport_codec(mut self, transport_codec: Codec) -> Self {
        self.dial = self.dial.with_transport_codec(transport_codec);
        self.server = self.server.with_transport_codec(transport_codec);
        self
    }
    /// Set the re-resolution interval of `dns:///` backends.
    pub fn with_refresh_interval(mut self, refresh_interval: Duration) -> Self {
        self.refresh_interval = refresh_interval;
        self
    }
    /// Set how backends are dialed.
    pub fn with_dial_config(mut self, dial: DialConfig) -> Self {
        self.dial = dial;
        self
    }
    /// Set how callers are served.
    pub fn with_server_config(mut self, server: ServerConfig) -> Self {
        self.server = server;
        self
    }
}

/// A [`Serve`] that hands every request to the next pooled connection.
///
/// Exactly one delegate call is made per request, with the caller's context,
/// so deadlines carry over and dropping the request drops the delegate call.
/// Responses and backend-side errors come back untouched.
pub struct Forward<Req, Resp> {
    balance: Arc<RoundRobin<Connection<Req, Resp>>>,
}

impl<Req, Resp> Clone for Forward<Req, Resp> {
    fn clone(&self) -> Self {
        Self { balance: self.balance.clone() }
    }
}

impl<Req, Resp> fmt::Debug for Forward<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Forward").field("balance", &self.balance).finish()
    }
}

impl<Req, Resp> Forward<Req, Resp> {
    /// Forwards over `connections` in the given order.
    pub fn new(connections: Vec<Connection<Req, Resp>>) -> Self {
        Self {
            balance: Arc::new(RoundRobin::new(connections)),
        }
    }
}

impl<Req, Resp> Forward<Req, Resp>
where
    Req: RequestName + Send + Sync + 'static,
    Resp: Send + Sync + 'static,
{
    /// Forwards one call.
    pub async fn forward(&self, ctx: context::Context, request: Req) -> Result<Resp, ServerError> {
        let Some(connection) = self.balance.select() else {
            return Err(CallError::BackendUnreachable {
                endpoint: "<none>".into(),
                detail: "the connection pool is empty".into(),
            }
            .into());
        };
        trace!("[LBPROXY] forwarding to {}", connection.label());
        match connection.call(ctx, request).await {
            Ok(response) => Ok(response),
            Err(RpcError::Server(err)) => Err(err),
            Err(RpcError::DeadlineExceeded) => {
                let err = CallError::CallCancelled {
                    endpoint: connection.label(),
                    detail: "deadline exceeded".into(),
                };
                debug!("[LBPROXY] {err}");
                Err(err.into())
            },
            Err(err) => {
                let err = CallError::BackendUnreachable {
                    endpoint: connection.label(),
                    detail: err.to_string().into(),
                };
                warn!("[LBPROXY] {err}");
                Err(err.into())
            },
        }
    }
}

impl<Req, Resp> Serve for Forward<Req, Resp>
where
    Req: RequestName + Send + Sync + 'static,
    Resp: Send + Sync + 'static,
{
    type Req = Req;
    type Resp = Resp;

    async fn serve(self, ctx: context::Context, req: Req) -> Result<Resp, ServerError> {
        self.forward(ctx, req).await
    }
}

/// A running proxy: backends dialed and the listening port bound.
pub struct Proxy<Req, Resp> {
    listener: TcpListener,
    forward: Forward<Req, Resp>,
    pool: ConnectionPool<Req, Resp>,
    config: ServerConfig,
}

impl<Req, Resp> std::fmt::Debug for Proxy<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("listener", &self.listener)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<Req, Resp> Proxy<Req, Resp>
where
    Req: Message + RequestName + Sync,
    Resp: Message + Sync,
{
    /// Resolves, dials and binds using the system resolver.
    pub async fn start(config: ProxyConfig) -> Result<Self, ProxyError> {
        Self::start_with_resolver(config, SystemResolver).await
    }

    /// Resolves, dials and binds, in that order.
    ///
    /// The listening port is only bound once the pool holds at least one
    /// ready connection, so a proxy without backends never accepts calls.
    pub async fn start_with_resolver<R: Resolve>(config: ProxyConfig, resolver: R) -> Result<Self, ProxyError> {
        let target = discover::resolve(&config.backends, resolver, config.refresh_interval).await?;
        debug!("[LBPROXY] {} resolved to {target:?}", config.backends);
        let pool = ConnectionPool::connect(target, &config.dial).await?;
        let listener = TcpListener::bind(config.listen_address).await.map_err(|source| ProxyError::Bind {
            addr: config.listen_address,
            source,
        })?;
        let forward = Forward::new(pool.connections().to_vec());
        info!(
            "[LBPROXY] Listening on {} with {} backend connection(s)",
            listener.local_addr().unwrap_or(config.listen_address),
            pool.len()
        );
        Ok(Self {
            listener,
            forward,
            pool,
            config: config.server,
        })
    }

    /// The bound listening address.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The backend connections calls are spread over.
    pub fn pool(&self) -> &ConnectionPool<Req, Resp> {
        &self.pool
    }

    /// Accepts callers until `shutdown` completes, then closes every backend connection.
    pub async fn serve(self, shutdown: impl Future<Output = ()>) -> Result<(), ProxyError> {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.serve_connection(stream, peer),
                    // Ignore accept errors.
                    Err(e) => warn!("[LBPROXY] failed to accept a caller: {e}"),
                },
            }
        }
        info!("[LBPROXY] shutting down, closing {} backend connection(s)", self.pool.len());
        self.pool.close();
        Ok(())
    }

    fn serve_connection(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("[LBPROXY] set_nodelay for {peer} failed: {e}");
        }
        let hangup = CancellationToken::new();
        let framed = transport::framed(HangupStream::new(stream, hangup.clone()), self.config.max_frame_len);
        match self.config.transport_codec {
            // Bincode codec using [bincode](https://docs.rs/bincode) crate.
            Codec::Bincode => self.spawn_channel(peer, hangup, transport::new(framed, Bincode::default())),
            // JSON codec using [serde_json](https://docs.rs/serde_json) crate.
            Codec::Json => self.spawn_channel(peer, hangup, transport::new(framed, Json::default())),
        }
    }

    /// Serves one caller. Its in-flight calls are aborted, and with them the
    /// delegate calls, as soon as the caller hangs up.
    fn spawn_channel<T>(&self, peer: SocketAddr, hangup: CancellationToken, transport: T)
    where
        T: Transport<Response<Resp>, ClientMessage<Req>> + Send + 'static,
    {
        let mut config = Config::default();
        config.pending_response_buffer = self.config.pending_response_buffer;
        let channel = BaseChannel::new(config, transport);
        let forward = self.forward.clone();
        debug!("[LBPROXY] accepted caller {peer}");
        tokio::spawn(async move {
            let responses = channel.execute(forward);
            tokio::pin!(responses);
            // Handle all requests concurrently.
            let mut in_flight = JoinSet::new();
            loop {
                tokio::select! {
                    _ = hangup.cancelled() => break,
                    response = responses.next() => match response {
                        Some(response) => {
                            in_flight.spawn(response);
                        },
                        None => break,
                    },
                    Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {},
                }
            }
            if in_flight.is_empty() {
                debug!("[LBPROXY] caller {peer} disconnected");
            } else {
                debug!("[LBPROXY] caller {peer} disconnected, aborting {} in-flight call(s)", in_flight.len());
            }
            in_flight.abort_all();
        });
    }
}
