// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! RPC channel to one backend endpoint.

use super::core::stub::Stub;
use super::core::{self, Channel, NewClient, RpcError};
use crate::discover::Endpoint;
use crate::transport::codec::{Bincode, Codec, Json};
use crate::transport::{self, Transport};
use crate::{context, ClientMessage, Message, RequestName, Response};
use anyhow::Context as _;
use socket2::{SockRef, TcpKeepalive};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// TCP keepalive probing applied to every backend socket.
///
/// After `idle` without traffic the kernel sends a probe every `interval`;
/// after `retries` unanswered probes the socket is considered dead and calls
/// on it fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Keepalive {
    /// Idle time before the first probe. Default is 30s.
    pub idle: Duration,
    /// Time between probes, and how long each probe waits. Default is 10s.
    pub interval: Duration,
    /// Unanswered probes before the connection is dropped. Default is 3.
    pub retries: u32,
}

impl Default for Keepalive {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(30),
            interval: Duration::from_secs(10),
            retries: 3,
        }
    }
}

impl Keepalive {
    fn apply(&self, stream: &TcpStream) -> std::io::Result<()> {
        let keepalive = TcpKeepalive::new().with_time(self.idle);
        #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd", target_os = "macos", target_os = "ios", windows))]
        let keepalive = keepalive.with_interval(self.interval);
        #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd", target_os = "macos", target_os = "ios"))]
        let keepalive = keepalive.with_retries(self.retries);
        SockRef::from(stream).set_tcp_keepalive(&keepalive)
    }
}

/// Settings that control how backend connections are dialed.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct DialConfig {
    /// Upper bound of one connection attempt. Default is 5s.
    pub dial_timeout: Duration,
    /// TCP keepalive policy.
    pub keepalive: Keepalive,
    /// transport codec type.
    pub transport_codec: Codec,
    /// Maximum frame length, default is usize::MAX.
    pub max_frame_len: usize,
    /// Settings that control the behavior of the underlying client.
    pub core_config: core::Config,
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(5),
            keepalive: Keepalive::default(),
            transport_codec: Codec::default(),
            max_frame_len: usize::MAX,
            core_config: core::Config::default(),
        }
    }
}

impl DialConfig {
    /// Set the upper bound of one connection attempt.
    pub fn with_dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.dial_timeout = dial_timeout;
        self
    }
    /// Set the TCP keepalive policy.
    pub fn with_keepalive(mut self, keepalive: Keepalive) -> Self {
        self.keepalive = keepalive;
        self
    }
    /// Set transport serde codec
    pub fn with_transport_codec(mut self, transport_codec: Codec) -> Self {
        self.transport_codec = transport_codec;
        self
    }
    /// Set maximum frame length, zero means usize::MAX.
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = if max_frame_len == 0 { usize::MAX } else { max_frame_len };
        self
    }
    /// The number of requests that can be in flight at once.
    /// `max_in_flight_requests` controls the size of the map used by the client
    /// for storing pending requests.
    /// Default is 1000.
    pub fn with_max_in_flight_requests(mut self, max_in_flight_requests: usize) -> Self {
        self.core_config.max_in_flight_requests = max_in_flight_requests;
        self
    }
    /// The number of requests that can be buffered client-side before being sent.
    /// `pending_requests_buffer` controls the size of the channel clients use
    /// to communicate with the request dispatch task.
    /// Default is 100.
    pub fn with_pending_request_buffer(mut self, pending_request_buffer: usize) -> Self {
        self.core_config.pending_request_buffer = pending_request_buffer;
        self
    }
}

/// Aborts the request dispatch task, and with it the socket, once dropped.
struct DispatchGuard(AbortHandle);

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// An established channel to one backend [`Endpoint`].
///
/// Clones share the same socket, which carries any number of concurrent
/// calls. The socket closes when [`BackendConnection::close`] is called or
/// the last clone is dropped.
pub struct BackendConnection<Req, Resp> {
    endpoint: Endpoint,
    channel: Channel<Req, Resp>,
    dispatch: Arc<DispatchGuard>,
}

impl<Req, Resp> Clone for BackendConnection<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            endpoint: self.endpoint.clone(),
            channel: self.channel.clone(),
            dispatch: self.dispatch.clone(),
        }
    }
}

impl<Req, Resp> fmt::Debug for BackendConnection<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConnection").field("endpoint", &self.endpoint).finish()
    }
}

impl<Req, Resp> BackendConnection<Req, Resp>
where
    Req: Message,
    Resp: Message,
{
    /// Dials `endpoint`, bounded by [`DialConfig::dial_timeout`].
    pub async fn dial(endpoint: Endpoint, config: &DialConfig) -> Result<Self, anyhow::Error> {
        let stream = tokio::time::timeout(config.dial_timeout, TcpStream::connect(endpoint.addr))
            .await
            .map_err(|_| anyhow::anyhow!("dialing {endpoint} timed out after {:?}", config.dial_timeout))?
            .with_context(|| format!("failed to dial {endpoint}"))?;
        stream.set_nodelay(true)?;
        config.keepalive.apply(&stream).with_context(|| format!("failed to enable keepalive towards {endpoint}"))?;
        let framed = transport::framed(stream, config.max_frame_len);
        let (channel, dispatch) = match config.transport_codec {
            // Bincode codec using [bincode](https://docs.rs/bincode) crate.
            Codec::Bincode => Self::spawn(&endpoint, config.core_config.clone(), transport::new(framed, Bincode::default())),
            // JSON codec using [serde_json](https://docs.rs/serde_json) crate.
            Codec::Json => Self::spawn(&endpoint, config.core_config.clone(), transport::new(framed, Json::default())),
        };
        debug!("[LBPROXY] connected to backend {endpoint}");
        Ok(Self {
            endpoint,
            channel,
            dispatch: Arc::new(DispatchGuard(dispatch)),
        })
    }

    fn spawn<T>(endpoint: &Endpoint, core_config: core::Config, transport: T) -> (Channel<Req, Resp>, AbortHandle)
    where
        T: Transport<ClientMessage<Req>, Response<Resp>> + Send + 'static,
    {
        let NewClient { client, dispatch } = core::new(core_config, transport);
        let endpoint = endpoint.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = dispatch.await {
                warn!("[LBPROXY] connection to backend {endpoint} broke: {e}");
            }
        });
        (client, handle.abort_handle())
    }
}

impl<Req, Resp> BackendConnection<Req, Resp> {
    /// The endpoint this connection was dialed to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Closes the socket. Calls made afterwards fail with [`RpcError::Shutdown`].
    pub fn close(&self) {
        self.dispatch.0.abort();
    }
}

impl<Req, Resp> Stub for BackendConnection<Req, Resp>
where
    Req: RequestName,
{
    type Req = Req;
    type Resp = Resp;

    async fn call(&self, ctx: context::Context, request: Req) -> Result<Resp, RpcError> {
        Stub::call(&self.channel, ctx, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::{BackendConnection, DialConfig, Keepalive};
    use crate::discover::Endpoint;
    use std::time::Duration;

    #[test]
    fn dial_config_defaults() {
        let config = DialConfig::default();
        assert_eq!(config.dial_timeout, Duration::from_secs(5));
        assert_eq!(config.keepalive, Keepalive::default());
        assert_eq!(config.max_frame_len, usize::MAX);
        assert_eq!(config.with_max_frame_len(0).max_frame_len, usize::MAX);
    }

    #[tokio::test]
    async fn dial_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let res = BackendConnection::<String, String>::dial(Endpoint::new(addr), &DialConfig::default()).await;
        assert!(res.is_err());
    }
}
