// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Connection pool.

use super::balanced::BalancedChannel;
use super::channel::{BackendConnection, DialConfig};
use super::core::stub::Stub;
use super::core::RpcError;
use crate::discover::{Resolve, Target};
use crate::error::ProxyError;
use crate::{context, Message, RequestName};
use faststr::FastStr;
use futures::future::join_all;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// One addressable entry of the [`ConnectionPool`].
pub enum Connection<Req, Resp> {
    /// A connection to a single endpoint.
    Direct(BackendConnection<Req, Resp>),
    /// A logical connection balancing over a re-resolved endpoint set.
    Balanced(Arc<BalancedChannel<Req, Resp>>),
}

impl<Req, Resp> Clone for Connection<Req, Resp> {
    fn clone(&self) -> Self {
        match self {
            Connection::Direct(c) => Connection::Direct(c.clone()),
            Connection::Balanced(c) => Connection::Balanced(c.clone()),
        }
    }
}

impl<Req, Resp> fmt::Debug for Connection<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Connection::Direct(c) => f.debug_tuple("Direct").field(c.endpoint()).finish(),
            Connection::Balanced(c) => f.debug_tuple("Balanced").field(c.target()).finish(),
        }
    }
}

impl<Req, Resp> Connection<Req, Resp> {
    /// A printable name of where calls on this connection go.
    pub fn label(&self) -> FastStr {
        match self {
            Connection::Direct(c) => FastStr::from(c.endpoint().to_string()),
            Connection::Balanced(c) => FastStr::from(format!("dns:///{}", c.target())),
        }
    }

    fn close(&self) {
        match self {
            Connection::Direct(c) => c.close(),
            Connection::Balanced(c) => c.close(),
        }
    }
}

impl<Req, Resp> Stub for Connection<Req, Resp>
where
    Req: RequestName + Send + Sync + 'static,
    Resp: Send + Sync + 'static,
{
    type Req = Req;
    type Resp = Resp;

    async fn call(&self, ctx: context::Context, request: Req) -> Result<Resp, RpcError> {
        match self {
            Connection::Direct(c) => c.call(ctx, request).await,
            Connection::Balanced(c) => c.call(ctx, request).await,
        }
    }
}

/// The ordered set of backend connections, in discovery order.
///
/// Entries are never evicted: a connection whose backend went away stays
/// addressable and its calls fail individually. Every socket the pool opened
/// is closed by [`ConnectionPool::close`] or when the pool is dropped.
pub struct ConnectionPool<Req, Resp> {
    connections: Vec<Connection<Req, Resp>>,
}

impl<Req, Resp> std::fmt::Debug for ConnectionPool<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("connections", &self.connections.len())
            .finish()
    }
}

impl<Req, Resp> ConnectionPool<Req, Resp>
where
    Req: Message,
    Resp: Message,
{
    /// Dials every endpoint of `target`.
    ///
    /// Endpoints that cannot be dialed are logged and skipped; if none is
    /// left the pool fails with [`ProxyError::NoBackendsAvailable`]. A
    /// delegated target yields a pool of exactly one [`BalancedChannel`].
    pub async fn connect<R: Resolve>(target: Target<R>, config: &DialConfig) -> Result<Self, ProxyError> {
        let connections = match target {
            Target::Endpoints(endpoints) => {
                let attempted = endpoints.len();
                let dials = endpoints.into_iter().map(|endpoint| async move {
                    match BackendConnection::dial(endpoint.clone(), config).await {
                        Ok(connection) => {
                            info!("[LBPROXY] connected to backend {endpoint}");
                            Some(Connection::Direct(connection))
                        },
                        Err(e) => {
                            warn!("[LBPROXY] skipping backend {endpoint}: {e:?}");
                            None
                        },
                    }
                });
                let connections: Vec<_> = join_all(dials).await.into_iter().flatten().collect();
                if connections.is_empty() {
                    return Err(ProxyError::no_backends(format!("none of {attempted} backend(s) could be dialed")));
                }
                connections
            },
            Target::Delegated(discover) => {
                let target = FastStr::from(discover.target());
                let channel = BalancedChannel::spawn(target, discover, config.clone()).await?;
                vec![Connection::Balanced(Arc::new(channel))]
            },
        };
        Ok(Self { connections })
    }
}

impl<Req, Resp> ConnectionPool<Req, Resp> {
    /// Pooled connections, in discovery order.
    pub fn connections(&self) -> &[Connection<Req, Resp>] {
        &self.connections
    }

    /// Number of pooled connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether the pool holds no connection.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Closes every connection the pool opened.
    pub fn close(&self) {
        for connection in &self.connections {
            connection.close();
        }
    }
}

impl<Req, Resp> Drop for ConnectionPool<Req, Resp> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::{Connection, ConnectionPool};
    use crate::client::channel::DialConfig;
    use crate::client::core::stub::Stub;
    use crate::client::RpcError;
    use crate::context;
    use crate::discover::{Endpoint, SystemResolver, Target};
    use crate::error::ProxyError;
    use assert_matches::assert_matches;
    use futures::prelude::*;
    use std::net::SocketAddr;
    use std::time::Duration;
    use ::tarpc::server::{self, Channel};

    #[::tarpc::service]
    trait Echo {
        async fn echo(text: String) -> String;
    }

    #[derive(Clone)]
    struct EchoServer(u16);

    impl Echo for EchoServer {
        async fn echo(self, _: context::Context, text: String) -> String {
            format!("{}:{text}", self.0)
        }
    }

    async fn spawn(fut: impl Future<Output = ()> + Send + 'static) {
        tokio::spawn(fut);
    }

    async fn start_echo(id: u16) -> SocketAddr {
        let listener = ::tarpc::serde_transport::tcp::listen("127.0.0.1:0", ::tarpc::tokio_serde::formats::Bincode::default).await.unwrap();
        let addr = listener.local_addr();
        tokio::spawn(
            listener
                .filter_map(|r| future::ready(r.ok()))
                .map(server::BaseChannel::with_defaults)
                .map(move |channel| channel.execute(EchoServer(id).serve()).for_each(spawn))
                .buffer_unordered(10)
                .for_each(|_| async {}),
        );
        addr
    }

    fn dead_addr() -> SocketAddr {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    fn dial_config() -> DialConfig {
        DialConfig::default().with_dial_timeout(Duration::from_secs(2))
    }

    #[tokio::test]
    async fn skips_unreachable_backends() {
        let alive = start_echo(1).await;
        let endpoints = vec![Endpoint::new(dead_addr()), Endpoint::new(alive)];
        let pool = ConnectionPool::<EchoRequest, EchoResponse>::connect(Target::<SystemResolver>::Endpoints(endpoints), &dial_config()).await.unwrap();
        assert_eq!(pool.len(), 1);
        assert_matches!(&pool.connections()[0], Connection::Direct(c) if c.endpoint().addr == alive);

        let resp = pool.connections()[0].call(context::current(), EchoRequest::Echo { text: "hi".into() }).await.unwrap();
        assert_matches!(resp, EchoResponse::Echo(text) if text == "1:hi");
    }

    #[tokio::test]
    async fn keeps_discovery_order() {
        let first = start_echo(1).await;
        let second = start_echo(2).await;
        let endpoints = vec![Endpoint::new(second), Endpoint::new(first)];
        let pool = ConnectionPool::<EchoRequest, EchoResponse>::connect(Target::<SystemResolver>::Endpoints(endpoints), &dial_config()).await.unwrap();
        let labels: Vec<_> = pool.connections().iter().map(|c| c.label().to_string()).collect();
        assert_eq!(labels, vec![second.to_string(), first.to_string()]);
    }

    #[tokio::test]
    async fn no_reachable_backend() {
        let endpoints = vec![Endpoint::new(dead_addr()), Endpoint::new(dead_addr())];
        let res = ConnectionPool::<EchoRequest, EchoResponse>::connect(Target::<SystemResolver>::Endpoints(endpoints), &dial_config()).await;
        assert_matches!(res, Err(ProxyError::NoBackendsAvailable(_)));
    }

    #[tokio::test]
    async fn closed_connection_fails_per_call() {
        let alive = start_echo(1).await;
        let pool = ConnectionPool::<EchoRequest, EchoResponse>::connect(Target::<SystemResolver>::Endpoints(vec![Endpoint::new(alive)]), &dial_config()).await.unwrap();
        let connection = pool.connections()[0].clone();
        pool.close();
        tokio::task::yield_now().await;
        let res = connection.call(context::current(), EchoRequest::Echo { text: "hi".into() }).await;
        assert_matches!(res, Err(RpcError::Shutdown));
        // Still addressable.
        assert_eq!(pool.len(), 1);
    }
}
