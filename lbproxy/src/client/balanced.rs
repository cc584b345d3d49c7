// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! A single logical channel balancing over a re-resolved endpoint set.

use super::balance::{LoadBalance, RoundRobin};
use super::channel::{BackendConnection, DialConfig};
use super::core::stub::Stub;
use super::core::RpcError;
use crate::discover::{Discover, Endpoint};
use crate::error::ProxyError;
use crate::{context, Message, RequestName};
use async_broadcast::{Receiver, RecvError};
use faststr::FastStr;
use futures::future::join_all;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A channel that owns one connection per endpoint of a [`Discover`] and
/// round-robins over them.
///
/// Endpoint changes reported by [`Discover::watch`] are applied in the
/// background: unchanged endpoints keep their connection, new ones are
/// dialed and vanished ones are closed.
pub struct BalancedChannel<Req, Resp> {
    target: FastStr,
    balance: Arc<RoundRobin<BackendConnection<Req, Resp>>>,
    cancel: CancellationToken,
}

impl<Req, Resp> BalancedChannel<Req, Resp>
where
    Req: Message,
    Resp: Message,
{
    /// Resolves `discover`, dials every endpoint and starts following its changes.
    ///
    /// Fails with [`ProxyError::NoBackendsAvailable`] unless at least one
    /// endpoint could be dialed.
    pub async fn spawn<D: Discover>(target: FastStr, discover: D, config: DialConfig) -> Result<Self, ProxyError> {
        let endpoints = discover.discover().await?;
        let connections = diff_and_dial(&[], endpoints, &config).await;
        if connections.is_empty() {
            return Err(ProxyError::no_backends(format!("no endpoint of {target} could be dialed")));
        }
        info!("[LBPROXY] balancing {target} over {} backend(s)", connections.len());
        let balance = Arc::new(RoundRobin::new(connections));
        let cancel = CancellationToken::new();
        if let Some(changes) = discover.watch() {
            tokio::spawn(follow(target.clone(), changes, balance.clone(), config, cancel.clone()));
        }
        Ok(Self { target, balance, cancel })
    }
}

impl<Req, Resp> BalancedChannel<Req, Resp> {
    /// The target being balanced, such as `hello-server:50051`.
    pub fn target(&self) -> &FastStr {
        &self.target
    }

    /// Endpoints currently balanced over, in selection order.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.balance.snapshot().iter().map(|c| c.endpoint().clone()).collect()
    }

    /// Stops following changes and closes every connection.
    pub fn close(&self) {
        self.cancel.cancel();
        for connection in self.balance.snapshot().iter() {
            connection.close();
        }
    }
}

impl<Req, Resp> Drop for BalancedChannel<Req, Resp> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl<Req, Resp> Stub for BalancedChannel<Req, Resp>
where
    Req: RequestName + Send + Sync + 'static,
    Resp: Send + Sync + 'static,
{
    type Req = Req;
    type Resp = Resp;

    async fn call(&self, ctx: context::Context, request: Req) -> Result<Resp, RpcError> {
        match self.balance.select() {
            Some(connection) => connection.call(ctx, request).await,
            None => Err(RpcError::Shutdown),
        }
    }
}

async fn follow<Req, Resp>(
    target: FastStr,
    mut changes: Receiver<Vec<Endpoint>>,
    balance: Arc<RoundRobin<BackendConnection<Req, Resp>>>,
    config: DialConfig,
    cancel: CancellationToken,
) where
    Req: Message,
    Resp: Message,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            next = changes.recv() => match next {
                Ok(next) => {
                    let prev = balance.snapshot();
                    let connections = diff_and_dial(&prev, next, &config).await;
                    if connections.is_empty() {
                        warn!("[LBPROXY] {target} has no reachable backend left");
                    }
                    if !install(&balance, connections, &cancel) {
                        return;
                    }
                },
                Err(RecvError::Overflowed(skipped)) => warn!("[LBPROXY] skipped {skipped} endpoint update(s) of {target}"),
                Err(RecvError::Closed) => return,
            },
        }
    }
}

/// Swaps `connections` in. If the channel was closed meanwhile they are
/// closed as well and `false` is returned.
///
/// [`BalancedChannel::close`] cancels before reading the snapshot, so the
/// check after the swap cannot miss a concurrent close.
fn install<Req, Resp>(balance: &RoundRobin<BackendConnection<Req, Resp>>, connections: Vec<BackendConnection<Req, Resp>>, cancel: &CancellationToken) -> bool
where
    Req: Message,
    Resp: Message,
{
    balance.rebalance(connections);
    if cancel.is_cancelled() {
        for connection in balance.snapshot().iter() {
            connection.close();
        }
        return false;
    }
    true
}

/// Builds the connection list for `next`, reusing connections of `prev` with
/// the same address and closing the ones no longer present.
async fn diff_and_dial<Req, Resp>(prev: &[BackendConnection<Req, Resp>], next: Vec<Endpoint>, config: &DialConfig) -> Vec<BackendConnection<Req, Resp>>
where
    Req: Message,
    Resp: Message,
{
    let dials = next.into_iter().map(|endpoint| async move {
        if let Some(existing) = prev.iter().find(|c| c.endpoint().addr == endpoint.addr) {
            return Some(existing.clone());
        }
        match BackendConnection::dial(endpoint.clone(), config).await {
            Ok(connection) => {
                info!("[LBPROXY] added backend {endpoint}");
                Some(connection)
            },
            Err(e) => {
                warn!("[LBPROXY] skipping backend {endpoint}: {e:?}");
                None
            },
        }
    });
    let connections: Vec<_> = join_all(dials).await.into_iter().flatten().collect();
    for old in prev {
        if connections.iter().all(|c| c.endpoint().addr != old.endpoint().addr) {
            info!("[LBPROXY] removed backend {}", old.endpoint());
            old.close();
        }
    }
    connections
}
