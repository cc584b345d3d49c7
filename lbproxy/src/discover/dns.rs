// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Name lookup discover.

use super::{Discover, Endpoint};
use crate::error::ProxyError;
use async_broadcast::Receiver;
use faststr::FastStr;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Name lookup used by [`DnsDiscover`].
pub trait Resolve: Send + Sync + 'static {
    /// Returns every address `host` resolves to, paired with `port`.
    fn resolve(&self, host: &str, port: u16) -> impl Future<Output = io::Result<Vec<SocketAddr>>> + Send;
}

/// Resolves through the operating system, see [`tokio::net::lookup_host`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemResolver;

impl Resolve for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        Ok(tokio::net::lookup_host((host, port)).await?.collect())
    }
}

/// [`DnsDiscover`] resolves one `host:port` into one endpoint per address.
///
/// With a refresh interval, [`Discover::watch`] re-resolves in the background
/// and broadcasts every changed endpoint list.
pub struct DnsDiscover<R: Resolve = SystemResolver> {
    host: FastStr,
    port: u16,
    resolver: Arc<R>,
    refresh: Option<Duration>,
}

impl<R: Resolve> DnsDiscover<R> {
    /// Creates a one-shot [`DnsDiscover`].
    pub fn new(host: FastStr, port: u16, resolver: R) -> Self {
        Self {
            host,
            port,
            resolver: Arc::new(resolver),
            refresh: None,
        }
    }

    /// Set the re-resolution interval used by [`Discover::watch`].
    pub fn with_refresh(mut self, refresh: Duration) -> Self {
        self.refresh = Some(refresh);
        self
    }

    /// `host:port` being resolved.
    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn lookup(resolver: &R, host: &FastStr, port: u16) -> Result<Vec<Endpoint>, ProxyError> {
        let addrs = resolver
            .resolve(host, port)
            .await
            .map_err(|e| ProxyError::no_backends(format!("failed to resolve {host}:{port}: {e}")))?;
        let mut endpoints: Vec<Endpoint> = Vec::with_capacity(addrs.len());
        for addr in addrs {
            if endpoints.iter().all(|e| e.addr != addr) {
                endpoints.push(Endpoint { host: host.clone(), addr });
            }
        }
        if endpoints.is_empty() {
            return Err(ProxyError::no_backends(format!("{host}:{port} resolved to zero addresses")));
        }
        debug!("[LBPROXY] {host}:{port} resolved to {} address(es)", endpoints.len());
        Ok(endpoints)
    }
}

impl<R: Resolve> Discover for DnsDiscover<R> {
    async fn discover(&self) -> Result<Vec<Endpoint>, ProxyError> {
        Self::lookup(&self.resolver, &self.host, self.port).await
    }

    /// Must be called from within a tokio runtime when a refresh interval is set.
    fn watch(&self) -> Option<Receiver<Vec<Endpoint>>> {
        let refresh = self.refresh?;
        let (mut sender, receiver) = async_broadcast::broadcast(1);
        sender.set_overflow(true);
        let resolver = self.resolver.clone();
        let host = self.host.clone();
        let port = self.port;
        tokio::spawn(async move {
            let mut last: Vec<Endpoint> = Vec::new();
            let mut ticker = tokio::time::interval(refresh);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if sender.receiver_count() == 0 {
                    break;
                }
                match Self::lookup(&resolver, &host, port).await {
                    Ok(next) if next == last => {},
                    Ok(next) => {
                        last = next.clone();
                        if sender.try_broadcast(next).is_err() {
                            break;
                        }
                    },
                    Err(err) => warn!("[LBPROXY] keeping the previous endpoints of {host}:{port}: {err}"),
                }
            }
            info!("[LBPROXY] stopped watching {host}:{port}");
        });
        Some(receiver)
    }
}
