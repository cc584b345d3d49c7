// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Fixed endpoint list discover.

use super::{Discover, Endpoint};
use crate::error::ProxyError;
use async_broadcast::Receiver;
use std::net::SocketAddr;

/// [`FixedDiscover`] is a simple implementation of [`Discover`] that returns a fixed list of endpoints.
#[derive(Clone, Debug)]
pub struct FixedDiscover {
    endpoints: Vec<Endpoint>,
}

impl FixedDiscover {
    /// Creates a new [`FixedDiscover`].
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self { endpoints }
    }
}

impl From<Vec<SocketAddr>> for FixedDiscover {
    fn from(addrs: Vec<SocketAddr>) -> Self {
        Self::new(addrs.into_iter().map(Endpoint::new).collect())
    }
}

impl Discover for FixedDiscover {
    async fn discover(&self) -> Result<Vec<Endpoint>, ProxyError> {
        if self.endpoints.is_empty() {
            return Err(ProxyError::no_backends("the fixed endpoint list is empty"));
        }
        Ok(self.endpoints.clone())
    }

    fn watch(&self) -> Option<Receiver<Vec<Endpoint>>> {
        None
    }
}
