// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! lbproxy is a client-side load-balancing RPC proxy.
//!
//! The proxy accepts calls of one [tarpc](https://docs.rs/tarpc) service and forwards every call,
//! unmodified, to one of several interchangeable backends chosen in
//! round-robin order. Backends come from a [`discover::BackendSpec`]: a list
//! of local ports, a `host:port` resolved once through DNS, or a
//! `dns:///host:port` target that is re-resolved in the background.
#![deny(missing_docs)]
#![allow(clippy::type_complexity)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod client;
pub mod discover;
pub mod error;
pub mod server;
pub mod transport;

pub use error::{CallError, ProxyError};
pub use server::{Proxy, ProxyConfig};

/// re-public `tarpc` crate something.
pub use crate::tarpc::*;

mod tarpc {
    #[doc(hidden)]
    pub use ::tarpc::serde;

    pub use ::tarpc::{context, ClientMessage, RequestName, Response, ServerError, Transport};
}

/// A payload that can cross the proxy in either direction.
pub trait Message: ::serde::Serialize + for<'de> ::serde::Deserialize<'de> + Send + 'static {}

impl<T> Message for T where T: ::serde::Serialize + for<'de> ::serde::Deserialize<'de> + Send + 'static {}
