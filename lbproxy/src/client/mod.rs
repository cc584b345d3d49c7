// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Backend side of the proxy: dialed connections, the pool that owns them and
//! the balancers that pick one per call.

pub mod balance;
pub mod balanced;
pub mod channel;
pub mod pool;
pub use core::stub::Stub;
pub use core::RpcError;

/// re-public tarpc some types.
pub mod core {
    pub use ::tarpc::client::*;
}

pub use balanced::BalancedChannel;
pub use channel::{BackendConnection, DialConfig, Keepalive};
pub use pool::{Connection, ConnectionPool};
