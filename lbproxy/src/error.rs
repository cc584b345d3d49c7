// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Startup and per-call errors.

use crate::ServerError;
use faststr::FastStr;
use std::io;
use std::net::SocketAddr;

/// Critical errors that stop the proxy from starting.
#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    /// The backend specification or listen address is malformed.
    #[error("configuration error: {0}")]
    Configuration(FastStr),
    /// Resolution or dialing produced no usable backend connection.
    #[error("no backends available: {0}")]
    NoBackendsAvailable(FastStr),
    /// The listening port could not be bound.
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        /// address that was requested.
        addr: SocketAddr,
        /// underlying socket error.
        #[source]
        source: io::Error,
    },
}

impl ProxyError {
    pub(crate) fn configuration(detail: impl Into<String>) -> Self {
        ProxyError::Configuration(FastStr::from(detail.into()))
    }

    pub(crate) fn no_backends(detail: impl Into<String>) -> Self {
        ProxyError::NoBackendsAvailable(FastStr::from(detail.into()))
    }
}

/// Errors local to a single forwarded call.
///
/// They are handed back to the caller and never touch the pool or the cursor.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// The chosen connection could not complete the call.
    #[error("backend {endpoint} unreachable: {detail}")]
    BackendUnreachable {
        /// endpoint the call was routed to.
        endpoint: FastStr,
        /// transport failure reported by the client channel.
        detail: FastStr,
    },
    /// The caller's deadline expired before the backend answered.
    #[error("call to backend {endpoint} cancelled: {detail}")]
    CallCancelled {
        /// endpoint the call was routed to.
        endpoint: FastStr,
        /// cancellation reason.
        detail: FastStr,
    },
}

impl From<CallError> for ServerError {
    fn from(err: CallError) -> Self {
        let kind = match err {
            CallError::BackendUnreachable { .. } => io::ErrorKind::NotConnected,
            CallError::CallCancelled { .. } => io::ErrorKind::TimedOut,
        };
        ServerError::new(kind, err.to_string())
    }
}
