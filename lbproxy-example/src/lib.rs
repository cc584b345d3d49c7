// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, UdpSocket};
use tarpc::context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// The reply of [`Greeter::say_hello`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloReply {
    pub message: String,
}

/// This is the service definition. It looks a lot like a trait definition.
/// It defines one RPC, say_hello, which takes one arg, a name, and returns a reply.
#[tarpc::service]
pub trait Greeter {
    /// Returns a greeting for name.
    async fn say_hello(name: String) -> HelloReply;
}

/// A backend that tells callers where their greeting came from.
#[derive(Debug, Clone)]
pub struct HelloServer {
    hostname: String,
    ip: String,
    port: u16,
}

impl HelloServer {
    /// Describes the current host, serving on `port`.
    pub fn new(port: u16) -> Self {
        Self {
            hostname: hostname(),
            ip: outbound_ip().map_or_else(|| "unknown".to_string(), |ip| ip.to_string()),
            port,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }
}

impl Greeter for HelloServer {
    async fn say_hello(self, _: context::Context, name: String) -> HelloReply {
        HelloReply {
            message: format!("Hello, {name}! (from server {}, IP: {}, port: {})", self.hostname, self.ip, self.port),
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok().map(|h| h.trim().to_string()).filter(|h| !h.is_empty()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// The local address the OS would route external traffic from.
/// Connecting a UDP socket sends nothing.
fn outbound_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

/// Initializes a fmt subscriber filtered by `RUST_LOG`, `info` by default.
pub fn init_tracing(service_name: &'static str) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;
    tracing::debug!("{service_name} tracing initialized");
    Ok(())
}
