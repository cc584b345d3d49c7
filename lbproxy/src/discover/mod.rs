// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Backend registry: turns a backend specification into endpoints.

use crate::error::ProxyError;
use async_broadcast::Receiver;
pub use dns::{DnsDiscover, Resolve, SystemResolver};
use faststr::FastStr;
pub use fixed::FixedDiscover;
use std::fmt;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

mod dns;
mod fixed;

/// Host used for the comma-separated port list form.
pub const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Prefix selecting the delegated, periodically re-resolved form.
pub const DNS_SCHEME: &str = "dns:///";

/// One backend instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// The name the address was obtained from.
    pub host: FastStr,
    /// The resolved socket address.
    pub addr: SocketAddr,
}

impl Endpoint {
    /// Creates an endpoint from a literal address.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            host: FastStr::from(addr.ip().to_string()),
            addr,
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Endpoint::new(addr)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.as_str() == self.addr.ip().to_string() {
            write!(f, "{}", self.addr)
        } else {
            write!(f, "{}({})", self.host, self.addr)
        }
    }
}

/// The configured source of backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendSpec {
    /// Comma-separated local ports, e.g. `50051,50052,50053`.
    Ports(Vec<u16>),
    /// A single `host:port`, resolved once at startup.
    Lookup {
        /// host name or literal address.
        host: FastStr,
        /// port shared by every resolved address.
        port: u16,
    },
    /// A single `dns:///host:port`, resolved and balanced by [`crate::client::balanced::BalancedChannel`].
    Delegated {
        /// host name or literal address.
        host: FastStr,
        /// port shared by every resolved address.
        port: u16,
    },
}

impl FromStr for BackendSpec {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ProxyError::configuration("empty backend specification"));
        }
        if let Some(target) = s.strip_prefix(DNS_SCHEME) {
            let (host, port) = parse_host_port(target)?;
            return Ok(BackendSpec::Delegated { host, port });
        }
        if s.contains(',') || s.bytes().all(|b| b.is_ascii_digit()) {
            let ports = s.split(',').map(|p| parse_port(p.trim(), s)).collect::<Result<Vec<_>, _>>()?;
            return Ok(BackendSpec::Ports(ports));
        }
        let (host, port) = parse_host_port(s)?;
        Ok(BackendSpec::Lookup { host, port })
    }
}

impl fmt::Display for BackendSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendSpec::Ports(ports) => {
                let ports: Vec<String> = ports.iter().map(u16::to_string).collect();
                f.write_str(&ports.join(","))
            },
            BackendSpec::Lookup { host, port } => write!(f, "{}", join_host_port(host, *port)),
            BackendSpec::Delegated { host, port } => write!(f, "{DNS_SCHEME}{}", join_host_port(host, *port)),
        }
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

fn parse_port(port: &str, spec: &str) -> Result<u16, ProxyError> {
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(ProxyError::configuration(format!("invalid port {port:?} in backend specification {spec:?}"))),
        Ok(port) => Ok(port),
    }
}

fn parse_host_port(s: &str) -> Result<(FastStr, u16), ProxyError> {
    let Some((host, port)) = s.rsplit_once(':') else {
        return Err(ProxyError::configuration(format!("backend specification {s:?} is not host:port")));
    };
    let host = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);
    if host.is_empty() || host.contains(',') {
        return Err(ProxyError::configuration(format!("invalid host in backend specification {s:?}")));
    }
    Ok((FastStr::from(host.to_string()), parse_port(port, s)?))
}

/// [`Discover`] is the most basic trait for Discover.
pub trait Discover: Send + Sync + 'static {
    /// `discover` resolves the current, ordered endpoint list.
    fn discover(&self) -> impl Future<Output = Result<Vec<Endpoint>, ProxyError>> + Send;
    /// `watch` should return a [`async_broadcast::Receiver`] which can be used to subscribe endpoint changes.
    fn watch(&self) -> Option<Receiver<Vec<Endpoint>>>;
}

/// What the registry hands over to the connection pool.
pub enum Target<R: Resolve = SystemResolver> {
    /// Endpoints resolved once, one connection each.
    Endpoints(Vec<Endpoint>),
    /// Resolution left to the delegated balancer.
    Delegated(DnsDiscover<R>),
}

impl<R: Resolve> fmt::Debug for Target<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Endpoints(endpoints) => f.debug_tuple("Endpoints").field(endpoints).finish(),
            Target::Delegated(discover) => f.debug_tuple("Delegated").field(&discover.target()).finish(),
        }
    }
}

/// Resolves `spec` into a [`Target`].
///
/// Port lists and `host:port` forms are resolved right away and must yield at
/// least one endpoint. The `dns:///` form is not resolved here; `refresh` is
/// the interval its balancer re-resolves at.
pub async fn resolve<R: Resolve>(spec: &BackendSpec, resolver: R, refresh: Duration) -> Result<Target<R>, ProxyError> {
    match spec {
        BackendSpec::Ports(ports) => {
            let addrs = ports.iter().map(|port| SocketAddr::new(LOOPBACK, *port)).collect::<Vec<_>>();
            let endpoints = FixedDiscover::from(addrs).discover().await?;
            Ok(Target::Endpoints(endpoints))
        },
        BackendSpec::Lookup { host, port } => {
            let endpoints = DnsDiscover::new(host.clone(), *port, resolver).discover().await?;
            Ok(Target::Endpoints(endpoints))
        },
        BackendSpec::Delegated { host, port } => Ok(Target::Delegated(DnsDiscover::new(host.clone(), *port, resolver).with_refresh(refresh))),
    }
}

#[cfg(test)]
mod tests {
    use super::{resolve, BackendSpec, Endpoint, Resolve, Target, LOOPBACK};
    use crate::error::ProxyError;
    use assert_matches::assert_matches;
    use std::io;
    use std::net::SocketAddr;
    use std::time::Duration;

    struct NoAddrs;

    impl Resolve for NoAddrs {
        async fn resolve(&self, _host: &str, _port: u16) -> io::Result<Vec<SocketAddr>> {
            Ok(vec![])
        }
    }

    #[test]
    fn parse_port_list() {
        let spec: BackendSpec = "50051,50052,50053".parse().unwrap();
        assert_eq!(spec, BackendSpec::Ports(vec![50051, 50052, 50053]));
        assert_eq!(spec.to_string(), "50051,50052,50053");

        let spec: BackendSpec = " 50051 , 50052 ".parse().unwrap();
        assert_eq!(spec, BackendSpec::Ports(vec![50051, 50052]));

        let spec: BackendSpec = "50051".parse().unwrap();
        assert_eq!(spec, BackendSpec::Ports(vec![50051]));
    }

    #[test]
    fn parse_host_forms() {
        let spec: BackendSpec = "hello-server:50051".parse().unwrap();
        assert_eq!(
            spec,
            BackendSpec::Lookup {
                host: "hello-server".into(),
                port: 50051
            }
        );

        let spec: BackendSpec = "[::1]:50051".parse().unwrap();
        assert_eq!(spec, BackendSpec::Lookup { host: "::1".into(), port: 50051 });
        assert_eq!(spec.to_string(), "[::1]:50051");

        let spec: BackendSpec = "dns:///hello-server.default.svc:50051".parse().unwrap();
        assert_eq!(
            spec,
            BackendSpec::Delegated {
                host: "hello-server.default.svc".into(),
                port: 50051
            }
        );
        assert_eq!(spec.to_string(), "dns:///hello-server.default.svc:50051");
    }

    #[test]
    fn parse_malformed() {
        for spec in ["", "   ", "50051,,50052", "50051,abc", "0", "70000", "hello-server", ":50051", "host:", "host:port", "a:1,b:2", "dns:///", "dns:///host"] {
            assert_matches!(spec.parse::<BackendSpec>(), Err(ProxyError::Configuration(_)), "{spec:?}");
        }
    }

    #[tokio::test]
    async fn resolve_port_list_in_order() {
        let spec: BackendSpec = "50051,50052,50053".parse().unwrap();
        let target = resolve(&spec, NoAddrs, Duration::from_secs(30)).await.unwrap();
        let endpoints = match target {
            Target::Endpoints(endpoints) => endpoints,
            other => panic!("expected endpoints, got {other:?}"),
        };
        let expected: Vec<Endpoint> = [50051, 50052, 50053].into_iter().map(|port| Endpoint::new(SocketAddr::new(LOOPBACK, port))).collect();
        assert_eq!(endpoints, expected);
    }

    #[tokio::test]
    async fn resolve_zero_addresses() {
        let spec: BackendSpec = "nowhere.invalid:50051".parse().unwrap();
        assert_matches!(resolve(&spec, NoAddrs, Duration::from_secs(30)).await, Err(ProxyError::NoBackendsAvailable(_)));
    }

    #[tokio::test]
    async fn delegated_is_not_resolved() {
        let spec: BackendSpec = "dns:///nowhere.invalid:50051".parse().unwrap();
        assert_matches!(resolve(&spec, NoAddrs, Duration::from_secs(30)).await, Ok(Target::Delegated(_)));
    }
}
