// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use clap::Parser;
use lbproxy::client::{DialConfig, Keepalive};
use lbproxy::discover::BackendSpec;
use lbproxy::transport::codec::Codec;
use lbproxy::{Proxy, ProxyConfig, ProxyError};
use service::{init_tracing, GreeterRequest, GreeterResponse};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

#[derive(Parser)]
struct Flags {
    /// Sets the port number the proxy listens on.
    #[clap(long, default_value_t = 50050)]
    proxy_port: u16,
    /// Sets the address the proxy listens on.
    #[clap(long, default_value = "0.0.0.0")]
    listen_host: IpAddr,
    /// Comma-separated local ports, `host:port`, or `dns:///host:port`.
    #[clap(long, env = "LBPROXY_BACKENDS", default_value = "50051,50052,50053")]
    server_ports: String,
    /// Seconds allowed for one backend connection attempt.
    #[clap(long, default_value_t = 5)]
    dial_timeout: u64,
    /// Seconds of idleness before the first keepalive probe.
    #[clap(long, default_value_t = 30)]
    keepalive_idle: u64,
    /// Seconds between keepalive probes.
    #[clap(long, default_value_t = 10)]
    keepalive_interval: u64,
    /// Unanswered keepalive probes before a backend connection is dropped.
    #[clap(long, default_value_t = 3)]
    keepalive_retries: u32,
    /// Wire codec towards callers and backends: `bincode` or `json`.
    #[clap(long, default_value = "bincode")]
    codec: String,
    /// Seconds between re-resolutions of a `dns:///` backend target.
    #[clap(long, default_value_t = 30)]
    refresh_interval: u64,
}

impl Flags {
    fn config(&self) -> Result<ProxyConfig, ProxyError> {
        let backends: BackendSpec = self.server_ports.parse()?;
        let codec: Codec = self.codec.parse().map_err(ProxyError::Configuration)?;
        let dial = DialConfig::default()
            .with_dial_timeout(Duration::from_secs(self.dial_timeout))
            .with_keepalive(Keepalive {
                idle: Duration::from_secs(self.keepalive_idle),
                interval: Duration::from_secs(self.keepalive_interval),
                retries: self.keepalive_retries,
            });
        Ok(ProxyConfig::new(SocketAddr::new(self.listen_host, self.proxy_port), backends)
            .with_dial_config(dial)
            .with_transport_codec(codec)
            .with_refresh_interval(Duration::from_secs(self.refresh_interval)))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let flags = Flags::parse();
    init_tracing("Greeter Proxy")?;

    let config = flags.config()?;
    tracing::info!("Proxying {} on port {}", config.backends, flags.proxy_port);
    let proxy = Proxy::<GreeterRequest, GreeterResponse>::start(config).await?;
    tracing::info!("Proxy server listening on {}", proxy.local_addr()?);
    proxy
        .serve(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("failed to listen for ctrl-c, serving until killed: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}
