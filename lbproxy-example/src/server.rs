// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use clap::Parser;
use futures::prelude::*;
use lbproxy::transport::codec::{Bincode, Codec, Json};
use lbproxy::transport::{self, Transport};
use lbproxy::{ClientMessage, Response};
use service::{init_tracing, Greeter, GreeterRequest, GreeterResponse, HelloServer};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tarpc::server::{BaseChannel, Channel};
use tokio::net::TcpListener;

#[derive(Parser)]
struct Flags {
    /// Sets the port number to listen on.
    #[clap(long, env = "SERVER_PORT", default_value_t = 50051)]
    port: u16,
    /// Wire codec, must match the proxy's: `bincode` or `json`.
    #[clap(long, default_value = "bincode")]
    codec: String,
}

async fn spawn(fut: impl Future<Output = ()> + Send + 'static) {
    tokio::spawn(fut);
}

async fn serve<T>(server: HelloServer, transport: T)
where
    T: Transport<Response<GreeterResponse>, ClientMessage<GreeterRequest>> + Send + 'static,
{
    // serve is generated by the service attribute. It takes as input any type implementing
    // the generated Greeter trait.
    BaseChannel::with_defaults(transport).execute(server.serve()).for_each(spawn).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let flags = Flags::parse();
    init_tracing("Greeter Server")?;
    let codec: Codec = flags.codec.parse().map_err(|e| anyhow::anyhow!("{e}"))?;

    let server = HelloServer::new(flags.port);
    let listener = TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), flags.port)).await?;
    tracing::info!("Server listening on {} ({}):{} using {codec}", server.hostname(), server.ip(), flags.port);
    loop {
        let stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            // Ignore accept errors.
            Err(e) => {
                tracing::warn!("failed to accept: {e}");
                continue;
            },
        };
        let framed = transport::framed(stream, usize::MAX);
        match codec {
            Codec::Bincode => tokio::spawn(serve(server.clone(), transport::new(framed, Bincode::default()))),
            Codec::Json => tokio::spawn(serve(server.clone(), transport::new(framed, Json::default()))),
        };
    }
}
