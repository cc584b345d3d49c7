// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use clap::Parser;
use lbproxy::transport::codec::{Bincode, Codec, Json};
use service::{init_tracing, GreeterClient};
use std::net::SocketAddr;
use tarpc::{client, context};
use tracing::Instrument;

#[derive(Parser)]
struct Flags {
    /// Sets the proxy address to connect to.
    #[clap(long, default_value = "127.0.0.1:50050")]
    proxy_addr: SocketAddr,
    /// Sets the name to say hello to.
    #[clap(long, default_value = "world")]
    name: String,
    /// Number of calls to make.
    #[clap(long, default_value_t = 6)]
    count: usize,
    /// Wire codec, must match the proxy's: `bincode` or `json`.
    #[clap(long, default_value = "bincode")]
    codec: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let flags = Flags::parse();
    init_tracing("Greeter Client")?;
    let codec: Codec = flags.codec.parse().map_err(|e| anyhow::anyhow!("{e}"))?;

    let client = match codec {
        Codec::Bincode => {
            let transport = tarpc::serde_transport::tcp::connect(flags.proxy_addr, Bincode::default).await?;
            GreeterClient::new(client::Config::default(), transport).spawn()
        },
        Codec::Json => {
            let transport = tarpc::serde_transport::tcp::connect(flags.proxy_addr, Json::default).await?;
            GreeterClient::new(client::Config::default(), transport).spawn()
        },
    };

    for i in 0..flags.count {
        let hello = client
            .say_hello(context::current(), flags.name.clone())
            .instrument(tracing::info_span!("Hello", call = i))
            .await;
        match hello {
            Ok(reply) => tracing::info!("{}", reply.message),
            Err(e) => tracing::warn!("{:?}", anyhow::Error::from(e)),
        }
    }

    Ok(())
}
