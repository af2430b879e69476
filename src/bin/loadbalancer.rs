// Copyright 2024 All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The dynamic load balancer.

use core::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use dynamic_proxy::{LoadBalancer, LoadBalancerConfig, Result};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "dynproxy-lb",
    version,
    about = "Load balancer that backends register with over mutual TLS"
)]
struct Cli {
    /// Which address:port to bind on
    #[arg(long, default_value = "0.0.0.0:443", env = "DYNPROXY_BIND")]
    bind: SocketAddr,

    /// Certificate chain to serve (PEM)
    #[arg(long, env = "DYNPROXY_CERT")]
    cert: PathBuf,

    /// Private key for the certificate (PEM)
    #[arg(long, env = "DYNPROXY_KEY")]
    key: PathBuf,

    /// CA used to verify backend certificates. Without it any client
    /// certificate is accepted.
    #[arg(long, env = "DYNPROXY_CLIENTCA")]
    clientca: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "dynamic_proxy=debug,dynproxy_lb=debug"
    } else {
        "dynamic_proxy=info,dynproxy_lb=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(cert = %cli.cert.display(), key = %cli.key.display(), "loading TLS material");

    let config = LoadBalancerConfig {
        bind_addr: cli.bind,
        cert_path: cli.cert,
        key_path: cli.key,
        client_ca_path: cli.clientca,
    };
    LoadBalancer::bind(&config).await?.run().await
}
