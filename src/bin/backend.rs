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

//! A demo backend that registers with a load balancer and answers every
//! request with the path it served.

use core::convert::Infallible;
use std::path::PathBuf;

use bytes::Bytes;
use clap::Parser;
use dynamic_proxy::{bind_url, BindConfig, Result};
use http::{header, HeaderValue, Request, Response};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "dynproxy-backend",
    version,
    about = "Registers with a dynamic load balancer and serves through it"
)]
struct Cli {
    /// Load balancer URL to register under, e.g. https://lb.example.com/app
    #[arg(env = "DYNPROXY_URL")]
    url: String,

    /// Client certificate whose common name grants the URL (PEM)
    #[arg(long, env = "DYNPROXY_DPCERT", requires = "dpkey")]
    dpcert: Option<PathBuf>,

    /// Private key for the client certificate (PEM)
    #[arg(long, env = "DYNPROXY_DPKEY", requires = "dpcert")]
    dpkey: Option<PathBuf>,

    /// CA that signed the load balancer's certificate. Defaults to the
    /// bundled web roots.
    #[arg(long, env = "DYNPROXY_SERVERCA")]
    serverca: Option<PathBuf>,

    /// Allow http:// URLs. No identity is sent over plaintext.
    #[arg(long)]
    plaintext: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

async fn describe(
    req: Request<Incoming>,
) -> core::result::Result<Response<Full<Bytes>>, Infallible> {
    info!(method = %req.method(), path = %req.uri().path(), "serving");
    let text = format!("Served {} through the dynamic proxy.\n", req.uri().path());
    let mut response = Response::new(Full::new(Bytes::from(text)));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    Ok(response)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "dynamic_proxy=debug,dynproxy_backend=debug"
    } else {
        "dynamic_proxy=info,dynproxy_backend=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = BindConfig::from_files(
        cli.dpcert.as_deref(),
        cli.dpkey.as_deref(),
        cli.serverca.as_deref(),
    )?;
    if cli.plaintext {
        config = config.plaintext();
    }

    let listener = bind_url(&cli.url, &config).await?;
    info!("Registered with {}", cli.url);
    listener.serve(service_fn(describe)).await
}
