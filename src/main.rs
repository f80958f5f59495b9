//! kurs-server: a currency conversion service.
//!
//! Answers `GET /{service}/{base}/{target}/{amount}` requests over a
//! minimal HTTP/1.1 subset, converting amounts with exchange rates pulled
//! from the Central Bank of Russia daily feed and cached with a
//! single-flight refresh discipline.
//!
//! Features:
//! - one JSON response per connection, then close
//! - pluggable rate providers behind an explicit registry
//! - rate cache with configurable lifetime
//! - configuration via CLI arguments or TOML file

mod config;
mod error;
mod protocol;
mod rates;
mod router;
mod server;

use std::sync::Arc;
use std::time::Duration;

use config::Config;
use rates::cbr::CbrFetcher;
use rates::RateService;
use router::Registry;
use server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        cbr_url = %config.cbr_url,
        cache_lifetime = config.cache_lifetime,
        upstream_timeout = config.upstream_timeout,
        "Starting kurs-server"
    );

    let fetcher = CbrFetcher::new(
        &config.cbr_url,
        Duration::from_secs(config.upstream_timeout),
    )?;
    let provider = RateService::new(
        "CBR",
        fetcher,
        Duration::from_secs(config.cache_lifetime),
    );
    let registry = Registry::new().register("cbr", Arc::new(provider));

    Server::new(config, registry).run().await
}
