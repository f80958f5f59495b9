//! TCP server: accept loop and per-connection handling.
//!
//! Each accepted connection runs as its own task and performs exactly one
//! exchange: parse the request line, dispatch to a provider, convert,
//! respond, close. Every failure branch still produces one well-formed
//! response; nothing escapes the handler unanswered.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::ServiceError;
use crate::protocol::{self, Response};
use crate::rates;
use crate::router::Registry;

/// Maximum number of concurrent connections.
const MAX_CONNECTIONS: usize = 10000;

/// Server instance.
pub struct Server {
    config: Config,
    registry: Arc<Registry>,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a new server over an already-built provider registry.
    pub fn new(config: Config, registry: Registry) -> Self {
        Server {
            config,
            registry: Arc::new(registry),
            connection_limit: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
        }
    }

    /// Bind the listen address and serve connections until shutdown.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.listen).await?;
        info!(address = %self.config.listen, "Server listening");

        loop {
            // Wait for a connection slot.
            let permit = self.connection_limit.clone().acquire_owned().await?;

            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "New connection");

                    let registry = Arc::clone(&self.registry);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, registry).await {
                            debug!(error = %e, "Connection error");
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}

/// Handle a single client connection: one request, one response, close.
async fn handle_connection(
    stream: TcpStream,
    registry: Arc<Registry>,
) -> Result<(), std::io::Error> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let response = match serve(&mut reader, &registry).await {
        Ok(result) => Response::success(result),
        Err(err) => {
            // Internal detail and upstream failures go to the log in full;
            // the client sees only what the error kind allows.
            if err.is_server_fault() {
                error!(error = %err, "Request failed");
            } else {
                warn!(error = %err, "Request rejected");
            }
            Response::from_error(&err)
        }
    };

    writer.write_all(&response.encode()).await?;
    writer.shutdown().await?;
    Ok(())
}

/// Parse, dispatch, and convert; any error maps to a response upstream.
async fn serve<R>(reader: &mut R, registry: &Registry) -> Result<Value, ServiceError>
where
    R: AsyncBufRead + Unpin,
{
    let request = protocol::read_request(reader).await?;
    let (provider, conversion) = registry.dispatch(&request.path)?;

    let result = rates::convert(
        provider,
        &conversion.base,
        &conversion.target,
        &conversion.amount,
    )
    .await?;

    Ok(ConversionResult {
        base_currency: conversion.base,
        target_currency: conversion.target,
        base_amount: conversion.amount,
        result_amount: result.to_string(),
    }
    .into_value())
}

/// Success payload echoed back to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ConversionResult {
    base_currency: String,
    target_currency: String,
    base_amount: String,
    result_amount: String,
}

impl ConversionResult {
    fn into_value(self) -> Value {
        json!({
            "base_currency": self.base_currency,
            "target_currency": self.target_currency,
            "base_amount": self.base_amount,
            "result_amount": self.result_amount,
        })
    }
}
