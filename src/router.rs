//! Path dispatch: map `/{service}/{base}/{target}/{amount}` onto a
//! registered provider.
//!
//! The registry is built explicitly at startup and passed in; there is no
//! global service table. The path scheme is fixed arity only: no
//! wildcards, no query parameters, no optional segments.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ServiceError;
use crate::rates::ExchangeRate;

/// Conversion parameters carried by a request path.
///
/// Base and target are opaque codes here; the amount stays a string and is
/// validated by the conversion arithmetic, not the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionRequest {
    pub base: String,
    pub target: String,
    pub amount: String,
}

/// Service-name to provider map.
#[derive(Default)]
pub struct Registry {
    services: HashMap<String, Arc<dyn ExchangeRate>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Register a provider under a service name (builder style).
    pub fn register(mut self, name: impl Into<String>, provider: Arc<dyn ExchangeRate>) -> Self {
        self.services.insert(name.into(), provider);
        self
    }

    /// Resolve a path into a provider and conversion parameters.
    ///
    /// The path must hold exactly four non-empty segments: service, base,
    /// target, amount. An unknown service or any other shape is a miss.
    pub fn dispatch(
        &self,
        path: &str,
    ) -> Result<(&dyn ExchangeRate, ConversionRequest), ServiceError> {
        let path = path.strip_prefix('/').unwrap_or(path);
        let segments: Vec<&str> = path.split('/').collect();

        if segments.len() != 4 || segments.iter().any(|s| s.is_empty()) {
            return Err(ServiceError::NotFound);
        }

        let provider = self
            .services
            .get(segments[0])
            .ok_or(ServiceError::NotFound)?;

        Ok((
            provider.as_ref(),
            ConversionRequest {
                base: segments[1].to_string(),
                target: segments[2].to_string(),
                amount: segments[3].to_string(),
            },
        ))
    }
}
