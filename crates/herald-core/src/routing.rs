//! Routing-configuration model, validation, and content hashing.
//!
//! A tenant's routing configuration is stored as raw JSON and parsed
//! into this model before every apply. Validation happens before any
//! mutation of stored state, and rejects with an error naming the
//! offending receiver or field. The content hash is a sha256 digest of
//! the raw bytes, used purely for optimistic-concurrency conflict
//! detection — it is not a cryptographic commitment.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// A tenant's full routing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Named receivers, each carrying zero or more delivery integrations.
    pub receivers: Vec<Receiver>,
    /// The routing tree root. Alerts that match no child route are
    /// delivered to `route.receiver`.
    pub route: Route,
}

/// A named group of delivery integrations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receiver {
    pub name: String,
    #[serde(default)]
    pub integrations: Vec<IntegrationConfig>,
}

/// Configuration for a single delivery integration.
///
/// `settings` is schema-free at this layer; each integration kind
/// validates its own required fields at build time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationConfig {
    /// Integration kind, e.g. "webhook" or "log".
    pub kind: String,
    /// Kind-specific settings.
    #[serde(default)]
    pub settings: serde_json::Value,
}

/// A node in the routing tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    /// Receiver name alerts on this route are delivered to.
    pub receiver: String,
    /// Label names alerts are grouped by on this route.
    #[serde(default)]
    pub group_by: Vec<String>,
    /// Child routes, matched in order.
    #[serde(default)]
    pub routes: Vec<Route>,
}

/// Structural validation failures for a routing configuration.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("configuration is not valid JSON: {0}")]
    Syntax(String),

    #[error("receiver {index} has an empty name")]
    EmptyReceiverName { index: usize },

    #[error("duplicate receiver name '{name}'")]
    DuplicateReceiver { name: String },

    #[error("receiver '{receiver}' integration {index} has an empty kind")]
    EmptyIntegrationKind { receiver: String, index: usize },

    #[error("route references undefined receiver '{receiver}'")]
    UndefinedRouteReceiver { receiver: String },
}

impl RoutingConfig {
    /// Parses and structurally validates raw configuration bytes.
    pub fn parse(raw: &[u8]) -> Result<Self, ValidationError> {
        let config: RoutingConfig =
            serde_json::from_slice(raw).map_err(|e| ValidationError::Syntax(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks structural invariants: receiver names are non-empty and
    /// unique, integration kinds are non-empty, and every route in the
    /// tree references a defined receiver.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut names = HashSet::new();
        for (index, receiver) in self.receivers.iter().enumerate() {
            if receiver.name.is_empty() {
                return Err(ValidationError::EmptyReceiverName { index });
            }
            if !names.insert(receiver.name.as_str()) {
                return Err(ValidationError::DuplicateReceiver {
                    name: receiver.name.clone(),
                });
            }
            for (index, integration) in receiver.integrations.iter().enumerate() {
                if integration.kind.is_empty() {
                    return Err(ValidationError::EmptyIntegrationKind {
                        receiver: receiver.name.clone(),
                        index,
                    });
                }
            }
        }
        validate_route(&self.route, &names)
    }
}

fn validate_route(route: &Route, receivers: &HashSet<&str>) -> Result<(), ValidationError> {
    if !receivers.contains(route.receiver.as_str()) {
        return Err(ValidationError::UndefinedRouteReceiver {
            receiver: route.receiver.clone(),
        });
    }
    for child in &route.routes {
        validate_route(child, receivers)?;
    }
    Ok(())
}

/// Computes the content hash of raw configuration bytes as lowercase
/// hex. Used solely for compare-and-swap conflict detection.
pub fn content_hash(raw: &[u8]) -> String {
    let digest = Sha256::digest(raw);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write;
        // infallible for String
        let _ = write!(out, "{byte:02x}");
    }
    out
}
