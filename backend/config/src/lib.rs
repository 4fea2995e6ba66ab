//! `chime-config` — engine configuration and trigger catalog management.
//!
//! Provides:
//! - Env-driven engine configuration
//! - Trigger catalog YAML load and validation
//! - Delivery-time webhook and header env-var resolution

pub mod catalog;
pub mod env;
pub mod schema;

pub use catalog::{load_catalog, parse_catalog, validate_definitions, ValidationReport};
pub use env::{resolve_headers, resolve_headers_with, resolve_webhook, resolve_webhook_with};
pub use schema::EngineConfig;
