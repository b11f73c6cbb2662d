// Error taxonomy
pub mod error;

// Encrypted integration records
pub mod credentials;

// OAuth authorization and token refresh
pub mod oauth;

// Remote tracker clients
pub mod connectors;

// Issue cache, normalization and read model
pub mod issues;

// Sync engine
pub mod sync;

// Configuration
pub mod config;

// HTTP API
pub mod api;

pub use error::{Error, Result};
