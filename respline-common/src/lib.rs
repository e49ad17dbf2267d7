// respline-common - Shared error taxonomy and configuration for respline
//
// This crate defines the types both the client core and its collaborators agree on

pub mod config;
pub mod error;

// Re-export for convenience
pub use config::*;
pub use error::*;
