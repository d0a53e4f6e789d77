//! WireGuard key and configuration types for EdgeLink.
//!
//! The control plane never touches a tunnel. This crate gives it the
//! vocabulary to validate device public keys and to render the `wg-quick`
//! configuration a client installs.

pub mod config;
pub mod error;
mod keys;
mod types;

pub use config::{render_wg_quick, validate, InterfaceConfig, PeerConfig};
pub use error::WireGuardError;
pub use keys::{KeyPair, PrivateKey, PublicKey, KEY_SIZE};
pub use types::{AllowedIp, Endpoint};
