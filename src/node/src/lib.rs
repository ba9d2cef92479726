//! Roster Authorization Node Library
//!
//! Wires the role cache, resolver, roster sync scheduler and audit trail
//! from a TOML configuration file.

pub mod config;
pub mod node;

pub use config::NodeConfig;
pub use node::{verify_audit_file, AuthzNode, ControlCommand};
