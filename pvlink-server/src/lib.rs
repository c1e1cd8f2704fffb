//! # pvlink-server
//!
//! TCP server for pvlink.
//!
//! This crate provides:
//! - Connection handling with async I/O and per-connection type caches
//! - Request dispatch for get/put/monitor against a channel provider
//! - Session management
//! - Per-subscription monitor queues with overrun-tracking delivery
//! - A pass-through access policy hook
//! - YAML and environment configuration

pub mod config;
pub mod error;
pub mod policy;
pub mod provider;
pub mod server;
pub mod session;
mod subscription;

pub use config::{Config, ConfigError, MonitorConfig, NetworkConfig, ProtocolConfig};
pub use error::ServerError;
pub use policy::{AccessMode, AccessPolicy, AccessRequest, AllowAll};
pub use provider::{all_fields_mask, ChannelProvider, ChannelUpdate, ProviderError, StaticProvider};
pub use server::{Server, ServerConfig, ServerStats};
pub use session::{Session, SessionState};
