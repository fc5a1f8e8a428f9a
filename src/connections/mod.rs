//! Connections to external tool providers (filesystem, version control,
//! memory store, ...).
//!
//! A `ConnectionManager` owns one `ToolConnection` per provider for the
//! whole build. Each connection moves through
//! `Disconnected -> Connecting -> Ready`, drops to `Degraded` on a failed
//! call or health check, and only returns to `Ready` through a reconnect.

pub mod manager;
pub mod process;
pub mod types;

pub use manager::{ConnectionManager, ConnectionSettings};
pub use process::StdioProvider;
pub use types::{
    ConnectionState, Health, ProviderConfig, ProviderHandle, ToolConnection, ToolProvider,
};
