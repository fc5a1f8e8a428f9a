//! Observer hooks at the invocation and tool-use extension points.
//!
//! # Hook Events
//!
//! - `PreInvocation` / `PostInvocation` - around every agent attempt
//! - `PreToolUse` / `PostToolUse` - around every tool provider call
//!
//! Observers are notified in registration order and may not block the
//! build: each runs under a timeout, and failures are logged, never raised.
//!
//! # Configuration
//!
//! Command hooks are declared in `.buildforge/buildforge.toml`:
//!
//! ```toml
//! [[hooks]]
//! event = "post_tool_use"
//! command = "./scripts/log-tool.sh"
//! timeout_secs = 10
//!
//! [[hooks]]
//! event = "pre_invocation"
//! match = "code*"
//! command = "./scripts/snapshot.sh"
//! ```
//!
//! The command receives the `HookContext` as JSON on stdin.

pub mod config;
pub mod executor;
pub mod manager;
pub mod types;

pub use config::HookDefinition;
pub use executor::CommandObserver;
pub use manager::HookManager;
pub use types::{HookContext, HookEvent, Observer};
