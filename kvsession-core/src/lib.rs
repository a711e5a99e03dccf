//! kvsession core - shared data model and ambient services
//!
//! Defines the persisted session record, the pluggable value codec, the
//! store configuration and the logging/error plumbing used by every crate in
//! the workspace.

pub mod codec;
pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use codec::*;
pub use self::config::*;
pub use error::*;
pub use logging::*;
pub use types::*;

// Re-export commonly used external types
pub use serde_json::Value;
pub use tracing;
