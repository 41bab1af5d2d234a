//! Client entry point.
//!
//! # Components
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Client`] | Connection owner and RPC entry point |
//! | [`ClientBuilder`] | Fluent configuration builder |
//! | [`ClientOptions`] | Default timeouts |
//! | [`EngineRegistry`] | Scheme to engine mapping |
//! | [`LiveSubscription`] | Stream of live query notifications |
//!
//! # Example
//!
//! ```no_run
//! use dbrpc::{Client, ConnectOptions, RpcOptions};
//!
//! # async fn example() -> dbrpc::Result<()> {
//! let client = Client::builder().build()?;
//! client.connect("http://localhost:8000", ConnectOptions::default()).await?;
//!
//! let version = client.rpc("version", vec![], RpcOptions::default()).await?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// Fluent builder pattern for client configuration.
pub mod builder;

/// Core client implementation.
pub mod core;

/// Live query subscriptions.
pub mod live;

/// Client defaults and per-call options.
pub mod options;

/// Engine selection by URL scheme.
pub mod registry;

// ============================================================================
// Re-exports
// ============================================================================

pub use self::core::Client;
pub use builder::ClientBuilder;
pub use live::LiveSubscription;
pub use options::{ClientOptions, ConnectOptions, DisconnectOptions, RpcOptions};
pub use registry::{EngineFactory, EngineRegistry};
