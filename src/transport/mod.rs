//! Transport collaborators for the engines.
//!
//! The engines talk to the network only through two narrow seams:
//!
//! ```text
//! ┌─────────────────┐  Fetcher::fetch   ┌────────────────────┐
//! │ HttpEngine      │──────────────────►│ ReqwestFetcher     │──► POST /rpc
//! └─────────────────┘                   └────────────────────┘
//! ┌─────────────────┐  SocketFactory    ┌────────────────────┐
//! │ WebSocketEngine │◄──── events ──────│ TungsteniteFactory │◄─► ws /rpc
//! │                 │───── handle ─────►│ (event loop)       │
//! └─────────────────┘                   └────────────────────┘
//! ```
//!
//! Both seams are traits so tests and embedders can supply their own.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `socket` | Socket traits, events and ready state |
//! | `connection` | `tokio-tungstenite` socket and event loop |
//! | `fetch` | Fetcher trait and `reqwest` implementation |

// ============================================================================
// Submodules
// ============================================================================

/// `tokio-tungstenite` socket and event loop.
pub mod connection;

/// HTTP fetch seam.
pub mod fetch;

/// Socket seam.
pub mod socket;

// ============================================================================
// Re-exports
// ============================================================================

pub use connection::{TungsteniteFactory, TungsteniteSocket};
pub use fetch::{FetchRequest, FetchResponse, Fetcher, ReqwestFetcher};
pub use socket::{
    AtomicReadyState, ReadyState, SocketConnection, SocketEvent, SocketFactory, SocketHandle,
};
