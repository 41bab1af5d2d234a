//! RPC message types and the pluggable wire collaborators.
//!
//! # Protocol Overview
//!
//! | Message | Direction | Purpose |
//! |---------|-----------|---------|
//! | [`RpcRequest`] | Client → Server | Method call |
//! | [`RpcResponse`] | Server → Client | Result or error, correlated by id on sockets |
//! | [`LiveNotification`] | Server → Client | Live query push (id-less response) |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `request` | Request, response and live notification types |
//! | `formatter` | [`Formatter`] trait, [`JsonFormatter`], [`Payload`] |
//! | `validator` | [`Validator`] trait, [`BasicValidator`] |

// ============================================================================
// Submodules
// ============================================================================

/// Wire encoding.
pub mod formatter;

/// Request and response message types.
pub mod request;

/// Payload shape validation.
pub mod validator;

// ============================================================================
// Re-exports
// ============================================================================

pub use formatter::{Formatter, JsonFormatter, Payload};
pub use request::{LiveNotification, RpcError, RpcOutcome, RpcRequest, RpcResponse, method};
pub use validator::{BasicValidator, ValidationContext, Validator};
