//! Task scheduling substrate.
//!
//! Coordinates asynchronous completion and teardown for the engines.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `signal` | [`AbortSignal`]: cancellation with a reason |
//! | `queue` | [`TaskQueue`]: tracked in-flight work, abort, dispose |
//! | `emitter` | [`TaskEmitter`]: event-keyed listener tasks, one-shot waits |

// ============================================================================
// Submodules
// ============================================================================

/// Event-keyed listener scheduling.
pub mod emitter;

/// Tracked in-flight work.
pub mod queue;

/// Cancellation signal with reason.
pub mod signal;

// ============================================================================
// Re-exports
// ============================================================================

pub use emitter::{Event, Listener, TaskEmitter};
pub use queue::{TaskHandle, TaskQueue};
pub use signal::AbortSignal;
