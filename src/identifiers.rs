//! Type-safe identifiers.
//!
//! Newtype wrappers keep task ids, listener ids, correlation ids and live
//! query ids from being mixed up.
//!
//! | Type | Format | Scope |
//! |------|--------|-------|
//! | [`TaskId`] | `task-<n>` | Process-unique |
//! | [`ListenerId`] | `listener-<n>` | Process-unique |
//! | [`CorrelationId`] | `<method>/<seq>` | One socket connection |
//! | [`LiveId`] | UUID | One live query |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Counters
// ============================================================================

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Largest sequence value before [`SerialId`] wraps back to 1.
///
/// Kept within the integer range that every peer can represent exactly.
const MAX_SERIAL: u64 = (1 << 53) - 1;

// ============================================================================
// TaskId
// ============================================================================

/// Identifier of a task scheduled on a [`TaskQueue`](crate::task::TaskQueue).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    /// Allocates the next process-unique task id.
    #[inline]
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wraps a raw value.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

// ============================================================================
// ListenerId
// ============================================================================

/// Identity of a registered listener or one-shot waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Allocates the next process-unique listener id.
    #[inline]
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

// ============================================================================
// SerialId
// ============================================================================

/// Monotonic sequence used to mint correlation ids.
///
/// Starts at 1 and wraps after [`MAX_SERIAL`]. [`SerialId::reset`] starts a
/// fresh sequence for a new connection.
#[derive(Debug, Default)]
pub struct SerialId {
    last: AtomicU64,
}

impl SerialId {
    /// Creates a new sequence.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next value of the sequence.
    pub fn next(&self) -> u64 {
        let previous = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(if last >= MAX_SERIAL { 1 } else { last + 1 })
            })
            .unwrap_or_default();

        if previous >= MAX_SERIAL { 1 } else { previous + 1 }
    }

    /// Restarts the sequence.
    #[inline]
    pub fn reset(&self) {
        self.last.store(0, Ordering::Release);
    }
}

// ============================================================================
// CorrelationId
// ============================================================================

/// Token linking a socket request to its response.
///
/// Format: `<method>/<sequence>`, e.g. `query/12`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Creates a correlation id for `method` and sequence number `seq`.
    #[inline]
    #[must_use]
    pub fn new(method: &str, seq: u64) -> Self {
        Self(format!("{method}/{seq}"))
    }

    /// Returns the id as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the method prefix.
    #[inline]
    #[must_use]
    pub fn method(&self) -> &str {
        self.0.rsplit_once('/').map(|(m, _)| m).unwrap_or(&self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// LiveId
// ============================================================================

/// Identifier of a live query subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LiveId(Uuid);

impl LiveId {
    /// Wraps a UUID.
    #[inline]
    #[must_use]
    pub const fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[inline]
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl FromStr for LiveId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Display for LiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Tests
// ============================================================================
