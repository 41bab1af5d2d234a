//! Pluggable wire encoding.
//!
//! A [`Formatter`] turns request values into frames and frames back into
//! values. The engines never look inside a frame themselves.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde_json::Value;

use crate::error::{Error, Result};

// ============================================================================
// Payload
// ============================================================================

/// An encoded frame: text or binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
}

impl Payload {
    /// Returns the raw bytes.
    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }

    /// Consumes the payload and returns its bytes.
    #[inline]
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Text(text) => text.into_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }

    /// Returns the payload as text, replacing invalid UTF-8.
    #[must_use]
    pub fn to_text_lossy(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Binary(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        }
    }

    /// Returns the payload length in bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// Returns `true` if the payload is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Self::Binary(value)
    }
}

// ============================================================================
// Formatter
// ============================================================================

/// Encodes request values into frames and decodes frames into values.
pub trait Formatter: Send + Sync + fmt::Debug {
    /// MIME type used for `Content-Type` and `Accept` headers.
    fn content_type(&self) -> &str;

    /// WebSocket sub-protocol negotiated by the socket engine.
    fn protocol(&self) -> Option<&str>;

    /// Encodes a value into a frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conversion`] if the value cannot be encoded.
    fn encode(&self, value: &Value) -> Result<Payload>;

    /// Decodes a frame into a value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conversion`] if the frame is malformed.
    fn decode(&self, payload: &Payload) -> Result<Value>;

    /// Copies a value through the formatter, as the server would see it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conversion`] if either direction fails.
    fn copy(&self, value: &Value) -> Result<Value> {
        self.decode(&self.encode(value)?)
    }
}

// ============================================================================
// JsonFormatter
// ============================================================================

/// JSON text formatter (`application/json`, sub-protocol `json`).
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFormatter;

impl Formatter for JsonFormatter {
    fn content_type(&self) -> &str {
        "application/json"
    }

    fn protocol(&self) -> Option<&str> {
        Some("json")
    }

    fn encode(&self, value: &Value) -> Result<Payload> {
        serde_json::to_string(value)
            .map(Payload::Text)
            .map_err(|e| Error::conversion("value", "json", e.to_string()))
    }

    fn decode(&self, payload: &Payload) -> Result<Value> {
        serde_json::from_slice(payload.as_bytes())
            .map_err(|e| Error::conversion("json", "value", e.to_string()))
    }
}

// ============================================================================
// Tests
// ============================================================================
