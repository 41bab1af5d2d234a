//! Engine selection by URL scheme.
//!
//! A scheme maps either to a factory or to another scheme. Aliases are
//! followed until a factory is found.
//!
//! | Scheme | Default |
//! |--------|---------|
//! | `http` | [`HttpEngine`] |
//! | `https` | alias of `http` |
//! | `ws` | [`WebSocketEngine`] |
//! | `wss` | alias of `ws` |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::engine::{
    Engine, EngineConfig, HttpEngine, WebSocketEngine, WebSocketEngineOptions,
};
use crate::error::{Error, Result};
use crate::transport::{Fetcher, SocketFactory};

// ============================================================================
// Types
// ============================================================================

/// Creates an engine bound to the client's emitter and codecs.
pub type EngineFactory = Arc<dyn Fn(EngineConfig) -> Arc<dyn Engine> + Send + Sync>;

#[derive(Clone)]
enum Registration {
    Factory(EngineFactory),
    Alias(String),
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Factory(_) => f.write_str("Factory"),
            Self::Alias(target) => f.debug_tuple("Alias").field(target).finish(),
        }
    }
}

// ============================================================================
// EngineRegistry
// ============================================================================

/// Scheme to engine mapping.
#[derive(Debug, Clone, Default)]
pub struct EngineRegistry {
    entries: FxHashMap<String, Registration>,
}

impl EngineRegistry {
    /// Creates an empty registry.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the built-in engines.
    #[must_use]
    pub fn with_defaults(
        fetcher: Arc<dyn Fetcher>,
        sockets: Arc<dyn SocketFactory>,
        websocket: WebSocketEngineOptions,
    ) -> Self {
        let mut registry = Self::new();

        registry.register("http", move |config| {
            Arc::new(HttpEngine::new(config, Arc::clone(&fetcher))) as Arc<dyn Engine>
        });
        registry.alias("https", "http");

        registry.register("ws", move |config| {
            Arc::new(WebSocketEngine::new(
                config,
                Arc::clone(&sockets),
                websocket.clone(),
            )) as Arc<dyn Engine>
        });
        registry.alias("wss", "ws");

        registry
    }

    /// Registers `factory` for `scheme`, replacing any previous entry.
    pub fn register<F>(&mut self, scheme: impl Into<String>, factory: F)
    where
        F: Fn(EngineConfig) -> Arc<dyn Engine> + Send + Sync + 'static,
    {
        self.entries
            .insert(scheme.into(), Registration::Factory(Arc::new(factory)));
    }

    /// Makes `scheme` resolve like `target`.
    pub fn alias(&mut self, scheme: impl Into<String>, target: impl Into<String>) {
        self.entries
            .insert(scheme.into(), Registration::Alias(target.into()));
    }

    /// Copies every entry of `other` over this registry.
    pub fn extend(&mut self, other: EngineRegistry) {
        self.entries.extend(other.entries);
    }

    /// Returns `true` if `scheme` has an entry.
    #[inline]
    #[must_use]
    pub fn contains(&self, scheme: &str) -> bool {
        self.entries.contains_key(scheme)
    }

    /// Follows aliases from `scheme` to a factory.
    ///
    /// # Errors
    ///
    /// - [`Error::UnsupportedProtocol`] if a scheme on the way has no entry
    /// - [`Error::CircularEngineReference`] if the aliases form a cycle
    pub fn resolve(&self, scheme: &str) -> Result<&EngineFactory> {
        let mut chain: Vec<String> = Vec::new();
        let mut current = scheme;

        loop {
            if chain.iter().any(|seen| seen == current) {
                chain.push(current.to_string());
                return Err(Error::CircularEngineReference { chain });
            }
            chain.push(current.to_string());

            match self.entries.get(current) {
                Some(Registration::Factory(factory)) => return Ok(factory),
                Some(Registration::Alias(target)) => current = target.as_str(),
                None => return Err(Error::unsupported_protocol(current)),
            }
        }
    }

    /// Creates the engine for `scheme`.
    ///
    /// # Errors
    ///
    /// See [`EngineRegistry::resolve`].
    pub fn create(&self, scheme: &str, config: EngineConfig) -> Result<Arc<dyn Engine>> {
        let factory = self.resolve(scheme)?;
        Ok(factory(config))
    }
}

// ============================================================================
// Tests
// ============================================================================
