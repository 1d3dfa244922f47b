use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;

use crate::batch::Batch;
use crate::session::SessionContext;

/// Which side of the pipeline a plugin process serves.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, AsRefStr, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    Source,
    Sink,
    Processor,
}

/// Hooks every callback has, whatever its role.
///
/// Both hooks are optional. `init` runs once, before the session becomes
/// visible; returning an error rejects the session. `close` runs at most once,
/// when the session is closed.
pub trait Lifecycle: Send + 'static {
    fn init(&mut self, _ctx: &SessionContext) -> Result<(), PluginError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), PluginError> {
        Ok(())
    }
}

/// The one trait source plugin authors implement.
pub trait Source: Lifecycle {
    /// Reads the next batch.
    ///
    /// Only called when the host has granted credit. An empty batch means
    /// "nothing ready yet", `Ok(None)` means the input is exhausted and ends the
    /// stream. Errors are logged and the stream keeps going.
    fn read_batch(&mut self) -> Result<Option<Batch>, PluginError>;
}

/// The one trait sink plugin authors implement.
pub trait Sink: Lifecycle {
    /// Writes a batch to the destination. An error becomes a negative ack; the
    /// host decides whether to retry.
    fn write_batch(&mut self, batch: Batch) -> Result<(), PluginError>;
}

/// The one trait processor plugin authors implement.
pub trait Processor: Lifecycle {
    /// Transforms one batch. An error fails only this call.
    fn process(&mut self, input: Batch) -> Result<Batch, PluginError>;
}

/// A callback instance bound to exactly one session.
pub enum Callback {
    Source(Box<dyn Source>),
    Sink(Box<dyn Sink>),
    Processor(Box<dyn Processor>),
}

impl Callback {
    pub fn role(&self) -> Role {
        match self {
            Callback::Source(_) => Role::Source,
            Callback::Sink(_) => Role::Sink,
            Callback::Processor(_) => Role::Processor,
        }
    }

    pub(crate) fn init(&mut self, ctx: &SessionContext) -> Result<(), PluginError> {
        match self {
            Callback::Source(cb) => cb.init(ctx),
            Callback::Sink(cb) => cb.init(ctx),
            Callback::Processor(cb) => cb.init(ctx),
        }
    }

    pub(crate) fn close(&mut self) -> Result<(), PluginError> {
        match self {
            Callback::Source(cb) => cb.close(),
            Callback::Sink(cb) => cb.close(),
            Callback::Processor(cb) => cb.close(),
        }
    }

    pub fn as_source(&mut self) -> Option<&mut dyn Source> {
        match self {
            Callback::Source(cb) => Some(cb.as_mut()),
            _ => None,
        }
    }

    pub fn as_sink(&mut self) -> Option<&mut dyn Sink> {
        match self {
            Callback::Sink(cb) => Some(cb.as_mut()),
            _ => None,
        }
    }

    pub fn as_processor(&mut self) -> Option<&mut dyn Processor> {
        match self {
            Callback::Processor(cb) => Some(cb.as_mut()),
            _ => None,
        }
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callback::{}", self.role())
    }
}

type Builder<T> = Arc<dyn Fn() -> Box<T> + Send + Sync>;

/// Creates a fresh callback instance for every session.
#[derive(Clone)]
pub enum PluginFactory {
    Source(Builder<dyn Source>),
    Sink(Builder<dyn Sink>),
    Processor(Builder<dyn Processor>),
}

impl PluginFactory {
    pub fn source<S, F>(f: F) -> Self
    where
        S: Source,
        F: Fn() -> S + Send + Sync + 'static,
    {
        PluginFactory::Source(Arc::new(move || -> Box<dyn Source> { Box::new(f()) }))
    }

    pub fn sink<S, F>(f: F) -> Self
    where
        S: Sink,
        F: Fn() -> S + Send + Sync + 'static,
    {
        PluginFactory::Sink(Arc::new(move || -> Box<dyn Sink> { Box::new(f()) }))
    }

    pub fn processor<P, F>(f: F) -> Self
    where
        P: Processor,
        F: Fn() -> P + Send + Sync + 'static,
    {
        PluginFactory::Processor(Arc::new(move || -> Box<dyn Processor> { Box::new(f()) }))
    }

    pub fn role(&self) -> Role {
        match self {
            PluginFactory::Source(_) => Role::Source,
            PluginFactory::Sink(_) => Role::Sink,
            PluginFactory::Processor(_) => Role::Processor,
        }
    }

    pub fn build(&self) -> Callback {
        match self {
            PluginFactory::Source(f) => Callback::Source(f()),
            PluginFactory::Sink(f) => Callback::Sink(f()),
            PluginFactory::Processor(f) => Callback::Processor(f()),
        }
    }
}

impl fmt::Debug for PluginFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PluginFactory::{}", self.role())
    }
}

/// Errors a callback implementation can return.
#[derive(Error, Debug)]
pub enum PluginError {
    /// The session configuration was rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Something went wrong reading or writing JSON.
    #[error("JSON error: {0}")]
    Json(String),

    /// The plugin is not in a state where this operation is valid.
    #[error("invalid state for this operation")]
    InvalidState,

    /// The callback panicked; the runtime caught it.
    #[error("callback panicked: {0}")]
    Panicked(String),

    /// The plugin returned an unspecified failure.
    #[error("plugin error: {0}")]
    Other(String),
}

impl From<serde_json::Error> for PluginError {
    fn from(err: serde_json::Error) -> PluginError {
        PluginError::Json(err.to_string())
    }
}

impl From<anyhow::Error> for PluginError {
    fn from(err: anyhow::Error) -> PluginError {
        PluginError::Other(err.to_string())
    }
}

impl From<std::io::Error> for PluginError {
    fn from(err: std::io::Error) -> PluginError {
        PluginError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nothing;
    impl Lifecycle for Nothing {}
    impl Source for Nothing {
        fn read_batch(&mut self) -> Result<Option<Batch>, PluginError> {
            Ok(None)
        }
    }

    #[test]
    fn factory_builds_role_tagged_callbacks() {
        let factory = PluginFactory::source(|| Nothing);
        assert_eq!(factory.role(), Role::Source);

        let mut cb = factory.build();
        assert_eq!(cb.role(), Role::Source);
        assert!(cb.as_source().is_some());
        assert!(cb.as_sink().is_none());
        assert!(cb.as_processor().is_none());
    }

    #[test]
    fn role_parses_and_prints_lowercase() {
        let role: Role = "processor".parse().unwrap();
        assert_eq!(role, Role::Processor);
        assert_eq!(Role::Sink.to_string(), "sink");
        assert_eq!(serde_json::to_string(&Role::Source).unwrap(), "\"source\"");
    }
}
