//! Runtime for out-of-process data-pipeline plugins.
//!
//! A plugin author implements one of [`Source`], [`Sink`] or [`Processor`]
//! and hands a constructor to [`serve_source`], [`serve_sink`] or
//! [`serve_processor`]. The runtime takes care of sessions, flow control and
//! batch transport.

pub mod batch;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod flow;
pub mod jsonrpc;
pub mod logging;
pub mod message;
pub mod plugin;
pub mod processor;
pub mod serve;
pub mod server;
pub mod session;
pub mod sink;
pub mod source;

pub use batch::{Batch, Record};
pub use client::{ClientError, PluginClient};
pub use config::RuntimeConfig;
pub use error::{Result, RuntimeError};
pub use plugin::{Lifecycle, PluginError, PluginFactory, Processor, Role, Sink, Source};
pub use serve::{serve_processor, serve_sink, serve_source};
pub use session::{SessionContext, UserData};
