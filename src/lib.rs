//! redimux is the core of a Redis/Valkey client: a long-lived, thread-safe
//! connection multiplexer that admits commands from many concurrent tasks,
//! routes each to the right server (standalone, primary/replica,
//! sentinel-monitored or sharded cluster), serialises them on a single
//! writer per connection, and matches parsed replies back to the caller's
//! future.
//!
//! The surface is deliberately small: [`Multiplexer::execute`] issues an
//! arbitrary command built with [`cmd`] and awaits a typed [`Reply`];
//! pub/sub flows through [`Multiplexer::subscribe_with_handler`] /
//! [`Multiplexer::subscribe_with_queue`]; atomic blocks through
//! [`Transaction`]. Typed wrappers for individual commands are a thin layer
//! callers build on top.
//!
//! ```no_run
//! use redimux::{cmd, Multiplexer};
//!
//! # async fn run() -> redimux::Result<()> {
//! let mux = Multiplexer::connect("localhost:6379,name=worker-1").await?;
//! mux.execute(cmd("SET").arg_key("greeting").arg("hello")).await?;
//! let reply = mux.execute(cmd("GET").arg_key("greeting")).await?;
//! assert_eq!(reply.as_bytes(), Some(&b"hello"[..]));
//! # Ok(())
//! # }
//! ```

mod bridge;
mod cmd;
mod codec;
mod config;
mod connection;
mod counters;
mod endpoint;
mod errors;
mod events;
mod multiplexer;
mod pubsub;
mod retry;
mod routing;
mod slotmap;
mod transaction;
mod types;

pub use cmd::{cmd, Cmd, CommandFlags, ToArgs};
pub use codec::ProtocolVersion;
pub use config::{DefaultOptionsProvider, EndpointAddr, Options, OptionsProvider, ProxyKind};
pub use counters::CounterSnapshot;
pub use endpoint::{Features, ServerRole, ServerType, ServerVersion};
pub use errors::{ConnectionFailureKind, Error, Result, TimeoutPhase};
pub use events::MultiplexerEvent;
pub use multiplexer::{Multiplexer, ServerHandle};
pub use pubsub::{
    HandlerToken, MessageHandler, PubSubMessage, SubscriptionKind, SubscriptionQueue,
};
pub use retry::{ExponentialBackoffPolicy, ReconnectRetryPolicy};
pub use routing::{combined_slot, hash_slot};
pub use transaction::{Condition, Transaction};
pub use types::Reply;
