//! ActionCable client core for load testing.

pub mod channel;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod filter;
pub mod inbox;
pub mod message;
pub mod protocol;
pub mod rails;
pub mod runtime;
pub mod scenario;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use channel::{Channel, ChannelState};
pub use client::Client;
pub use codec::Codec;
pub use config::ConnectOptions;
pub use connection::{ConnectionState, StatsSnapshot};
pub use error::{CableError, Result};
pub use filter::Filter;
pub use message::Message;
