//! Tenured: a framed request/response RPC engine with an auth gate, a
//! service-registry abstraction with a caching overlay, and pluggable
//! load-balancing policies.

pub mod auth;
pub mod channel;
pub mod client;
pub mod clusterid;
pub mod codec;
pub mod command;
pub mod correlation;
pub mod error;
pub mod executor;
pub mod loadbalance;
pub mod registry;
pub mod server;

pub use channel::RemotingChannel;
pub use client::TenuredClient;
pub use command::TenuredCommand;
pub use error::{ProtocolError, TenuredError};
pub use server::TenuredServer;
