//! ftcomm transport: framed TCP links multiplexed over an epoll worker pool,
//! a blocking connect handshake, and optional TLS.
//!
//! A [`Server`] accepts ranks, a [`Client`] connects one rank to the
//! controller. Both share the [`endpoint::Endpoint`] machinery: per-link
//! receive/send state machines driven by edge-triggered epoll [`worker`]s,
//! a round-robin [`selector`], and a delayed [`cleanup`] of broken links.

pub mod buffer;
pub mod cleanup;
pub mod client;
pub mod config;
pub mod connector;
pub mod endpoint;
pub mod epoll;
pub mod error;
pub mod framing;
pub mod handler;
pub mod link;
pub mod listener;
pub mod protocol;
pub mod queue;
pub mod retry;
pub mod selector;
pub mod server;
pub mod socket;
pub mod telemetry;
pub mod tls;
pub mod worker;

pub use buffer::DataBuffer;
pub use client::{Client, SERVER_RANK};
pub use config::{ClientOptions, KeepaliveOptions, ServerOptions, TransportOptions};
pub use endpoint::EndpointStats;
pub use error::{Result, TransportError};
pub use handler::{RequestContext, SendStatus, SentNotice};
pub use link::{Link, LinkId, LinkState};
pub use protocol::{
    ConnectRequest, ConnectResponse, ConnectResult, Frame, MessageHeader, MessageType,
};
pub use retry::RetryConfig;
pub use server::Server;
pub use tls::{TlsError, TlsOptions};
