//! ftcomm Test & Validation Infrastructure
//!
//! Loopback integration tests that drive real sockets through the transport
//! and the action engine, plus the harness they share.

pub mod harness;

#[cfg(test)]
mod proptest_framing;
#[cfg(test)]
mod tls_tests;
#[cfg(test)]
mod transport_tests;

pub use harness::{client_options, connect_clients, server_options, start_server, wait_until, TestEnv, TlsFixture};
