//! TLS loopback tests using rustls and throwaway rcgen certificates.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ftcomm_transport::tls::{TlsError, TlsOptions, TlsProviderKind};
use ftcomm_transport::{Client, MessageType, Server, TransportError};
use parking_lot::Mutex;

use crate::harness::{client_options, init_test_tracing, server_options, start_server, wait_until, TlsFixture};

fn tls_echo_server(fixture: &TlsFixture) -> Server {
    echo_server_with(fixture.options())
}

fn echo_server_with(tls: TlsOptions) -> Server {
    let mut options = server_options(1, 4);
    options.tls = tls;
    let server = Server::new(options);
    server
        .register_request_handler(MessageType::Echo, |ctx| {
            let _ = ctx.reply(MessageType::Echo, 0, ctx.body().clone());
        })
        .unwrap();
    server
}

#[test]
fn test_tls_echo_roundtrip() {
    init_test_tracing();
    let fixture = TlsFixture::new();
    let server = tls_echo_server(&fixture);
    let addr = start_server(&server);

    let mut options = client_options(addr, 2);
    options.tls = fixture.options();
    let client = Client::new(options);
    let replies = Arc::new(Mutex::new(Vec::new()));
    let sink = replies.clone();
    client
        .register_request_handler(MessageType::Echo, move |ctx| sink.lock().push(ctx.body().clone()))
        .unwrap();
    client.start().unwrap();
    assert!(client.link().is_some_and(|l| l.is_tls()));

    // larger than one TLS record
    let big = Bytes::from(vec![0xA5u8; 70_000]);
    client.send(MessageType::Echo, Bytes::from_static(b"hello")).unwrap();
    client.send(MessageType::Echo, big.clone()).unwrap();

    assert!(wait_until(Duration::from_secs(5), || replies.lock().len() == 2));
    let replies = replies.lock();
    assert_eq!(replies[0], Bytes::from_static(b"hello"));
    assert_eq!(replies[1], big);
    assert!(server.link(2).is_some_and(|l| l.is_tls()));
}

#[test]
fn test_untrusted_ca_fails_handshake() {
    let server_fixture = TlsFixture::new();
    let client_fixture = TlsFixture::new();
    let server = tls_echo_server(&server_fixture);
    let addr = start_server(&server);

    let mut options = client_options(addr, 3);
    options.tls = client_fixture.options();
    options.connect_retry.max_retries = 0;
    let client = Client::new(options);
    assert!(client.start().is_err());
    assert!(!client.is_connected());
    assert!(wait_until(Duration::from_secs(2), || server.link(3).is_none()));
}

#[test]
fn test_plaintext_client_rejected_by_tls_server() {
    let fixture = TlsFixture::new();
    let server = tls_echo_server(&fixture);
    let addr = start_server(&server);

    let mut options = client_options(addr, 4);
    options.connect_retry.max_retries = 0;
    options.connect_timeout_ms = 500;
    let client = Client::new(options);
    assert!(client.start().is_err());
    assert!(server.link(4).is_none());
}

#[test]
fn test_second_start_leaves_tls_running() {
    let fixture = TlsFixture::new();
    let server = tls_echo_server(&fixture);
    let addr = start_server(&server);

    assert!(matches!(server.start(), Err(TransportError::InvalidState(_))));
    assert!(server.is_running());

    let mut options = client_options(addr, 6);
    options.tls = fixture.options();
    let client = Client::new(options);
    client.start().unwrap();
    assert!(client.link().is_some_and(|l| l.is_tls()));
    assert!(wait_until(Duration::from_secs(2), || server.link(6).is_some_and(|l| l.is_tls())));

    assert!(matches!(client.start(), Err(TransportError::InvalidState(_))));
    assert!(client.is_connected());
}

/// Starts a server on the system OpenSSL, or `None` when libssl is not installed.
fn dynamic_echo_server(fixture: &TlsFixture) -> Option<(Server, std::net::SocketAddr)> {
    let server = echo_server_with(fixture.options_for(TlsProviderKind::Dynamic));
    match server.start() {
        Ok(()) => {}
        Err(TransportError::Tls(TlsError::LibraryLoad { .. } | TlsError::MissingSymbol { .. })) => {
            eprintln!("system libssl unavailable, skipping");
            return None;
        }
        Err(err) => panic!("dynamic TLS server failed to start: {err}"),
    }
    let addr = server.local_addr().unwrap();
    Some((server, addr))
}

#[test]
fn test_dynamic_provider_echo_roundtrip() {
    init_test_tracing();
    let fixture = TlsFixture::new();
    let Some((server, addr)) = dynamic_echo_server(&fixture) else {
        return;
    };

    let mut options = client_options(addr, 7);
    options.tls = fixture.options_for(TlsProviderKind::Dynamic);
    let client = Client::new(options);
    let replies = Arc::new(Mutex::new(Vec::new()));
    let sink = replies.clone();
    client
        .register_request_handler(MessageType::Echo, move |ctx| sink.lock().push(ctx.body().clone()))
        .unwrap();
    client.start().unwrap();

    let big = Bytes::from(vec![0x5Au8; 40_000]);
    client.send(MessageType::Echo, Bytes::from_static(b"hello")).unwrap();
    client.send(MessageType::Echo, big.clone()).unwrap();
    assert!(wait_until(Duration::from_secs(5), || replies.lock().len() == 2));
    assert_eq!(replies.lock()[0], Bytes::from_static(b"hello"));
    assert_eq!(replies.lock()[1], big);
    assert!(server.link(7).is_some_and(|l| l.is_tls()));
}

#[test]
fn test_dynamic_provider_checks_server_name() {
    let fixture = TlsFixture::new();
    let Some((server, addr)) = dynamic_echo_server(&fixture) else {
        return;
    };

    let mut options = client_options(addr, 8);
    options.tls = fixture.options_for(TlsProviderKind::Dynamic);
    options.tls.server_name = Some("elsewhere.invalid".to_string());
    options.connect_retry.max_retries = 0;
    let client = Client::new(options);
    assert!(client.start().is_err());

    let mut options = client_options(addr, 9);
    options.tls = fixture.options_for(TlsProviderKind::Dynamic);
    options.tls.server_name = Some("localhost".to_string());
    let client = Client::new(options);
    client.start().unwrap();
    assert!(wait_until(Duration::from_secs(2), || server.link(9).is_some()));
}
