//! Initiator side of the connect handshake.

use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use crate::config::TransportOptions;
use crate::error::{Result, TransportError};
use crate::framing::classify_io;
use crate::link::PendingLink;
use crate::protocol::{ConnectRequest, ConnectResult};
use crate::retry::{Backoff, RetryConfig};
use crate::tls::TlsProvider;

/// Where and how to dial.
#[derive(Clone)]
pub struct Dial<'a> {
    pub addr: SocketAddr,
    /// Rank of the remote side, used as the link's key.
    pub peer_rank: u64,
    /// Rank announced to the remote side.
    pub local_rank: u64,
    pub connect_timeout: Duration,
    pub tls: Option<(&'a Arc<dyn TlsProvider>, &'a str)>,
}

/// Connects once and runs the handshake.
pub fn dial(target: &Dial<'_>, options: &TransportOptions) -> Result<PendingLink> {
    let stream = TcpStream::connect_timeout(&target.addr, target.connect_timeout).map_err(classify_io)?;
    let mut pending = PendingLink::new(stream, target.addr);
    pending.set_rank(target.peer_rank);
    pending.set_timeouts(Some(options.handshake_timeout()))?;
    pending.send_connect_request(&ConnectRequest {
        magic: options.magic,
        version: options.version,
        rank_id: target.local_rank,
    })?;
    if let Some((provider, server_name)) = target.tls {
        let session = provider.connect(pending.stream(), server_name)?;
        pending.set_tls(session);
    }
    let response = pending.recv_connect_response()?;
    if response.result != ConnectResult::Accepted {
        return Err(TransportError::HandshakeRejected {
            peer: pending.peer().to_string(),
            result: response.result,
        });
    }
    tracing::debug!(addr = %target.addr, rank = target.peer_rank, tls = target.tls.is_some(), "handshake complete");
    Ok(pending)
}

/// Transport-level failures worth another attempt; rejections and TLS errors are final.
fn retryable(err: &TransportError) -> bool {
    matches!(
        err,
        TransportError::NeedReconnect { .. } | TransportError::LinkBroken | TransportError::Io(_)
    )
}

/// [`dial`] with exponential backoff between attempts.
pub fn dial_with_retry(target: &Dial<'_>, options: &TransportOptions, retry: &RetryConfig) -> Result<PendingLink> {
    let mut backoff = Backoff::new(retry.clone());
    loop {
        let err = match dial(target, options) {
            Ok(pending) => return Ok(pending),
            Err(err) => err,
        };
        if !retryable(&err) {
            tracing::warn!(addr = %target.addr, error = %err, "connect failed");
            return Err(err);
        }
        match backoff.next_delay() {
            Some(delay) => {
                tracing::warn!(
                    addr = %target.addr,
                    attempt = backoff.retries(),
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "connect failed, retrying"
                );
                std::thread::sleep(delay);
            }
            None => {
                tracing::error!(addr = %target.addr, retries = backoff.retries(), error = %err, "connect retries exhausted");
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ConnectResponse, CONNECT_REQUEST_LEN};
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    fn target(addr: SocketAddr) -> Dial<'static> {
        Dial {
            addr,
            peer_rank: 0,
            local_rank: 5,
            connect_timeout: Duration::from_millis(500),
            tls: None,
        }
    }

    fn answer_once(result: ConnectResult) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut raw = [0u8; CONNECT_REQUEST_LEN];
            stream.read_exact(&mut raw).unwrap();
            let request = ConnectRequest::decode(&raw);
            assert_eq!(request.rank_id, 5);
            stream.write_all(&ConnectResponse { result }.encode()).unwrap();
        });
        addr
    }

    #[test]
    fn test_dial_accepted() {
        let addr = answer_once(ConnectResult::Accepted);
        let pending = dial(&target(addr), &TransportOptions::default()).unwrap();
        assert_eq!(pending.rank(), 0);
    }

    #[test]
    fn test_rejection_not_retried() {
        let addr = answer_once(ConnectResult::Rejected);
        let retry = RetryConfig {
            max_retries: 3,
            initial_backoff_ms: 1,
            ..RetryConfig::default()
        };
        let err = dial_with_retry(&target(addr), &TransportOptions::default(), &retry).unwrap_err();
        assert!(matches!(
            err,
            TransportError::HandshakeRejected {
                result: ConnectResult::Rejected,
                ..
            }
        ));
    }

    #[test]
    fn test_refused_retries_then_fails() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let retry = RetryConfig {
            max_retries: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            ..RetryConfig::default()
        };
        let err = dial_with_retry(&target(addr), &TransportOptions::default(), &retry).unwrap_err();
        assert!(retryable(&err), "got {err:?}");
    }
}
