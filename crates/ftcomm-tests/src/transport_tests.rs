//! Transport Integration Tests
//!
//! Servers and clients talking over loopback sockets through the real worker pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use ftcomm_transport::{
    Client, ConnectResult, MessageType, SendStatus, SentNotice, Server, TransportError, SERVER_RANK,
};
use parking_lot::Mutex;

use crate::harness::{client_options, connect_clients, init_test_tracing, server_options, start_server, wait_until};

const WAIT: Duration = Duration::from_secs(5);

fn echo_server(workers: usize, links_per_worker: usize) -> Server {
    let server = Server::new(server_options(workers, links_per_worker));
    server
        .register_request_handler(MessageType::Echo, |ctx| {
            let body = ctx.body().clone();
            if let Err(err) = ctx.reply(MessageType::Echo, 0, body) {
                tracing::warn!(error = %err, "echo reply failed");
            }
        })
        .unwrap();
    server
}

mod loopback_tests {
    use super::*;

    #[test]
    fn test_echo_preserves_order_and_content() {
        init_test_tracing();
        let server = echo_server(2, 8);
        let addr = start_server(&server);

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let clients = connect_clients(&server, addr, &[1], |client| {
            let sink = sink.clone();
            client
                .register_request_handler(MessageType::Echo, move |ctx| {
                    sink.lock().push((ctx.frame().header.seq_no, ctx.body().clone()));
                })
                .unwrap();
        });
        let client = &clients[0];

        let bodies: Vec<Bytes> = (0..200u32)
            .map(|i| Bytes::from(vec![(i % 251) as u8; (i as usize * 37) % 5000]))
            .collect();
        for body in &bodies {
            client.send(MessageType::Echo, body.clone()).unwrap();
        }
        assert!(wait_until(WAIT, || received.lock().len() == bodies.len()));

        let received = received.lock();
        let got: Vec<&Bytes> = received.iter().map(|(_, b)| b).collect();
        let want: Vec<&Bytes> = bodies.iter().collect();
        assert_eq!(got, want);
        assert!(received.windows(2).all(|w| w[0].0 < w[1].0), "seq numbers must increase per link");

        let stats = server.stats();
        assert_eq!(stats.links, 1);
        assert!(stats.frames_in >= 200);
        drop(received);
        client.stop();
        server.stop();
    }

    #[test]
    fn test_sent_handler_gets_context() {
        let server = Server::new(server_options(1, 4));
        let addr = start_server(&server);

        let notices: Arc<Mutex<Vec<SentNotice>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = notices.clone();
        let clients = connect_clients(&server, addr, &[4], |client| {
            let sink = sink.clone();
            client
                .register_sent_handler(MessageType::Report, move |notice| sink.lock().push(notice))
                .unwrap();
        });
        clients[0]
            .send_with_context(MessageType::Report, Bytes::from_static(b"status"), Bytes::from_static(b"ctx-1"))
            .unwrap();

        assert!(wait_until(WAIT, || !notices.lock().is_empty()));
        let notice = notices.lock()[0].clone();
        assert_eq!(notice.status, SendStatus::Sent);
        assert_eq!(notice.rank, SERVER_RANK);
        assert_eq!(notice.context.as_deref(), Some(&b"ctx-1"[..]));
        // no request handler on the server for Report
        assert!(wait_until(WAIT, || server.stats().unhandled_frames == 1));
    }

    #[test]
    fn test_broadcast_reaches_every_rank() {
        let server = Server::new(server_options(2, 8));
        let addr = start_server(&server);
        let hits = Arc::new(AtomicUsize::new(0));
        let ranks = [10u64, 11, 12, 13, 14];
        let counter = hits.clone();
        let _clients = connect_clients(&server, addr, &ranks, |client| {
            let counter = counter.clone();
            client
                .register_request_handler(MessageType::Notify, move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        });

        let mut targets = ranks.to_vec();
        targets.push(99);
        let results = server.broadcast(&targets, MessageType::Notify, Bytes::from_static(b"n"), |_| None);
        assert_eq!(results.len(), 6);
        for (rank, result) in &results {
            if *rank == 99 {
                assert!(matches!(result, Err(TransportError::NotConnected { rank: 99 })));
            } else {
                assert!(result.is_ok());
            }
        }
        assert!(wait_until(WAIT, || hits.load(Ordering::SeqCst) == ranks.len()));
        let mut connected = server.connected_ranks();
        connected.sort_unstable();
        assert_eq!(connected, ranks.to_vec());
        let stats = server.stats();
        assert_eq!(stats.links_per_worker.iter().sum::<usize>(), ranks.len());
    }
}

mod link_lifecycle_tests {
    use super::*;

    #[test]
    fn test_saturated_server_rejects_extra_link() {
        // 1 worker x 2 links
        let server = Server::new(server_options(1, 2));
        let addr = start_server(&server);
        let _clients = connect_clients(&server, addr, &[1, 2], |_| {});

        let extra = Client::new(client_options(addr, 3));
        let err = extra.start().unwrap_err();
        assert!(
            matches!(err, TransportError::HandshakeRejected { result: ConnectResult::Saturated, .. }),
            "got {err:?}"
        );
        assert!(server.link(3).is_none());
        assert_eq!(server.stats().rejected_connects, 1);
    }

    #[test]
    fn test_connect_hook_rejects_rank() {
        let server = Server::new(server_options(1, 4));
        server
            .set_connect_hook(|request, _peer| {
                if request.rank_id == 13 {
                    Err(ConnectResult::Rejected)
                } else {
                    Ok(())
                }
            })
            .unwrap();
        let addr = start_server(&server);

        let rejected = Client::new(client_options(addr, 13));
        assert!(matches!(
            rejected.start(),
            Err(TransportError::HandshakeRejected { result: ConnectResult::Rejected, .. })
        ));
        let _ok = connect_clients(&server, addr, &[12], |_| {});
        assert!(server.set_connect_hook(|_, _| Ok(())).is_err(), "hooks are frozen after start");
    }

    #[test]
    fn test_same_rank_replaces_old_link() {
        let server = Server::new(server_options(2, 4));
        let broken = Arc::new(Mutex::new(Vec::new()));
        let sink = broken.clone();
        server
            .set_link_broken_hook(move |rank, link_id| sink.lock().push((rank, link_id)))
            .unwrap();
        let addr = start_server(&server);

        let first = connect_clients(&server, addr, &[5], |_| {});
        let old_id = server.link(5).unwrap().id();
        let second = Client::new(client_options(addr, 5));
        second.start().unwrap();
        assert!(wait_until(WAIT, || server.link(5).is_some_and(|l| l.id() != old_id)));

        assert!(wait_until(WAIT, || broken.lock().contains(&(5, old_id))));
        assert!(wait_until(WAIT, || !first[0].is_connected()));
        assert!(second.is_connected());
        assert_eq!(server.stats().links, 1);
    }

    #[test]
    fn test_disconnect_then_reconnect() {
        let server = echo_server(1, 4);
        let addr = start_server(&server);
        let clients = connect_clients(&server, addr, &[8], |_| {});
        let client = &clients[0];

        assert!(server.disconnect(8));
        assert!(server.link(8).is_none());
        assert!(!server.disconnect(8));
        assert!(wait_until(WAIT, || !client.is_connected()));
        assert!(matches!(
            client.send(MessageType::Echo, Bytes::new()),
            Err(TransportError::NotConnected { .. })
        ));

        client.reconnect().unwrap();
        assert!(client.is_connected());
        assert!(wait_until(WAIT, || server.link(8).is_some()));
        assert!(server.stats().broken_links >= 1);
    }

    #[test]
    fn test_break_link_has_one_winner() {
        let server = Server::new(server_options(1, 4));
        let addr = start_server(&server);
        let _clients = connect_clients(&server, addr, &[21], |_| {});
        let link = server.link(21).unwrap();

        let winners = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let link = link.clone();
                let winners = winners.clone();
                thread::spawn(move || {
                    if link.break_link() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert!(link.is_broken());
        server.stop();
        assert!(!link.is_open());
    }

    #[test]
    fn test_stop_is_idempotent_and_closes_links() {
        let server = Server::new(server_options(2, 4));
        let addr = start_server(&server);
        let clients = connect_clients(&server, addr, &[1, 2], |_| {});
        server.stop();
        server.stop();
        assert!(!server.is_running());
        assert!(server.connected_ranks().is_empty());
        for client in &clients {
            assert!(wait_until(WAIT, || !client.is_connected()));
        }
    }
}
