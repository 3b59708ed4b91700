//! End-to-end exercises of the bridge over the loopback transport.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use svarog_core::{Acceptor, EventLoop, IoError, LocalLoop, Reactor, Socket};
use svarog_transport::{Endpoint, MemoryTransport, TransportError};

fn rig() -> (Arc<LocalLoop>, Arc<MemoryTransport>, Reactor) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let event_loop = LocalLoop::new();
    let transport = Arc::new(MemoryTransport::new());
    let reactor = Reactor::new(event_loop.clone(), transport.clone()).unwrap();
    (event_loop, transport, reactor)
}

// Keep reading, echoing everything back, until the peer closes.
fn serve_echo(server: Socket, seen: Arc<Mutex<Vec<u8>>>) {
    let conn = server.clone();
    server.async_read_some(64, move |result| match result {
        Ok(data) => {
            seen.lock().unwrap().extend_from_slice(&data);
            let again = conn.clone();
            let seen = Arc::clone(&seen);
            conn.async_write_some(Bytes::copy_from_slice(&data), move |result| {
                result.expect("server write");
                serve_echo(again, seen);
            });
        }
        Err(IoError::EndOfStream) => {
            conn.close().unwrap();
        }
        Err(error) => panic!("server read failed: {error}"),
    });
}

#[test]
fn echo_round_trip() {
    let (event_loop, _transport, reactor) = rig();
    let acceptor = Acceptor::new(&reactor, 4242).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let received = Arc::new(Mutex::new(Vec::new()));

    {
        let seen = Arc::clone(&seen);
        acceptor
            .async_accept(move |result| serve_echo(result.expect("accept"), seen))
            .unwrap();
    }

    let client = Socket::new(&reactor).unwrap();
    {
        let conn = client.clone();
        let received = Arc::clone(&received);
        client
            .async_connect(Endpoint::v4(Ipv4Addr::LOCALHOST, 4242), move |result| {
                result.expect("connect");
                let writer = conn.clone();
                writer.async_write_some(Bytes::from_static(b"ping"), move |result| {
                    assert_eq!(result.expect("client write"), 4);
                    let reader = conn.clone();
                    reader.async_read_some(64, move |result| {
                        let data = result.expect("client read");
                        received.lock().unwrap().extend_from_slice(&data);
                        conn.close().unwrap();
                    });
                });
            })
            .unwrap();
    }

    event_loop.run();
    assert_eq!(seen.lock().unwrap().as_slice(), b"ping");
    assert_eq!(received.lock().unwrap().as_slice(), b"ping");
    reactor.shutdown();
}

#[test]
fn read_reports_end_of_stream_when_peer_closes() {
    let (event_loop, _transport, reactor) = rig();
    let acceptor = Acceptor::new(&reactor, 4243).unwrap();

    {
        let event_loop = event_loop.clone();
        acceptor
            .async_accept(move |result| {
                let server = result.expect("accept");
                // Close a turn later so the client's read can go first.
                event_loop.post(Box::new(move || server.close().unwrap()));
            })
            .unwrap();
    }

    let outcome = Arc::new(Mutex::new(None));
    let client = Socket::new(&reactor).unwrap();
    {
        let conn = client.clone();
        let outcome = Arc::clone(&outcome);
        client
            .async_connect(Endpoint::v4(Ipv4Addr::LOCALHOST, 4243), move |result| {
                result.expect("connect");
                let outcome = Arc::clone(&outcome);
                conn.async_read_some(16, move |result| {
                    *outcome.lock().unwrap() = Some(result);
                });
            })
            .unwrap();
    }

    event_loop.run();
    assert_eq!(*outcome.lock().unwrap(), Some(Err(IoError::EndOfStream)));
    reactor.shutdown();
}

#[test]
fn connect_without_listener_reports_no_server() {
    let (event_loop, _transport, reactor) = rig();

    let outcome = Arc::new(Mutex::new(None));
    let client = Socket::new(&reactor).unwrap();
    {
        let outcome = Arc::clone(&outcome);
        client
            .async_connect(Endpoint::v4(Ipv4Addr::LOCALHOST, 9999), move |result| {
                *outcome.lock().unwrap() = Some(result);
            })
            .unwrap();
    }

    event_loop.run();
    assert_eq!(
        *outcome.lock().unwrap(),
        Some(Err(IoError::Transport(TransportError::NoServer)))
    );
    reactor.shutdown();
}

#[test]
fn canceled_read_resolves_exactly_once() {
    let (event_loop, _transport, reactor) = rig();
    let acceptor = Acceptor::new(&reactor, 4244).unwrap();

    let held = Arc::new(Mutex::new(None));
    {
        let held = Arc::clone(&held);
        acceptor
            .async_accept(move |result| {
                // Keep the server side open so no end-of-stream can race the
                // cancel.
                *held.lock().unwrap() = Some(result.expect("accept"));
            })
            .unwrap();
    }

    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let invocations = Arc::new(AtomicUsize::new(0));
    let client = Socket::new(&reactor).unwrap();
    {
        let conn = client.clone();
        let event_loop = event_loop.clone();
        let outcomes = Arc::clone(&outcomes);
        let invocations = Arc::clone(&invocations);
        client
            .async_connect(Endpoint::v4(Ipv4Addr::LOCALHOST, 4244), move |result| {
                result.expect("connect");
                let reader = conn.clone();
                let outcomes = Arc::clone(&outcomes);
                let invocations = Arc::clone(&invocations);
                reader.async_read_some(16, move |result| {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    outcomes.lock().unwrap().push(result);
                });
                // The server never writes, so the read stays parked until
                // this runs.
                event_loop.post(Box::new(move || conn.cancel().unwrap()));
            })
            .unwrap();
    }

    event_loop.run();
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(*outcomes.lock().unwrap(), vec![Err(IoError::Canceled)]);
    reactor.shutdown();
}

#[test]
fn canceled_connect_resolves_exactly_once() {
    let (event_loop, _transport, reactor) = rig();
    let _acceptor = Acceptor::new(&reactor, 4245).unwrap();

    let invocations = Arc::new(AtomicUsize::new(0));
    let outcome = Arc::new(Mutex::new(None));
    let client = Socket::new(&reactor).unwrap();
    {
        let invocations = Arc::clone(&invocations);
        let outcome = Arc::clone(&outcome);
        client
            .async_connect(Endpoint::v4(Ipv4Addr::LOCALHOST, 4245), move |result| {
                invocations.fetch_add(1, Ordering::SeqCst);
                *outcome.lock().unwrap() = Some(result);
            })
            .unwrap();
    }
    client.cancel().unwrap();

    event_loop.run();
    // The cancel races the reactor's own dispatch; whichever wins, the
    // handler resolves exactly once and the attempt does not linger.
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    match outcome.lock().unwrap().expect("handler ran") {
        Err(IoError::Canceled) => assert!(!client.is_open()),
        Err(IoError::Transport(TransportError::NoServer)) | Ok(()) => {}
        other => panic!("unexpected connect outcome: {other:?}"),
    }
    reactor.shutdown();
}

#[test]
fn immediate_completion_is_still_delivered_via_the_loop() {
    let (event_loop, _transport, reactor) = rig();
    let acceptor = Acceptor::new(&reactor, 4246).unwrap();

    // The server side has to stay open, or the client's write would see the
    // connection break instead of completing.
    let held = Arc::new(Mutex::new(None));
    {
        let held = Arc::clone(&held);
        acceptor
            .async_accept(move |result| {
                *held.lock().unwrap() = Some(result.expect("accept"));
            })
            .unwrap();
    }

    let fired = Arc::new(AtomicBool::new(false));
    let client = Socket::new(&reactor).unwrap();
    {
        let conn = client.clone();
        let fired = Arc::clone(&fired);
        client
            .async_connect(Endpoint::v4(Ipv4Addr::LOCALHOST, 4246), move |result| {
                result.expect("connect");
                // Plenty of buffer space, so this write completes at once;
                // the handler must still only run on a later loop turn.
                let inner_fired = Arc::clone(&fired);
                conn.async_write_some(Bytes::from_static(b"x"), move |result| {
                    result.expect("write");
                    inner_fired.store(true, Ordering::SeqCst);
                });
                assert!(!fired.load(Ordering::SeqCst));
            })
            .unwrap();
    }

    event_loop.run();
    assert!(fired.load(Ordering::SeqCst));
    reactor.shutdown();
}

#[test]
fn parked_write_retries_after_the_peer_drains() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let event_loop = LocalLoop::new();
    let transport = Arc::new(MemoryTransport::with_send_capacity(4));
    let reactor = Reactor::new(event_loop.clone(), transport.clone()).unwrap();
    let acceptor = Acceptor::new(&reactor, 4249).unwrap();

    let held = Arc::new(Mutex::new(None));
    {
        let held = Arc::clone(&held);
        acceptor
            .async_accept(move |result| {
                *held.lock().unwrap() = Some(result.expect("accept"));
            })
            .unwrap();
    }

    let drained = Arc::new(Mutex::new(Vec::new()));
    let second_write = Arc::new(Mutex::new(None));
    let client = Socket::new(&reactor).unwrap();
    {
        let conn = client.clone();
        let event_loop = event_loop.clone();
        let held = Arc::clone(&held);
        let drained = Arc::clone(&drained);
        let second_write = Arc::clone(&second_write);
        client
            .async_connect(Endpoint::v4(Ipv4Addr::LOCALHOST, 4249), move |result| {
                result.expect("connect");
                let writer = conn.clone();
                writer.async_write_some(Bytes::from_static(b"full"), move |result| {
                    assert_eq!(result.expect("first write"), 4);
                    // The peer buffer is at capacity now, so this one parks.
                    let retry = conn.clone();
                    let second_write = Arc::clone(&second_write);
                    retry.async_write_some(Bytes::from_static(b"hi"), move |result| {
                        *second_write.lock().unwrap() = Some(result);
                    });
                    let drained = Arc::clone(&drained);
                    let held = Arc::clone(&held);
                    event_loop.post(Box::new(move || {
                        let server = held.lock().unwrap().clone().expect("accepted");
                        server.async_read_some(4, move |result| {
                            drained
                                .lock()
                                .unwrap()
                                .extend_from_slice(&result.expect("drain"));
                        });
                    }));
                });
            })
            .unwrap();
    }

    event_loop.run();
    assert_eq!(drained.lock().unwrap().as_slice(), b"full");
    assert_eq!(*second_write.lock().unwrap(), Some(Ok(2)));
    reactor.shutdown();
}

#[test]
fn degenerate_transfers_complete_without_parking() {
    let (event_loop, _transport, reactor) = rig();
    let acceptor = Acceptor::new(&reactor, 4250).unwrap();

    let held = Arc::new(Mutex::new(None));
    {
        let held = Arc::clone(&held);
        acceptor
            .async_accept(move |result| {
                *held.lock().unwrap() = Some(result.expect("accept"));
            })
            .unwrap();
    }

    let zero_read = Arc::new(Mutex::new(None));
    let empty_write = Arc::new(Mutex::new(None));
    let client = Socket::new(&reactor).unwrap();
    {
        let conn = client.clone();
        let zero_read = Arc::clone(&zero_read);
        let empty_write = Arc::clone(&empty_write);
        client
            .async_connect(Endpoint::v4(Ipv4Addr::LOCALHOST, 4250), move |result| {
                result.expect("connect");
                let reader = conn.clone();
                let zero_read = Arc::clone(&zero_read);
                reader.async_read_some(0, move |result| {
                    *zero_read.lock().unwrap() = Some(result);
                });
                let writer = conn.clone();
                let empty_write = Arc::clone(&empty_write);
                writer.async_write_some(Bytes::new(), move |result| {
                    *empty_write.lock().unwrap() = Some(result);
                });
            })
            .unwrap();
    }

    event_loop.run();
    assert_eq!(*zero_read.lock().unwrap(), Some(Ok(Bytes::new())));
    assert_eq!(*empty_write.lock().unwrap(), Some(Ok(0)));
    reactor.shutdown();
}

#[test]
fn canceled_accept_resolves_as_canceled() {
    let (event_loop, _transport, reactor) = rig();
    let acceptor = Acceptor::new(&reactor, 0).unwrap();
    assert!(acceptor.port() >= 49152);

    let invocations = Arc::new(AtomicUsize::new(0));
    let outcome = Arc::new(Mutex::new(None));
    {
        let invocations = Arc::clone(&invocations);
        let outcome = Arc::clone(&outcome);
        acceptor
            .async_accept(move |result| {
                invocations.fetch_add(1, Ordering::SeqCst);
                *outcome.lock().unwrap() = Some(result.map(|_| ()));
            })
            .unwrap();
    }
    acceptor.cancel();
    acceptor.cancel();

    event_loop.run();
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(*outcome.lock().unwrap(), Some(Err(IoError::Canceled)));
    reactor.shutdown();
}

#[test]
fn accept_reports_the_peer_endpoint() {
    let (event_loop, _transport, reactor) = rig();
    let acceptor = Acceptor::new(&reactor, 4247).unwrap();

    let peer = Arc::new(Mutex::new(None));
    {
        let peer = Arc::clone(&peer);
        acceptor
            .async_accept(move |result| {
                let server = result.expect("accept");
                *peer.lock().unwrap() = server.remote_endpoint();
            })
            .unwrap();
    }

    let client = Socket::new(&reactor).unwrap();
    client
        .async_connect(Endpoint::v6(Ipv6Addr::LOCALHOST, 4247), |result| {
            result.expect("connect");
        })
        .unwrap();

    event_loop.run();
    let peer = peer.lock().unwrap().expect("peer endpoint");
    assert_eq!(peer.addr, std::net::IpAddr::V6(Ipv6Addr::LOCALHOST));
    assert_eq!(Some(peer.port), client.local_port());
    reactor.shutdown();
}

#[test]
fn shutdown_with_parked_operations_lets_the_loop_drain() {
    let (event_loop, _transport, reactor) = rig();
    let acceptor = Acceptor::new(&reactor, 4248).unwrap();

    let invocations = Arc::new(AtomicUsize::new(0));
    {
        let invocations = Arc::clone(&invocations);
        acceptor
            .async_accept(move |_| {
                invocations.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    reactor.shutdown();
    // The parked accept was dropped with its work guard, so run returns
    // without the handler ever firing.
    event_loop.run();
    assert_eq!(invocations.load(Ordering::SeqCst), 0);
}
