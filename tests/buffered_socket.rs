use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use evio::{
    BufferedSocket, LoopFlags, Reactor, Ready, SocketEvents, SocketOptions,
};

mod util;

use util::{assert_send, assert_sync, init};

#[test]
fn is_send_and_sync() {
    assert_send::<BufferedSocket>();
    assert_sync::<BufferedSocket>();
}

#[test]
fn echo_roundtrip() {
    init();
    let reactor = Reactor::new().unwrap();
    let (mut client, server) = UnixStream::pair().unwrap();
    client.set_nonblocking(true).unwrap();

    let bs = BufferedSocket::new(&reactor, server.as_raw_fd(), SocketOptions::EMPTY)
        .unwrap();
    bs.set_read_callback(|bs| {
        // Echo: move everything that arrived to the output side.
        let input = bs.input();
        bs.write_buffer(&input).unwrap();
    });
    bs.enable(Ready::READABLE).unwrap();

    client.write_all(b"hello\n").unwrap();

    let mut got = Vec::new();
    let mut tmp = [0u8; 64];
    for _ in 0..20 {
        reactor.run(LoopFlags::ONCE).unwrap();
        match client.read(&mut tmp) {
            Ok(n) => got.extend_from_slice(&tmp[..n]),
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => panic!("client read failed: {}", err),
        }
        if got == b"hello\n" {
            break;
        }
    }
    assert_eq!(got, b"hello\n");
}

#[test]
fn watermark_suspends_and_resumes() {
    init();
    let reactor = Reactor::new().unwrap();
    let (mut client, server) = UnixStream::pair().unwrap();

    let bs = BufferedSocket::new(&reactor, server.as_raw_fd(), SocketOptions::EMPTY)
        .unwrap();
    let readable_calls = Arc::new(AtomicUsize::new(0));
    let calls = Arc::clone(&readable_calls);
    bs.set_read_callback(move |_| {
        calls.fetch_add(1, Ordering::SeqCst);
    });
    bs.set_watermark(Ready::READABLE, 0, 8);
    bs.enable(Ready::READABLE).unwrap();

    client.write_all(&[b'x'; 32]).unwrap();

    let mut received = Vec::new();
    let mut rounds = 0;
    while received.len() < 32 && rounds < 40 {
        rounds += 1;
        reactor.run(LoopFlags::ONCE).unwrap();

        // Reading never overruns the high watermark.
        assert!(bs.input().len() <= 8);

        let mut tmp = [0u8; 4];
        loop {
            let n = bs.read(&mut tmp).unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&tmp[..n]);
        }
    }

    assert_eq!(received.len(), 32, "bytes were lost");
    assert!(received.iter().all(|&b| b == b'x'));
    assert!(readable_calls.load(Ordering::SeqCst) >= 1);
}

#[test]
fn eof_reaches_event_callback() {
    init();
    let reactor = Reactor::new().unwrap();
    let (client, server) = UnixStream::pair().unwrap();

    let bs = BufferedSocket::new(&reactor, server.as_raw_fd(), SocketOptions::EMPTY)
        .unwrap();
    let seen = Arc::new(Mutex::new(SocketEvents::EMPTY));
    let seen2 = Arc::clone(&seen);
    let r2 = reactor.clone();
    bs.set_event_callback(move |_, what| {
        *seen2.lock().unwrap() = what;
        r2.loop_break().unwrap();
    });
    bs.enable(Ready::READABLE).unwrap();

    drop(client);
    reactor.loop_exit(Some(Duration::from_secs(2))).unwrap();
    reactor.dispatch().unwrap();

    let seen = *seen.lock().unwrap();
    assert!(seen.contains(SocketEvents::READING));
    assert!(seen.contains(SocketEvents::EOF));
}

#[test]
fn read_timeout_fires() {
    init();
    let reactor = Reactor::new().unwrap();
    let (_client, server) = UnixStream::pair().unwrap();

    let bs = BufferedSocket::new(&reactor, server.as_raw_fd(), SocketOptions::EMPTY)
        .unwrap();
    let seen = Arc::new(Mutex::new(SocketEvents::EMPTY));
    let seen2 = Arc::clone(&seen);
    let r2 = reactor.clone();
    bs.set_event_callback(move |_, what| {
        *seen2.lock().unwrap() = what;
        r2.loop_break().unwrap();
    });
    bs.set_timeouts(Some(Duration::from_millis(20)), None).unwrap();
    bs.enable(Ready::READABLE).unwrap();

    reactor.loop_exit(Some(Duration::from_secs(2))).unwrap();
    reactor.dispatch().unwrap();

    let seen = *seen.lock().unwrap();
    assert!(seen.contains(SocketEvents::READING));
    assert!(seen.contains(SocketEvents::TIMEOUT));
}

#[test]
fn suspended_reads_resume_where_they_left_off() {
    init();
    let reactor = Reactor::new().unwrap();
    let (mut client, server) = UnixStream::pair().unwrap();

    let bs = BufferedSocket::new(&reactor, server.as_raw_fd(), SocketOptions::EMPTY)
        .unwrap();
    bs.set_watermark(Ready::READABLE, 0, 4);
    bs.enable(Ready::READABLE).unwrap();

    client.write_all(b"abcdefgh").unwrap();
    reactor.run(LoopFlags::ONCE).unwrap();
    assert_eq!(bs.input().len(), 4);

    // Clearing the watermark resumes reading unconditionally.
    bs.set_watermark(Ready::READABLE, 0, 0);
    reactor.run(LoopFlags::ONCE).unwrap();

    let mut all = [0u8; 8];
    let n = bs.read(&mut all).unwrap();
    assert_eq!(&all[..n], b"abcdefgh");
}

#[test]
fn deferred_callbacks_deliver_connected_first() {
    init();
    let reactor = Reactor::new().unwrap();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let bs = BufferedSocket::new(
        &reactor,
        -1,
        SocketOptions::DEFER_CALLBACKS | SocketOptions::UNLOCK_CALLBACKS,
    )
    .unwrap();

    let log = Arc::new(Mutex::new(Vec::new()));
    let log2 = Arc::clone(&log);
    let r2 = reactor.clone();
    bs.set_event_callback(move |_, what| {
        if what.contains(SocketEvents::CONNECTED) {
            log2.lock().unwrap().push("connected");
        } else {
            log2.lock().unwrap().push("event");
            r2.loop_break().unwrap();
        }
    });
    let log2 = Arc::clone(&log);
    let r2 = reactor.clone();
    bs.set_write_callback(move |_| {
        log2.lock().unwrap().push("write");
        r2.loop_break().unwrap();
    });

    bs.write(b"ping").unwrap();
    bs.connect(&addr).unwrap();

    reactor.loop_exit(Some(Duration::from_secs(2))).unwrap();
    reactor.dispatch().unwrap();

    let log = log.lock().unwrap();
    assert!(!log.is_empty(), "no callbacks ran");
    assert_eq!(log[0], "connected", "CONNECTED must be delivered first");
    assert!(log.contains(&"write"));

    // The peer really received the bytes.
    let (mut peer, _) = listener.accept().unwrap();
    let mut got = [0u8; 4];
    peer.read_exact(&mut got).unwrap();
    assert_eq!(&got, b"ping");
}

#[test]
fn unlock_requires_defer() {
    init();
    let reactor = Reactor::new().unwrap();
    assert!(
        BufferedSocket::new(&reactor, -1, SocketOptions::UNLOCK_CALLBACKS).is_err()
    );
}

#[test]
fn connect_refused_is_reported() {
    init();
    let reactor = Reactor::new().unwrap();

    // Grab a port and close it again so nobody is listening there.
    let port = {
        let tmp = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        tmp.local_addr().unwrap().port()
    };
    let addr = format!("127.0.0.1:{}", port).parse().unwrap();

    let bs = BufferedSocket::new(&reactor, -1, SocketOptions::EMPTY).unwrap();
    let seen = Arc::new(Mutex::new(SocketEvents::EMPTY));
    let seen2 = Arc::clone(&seen);
    let r2 = reactor.clone();
    bs.set_event_callback(move |bs, what| {
        *seen2.lock().unwrap() = what;
        if what.contains(SocketEvents::ERROR) {
            assert!(bs.last_error().is_some());
        }
        r2.loop_break().unwrap();
    });

    bs.connect(&addr).unwrap();
    reactor.loop_exit(Some(Duration::from_secs(2))).unwrap();
    reactor.dispatch().unwrap();

    assert!(seen.lock().unwrap().contains(SocketEvents::ERROR));
}
