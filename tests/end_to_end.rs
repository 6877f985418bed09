use std::sync::{Arc, Mutex};
use std::time::Duration;

use evio::{
    BufferedSocket, Listener, Reactor, Ready, SocketEvents, SocketOptions,
};

mod util;

use util::init;

// The whole stack at once: a listener accepts a connection, wraps it in
// a buffered socket that echoes its input, and a buffered-socket client
// connected through the same reactor gets its bytes back.
#[test]
fn echo_server_roundtrip() {
    init();
    let reactor = Reactor::new().unwrap();

    let server_side: Arc<Mutex<Option<BufferedSocket>>> = Arc::new(Mutex::new(None));
    let server_slot = Arc::clone(&server_side);
    let listen_reactor = reactor.clone();

    let listener = Listener::bind(
        &reactor,
        &"127.0.0.1:0".parse().unwrap(),
        5,
        move |fd, peer| {
            log::debug!("accepted fd {} from {}", fd, peer);
            let bs = BufferedSocket::new(
                &listen_reactor,
                fd,
                SocketOptions::CLOSE_ON_FREE,
            )
            .expect("unable to wrap accepted socket");
            bs.set_read_callback(|bs| {
                let input = bs.input();
                bs.write_buffer(&input).unwrap();
            });
            bs.enable(Ready::READABLE).unwrap();
            *server_slot.lock().unwrap() = Some(bs);
        },
    )
    .unwrap();
    let addr = listener.local_addr().unwrap();

    let client = BufferedSocket::new(&reactor, -1, SocketOptions::CLOSE_ON_FREE).unwrap();
    let response = Arc::new(Mutex::new(Vec::new()));

    let response2 = Arc::clone(&response);
    let r2 = reactor.clone();
    client.set_read_callback(move |bs| {
        let mut tmp = [0u8; 64];
        loop {
            let n = bs.read(&mut tmp).unwrap();
            if n == 0 {
                break;
            }
            response2.lock().unwrap().extend_from_slice(&tmp[..n]);
        }
        if response2.lock().unwrap().len() >= 6 {
            r2.loop_break().unwrap();
        }
    });
    let connected = Arc::new(Mutex::new(false));
    let connected2 = Arc::clone(&connected);
    client.set_event_callback(move |_, what| {
        if what.contains(SocketEvents::CONNECTED) {
            *connected2.lock().unwrap() = true;
        } else {
            panic!("unexpected socket event {:?}", what);
        }
    });

    client.connect(&addr).unwrap();
    client.write(b"hello\n").unwrap();
    client.enable(Ready::READABLE).unwrap();

    // Safety net so a regression cannot hang the test suite.
    reactor.loop_exit(Some(Duration::from_secs(5))).unwrap();
    reactor.dispatch().unwrap();

    assert!(*connected.lock().unwrap(), "CONNECTED was never delivered");
    assert_eq!(response.lock().unwrap().as_slice(), b"hello\n");
    assert!(server_side.lock().unwrap().is_some(), "nothing was accepted");
}

// Disabling a listener stops accepts until it is enabled again.
#[test]
fn listener_disable_enable() {
    init();
    let reactor = Reactor::new().unwrap();
    let accepted = Arc::new(Mutex::new(0usize));

    let accepted2 = Arc::clone(&accepted);
    let listener = Listener::bind(
        &reactor,
        &"127.0.0.1:0".parse().unwrap(),
        5,
        move |fd, _| {
            *accepted2.lock().unwrap() += 1;
            unsafe { libc::close(fd) };
        },
    )
    .unwrap();
    let addr = listener.local_addr().unwrap();

    listener.disable().unwrap();
    let _first = std::net::TcpStream::connect(addr).unwrap();
    reactor.loop_exit(Some(Duration::from_millis(50))).unwrap();
    reactor.dispatch().unwrap();
    assert_eq!(*accepted.lock().unwrap(), 0);

    listener.enable().unwrap();
    reactor.loop_exit(Some(Duration::from_millis(200))).unwrap();
    reactor.dispatch().unwrap();
    assert_eq!(*accepted.lock().unwrap(), 1);
}
