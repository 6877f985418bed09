use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime};

use evio::{Config, Event, Exit, LoopFlags, Reactor, Ready};

mod util;

use util::{assert_send, assert_sync, init};

#[test]
fn is_send_and_sync() {
    assert_send::<Reactor>();
    assert_sync::<Reactor>();
    assert_send::<Event>();
    assert_sync::<Event>();
}

#[test]
fn method_is_known() {
    init();
    let reactor = Reactor::new().expect("unable to create reactor");
    let name = reactor.method_name();
    assert!(
        ["epoll", "poll", "select"].contains(&name),
        "unexpected backend {}",
        name
    );
}

#[test]
fn avoid_method_falls_back() {
    init();
    let reactor = Reactor::with_config(Config::new().avoid_method("epoll").ignore_env())
        .expect("unable to create reactor");
    assert_ne!(reactor.method_name(), "epoll");
}

#[test]
fn empty_reactor_reports_no_events() {
    init();
    let reactor = Reactor::new().unwrap();
    assert!(!reactor.has_events());
    assert_eq!(reactor.dispatch().unwrap(), Exit::Empty);
}

#[test]
fn once_timer_fires() {
    init();
    let reactor = Reactor::new().unwrap();
    let fired = Arc::new(AtomicUsize::new(0));
    let fired2 = Arc::clone(&fired);
    reactor
        .once(-1, Ready::EMPTY, Some(Duration::from_millis(5)), move |fd, what| {
            assert_eq!(fd, -1);
            assert!(what.is_timeout());
            fired2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    assert!(reactor.has_events());
    reactor.dispatch().unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(!reactor.has_events());
}

#[test]
fn once_readable_fires() {
    init();
    let reactor = Reactor::new().unwrap();
    let (mut sender, receiver) = UnixStream::pair().unwrap();
    sender.write_all(b"!").unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let fired2 = Arc::clone(&fired);
    reactor
        .once(receiver.as_raw_fd(), Ready::READABLE, None, move |_, what| {
            assert!(what.is_readable());
            fired2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    reactor.dispatch().unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn loop_exit_stops_a_busy_loop() {
    init();
    let reactor = Reactor::new().unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let count2 = Arc::clone(&count);
    let ev = Event::new(&reactor, -1, Ready::PERSIST, move |_, what| {
        assert!(what.is_timeout());
        count2.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    ev.add(Some(evio::Timeout::After(Duration::from_millis(1))))
        .unwrap();

    reactor.loop_exit(Some(Duration::from_millis(30))).unwrap();
    assert_eq!(reactor.dispatch().unwrap(), Exit::Done);
    assert!(count.load(Ordering::SeqCst) > 0);
    ev.del().unwrap();
}

#[test]
fn loop_break_from_callback() {
    init();
    let reactor = Reactor::new().unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let count2 = Arc::clone(&count);
    let r2 = reactor.clone();
    let ev = Event::new(&reactor, -1, Ready::PERSIST, move |_, _| {
        if count2.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
            r2.loop_break().unwrap();
        }
    })
    .unwrap();
    ev.add(Some(evio::Timeout::After(Duration::from_millis(1))))
        .unwrap();

    assert_eq!(reactor.dispatch().unwrap(), Exit::Done);
    assert_eq!(count.load(Ordering::SeqCst), 3);
    ev.del().unwrap();
}

#[test]
fn loop_break_from_another_thread() {
    init();
    let reactor = Reactor::new().unwrap();
    // Keep the loop alive and asleep.
    let ev = Event::new(&reactor, -1, Ready::EMPTY, |_, _| {}).unwrap();
    ev.add(Some(evio::Timeout::After(Duration::from_secs(60))))
        .unwrap();

    let r2 = reactor.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        r2.loop_break().unwrap();
    });

    assert_eq!(reactor.dispatch().unwrap(), Exit::Done);
    handle.join().unwrap();
}

#[test]
fn cross_thread_add_wakes_the_loop() {
    init();
    let reactor = Reactor::new().unwrap();
    let parked = Event::new(&reactor, -1, Ready::EMPTY, |_, _| {}).unwrap();
    parked
        .add(Some(evio::Timeout::After(Duration::from_secs(60))))
        .unwrap();

    let r2 = reactor.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        let r3 = r2.clone();
        r2.once(-1, Ready::EMPTY, Some(Duration::from_millis(5)), move |_, _| {
            r3.loop_break().unwrap();
        })
        .unwrap();
    });

    // Without the notification pipe this would sleep the full minute.
    assert_eq!(reactor.dispatch().unwrap(), Exit::Done);
    handle.join().unwrap();
}

#[test]
fn priorities_order_dispatch() {
    init();
    let reactor = Reactor::new().unwrap();
    reactor.set_priorities(4).unwrap();
    assert_eq!(reactor.priority_count(), 4);

    let order = Arc::new(Mutex::new(Vec::new()));

    let order2 = Arc::clone(&order);
    let low = Event::new(&reactor, -1, Ready::EMPTY, move |_, _| {
        order2.lock().unwrap().push("low");
    })
    .unwrap();
    low.set_priority(3).unwrap();

    let order2 = Arc::clone(&order);
    let high = Event::new(&reactor, -1, Ready::EMPTY, move |_, _| {
        order2.lock().unwrap().push("high");
    })
    .unwrap();
    high.set_priority(0).unwrap();

    // Activate in the "wrong" order; dispatch must drain by priority.
    low.active(Ready::TIMEOUT, 1).unwrap();
    high.active(Ready::TIMEOUT, 1).unwrap();
    reactor.run(LoopFlags::NONBLOCK).unwrap();

    assert_eq!(order.lock().unwrap().as_slice(), &["high", "low"]);
}

#[test]
fn set_priorities_rejects_bad_values() {
    init();
    let reactor = Reactor::new().unwrap();
    assert!(reactor.set_priorities(0).is_err());
    assert!(reactor.set_priorities(257).is_err());
    let ev = Event::new(&reactor, -1, Ready::EMPTY, |_, _| {}).unwrap();
    ev.active(Ready::TIMEOUT, 1).unwrap();
    assert!(reactor.set_priorities(2).is_err());
}

#[test]
fn pending_reports_timeout() {
    init();
    let reactor = Reactor::new().unwrap();
    let ev = Event::new(&reactor, -1, Ready::EMPTY, |_, _| {}).unwrap();

    let (what, remaining) = ev.pending(Ready::TIMEOUT);
    assert!(what.is_empty());
    assert!(remaining.is_none());

    ev.add(Some(evio::Timeout::After(Duration::from_secs(3600))))
        .unwrap();
    let (what, remaining) = ev.pending(Ready::TIMEOUT);
    assert!(what.is_timeout());
    let remaining = remaining.unwrap();
    assert!(remaining <= Duration::from_secs(3600));
    assert!(remaining > Duration::from_secs(3500));

    ev.del().unwrap();
    let (what, _) = ev.pending(Ready::TIMEOUT);
    assert!(what.is_empty());
}

#[test]
fn add_then_del_never_fires() {
    init();
    let reactor = Reactor::new().unwrap();
    let fired = Arc::new(AtomicUsize::new(0));
    let fired2 = Arc::clone(&fired);
    let ev = Event::new(&reactor, -1, Ready::EMPTY, move |_, _| {
        fired2.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    ev.add(Some(evio::Timeout::After(Duration::from_millis(1))))
        .unwrap();
    ev.del().unwrap();

    thread::sleep(Duration::from_millis(5));
    assert_eq!(reactor.dispatch().unwrap(), Exit::Empty);
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn gettimeofday_cached_tracks_wall_clock() {
    init();
    let reactor = Reactor::new().unwrap();
    let cached = reactor.gettimeofday_cached();
    let now = SystemTime::now();
    let drift = match now.duration_since(cached) {
        Ok(d) => d,
        Err(err) => err.duration(),
    };
    assert!(drift < Duration::from_secs(5), "drift {:?}", drift);
}

#[test]
fn dump_events_lists_registrations() {
    init();
    let reactor = Reactor::new().unwrap();
    let ev = Event::new(&reactor, -1, Ready::EMPTY, |_, _| {}).unwrap();
    ev.add(Some(evio::Timeout::After(Duration::from_secs(60))))
        .unwrap();

    let mut out = Vec::new();
    reactor.dump_events(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("Inserted events:"));
    assert!(text.contains("Active events:"));
}
