use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use evio::{Event, Reactor, Ready, Timeout};

mod util;

use util::init;

#[test]
fn timers_fire_in_deadline_order() {
    init();
    let reactor = Reactor::new().unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    for ms in [50u64, 10, 30] {
        let order2 = Arc::clone(&order);
        reactor
            .once(-1, Ready::EMPTY, Some(Duration::from_millis(ms)), move |_, what| {
                assert!(what.is_timeout());
                order2.lock().unwrap().push(ms);
            })
            .unwrap();
    }

    reactor.dispatch().unwrap();
    assert_eq!(order.lock().unwrap().as_slice(), &[10, 30, 50]);
}

#[test]
fn timer_is_not_early() {
    init();
    let reactor = Reactor::new().unwrap();
    let start = Instant::now();
    reactor
        .once(-1, Ready::EMPTY, Some(Duration::from_millis(40)), |_, _| {})
        .unwrap();
    reactor.dispatch().unwrap();
    assert!(start.elapsed() >= Duration::from_millis(40));
}

#[test]
fn persistent_timer_rearms() {
    init();
    let reactor = Reactor::new().unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let count2 = Arc::clone(&count);
    let r2 = reactor.clone();
    let ev = Event::new(&reactor, -1, Ready::PERSIST, move |_, what| {
        assert!(what.is_timeout());
        if count2.fetch_add(1, Ordering::SeqCst) + 1 == 5 {
            r2.loop_break().unwrap();
        }
    })
    .unwrap();
    ev.add(Some(Timeout::After(Duration::from_millis(2))))
        .unwrap();

    reactor.dispatch().unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 5);
    ev.del().unwrap();
}

#[test]
fn common_timeout_fires_in_insertion_order() {
    init();
    const N: usize = 500;

    let reactor = Reactor::new().unwrap();
    let common = reactor
        .init_common_timeout(Duration::from_millis(50))
        .unwrap();
    assert_eq!(common.duration(), Duration::from_millis(50));

    // Asking again for the same duration reuses the class.
    let again = reactor
        .init_common_timeout(Duration::from_millis(50))
        .unwrap();
    assert_eq!(common, again);

    let hits = Arc::new(Mutex::new(Vec::with_capacity(N)));
    let mut events = Vec::with_capacity(N);
    for i in 0..N {
        let hits2 = Arc::clone(&hits);
        let ev = Event::new(&reactor, -1, Ready::EMPTY, move |_, what| {
            assert!(what.is_timeout());
            hits2.lock().unwrap().push(i);
        })
        .unwrap();
        ev.add(Some(Timeout::Common(common))).unwrap();
        events.push(ev);
    }

    reactor.dispatch().unwrap();

    let hits = hits.lock().unwrap();
    assert_eq!(hits.len(), N);
    assert!(
        hits.windows(2).all(|pair| pair[0] < pair[1]),
        "expirations out of insertion order"
    );
}

#[test]
fn common_timeout_rejected_on_other_reactor() {
    init();
    let a = Reactor::new().unwrap();
    let b = Reactor::new().unwrap();
    let common = a.init_common_timeout(Duration::from_millis(75)).unwrap();

    let ev = Event::new(&b, -1, Ready::EMPTY, |_, _| {}).unwrap();
    assert!(ev.add(Some(Timeout::Common(common))).is_err());
}

#[test]
fn readd_reschedules_instead_of_duplicating() {
    init();
    let reactor = Reactor::new().unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let count2 = Arc::clone(&count);
    let ev = Event::new(&reactor, -1, Ready::EMPTY, move |_, _| {
        count2.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    ev.add(Some(Timeout::After(Duration::from_millis(30))))
        .unwrap();
    // Move it earlier; only one firing may result.
    ev.add(Some(Timeout::After(Duration::from_millis(5))))
        .unwrap();

    let start = Instant::now();
    reactor.dispatch().unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(start.elapsed() < Duration::from_millis(30));
}

#[test]
fn persistent_timer_keeps_phase() {
    init();
    let reactor = Reactor::new().unwrap();
    let stamps = Arc::new(Mutex::new(Vec::new()));
    let stamps2 = Arc::clone(&stamps);
    let r2 = reactor.clone();
    let ev = Event::new(&reactor, -1, Ready::PERSIST, move |_, _| {
        let mut stamps = stamps2.lock().unwrap();
        stamps.push(Instant::now());
        if stamps.len() == 4 {
            r2.loop_break().unwrap();
        }
    })
    .unwrap();
    ev.add(Some(Timeout::After(Duration::from_millis(20))))
        .unwrap();

    reactor.dispatch().unwrap();
    ev.del().unwrap();

    // Successive periods should not drift upward: each gap stays close
    // to the programmed period even though callbacks take time.
    let stamps = stamps.lock().unwrap();
    for pair in stamps.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(gap >= Duration::from_millis(10), "gap {:?}", gap);
        assert!(gap <= Duration::from_millis(100), "gap {:?}", gap);
    }
}
