use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use evio::{Event, Reactor, Ready};

mod util;

use util::init;

// One test drives the whole signal bridge; separate #[test] functions
// would race over the process-wide handler table.
#[test]
fn signal_delivery_and_ownership() {
    init();
    let reactor = Reactor::new().unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = Arc::clone(&hits);
    let ev = Event::new(
        &reactor,
        libc::SIGUSR1,
        Ready::SIGNAL | Ready::PERSIST,
        move |signum, what| {
            assert_eq!(signum, libc::SIGUSR1);
            assert!(what.is_signal());
            hits2.fetch_add(1, Ordering::SeqCst);
        },
    )
    .unwrap();
    ev.add(None).unwrap();

    // A second reactor cannot take over signal dispatch.
    {
        let other = Reactor::new().unwrap();
        let stray = Event::new(&other, libc::SIGUSR2, Ready::SIGNAL, |_, _| {}).unwrap();
        assert!(stray.add(None).is_err());
    }

    let r2 = reactor.clone();
    let raiser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        unsafe {
            libc::raise(libc::SIGUSR1);
        }
        thread::sleep(Duration::from_millis(100));
        r2.loop_exit(None).unwrap();
    });

    reactor.dispatch().unwrap();
    raiser.join().unwrap();

    assert!(hits.load(Ordering::SeqCst) >= 1);

    // Removing the last event restores the previous disposition.
    ev.del().unwrap();
    drop(ev);
    drop(reactor);
}
