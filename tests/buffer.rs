use std::fs;
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use evio::{Buffer, EolStyle, PtrHow};

mod util;

use util::{assert_send, assert_sync, init};

fn contents(buf: &Buffer) -> Vec<u8> {
    let mut out = vec![0u8; buf.len()];
    buf.copyout(&mut out).unwrap();
    out
}

#[test]
fn is_send_and_sync() {
    assert_send::<Buffer>();
    assert_sync::<Buffer>();
}

#[test]
fn add_fmt_appends_text() {
    init();
    let buf = Buffer::new();
    let n = buf.add_fmt(format_args!("{}-{}", "left", 7)).unwrap();
    assert_eq!(n, 6);
    assert_eq!(contents(&buf), b"left-7");
}

#[test]
fn contiguous_space_is_first_segment_only() {
    init();
    let buf = Buffer::new();
    buf.add(b"0123456789").unwrap();
    assert_eq!(buf.contiguous_space(), 10);
    buf.prepend(b"abc").unwrap();
    // The prepend landed in a fresh head segment.
    assert_eq!(buf.contiguous_space(), 3);
}

#[test]
fn write_then_read_over_socketpair() {
    init();
    let (a, mut b) = UnixStream::pair().unwrap();

    let out = Buffer::new();
    out.add(b"payload over the wire").unwrap();
    let n = out.write(a.as_raw_fd()).unwrap();
    assert_eq!(n, 21);
    assert!(out.is_empty());

    let mut got = vec![0u8; n];
    b.read_exact(&mut got).unwrap();
    assert_eq!(got, b"payload over the wire");

    // And back: a buffer fills itself from the descriptor.
    b.write_all(b"reply").unwrap();
    let input = Buffer::new();
    let n = input.read(a.as_raw_fd(), None).unwrap();
    assert_eq!(n, 5);
    assert_eq!(contents(&input), b"reply");
}

#[test]
fn read_gathers_across_reserved_segments() {
    init();
    let (a, mut b) = UnixStream::pair().unwrap();
    let blob: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    b.write_all(&blob).unwrap();

    let input = Buffer::new();
    let mut total = 0;
    while total < blob.len() {
        total += input.read(a.as_raw_fd(), None).unwrap();
    }
    assert_eq!(contents(&input), blob);
}

#[test]
fn add_reference_runs_cleanup() {
    init();
    static PAYLOAD: &[u8] = b"external bytes";
    let cleaned = Arc::new(AtomicBool::new(false));
    let cleaned2 = Arc::clone(&cleaned);

    let buf = Buffer::new();
    unsafe {
        buf.add_reference(
            PAYLOAD.as_ptr(),
            PAYLOAD.len(),
            Some(Box::new(move |ptr, len| {
                assert_eq!(ptr, PAYLOAD.as_ptr());
                assert_eq!(len, PAYLOAD.len());
                cleaned2.store(true, Ordering::SeqCst);
            })),
        )
        .unwrap();
    }
    assert_eq!(contents(&buf), PAYLOAD);
    assert!(!cleaned.load(Ordering::SeqCst));

    buf.drain(buf.len()).unwrap();
    assert!(cleaned.load(Ordering::SeqCst));
}

fn temp_file(name: &str, content: &[u8]) -> std::path::PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("evio-test-{}-{}", std::process::id(), name));
    fs::write(&path, content).unwrap();
    path
}

fn open_readonly(path: &std::path::Path) -> i32 {
    use std::os::unix::ffi::OsStrExt;
    let cstr = std::ffi::CString::new(path.as_os_str().as_bytes()).unwrap();
    let fd = unsafe { libc::open(cstr.as_ptr(), libc::O_RDONLY) };
    assert!(fd >= 0);
    fd
}

#[test]
fn add_file_maps_a_region() {
    init();
    let path = temp_file("mmap", b"0123456789abcdef");
    let fd = open_readonly(&path);

    let buf = Buffer::new();
    buf.add_file(fd, 4, 8).unwrap();
    assert_eq!(buf.len(), 8);
    assert_eq!(contents(&buf), b"456789ab");

    drop(buf);
    fs::remove_file(path).unwrap();
}

#[test]
fn add_file_sendfile_drains_to_socket() {
    init();
    let path = temp_file("sendfile", b"sendfile body here");
    let fd = open_readonly(&path);

    let out = Buffer::new();
    out.set_drains_to_fd(true);
    out.add_file(fd, 9, 4).unwrap();
    assert_eq!(out.len(), 4);

    let (a, mut b) = UnixStream::pair().unwrap();
    let mut written = 0;
    while written < 4 {
        written += out.write(a.as_raw_fd()).unwrap();
    }
    assert!(out.is_empty());

    let mut got = [0u8; 4];
    b.read_exact(&mut got).unwrap();
    assert_eq!(&got, b"body");

    fs::remove_file(path).unwrap();
}

#[test]
fn search_spans_spliced_buffers() {
    init();
    let a = Buffer::new();
    let b = Buffer::new();
    a.add(b"the quick brown ").unwrap();
    b.add(b"fox jumps").unwrap();
    a.add_buffer(&b).unwrap();

    let hit = a.search(b"brown fox", None);
    assert_eq!(hit.pos(), 10);

    let mut ptr = hit;
    a.ptr_set(&mut ptr, 6, PtrHow::Add).unwrap();
    assert_eq!(ptr.pos(), 16);
    let hit2 = a.search(b"fox", Some(&ptr));
    assert_eq!(hit2.pos(), 16);
}

#[test]
fn readln_after_transfer() {
    init();
    let upstream = Buffer::new();
    upstream.add(b"GET / HTTP/1.0\r\nHost: x\r\n\r\n").unwrap();

    let parsed = Buffer::new();
    parsed.add_buffer(&upstream).unwrap();
    assert_eq!(
        parsed.readln(EolStyle::CrlfStrict).unwrap().as_deref(),
        Some(&b"GET / HTTP/1.0"[..])
    );
    assert_eq!(
        parsed.readln(EolStyle::CrlfStrict).unwrap().as_deref(),
        Some(&b"Host: x"[..])
    );
    assert_eq!(
        parsed.readln(EolStyle::CrlfStrict).unwrap().as_deref(),
        Some(&b""[..])
    );
    assert_eq!(parsed.readln(EolStyle::CrlfStrict).unwrap(), None);
}

#[test]
fn randomized_against_model() {
    init();
    let mut rng = StdRng::seed_from_u64(0x00e1_10);
    let buf = Buffer::new();
    let mut model: Vec<u8> = Vec::new();

    for _ in 0..2000 {
        match rng.random_range(0..4u32) {
            0 => {
                let n = rng.random_range(1..700usize);
                let bytes: Vec<u8> = (0..n).map(|_| rng.random()).collect();
                buf.add(&bytes).unwrap();
                model.extend_from_slice(&bytes);
            }
            1 => {
                let n = rng.random_range(1..100usize);
                let bytes: Vec<u8> = (0..n).map(|_| rng.random()).collect();
                buf.prepend(&bytes).unwrap();
                let mut next = bytes;
                next.extend_from_slice(&model);
                model = next;
            }
            2 => {
                let n = rng.random_range(0..900usize);
                buf.drain(n).unwrap();
                let n = n.min(model.len());
                model.drain(..n);
            }
            _ => {
                assert_eq!(buf.len(), model.len());
                assert_eq!(contents(&buf), model);
            }
        }
    }
    assert_eq!(contents(&buf), model);
}
